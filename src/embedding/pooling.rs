//! Mask-aware mean pooling and L2 normalization.

use crate::error::{EmbeddingError, Result};

/// Average the hidden rows whose mask entry is non-zero.
///
/// `hidden` is `[seq][dimension]` flattened. Masked-out rows contribute
/// nothing; a sequence with no unmasked rows is an error.
pub fn mean_pool(hidden: &[f32], mask: &[i64], dimension: usize) -> Result<Vec<f32>> {
    if hidden.len() != mask.len() * dimension {
        return Err(EmbeddingError::Inference(format!(
            "hidden state has {} values for {} tokens of width {dimension}",
            hidden.len(),
            mask.len()
        ))
        .into());
    }

    let mut pooled = vec![0.0_f32; dimension];
    let mut count = 0_usize;
    for (row, &keep) in hidden.chunks_exact(dimension.max(1)).zip(mask) {
        if keep == 0 {
            continue;
        }
        count += 1;
        for (acc, value) in pooled.iter_mut().zip(row) {
            *acc += value;
        }
    }

    if count == 0 {
        return Err(
            EmbeddingError::Inference("attention mask has no active tokens".into()).into(),
        );
    }

    let denominator = count as f32;
    for value in &mut pooled {
        *value /= denominator;
    }
    Ok(pooled)
}

/// Scale `vector` to unit length in place. A zero vector cannot be
/// normalized.
pub fn l2_normalize(vector: &mut [f32]) -> Result<()> {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if !norm.is_finite() || norm <= f32::EPSILON {
        return Err(EmbeddingError::Inference(format!(
            "cannot normalize vector with norm {norm}"
        ))
        .into());
    }
    for value in vector.iter_mut() {
        *value /= norm;
    }
    Ok(())
}
