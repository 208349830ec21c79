//! Dense text embeddings for passages and queries.
//!
//! The transformer itself sits behind [`TokenEncoder`], which yields per-token
//! hidden states and the attention mask. [`Encoder`] owns prefixing, batching,
//! mask-aware mean pooling and L2 normalization.

pub mod onnx;
pub mod pooling;

pub use onnx::OnnxBackend;
pub use pooling::{l2_normalize, mean_pool};

use crate::config::EmbeddingConfig;
use crate::error::{EmbeddingError, Result};
use std::sync::Arc;

const PASSAGE_PREFIX: &str = "passage: ";
const QUERY_PREFIX: &str = "query: ";

/// Which side of retrieval a text is on. Passages and queries get distinct
/// prefixes, as the model was trained with them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeRole {
    Passage,
    Query,
}

impl EncodeRole {
    fn prefix(self) -> &'static str {
        match self {
            EncodeRole::Passage => PASSAGE_PREFIX,
            EncodeRole::Query => QUERY_PREFIX,
        }
    }
}

/// Per-token output of one forward pass over a padded batch.
///
/// `hidden` is `[batch][seq_len][dimension]` and `mask` is `[batch][seq_len]`,
/// both flattened row-major.
#[derive(Debug, Clone)]
pub struct TokenStates {
    pub batch: usize,
    pub seq_len: usize,
    pub dimension: usize,
    pub hidden: Vec<f32>,
    pub mask: Vec<i64>,
}

impl TokenStates {
    fn check_shape(&self) -> Result<()> {
        let hidden_len = self.batch * self.seq_len * self.dimension;
        let mask_len = self.batch * self.seq_len;
        if self.hidden.len() != hidden_len || self.mask.len() != mask_len {
            return Err(EmbeddingError::Inference(format!(
                "malformed token states: hidden has {} values (expected {hidden_len}), mask has {} (expected {mask_len})",
                self.hidden.len(),
                self.mask.len()
            ))
            .into());
        }
        Ok(())
    }

    /// Hidden rows and mask of one sequence of the batch.
    fn sequence(&self, index: usize) -> (&[f32], &[i64]) {
        let stride = self.seq_len * self.dimension;
        (
            &self.hidden[index * stride..(index + 1) * stride],
            &self.mask[index * self.seq_len..(index + 1) * self.seq_len],
        )
    }
}

/// A transformer that turns a batch of texts into token-level hidden states.
///
/// Implementations must be deterministic for a given text regardless of what
/// else is in the batch, and must fail rather than return placeholder values.
pub trait TokenEncoder: Send + Sync {
    /// Width of each hidden-state row.
    fn dimension(&self) -> usize;

    /// Tokenize (truncating to the backend's maximum length), pad to the
    /// longest sequence and run the model.
    fn forward(&self, texts: &[String]) -> Result<TokenStates>;
}

/// Produces L2-normalized sentence embeddings.
pub struct Encoder {
    backend: Arc<dyn TokenEncoder>,
    model_id: String,
    batch_size: usize,
}

impl std::fmt::Debug for Encoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encoder")
            .field("model_id", &self.model_id)
            .field("dimension", &self.backend.dimension())
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl Encoder {
    pub fn new(backend: Arc<dyn TokenEncoder>, model_id: impl Into<String>, batch_size: usize) -> Self {
        Self {
            backend,
            model_id: model_id.into(),
            batch_size: batch_size.max(1),
        }
    }

    /// Load the ONNX model described by `config` and verify its output width.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let backend = OnnxBackend::load(&config.model_dir, config.max_length, config.intra_threads)?;
        if backend.dimension() != config.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: config.dimension,
                found: backend.dimension(),
            }
            .into());
        }

        tracing::info!(
            model = %config.model_id,
            dimension = backend.dimension(),
            batch_size = config.batch_size,
            "embedding model loaded"
        );

        Ok(Self::new(Arc::new(backend), config.model_id.clone(), config.batch_size))
    }

    pub fn dimension(&self) -> usize {
        self.backend.dimension()
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Encode texts (blocking). Output order matches input order and every
    /// vector has unit norm.
    pub fn encode(&self, texts: &[String], role: EncodeRole) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());

        for batch in texts.chunks(self.batch_size) {
            let prefixed: Vec<String> = batch
                .iter()
                .map(|text| format!("{}{text}", role.prefix()))
                .collect();

            let states = self.backend.forward(&prefixed)?;
            states.check_shape()?;
            if states.batch != batch.len() {
                return Err(EmbeddingError::Inference(format!(
                    "backend returned {} sequences for a batch of {}",
                    states.batch,
                    batch.len()
                ))
                .into());
            }
            if states.dimension != self.dimension() {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: self.dimension(),
                    found: states.dimension,
                }
                .into());
            }

            for index in 0..states.batch {
                let (hidden, mask) = states.sequence(index);
                let mut pooled = mean_pool(hidden, mask, states.dimension)?;
                l2_normalize(&mut pooled)?;
                vectors.push(pooled);
            }
        }

        Ok(vectors)
    }

    /// Encode texts on the blocking pool.
    pub async fn encode_async(
        self: &Arc<Self>,
        texts: Vec<String>,
        role: EncodeRole,
    ) -> Result<Vec<Vec<f32>>> {
        let encoder = self.clone();
        tokio::task::spawn_blocking(move || encoder.encode(&texts, role))
            .await
            .map_err(|e| EmbeddingError::Task(e.to_string()))?
    }

    /// Encode a single search query on the blocking pool.
    pub async fn encode_query(self: &Arc<Self>, query: &str) -> Result<Vec<f32>> {
        let vectors = self
            .encode_async(vec![query.to_string()], EncodeRole::Query)
            .await?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Inference("no vector returned for query".into()).into())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::{TokenEncoder, TokenStates};
    use crate::error::Result;

    /// Deterministic character-level encoder. Each character becomes one
    /// token whose hidden state depends only on the character and position.
    /// Padding rows are filled with a large sentinel that must never leak
    /// into pooled output.
    pub(crate) struct CharEncoder {
        pub(crate) dimension: usize,
        pub(crate) max_length: usize,
    }

    impl CharEncoder {
        pub(crate) fn new(dimension: usize) -> Self {
            Self {
                dimension,
                max_length: 64,
            }
        }
    }

    impl TokenEncoder for CharEncoder {
        fn dimension(&self) -> usize {
            self.dimension
        }

        fn forward(&self, texts: &[String]) -> Result<TokenStates> {
            let tokens: Vec<Vec<char>> = texts
                .iter()
                .map(|text| text.chars().take(self.max_length).collect())
                .collect();
            let seq_len = tokens.iter().map(Vec::len).max().unwrap_or(0).max(1);

            let mut hidden = Vec::with_capacity(texts.len() * seq_len * self.dimension);
            let mut mask = Vec::with_capacity(texts.len() * seq_len);
            for sequence in &tokens {
                for position in 0..seq_len {
                    match sequence.get(position) {
                        Some(ch) => {
                            for d in 0..self.dimension {
                                let code = (*ch as u32 % 97) as f32;
                                hidden.push(1.0 + code * (d as f32 + 1.0) + position as f32 * 0.01);
                            }
                            mask.push(1);
                        }
                        None => {
                            hidden.extend(std::iter::repeat_n(1.0e6, self.dimension));
                            mask.push(0);
                        }
                    }
                }
            }

            Ok(TokenStates {
                batch: texts.len(),
                seq_len,
                dimension: self.dimension,
                hidden,
                mask,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::CharEncoder;
    use super::{EncodeRole, Encoder};
    use std::sync::Arc;

    fn texts() -> Vec<String> {
        vec![
            "Concert au parc".to_string(),
            "Atelier".to_string(),
            "Exposition de photographies anciennes".to_string(),
            "x".to_string(),
            "Visite guidée du château".to_string(),
        ]
    }

    #[test]
    fn outputs_have_unit_norm() {
        let encoder = Encoder::new(Arc::new(CharEncoder::new(8)), "char", 2);
        let vectors = encoder
            .encode(&texts(), EncodeRole::Passage)
            .expect("encode");

        assert_eq!(vectors.len(), 5);
        for vector in vectors {
            assert_eq!(vector.len(), 8);
            let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5, "norm was {norm}");
        }
    }

    #[test]
    fn batch_size_does_not_change_outputs() {
        let one = Encoder::new(Arc::new(CharEncoder::new(4)), "char", 1);
        let many = Encoder::new(Arc::new(CharEncoder::new(4)), "char", 32);

        let a = one.encode(&texts(), EncodeRole::Passage).expect("encode");
        let b = many.encode(&texts(), EncodeRole::Passage).expect("encode");

        for (left, right) in a.iter().zip(&b) {
            for (x, y) in left.iter().zip(right) {
                assert!((x - y).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn query_and_passage_prefixes_differ() {
        let encoder = Encoder::new(Arc::new(CharEncoder::new(4)), "char", 4);
        let input = vec!["Concert".to_string()];
        let passage = encoder.encode(&input, EncodeRole::Passage).expect("encode");
        let query = encoder.encode(&input, EncodeRole::Query).expect("encode");
        assert_ne!(passage, query);
    }

    #[tokio::test]
    async fn encode_query_runs_on_blocking_pool() {
        let encoder = Arc::new(Encoder::new(Arc::new(CharEncoder::new(4)), "char", 4));
        let vector = encoder.encode_query("jazz").await.expect("encode query");
        assert_eq!(vector.len(), 4);
    }
}
