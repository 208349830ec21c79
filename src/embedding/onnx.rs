//! ONNX Runtime backend with a HuggingFace tokenizer.

use super::{TokenEncoder, TokenStates};
use crate::error::{EmbeddingError, Result};
use ort::session::Session;
use ort::value::Tensor;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokenizers::{Tokenizer, TruncationParams};

const MODEL_ONNX_SUBDIR: &str = "onnx/model.onnx";
const MODEL_ONNX_LEGACY: &str = "model.onnx";
const TOKENIZER_JSON: &str = "tokenizer.json";
const HIDDEN_STATE_OUTPUT: &str = "last_hidden_state";

/// Transformer session plus tokenizer. `Session::run` needs exclusive
/// access, so the session sits behind a mutex.
pub struct OnnxBackend {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    max_length: usize,
    dimension: usize,
    wants_token_type_ids: bool,
    output_name: String,
}

impl OnnxBackend {
    /// Load `tokenizer.json` and `onnx/model.onnx` (or `model.onnx`) from
    /// `model_dir`, then run a one-token probe to learn the output width.
    pub fn load(model_dir: &Path, max_length: usize, intra_threads: usize) -> Result<Self> {
        let model_file = select_model_file(model_dir).ok_or_else(|| EmbeddingError::ModelLoad {
            path: model_dir.to_path_buf(),
            reason: format!("missing {MODEL_ONNX_SUBDIR} or {MODEL_ONNX_LEGACY}"),
        })?;

        let tokenizer_path = model_dir.join(TOKENIZER_JSON);
        let mut tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|e| EmbeddingError::ModelLoad {
            path: tokenizer_path.clone(),
            reason: format!("tokenizer load failed: {e}"),
        })?;
        let max_length = max_length.max(1);
        truncate_to(&mut tokenizer, max_length).map_err(|e| EmbeddingError::ModelLoad {
            path: tokenizer_path.clone(),
            reason: e.to_string(),
        })?;

        let session = Session::builder()
            .and_then(|b| {
                b.with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)
            })
            .and_then(|b| b.with_intra_threads(intra_threads.max(1)))
            .and_then(|b| b.commit_from_file(&model_file))
            .map_err(|e| EmbeddingError::ModelLoad {
                path: model_file.clone(),
                reason: format!("session creation failed: {e}"),
            })?;

        let wants_token_type_ids = session
            .inputs
            .iter()
            .any(|input| input.name == "token_type_ids");
        let output_name = session
            .outputs
            .iter()
            .find(|output| output.name == HIDDEN_STATE_OUTPUT)
            .or_else(|| session.outputs.first())
            .map(|output| output.name.clone())
            .ok_or_else(|| EmbeddingError::ModelLoad {
                path: model_file.clone(),
                reason: "model declares no outputs".into(),
            })?;

        let mut backend = Self {
            session: Mutex::new(session),
            tokenizer,
            max_length,
            dimension: 0,
            wants_token_type_ids,
            output_name,
        };

        let probe = backend.forward(&["probe".to_string()])?;
        backend.dimension = probe.dimension;

        tracing::debug!(
            model = %model_file.display(),
            dimension = backend.dimension,
            max_length = backend.max_length,
            output = %backend.output_name,
            "onnx session ready"
        );

        Ok(backend)
    }

    fn tokenize(&self, texts: &[String]) -> Result<Vec<(Vec<i64>, Vec<i64>, Vec<i64>)>> {
        encode_inputs(&self.tokenizer, texts)
    }
}

impl TokenEncoder for OnnxBackend {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn forward(&self, texts: &[String]) -> Result<TokenStates> {
        let tokenized = self.tokenize(texts)?;
        let batch = tokenized.len();
        let seq_len = tokenized.iter().map(|(ids, _, _)| ids.len()).max().unwrap_or(0);
        if seq_len == 0 {
            return Err(EmbeddingError::Tokenization("tokenizer produced no tokens".into()).into());
        }

        // Pad to the longest sequence; padding positions keep mask 0.
        let mut flat_ids = vec![0_i64; batch * seq_len];
        let mut flat_mask = vec![0_i64; batch * seq_len];
        let mut flat_types = vec![0_i64; batch * seq_len];
        for (i, (ids, mask, types)) in tokenized.iter().enumerate() {
            let offset = i * seq_len;
            flat_ids[offset..offset + ids.len()].copy_from_slice(ids);
            flat_mask[offset..offset + mask.len()].copy_from_slice(mask);
            flat_types[offset..offset + types.len()].copy_from_slice(types);
        }

        let shape = vec![batch as i64, seq_len as i64];
        let mut inputs = vec![
            ("input_ids", tensor(&shape, flat_ids)?),
            ("attention_mask", tensor(&shape, flat_mask.clone())?),
        ];
        if self.wants_token_type_ids {
            inputs.push(("token_type_ids", tensor(&shape, flat_types)?));
        }

        let mut session = self
            .session
            .lock()
            .map_err(|e| EmbeddingError::Inference(format!("session lock poisoned: {e}")))?;
        let outputs = session
            .run(inputs)
            .map_err(|e| EmbeddingError::Inference(e.to_string()))?;

        let output = outputs.get(self.output_name.as_str()).ok_or_else(|| {
            EmbeddingError::Inference(format!("missing output tensor '{}'", self.output_name))
        })?;
        let (out_shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbeddingError::Inference(format!("tensor extraction failed: {e}")))?;

        if out_shape.len() != 3
            || out_shape[0] as usize != batch
            || out_shape[1] as usize != seq_len
        {
            return Err(EmbeddingError::Inference(format!(
                "unexpected hidden state shape {:?} for batch {batch} x {seq_len}",
                &out_shape[..]
            ))
            .into());
        }

        Ok(TokenStates {
            batch,
            seq_len,
            dimension: out_shape[2] as usize,
            hidden: data.to_vec(),
            mask: flat_mask,
        })
    }
}

/// Cap sequences at `max_length` tokens, special tokens included, so the
/// tokenizer trims content and keeps the closing `[SEP]` / `</s>`.
fn truncate_to(tokenizer: &mut Tokenizer, max_length: usize) -> Result<()> {
    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length,
            ..TruncationParams::default()
        }))
        .map_err(|e| EmbeddingError::Tokenization(format!("invalid truncation for {max_length} tokens: {e}")))?;
    Ok(())
}

fn encode_inputs(tokenizer: &Tokenizer, texts: &[String]) -> Result<Vec<(Vec<i64>, Vec<i64>, Vec<i64>)>> {
    let encodings = tokenizer
        .encode_batch(texts.to_vec(), true)
        .map_err(|e| EmbeddingError::Tokenization(e.to_string()))?;

    let widen = |values: &[u32]| values.iter().map(|&v| i64::from(v)).collect::<Vec<_>>();
    Ok(encodings
        .iter()
        .map(|encoding| {
            (
                widen(encoding.get_ids()),
                widen(encoding.get_attention_mask()),
                widen(encoding.get_type_ids()),
            )
        })
        .collect())
}

fn tensor(shape: &[i64], data: Vec<i64>) -> Result<Tensor<i64>> {
    Tensor::from_array((shape.to_vec(), data))
        .map_err(|e| EmbeddingError::Inference(format!("tensor creation error: {e}")).into())
}

fn select_model_file(model_dir: &Path) -> Option<PathBuf> {
    [MODEL_ONNX_SUBDIR, MODEL_ONNX_LEGACY]
        .iter()
        .map(|name| model_dir.join(name))
        .find(|path| path.is_file())
}
