//! MiniLM-L6-v2 embedding provider using ONNX Runtime.
//!
//! Generates 384-dimensional sentence embeddings via mean pooling over the
//! token embeddings, L2-normalized.
//!
//! The model is loaded lazily on the first `embed` call; concurrent first
//! callers share a single initialization. Initialization failure is latched:
//! once loading has failed, every subsequent call returns the zero vector
//! without retrying, and the error stays available through `init_error`.

use anyhow::{Context, Result};
use ort::session::Session;
use ort::value::Value;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tokenizers::Tokenizer;

use super::Embedder;
use crate::config::EmbeddingConfig;

/// Maximum input sequence length for MiniLM-L6-v2.
const MAX_SEQUENCE_LENGTH: usize = 256;

/// Lazily initialized ONNX session and tokenizer.
struct LazyModel {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
}

impl LazyModel {
    fn load(model_path: &PathBuf, tokenizer_path: &PathBuf, threads: usize) -> Result<Self> {
        tracing::info!(
            "Loading embedding model from {:?} with {} threads",
            model_path,
            threads
        );

        let session = Session::builder()
            .context("Failed to create session builder")?
            .with_intra_threads(threads)
            .context("Failed to set thread count")?
            .commit_from_file(model_path)
            .context("Failed to load ONNX model")?;

        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {e}"))?;

        tracing::info!("Embedding model loaded");

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
        })
    }
}

/// MiniLM-L6-v2 embedder with lazy, latched initialization.
pub struct MiniLmEmbedder {
    model_path: PathBuf,
    tokenizer_path: PathBuf,
    threads: usize,
    dimension: usize,
    lazy_model: OnceLock<std::result::Result<Arc<LazyModel>, String>>,
}

impl MiniLmEmbedder {
    /// Create an embedder for the configured model directory.
    ///
    /// Nothing is loaded here; the first `embed` call pays the load cost.
    pub fn new(config: EmbeddingConfig) -> Self {
        let base = config.model_dir();
        Self {
            model_path: base.join("model.onnx"),
            tokenizer_path: base.join("tokenizer.json"),
            threads: config.onnx_threads,
            dimension: config.dimensions,
            lazy_model: OnceLock::new(),
        }
    }

    /// Model handle, loading on first use. The `Err` branch is latched.
    fn model(&self) -> std::result::Result<&Arc<LazyModel>, &String> {
        self.lazy_model
            .get_or_init(|| {
                LazyModel::load(&self.model_path, &self.tokenizer_path, self.threads)
                    .map(Arc::new)
                    .map_err(|e| {
                        tracing::warn!(
                            "Embedding model unavailable, degrading to zero vectors: {e:#}"
                        );
                        format!("{e:#}")
                    })
            })
            .as_ref()
    }

    fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let model = self
            .model()
            .map_err(|e| anyhow::anyhow!("embedder init failed: {e}"))?;

        let encoding = model
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {e}"))?;

        let tokens = encoding.get_ids();
        let mask = encoding.get_attention_mask();

        // Pad or truncate to the fixed sequence length
        let mut input_ids = vec![0i64; MAX_SEQUENCE_LENGTH];
        let mut attention = vec![0i64; MAX_SEQUENCE_LENGTH];
        let token_type_ids = vec![0i64; MAX_SEQUENCE_LENGTH];

        for (i, &token) in tokens.iter().take(MAX_SEQUENCE_LENGTH).enumerate() {
            input_ids[i] = token as i64;
        }
        for (i, &m) in mask.iter().take(MAX_SEQUENCE_LENGTH).enumerate() {
            attention[i] = m as i64;
        }

        let input_ids_value = Value::from_array((vec![1, MAX_SEQUENCE_LENGTH], input_ids))?;
        let attention_value = Value::from_array((vec![1, MAX_SEQUENCE_LENGTH], attention.clone()))?;
        let token_type_value = Value::from_array((vec![1, MAX_SEQUENCE_LENGTH], token_type_ids))?;

        let mut session = model.session.lock();
        let outputs = session.run(ort::inputs![
            "input_ids" => &input_ids_value,
            "attention_mask" => &attention_value,
            "token_type_ids" => &token_type_value,
        ])?;

        let (_shape, output_data) = outputs[0].try_extract_tensor::<f32>()?;

        // Mean pooling over the attended positions
        let mut pooled = vec![0.0f32; self.dimension];
        let mut mask_sum = 0.0f32;
        for (seq_idx, &att) in attention.iter().enumerate() {
            if att == 1 {
                for (dim_idx, value) in pooled.iter_mut().enumerate() {
                    *value += output_data[seq_idx * self.dimension + dim_idx];
                }
                mask_sum += 1.0;
            }
        }
        if mask_sum > 0.0 {
            for value in &mut pooled {
                *value /= mask_sum;
            }
        }

        // L2 normalize; an all-zero pooled output stays zero
        let norm: f32 = pooled.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON && norm.is_finite() {
            for value in &mut pooled {
                *value /= norm;
            }
        }

        Ok(pooled)
    }
}

impl Embedder for MiniLmEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        match self.encode(text) {
            Ok(vector) => vector,
            Err(e) => {
                tracing::debug!("Embedding failed, returning zero vector: {e:#}");
                vec![0.0; self.dimension]
            }
        }
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn init_error(&self) -> Option<String> {
        match self.lazy_model.get() {
            Some(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn missing_model_embedder() -> MiniLmEmbedder {
        let mut config = EmbeddingConfig::default();
        config.model_path = Some(PathBuf::from("/nonexistent/model/dir"));
        MiniLmEmbedder::new(config)
    }

    #[test]
    fn missing_model_degrades_to_zero_vector() {
        let embedder = missing_model_embedder();
        let v = embedder.embed("some text");
        assert_eq!(v.len(), 384);
        assert!(v.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn init_failure_is_latched() {
        let embedder = missing_model_embedder();
        assert!(embedder.init_error().is_none(), "no error before first call");
        let _ = embedder.embed("first call triggers init");
        assert!(embedder.init_error().is_some(), "error latched after failure");
        // Second call must not panic and must stay degraded
        let v = embedder.embed("second call");
        assert!(v.iter().all(|&x| x == 0.0));
    }
}
