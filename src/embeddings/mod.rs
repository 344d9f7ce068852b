//! Embedding generation for semantic retrieval.
//!
//! Two providers:
//! - `local`: MiniLM-L6-v2 over ONNX Runtime, 384-dimensional sentence
//!   embeddings loaded lazily on first use.
//! - `none`: always returns zero vectors (semantic scoring disabled).
//!
//! The contract is deliberately infallible: a provider that cannot produce an
//! embedding returns the zero vector of its dimension. Cosine similarity
//! against a zero vector is zero, so downstream ranking degrades gracefully
//! without branching on errors.

pub mod minilm;

use std::sync::Arc;

use crate::config::EmbeddingConfig;

/// Trait for embedding generation.
pub trait Embedder: Send + Sync {
    /// Embed one text. Returns an L2-normalized vector of `dimension()`
    /// floats, or the zero vector when embedding is unavailable.
    fn embed(&self, text: &str) -> Vec<f32>;

    /// Embedding dimension.
    fn dimension(&self) -> usize;

    /// Batch embed. Default: per-text embed.
    fn embed_batch(&self, texts: &[&str]) -> Vec<Vec<f32>> {
        texts.iter().map(|text| self.embed(text)).collect()
    }

    /// Latched initialization error, if the provider failed to come up.
    fn init_error(&self) -> Option<String> {
        None
    }
}

/// Provider that never embeds: every call yields the zero vector.
pub struct NullEmbedder {
    dimension: usize,
}

impl NullEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Embedder for NullEmbedder {
    fn embed(&self, _text: &str) -> Vec<f32> {
        vec![0.0; self.dimension]
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Build the configured embedding provider.
///
/// An unknown provider name falls back to `none` with a warning rather than
/// failing boot; embeddings are a best-effort signal.
pub fn build_embedder(config: &EmbeddingConfig) -> Arc<dyn Embedder> {
    match config.provider.as_str() {
        "local" => Arc::new(minilm::MiniLmEmbedder::new(config.clone())),
        "none" => Arc::new(NullEmbedder::new(config.dimensions)),
        other => {
            tracing::warn!("Unknown embedding provider '{other}', using 'none'");
            Arc::new(NullEmbedder::new(config.dimensions))
        }
    }
}

/// Cosine similarity between two vectors.
///
/// Returns 0.0 when the dimensions differ or either norm is zero.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}
