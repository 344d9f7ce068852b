//! Engine configuration.
//!
//! All tunables in one place with environment variable overrides.
//! Sensible defaults, configurable in production.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use tracing::info;

fn env_parse<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(value) = env::var(name) {
        if let Ok(parsed) = value.parse() {
            *target = parsed;
        }
    }
}

fn env_bool(name: &str, target: &mut bool) {
    if let Ok(value) = env::var(name) {
        let value = value.to_lowercase();
        *target = value == "1" || value == "true" || value == "yes";
    }
}

/// Where the durable file lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory containing the durable file and logs (default: ./data)
    pub data_dir: PathBuf,

    /// Filename within `data_dir` (default: memory.db)
    pub sqlite_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            sqlite_file: "memory.db".to_string(),
        }
    }
}

impl StorageConfig {
    /// Full path of the durable store file.
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join(&self.sqlite_file)
    }
}

/// Embedding provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// `local` (in-process ONNX model) or `none` (zero vectors)
    pub provider: String,

    /// Model identifier (informational; the local provider loads from
    /// `model_path`)
    pub model: String,

    /// Fixed output dimension
    pub dimensions: usize,

    /// Directory holding `model.onnx` and `tokenizer.json` for the local
    /// provider. Defaults to ./models/minilm-l6.
    pub model_path: Option<PathBuf>,

    /// ONNX intra-op threads
    pub onnx_threads: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            model: "Xenova/all-MiniLM-L6-v2".to_string(),
            dimensions: 384,
            model_path: None,
            onnx_threads: 2,
        }
    }
}

impl EmbeddingConfig {
    /// Directory the local provider loads model files from.
    pub fn model_dir(&self) -> PathBuf {
        self.model_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("./models/minilm-l6"))
    }
}

/// Token budgets for the tier hierarchy and retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBudgets {
    /// Soft ceiling on working memory before overflow
    pub tier0_working: usize,

    /// Truncation target for Tier-1 writes
    pub tier1_session: usize,

    /// Truncation target for Tier-2 writes
    pub tier2_epoch: usize,

    /// Cap on Tier-3 core memory included by the assembler
    pub tier3_core: usize,

    /// Fallback retrieve budget when the caller names none
    pub default_retrieve_budget: usize,
}

impl Default for TokenBudgets {
    fn default() -> Self {
        Self {
            tier0_working: 2000,
            tier1_session: 500,
            tier2_epoch: 300,
            tier3_core: 200,
            default_retrieve_budget: 3000,
        }
    }
}

/// Compression triggers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Working-memory token total that triggers auto-compression
    pub tier0_overflow_threshold: usize,

    /// Minimum Tier-1 summaries required for an epoch consolidation
    pub tier1_consolidation_count: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            tier0_overflow_threshold: 2500,
            tier1_consolidation_count: 10,
        }
    }
}

/// Composite scoring weights and deduplication threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingConfig {
    pub semantic_weight: f32,
    pub recency_weight: f32,
    pub priority_weight: f32,
    pub frequency_weight: f32,

    /// Jaccard similarity at or above which two candidates are the same
    pub dedup_similarity_threshold: f32,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            semantic_weight: 0.4,
            recency_weight: 0.3,
            priority_weight: 0.2,
            frequency_weight: 0.1,
            dedup_similarity_threshold: 0.85,
        }
    }
}

/// Session lifecycle options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Implicit `session_start` at startup
    pub auto_start_on_boot: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_start_on_boot: true,
        }
    }
}

/// Retrieval mode selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// true = cross-session retrieval over six sources; false = strict
    /// current-session isolation
    pub cross_session: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            cross_session: true,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub token_budgets: TokenBudgets,
    pub compression: CompressionConfig,
    pub ranking: RankingConfig,
    pub session: SessionConfig,
    pub retrieval: RetrievalConfig,
}

impl EngineConfig {
    /// Load configuration from environment variables over defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(value) = env::var("LATENT_DATA_DIR") {
            config.storage.data_dir = PathBuf::from(value);
        }
        if let Ok(value) = env::var("LATENT_SQLITE_FILE") {
            config.storage.sqlite_file = value;
        }

        if let Ok(value) = env::var("LATENT_EMBEDDING_PROVIDER") {
            config.embedding.provider = value;
        }
        if let Ok(value) = env::var("LATENT_EMBEDDING_MODEL") {
            config.embedding.model = value;
        }
        env_parse("LATENT_EMBEDDING_DIMENSIONS", &mut config.embedding.dimensions);
        if let Ok(value) = env::var("LATENT_MODEL_DIR") {
            config.embedding.model_path = Some(PathBuf::from(value));
        }
        env_parse("LATENT_ONNX_THREADS", &mut config.embedding.onnx_threads);

        env_parse("LATENT_TIER0_WORKING", &mut config.token_budgets.tier0_working);
        env_parse("LATENT_TIER1_SESSION", &mut config.token_budgets.tier1_session);
        env_parse("LATENT_TIER2_EPOCH", &mut config.token_budgets.tier2_epoch);
        env_parse("LATENT_TIER3_CORE", &mut config.token_budgets.tier3_core);
        env_parse(
            "LATENT_DEFAULT_RETRIEVE_BUDGET",
            &mut config.token_budgets.default_retrieve_budget,
        );

        env_parse(
            "LATENT_TIER0_OVERFLOW_THRESHOLD",
            &mut config.compression.tier0_overflow_threshold,
        );
        env_parse(
            "LATENT_TIER1_CONSOLIDATION_COUNT",
            &mut config.compression.tier1_consolidation_count,
        );

        env_parse("LATENT_SEMANTIC_WEIGHT", &mut config.ranking.semantic_weight);
        env_parse("LATENT_RECENCY_WEIGHT", &mut config.ranking.recency_weight);
        env_parse("LATENT_PRIORITY_WEIGHT", &mut config.ranking.priority_weight);
        env_parse("LATENT_FREQUENCY_WEIGHT", &mut config.ranking.frequency_weight);
        env_parse(
            "LATENT_DEDUP_THRESHOLD",
            &mut config.ranking.dedup_similarity_threshold,
        );

        env_bool("LATENT_AUTO_START_SESSION", &mut config.session.auto_start_on_boot);
        env_bool("LATENT_CROSS_SESSION", &mut config.retrieval.cross_session);

        config
    }

    /// Log the effective configuration.
    pub fn log(&self) {
        info!("Configuration:");
        info!("   Data dir:   {}", self.storage.data_dir.display());
        info!("   Store file: {}", self.storage.sqlite_file);
        info!(
            "   Embeddings: {} ({}d, model {})",
            self.embedding.provider, self.embedding.dimensions, self.embedding.model
        );
        info!(
            "   Budgets:    T0={} T1={} T2={} T3={} retrieve={}",
            self.token_budgets.tier0_working,
            self.token_budgets.tier1_session,
            self.token_budgets.tier2_epoch,
            self.token_budgets.tier3_core,
            self.token_budgets.default_retrieve_budget
        );
        info!(
            "   Weights:    sem={} rec={} pri={} freq={} (dedup≥{})",
            self.ranking.semantic_weight,
            self.ranking.recency_weight,
            self.ranking.priority_weight,
            self.ranking.frequency_weight,
            self.ranking.dedup_similarity_threshold
        );
        info!(
            "   Retrieval:  {}",
            if self.retrieval.cross_session {
                "cross-session"
            } else {
                "session-isolated"
            }
        );
    }
}
