//! LatentContext Library
//!
//! Per-user memory sidecar for conversational assistants. The host delegates
//! memory through a tool-call interface: it stores compact self-contained
//! notes mid-conversation and retrieves a ranked, deduplicated,
//! token-budgeted digest relevant to the current query.
//!
//! # Core pieces
//! - Tiered store (working → session → epoch → core) with auto-compression
//! - Hybrid retrieval fusing lexical, semantic, graph, recency, priority and
//!   frequency signals
//! - Entity-relation knowledge graph with temporal supersession
//! - Debounced durable SQLite store with schema migration on boot
//! - Local embeddings (MiniLM-L6 via ONNX) degrading to zero vectors

pub mod config;
pub mod embeddings;
pub mod engine;
pub mod errors;
pub mod graph;
pub mod memory;
pub mod prompts;
pub mod retrieval;
pub mod rpc;
pub mod session;
pub mod store;
pub mod tokens;
pub mod vector_store;

// Re-export dependencies so tests use the same versions
pub use chrono;
pub use parking_lot;
pub use uuid;
