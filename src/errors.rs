//! Error taxonomy for the engine and tool surface.
//!
//! Kinds, not transport codes: the JSON-RPC layer maps these onto wire
//! errors, and tool handlers render them as textual replies. Best-effort
//! failures (embedding, vector indexing, flush, archive hooks) never become
//! an `EngineError` — they are logged and swallowed at the call site.

use std::fmt;

/// Engine error kinds.
#[derive(Debug)]
pub enum EngineError {
    /// Malformed tool arguments; no state change happened.
    Validation { field: String, reason: String },

    /// A referenced id or label is absent. Usually rendered as a benign
    /// textual result rather than a wire error.
    NotFound(String),

    /// Durable store failure.
    Storage(String),

    /// Row or argument (de)serialization failure.
    Serialization(String),

    /// A state the engine promises can not occur.
    Invariant(String),

    /// Wrapper for external errors.
    Internal(anyhow::Error),
}

impl EngineError {
    pub fn validation(field: &str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Machine-readable code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Storage(_) => "STORAGE",
            Self::Serialization(_) => "SERIALIZATION",
            Self::Invariant(_) => "INVARIANT",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Detailed human-readable message.
    pub fn message(&self) -> String {
        match self {
            Self::Validation { field, reason } => {
                format!("Invalid input for '{field}': {reason}")
            }
            Self::NotFound(what) => format!("Not found: {what}"),
            Self::Storage(msg) => format!("Storage error: {msg}"),
            Self::Serialization(msg) => format!("Serialization error: {msg}"),
            Self::Invariant(msg) => format!("Invariant violation: {msg}"),
            Self::Internal(err) => format!("Internal error: {err:#}"),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for EngineError {}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result alias for the tool surface.
pub type Result<T> = std::result::Result<T, EngineError>;
