//! Error types for cache operations
//!
//! Most of these never reach a caller: tier-level failures are caught by the
//! coordinator, logged, and turned into a miss or a silent no-op. They exist
//! so each tier can report *why* it degraded.

use thiserror::Error;

/// Main error type for cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    /// A tier's backing resource cannot service the request
    #[error("Tier '{tier}' unavailable: {reason}")]
    TierUnavailable { tier: String, reason: String },

    /// A value failed shape validation
    #[error("Malformed value: {0}")]
    MalformedValue(String),

    /// Durable snapshot was written by a different schema version
    #[error("Schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch { expected: u32, found: u32 },

    /// Background intermediary did not acknowledge in time
    #[error("Notifier timed out after {timeout_ms}ms waiting for '{action}' acknowledgment")]
    NotifierTimeout { action: String, timeout_ms: u64 },

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Storage backend I/O error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

impl CacheError {
    /// Shorthand for a [`CacheError::TierUnavailable`]
    pub fn unavailable(tier: impl Into<String>, reason: impl Into<String>) -> Self {
        CacheError::TierUnavailable {
            tier: tier.into(),
            reason: reason.into(),
        }
    }

    /// True for errors caused by bad caller input rather than a failing resource
    pub fn is_programmer_error(&self) -> bool {
        matches!(self, CacheError::MalformedValue(_))
    }
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl From<String> for CacheError {
    fn from(s: String) -> Self {
        CacheError::Other(s)
    }
}

impl From<&str> for CacheError {
    fn from(s: &str) -> Self {
        CacheError::Other(s.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        CacheError::Storage(e.to_string())
    }
}
