//! Error types for TierStore
//!
//! This module defines the common error types used throughout the system.

use thiserror::Error;

/// Common result type for TierStore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for TierStore
#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors: invalid policy/rule parameters. These fail at
    // creation time and leave nothing partially applied.
    #[error("configuration error: {0}")]
    Configuration(String),

    // Lookup errors: unknown policy/rule/task/check id. Raised to the
    // caller, a programmer error rather than an operational one.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} is disabled: {id}")]
    Disabled { kind: &'static str, id: String },

    // Capacity errors: a target tier cannot fit a migration. The work is
    // queued and alerted, never silently overflowed.
    #[error("insufficient capacity on tier {tier}: required {required} bytes, available {available} bytes")]
    Capacity {
        tier: String,
        required: u64,
        available: u64,
    },

    // Integrity errors
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("integrity error: {0}")]
    Integrity(String),

    // Backup written but could not be verified; such a backup must never
    // be treated as restorable.
    #[error("verification failed: {0}")]
    Verification(String),

    // Retryable I/O; recorded per-object and retried on the next
    // scheduled cycle rather than immediately.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transient storage error: {0}")]
    Transient(String),

    #[error("invalid task state transition: {from} -> {to}")]
    TaskState { from: String, to: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a not-found error for an entity kind
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Create a disabled-entity error
    pub fn disabled(kind: &'static str, id: impl Into<String>) -> Self {
        Self::Disabled {
            kind,
            id: id.into(),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a verification error
    pub fn verification(msg: impl Into<String>) -> Self {
        Self::Verification(msg.into())
    }

    /// Create an integrity error
    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    /// Check if this error is retryable on a later cycle
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Transient(_))
    }

    /// Check if this is a not-found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this is a capacity error
    #[must_use]
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::Capacity { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
