//! Error types for the Bouncer engine.

use thiserror::Error;

/// Main error type for Bouncer operations.
#[derive(Error, Debug)]
pub enum BouncerError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The counter store could not be reached or refused the operation
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A store operation did not complete within its budget
    #[error("Store operation `{operation}` timed out after {after_ms}ms")]
    Timeout {
        /// Name of the primitive that stalled
        operation: &'static str,
        /// Configured budget in milliseconds
        after_ms: u64,
    },

    /// The backend does not offer the requested capability
    #[error("Store does not support {0}")]
    Unsupported(&'static str),

    /// The store returned data that breaks a counting invariant
    #[error("Invariant violation: {0}")]
    Invariant(String),

    /// Redis client errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Layered configuration loading errors
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BouncerError {
    /// Whether this error means the shared store itself failed.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            BouncerError::StoreUnavailable(_)
                | BouncerError::Timeout { .. }
                | BouncerError::Redis(_)
                | BouncerError::Unsupported(_)
        )
    }

    /// Whether this error signals corrupted or impossible counter state.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, BouncerError::Invariant(_))
    }
}

/// Result type alias for Bouncer operations.
pub type Result<T> = std::result::Result<T, BouncerError>;
