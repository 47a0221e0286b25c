//! Error types for Turnstile.

use thiserror::Error;

/// Main error type for Turnstile operations.
///
/// Admission decisions never fail; these errors surface while building
/// limiters, loading configuration or joining background tasks.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A limiter parameter that must be positive and finite was not
    #[error("Invalid parameter `{name}`: {value} (must be positive and finite)")]
    InvalidParameter {
        /// Parameter name as it appears in configuration
        name: &'static str,
        /// Offending value
        value: f64,
    },

    /// Lookup of a policy name that the registry does not know
    #[error("Unknown policy: {0}")]
    UnknownPolicy(String),

    /// Layered configuration source errors
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] ::config::ConfigError),

    /// A background task panicked or was cancelled
    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;

/// Reject zero, negative, NaN and infinite values for a named parameter.
pub(crate) fn ensure_positive(name: &'static str, value: f64) -> Result<f64> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(TurnstileError::InvalidParameter { name, value })
    }
}
