//! Error types for the Ratewall service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Ratewall operations.
#[derive(Error, Debug)]
pub enum RatewallError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counting store errors surfaced outside of request handling
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Redis client errors raised while connecting
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for RatewallError {
    fn from(err: config::ConfigError) -> Self {
        RatewallError::Config(err.to_string())
    }
}

/// Failure of a single counting store call.
///
/// A store error is never a decision: callers must not treat it as an allow
/// or a deny.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backing service could not be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete within the configured bound
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// The backing service answered with an error
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            StoreError::Unavailable(err.to_string())
        } else if err.is_timeout() {
            StoreError::Backend(format!("timeout: {}", err))
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

/// Result type alias for Ratewall operations.
pub type Result<T> = std::result::Result<T, RatewallError>;
