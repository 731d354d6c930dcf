//! Error types for the adaptive rate limiter.

use thiserror::Error;

/// Failure raised by a backing store (scores, blocks, correlation sets,
/// circuit-breaker state).
///
/// These never reach the caller of [`crate::ratelimit::RateLimiterEngine::limit`];
/// the engine turns them into circuit-breaker accounting and a fallback verdict.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or refused the operation
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer in time
    #[error("store operation timed out")]
    Timeout,

    /// A stored value could not be decoded
    #[error("corrupt value at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Main error type for rate limiter operations.
#[derive(Error, Debug)]
pub enum RateLimiterError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The requested policy is not configured
    #[error("Unknown rate limit policy: {0}")]
    UnknownPolicy(String),

    /// A policy failed validation at load time
    #[error("Invalid policy {policy}: {reason}")]
    InvalidPolicy { policy: String, reason: String },

    /// Store errors outside the evaluation path
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for rate limiter operations.
pub type Result<T> = std::result::Result<T, RateLimiterError>;
