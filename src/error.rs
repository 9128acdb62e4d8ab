//! Error types for the market cache
//!
//! Provides structured error types for the cache tiers, the invalidation
//! engine and configuration loading. Most cache operations never surface
//! these to callers: the distributed tier converts them into soft failures.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the cache subsystem
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Distributed Tier Errors
    // =========================================================================
    #[error("Distributed tier unavailable: {reason}")]
    DistributedUnavailable { reason: String },

    #[error("Distributed tier operation '{operation}' timed out after {timeout:?}")]
    OperationTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Redis pool error: {0}")]
    RedisPool(String),

    #[error("Pub/sub subscription closed: {0}")]
    SubscriptionClosed(String),

    // =========================================================================
    // Invalidation Errors
    // =========================================================================
    #[error("Unknown domain type: {0}")]
    UnknownDomain(String),

    #[error("Invalid key pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<deadpool_redis::PoolError> for Error {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Error::RedisPool(err.to_string())
    }
}

impl Error {
    /// Check if this error is transient (worth retrying after a backoff)
    pub fn is_transient(&self) -> bool {
        match self {
            Error::DistributedUnavailable { .. }
            | Error::OperationTimeout { .. }
            | Error::RedisPool(_)
            | Error::SubscriptionClosed(_) => true,
            Error::Redis(e) => {
                e.is_io_error() || e.is_connection_dropped() || e.is_timeout()
            }
            _ => false,
        }
    }

    /// Check if this error should abort startup
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Configuration(_) | Error::YamlParse(_) | Error::UnknownDomain(_)
        )
    }
}

/// Result type alias for the cache subsystem
pub type Result<T> = std::result::Result<T, Error>;
