//! Error types for the Tollgate service.

use thiserror::Error;

use crate::mesh::ClusterError;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A policy failed validation and was rejected before reaching the resolver
    #[error("Invalid policy definition: {0}")]
    InvalidPolicy(String),

    /// An admission request could not be interpreted
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The counter store failed or did not answer in time
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// The policy store could not be read
    #[error("Policy store error: {0}")]
    PolicyStore(String),

    /// Cluster membership errors
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TollgateError {
    fn from(err: config::ConfigError) -> Self {
        TollgateError::Config(err.to_string())
    }
}

impl From<redis::RedisError> for TollgateError {
    fn from(err: redis::RedisError) -> Self {
        TollgateError::StoreUnavailable(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
