//! Error types for gridtune.
//!
//! Only construction, configuration and the persistence store can fail. The dispatch hot path
//! (`size()` / `feedback()`) never returns errors: bad input is ignored and
//! degenerate state falls back to a bundle size of 1.

use thiserror::Error;

/// Errors that can occur when configuring or building bundlers.
#[derive(Debug, Error)]
pub enum BundlerError {
    /// A tuning profile parameter is out of its valid range.
    #[error("invalid tuning profile: {0}")]
    InvalidProfile(String),

    /// The configured load-balancing algorithm name is not known.
    #[error("unknown load-balancing algorithm: {0}")]
    UnknownAlgorithm(String),

    /// Error extracting configuration from figment.
    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Error registering metrics with a Prometheus registry.
    #[error("failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Error reading or writing persisted bundler state.
    #[error("load-balancer persistence error: {0}")]
    Persistence(#[from] std::io::Error),

    /// Persisted bundler state could not be encoded or decoded.
    #[error("invalid persisted bundler state: {0}")]
    StateFormat(#[from] serde_json::Error),
}

/// Result type alias for gridtune operations.
pub type Result<T> = std::result::Result<T, BundlerError>;
