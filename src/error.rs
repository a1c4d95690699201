//! Error types for replication operations.
//!
//! A single error enum covers the whole engine so call sites can classify
//! failures without string matching: transient network faults retry,
//! authorization and method-not-allowed responses downgrade the blob
//! transfer protocol, conflicts route through the task's conflict strategy.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReplicaError>;

#[derive(Debug, Clone, Error)]
pub enum ReplicaError {
    /// Transport-level failures: connect, reset, timeout, DNS.
    #[error("network error: {0}")]
    Network(String),

    /// The remote cluster answered with an unexpected status.
    #[error("remote cluster error: {0}")]
    Remote(String),

    /// 401 from the remote, or a failed token exchange.
    #[error("authorization error: {0}")]
    Auth(String),

    /// 405 from the remote; the endpoint does not support the verb.
    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),

    /// Blob transfer protocol failures (session open/patch/close).
    #[error("upload error: {0}")]
    Upload(String),

    /// Manifest, challenge header or response body parse failures.
    #[error("parse error: {0}")]
    Parse(String),

    /// A referenced entity is missing locally or remotely.
    #[error("not found: {0}")]
    NotFound(String),

    /// The remote already holds the artifact being replicated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Local storage collaborator failures.
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid task, cluster or transfer configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The run or dispatch was cancelled before completion.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl ReplicaError {
    /// Whether a retry with the same request can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReplicaError::Network(_) | ReplicaError::Remote(_) | ReplicaError::Upload(_)
        )
    }

    /// Whether the blob transfer should fall back from chunked to
    /// single-shot mode on the next attempt.
    pub fn triggers_downgrade(&self) -> bool {
        matches!(
            self,
            ReplicaError::Auth(_) | ReplicaError::MethodNotAllowed(_)
        )
    }
}

impl From<reqwest::Error> for ReplicaError {
    fn from(err: reqwest::Error) -> Self {
        ReplicaError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for ReplicaError {
    fn from(err: serde_json::Error) -> Self {
        ReplicaError::Parse(err.to_string())
    }
}

impl From<std::io::Error> for ReplicaError {
    fn from(err: std::io::Error) -> Self {
        ReplicaError::Storage(err.to_string())
    }
}

impl From<url::ParseError> for ReplicaError {
    fn from(err: url::ParseError) -> Self {
        ReplicaError::Config(err.to_string())
    }
}
