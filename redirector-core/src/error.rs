//! Error taxonomy for the redirector core.
//!
//! Store failures are caught at the topology and manager boundary and never
//! reach the request path. Resolution misses are modelled as `None`, not as
//! errors.

use std::time::Duration;

use thiserror::Error;

/// Failures reported by a coordination store client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The requested node does not exist.
    #[error("no such node: {0}")]
    NoNode(String),

    /// The session with the store was lost.
    #[error("connection to coordination store lost")]
    ConnectionLoss,

    /// The store did not answer in time.
    #[error("coordination store timed out after {0:?}")]
    Timeout(Duration),

    /// Any other backend-specific failure.
    #[error("coordination store failure: {0}")]
    Backend(String),
}

/// Errors surfaced by the redirector core.
#[derive(Error, Debug)]
pub enum RedirectorError {
    /// A coordination store read, write or watch failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The topology never became available within the bounded wait.
    #[error("topology did not become available within {0:?}")]
    AvailabilityTimeout(Duration),

    /// A string could not be parsed into a stack path.
    #[error("invalid stack path: {0}")]
    InvalidStackPath(String),

    /// URL parameters failed validation.
    #[error("invalid url parameters: {0}")]
    InvalidUrlParams(String),

    /// A JSON payload (host node, backup file) could not be decoded or encoded.
    #[error("failed to decode payload at {path}: {source}")]
    Decode {
        /// Store path of the offending node.
        path: String,
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// An instance provider was closed twice.
    #[error("instance provider for {0} is already closed")]
    ProviderClosed(String),

    /// Configuration could not be loaded.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, RedirectorError>;
