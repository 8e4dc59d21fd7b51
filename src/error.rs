use std::path::PathBuf;

use thiserror::Error;

/// Failures of the cacheability decision logic. Never fatal: callers map every
/// variant to "ineligible" / "not cacheable" and keep the previous module.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy compile failed: {0}")]
    Compile(String),
    #[error("policy evaluation failed: {0}")]
    Evaluation(String),
    #[error("policy panicked during {0}")]
    Panicked(&'static str),
    #[error("no policy module loaded")]
    NotLoaded,
}

/// Failures talking to the remote tier. The in-process tier stays authoritative.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("remote backend error: {0}")]
    Remote(String),
    #[error("failed to encode cache entry: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode cache entry: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Failures observed while capturing a response body.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("response sink failed: {0}")]
    Sink(#[from] std::io::Error),
    #[error("host reported failure: {0}")]
    Host(String),
}

/// Failures reading a policy source from disk.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read policy source {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
