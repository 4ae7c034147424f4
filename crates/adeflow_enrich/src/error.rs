use std::path::PathBuf;
use thiserror::Error;

/// Errors that stop an enrichment batch. Per-key lookup failures are not
/// errors; they end up as tombstones or unresolved keys.
#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("cache I/O error on {}: {source}", path.display())]
    CacheIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to acquire cache lock")]
    LockError,

    #[error("cache domain '{cache}' does not match lookup domain '{mode}'")]
    DomainMismatch { cache: String, mode: String },

    #[error("qps must be positive and finite, got {0}")]
    InvalidRate(f64),

    #[error("max_workers must be at least 1")]
    InvalidWorkers,

    #[error("lookup worker failed: {0}")]
    Worker(String),

    #[error("HTTP client setup failed: {0}")]
    Http(#[from] reqwest::Error),
}

pub type EnrichResult<T> = std::result::Result<T, EnrichError>;
