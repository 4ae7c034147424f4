use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MergeError {
    /// The in-memory strategy would need more than its budget. Triggers the
    /// streaming fallback; nothing has been written to the sink yet.
    #[error("in-memory merge needs {required} bytes, budget is {budget} bytes")]
    ResourceExhausted { required: usize, budget: usize },

    #[error("join schema error: {0}")]
    Schema(String),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error(transparent)]
    Store(#[from] adeflow_store::StoreError),

    #[error("spill I/O error on {}: {source}", path.display())]
    Spill {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type MergeResult<T> = std::result::Result<T, MergeError>;
