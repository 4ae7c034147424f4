//! Durable artifact storage for pipeline stages.
//!
//! Every artifact is written to a hidden temp path next to its final location
//! and promoted with a single rename, so readers only ever observe complete
//! files:
//! - `.{file}.tmp` while a writer is open
//! - `{file}` once committed
//!
//! [`ArtifactStore::exists`] classifies what is on disk as absent, partial or
//! present. Partial artifacts are leftovers of an interrupted write and are
//! treated as absent by the orchestrator.

mod error;
mod fingerprint;
mod shard;
mod spec;
mod staged;
mod store;
mod writer;

pub use error::{StoreError, StoreResult};
pub use fingerprint::Fingerprint;
pub use shard::{shard_of, ShardSpec};
pub use spec::{ArtifactSpec, Format};
pub use staged::{StagedOutput, StagedOutputs};
pub use store::{read_json, write_json_atomic, ArtifactReader, ArtifactState, ArtifactStore};
pub use writer::{ArtifactWriter, BatchFileWriter};

/// Temp file name used while `file_name` is being written.
pub fn temp_file_name(file_name: &str) -> String {
    format!(".{}.tmp", file_name)
}
