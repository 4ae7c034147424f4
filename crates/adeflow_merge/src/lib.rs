//! Hash joins over Arrow record batches, in memory or partitioned on disk.
//!
//! Two execution strategies produce identical output:
//! - [`MergeMode::InMemory`] materializes both inputs and looks left keys up in a hash table.
//! - [`MergeMode::Streaming`] hash-partitions both inputs into spill files,
//!   joins one partition pair at a time and merges the partition outputs back
//!   into left-input order.
//!
//! Output order is always: left rows in input order, and for each left row its
//! right matches in right-input order. Duplicate keys expand to every pairing.
//! Null keys never match.

mod error;
mod join;
mod key;
mod memory;
mod source;
mod spec;
mod streaming;

use tracing::{info, warn};

pub use error::{MergeError, MergeResult};
pub use join::output_schema;
pub use key::distinct_keys;
pub use source::{BatchSink, BatchSource, MemorySink, MemorySource, ParquetSource, SourceFilter};
pub use spec::{
    AdaptivePolicy, JoinSpec, JoinType, MergeMode, MergeStats, DEFAULT_PARTITIONS,
    DEFAULT_RIGHT_SUFFIX,
};

/// Join `left` with `right` using the given strategy, writing output batches to `sink`.
pub fn merge(
    left: &dyn BatchSource,
    right: &dyn BatchSource,
    spec: &JoinSpec,
    mode: &MergeMode,
    sink: &mut dyn BatchSink,
) -> MergeResult<MergeStats> {
    match mode {
        MergeMode::InMemory { memory_budget } => {
            memory::merge_in_memory(left, right, spec, *memory_budget, sink)
        }
        MergeMode::Streaming {
            partitions,
            spill_dir,
        } => streaming::merge_streaming(left, right, spec, *partitions, spill_dir.as_deref(), sink),
    }
}

/// In-memory first, streaming when memory runs out or the inputs are known to be large.
pub fn merge_adaptive(
    left: &dyn BatchSource,
    right: &dyn BatchSource,
    spec: &JoinSpec,
    policy: &AdaptivePolicy,
    sink: &mut dyn BatchSink,
) -> MergeResult<MergeStats> {
    let streaming = MergeMode::Streaming {
        partitions: policy.partitions,
        spill_dir: policy.spill_dir.clone(),
    };

    let declared = match (left.size_hint_bytes(), right.size_hint_bytes()) {
        (Some(l), Some(r)) => Some(l + r),
        _ => None,
    };
    if let (Some(bytes), Some(threshold)) = (declared, policy.in_memory_threshold_bytes) {
        if bytes > threshold {
            info!(
                input_bytes = bytes,
                threshold, "Inputs above in-memory threshold; using streaming merge"
            );
            return merge(left, right, spec, &streaming, sink);
        }
    }

    let in_memory = MergeMode::InMemory {
        memory_budget: policy.memory_budget,
    };
    match merge(left, right, spec, &in_memory, sink) {
        Err(MergeError::ResourceExhausted { required, budget }) => {
            warn!(
                required,
                budget, "In-memory merge exceeded memory budget; falling back to streaming"
            );
            merge(left, right, spec, &streaming, sink)
        }
        other => other,
    }
}
