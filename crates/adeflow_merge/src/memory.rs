use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use tracing::{debug, info};

use crate::join::{JoinLayout, RightTable};
use crate::key::row_keys;
use crate::{BatchSink, BatchSource, JoinSpec, MergeError, MergeResult, MergeStats};

pub(crate) fn merge_in_memory(
    left: &dyn BatchSource,
    right: &dyn BatchSource,
    spec: &JoinSpec,
    memory_budget: Option<usize>,
    sink: &mut dyn BatchSink,
) -> MergeResult<MergeStats> {
    let left_schema = left.schema();
    let right_schema = right.schema();
    let layout = JoinLayout::new(&left_schema, &right_schema, spec)?;

    // Both sides are loaded before any output is written, so running out of
    // budget never leaves a half-written sink behind.
    let mut used = 0usize;
    let right_batches = collect(right, &mut used, memory_budget)?;
    let left_batches = collect(left, &mut used, memory_budget)?;
    debug!(bytes = used, "Loaded merge inputs into memory");

    let right_all = concat_batches(&right_schema, &right_batches)?;
    drop(right_batches);
    let table = RightTable::build(right_all, &layout.right_keys)?;

    let mut stats = MergeStats {
        mode: "in_memory".to_string(),
        right_rows: table.num_rows() as u64,
        ..Default::default()
    };
    let left_cols: Vec<usize> = (0..left_schema.fields().len()).collect();

    for batch in left_batches {
        stats.left_rows += batch.num_rows() as u64;
        let keys = row_keys(&batch, &layout.left_keys)?;
        let matches = table.match_rows(&keys, spec.join_type);
        stats.matched_left_rows += matches.matched_rows;
        stats.unmatched_left_rows += matches.unmatched_rows;

        for range in matches.chunks() {
            let columns = table.assemble(&batch, &left_cols, &layout.right_values, &matches, range)?;
            let out = RecordBatch::try_new(layout.output.clone(), columns)?;
            stats.output_rows += out.num_rows() as u64;
            sink.write_batch(&out)?;
        }
    }

    info!(
        left_rows = stats.left_rows,
        right_rows = stats.right_rows,
        output_rows = stats.output_rows,
        "In-memory merge complete"
    );
    Ok(stats)
}

fn collect(
    source: &dyn BatchSource,
    used: &mut usize,
    budget: Option<usize>,
) -> MergeResult<Vec<RecordBatch>> {
    let mut batches = Vec::new();
    for batch in source.batches()? {
        let batch = batch?;
        *used += batch.get_array_memory_size();
        if let Some(budget) = budget {
            if *used > budget {
                return Err(MergeError::ResourceExhausted {
                    required: *used,
                    budget,
                });
            }
        }
        batches.push(batch);
    }
    Ok(batches)
}
