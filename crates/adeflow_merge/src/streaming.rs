use adeflow_store::{ArtifactReader, BatchFileWriter};
use arrow::array::{Array, ArrayRef, UInt32Array, UInt64Array};
use arrow::compute::{concat_batches, interleave, take};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use std::cmp::Reverse;
use std::collections::hash_map::DefaultHasher;
use std::collections::BinaryHeap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::join::{JoinLayout, RightTable, OUTPUT_BATCH_ROWS};
use crate::key::row_keys;
use crate::{BatchSink, BatchSource, JoinSpec, JoinType, MergeError, MergeResult, MergeStats};

/// Position of a row in the left input; carried through the spill files so the
/// partition outputs can be merged back into left order.
const ORD_COLUMN: &str = "__adeflow_left_ord";

pub(crate) fn merge_streaming(
    left: &dyn BatchSource,
    right: &dyn BatchSource,
    spec: &JoinSpec,
    partitions: usize,
    spill_dir: Option<&Path>,
    sink: &mut dyn BatchSink,
) -> MergeResult<MergeStats> {
    let partitions = partitions.max(1);
    let left_schema = left.schema();
    let right_schema = right.schema();
    let layout = JoinLayout::new(&left_schema, &right_schema, spec)?;
    let spill = spill_tempdir(spill_dir)?;
    debug!(partitions, dir = %spill.path().display(), "Starting streaming merge");

    let mut stats = MergeStats {
        mode: "streaming".to_string(),
        partitions: Some(partitions),
        ..Default::default()
    };

    // Build side. Rows with a null key can never match and are dropped here.
    let mut right_parts = PartitionWriters::new(spill.path(), "right", partitions, right_schema.clone());
    for batch in right.batches()? {
        let batch = batch?;
        stats.right_rows += batch.num_rows() as u64;
        let keys = row_keys(&batch, &layout.right_keys)?;
        let assignment: Vec<Option<usize>> = keys
            .iter()
            .map(|key| key.as_deref().map(|k| partition_of(k, partitions)))
            .collect();
        right_parts.write_split(&batch, &assignment)?;
    }
    let right_files = right_parts.finish()?;

    // Left side, tagged with its input position.
    let left_ord_schema = with_ord_column(&left_schema);
    let ord_index = left_schema.fields().len();
    let mut left_parts = PartitionWriters::new(spill.path(), "left", partitions, left_ord_schema.clone());
    let mut next_ord = 0u64;
    for batch in left.batches()? {
        let batch = batch?;
        let rows = batch.num_rows() as u64;
        stats.left_rows += rows;
        let ords = UInt64Array::from_iter_values(next_ord..next_ord + rows);
        next_ord += rows;

        let mut columns = batch.columns().to_vec();
        columns.push(Arc::new(ords) as ArrayRef);
        let tagged = RecordBatch::try_new(left_ord_schema.clone(), columns)?;

        let keys = row_keys(&batch, &layout.left_keys)?;
        let assignment: Vec<Option<usize>> = keys
            .iter()
            .map(|key| match key.as_deref() {
                Some(k) => Some(partition_of(k, partitions)),
                None if spec.join_type == JoinType::LeftOuter => Some(0),
                None => {
                    stats.unmatched_left_rows += 1;
                    None
                }
            })
            .collect();
        left_parts.write_split(&tagged, &assignment)?;
    }
    let left_files = left_parts.finish()?;

    // Join each partition pair; outputs keep the ordinal as their last column.
    let out_ord_schema = with_ord_column(&layout.output);
    let left_cols: Vec<usize> = (0..ord_index).collect();
    let mut outputs = Vec::new();
    for (partition, left_path) in left_files.iter().enumerate() {
        let Some(left_path) = left_path else { continue };
        let right_batch = match &right_files[partition] {
            Some(path) => read_all(path, &right_schema)?,
            None => RecordBatch::new_empty(right_schema.clone()),
        };
        let table = RightTable::build(right_batch, &layout.right_keys)?;

        let out_path = spill.path().join(format!("out_{:04}.parquet", partition));
        let mut writer = BatchFileWriter::create(&out_path, out_ord_schema.clone())?;
        for batch in ArtifactReader::open(left_path)? {
            let batch = batch?;
            let keys = row_keys(&batch, &layout.left_keys)?;
            let matches = table.match_rows(&keys, spec.join_type);
            stats.matched_left_rows += matches.matched_rows;
            stats.unmatched_left_rows += matches.unmatched_rows;

            for range in matches.chunks() {
                let mut columns =
                    table.assemble(&batch, &left_cols, &layout.right_values, &matches, range.clone())?;
                let idx = UInt32Array::from(matches.left[range].to_vec());
                columns.push(take(batch.column(ord_index).as_ref(), &idx, None)?);
                writer.write_batch(&RecordBatch::try_new(out_ord_schema.clone(), columns)?)?;
            }
        }
        writer.close()?;
        outputs.push(out_path);
    }

    stats.output_rows = merge_by_ordinal(&outputs, &layout.output, sink)?;
    info!(
        left_rows = stats.left_rows,
        right_rows = stats.right_rows,
        output_rows = stats.output_rows,
        partitions,
        "Streaming merge complete"
    );
    Ok(stats)
}

fn spill_tempdir(spill_dir: Option<&Path>) -> MergeResult<tempfile::TempDir> {
    let builder = {
        let mut builder = tempfile::Builder::new();
        builder.prefix("adeflow-merge-");
        builder
    };
    match spill_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|source| MergeError::Spill {
                path: dir.to_path_buf(),
                source,
            })?;
            builder.tempdir_in(dir).map_err(|source| MergeError::Spill {
                path: dir.to_path_buf(),
                source,
            })
        }
        None => builder.tempdir().map_err(|source| MergeError::Spill {
            path: std::env::temp_dir(),
            source,
        }),
    }
}

fn partition_of(key: &str, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as usize
}

fn with_ord_column(schema: &Schema) -> SchemaRef {
    let mut fields: Vec<Field> = schema.fields().iter().map(|f| f.as_ref().clone()).collect();
    fields.push(Field::new(ORD_COLUMN, DataType::UInt64, false));
    Arc::new(Schema::new(fields))
}

fn read_all(path: &Path, schema: &SchemaRef) -> MergeResult<RecordBatch> {
    let batches = ArtifactReader::open(path)?.collect::<Result<Vec<_>, _>>()?;
    Ok(concat_batches(schema, &batches)?)
}

/// Lazily created spill file per partition.
struct PartitionWriters {
    dir: PathBuf,
    label: &'static str,
    schema: SchemaRef,
    writers: Vec<Option<BatchFileWriter>>,
}

impl PartitionWriters {
    fn new(dir: &Path, label: &'static str, partitions: usize, schema: SchemaRef) -> Self {
        Self {
            dir: dir.to_path_buf(),
            label,
            schema,
            writers: (0..partitions).map(|_| None).collect(),
        }
    }

    /// Route row `i` of `batch` to partition `assignment[i]`; `None` drops it.
    /// Rows keep their relative order within a partition.
    fn write_split(&mut self, batch: &RecordBatch, assignment: &[Option<usize>]) -> MergeResult<()> {
        let mut buckets: Vec<Vec<u32>> = vec![Vec::new(); self.writers.len()];
        for (row, partition) in assignment.iter().enumerate() {
            if let Some(partition) = partition {
                buckets[*partition].push(row as u32);
            }
        }
        for (partition, rows) in buckets.into_iter().enumerate() {
            if rows.is_empty() {
                continue;
            }
            let idx = UInt32Array::from(rows);
            let columns = batch
                .columns()
                .iter()
                .map(|column| take(column.as_ref(), &idx, None))
                .collect::<Result<Vec<_>, _>>()?;
            let part = RecordBatch::try_new(self.schema.clone(), columns)?;
            self.writer(partition)?.write_batch(&part)?;
        }
        Ok(())
    }

    fn writer(&mut self, partition: usize) -> MergeResult<&mut BatchFileWriter> {
        if self.writers[partition].is_none() {
            let path = self
                .dir
                .join(format!("{}_{:04}.parquet", self.label, partition));
            self.writers[partition] = Some(BatchFileWriter::create(&path, self.schema.clone())?);
        }
        self.writers[partition]
            .as_mut()
            .ok_or_else(|| MergeError::Schema(format!("no spill writer for partition {}", partition)))
    }

    fn finish(self) -> MergeResult<Vec<Option<PathBuf>>> {
        self.writers
            .into_iter()
            .map(|writer| match writer {
                Some(writer) => {
                    let path = writer.path().to_path_buf();
                    writer.close()?;
                    Ok(Some(path))
                }
                None => Ok(None),
            })
            .collect()
    }
}

/// Read cursor over one partition output.
struct Cursor {
    reader: ArtifactReader,
    ord_index: usize,
    batch: RecordBatch,
    ords: UInt64Array,
    row: usize,
    /// Position of `batch` in the current output arena.
    slot: Option<usize>,
}

impl Cursor {
    fn open(path: &Path, ord_index: usize) -> MergeResult<Option<Self>> {
        let reader = ArtifactReader::open(path)?;
        let schema = reader.schema();
        let mut cursor = Self {
            reader,
            ord_index,
            batch: RecordBatch::new_empty(schema),
            ords: UInt64Array::from(Vec::<u64>::new()),
            row: 0,
            slot: None,
        };
        Ok(if cursor.next_batch()? { Some(cursor) } else { None })
    }

    fn next_batch(&mut self) -> MergeResult<bool> {
        for batch in self.reader.by_ref() {
            let batch = batch?;
            if batch.num_rows() == 0 {
                continue;
            }
            let ords = batch
                .column(self.ord_index)
                .as_any()
                .downcast_ref::<UInt64Array>()
                .cloned()
                .ok_or_else(|| MergeError::Schema("spill file lost its ordinal column".into()))?;
            self.batch = batch;
            self.ords = ords;
            self.row = 0;
            self.slot = None;
            return Ok(true);
        }
        Ok(false)
    }

    fn ord(&self) -> u64 {
        self.ords.value(self.row)
    }
}

/// K-way merge of sorted partition outputs by left ordinal. Returns rows written.
fn merge_by_ordinal(paths: &[PathBuf], schema: &SchemaRef, sink: &mut dyn BatchSink) -> MergeResult<u64> {
    let ord_index = schema.fields().len();
    let mut cursors = Vec::new();
    for path in paths {
        if let Some(cursor) = Cursor::open(path, ord_index)? {
            cursors.push(cursor);
        }
    }

    let mut heap: BinaryHeap<Reverse<(u64, usize)>> = cursors
        .iter()
        .enumerate()
        .map(|(i, c)| Reverse((c.ord(), i)))
        .collect();
    let mut arena: Vec<RecordBatch> = Vec::new();
    let mut picks: Vec<(usize, usize)> = Vec::with_capacity(OUTPUT_BATCH_ROWS);
    let mut written = 0u64;

    while let Some(Reverse((_, i))) = heap.pop() {
        let cursor = &mut cursors[i];
        let slot = match cursor.slot {
            Some(slot) => slot,
            None => {
                arena.push(cursor.batch.clone());
                cursor.slot = Some(arena.len() - 1);
                arena.len() - 1
            }
        };
        picks.push((slot, cursor.row));
        cursor.row += 1;
        if cursor.row < cursor.batch.num_rows() || cursor.next_batch()? {
            heap.push(Reverse((cursor.ord(), i)));
        }

        if picks.len() >= OUTPUT_BATCH_ROWS {
            written += flush(&mut arena, &mut picks, &mut cursors, schema, sink)?;
        }
    }
    written += flush(&mut arena, &mut picks, &mut cursors, schema, sink)?;
    Ok(written)
}

fn flush(
    arena: &mut Vec<RecordBatch>,
    picks: &mut Vec<(usize, usize)>,
    cursors: &mut [Cursor],
    schema: &SchemaRef,
    sink: &mut dyn BatchSink,
) -> MergeResult<u64> {
    if picks.is_empty() {
        return Ok(0);
    }
    let mut columns = Vec::with_capacity(schema.fields().len());
    for column in 0..schema.fields().len() {
        let arrays: Vec<&dyn Array> = arena.iter().map(|b| b.column(column).as_ref()).collect();
        columns.push(interleave(&arrays, picks)?);
    }
    let batch = RecordBatch::try_new(schema.clone(), columns)?;
    sink.write_batch(&batch)?;

    let rows = picks.len() as u64;
    arena.clear();
    picks.clear();
    for cursor in cursors.iter_mut() {
        cursor.slot = None;
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_assignment_is_stable() {
        for key in ["1", "aspirin", "10\u{1f}3"] {
            let p = partition_of(key, 16);
            assert!(p < 16);
            assert_eq!(p, partition_of(key, 16));
        }
        assert_eq!(partition_of("anything", 1), 0);
    }

    #[test]
    fn ord_column_is_appended() {
        let schema = Schema::new(vec![Field::new("primaryid", DataType::Int64, false)]);
        let tagged = with_ord_column(&schema);
        assert_eq!(tagged.fields().len(), 2);
        assert_eq!(tagged.field(1).name(), ORD_COLUMN);
    }
}
