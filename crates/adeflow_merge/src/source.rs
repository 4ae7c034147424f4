use adeflow_store::{ArtifactReader, ArtifactWriter, BatchFileWriter, ShardSpec};
use arrow::array::BooleanArray;
use arrow::compute::filter_record_batch;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use std::path::{Path, PathBuf};

use crate::key::row_keys;
use crate::{MergeError, MergeResult};

pub type BatchIter<'a> = Box<dyn Iterator<Item = MergeResult<RecordBatch>> + 'a>;

/// A re-readable input. Every call to [`BatchSource::batches`] starts from the
/// first row, which is what lets the adaptive merge retry with another strategy.
pub trait BatchSource {
    fn schema(&self) -> SchemaRef;

    fn batches(&self) -> MergeResult<BatchIter<'_>>;

    /// Approximate on-disk size, when cheap to know.
    fn size_hint_bytes(&self) -> Option<u64> {
        None
    }
}

/// Receives output batches in order.
pub trait BatchSink {
    fn write_batch(&mut self, batch: &RecordBatch) -> MergeResult<()>;
}

/// Row selection applied while reading a source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceFilter {
    /// Keep rows whose value in `column` belongs to the shard. Null values go to shard 0.
    pub shard: Option<(String, ShardSpec)>,
    /// Stop after this many rows.
    pub limit: Option<usize>,
}

impl SourceFilter {
    pub fn is_empty(&self) -> bool {
        self.limit.is_none() && self.shard.as_ref().map_or(true, |(_, s)| !s.is_sharded())
    }
}

fn filtered<'a>(
    inner: BatchIter<'a>,
    schema: &SchemaRef,
    filter: &'a SourceFilter,
) -> MergeResult<BatchIter<'a>> {
    if filter.is_empty() {
        return Ok(inner);
    }
    let shard = match &filter.shard {
        Some((column, shard)) if shard.is_sharded() => {
            let index = schema.index_of(column).map_err(|_| {
                MergeError::Schema(format!("shard column '{}' not found", column))
            })?;
            Some((index, *shard))
        }
        _ => None,
    };
    let mut remaining = filter.limit;
    let mut inner = inner;

    Ok(Box::new(std::iter::from_fn(move || loop {
        if remaining == Some(0) {
            return None;
        }
        let mut batch = match inner.next()? {
            Ok(batch) => batch,
            Err(err) => return Some(Err(err)),
        };
        if let Some((index, shard)) = shard {
            let keys = match row_keys(&batch, &[index]) {
                Ok(keys) => keys,
                Err(err) => return Some(Err(err)),
            };
            let mask: BooleanArray = keys
                .iter()
                .map(|key| {
                    Some(match key {
                        Some(key) => shard.owns(key),
                        None => shard.shard_id() == 0,
                    })
                })
                .collect();
            batch = match filter_record_batch(&batch, &mask) {
                Ok(batch) => batch,
                Err(err) => return Some(Err(err.into())),
            };
        }
        if let Some(left) = remaining.as_mut() {
            if batch.num_rows() > *left {
                batch = batch.slice(0, *left);
            }
            *left -= batch.num_rows();
        }
        if batch.num_rows() > 0 {
            return Some(Ok(batch));
        }
    })))
}

/// Batches held in memory.
#[derive(Debug, Clone)]
pub struct MemorySource {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
    filter: SourceFilter,
}

impl MemorySource {
    pub fn new(schema: SchemaRef, batches: Vec<RecordBatch>) -> Self {
        Self {
            schema,
            batches,
            filter: SourceFilter::default(),
        }
    }

    pub fn with_filter(mut self, filter: SourceFilter) -> Self {
        self.filter = filter;
        self
    }
}

impl BatchSource for MemorySource {
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn batches(&self) -> MergeResult<BatchIter<'_>> {
        let inner: BatchIter<'_> = Box::new(self.batches.iter().cloned().map(Ok));
        filtered(inner, &self.schema, &self.filter)
    }
}

/// A Parquet file, typically a committed artifact.
#[derive(Debug, Clone)]
pub struct ParquetSource {
    path: PathBuf,
    schema: SchemaRef,
    size: u64,
    filter: SourceFilter,
}

impl ParquetSource {
    pub fn open(path: &Path) -> MergeResult<Self> {
        let reader = ArtifactReader::open(path)?;
        let size = std::fs::metadata(path)
            .map_err(|source| MergeError::Spill {
                path: path.to_path_buf(),
                source,
            })?
            .len();
        Ok(Self {
            path: path.to_path_buf(),
            schema: reader.schema(),
            size,
            filter: SourceFilter::default(),
        })
    }

    pub fn with_filter(mut self, filter: SourceFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BatchSource for ParquetSource {
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn batches(&self) -> MergeResult<BatchIter<'_>> {
        let reader = ArtifactReader::open(&self.path)?;
        let inner: BatchIter<'_> = Box::new(reader.map(|batch| batch.map_err(MergeError::from)));
        filtered(inner, &self.schema, &self.filter)
    }

    fn size_hint_bytes(&self) -> Option<u64> {
        Some(self.size)
    }
}

/// Collects output in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    batches: Vec<RecordBatch>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(|b| b.num_rows()).sum()
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    pub fn into_batches(self) -> Vec<RecordBatch> {
        self.batches
    }
}

impl BatchSink for MemorySink {
    fn write_batch(&mut self, batch: &RecordBatch) -> MergeResult<()> {
        self.batches.push(batch.clone());
        Ok(())
    }
}

impl BatchSink for BatchFileWriter {
    fn write_batch(&mut self, batch: &RecordBatch) -> MergeResult<()> {
        BatchFileWriter::write_batch(self, batch)?;
        Ok(())
    }
}

impl BatchSink for ArtifactWriter {
    fn write_batch(&mut self, batch: &RecordBatch) -> MergeResult<()> {
        ArtifactWriter::write_batch(self, batch)?;
        Ok(())
    }
}
