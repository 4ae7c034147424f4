use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::{StoreError, StoreResult};

/// Plain Parquet file writer (Snappy). Writes directly to `path`.
///
/// Used for staged outputs and spill files, where the caller owns promotion
/// and cleanup of the file.
pub struct BatchFileWriter {
    path: PathBuf,
    schema: SchemaRef,
    writer: Option<ArrowWriter<File>>,
    rows_written: u64,
}

impl BatchFileWriter {
    pub fn create(path: &Path, schema: SchemaRef) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(StoreError::io(parent))?;
        }
        let file = File::create(path).map_err(StoreError::io(path))?;
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let writer = ArrowWriter::try_new(file, schema.clone(), Some(props))
            .map_err(StoreError::parquet(path))?;
        Ok(Self {
            path: path.to_path_buf(),
            schema,
            writer: Some(writer),
            rows_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn write_batch(&mut self, batch: &RecordBatch) -> StoreResult<u64> {
        let path = &self.path;
        let writer = self.writer.as_mut().ok_or_else(|| StoreError::Io {
            path: path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "writer already closed"),
        })?;
        writer.write(batch).map_err(StoreError::parquet(path))?;
        let rows = batch.num_rows() as u64;
        self.rows_written += rows;
        debug!(
            "Wrote {} rows to {} (total: {})",
            rows,
            path.display(),
            self.rows_written
        );
        Ok(rows)
    }

    /// Flush the footer and close the file.
    pub fn close(mut self) -> StoreResult<u64> {
        self.finish()?;
        Ok(self.rows_written)
    }

    fn finish(&mut self) -> StoreResult<()> {
        if let Some(writer) = self.writer.take() {
            writer.close().map_err(StoreError::parquet(&self.path))?;
        }
        Ok(())
    }
}

/// Parquet artifact writer with atomic commit.
///
/// Rows go to `.{file}.tmp`; [`ArtifactWriter::commit`] closes the file and
/// renames it over the final path. Dropping an uncommitted writer deletes
/// the temp file.
pub struct ArtifactWriter {
    inner: Option<BatchFileWriter>,
    temp_path: Option<PathBuf>,
    final_path: PathBuf,
}

impl ArtifactWriter {
    pub(crate) fn create(temp_path: PathBuf, final_path: PathBuf, schema: SchemaRef) -> StoreResult<Self> {
        info!(
            "Opening artifact writer: {} (temp: {})",
            final_path.display(),
            temp_path.display()
        );
        let inner = BatchFileWriter::create(&temp_path, schema)?;
        Ok(Self {
            inner: Some(inner),
            temp_path: Some(temp_path),
            final_path,
        })
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    pub fn write_batch(&mut self, batch: &RecordBatch) -> StoreResult<u64> {
        match self.inner.as_mut() {
            Some(inner) => inner.write_batch(batch),
            None => Err(StoreError::Io {
                path: self.final_path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "writer already finished"),
            }),
        }
    }

    /// Close and promote the temp file. Returns the number of rows written.
    pub fn commit(mut self) -> StoreResult<u64> {
        let rows = match self.inner.take() {
            Some(inner) => inner.close()?,
            None => 0,
        };
        if let Some(temp_path) = &self.temp_path {
            std::fs::rename(temp_path, &self.final_path)
                .map_err(StoreError::io(&self.final_path))?;
        }
        self.temp_path = None;
        info!(
            "Committed artifact: {} ({} rows)",
            self.final_path.display(),
            rows
        );
        Ok(rows)
    }

    /// Discard everything written so far.
    pub fn rollback(mut self) {
        self.discard();
    }

    fn discard(&mut self) {
        // Close first so the handle is released before removal.
        if let Some(mut inner) = self.inner.take() {
            let _ = inner.finish();
        }
        if let Some(temp_path) = self.temp_path.take() {
            if temp_path.exists() {
                let _ = std::fs::remove_file(&temp_path);
                warn!("Rolled back artifact temp file: {}", temp_path.display());
            }
        }
    }
}

impl Drop for ArtifactWriter {
    fn drop(&mut self) {
        self.discard();
    }
}
