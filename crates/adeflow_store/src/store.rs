use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use flate2::read::MultiGzDecoder;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::{
    temp_file_name, ArtifactSpec, ArtifactWriter, Fingerprint, Format, StagedOutput, StoreError,
    StoreResult,
};

const PARQUET_MAGIC: &[u8; 4] = b"PAR1";
const GZIP_MAGIC: &[u8; 2] = &[0x1f, 0x8b];
const READ_BATCH_SIZE: usize = 8192;

/// What is on disk for an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactState {
    Absent,
    /// Temp file left by an interrupted write, or a final file that fails its validity check.
    Partial,
    Present,
}

/// Artifacts rooted at a data directory: `<root>/<dir>/<file>`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, spec: &ArtifactSpec) -> PathBuf {
        self.root.join(spec.dir()).join(spec.file_name())
    }

    pub fn temp_path(&self, spec: &ArtifactSpec) -> PathBuf {
        self.root
            .join(spec.dir())
            .join(temp_file_name(spec.file_name()))
    }

    /// Classify the artifact. Temp files never count as present.
    pub fn exists(&self, spec: &ArtifactSpec) -> ArtifactState {
        let path = self.path(spec);
        if path.is_file() {
            if is_valid(&path, spec.format()) {
                return ArtifactState::Present;
            }
            debug!("Artifact {} failed validity check", path.display());
            return ArtifactState::Partial;
        }
        if self.temp_path(spec).exists() {
            return ArtifactState::Partial;
        }
        ArtifactState::Absent
    }

    pub fn fingerprint(&self, spec: &ArtifactSpec, with_hash: bool) -> StoreResult<Fingerprint> {
        if self.exists(spec) != ArtifactState::Present {
            return Err(StoreError::NotPresent(spec.id()));
        }
        Fingerprint::of_path(&self.path(spec), with_hash)
    }

    /// Remove leftovers of an interrupted write. Returns true if anything was removed.
    pub fn cleanup_partial(&self, spec: &ArtifactSpec) -> StoreResult<bool> {
        let mut removed = false;
        let temp = self.temp_path(spec);
        if temp.exists() {
            std::fs::remove_file(&temp).map_err(StoreError::io(&temp))?;
            debug!("Removed partial temp file {}", temp.display());
            removed = true;
        }
        let path = self.path(spec);
        if path.is_file() && !is_valid(&path, spec.format()) {
            std::fs::remove_file(&path).map_err(StoreError::io(&path))?;
            warn!("Removed invalid artifact {}", path.display());
            removed = true;
        }
        Ok(removed)
    }

    /// Reserve the temp location for `spec` so a runner can write it directly.
    pub fn stage(&self, spec: &ArtifactSpec) -> StoreResult<StagedOutput> {
        let dir = self.root.join(spec.dir());
        std::fs::create_dir_all(&dir).map_err(StoreError::io(&dir))?;
        self.cleanup_partial(spec)?;
        Ok(StagedOutput::new(
            spec.clone(),
            self.temp_path(spec),
            self.path(spec),
        ))
    }

    pub fn open_for_write(&self, spec: &ArtifactSpec, schema: SchemaRef) -> StoreResult<ArtifactWriter> {
        let dir = self.root.join(spec.dir());
        std::fs::create_dir_all(&dir).map_err(StoreError::io(&dir))?;
        ArtifactWriter::create(self.temp_path(spec), self.path(spec), schema)
    }

    pub fn open_for_read(&self, spec: &ArtifactSpec) -> StoreResult<ArtifactReader> {
        if self.exists(spec) != ArtifactState::Present {
            return Err(StoreError::NotPresent(spec.id()));
        }
        ArtifactReader::open(&self.path(spec))
    }
}

fn is_valid(path: &Path, format: Format) -> bool {
    let check = match format {
        Format::Parquet => has_parquet_magic(path),
        Format::Json => std::fs::metadata(path).map(|m| m.len() > 0),
        Format::Gzip => gzip_is_complete(path),
        Format::Zip => zip_has_directory(path),
        Format::Other => return true,
    };
    check.unwrap_or(false)
}

/// Decodes every member to the end; a cut stream fails on EOF or its CRC trailer.
fn gzip_is_complete(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut head = [0u8; 2];
    file.read_exact(&mut head)?;
    if &head != GZIP_MAGIC {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(0))?;
    let mut decoder = MultiGzDecoder::new(BufReader::new(file));
    io::copy(&mut decoder, &mut io::sink())?;
    Ok(true)
}

/// The central directory sits at the end of the archive, so truncation loses it.
fn zip_has_directory(path: &Path) -> io::Result<bool> {
    let file = BufReader::new(File::open(path)?);
    Ok(zip::ZipArchive::new(file).is_ok())
}

/// Parquet files start and end with `PAR1`; a truncated write loses the footer.
fn has_parquet_magic(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len < 12 {
        return Ok(false);
    }
    let mut head = [0u8; 4];
    file.read_exact(&mut head)?;
    let mut tail = [0u8; 4];
    file.seek(SeekFrom::End(-4))?;
    file.read_exact(&mut tail)?;
    Ok(&head == PARQUET_MAGIC && &tail == PARQUET_MAGIC)
}

/// Batch iterator over a committed Parquet artifact.
pub struct ArtifactReader {
    path: PathBuf,
    schema: SchemaRef,
    inner: ParquetRecordBatchReader,
}

impl ArtifactReader {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let file = File::open(path).map_err(StoreError::io(path))?;
        let builder =
            ParquetRecordBatchReaderBuilder::try_new(file).map_err(StoreError::parquet(path))?;
        let schema = builder.schema().clone();
        let inner = builder
            .with_batch_size(READ_BATCH_SIZE)
            .build()
            .map_err(StoreError::parquet(path))?;
        Ok(Self {
            path: path.to_path_buf(),
            schema,
            inner,
        })
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Iterator for ArtifactReader {
    type Item = StoreResult<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner
            .next()
            .map(|batch| batch.map_err(StoreError::arrow(&self.path)))
    }
}

/// Serialize `value` as pretty JSON to `path` through a temp file and rename.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> StoreResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(StoreError::io(dir))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("artifact.json");
    let temp = dir.join(temp_file_name(file_name));

    let body = serde_json::to_vec_pretty(value).map_err(StoreError::json(path))?;
    let write = || -> std::io::Result<()> {
        let mut file = File::create(&temp)?;
        file.write_all(&body)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        std::fs::rename(&temp, path)
    };
    if let Err(err) = write() {
        let _ = std::fs::remove_file(&temp);
        return Err(StoreError::Io {
            path: path.to_path_buf(),
            source: err,
        });
    }
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<T> {
    let bytes = std::fs::read(path).map_err(StoreError::io(path))?;
    serde_json::from_slice(&bytes).map_err(StoreError::json(path))
}
