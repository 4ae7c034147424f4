//! Logging for the adeflow binary and its stage runners.
//!
//! Two sinks:
//! - the process log, a size-rotated file under `~/.adeflow/logs` plus stderr,
//!   installed once by [`init_logging`];
//! - step logs, one file per stage execution under `<data_dir>/_logs/steps`,
//!   holding the captured output of external commands ([`StepLog`]).

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const DEFAULT_LOG_FILTER: &str =
    "adeflow=info,adeflow_enrich=info,adeflow_merge=info,adeflow_store=info";
const KEEP_GENERATIONS: usize = 5;
const GENERATION_BYTES: u64 = 10 * 1024 * 1024;

/// Logging configuration for a single process.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
    /// Machine-readable stdout; keep stderr down to warnings.
    pub json_mode: bool,
}

/// Initialize tracing with a rotating file under [`logs_dir`] and stderr output.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    init_logging_in(&dir, config)
}

/// Same as [`init_logging`] but rotates the file under `log_dir`.
pub fn init_logging_in(log_dir: &Path, config: LogConfig<'_>) -> Result<()> {
    let file = RotatingLog::open(log_dir, config.app_name, KEEP_GENERATIONS, GENERATION_BYTES)
        .with_context(|| format!("Failed to open process log in {}", log_dir.display()))?;

    let env_or = |fallback: &str| {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
    };
    let console_filter = match (config.verbose, config.json_mode) {
        (true, _) => env_or(&DEFAULT_LOG_FILTER.replace("=info", "=debug")),
        (false, true) => EnvFilter::new("warn"),
        (false, false) => env_or(DEFAULT_LOG_FILTER),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file)
                .with_ansi(false)
                .with_filter(env_or(DEFAULT_LOG_FILTER)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_target(false)
                .with_filter(console_filter),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(())
}

/// `$ADEFLOW_HOME`, or `~/.adeflow`.
pub fn adeflow_home() -> PathBuf {
    match std::env::var_os("ADEFLOW_HOME") {
        Some(home) => PathBuf::from(home),
        None => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".adeflow"),
    }
}

pub fn logs_dir() -> PathBuf {
    adeflow_home().join("logs")
}

pub fn ensure_logs_dir() -> Result<PathBuf> {
    let dir = logs_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create logs directory: {}", dir.display()))?;
    Ok(dir)
}

/// Replace anything that is not `[A-Za-z0-9_-]` so names can be used in file names.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => ch,
            _ => '_',
        })
        .collect()
}

/// Size-rotated log file shared by every tracing event.
///
/// The live file is `<stem>.log`; older generations are `<stem>.1.log`
/// (newest) up to `<stem>.<keep-1>.log`, beyond which they are deleted.
#[derive(Clone)]
struct RotatingLog {
    state: Arc<Mutex<Generation>>,
}

struct Generation {
    dir: PathBuf,
    stem: String,
    keep: usize,
    limit: u64,
    file: File,
    written: u64,
}

impl RotatingLog {
    fn open(dir: &Path, app_name: &str, keep: usize, limit: u64) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let stem = sanitize_name(app_name);
        let live = dir.join(format!("{}.log", stem));
        let file = append(&live)?;
        let written = file.metadata()?.len();
        let mut generation = Generation {
            dir: dir.to_path_buf(),
            stem,
            keep: keep.max(1),
            limit,
            file,
            written,
        };
        if generation.written >= generation.limit {
            generation.rotate()?;
        }
        Ok(Self {
            state: Arc::new(Mutex::new(generation)),
        })
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut Generation) -> io::Result<T>) -> io::Result<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "process log lock poisoned"))?;
        f(&mut state)
    }
}

impl Generation {
    fn path(&self, generation: usize) -> PathBuf {
        if generation == 0 {
            self.dir.join(format!("{}.log", self.stem))
        } else {
            self.dir.join(format!("{}.{}.log", self.stem, generation))
        }
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        let oldest = self.keep - 1;
        ignore_missing(fs::remove_file(self.path(oldest)))?;
        for generation in (0..oldest).rev() {
            ignore_missing(fs::rename(self.path(generation), self.path(generation + 1)))?;
        }
        self.file = append(&self.path(0))?;
        self.written = 0;
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.limit {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }
}

fn append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn ignore_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RotatingLog {
    type Writer = RotatingLog;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl Write for RotatingLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with_state(|state| state.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with_state(|state| state.file.flush())
    }
}

/// Captured output of one stage execution.
///
/// Lines are prefixed with the stream they came from:
///
/// ```text
/// [stdout] parsed 120394 rows
/// [stderr] warning: 3 rows without primaryid
/// ```
pub struct StepLog {
    path: PathBuf,
    out: BufWriter<File>,
}

impl StepLog {
    /// `<step_dir>/<run_id>_<stage>.log`
    pub fn path_for(step_dir: &Path, run_id: &str, stage: &str) -> PathBuf {
        step_dir.join(format!(
            "{}_{}.log",
            sanitize_name(run_id),
            sanitize_name(stage)
        ))
    }

    /// Create (or truncate) the step log, creating `step_dir` as needed.
    pub fn create(step_dir: &Path, run_id: &str, stage: &str) -> Result<Self> {
        fs::create_dir_all(step_dir).with_context(|| {
            format!("Failed to create step log directory: {}", step_dir.display())
        })?;
        let path = Self::path_for(step_dir, run_id, stage);
        let file = File::create(&path)
            .with_context(|| format!("Failed to create step log: {}", path.display()))?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn line(&mut self, stream: &str, text: &str) -> Result<()> {
        writeln!(self.out, "[{}] {}", stream, text)
            .with_context(|| format!("Failed to write step log: {}", self.path.display()))
    }

    pub fn finish(mut self) -> Result<PathBuf> {
        self.out
            .flush()
            .with_context(|| format!("Failed to write step log: {}", self.path.display()))?;
        Ok(self.path)
    }
}
