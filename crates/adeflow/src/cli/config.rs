//! Configuration paths for adeflow
//!
//! Everything user-level lives under `$ADEFLOW_HOME` (default `~/.adeflow`).
//! Pipeline artifacts live under the data directory of each pipeline.

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Args)]
pub struct ConfigArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct ResolvedPaths {
    version: &'static str,
    home: PathBuf,
    logs_dir: PathBuf,
    /// `ADEFLOW_DATA_DIR`, if set
    data_dir: Option<PathBuf>,
    log_filter: String,
}

fn resolve() -> ResolvedPaths {
    ResolvedPaths {
        version: env!("CARGO_PKG_VERSION"),
        home: adeflow_logging::adeflow_home(),
        logs_dir: adeflow_logging::logs_dir(),
        data_dir: std::env::var_os("ADEFLOW_DATA_DIR").map(PathBuf::from),
        log_filter: std::env::var("RUST_LOG")
            .unwrap_or_else(|_| adeflow_logging::DEFAULT_LOG_FILTER.to_string()),
    }
}

pub fn cmd_config(args: ConfigArgs) -> Result<()> {
    let paths = resolve();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&paths)?);
        return Ok(());
    }

    println!("adeflow {}", paths.version);
    println!("  home:       {}", paths.home.display());
    println!("  logs:       {}", paths.logs_dir.display());
    match &paths.data_dir {
        Some(dir) => println!("  data dir:   {} (ADEFLOW_DATA_DIR)", dir.display()),
        None => println!("  data dir:   from [settings].data_dir of each pipeline"),
    }
    println!("  log filter: {}", paths.log_filter);
    Ok(())
}
