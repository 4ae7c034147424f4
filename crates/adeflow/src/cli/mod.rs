//! CLI module for adeflow
//!
//! `run` executes a pipeline, `status` previews what a run would do and
//! `config` prints resolved paths.

pub mod config;
pub mod error;
pub mod output;
pub mod run;
pub mod status;

use adeflow::{PipelineFile, RunOptions};
use adeflow_store::ShardSpec;
use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

use crate::cli::error::HelpfulError;

/// Arguments shared by commands that load a pipeline.
#[derive(Debug, Args)]
pub struct PipelineArgs {
    /// Path to the pipeline TOML file
    #[arg(long, short = 'p', value_name = "TOML")]
    pub pipeline: PathBuf,

    /// Root directory for artifacts (overrides [settings].data_dir)
    #[arg(long, env = "ADEFLOW_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Total number of shards
    #[arg(long, default_value_t = 1)]
    pub shards: u32,

    /// Zero-based shard handled by this process
    #[arg(long, default_value_t = 0)]
    pub shard_id: u32,
}

impl PipelineArgs {
    /// Load the pipeline file and seed run options from its `[settings]`.
    pub fn load(&self) -> Result<(PipelineFile, RunOptions)> {
        if !self.pipeline.exists() {
            return Err(HelpfulError::pipeline_not_found(&self.pipeline).into());
        }
        let file = PipelineFile::load(&self.pipeline)
            .map_err(|err| HelpfulError::from_pipeline(&err))?;

        let mut options = file.run_options();
        if let Some(dir) = &self.data_dir {
            options.data_dir = dir.clone();
        }
        options.shard = ShardSpec::new(self.shards, self.shard_id)
            .map_err(|_| HelpfulError::invalid_shard(self.shards, self.shard_id))?;
        Ok((file, options))
    }
}
