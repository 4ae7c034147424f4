//! Stage runner abstractions.
//!
//! Every stage kind has exactly one runner, dispatched through [`RunnerKind`]:
//! - [`CommandRunner`]: external process (vocabulary mapping, cleaning, scraping)
//! - [`EnrichRunner`]: rate-limited, cached lookups of a key column
//! - [`MergeRunner`]: merge-back chain of joins
//! - `Custom`: any [`StageRunner`] supplied by a library caller

use adeflow_enrich::RateBudget;
use adeflow_store::{ArtifactSpec, ShardSpec, StagedOutputs};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::options::{MergeModeChoice, RunOptions};
use crate::pipeline::Stage;
use crate::{PipelineError, PipelineResult};

mod command;
mod enrich;
mod merge;

pub use command::CommandRunner;
pub use enrich::{EnrichRunner, LOOKUP_STATUS_COLUMN};
pub use merge::{InputCoverage, MergeCoverage, MergeRunner, MergeStep, StepCoverage};

/// Produces a stage's outputs from its inputs.
///
/// Runners write to the staged temp paths in [`StageContext::outputs`]; the
/// orchestrator commits them only after the runner returns `Ok`.
#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn run(&self, ctx: &StageContext<'_>) -> Result<()>;
}

/// The runner of a stage, one variant per stage kind.
#[derive(Clone)]
pub enum RunnerKind {
    Command(CommandRunner),
    Enrich(EnrichRunner),
    Merge(MergeRunner),
    Custom(Arc<dyn StageRunner>),
}

impl RunnerKind {
    pub fn kind(&self) -> &'static str {
        match self {
            RunnerKind::Command(_) => "command",
            RunnerKind::Enrich(_) => "enrich",
            RunnerKind::Merge(_) => "merge",
            RunnerKind::Custom(_) => "custom",
        }
    }

    pub(crate) fn default_shard_aware(&self) -> bool {
        matches!(self, RunnerKind::Enrich(_) | RunnerKind::Merge(_))
    }

    pub async fn run(&self, ctx: &StageContext<'_>) -> Result<()> {
        match self {
            RunnerKind::Command(runner) => runner.run(ctx).await,
            RunnerKind::Enrich(runner) => runner.run(ctx).await,
            RunnerKind::Merge(runner) => runner.run(ctx).await,
            RunnerKind::Custom(runner) => runner.run(ctx).await,
        }
    }
}

impl fmt::Debug for RunnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerKind::Command(runner) => f.debug_tuple("Command").field(runner).finish(),
            RunnerKind::Enrich(runner) => f.debug_tuple("Enrich").field(runner).finish(),
            RunnerKind::Merge(runner) => f.debug_tuple("Merge").field(runner).finish(),
            RunnerKind::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Run-wide settings and shared resources handed to every stage.
#[derive(Debug, Clone)]
pub struct StageEnv {
    pub run_id: String,
    pub data_dir: PathBuf,
    /// `<data_dir>/_cache`
    pub cache_dir: PathBuf,
    /// `<data_dir>/_logs/steps`
    pub step_log_dir: PathBuf,
    pub qps: f64,
    pub max_workers: usize,
    pub shard: ShardSpec,
    pub sample_size: Option<usize>,
    pub demo: bool,
    pub merge_mode: MergeModeChoice,
    pub memory_budget_mb: Option<u64>,
    /// One token bucket for every lookup issued during the run.
    pub budget: Arc<RateBudget>,
}

impl StageEnv {
    pub fn new(run_id: impl Into<String>, options: &RunOptions) -> PipelineResult<Self> {
        if options.max_workers == 0 {
            return Err(PipelineError::InvalidPipeline(
                "max_workers must be at least 1".to_string(),
            ));
        }
        let budget = RateBudget::new(options.qps)
            .map_err(|e| PipelineError::InvalidPipeline(e.to_string()))?;
        Ok(Self {
            run_id: run_id.into(),
            data_dir: options.data_dir.clone(),
            cache_dir: options.data_dir.join("_cache"),
            step_log_dir: options.data_dir.join("_logs").join("steps"),
            qps: options.qps,
            max_workers: options.max_workers,
            shard: options.shard,
            sample_size: options.sample_size,
            demo: options.demo,
            merge_mode: options.merge_mode,
            memory_budget_mb: options.memory_budget_mb,
            budget: Arc::new(budget),
        })
    }
}

/// A declared input, resolved to its on-disk location for this run.
#[derive(Debug, Clone)]
pub struct ResolvedInput {
    pub spec: ArtifactSpec,
    pub path: PathBuf,
}

/// Everything a runner sees while producing one stage.
pub struct StageContext<'a> {
    /// 1-based position in the pipeline.
    pub index: usize,
    pub stage: &'a Stage,
    pub inputs: Vec<ResolvedInput>,
    pub outputs: &'a StagedOutputs,
    pub env: &'a StageEnv,
}

impl<'a> StageContext<'a> {
    pub fn name(&self) -> &str {
        &self.stage.name
    }

    /// Path of input `n` (0-based, declaration order).
    pub fn input(&self, n: usize) -> Result<&Path> {
        self.inputs.get(n).map(|i| i.path.as_path()).ok_or_else(|| {
            anyhow!(
                "stage '{}' declares {} input(s); input {} requested",
                self.name(),
                self.inputs.len(),
                n
            )
        })
    }

    /// Temp path the runner must write output `n` to.
    pub fn output(&self, n: usize) -> Result<&Path> {
        self.outputs.get(n).map(|o| o.temp_path()).ok_or_else(|| {
            anyhow!(
                "stage '{}' declares {} output(s); output {} requested",
                self.name(),
                self.outputs.len(),
                n
            )
        })
    }

    /// The shard this stage filters to; the whole key space unless the stage is shard aware.
    pub fn shard(&self) -> ShardSpec {
        if self.stage.shard_aware {
            self.env.shard
        } else {
            ShardSpec::single()
        }
    }
}
