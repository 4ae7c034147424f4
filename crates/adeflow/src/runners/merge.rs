use adeflow_merge::{
    distinct_keys, merge, merge_adaptive, output_schema, AdaptivePolicy, BatchSource, JoinSpec,
    MergeMode, MergeStats, ParquetSource, SourceFilter,
};
use adeflow_store::BatchFileWriter;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{StageContext, StageRunner};
use crate::options::MergeModeChoice;

const MIB: u64 = 1024 * 1024;
const DEFAULT_IN_MEMORY_THRESHOLD_MB: u64 = 512;

/// One join of the merge-back chain. Step `i` joins the running result with input `i + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeStep {
    pub join: JoinSpec,
}

/// Merge-back chain: input 0 is the left side, joined successively with each
/// further input. Output 0 is the merged Parquet artifact; output 1, when
/// declared, receives [`MergeCoverage`] as JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRunner {
    pub steps: Vec<MergeStep>,
    /// Left column used for the shard filter; the first join key when unset.
    pub shard_key: Option<String>,
    /// `auto` mode goes straight to streaming above this combined input size.
    pub in_memory_threshold_mb: u64,
    pub partitions: usize,
}

impl MergeRunner {
    pub fn new(steps: Vec<JoinSpec>) -> Self {
        Self {
            steps: steps.into_iter().map(|join| MergeStep { join }).collect(),
            shard_key: None,
            in_memory_threshold_mb: DEFAULT_IN_MEMORY_THRESHOLD_MB,
            partitions: adeflow_merge::AdaptivePolicy::default().partitions,
        }
    }

    pub fn shard_key(mut self, column: impl Into<String>) -> Self {
        self.shard_key = Some(column.into());
        self
    }

    pub fn in_memory_threshold_mb(mut self, mb: u64) -> Self {
        self.in_memory_threshold_mb = mb;
        self
    }

    pub fn partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions;
        self
    }

    fn shard_column(&self) -> Option<String> {
        self.shard_key.clone().or_else(|| {
            self.steps
                .first()
                .and_then(|s| s.join.left_keys.first().cloned())
        })
    }
}

/// Row accounting for a merge-back run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeCoverage {
    /// Left rows after the shard filter and sample cap.
    pub left_rows: u64,
    pub rows_written: u64,
    /// Every input in declaration order. The left count is taken after filtering.
    pub inputs: Vec<InputCoverage>,
    /// Artifact ids the stage writes.
    pub outputs: Vec<String>,
    pub steps: Vec<StepCoverage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputCoverage {
    pub artifact: String,
    pub rows: u64,
}

/// One join step. Key counts are distinct non-null key tuples.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCoverage {
    pub right_input: String,
    /// Left keys going into the step.
    pub left_keys_before: u64,
    pub right_keys: u64,
    /// Left keys still present in the step output.
    pub left_keys_after: u64,
    #[serde(flatten)]
    pub stats: MergeStats,
}

/// Everything the blocking merge needs, detached from the stage context.
struct MergePlan {
    left: (String, PathBuf),
    rights: Vec<(String, PathBuf)>,
    output: PathBuf,
    output_ids: Vec<String>,
    filter: SourceFilter,
    choice: MergeModeChoice,
    policy: AdaptivePolicy,
}

#[async_trait]
impl StageRunner for MergeRunner {
    async fn run(&self, ctx: &StageContext<'_>) -> Result<()> {
        if self.steps.is_empty() {
            bail!("merge stage '{}' has no join steps", ctx.name());
        }
        if ctx.inputs.len() != self.steps.len() + 1 {
            bail!(
                "merge stage '{}' declares {} input(s) for {} join step(s); expected {}",
                ctx.name(),
                ctx.inputs.len(),
                self.steps.len(),
                self.steps.len() + 1
            );
        }

        let shard = ctx.shard();
        let shard_filter = match (shard.is_sharded(), self.shard_column()) {
            (true, Some(column)) => Some((column, shard)),
            (true, None) => bail!("merge stage '{}' needs a shard key", ctx.name()),
            (false, _) => None,
        };
        let plan = MergePlan {
            left: (ctx.inputs[0].spec.id(), ctx.input(0)?.to_path_buf()),
            rights: ctx.inputs[1..]
                .iter()
                .map(|i| (i.spec.id(), i.path.clone()))
                .collect(),
            output: ctx.output(0)?.to_path_buf(),
            output_ids: ctx.stage.outputs.iter().map(|o| o.id()).collect(),
            filter: SourceFilter {
                shard: shard_filter,
                limit: ctx.env.sample_size,
            },
            choice: ctx.env.merge_mode,
            policy: AdaptivePolicy {
                memory_budget: ctx
                    .env
                    .memory_budget_mb
                    .map(|mb| (mb * MIB) as usize),
                in_memory_threshold_bytes: Some(self.in_memory_threshold_mb * MIB),
                partitions: self.partitions.max(1),
                spill_dir: None,
            },
        };
        let coverage_path = ctx.outputs.get(1).map(|o| o.temp_path().to_path_buf());

        let steps = self.steps.clone();
        let coverage = tokio::task::spawn_blocking(move || run_chain(&plan, &steps))
            .await
            .context("Merge task panicked")??;

        info!(
            stage = ctx.name(),
            left_rows = coverage.left_rows,
            rows_written = coverage.rows_written,
            "Merge-back complete"
        );
        if let Some(path) = coverage_path {
            let body = serde_json::to_vec_pretty(&coverage)?;
            std::fs::write(&path, body)
                .with_context(|| format!("Failed to write coverage: {}", path.display()))?;
        }
        Ok(())
    }
}

fn run_chain(plan: &MergePlan, steps: &[MergeStep]) -> Result<MergeCoverage> {
    let scratch = tempfile::Builder::new()
        .prefix("adeflow-chain-")
        .tempdir()
        .context("Failed to create merge scratch directory")?;

    let (left_id, left_path) = &plan.left;
    let mut coverage = MergeCoverage {
        outputs: plan.output_ids.clone(),
        ..Default::default()
    };
    let mut left = ParquetSource::open(left_path)
        .with_context(|| format!("Failed to open {}", left_path.display()))?
        .with_filter(plan.filter.clone());

    for (n, (step, (right_id, right_path))) in steps.iter().zip(&plan.rights).enumerate() {
        let right = ParquetSource::open(right_path)
            .with_context(|| format!("Failed to open {}", right_path.display()))?;
        let last = n + 1 == steps.len();
        let target = if last {
            plan.output.clone()
        } else {
            scratch.path().join(format!("step_{}.parquet", n))
        };

        let schema = output_schema(&left.schema(), &right.schema(), &step.join)
            .with_context(|| format!("Join step {} with {} is invalid", n + 1, right_id))?;
        let left_keys_before = distinct_keys(&left, &step.join.left_keys, "left")?;
        let right_keys = distinct_keys(&right, &step.join.right_keys, "right")?;
        let mut sink = BatchFileWriter::create(&target, schema)?;
        let stats = join_step(&left, &right, &step.join, plan, &mut sink)
            .with_context(|| format!("Join step {} with {} failed", n + 1, right_id))?;
        let rows = sink.close()?;
        let merged = ParquetSource::open(&target)?;
        let left_keys_after = distinct_keys(&merged, &step.join.left_keys, "merged")?;
        debug!(
            step = n + 1,
            right = %right_id,
            rows,
            left_keys_before,
            left_keys_after,
            mode = %stats.mode,
            "Join step complete"
        );

        if n == 0 {
            coverage.left_rows = stats.left_rows;
            coverage.inputs.push(InputCoverage {
                artifact: left_id.clone(),
                rows: stats.left_rows,
            });
        }
        coverage.inputs.push(InputCoverage {
            artifact: right_id.clone(),
            rows: stats.right_rows,
        });
        coverage.rows_written = rows;
        coverage.steps.push(StepCoverage {
            right_input: right_id.clone(),
            left_keys_before,
            right_keys,
            left_keys_after,
            stats,
        });
        if !last {
            left = merged;
        }
    }
    Ok(coverage)
}

fn join_step(
    left: &dyn BatchSource,
    right: &dyn BatchSource,
    join: &JoinSpec,
    plan: &MergePlan,
    sink: &mut BatchFileWriter,
) -> Result<MergeStats> {
    let stats = match plan.choice {
        MergeModeChoice::Auto => merge_adaptive(left, right, join, &plan.policy, sink)?,
        MergeModeChoice::InMemory => merge(
            left,
            right,
            join,
            &MergeMode::InMemory {
                memory_budget: plan.policy.memory_budget,
            },
            sink,
        )?,
        MergeModeChoice::Streaming => merge(
            left,
            right,
            join,
            &MergeMode::Streaming {
                partitions: plan.policy.partitions,
                spill_dir: plan.policy.spill_dir.clone(),
            },
            sink,
        )?,
    };
    Ok(stats)
}
