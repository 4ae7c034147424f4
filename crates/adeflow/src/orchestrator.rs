//! Sequential stage execution with artifact-based skip and resume.
//!
//! For each stage, in order:
//! 1. Every declared input must be present, otherwise the run halts with
//!    [`PipelineError::MissingDependency`]. This check comes before the skip
//!    decision.
//! 2. The stage is skipped when all of its outputs are present and it is not forced.
//! 3. Otherwise its outputs are staged, the runner writes the temp files, and
//!    all outputs are committed together.
//!
//! A run report is written to `<data_dir>/_runs/` whether the run succeeds or halts.

use adeflow_store::{
    write_json_atomic, ArtifactSpec, ArtifactState, ArtifactStore, StagedOutputs,
};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::options::RunOptions;
use crate::pipeline::{Pipeline, Stage};
use crate::report::{
    ArtifactStatus, OutputRecord, RunReport, StageDecision, StagePreview, StageReport,
    StageStatus, StatusReport,
};
use crate::runners::{ResolvedInput, StageContext, StageEnv};
use crate::{PipelineError, PipelineResult};

pub const RUNS_DIR: &str = "_runs";
pub const LATEST_REPORT: &str = "latest.json";

/// Report plus the error that halted the run, if any.
#[derive(Debug)]
pub struct RunOutcome {
    pub report: RunReport,
    pub error: Option<PipelineError>,
}

impl RunOutcome {
    pub fn into_result(self) -> PipelineResult<RunReport> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.report),
        }
    }
}

pub struct Orchestrator;

impl Orchestrator {
    /// Run the pipeline. A halting failure is returned as the error; the
    /// report has already been written to disk by then.
    pub async fn run(pipeline: &Pipeline, options: &RunOptions) -> PipelineResult<RunReport> {
        Self::execute(pipeline, options).await?.into_result()
    }

    /// Run the pipeline and return the report even when a stage halts it.
    ///
    /// `Err` means the pipeline or options were rejected before any stage ran.
    pub async fn execute(pipeline: &Pipeline, options: &RunOptions) -> PipelineResult<RunOutcome> {
        validate(pipeline, options)?;

        let started_at = Utc::now();
        let run_id = options
            .run_id
            .clone()
            .unwrap_or_else(|| new_run_id(started_at));
        let env = StageEnv::new(run_id.clone(), options)?;
        let store = ArtifactStore::new(&options.data_dir);
        let cutoff = options.until_stage.unwrap_or(pipeline.len());

        info!(
            run_id = %run_id,
            pipeline = pipeline.name(),
            stages = pipeline.len(),
            until_stage = cutoff,
            shards = options.shard.shards(),
            shard_id = options.shard.shard_id(),
            demo = options.demo,
            "Starting pipeline run"
        );

        let mut report = RunReport {
            run_id,
            pipeline: pipeline.name().to_string(),
            started_at,
            finished_at: None,
            options: options.summary(),
            stages: Vec::with_capacity(pipeline.len()),
        };
        let mut halt: Option<PipelineError> = None;

        for (position, stage) in pipeline.stages().iter().enumerate() {
            let index = position + 1;
            if halt.is_some() || index > cutoff {
                report.stages.push(stage_report(index, stage, StageStatus::NotReached));
                continue;
            }

            let clock = Instant::now();
            let result = run_stage(pipeline, &store, &env, options, index, stage).await;
            let duration_ms = clock.elapsed().as_millis() as u64;

            let mut entry = stage_report(index, stage, StageStatus::Ran);
            entry.duration_ms = duration_ms;
            match result {
                Ok((status, outputs)) => {
                    entry.status = status;
                    entry.outputs = outputs;
                }
                Err(err) => {
                    entry.status = StageStatus::Failed;
                    entry.error = Some(err.to_string());
                    // Only runner failures of non-critical stages are survivable.
                    let survivable =
                        !stage.critical && matches!(err, PipelineError::StageFailed { .. });
                    if survivable {
                        warn!(
                            stage_index = index,
                            stage = %stage.name,
                            "Non-critical stage failed, continuing: {}",
                            err
                        );
                    } else {
                        error!(stage_index = index, stage = %stage.name, "Halting run: {}", err);
                        halt = Some(err);
                    }
                }
            }
            report.stages.push(entry);
        }

        report.finished_at = Some(Utc::now());
        if let Err(err) = write_report(&options.data_dir, &report) {
            match halt {
                None => halt = Some(err.into()),
                Some(_) => warn!("Failed to write run report: {}", err),
            }
        }

        info!(
            run_id = %report.run_id,
            ran = report.count(StageStatus::Ran),
            skipped = report.count(StageStatus::Skipped),
            failed = report.count(StageStatus::Failed),
            not_reached = report.count(StageStatus::NotReached),
            "Pipeline run finished"
        );
        Ok(RunOutcome {
            report,
            error: halt,
        })
    }

    /// What `run` would do for each stage, without touching any artifact.
    pub fn status(pipeline: &Pipeline, options: &RunOptions) -> PipelineResult<StatusReport> {
        validate(pipeline, options)?;
        let store = ArtifactStore::new(&options.data_dir);
        let shard = options.shard;
        let cutoff = options.until_stage.unwrap_or(pipeline.len());

        let mut planned: HashSet<ArtifactSpec> = HashSet::new();
        let mut blocked = false;
        let mut stages = Vec::with_capacity(pipeline.len());

        for (position, stage) in pipeline.stages().iter().enumerate() {
            let index = position + 1;
            let inputs: Vec<(ArtifactSpec, ArtifactState)> = stage
                .inputs
                .iter()
                .map(|declared| {
                    let spec = pipeline.resolve_input(declared, &shard);
                    let state = store.exists(&spec);
                    (spec, state)
                })
                .collect();
            let outputs: Vec<(ArtifactSpec, ArtifactState)> = stage
                .output_specs(&shard)
                .into_iter()
                .map(|spec| {
                    let state = store.exists(&spec);
                    (spec, state)
                })
                .collect();

            let missing = inputs
                .iter()
                .find(|(spec, state)| *state != ArtifactState::Present && !planned.contains(spec));
            let decision = if blocked || index > cutoff {
                StageDecision::NotReached
            } else if let Some((spec, _)) = missing {
                blocked = true;
                StageDecision::BlockedBy {
                    artifact: spec.id(),
                }
            } else if !options.force.applies_to(&stage.name)
                && outputs.iter().all(|(_, s)| *s == ArtifactState::Present)
            {
                StageDecision::WouldSkip
            } else {
                planned.extend(outputs.iter().map(|(spec, _)| spec.clone()));
                StageDecision::WouldRun
            };

            let describe = |items: Vec<(ArtifactSpec, ArtifactState)>| -> Vec<ArtifactStatus> {
                items
                    .into_iter()
                    .map(|(spec, state)| ArtifactStatus {
                        artifact: spec.id(),
                        state,
                    })
                    .collect()
            };
            stages.push(StagePreview {
                index,
                name: stage.name.clone(),
                kind: stage.runner.kind().to_string(),
                decision,
                inputs: describe(inputs),
                outputs: describe(outputs),
            });
        }

        Ok(StatusReport {
            pipeline: pipeline.name().to_string(),
            data_dir: options.data_dir.clone(),
            stages,
        })
    }
}

fn validate(pipeline: &Pipeline, options: &RunOptions) -> PipelineResult<()> {
    if let Some(until) = options.until_stage {
        if until == 0 || until > pipeline.len() {
            return Err(PipelineError::InvalidPipeline(format!(
                "until_stage {} is out of range (pipeline '{}' has stages 1..={})",
                until,
                pipeline.name(),
                pipeline.len()
            )));
        }
    }
    if let crate::options::ForceMode::Stages(names) = &options.force {
        for name in names {
            if pipeline.index_of(name).is_none() {
                return Err(PipelineError::InvalidPipeline(format!(
                    "--force-stage '{}' does not name a stage of pipeline '{}'",
                    name,
                    pipeline.name()
                )));
            }
        }
    }
    Ok(())
}

async fn run_stage(
    pipeline: &Pipeline,
    store: &ArtifactStore,
    env: &StageEnv,
    options: &RunOptions,
    index: usize,
    stage: &Stage,
) -> PipelineResult<(StageStatus, Vec<OutputRecord>)> {
    let shard = options.shard;

    let mut inputs = Vec::with_capacity(stage.inputs.len());
    for declared in &stage.inputs {
        let spec = pipeline.resolve_input(declared, &shard);
        match store.exists(&spec) {
            ArtifactState::Present => inputs.push(ResolvedInput {
                path: store.path(&spec),
                spec,
            }),
            state => {
                debug!(artifact = %spec, ?state, "Input not present");
                return Err(PipelineError::MissingDependency {
                    stage_index: index,
                    stage: stage.name.clone(),
                    artifact: spec.id(),
                    producer: pipeline.describe_producer(declared),
                });
            }
        }
    }

    let outputs = stage.output_specs(&shard);
    let forced = options.force.applies_to(&stage.name);
    if !forced
        && outputs
            .iter()
            .all(|spec| store.exists(spec) == ArtifactState::Present)
    {
        info!(stage_index = index, stage = %stage.name, "Skipping stage: outputs present");
        let records = output_records(store, &outputs, options.verify_hashes)?;
        return Ok((StageStatus::Skipped, records));
    }

    let mut staged = StagedOutputs::new();
    for spec in &outputs {
        if store.exists(spec) == ArtifactState::Partial {
            debug!(artifact = %spec, "Discarding partial artifact");
        }
        staged.push(store.stage(spec)?);
    }

    info!(
        stage_index = index,
        stage = %stage.name,
        kind = stage.runner.kind(),
        forced,
        "Running stage"
    );
    let result = {
        let ctx = StageContext {
            index,
            stage,
            inputs,
            outputs: &staged,
            env,
        };
        stage.runner.run(&ctx).await
    };
    if let Err(source) = result {
        staged.rollback_all();
        return Err(PipelineError::StageFailed {
            stage_index: index,
            stage: stage.name.clone(),
            source,
        });
    }

    let missing = staged.missing().first().map(|spec| spec.id());
    if let Some(artifact) = missing {
        staged.rollback_all();
        return Err(PipelineError::IncompleteOutput {
            stage_index: index,
            stage: stage.name.clone(),
            artifact,
        });
    }

    staged
        .commit_all()
        .map_err(|source| PipelineError::Commit {
            stage_index: index,
            stage: stage.name.clone(),
            source,
        })?;

    let records = output_records(store, &outputs, options.verify_hashes)?;
    info!(stage_index = index, stage = %stage.name, outputs = records.len(), "Stage complete");
    Ok((StageStatus::Ran, records))
}

fn output_records(
    store: &ArtifactStore,
    outputs: &[ArtifactSpec],
    with_hash: bool,
) -> PipelineResult<Vec<OutputRecord>> {
    outputs
        .iter()
        .map(|spec| {
            Ok(OutputRecord {
                artifact: spec.id(),
                path: store.path(spec),
                fingerprint: Some(store.fingerprint(spec, with_hash)?),
            })
        })
        .collect()
}

fn stage_report(index: usize, stage: &Stage, status: StageStatus) -> StageReport {
    StageReport {
        index,
        name: stage.name.clone(),
        kind: stage.runner.kind().to_string(),
        status,
        duration_ms: 0,
        outputs: Vec::new(),
        error: None,
    }
}

fn new_run_id(started_at: DateTime<Utc>) -> String {
    started_at.format("%Y%m%dT%H%M%S%3fZ").to_string()
}

/// `<data_dir>/_runs/run_<id>.json`, copied to `latest.json`.
pub fn report_path(data_dir: &Path, run_id: &str) -> PathBuf {
    data_dir
        .join(RUNS_DIR)
        .join(format!("run_{}.json", adeflow_logging::sanitize_name(run_id)))
}

fn write_report(data_dir: &Path, report: &RunReport) -> adeflow_store::StoreResult<()> {
    let path = report_path(data_dir, &report.run_id);
    write_json_atomic(&path, report)?;
    write_json_atomic(&data_dir.join(RUNS_DIR).join(LATEST_REPORT), report)?;
    debug!("Wrote run report {}", path.display());
    Ok(())
}
