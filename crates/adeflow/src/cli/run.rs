//! `adeflow run` command - execute a pipeline, resuming from what is on disk.
//!
//! # Usage
//!
//! ```bash
//! # Offline validation run on a sample
//! adeflow run --pipeline pipelines/faers.toml --demo --sample-size 1000
//!
//! # Shard 2 of 4, stopping after the merge-back stage
//! adeflow run -p pipelines/faers.toml --shards 4 --shard-id 2 --until-stage 7
//!
//! # Rebuild one stage
//! adeflow run -p pipelines/faers.toml --force-stage drug_enrich
//! ```

use adeflow::{
    report_path, ForceMode, MergeModeChoice, Orchestrator, RunReport, StageStatus,
};
use anyhow::Result;
use clap::Args;
use tracing::info;

use crate::cli::error::{HelpfulError, EXIT_CONFIG};
use crate::cli::output::{format_duration_ms, print_table_colored, status_color};
use crate::cli::PipelineArgs;

/// Arguments for the `run` command
#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,

    /// Lookup rate limit, calls per second across all workers
    #[arg(long)]
    pub qps: Option<f64>,

    /// Concurrent lookup workers
    #[arg(long)]
    pub max_workers: Option<usize>,

    /// Stop after this 1-based stage index
    #[arg(long)]
    pub until_stage: Option<usize>,

    /// Rerun every stage even if its outputs exist
    #[arg(long)]
    pub force: bool,

    /// Rerun the named stage even if its outputs exist (repeatable)
    #[arg(long = "force-stage", value_name = "NAME")]
    pub force_stage: Vec<String>,

    /// Offline mode: lookups return deterministic placeholders
    #[arg(long)]
    pub demo: bool,

    /// Cap on input rows read by enrich and merge stages
    #[arg(long)]
    pub sample_size: Option<usize>,

    /// Join strategy: auto, in-memory or streaming
    #[arg(long)]
    pub merge_mode: Option<MergeModeChoice>,

    /// Memory budget for in-memory merges, in MiB
    #[arg(long)]
    pub memory_budget_mb: Option<u64>,

    /// Record blake3 content hashes of committed outputs
    #[arg(long)]
    pub verify_hashes: bool,

    /// Output the run report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Execute the run command
pub async fn cmd_run(args: RunArgs) -> Result<()> {
    let (file, mut options) = args.pipeline.load()?;
    if let Some(qps) = args.qps {
        options.qps = qps;
    }
    if let Some(workers) = args.max_workers {
        options.max_workers = workers;
    }
    if let Some(mode) = args.merge_mode {
        options.merge_mode = mode;
    }
    if args.sample_size.is_some() {
        options.sample_size = args.sample_size;
    }
    if args.memory_budget_mb.is_some() {
        options.memory_budget_mb = args.memory_budget_mb;
    }
    options.until_stage = args.until_stage;
    options.force = ForceMode::from_flags(args.force, args.force_stage);
    options.demo = args.demo;
    options.verify_hashes = args.verify_hashes;

    let pipeline = file
        .build()
        .map_err(|err| HelpfulError::from_pipeline(&err))?;
    info!(
        pipeline = pipeline.name(),
        data_dir = %options.data_dir.display(),
        "Loaded pipeline from {}",
        args.pipeline.pipeline.display()
    );

    let outcome = Orchestrator::execute(&pipeline, &options)
        .await
        .map_err(|err| HelpfulError::from_pipeline(&err).with_exit_code(EXIT_CONFIG))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome.report)?);
    } else {
        print_report(&outcome.report);
        println!(
            "Report: {}",
            report_path(&options.data_dir, &outcome.report.run_id).display()
        );
    }

    if let Some(err) = outcome.error {
        return Err(HelpfulError::from_pipeline(&err).into());
    }
    let failed: Vec<String> = outcome
        .report
        .stages
        .iter()
        .filter(|s| s.status == StageStatus::Failed)
        .map(|s| format!("{} '{}'", s.index, s.name))
        .collect();
    if !failed.is_empty() {
        return Err(HelpfulError::new(format!(
            "{} non-critical stage(s) failed: {}",
            failed.len(),
            failed.join(", ")
        ))
        .with_context("Later stages ran, but outputs of the failed stages are missing")
        .with_suggestion("TRY: Rerun the pipeline; present outputs are skipped")
        .into());
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    let rows = report
        .stages
        .iter()
        .map(|stage| {
            vec![
                (stage.index.to_string(), None),
                (stage.name.clone(), None),
                (stage.kind.clone(), None),
                (stage.status.as_str().to_string(), Some(status_color(stage.status))),
                (format_duration_ms(stage.duration_ms), None),
                (
                    stage.error.clone().unwrap_or_else(|| {
                        stage
                            .outputs
                            .iter()
                            .map(|o| o.artifact.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    }),
                    None,
                ),
            ]
        })
        .collect();
    print_table_colored(&["#", "STAGE", "KIND", "STATUS", "TIME", "DETAIL"], rows);
    println!(
        "Run {}: {} ran, {} skipped, {} failed, {} not reached",
        report.run_id,
        report.count(StageStatus::Ran),
        report.count(StageStatus::Skipped),
        report.count(StageStatus::Failed),
        report.count(StageStatus::NotReached),
    );
}
