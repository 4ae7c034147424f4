//! `adeflow status` command - show what a run would do, without running it.

use adeflow::Orchestrator;
use anyhow::Result;
use clap::Args;

use crate::cli::error::HelpfulError;
use crate::cli::output::{artifact_summary, decision_label, print_table_colored};
use crate::cli::PipelineArgs;

/// Arguments for the `status` command
#[derive(Debug, Args)]
pub struct StatusArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn cmd_status(args: StatusArgs) -> Result<()> {
    let (file, options) = args.pipeline.load()?;
    let pipeline = file
        .build()
        .map_err(|err| HelpfulError::from_pipeline(&err))?;
    let status = Orchestrator::status(&pipeline, &options)
        .map_err(|err| HelpfulError::from_pipeline(&err))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!(
        "Pipeline '{}' in {}",
        status.pipeline,
        status.data_dir.display()
    );
    let rows = status
        .stages
        .iter()
        .map(|stage| {
            let (decision, color) = decision_label(&stage.decision);
            vec![
                (stage.index.to_string(), None),
                (stage.name.clone(), None),
                (stage.kind.clone(), None),
                (artifact_summary(&stage.inputs), None),
                (artifact_summary(&stage.outputs), None),
                (decision, Some(color)),
            ]
        })
        .collect();
    print_table_colored(&["#", "STAGE", "KIND", "INPUTS", "OUTPUTS", "NEXT RUN"], rows);
    Ok(())
}
