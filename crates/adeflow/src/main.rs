//! adeflow command-line entry point
//!
//! - `adeflow run`: execute a pipeline, skipping stages whose outputs exist
//! - `adeflow status`: preview what the next run would do
//! - `adeflow config`: show resolved paths

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::process::ExitCode;

mod cli;

#[derive(Parser, Debug)]
#[command(
    name = "adeflow",
    version,
    about = "Resumable adverse-drug-event pipeline runner"
)]
struct Cli {
    /// Enable verbose logging (debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a pipeline, resuming from the artifacts already on disk
    Run(cli::run::RunArgs),
    /// Show which stages the next run would skip, run or block on
    Status(cli::status::StatusArgs),
    /// Show resolved configuration paths
    Config(cli::config::ConfigArgs),
}

impl Commands {
    fn json(&self) -> bool {
        match self {
            Commands::Run(args) => args.json,
            Commands::Status(args) => args.json,
            Commands::Config(args) => args.json,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let json_mode = cli.command.json();

    if let Err(err) = adeflow_logging::init_logging(adeflow_logging::LogConfig {
        app_name: "adeflow",
        verbose: cli.verbose,
        json_mode,
    }) {
        eprintln!("Warning: Failed to initialize logging: {:#}", err);
    }

    match run_command(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if json_mode {
                cli::error::print_json_error(&err);
            } else if err.downcast_ref::<cli::error::HelpfulError>().is_some() {
                eprintln!("{}", err);
            } else {
                eprintln!("{:?}", err);
            }
            ExitCode::from(cli::error::exit_code(&err))
        }
    }
}

fn run_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to start tokio runtime")?;
            runtime.block_on(cli::run::cmd_run(args))
        }
        Commands::Status(args) => cli::status::cmd_status(args),
        Commands::Config(args) => cli::config::cmd_config(args),
    }
}
