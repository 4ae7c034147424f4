//! User-facing errors for `adeflow` commands.
//!
//! A [`HelpfulError`] carries the failure, the situation it happened in, and
//! `TRY:` lines the user can run next. It also decides the process exit code.

use adeflow::PipelineError;
use serde::Serialize;
use std::fmt;
use std::path::Path;

/// Exit code for a run that failed or halted at a stage.
pub const EXIT_FAILURE: u8 = 1;
/// Exit code for an unusable pipeline file or option set.
pub const EXIT_CONFIG: u8 = 2;

#[derive(Debug)]
pub struct HelpfulError {
    pub message: String,
    pub context: Option<String>,
    /// Printed verbatim, one per line; by convention each starts with `TRY:`.
    pub suggestions: Vec<String>,
    pub exit_code: u8,
}

impl HelpfulError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: None,
            suggestions: Vec::new(),
            exit_code: EXIT_FAILURE,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_suggestions(
        mut self,
        suggestions: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.suggestions
            .extend(suggestions.into_iter().map(|s| s.into()));
        self
    }

    pub fn with_exit_code(mut self, code: u8) -> Self {
        self.exit_code = code;
        self
    }

    pub fn pipeline_not_found(path: &Path) -> Self {
        Self::new(format!("Pipeline file not found: {}", path.display()))
            .with_context("The --pipeline argument must point to a TOML pipeline definition")
            .with_suggestions([
                format!("TRY: Check that the file exists: ls -la {}", path.display()),
                "TRY: Use the bundled catalogue: adeflow run --pipeline pipelines/faers.toml"
                    .to_string(),
            ])
            .with_exit_code(EXIT_CONFIG)
    }

    pub fn invalid_shard(shards: u32, shard_id: u32) -> Self {
        Self::new(format!("Invalid shard {} of {}", shard_id, shards))
            .with_context("Shard ids are zero-based and must be below --shards")
            .with_suggestion(format!(
                "TRY: Use --shards {} --shard-id 0..{}",
                shards.max(1),
                shards.max(1) - 1
            ))
            .with_exit_code(EXIT_CONFIG)
    }

    /// Translate an orchestrator error into something a user can act on.
    pub fn from_pipeline(err: &PipelineError) -> Self {
        let base = Self::new(err.to_string());
        match err {
            PipelineError::MissingDependency {
                artifact, producer, ..
            } => base
                .with_context(format!("'{}' is produced by {}", artifact, producer))
                .with_suggestions([
                    "TRY: Rerun without --until-stage so the producing stage runs first"
                        .to_string(),
                    "TRY: For external inputs, place the file under the data directory"
                        .to_string(),
                ]),
            PipelineError::IncompleteOutput { stage, .. } => base
                .with_context("The stage exited successfully but did not write every declared output")
                .with_suggestion(format!(
                    "TRY: Check the step log under _logs/steps/ for stage '{}'",
                    stage
                )),
            PipelineError::StageFailed { stage, .. } => base
                .with_context("Nothing was committed for the failed stage")
                .with_suggestions([
                    format!("TRY: Inspect the step log under _logs/steps/ for stage '{}'", stage),
                    format!("TRY: Rerun just this stage: --force-stage {}", stage),
                ]),
            PipelineError::Commit { .. } | PipelineError::Store(_) => base
                .with_context("The artifact store could not be updated")
                .with_suggestion("TRY: Check free disk space and permissions of the data directory"),
            PipelineError::InvalidPipeline(_)
            | PipelineError::ConfigRead { .. }
            | PipelineError::ConfigParse { .. } => base
                .with_context("The pipeline definition or run options were rejected; nothing ran")
                .with_suggestion("TRY: Preview the plan first: adeflow status --pipeline <toml>")
                .with_exit_code(EXIT_CONFIG),
        }
    }
}

impl fmt::Display for HelpfulError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ERROR: {}", self.message)?;
        if let Some(context) = &self.context {
            write!(f, "\nCONTEXT: {}\n", context)?;
        }
        if !self.suggestions.is_empty() {
            write!(f, "\n{}\n", self.suggestions.join("\n"))?;
        }
        Ok(())
    }
}

impl std::error::Error for HelpfulError {}

#[derive(Serialize)]
struct JsonError<'a> {
    error: &'a str,
    context: Option<&'a str>,
    suggestions: &'a [String],
    exit_code: u8,
}

/// Exit code carried by the error, [`EXIT_FAILURE`] for anything unstructured.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<HelpfulError>() {
        Some(helpful) => helpful.exit_code,
        None => match err.downcast_ref::<PipelineError>() {
            Some(pipeline) if pipeline.is_config_error() => EXIT_CONFIG,
            _ => EXIT_FAILURE,
        },
    }
}

/// Print an error as a JSON object on stdout.
pub fn print_json_error(err: &anyhow::Error) {
    let message = format!("{:#}", err);
    let payload = match err.downcast_ref::<HelpfulError>() {
        Some(helpful) => JsonError {
            error: &helpful.message,
            context: helpful.context.as_deref(),
            suggestions: &helpful.suggestions,
            exit_code: helpful.exit_code,
        },
        None => JsonError {
            error: &message,
            context: None,
            suggestions: &[],
            exit_code: exit_code(err),
        },
    };
    match serde_json::to_string_pretty(&payload) {
        Ok(json) => println!("{}", json),
        Err(_) => eprintln!("{}", message),
    }
}
