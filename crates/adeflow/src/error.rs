use adeflow_store::StoreError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that stop (or refuse to start) a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("stage {stage_index} '{stage}': missing input {artifact} (produced by {producer})")]
    MissingDependency {
        stage_index: usize,
        stage: String,
        artifact: String,
        producer: String,
    },

    #[error("stage {stage_index} '{stage}': runner finished without writing {artifact}")]
    IncompleteOutput {
        stage_index: usize,
        stage: String,
        artifact: String,
    },

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("failed to read pipeline file {}: {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse pipeline file {}: {source}", path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("stage {stage_index} '{stage}' failed: {source:#}")]
    StageFailed {
        stage_index: usize,
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("stage {stage_index} '{stage}': failed to commit outputs: {source}")]
    Commit {
        stage_index: usize,
        stage: String,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    /// The pipeline definition or run options are unusable; nothing ran.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            PipelineError::InvalidPipeline(_)
                | PipelineError::ConfigRead { .. }
                | PipelineError::ConfigParse { .. }
        )
    }

    /// `(index, name)` of the stage this error belongs to, if any.
    pub fn stage(&self) -> Option<(usize, &str)> {
        match self {
            PipelineError::MissingDependency {
                stage_index, stage, ..
            }
            | PipelineError::IncompleteOutput {
                stage_index, stage, ..
            }
            | PipelineError::StageFailed {
                stage_index, stage, ..
            }
            | PipelineError::Commit {
                stage_index, stage, ..
            } => Some((*stage_index, stage.as_str())),
            _ => None,
        }
    }
}
