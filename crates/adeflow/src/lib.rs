//! Stage orchestration for the adverse-drug-event pipeline.
//!
//! A [`Pipeline`] is an ordered list of [`Stage`]s, each declaring the
//! artifacts it reads and writes. [`Orchestrator::run`] walks the stages in
//! order and skips every stage whose outputs are already present, so an
//! interrupted run resumes where it stopped and a finished run is a no-op.
//!
//! Stages are executed by one of the [`RunnerKind`] variants:
//! - `Command`: an external process with placeholder arguments
//! - `Enrich`: rate-limited lookups through `adeflow_enrich`
//! - `Merge`: a merge-back chain through `adeflow_merge`
//! - `Custom`: any [`StageRunner`] supplied by the caller
//!
//! Pipelines are usually loaded from TOML with [`config::PipelineFile`].

pub mod config;
mod error;
pub mod options;
pub mod orchestrator;
pub mod pipeline;
pub mod report;
pub mod runners;

pub use config::PipelineFile;
pub use error::{PipelineError, PipelineResult};
pub use options::{ForceMode, MergeModeChoice, RunOptions};
pub use orchestrator::{report_path, Orchestrator, RunOutcome};
pub use pipeline::{Pipeline, Stage};
pub use report::{
    ArtifactStatus, OutputRecord, RunReport, StageDecision, StagePreview, StageReport,
    StageStatus, StatusReport,
};
pub use runners::{RunnerKind, StageContext, StageEnv, StageRunner};
