use adeflow_store::{ArtifactState, Fingerprint};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::options::OptionsSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Skipped,
    Ran,
    Failed,
    NotReached,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Skipped => "skipped",
            StageStatus::Ran => "ran",
            StageStatus::Failed => "failed",
            StageStatus::NotReached => "not_reached",
        }
    }
}

/// A committed (or already present) output of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub artifact: String,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub index: usize,
    pub name: String,
    pub kind: String,
    pub status: StageStatus,
    pub duration_ms: u64,
    #[serde(default)]
    pub outputs: Vec<OutputRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Written to `<data_dir>/_runs/run_<id>.json` at the end of every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub pipeline: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub options: OptionsSummary,
    pub stages: Vec<StageReport>,
}

impl RunReport {
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn count(&self, status: StageStatus) -> usize {
        self.stages.iter().filter(|s| s.status == status).count()
    }

    /// No stage failed and none was cut off by a failure.
    pub fn succeeded(&self) -> bool {
        self.count(StageStatus::Failed) == 0
    }
}

/// What `run` would do for a stage, computed without running anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum StageDecision {
    WouldSkip,
    WouldRun,
    BlockedBy { artifact: String },
    NotReached,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactStatus {
    pub artifact: String,
    pub state: ArtifactState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePreview {
    pub index: usize,
    pub name: String,
    pub kind: String,
    #[serde(flatten)]
    pub decision: StageDecision,
    pub inputs: Vec<ArtifactStatus>,
    pub outputs: Vec<ArtifactStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub pipeline: String,
    pub data_dir: PathBuf,
    pub stages: Vec<StagePreview>,
}
