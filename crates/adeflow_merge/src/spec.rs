use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_PARTITIONS: usize = 16;
pub const DEFAULT_RIGHT_SUFFIX: &str = "_right";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    /// Every left row survives; unmatched rows get null right columns.
    #[default]
    LeftOuter,
    Inner,
}

/// Which columns to join on and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSpec {
    pub left_keys: Vec<String>,
    pub right_keys: Vec<String>,
    #[serde(default)]
    pub join_type: JoinType,
    /// Appended to right column names that clash with output names.
    #[serde(default = "default_suffix")]
    pub right_suffix: String,
}

fn default_suffix() -> String {
    DEFAULT_RIGHT_SUFFIX.to_string()
}

impl JoinSpec {
    /// Same key column names on both sides.
    pub fn on<S: Into<String>>(keys: impl IntoIterator<Item = S>) -> Self {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        Self {
            left_keys: keys.clone(),
            right_keys: keys,
            join_type: JoinType::LeftOuter,
            right_suffix: default_suffix(),
        }
    }

    pub fn with_join_type(mut self, join_type: JoinType) -> Self {
        self.join_type = join_type;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeMode {
    /// Hash join over fully materialized inputs. `memory_budget` bounds the
    /// Arrow buffer size of both inputs together.
    InMemory { memory_budget: Option<usize> },
    /// Partitioned join with spill files under `spill_dir` (system temp dir if unset).
    Streaming {
        partitions: usize,
        spill_dir: Option<PathBuf>,
    },
}

impl MergeMode {
    pub fn name(&self) -> &'static str {
        match self {
            MergeMode::InMemory { .. } => "in_memory",
            MergeMode::Streaming { .. } => "streaming",
        }
    }
}

/// Knobs for [`crate::merge_adaptive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdaptivePolicy {
    pub memory_budget: Option<usize>,
    /// Go straight to streaming when the declared input size exceeds this.
    pub in_memory_threshold_bytes: Option<u64>,
    pub partitions: usize,
    pub spill_dir: Option<PathBuf>,
}

impl Default for AdaptivePolicy {
    fn default() -> Self {
        Self {
            memory_budget: None,
            in_memory_threshold_bytes: None,
            partitions: DEFAULT_PARTITIONS,
            spill_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    pub mode: String,
    pub left_rows: u64,
    pub right_rows: u64,
    pub output_rows: u64,
    pub matched_left_rows: u64,
    pub unmatched_left_rows: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partitions: Option<usize>,
}
