use adeflow_store::ShardSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_QPS: f64 = 4.0;
pub const DEFAULT_MAX_WORKERS: usize = 8;

/// Which stages ignore the "outputs present" skip rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ForceMode {
    #[default]
    None,
    All,
    Stages(BTreeSet<String>),
}

impl ForceMode {
    /// `--force` wins over any number of `--force-stage` flags.
    pub fn from_flags(force: bool, stages: impl IntoIterator<Item = String>) -> Self {
        if force {
            return ForceMode::All;
        }
        let stages: BTreeSet<String> = stages.into_iter().collect();
        if stages.is_empty() {
            ForceMode::None
        } else {
            ForceMode::Stages(stages)
        }
    }

    pub fn applies_to(&self, stage: &str) -> bool {
        match self {
            ForceMode::None => false,
            ForceMode::All => true,
            ForceMode::Stages(stages) => stages.contains(stage),
        }
    }
}

/// How merge stages pick a join strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeModeChoice {
    /// In memory below the size threshold, streaming above it or when memory runs out.
    #[default]
    Auto,
    InMemory,
    Streaming,
}

impl FromStr for MergeModeChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "auto" => Ok(MergeModeChoice::Auto),
            "in-memory" | "memory" => Ok(MergeModeChoice::InMemory),
            "streaming" => Ok(MergeModeChoice::Streaming),
            other => Err(format!(
                "unknown merge mode '{}' (expected auto, in-memory or streaming)",
                other
            )),
        }
    }
}

impl fmt::Display for MergeModeChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MergeModeChoice::Auto => "auto",
            MergeModeChoice::InMemory => "in-memory",
            MergeModeChoice::Streaming => "streaming",
        })
    }
}

/// Everything that can change between two runs of the same pipeline.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub data_dir: PathBuf,
    pub qps: f64,
    pub max_workers: usize,
    pub shard: ShardSpec,
    /// Stop after this 1-based stage index (inclusive).
    pub until_stage: Option<usize>,
    pub force: ForceMode,
    /// Offline run: lookups return deterministic placeholders.
    pub demo: bool,
    /// Cap on input rows read by enrich and merge stages.
    pub sample_size: Option<usize>,
    pub merge_mode: MergeModeChoice,
    pub memory_budget_mb: Option<u64>,
    /// Hash committed outputs with blake3 for the run report.
    pub verify_hashes: bool,
    /// Generated from the start time when unset.
    pub run_id: Option<String>,
}

impl RunOptions {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            qps: DEFAULT_QPS,
            max_workers: DEFAULT_MAX_WORKERS,
            shard: ShardSpec::single(),
            until_stage: None,
            force: ForceMode::None,
            demo: false,
            sample_size: None,
            merge_mode: MergeModeChoice::Auto,
            memory_budget_mb: None,
            verify_hashes: false,
            run_id: None,
        }
    }

    pub fn summary(&self) -> OptionsSummary {
        OptionsSummary {
            data_dir: self.data_dir.clone(),
            qps: self.qps,
            max_workers: self.max_workers,
            shards: self.shard.shards(),
            shard_id: self.shard.shard_id(),
            until_stage: self.until_stage,
            force: match &self.force {
                ForceMode::None => Vec::new(),
                ForceMode::All => vec!["*".to_string()],
                ForceMode::Stages(stages) => stages.iter().cloned().collect(),
            },
            demo: self.demo,
            sample_size: self.sample_size,
            merge_mode: self.merge_mode,
            memory_budget_mb: self.memory_budget_mb,
            verify_hashes: self.verify_hashes,
        }
    }
}

/// Serializable view of [`RunOptions`] recorded in the run report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionsSummary {
    pub data_dir: PathBuf,
    pub qps: f64,
    pub max_workers: usize,
    pub shards: u32,
    pub shard_id: u32,
    pub until_stage: Option<usize>,
    pub force: Vec<String>,
    pub demo: bool,
    pub sample_size: Option<usize>,
    pub merge_mode: MergeModeChoice,
    pub memory_budget_mb: Option<u64>,
    pub verify_hashes: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn force_flag_overrides_stage_list() {
        let force = ForceMode::from_flags(true, vec!["qa".to_string()]);
        assert_eq!(force, ForceMode::All);
        assert!(force.applies_to("parse"));

        let force = ForceMode::from_flags(false, vec!["qa".to_string()]);
        assert!(force.applies_to("qa"));
        assert!(!force.applies_to("parse"));

        assert_eq!(ForceMode::from_flags(false, Vec::new()), ForceMode::None);
    }

    #[test]
    fn merge_mode_parses_cli_spellings() {
        assert_eq!("auto".parse::<MergeModeChoice>().unwrap(), MergeModeChoice::Auto);
        assert_eq!("in_memory".parse::<MergeModeChoice>().unwrap(), MergeModeChoice::InMemory);
        assert_eq!("Streaming".parse::<MergeModeChoice>().unwrap(), MergeModeChoice::Streaming);
        assert!("fast".parse::<MergeModeChoice>().is_err());
        assert_eq!(MergeModeChoice::InMemory.to_string(), "in-memory");
    }
}
