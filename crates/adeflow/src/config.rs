//! TOML pipeline definitions.
//!
//! ```toml
//! [settings]
//! name = "faers"
//! data_dir = "data"
//! qps = 4.0
//!
//! [[stages]]
//! name = "parse"
//! kind = "command"
//! inputs = ["raw/faers_ascii.zip"]
//! outputs = ["demo.parquet", "drug.parquet"]
//!
//! [stages.command]
//! program = "python3"
//! args = ["scripts/parse.py", "{input:0}", "{output:0}", "{output:1}"]
//! ```
//!
//! Relative paths (`data_dir`, `working_dir`) resolve against the directory of
//! the pipeline file. Command stages run in that directory unless told otherwise.

use adeflow_enrich::RetryPolicy;
use adeflow_merge::{JoinSpec, JoinType, DEFAULT_RIGHT_SUFFIX};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::options::{MergeModeChoice, RunOptions};
use crate::pipeline::{Pipeline, Stage};
use crate::runners::{CommandRunner, EnrichRunner, MergeRunner, RunnerKind};
use crate::{PipelineError, PipelineResult};

/// Run defaults from `[settings]`; command-line flags override them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub qps: Option<f64>,
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub merge_mode: Option<MergeModeChoice>,
    #[serde(default)]
    pub memory_budget_mb: Option<u64>,
    #[serde(default)]
    pub sample_size: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Command,
    Enrich,
    Merge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    pub kind: StageKind,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default = "default_critical")]
    pub critical: bool,
    /// Defaults to true for enrich and merge stages.
    #[serde(default)]
    pub shard_aware: Option<bool>,
    #[serde(default)]
    pub command: Option<CommandConfig>,
    #[serde(default)]
    pub enrich: Option<EnrichStageConfig>,
    #[serde(default)]
    pub merge: Option<MergeStageConfig>,
}

fn default_critical() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichStageConfig {
    pub key_column: String,
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub id_field: Option<String>,
    #[serde(default)]
    pub fields: Option<Vec<String>>,
    /// Resolve found ids to their ingredient (`inn`, `ingredient_rxcui`).
    #[serde(default)]
    pub ingredients: bool,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

fn default_backend() -> String {
    "rxnav".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStageConfig {
    pub steps: Vec<JoinStepConfig>,
    #[serde(default)]
    pub shard_key: Option<String>,
    #[serde(default)]
    pub in_memory_threshold_mb: Option<u64>,
    #[serde(default)]
    pub partitions: Option<usize>,
}

/// Either `on` (same names both sides) or `left_keys` + `right_keys`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinStepConfig {
    #[serde(default)]
    pub on: Option<Vec<String>>,
    #[serde(default)]
    pub left_keys: Option<Vec<String>>,
    #[serde(default)]
    pub right_keys: Option<Vec<String>>,
    #[serde(default)]
    pub join_type: JoinType,
    #[serde(default)]
    pub right_suffix: Option<String>,
}

impl JoinStepConfig {
    fn to_join_spec(&self, stage: &str, step: usize) -> PipelineResult<JoinSpec> {
        let invalid = |msg: &str| {
            PipelineError::InvalidPipeline(format!("stage '{}' step {}: {}", stage, step, msg))
        };
        let (left_keys, right_keys) = match (&self.on, &self.left_keys, &self.right_keys) {
            (Some(on), None, None) => (on.clone(), on.clone()),
            (None, Some(left), Some(right)) => (left.clone(), right.clone()),
            (None, Some(left), None) => (left.clone(), left.clone()),
            _ => return Err(invalid("set either 'on' or 'left_keys'/'right_keys'")),
        };
        if left_keys.is_empty() || left_keys.len() != right_keys.len() {
            return Err(invalid("join keys must be non-empty and of equal arity"));
        }
        Ok(JoinSpec {
            left_keys,
            right_keys,
            join_type: self.join_type,
            right_suffix: self
                .right_suffix
                .clone()
                .unwrap_or_else(|| DEFAULT_RIGHT_SUFFIX.to_string()),
        })
    }
}

/// A parsed pipeline file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineFile {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
    /// Directory relative paths resolve against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl PipelineFile {
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| PipelineError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let mut file: PipelineFile =
            toml::from_str(&content).map_err(|source| PipelineError::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?;
        file.base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        if file.settings.name.is_none() {
            file.settings.name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(str::to_string);
        }
        Ok(file)
    }

    pub fn name(&self) -> &str {
        self.settings.name.as_deref().unwrap_or("pipeline")
    }

    /// `settings.data_dir` resolved against the file's directory, or `<base>/data`.
    pub fn data_dir(&self) -> PathBuf {
        match &self.settings.data_dir {
            Some(dir) => self.resolve(dir),
            None => self.base_dir.join("data"),
        }
    }

    /// Run options seeded from `[settings]`.
    pub fn run_options(&self) -> RunOptions {
        let mut options = RunOptions::new(self.data_dir());
        if let Some(qps) = self.settings.qps {
            options.qps = qps;
        }
        if let Some(workers) = self.settings.max_workers {
            options.max_workers = workers;
        }
        if let Some(mode) = self.settings.merge_mode {
            options.merge_mode = mode;
        }
        options.memory_budget_mb = self.settings.memory_budget_mb;
        options.sample_size = self.settings.sample_size;
        options
    }

    pub fn build(&self) -> PipelineResult<Pipeline> {
        let stages = self
            .stages
            .iter()
            .map(|config| self.build_stage(config))
            .collect::<PipelineResult<Vec<_>>>()?;
        Pipeline::new(self.name(), stages)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    fn build_stage(&self, config: &StageConfig) -> PipelineResult<Stage> {
        let invalid = |msg: String| {
            PipelineError::InvalidPipeline(format!("stage '{}': {}", config.name, msg))
        };
        let missing_table = |table: &str| {
            invalid(format!(
                "kind = \"{}\" requires a [stages.{}] table",
                table, table
            ))
        };

        let runner = match config.kind {
            StageKind::Command => {
                let command = config.command.as_ref().ok_or_else(|| missing_table("command"))?;
                let working_dir = command
                    .working_dir
                    .as_deref()
                    .map(|dir| self.resolve(dir))
                    .unwrap_or_else(|| self.base_dir.clone());
                let mut runner = CommandRunner::new(command.program.clone())
                    .args(command.args.iter().cloned())
                    .working_dir(working_dir);
                runner.env = command.env.clone();
                RunnerKind::Command(runner)
            }
            StageKind::Enrich => {
                let enrich = config.enrich.as_ref().ok_or_else(|| missing_table("enrich"))?;
                if enrich.backend != "rxnav" {
                    return Err(invalid(format!(
                        "unknown enrich backend '{}' (supported: rxnav)",
                        enrich.backend
                    )));
                }
                if config.inputs.len() != 1 || config.outputs.len() != 1 {
                    return Err(invalid(
                        "enrich stages take exactly one input and one output".to_string(),
                    ));
                }
                let mut runner = EnrichRunner::rxnav(enrich.key_column.clone());
                if let Some(url) = &enrich.base_url {
                    runner = runner.base_url(url.clone());
                }
                if let Some(field) = &enrich.id_field {
                    runner = runner.id_field(field.clone());
                }
                if let Some(fields) = &enrich.fields {
                    runner = runner.fields(fields.iter().cloned());
                }
                runner = runner.ingredients(enrich.ingredients);
                if let Some(retry) = &enrich.retry {
                    if retry.max_attempts == 0 {
                        return Err(invalid("retry.max_attempts must be at least 1".to_string()));
                    }
                    runner = runner.retry(retry.clone());
                }
                RunnerKind::Enrich(runner)
            }
            StageKind::Merge => {
                let merge = config.merge.as_ref().ok_or_else(|| missing_table("merge"))?;
                if merge.steps.is_empty() {
                    return Err(invalid("merge stages need at least one step".to_string()));
                }
                if config.inputs.len() != merge.steps.len() + 1 {
                    return Err(invalid(format!(
                        "{} join step(s) need {} inputs, {} declared",
                        merge.steps.len(),
                        merge.steps.len() + 1,
                        config.inputs.len()
                    )));
                }
                if config.outputs.is_empty() || config.outputs.len() > 2 {
                    return Err(invalid(
                        "merge stages write one Parquet output and an optional coverage JSON"
                            .to_string(),
                    ));
                }
                let steps = merge
                    .steps
                    .iter()
                    .enumerate()
                    .map(|(n, step)| step.to_join_spec(&config.name, n + 1))
                    .collect::<PipelineResult<Vec<_>>>()?;
                let mut runner = MergeRunner::new(steps);
                if let Some(key) = &merge.shard_key {
                    runner = runner.shard_key(key.clone());
                }
                if let Some(mb) = merge.in_memory_threshold_mb {
                    runner = runner.in_memory_threshold_mb(mb);
                }
                if let Some(partitions) = merge.partitions {
                    if partitions == 0 {
                        return Err(invalid("partitions must be at least 1".to_string()));
                    }
                    runner = runner.partitions(partitions);
                }
                RunnerKind::Merge(runner)
            }
        };

        let mut stage = Stage::new(config.name.clone(), runner).critical(config.critical);
        if let Some(shard_aware) = config.shard_aware {
            stage = stage.shard_aware(shard_aware);
        }
        for input in &config.inputs {
            stage = stage.input(input)?;
        }
        for output in &config.outputs {
            stage = stage.output(output)?;
        }
        Ok(stage)
    }
}
