//! Stage and pipeline definitions.
//!
//! A [`Pipeline`] is an ordered list of [`Stage`]s. Each stage declares the
//! artifacts it reads and the artifacts it writes; outputs always live under
//! the stage's own directory (`<data_dir>/<stage>/<file>`).

use adeflow_store::{ArtifactSpec, ShardSpec};
use std::collections::{HashMap, HashSet};

use crate::runners::RunnerKind;
use crate::{PipelineError, PipelineResult};

/// One step of the pipeline.
#[derive(Debug, Clone)]
pub struct Stage {
    pub name: String,
    pub inputs: Vec<ArtifactSpec>,
    pub outputs: Vec<ArtifactSpec>,
    pub runner: RunnerKind,
    /// A failing critical stage halts the run.
    pub critical: bool,
    /// Processes only its shard's keys and writes shard-suffixed outputs.
    pub shard_aware: bool,
}

impl Stage {
    pub fn new(name: impl Into<String>, runner: RunnerKind) -> Self {
        let shard_aware = runner.default_shard_aware();
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            runner,
            critical: true,
            shard_aware,
        }
    }

    /// Add an input given as `"<dir>/<file>"`.
    pub fn input(mut self, id: &str) -> PipelineResult<Self> {
        let spec = ArtifactSpec::parse(id).map_err(|e| {
            PipelineError::InvalidPipeline(format!("stage '{}': {}", self.name, e))
        })?;
        self.inputs.push(spec);
        Ok(self)
    }

    /// Add an output file written under this stage's directory.
    pub fn output(mut self, file_name: &str) -> PipelineResult<Self> {
        let spec = ArtifactSpec::new(self.name.clone(), file_name).map_err(|e| {
            PipelineError::InvalidPipeline(format!("stage '{}': {}", self.name, e))
        })?;
        self.outputs.push(spec);
        Ok(self)
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    pub fn shard_aware(mut self, shard_aware: bool) -> Self {
        self.shard_aware = shard_aware;
        self
    }

    /// Output identities for this run: shard-suffixed when the stage is shard aware.
    pub fn output_specs(&self, shard: &ShardSpec) -> Vec<ArtifactSpec> {
        self.outputs
            .iter()
            .map(|spec| self.output_for_shard(spec, shard))
            .collect()
    }

    fn output_for_shard(&self, spec: &ArtifactSpec, shard: &ShardSpec) -> ArtifactSpec {
        if self.shard_aware {
            spec.for_shard(shard)
        } else {
            spec.clone()
        }
    }
}

/// An ordered, validated list of stages.
#[derive(Debug, Clone)]
pub struct Pipeline {
    name: String,
    stages: Vec<Stage>,
    /// Declared output -> index into `stages`.
    producers: HashMap<ArtifactSpec, usize>,
}

impl Pipeline {
    /// Stage names must be unique, every stage must declare an output, and no
    /// two stages may declare the same output.
    pub fn new(name: impl Into<String>, stages: Vec<Stage>) -> PipelineResult<Self> {
        let name = name.into();
        if stages.is_empty() {
            return Err(PipelineError::InvalidPipeline(format!(
                "pipeline '{}' has no stages",
                name
            )));
        }

        let mut names = HashSet::new();
        let mut producers = HashMap::new();
        for (position, stage) in stages.iter().enumerate() {
            if stage.name.is_empty() || stage.name.starts_with('_') {
                return Err(PipelineError::InvalidPipeline(format!(
                    "stage {} has an invalid name '{}' (must be non-empty and not start with '_')",
                    position + 1,
                    stage.name
                )));
            }
            if !names.insert(stage.name.as_str()) {
                return Err(PipelineError::InvalidPipeline(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
            if stage.outputs.is_empty() {
                return Err(PipelineError::InvalidPipeline(format!(
                    "stage {} '{}' declares no outputs",
                    position + 1,
                    stage.name
                )));
            }
            for output in &stage.outputs {
                if let Some(previous) = producers.insert(output.clone(), position) {
                    return Err(PipelineError::InvalidPipeline(format!(
                        "output {} is declared by both stage '{}' and stage '{}'",
                        output, stages[previous].name, stage.name
                    )));
                }
            }
        }

        Ok(Self {
            name,
            stages,
            producers,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// 1-based index of `name`.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name).map(|i| i + 1)
    }

    /// The stage that declares `spec` as an output, with its 1-based index.
    pub fn producer_of(&self, spec: &ArtifactSpec) -> Option<(usize, &Stage)> {
        self.producers
            .get(spec)
            .map(|&position| (position + 1, &self.stages[position]))
    }

    /// Human-readable producer for error messages.
    pub fn describe_producer(&self, spec: &ArtifactSpec) -> String {
        match self.producer_of(spec) {
            Some((index, stage)) => format!("stage {} '{}'", index, stage.name),
            None => "external input".to_string(),
        }
    }

    /// The on-disk identity of an input for this run. Inputs produced by a
    /// shard-aware stage resolve to that stage's output for the same shard;
    /// everything else keeps its declared name.
    pub fn resolve_input(&self, spec: &ArtifactSpec, shard: &ShardSpec) -> ArtifactSpec {
        match self.producer_of(spec) {
            Some((_, producer)) => producer.output_for_shard(spec, shard),
            None => spec.clone(),
        }
    }
}
