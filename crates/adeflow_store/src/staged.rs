use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::{ArtifactSpec, StoreError, StoreResult};

/// A reserved output location handed to a stage runner.
///
/// The runner writes whatever it produces to [`StagedOutput::temp_path`];
/// nothing becomes visible until [`StagedOutput::commit`] renames it.
#[derive(Debug)]
pub struct StagedOutput {
    spec: ArtifactSpec,
    temp_path: PathBuf,
    final_path: PathBuf,
    committed: bool,
}

impl StagedOutput {
    pub(crate) fn new(spec: ArtifactSpec, temp_path: PathBuf, final_path: PathBuf) -> Self {
        Self {
            spec,
            temp_path,
            final_path,
            committed: false,
        }
    }

    pub fn spec(&self) -> &ArtifactSpec {
        &self.spec
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// True once the runner has produced something at the temp path.
    pub fn is_written(&self) -> bool {
        self.temp_path.is_file()
    }

    pub fn commit(&mut self) -> StoreResult<()> {
        if self.committed {
            return Ok(());
        }
        std::fs::rename(&self.temp_path, &self.final_path)
            .map_err(StoreError::io(&self.final_path))?;
        self.committed = true;
        info!("Committed artifact: {}", self.final_path.display());
        Ok(())
    }

    pub fn rollback(&mut self) {
        if self.committed && self.final_path.exists() {
            let _ = std::fs::remove_file(&self.final_path);
            warn!("Rolled back committed artifact: {}", self.final_path.display());
        }
        if self.temp_path.exists() {
            let _ = std::fs::remove_file(&self.temp_path);
            warn!("Rolled back artifact temp file: {}", self.temp_path.display());
        }
        self.committed = false;
    }
}

impl Drop for StagedOutput {
    fn drop(&mut self) {
        if !self.committed && self.temp_path.exists() {
            let _ = std::fs::remove_file(&self.temp_path);
            warn!("Cleaned up orphaned temp file: {}", self.temp_path.display());
        }
    }
}

/// All staged outputs of one stage run, committed together.
#[derive(Debug, Default)]
pub struct StagedOutputs {
    outputs: Vec<StagedOutput>,
}

impl StagedOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, output: StagedOutput) {
        self.outputs.push(output);
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&StagedOutput> {
        self.outputs.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StagedOutput> {
        self.outputs.iter()
    }

    /// Outputs the runner never produced.
    pub fn missing(&self) -> Vec<&ArtifactSpec> {
        self.outputs
            .iter()
            .filter(|o| !o.is_written())
            .map(|o| o.spec())
            .collect()
    }

    /// Promote every output; if any rename fails, undo the ones already promoted.
    pub fn commit_all(mut self) -> StoreResult<Vec<ArtifactSpec>> {
        let mut result = Ok(());
        for output in self.outputs.iter_mut() {
            debug!("Committing staged output: {}", output.spec());
            if let Err(err) = output.commit() {
                result = Err(err);
                break;
            }
        }

        if let Err(err) = result {
            warn!("Staged commit failed, rolling back: {}", err);
            self.rollback_all();
            return Err(err);
        }

        Ok(self.outputs.iter().map(|o| o.spec().clone()).collect())
    }

    pub fn rollback_all(&mut self) {
        for output in self.outputs.iter_mut() {
            output.rollback();
        }
    }
}
