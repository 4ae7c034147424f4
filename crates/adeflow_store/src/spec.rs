use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::{ShardSpec, StoreError, StoreResult};

/// On-disk format of an artifact, derived from its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Parquet,
    Json,
    /// `.gz`, typically a compressed external download.
    Gzip,
    Zip,
    Other,
}

/// Identity of an artifact: `<dir>/<file_name>` relative to the data directory.
///
/// `dir` is normally the name of the producing stage; external inputs live in
/// whatever directory the raw data was dropped into.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactSpec {
    dir: String,
    file_name: String,
}

impl ArtifactSpec {
    pub fn new(dir: impl Into<String>, file_name: impl Into<String>) -> StoreResult<Self> {
        let dir = dir.into();
        let file_name = file_name.into();
        let valid_segment = |s: &str| {
            !s.is_empty() && s != "." && s != ".." && !s.starts_with('.') && !s.contains('\\')
        };
        let dir_ok = dir.split('/').all(valid_segment);
        if !dir_ok || !valid_segment(&file_name) || file_name.contains('/') {
            return Err(StoreError::InvalidSpec(format!("{}/{}", dir, file_name)));
        }
        Ok(Self { dir, file_name })
    }

    /// Parse `"dir/file"`; the last `/` separates the file name.
    pub fn parse(id: &str) -> StoreResult<Self> {
        match id.trim().rsplit_once('/') {
            Some((dir, file)) => Self::new(dir, file),
            None => Err(StoreError::InvalidSpec(id.to_string())),
        }
    }

    pub fn dir(&self) -> &str {
        &self.dir
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn id(&self) -> String {
        format!("{}/{}", self.dir, self.file_name)
    }

    pub fn format(&self) -> Format {
        match Path::new(&self.file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .as_deref()
        {
            Some("parquet") => Format::Parquet,
            Some("json") => Format::Json,
            Some("gz") | Some("gzip") => Format::Gzip,
            Some("zip") => Format::Zip,
            _ => Format::Other,
        }
    }

    /// Shard-local variant of this artifact: `{stem}_sh{id}.{ext}`.
    ///
    /// Unchanged when the run is not sharded.
    pub fn for_shard(&self, shard: &ShardSpec) -> Self {
        if !shard.is_sharded() {
            return self.clone();
        }
        let suffix = format!("_sh{}", shard.shard_id());
        let file_name = match self.file_name.rsplit_once('.') {
            Some((stem, ext)) => format!("{}{}.{}", stem, suffix, ext),
            None => format!("{}{}", self.file_name, suffix),
        };
        Self {
            dir: self.dir.clone(),
            file_name,
        }
    }
}

impl fmt::Display for ArtifactSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dir, self.file_name)
    }
}

impl TryFrom<String> for ArtifactSpec {
    type Error = StoreError;

    fn try_from(value: String) -> StoreResult<Self> {
        Self::parse(&value)
    }
}

impl From<ArtifactSpec> for String {
    fn from(spec: ArtifactSpec) -> Self {
        spec.id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_on_last_slash() {
        let spec = ArtifactSpec::parse("raw/faers/ascii/DRUG24Q1.txt").unwrap();
        assert_eq!(spec.dir(), "raw/faers/ascii");
        assert_eq!(spec.file_name(), "DRUG24Q1.txt");
        assert_eq!(spec.format(), Format::Other);
        assert_eq!(spec.to_string(), "raw/faers/ascii/DRUG24Q1.txt");
    }

    #[test]
    fn parse_rejects_bare_and_hidden_names() {
        assert!(ArtifactSpec::parse("drug.parquet").is_err());
        assert!(ArtifactSpec::parse("split/.drug.parquet.tmp").is_err());
        assert!(ArtifactSpec::parse("../drug.parquet").is_err());
        assert!(ArtifactSpec::parse("split/").is_err());
    }

    #[test]
    fn format_from_extension() {
        let spec = ArtifactSpec::new("merge_back", "report.PARQUET").unwrap();
        assert_eq!(spec.format(), Format::Parquet);
        let spec = ArtifactSpec::new("merge_back", "merge_coverage.json").unwrap();
        assert_eq!(spec.format(), Format::Json);
        let spec = ArtifactSpec::new("raw", "DRUG24Q1.txt.gz").unwrap();
        assert_eq!(spec.format(), Format::Gzip);
        let spec = ArtifactSpec::new("raw", "faers_ascii_2024Q1.ZIP").unwrap();
        assert_eq!(spec.format(), Format::Zip);
    }

    #[test]
    fn shard_suffix_only_when_sharded() {
        let spec = ArtifactSpec::new("drug_enrich", "drug_rxnorm.parquet").unwrap();
        let single = ShardSpec::single();
        assert_eq!(spec.for_shard(&single), spec);

        let shard = ShardSpec::new(4, 2).unwrap();
        let sharded = spec.for_shard(&shard);
        assert_eq!(sharded.file_name(), "drug_rxnorm_sh2.parquet");
        assert_eq!(sharded.dir(), "drug_enrich");
    }

    #[test]
    fn serde_as_plain_string() {
        let spec = ArtifactSpec::parse("split/drug_dict.parquet").unwrap();
        let json = serde_json::to_string(&spec).unwrap();
        assert_eq!(json, "\"split/drug_dict.parquet\"");
        let back: ArtifactSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
        assert!(serde_json::from_str::<ArtifactSpec>("\"nodir\"").is_err());
    }
}
