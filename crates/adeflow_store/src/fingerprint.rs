use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::UNIX_EPOCH;

use crate::{StoreError, StoreResult};

/// Size + modification time of a committed artifact, plus an optional content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub size: u64,
    pub modified_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

impl Fingerprint {
    pub fn of_path(path: &Path, with_hash: bool) -> StoreResult<Self> {
        let meta = std::fs::metadata(path).map_err(StoreError::io(path))?;
        let modified_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let content_hash = if with_hash {
            Some(hash_file(path)?)
        } else {
            None
        };
        Ok(Self {
            size: meta.len(),
            modified_ms,
            content_hash,
        })
    }

    /// Same content, judged by hash when both sides carry one, else by size and mtime.
    pub fn same_content(&self, other: &Fingerprint) -> bool {
        match (&self.content_hash, &other.content_hash) {
            (Some(a), Some(b)) => a == b,
            _ => self.size == other.size && self.modified_ms == other.modified_ms,
        }
    }
}

fn hash_file(path: &Path) -> StoreResult<String> {
    let mut file = File::open(path).map_err(StoreError::io(path))?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(StoreError::io(path))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn hash_tracks_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.json");
        std::fs::write(&path, b"{\"rows\":1}").unwrap();
        let first = Fingerprint::of_path(&path, true).unwrap();
        assert_eq!(first.size, 10);
        assert_eq!(first.content_hash.as_ref().unwrap().len(), 64);

        std::fs::write(&path, b"{\"rows\":2}").unwrap();
        let second = Fingerprint::of_path(&path, true).unwrap();
        assert!(!first.same_content(&second));
    }

    #[test]
    fn hash_is_optional() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"x").unwrap();
        let fp = Fingerprint::of_path(&path, false).unwrap();
        assert!(fp.content_hash.is_none());
        assert!(fp.same_content(&fp.clone()));
        let json = serde_json::to_string(&fp).unwrap();
        assert!(!json.contains("content_hash"));
    }
}
