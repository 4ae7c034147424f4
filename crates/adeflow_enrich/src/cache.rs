use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{EnrichError, EnrichResult, LookupRecord};

/// Cached answer for a key. `NotFound` is a tombstone: a definitive negative
/// that counts as a hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CachedValue {
    Found { records: Vec<LookupRecord> },
    NotFound,
}

/// One NDJSON line of the cache file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: CachedValue,
    pub cached_at: DateTime<Utc>,
}

/// Persistent key -> answer cache for one lookup domain.
///
/// Stored as append-only NDJSON at `<dir>/<domain>.ndjson`. Each entry is a
/// single line flushed on insert, so a crash loses at most the line being
/// written; a torn trailing line is skipped on load. Later lines win.
pub struct LookupCache {
    domain: String,
    path: PathBuf,
    entries: RwLock<HashMap<String, CachedValue>>,
    file: Mutex<BufWriter<File>>,
}

impl LookupCache {
    pub fn open(dir: &Path, domain: &str) -> EnrichResult<Self> {
        std::fs::create_dir_all(dir).map_err(|source| EnrichError::CacheIo {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = dir.join(format!("{}.ndjson", domain));
        let io_err = |source| EnrichError::CacheIo {
            path: path.clone(),
            source,
        };

        let entries = if path.exists() {
            load_entries(&path).map_err(io_err)?
        } else {
            HashMap::new()
        };

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        // A torn last line must not swallow the next append.
        if !ends_with_newline(&mut file).map_err(io_err)? {
            file.write_all(b"\n").map_err(io_err)?;
            file.flush().map_err(io_err)?;
        }

        info!(
            domain,
            entries = entries.len(),
            "Opened lookup cache {}",
            path.display()
        );

        Ok(Self {
            domain: domain.to_string(),
            path,
            entries: RwLock::new(entries),
            file: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<CachedValue> {
        self.entries.read().ok()?.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tombstones(&self) -> usize {
        self.entries
            .read()
            .map(|e| e.values().filter(|v| **v == CachedValue::NotFound).count())
            .unwrap_or(0)
    }

    /// Append `key -> value` durably, then make it visible to `get`.
    pub fn insert(&self, key: &str, value: CachedValue) -> EnrichResult<()> {
        let entry = CacheEntry {
            key: key.to_string(),
            value,
            cached_at: Utc::now(),
        };
        let line = serde_json::to_string(&entry)?;
        {
            let mut file = self.file.lock().map_err(|_| EnrichError::LockError)?;
            let io_err = |source| EnrichError::CacheIo {
                path: self.path.clone(),
                source,
            };
            writeln!(file, "{}", line).map_err(io_err)?;
            file.flush().map_err(io_err)?;
        }
        let mut entries = self.entries.write().map_err(|_| EnrichError::LockError)?;
        entries.insert(entry.key, entry.value);
        Ok(())
    }
}

fn load_entries(path: &Path) -> std::io::Result<HashMap<String, CachedValue>> {
    let reader = BufReader::new(File::open(path)?);
    let mut entries = HashMap::new();
    let mut skipped = 0usize;
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CacheEntry>(&line) {
            Ok(entry) => {
                entries.insert(entry.key, entry.value);
            }
            Err(err) => {
                skipped += 1;
                debug!("Skipping unreadable cache line {}: {}", line_no + 1, err);
            }
        }
    }
    if skipped > 0 {
        warn!(
            skipped,
            "Ignored {} unreadable line(s) in {}",
            skipped,
            path.display()
        );
    }
    Ok(entries)
}

fn ends_with_newline(file: &mut File) -> std::io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn record(rxcui: &str) -> LookupRecord {
        BTreeMap::from([("rxcui".to_string(), rxcui.to_string())])
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let cache = LookupCache::open(dir.path(), "rxnav").unwrap();
            cache
                .insert("aspirin", CachedValue::Found { records: vec![record("1191")] })
                .unwrap();
            cache.insert("zzzz", CachedValue::NotFound).unwrap();
        }
        let cache = LookupCache::open(dir.path(), "rxnav").unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.tombstones(), 1);
        assert_eq!(cache.get("zzzz"), Some(CachedValue::NotFound));
        assert_eq!(
            cache.get("aspirin"),
            Some(CachedValue::Found { records: vec![record("1191")] })
        );
        assert_eq!(cache.get("never-asked"), None);
    }

    #[test]
    fn last_writer_wins() {
        let dir = tempdir().unwrap();
        let cache = LookupCache::open(dir.path(), "rxnav").unwrap();
        cache.insert("humira", CachedValue::NotFound).unwrap();
        cache
            .insert("humira", CachedValue::Found { records: vec![record("327361")] })
            .unwrap();
        drop(cache);

        let cache = LookupCache::open(dir.path(), "rxnav").unwrap();
        assert_eq!(cache.len(), 1);
        assert!(matches!(cache.get("humira"), Some(CachedValue::Found { .. })));
    }

    #[test]
    fn torn_trailing_line_is_ignored_and_not_glued_to_next_entry() {
        let dir = tempdir().unwrap();
        {
            let cache = LookupCache::open(dir.path(), "rxnav").unwrap();
            cache.insert("aspirin", CachedValue::NotFound).unwrap();
        }
        let path = dir.path().join("rxnav.ndjson");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"key":"ibuprofen","value":{"sta"#).unwrap();
        drop(file);

        let cache = LookupCache::open(dir.path(), "rxnav").unwrap();
        assert_eq!(cache.len(), 1);
        cache.insert("ibuprofen", CachedValue::NotFound).unwrap();
        drop(cache);

        let cache = LookupCache::open(dir.path(), "rxnav").unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("ibuprofen"), Some(CachedValue::NotFound));
    }

    #[test]
    fn concurrent_inserts_produce_whole_lines() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(LookupCache::open(dir.path(), "rxnav").unwrap());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let key = format!("drug-{}-{}", t, i);
                        cache
                            .insert(&key, CachedValue::Found { records: vec![record(&key)] })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        drop(cache);

        let text = std::fs::read_to_string(dir.path().join("rxnav.ndjson")).unwrap();
        let lines: Vec<&str> = text.lines().filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), 400);
        for line in lines {
            serde_json::from_str::<CacheEntry>(line).unwrap();
        }
    }
}
