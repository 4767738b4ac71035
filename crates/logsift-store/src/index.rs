//! On-disk cache index
//!
//! Records job id, source URL, size and timestamps for every cached log in
//! `index.json` under the cache root. The index is advisory: if it is lost
//! or unreadable it is rebuilt by scanning the directory for log files.
//! Several stores may share one root, so the index is reconciled with the
//! directory and with the saved file before each save.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use logsift_types::JobId;

use crate::error::StoreError;

/// Index file name under the cache root
pub const INDEX_FILE: &str = "index.json";

/// Prefix of in-progress downloads
pub const PARTIAL_PREFIX: &str = ".partial-";

/// Partial downloads untouched for this long belong to a dead process
pub const STALE_PARTIAL_AGE: Duration = Duration::from_secs(15 * 60);

/// File holding the cached log of `job_id`
pub fn log_file_name(job_id: JobId) -> String {
    format!("job-{}.log", job_id)
}

fn parse_log_file_name(name: &str) -> Option<JobId> {
    name.strip_prefix("job-")?
        .strip_suffix(".log")?
        .parse()
        .ok()
        .map(JobId)
}

/// Index entry for one cached log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    #[serde(default)]
    pub source_url: String,
    pub size_bytes: u64,
    pub fetched_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
}

/// Cached logs keyed by job id
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CacheIndex {
    pub entries: BTreeMap<JobId, IndexEntry>,
}

impl CacheIndex {
    fn path(root: &Path) -> PathBuf {
        root.join(INDEX_FILE)
    }

    /// Load the index from disk, if present and readable
    pub fn load(root: &Path) -> Option<Self> {
        let content = fs::read_to_string(Self::path(root)).ok()?;
        match serde_json::from_str(&content) {
            Ok(index) => Some(index),
            Err(e) => {
                warn!("Ignoring unreadable cache index: {}", e);
                None
            }
        }
    }

    /// Write the index atomically
    pub fn save(&self, root: &Path) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| StoreError::Io(format!("failed to encode index: {}", e)))?;
        let mut tmp = tempfile::Builder::new()
            .prefix(PARTIAL_PREFIX)
            .tempfile_in(root)?;
        tmp.write_all(content.as_bytes())?;
        tmp.persist(Self::path(root))?;
        Ok(())
    }

    /// Reconstruct the index from the log files present under `root`
    pub fn rebuild(root: &Path) -> Result<Self, StoreError> {
        let index = Self {
            entries: scan_log_files(root)?,
        };
        info!("Rebuilt cache index with {} entries", index.entries.len());
        Ok(index)
    }

    /// Load the index, falling back to a rebuild, and bring it in line with
    /// the log files on disk
    pub fn load_or_rebuild(root: &Path) -> Result<Self, StoreError> {
        let mut index = match Self::load(root) {
            Some(index) => index,
            None => return Self::rebuild(root),
        };
        index.reconcile(root)?;
        Ok(index)
    }

    /// Drop entries whose files have vanished and adopt log files cached by
    /// another store on the same root. Adopted entries keep the metadata
    /// saved in `index.json` when there is some. Returns whether anything
    /// changed.
    pub fn reconcile(&mut self, root: &Path) -> Result<bool, StoreError> {
        let present = scan_log_files(root)?;
        let before = self.entries.len();
        self.entries.retain(|job_id, _| present.contains_key(job_id));
        let dropped = before - self.entries.len();

        let mut saved = match Self::load(root) {
            Some(index) => index.entries,
            None => BTreeMap::new(),
        };
        let mut adopted = 0;
        for (job_id, scanned) in present {
            if self.entries.contains_key(&job_id) {
                continue;
            }
            let entry = match saved.remove(&job_id) {
                Some(entry) => IndexEntry {
                    size_bytes: scanned.size_bytes,
                    ..entry
                },
                None => scanned,
            };
            self.entries.insert(job_id, entry);
            adopted += 1;
        }

        if dropped > 0 || adopted > 0 {
            debug!(
                "Reconciled cache index: {} dropped, {} adopted",
                dropped, adopted
            );
        }
        Ok(dropped > 0 || adopted > 0)
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size_bytes).sum()
    }

    /// Job ids from least to most recently used
    pub fn lru_order(&self) -> Vec<JobId> {
        let mut ids: Vec<(DateTime<Utc>, JobId)> = self
            .entries
            .iter()
            .map(|(id, e)| (e.last_access, *id))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }
}

/// Log files under `root`, keyed by job id, with their size and mtime
fn scan_log_files(root: &Path) -> Result<BTreeMap<JobId, IndexEntry>, StoreError> {
    let mut entries = BTreeMap::new();
    for dir_entry in fs::read_dir(root)? {
        let dir_entry = dir_entry?;
        let name = dir_entry.file_name();
        let Some(job_id) = name.to_str().and_then(parse_log_file_name) else {
            continue;
        };
        // Evicted by another store between listing and stat
        let Ok(meta) = dir_entry.metadata() else {
            continue;
        };
        let modified: DateTime<Utc> = meta.modified().map(Into::into).unwrap_or_else(|_| Utc::now());
        entries.insert(
            job_id,
            IndexEntry {
                source_url: String::new(),
                size_bytes: meta.len(),
                fetched_at: modified,
                last_access: modified,
            },
        );
    }
    Ok(entries)
}

/// Remove download leftovers not written to for `older_than`. Younger
/// partials may belong to a live download in another process.
pub fn remove_partials(root: &Path, older_than: Duration) -> Result<usize, StoreError> {
    let now = SystemTime::now();
    let mut removed = 0;
    for dir_entry in fs::read_dir(root)? {
        let dir_entry = dir_entry?;
        let is_partial = dir_entry
            .file_name()
            .to_str()
            .is_some_and(|n| n.starts_with(PARTIAL_PREFIX));
        if !is_partial {
            continue;
        }
        let stale = dir_entry
            .metadata()
            .and_then(|m| m.modified())
            .is_ok_and(|modified| {
                now.duration_since(modified)
                    .is_ok_and(|age| age >= older_than)
            });
        if stale && fs::remove_file(dir_entry.path()).is_ok() {
            removed += 1;
        }
    }
    if removed > 0 {
        info!("Removed {} stale partial downloads", removed);
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use tempfile::TempDir;

    fn entry(size_bytes: u64, last_access: DateTime<Utc>) -> IndexEntry {
        IndexEntry {
            source_url: "https://logs.example/1".into(),
            size_bytes,
            fetched_at: last_access,
            last_access,
        }
    }

    #[test]
    fn test_log_file_names() {
        assert_eq!(log_file_name(JobId(12)), "job-12.log");
        assert_eq!(parse_log_file_name("job-12.log"), Some(JobId(12)));
        assert_eq!(parse_log_file_name("index.json"), None);
        assert_eq!(parse_log_file_name("job-x.log"), None);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let mut index = CacheIndex::default();
        index.entries.insert(JobId(1), entry(10, Utc::now()));
        index.save(dir.path()).unwrap();

        let loaded = CacheIndex::load(dir.path()).unwrap();
        assert_eq!(loaded.entries, index.entries);
    }

    #[test]
    fn test_rebuild_from_directory() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("job-5.log"), b"hello\n").unwrap();
        fs::write(dir.path().join("job-9.log"), b"a\nb\n").unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let index = CacheIndex::rebuild(dir.path()).unwrap();
        assert_eq!(index.entries.len(), 2);
        assert_eq!(index.entries[&JobId(5)].size_bytes, 6);
        assert_eq!(index.total_bytes(), 10);
    }

    #[test]
    fn test_corrupt_index_is_rebuilt() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(INDEX_FILE), b"{not json").unwrap();
        fs::write(dir.path().join("job-3.log"), b"x\n").unwrap();

        let index = CacheIndex::load_or_rebuild(dir.path()).unwrap();
        assert!(index.entries.contains_key(&JobId(3)));
    }

    #[test]
    fn test_missing_files_dropped() {
        let dir = TempDir::new().unwrap();
        let mut index = CacheIndex::default();
        index.entries.insert(JobId(1), entry(10, Utc::now()));
        index.save(dir.path()).unwrap();

        let loaded = CacheIndex::load_or_rebuild(dir.path()).unwrap();
        assert!(loaded.entries.is_empty());
    }

    #[test]
    fn test_lru_order() {
        let now = Utc::now();
        let mut index = CacheIndex::default();
        index.entries.insert(JobId(1), entry(1, now));
        index.entries.insert(JobId(2), entry(1, now - TimeDelta::hours(2)));
        index.entries.insert(JobId(3), entry(1, now - TimeDelta::hours(1)));
        assert_eq!(index.lru_order(), vec![JobId(2), JobId(3), JobId(1)]);
    }

    #[test]
    fn test_unindexed_log_files_are_adopted() {
        let dir = TempDir::new().unwrap();
        let mut index = CacheIndex::default();
        index.entries.insert(JobId(1), entry(6, Utc::now()));
        index.save(dir.path()).unwrap();
        fs::write(dir.path().join("job-1.log"), b"first\n").unwrap();
        fs::write(dir.path().join("job-2.log"), b"second\n").unwrap();

        let loaded = CacheIndex::load_or_rebuild(dir.path()).unwrap();
        assert_eq!(loaded.entries.len(), 2);
        assert_eq!(loaded.total_bytes(), 13);
    }

    #[test]
    fn test_reconcile_keeps_saved_metadata() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("job-4.log"), b"four\n").unwrap();
        let mut saved = CacheIndex::default();
        saved.entries.insert(JobId(4), entry(5, Utc::now()));
        saved.save(dir.path()).unwrap();

        // Loaded before job 4 was cached
        let mut index = CacheIndex::default();
        assert!(index.reconcile(dir.path()).unwrap());
        assert_eq!(index.entries[&JobId(4)].source_url, "https://logs.example/1");
        assert!(!index.reconcile(dir.path()).unwrap());

        fs::remove_file(dir.path().join("job-4.log")).unwrap();
        assert!(index.reconcile(dir.path()).unwrap());
        assert!(index.entries.is_empty());
    }

    #[test]
    fn test_remove_partials_spares_live_downloads() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(".partial-live"), b"half").unwrap();
        fs::write(dir.path().join("job-1.log"), b"done").unwrap();
        let stale = fs::File::create(dir.path().join(".partial-dead")).unwrap();
        stale
            .set_modified(SystemTime::now() - Duration::from_secs(3600))
            .unwrap();

        assert_eq!(remove_partials(dir.path(), STALE_PARTIAL_AGE).unwrap(), 1);
        assert!(dir.path().join(".partial-live").exists());
        assert!(!dir.path().join(".partial-dead").exists());
        assert!(dir.path().join("job-1.log").exists());
    }
}
