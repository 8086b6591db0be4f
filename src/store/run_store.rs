//! Durable Run Store
//!
//! Stores each run as `runs/{run_id}.json` under the data directory and
//! keeps a compact index (`runs_index.json`) for listing. Reading one run
//! costs one file read; listing never touches per-run files.
//!
//! The index is written to disk only when a run reaches a terminal status.
//! Index entries for in-flight runs live in memory; after a crash they are
//! rebuilt from the per-run files by [`RunStore::refresh_index`].

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::cache::BoundedCache;
use crate::error::StoreError;
use crate::run::{RunIndexEntry, RunRecord};

use super::index::{paginate, IndexFile, RunIndex, RunPage, RunQuery};
use super::legacy::{self, LEGACY_FILE_NAME};

/// Directory holding one JSON file per run.
pub const RUNS_DIR: &str = "runs";

/// Directory for outputs too large to embed in a run record.
pub const OUTPUTS_DIR: &str = "outputs";

/// Index file name inside the data directory.
pub const INDEX_FILE: &str = "runs_index.json";

/// Default number of entries kept in the index.
pub const DEFAULT_INDEX_CAPACITY: usize = 10_000;

/// Default number of full records kept in the read cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 128;

/// Longest accepted run id.
const MAX_RUN_ID_LEN: usize = 128;

/// Returns true if `id` is safe to use as a file name.
pub fn is_valid_run_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_RUN_ID_LEN
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Per-run file store with an in-memory index.
///
/// All methods take `&self`; the store is meant to be shared in an `Arc`.
#[derive(Debug)]
pub struct RunStore {
    root: PathBuf,
    runs_dir: PathBuf,
    index_path: PathBuf,
    index: Mutex<RunIndex>,
    /// Serializes index file writes so an older snapshot never lands last
    persist_lock: Mutex<()>,
    cache: BoundedCache<String, RunRecord>,
}

impl RunStore {
    /// Opens (or creates) a store with default capacities.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::open_with(root, DEFAULT_INDEX_CAPACITY, DEFAULT_CACHE_CAPACITY)
    }

    /// Opens (or creates) a store.
    ///
    /// This loads the index, imports the legacy run file when the index is
    /// empty, and reconciles the index against the per-run files.
    pub fn open_with(
        root: impl Into<PathBuf>,
        index_capacity: usize,
        cache_capacity: usize,
    ) -> Result<Self, StoreError> {
        let root = root.into();
        let runs_dir = root.join(RUNS_DIR);
        fs::create_dir_all(&runs_dir).map_err(|e| StoreError::io(&runs_dir, e))?;

        let index_path = root.join(INDEX_FILE);
        let entries = load_index_file(&index_path);

        let store = Self {
            root,
            runs_dir,
            index_path,
            index: Mutex::new(RunIndex::from_entries(entries, index_capacity)),
            persist_lock: Mutex::new(()),
            cache: BoundedCache::new(cache_capacity),
        };

        match store.migrate_legacy() {
            Ok(0) => {}
            Ok(count) => info!("Imported {} runs from legacy run file", count),
            Err(e) => error!("Legacy run import failed, keeping legacy file: {}", e),
        }

        let changes = store.refresh_index()?;
        if changes > 0 {
            info!("Run index reconciled with run files ({} changes)", changes);
        }

        info!(
            "Run store opened at {} ({} indexed runs)",
            store.root.display(),
            store.len()
        );
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.root.join(OUTPUTS_DIR)
    }

    pub fn legacy_path(&self) -> PathBuf {
        self.root.join(LEGACY_FILE_NAME)
    }

    fn lock_index(&self) -> MutexGuard<'_, RunIndex> {
        self.index.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn run_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        if !is_valid_run_id(id) {
            return Err(StoreError::InvalidRunId(id.to_string()));
        }
        Ok(self.runs_dir.join(format!("{}.json", id)))
    }

    /// Persists a record.
    ///
    /// The run file is always written; the index entry is updated in
    /// memory and the index file is rewritten only for terminal records.
    /// If the run file cannot be written the index is left untouched.
    pub fn save(&self, record: &RunRecord) -> Result<(), StoreError> {
        let path = self.run_path(&record.id)?;
        write_json_atomic(&path, record, true)?;

        self.cache.insert(record.id.clone(), record.clone());

        let evicted = self.lock_index().upsert(record.index_entry());
        if !evicted.is_empty() {
            debug!("Index capacity reached, dropped {} old entries", evicted.len());
        }

        if record.is_terminal() {
            self.persist_index()?;
        }

        debug!("Saved run {} ({})", record.id, record.status);
        Ok(())
    }

    /// Loads a record by id, from the cache or its run file.
    pub fn get(&self, id: &str) -> Result<Option<RunRecord>, StoreError> {
        if !is_valid_run_id(id) {
            return Ok(None);
        }

        if let Some(record) = self.cache.get(&id.to_string()) {
            return Ok(Some(record));
        }

        let path = self.run_path(id)?;
        let record: RunRecord = match read_json(&path)? {
            Some(record) => record,
            None => return Ok(None),
        };

        self.cache.insert(id.to_string(), record.clone());
        Ok(Some(record))
    }

    /// Lists index entries matching the query, newest first.
    pub fn list(&self, query: &RunQuery) -> Result<RunPage, StoreError> {
        query.validate()?;
        let snapshot = self.lock_index().snapshot(query);
        Ok(paginate(snapshot, query))
    }

    /// All index entries, newest first.
    pub fn entries(&self) -> Vec<RunIndexEntry> {
        let mut entries = self.lock_index().snapshot(&RunQuery::default());
        entries.sort_by(super::index::newest_first);
        entries
    }

    /// Index entries whose runs have not reached a terminal status.
    pub fn unfinished(&self) -> Vec<RunIndexEntry> {
        self.entries()
            .into_iter()
            .filter(|e| !e.status.is_terminal())
            .collect()
    }

    /// Deletes a run. Returns false if it did not exist.
    pub fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let path = match self.run_path(id) {
            Ok(path) => path,
            Err(_) => return Ok(false),
        };

        let file_existed = match fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        self.cache.remove(&id.to_string());
        let indexed = self.lock_index().remove(id).is_some();

        let output_path = self.outputs_dir().join(format!("{}.json", id));
        if let Err(e) = fs::remove_file(&output_path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove output file {}: {}", output_path.display(), e);
            }
        }

        if indexed {
            self.persist_index()?;
        }

        if file_existed || indexed {
            info!("Deleted run {}", id);
        }
        Ok(file_existed || indexed)
    }

    /// Reconciles the index with the run files on disk.
    ///
    /// Drops entries whose file is gone and indexes files missing from
    /// the index. Returns the number of changes. When the index is at
    /// capacity, files older than its oldest entry are not read.
    pub fn refresh_index(&self) -> Result<usize, StoreError> {
        let on_disk = self.scan_run_files()?;

        let (vanished, missing, cutoff) = {
            let index = self.lock_index();
            let vanished: Vec<String> = index
                .ids()
                .filter(|id| !on_disk.contains_key(*id))
                .cloned()
                .collect();
            let missing: Vec<(String, Option<SystemTime>)> = on_disk
                .iter()
                .filter(|(id, _)| !index.contains(id))
                .map(|(id, modified)| (id.clone(), *modified))
                .collect();
            let cutoff = if index.is_full() {
                index.oldest_started_at()
            } else {
                None
            };
            (vanished, missing, cutoff)
        };

        let mut recovered = Vec::new();
        for (id, modified) in missing {
            if let (Some(cutoff), Some(modified)) = (cutoff, modified) {
                if DateTime::<Utc>::from(modified) < cutoff {
                    continue;
                }
            }

            let path = self.runs_dir.join(format!("{}.json", id));
            match read_json::<RunRecord>(&path) {
                Ok(Some(record)) if record.id == id => recovered.push(record.index_entry()),
                Ok(Some(record)) => warn!(
                    "Run file {} holds run '{}', skipping",
                    path.display(),
                    record.id
                ),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable run file: {}", e),
            }
        }

        let changes = {
            let mut index = self.lock_index();
            let mut changes = 0;
            for id in &vanished {
                if index.remove(id).is_some() {
                    changes += 1;
                }
            }
            let added: Vec<String> = recovered.iter().map(|e| e.id.clone()).collect();
            for entry in recovered {
                index.upsert(entry);
            }
            changes += added.iter().filter(|id| index.contains(id)).count();
            changes
        };

        for id in &vanished {
            self.cache.remove(id);
        }

        if changes > 0 {
            debug!(
                "Index refresh: {} vanished, {} total changes",
                vanished.len(),
                changes
            );
            self.persist_index()?;
        }
        Ok(changes)
    }

    /// Imports the legacy monolithic run file.
    ///
    /// Runs only when the legacy file exists and the index is empty. The
    /// legacy file is renamed, never deleted, and only after every record
    /// has been written. Returns the number of imported runs.
    pub fn migrate_legacy(&self) -> Result<usize, StoreError> {
        let legacy_path = self.legacy_path();
        if !legacy_path.exists() {
            return Ok(0);
        }
        if !self.lock_index().is_empty() {
            debug!("Index not empty, legacy file left in place");
            return Ok(0);
        }

        info!("Migrating legacy run file {}", legacy_path.display());
        let records = legacy::read_legacy_file(&legacy_path)?;

        let mut imported = Vec::with_capacity(records.len());
        for record in records {
            let path = match self.run_path(&record.id) {
                Ok(path) => path,
                Err(e) => {
                    warn!("Skipping legacy run: {}", e);
                    continue;
                }
            };
            write_json_atomic(&path, &record, true)?;
            imported.push(record.index_entry());
        }

        let count = imported.len();
        {
            let mut index = self.lock_index();
            for entry in imported {
                index.upsert(entry);
            }
        }
        self.persist_index()?;

        let backup = legacy::backup_path(&legacy_path);
        fs::rename(&legacy_path, &backup).map_err(|e| StoreError::io(&legacy_path, e))?;
        info!(
            "Migrated {} legacy runs, original kept at {}",
            count,
            backup.display()
        );
        Ok(count)
    }

    /// Brings the index entry of `record` in line with the record and
    /// writes the index. The run file is not touched.
    pub fn reindex(&self, record: &RunRecord) -> Result<(), StoreError> {
        if !is_valid_run_id(&record.id) {
            return Err(StoreError::InvalidRunId(record.id.clone()));
        }
        self.lock_index().upsert(record.index_entry());
        self.persist_index()
    }

    /// Writes the current index to disk.
    pub fn persist_index(&self) -> Result<(), StoreError> {
        let _guard = self
            .persist_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let file = self.lock_index().to_file();
        write_json_atomic(&self.index_path, &file, false)
    }

    /// Drops every cached record.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Number of indexed runs.
    pub fn len(&self) -> usize {
        self.lock_index().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn scan_run_files(&self) -> Result<HashMap<String, Option<SystemTime>>, StoreError> {
        let dir = fs::read_dir(&self.runs_dir).map_err(|e| StoreError::io(&self.runs_dir, e))?;

        let mut found = HashMap::new();
        for entry in dir {
            let entry = entry.map_err(|e| StoreError::io(&self.runs_dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !is_valid_run_id(id) {
                continue;
            }
            let modified = entry.metadata().and_then(|m| m.modified()).ok();
            found.insert(id.to_string(), modified);
        }
        Ok(found)
    }
}

/// Reads the index file, falling back to an empty index when it is
/// missing or unreadable (a refresh rebuilds it from the run files).
fn load_index_file(path: &Path) -> Vec<RunIndexEntry> {
    match read_json::<IndexFile>(path) {
        Ok(Some(file)) => {
            debug!(
                "Loaded index v{} with {} runs from {}",
                file.version,
                file.runs.len(),
                path.display()
            );
            file.runs
        }
        Ok(None) => Vec::new(),
        Err(e) => {
            warn!("Ignoring unreadable run index, rebuilding: {}", e);
            Vec::new()
        }
    }
}

/// Reads and decodes a JSON file. A missing file is `Ok(None)`.
fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };

    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            source: e,
        })
}

/// Writes JSON through a temporary file and a rename so readers never
/// observe a partially written document.
pub(crate) fn write_json_atomic<T: Serialize>(
    path: &Path,
    value: &T,
    pretty: bool,
) -> Result<(), StoreError> {
    let bytes = if pretty {
        serde_json::to_vec_pretty(value)
    } else {
        serde_json::to_vec(value)
    }
    .map_err(|e| StoreError::Serialize {
        what: path.display().to_string(),
        source: e,
    })?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }

    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, &bytes).map_err(|e| StoreError::io(&tmp_path, e))?;
    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        StoreError::io(path, e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{timestamp, RunStatus, StepEvent};
    use serde_json::json;
    use tempfile::tempdir;

    fn finished_record(id: &str, workflow: &str, status: RunStatus) -> RunRecord {
        let mut record = RunRecord::new(id, workflow, "Test", ["a", "b"], json!({"k": id}));
        record.mark_running(timestamp::now());
        record.apply_step_event(&StepEvent::start("a"));
        record.append_log("[t] working");
        match status {
            RunStatus::Completed => {
                record.apply_step_event(&StepEvent::complete("a", 3));
                record.finish_completed(Some(json!({"done": true})), None, timestamp::now());
            }
            RunStatus::Failed => {
                record.finish_failed("boom", timestamp::now());
            }
            RunStatus::Cancelled => {
                record.finish_cancelled(timestamp::now());
            }
            _ => {}
        }
        record
    }

    #[test]
    fn test_save_and_get_round_trip() {
        let dir = tempdir().unwrap();
        let store = RunStore::open(dir.path()).unwrap();
        let record = finished_record("run-1", "wf", RunStatus::Completed);

        store.save(&record).unwrap();
        assert_eq!(store.get("run-1").unwrap(), Some(record.clone()));

        // Bypass the cache
        store.clear_cache();
        assert_eq!(store.get("run-1").unwrap(), Some(record));
    }

    #[test]
    fn test_round_trip_after_reopen() {
        let dir = tempdir().unwrap();
        let record = finished_record("run-1", "wf", RunStatus::Failed);
        {
            let store = RunStore::open(dir.path()).unwrap();
            store.save(&record).unwrap();
        }

        let store = RunStore::open(dir.path()).unwrap();
        assert_eq!(store.get("run-1").unwrap(), Some(record));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_get_missing_and_invalid() {
        let dir = tempdir().unwrap();
        let store = RunStore::open(dir.path()).unwrap();

        assert_eq!(store.get("nope").unwrap(), None);
        assert_eq!(store.get("../etc/passwd").unwrap(), None);
        assert!(matches!(
            store.save(&RunRecord::new("../x", "wf", "", Vec::<String>::new(), json!(null))),
            Err(StoreError::InvalidRunId(_))
        ));
    }

    #[test]
    fn test_index_persisted_only_for_terminal_saves() {
        let dir = tempdir().unwrap();
        let store = RunStore::open(dir.path()).unwrap();
        let index_path = store.index_path().to_path_buf();
        let before = fs::read_to_string(&index_path).unwrap_or_default();

        let mut record = RunRecord::new("live", "wf", "", ["a"], json!({}));
        record.mark_running(timestamp::now());
        store.save(&record).unwrap();

        // Listed from memory but not yet on disk
        assert_eq!(store.list(&RunQuery::new(10)).unwrap().total, 1);
        assert_eq!(fs::read_to_string(&index_path).unwrap_or_default(), before);

        record.finish_completed(None, None, timestamp::now());
        store.save(&record).unwrap();

        let file: IndexFile =
            serde_json::from_str(&fs::read_to_string(&index_path).unwrap()).unwrap();
        assert_eq!(file.total_runs, 1);
        assert_eq!(file.runs[0].status, RunStatus::Completed);
    }

    #[test]
    fn test_list_filters_and_pages() {
        let dir = tempdir().unwrap();
        let store = RunStore::open(dir.path()).unwrap();
        for i in 0..5 {
            store
                .save(&finished_record(&format!("a{}", i), "alpha", RunStatus::Completed))
                .unwrap();
        }
        store
            .save(&finished_record("b0", "beta", RunStatus::Failed))
            .unwrap();

        let alpha = store.list(&RunQuery::new(2).workflow("alpha")).unwrap();
        assert_eq!(alpha.total, 5);
        assert_eq!(alpha.entries.len(), 2);

        let failed = store.list(&RunQuery::new(10).status(RunStatus::Failed)).unwrap();
        assert_eq!(failed.total, 1);
        assert_eq!(failed.entries[0].id, "b0");

        let first = store.list(&RunQuery::new(3)).unwrap();
        let second = store.list(&RunQuery::new(3).offset(3)).unwrap();
        let mut ids: Vec<_> = first
            .entries
            .iter()
            .chain(&second.entries)
            .map(|e| e.id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 6);

        assert!(matches!(
            store.list(&RunQuery::new(0)),
            Err(StoreError::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_delete() {
        let dir = tempdir().unwrap();
        let store = RunStore::open(dir.path()).unwrap();
        store
            .save(&finished_record("gone", "wf", RunStatus::Completed))
            .unwrap();

        assert!(store.delete("gone").unwrap());
        assert!(!store.delete("gone").unwrap());
        assert_eq!(store.get("gone").unwrap(), None);
        assert_eq!(store.list(&RunQuery::new(10)).unwrap().total, 0);
        assert!(!store.delete("../bad").unwrap());
    }

    #[test]
    fn test_refresh_index_reconciles() {
        let dir = tempdir().unwrap();
        let store = RunStore::open(dir.path()).unwrap();
        store
            .save(&finished_record("keep", "wf", RunStatus::Completed))
            .unwrap();
        store
            .save(&finished_record("vanish", "wf", RunStatus::Completed))
            .unwrap();

        // Remove one file behind the store's back, drop another one in
        fs::remove_file(store.runs_dir().join("vanish.json")).unwrap();
        let extra = finished_record("extra", "wf", RunStatus::Failed);
        fs::write(
            store.runs_dir().join("extra.json"),
            serde_json::to_string(&extra).unwrap(),
        )
        .unwrap();
        fs::write(store.runs_dir().join("junk.json"), "not json").unwrap();

        assert_eq!(store.refresh_index().unwrap(), 2);
        assert_eq!(store.refresh_index().unwrap(), 0);

        let mut ids: Vec<_> = store.entries().into_iter().map(|e| e.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["extra", "keep"]);
    }

    #[test]
    fn test_rebuilds_index_when_index_file_lost() {
        let dir = tempdir().unwrap();
        {
            let store = RunStore::open(dir.path()).unwrap();
            store
                .save(&finished_record("r1", "wf", RunStatus::Completed))
                .unwrap();
            store
                .save(&finished_record("r2", "wf", RunStatus::Cancelled))
                .unwrap();
        }
        fs::write(dir.path().join(INDEX_FILE), "{ truncated").unwrap();

        let store = RunStore::open(dir.path()).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_migrate_legacy_on_open() {
        let dir = tempdir().unwrap();
        let mut legacy = serde_json::Map::new();
        for i in 0..4 {
            let record = finished_record(&format!("old{}", i), "wf", RunStatus::Completed);
            legacy.insert(record.id.clone(), serde_json::to_value(&record).unwrap());
        }
        fs::write(
            dir.path().join(LEGACY_FILE_NAME),
            serde_json::to_string(&legacy).unwrap(),
        )
        .unwrap();

        let store = RunStore::open(dir.path()).unwrap();

        let page = store.list(&RunQuery::new(100)).unwrap();
        assert_eq!(page.total, 4);
        assert_eq!(page.entries.len(), 4);
        assert!(!dir.path().join(LEGACY_FILE_NAME).exists());
        assert!(dir.path().join("workflow_runs.json.bak").exists());
        assert!(store.get("old2").unwrap().is_some());
    }

    #[test]
    fn test_migrate_skipped_when_index_has_runs() {
        let dir = tempdir().unwrap();
        let store = RunStore::open(dir.path()).unwrap();
        store
            .save(&finished_record("current", "wf", RunStatus::Completed))
            .unwrap();

        fs::write(dir.path().join(LEGACY_FILE_NAME), "{}").unwrap();
        assert_eq!(store.migrate_legacy().unwrap(), 0);
        assert!(dir.path().join(LEGACY_FILE_NAME).exists());
    }

    #[test]
    fn test_index_capacity_keeps_runs_retrievable() {
        let dir = tempdir().unwrap();
        let store = RunStore::open_with(dir.path(), 2, 0).unwrap();
        for i in 0..4 {
            store
                .save(&finished_record(&format!("r{}", i), "wf", RunStatus::Completed))
                .unwrap();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        assert_eq!(store.list(&RunQuery::new(10)).unwrap().total, 2);
        assert!(store.get("r0").unwrap().is_some());
    }

    #[test]
    fn test_failed_run_write_leaves_index_untouched() {
        let dir = tempdir().unwrap();
        let store = RunStore::open(dir.path()).unwrap();

        // A directory where the run file should go makes the rename fail
        fs::create_dir_all(store.runs_dir().join("blocked.json")).unwrap();
        let record = finished_record("blocked", "wf", RunStatus::Completed);

        assert!(store.save(&record).is_err());
        assert_eq!(store.len(), 0);
    }
}
