//! Run Index
//!
//! In-memory projection of all known runs, used to answer list queries
//! without touching per-run files. Persisted as one compact JSON document:
//!
//! ```json
//! {
//!   "version": 2,
//!   "total_runs": 2,
//!   "last_updated": "2024-05-01T10:00:04.000000Z",
//!   "runs": [ {"id": "...", "workflow_id": "...", "status": "completed", ...} ]
//! }
//! ```
//!
//! Entries are ordered newest first by `started_at`. Runs that have not
//! started yet sort ahead of everything else.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::run::{timestamp, RunIndexEntry, RunStatus};

/// Current index file format version.
pub const INDEX_VERSION: u32 = 2;

/// Largest page a single list call may request.
pub const MAX_PAGE_SIZE: usize = 1000;

/// On-disk layout of the index file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexFile {
    pub version: u32,
    pub total_runs: usize,
    #[serde(with = "timestamp", default = "timestamp::now")]
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub runs: Vec<RunIndexEntry>,
}

/// Filter and page parameters for listing runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunQuery {
    pub workflow_id: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: usize,
    pub offset: usize,
}

impl RunQuery {
    /// First page of `limit` entries with no filters.
    pub fn new(limit: usize) -> Self {
        Self {
            workflow_id: None,
            status: None,
            limit,
            offset: 0,
        }
    }

    pub fn workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Rejects queries no caller should make.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.limit == 0 {
            return Err(StoreError::InvalidQuery("limit must be at least 1".into()));
        }
        if self.limit > MAX_PAGE_SIZE {
            return Err(StoreError::InvalidQuery(format!(
                "limit {} exceeds the maximum page size of {}",
                self.limit, MAX_PAGE_SIZE
            )));
        }
        Ok(())
    }

    fn matches(&self, entry: &RunIndexEntry) -> bool {
        self.workflow_id
            .as_ref()
            .map_or(true, |id| &entry.workflow_id == id)
            && self.status.map_or(true, |status| entry.status == status)
    }
}

impl Default for RunQuery {
    fn default() -> Self {
        Self::new(50)
    }
}

/// One page of list results plus the total number of matches.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPage {
    pub entries: Vec<RunIndexEntry>,
    pub total: usize,
}

/// Newest first by start time; unstarted runs first; ties broken by id.
pub fn newest_first(a: &RunIndexEntry, b: &RunIndexEntry) -> Ordering {
    match (&a.started_at, &b.started_at) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => y.cmp(x),
    }
    .then_with(|| a.id.cmp(&b.id))
}

/// The in-memory index. Not synchronized; the store wraps it in a mutex.
#[derive(Debug, Clone)]
pub struct RunIndex {
    entries: HashMap<String, RunIndexEntry>,
    capacity: usize,
}

impl RunIndex {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Builds an index from persisted entries, applying the capacity.
    pub fn from_entries(entries: Vec<RunIndexEntry>, capacity: usize) -> Self {
        let mut index = Self::new(capacity);
        for entry in entries {
            index.entries.insert(entry.id.clone(), entry);
        }
        index.enforce_capacity();
        index
    }

    /// Inserts or replaces an entry. Returns ids evicted by the capacity cap.
    pub fn upsert(&mut self, entry: RunIndexEntry) -> Vec<String> {
        self.entries.insert(entry.id.clone(), entry);
        self.enforce_capacity()
    }

    pub fn remove(&mut self, id: &str) -> Option<RunIndexEntry> {
        self.entries.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&RunIndexEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Start time of the oldest retained entry, if any has started.
    pub fn oldest_started_at(&self) -> Option<DateTime<Utc>> {
        self.entries.values().filter_map(|e| e.started_at).min()
    }

    /// Clones the entries matching `query`, unsorted.
    pub fn snapshot(&self, query: &RunQuery) -> Vec<RunIndexEntry> {
        self.entries
            .values()
            .filter(|e| query.matches(e))
            .cloned()
            .collect()
    }

    /// Drops the oldest finished entries beyond capacity.
    ///
    /// Unfinished runs are never dropped so that in-flight work stays listed.
    fn enforce_capacity(&mut self) -> Vec<String> {
        if self.entries.len() <= self.capacity {
            return Vec::new();
        }

        let mut finished: Vec<&RunIndexEntry> = self
            .entries
            .values()
            .filter(|e| e.status.is_terminal())
            .collect();
        finished.sort_by(|a, b| newest_first(a, b));

        let excess = self.entries.len() - self.capacity;
        let evicted: Vec<String> = finished
            .iter()
            .rev()
            .take(excess)
            .map(|e| e.id.clone())
            .collect();

        for id in &evicted {
            self.entries.remove(id);
        }
        evicted
    }

    /// Serializable form, sorted newest first.
    pub fn to_file(&self) -> IndexFile {
        let mut runs: Vec<RunIndexEntry> = self.entries.values().cloned().collect();
        runs.sort_by(newest_first);
        IndexFile {
            version: INDEX_VERSION,
            total_runs: runs.len(),
            last_updated: timestamp::now(),
            runs,
        }
    }
}

/// Sorts a snapshot and cuts the requested page out of it.
pub fn paginate(mut snapshot: Vec<RunIndexEntry>, query: &RunQuery) -> RunPage {
    snapshot.sort_by(newest_first);
    let total = snapshot.len();
    let entries = snapshot
        .into_iter()
        .skip(query.offset)
        .take(query.limit)
        .collect();
    RunPage { entries, total }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(id: &str, workflow: &str, status: RunStatus, minutes_ago: Option<i64>) -> RunIndexEntry {
        let started = minutes_ago.map(|m| timestamp::now() - Duration::minutes(m));
        RunIndexEntry {
            id: id.to_string(),
            workflow_id: workflow.to_string(),
            workflow_name: String::new(),
            status,
            started_at: started,
            completed_at: status.is_terminal().then(timestamp::now),
            duration_ms: None,
            error: None,
        }
    }

    fn sample_index() -> RunIndex {
        let mut index = RunIndex::new(100);
        index.upsert(entry("a", "wf1", RunStatus::Completed, Some(30)));
        index.upsert(entry("b", "wf2", RunStatus::Failed, Some(20)));
        index.upsert(entry("c", "wf1", RunStatus::Completed, Some(10)));
        index.upsert(entry("d", "wf1", RunStatus::Pending, None));
        index
    }

    #[test]
    fn test_query_validation() {
        assert!(RunQuery::new(0).validate().is_err());
        assert!(RunQuery::new(MAX_PAGE_SIZE + 1).validate().is_err());
        assert!(RunQuery::new(10).validate().is_ok());
    }

    #[test]
    fn test_sorted_newest_first_with_unstarted_first() {
        let index = sample_index();
        let page = paginate(index.snapshot(&RunQuery::new(10)), &RunQuery::new(10));

        let ids: Vec<_> = page.entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["d", "c", "b", "a"]);
        assert_eq!(page.total, 4);
    }

    #[test]
    fn test_filters() {
        let index = sample_index();

        let query = RunQuery::new(10).workflow("wf1").status(RunStatus::Completed);
        let page = paginate(index.snapshot(&query), &query);
        let ids: Vec<_> = page.entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
        assert_eq!(page.total, 2);
    }

    #[test]
    fn test_pages_do_not_overlap() {
        let mut index = RunIndex::new(100);
        for i in 0..7 {
            index.upsert(entry(&format!("r{}", i), "wf", RunStatus::Completed, Some(i)));
        }

        let first_q = RunQuery::new(3);
        let second_q = RunQuery::new(3).offset(3);
        let third_q = RunQuery::new(3).offset(6);
        let first = paginate(index.snapshot(&first_q), &first_q);
        let second = paginate(index.snapshot(&second_q), &second_q);
        let third = paginate(index.snapshot(&third_q), &third_q);

        let mut seen: Vec<String> = first
            .entries
            .iter()
            .chain(&second.entries)
            .chain(&third.entries)
            .map(|e| e.id.clone())
            .collect();
        assert_eq!(seen.len(), 7);
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 7);
    }

    #[test]
    fn test_offset_past_end() {
        let index = sample_index();
        let query = RunQuery::new(10).offset(50);
        let page = paginate(index.snapshot(&query), &query);
        assert!(page.entries.is_empty());
        assert_eq!(page.total, 4);
    }

    #[test]
    fn test_capacity_evicts_oldest_finished() {
        let mut index = RunIndex::new(2);
        index.upsert(entry("old", "wf", RunStatus::Completed, Some(60)));
        index.upsert(entry("live", "wf", RunStatus::Running, Some(90)));
        let evicted = index.upsert(entry("new", "wf", RunStatus::Completed, Some(1)));

        assert_eq!(evicted, vec!["old".to_string()]);
        assert!(index.contains("live"));
        assert!(index.contains("new"));
    }

    #[test]
    fn test_to_file_is_sorted() {
        let file = sample_index().to_file();
        assert_eq!(file.version, INDEX_VERSION);
        assert_eq!(file.total_runs, 4);
        assert_eq!(file.runs[0].id, "d");
        assert_eq!(file.runs[3].id, "a");
    }
}
