//! Legacy Run File Import
//!
//! Older installations kept every run in a single JSON object mapping
//! run id to run record. The store imports that file once, then renames
//! it with a `.bak` suffix.

use std::fs;
use std::path::{Path, PathBuf};

use log::warn;
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::run::{timestamp, RunRecord};

/// File name of the monolithic run file inside the data directory.
pub const LEGACY_FILE_NAME: &str = "workflow_runs.json";

/// Reads every decodable record from a legacy file.
///
/// Entries that do not decode are logged and skipped. The map key is
/// authoritative for the run id.
pub fn read_legacy_file(path: &Path) -> Result<Vec<RunRecord>, StoreError> {
    let content = fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
    let map: Map<String, Value> =
        serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            source: e,
        })?;

    let mut records = Vec::with_capacity(map.len());
    for (key, mut value) in map {
        if let Value::Object(fields) = &mut value {
            fields.insert("id".to_string(), Value::String(key.clone()));
        }

        match serde_json::from_value::<RunRecord>(value) {
            Ok(mut record) => {
                normalize_completion(&mut record);
                records.push(record);
            }
            Err(e) => warn!("Skipping legacy run '{}': {}", key, e),
        }
    }

    Ok(records)
}

/// Makes `completed_at` agree with the status.
///
/// Terminal records without a completion time get `started_at` plus
/// `duration_ms`, else `started_at`, else the import time. Unfinished
/// records lose a stray completion time.
fn normalize_completion(record: &mut RunRecord) {
    if record.is_terminal() && record.completed_at.is_none() {
        let completed_at = match (record.started_at, record.duration_ms) {
            (Some(start), Some(ms)) => i64::try_from(ms)
                .ok()
                .and_then(|ms| start.checked_add_signed(chrono::Duration::milliseconds(ms)))
                .unwrap_or(start),
            (Some(start), None) => start,
            (None, _) => timestamp::now(),
        };
        warn!(
            "Legacy run '{}' is {} without a completion time, using {}",
            record.id,
            record.status,
            timestamp::format(&completed_at)
        );
        record.completed_at = Some(completed_at);
    } else if !record.is_terminal() && record.completed_at.is_some() {
        warn!(
            "Legacy run '{}' is {} but has a completion time, dropping it",
            record.id, record.status
        );
        record.completed_at = None;
    }
}

/// Where a legacy file is moved after import. Never overwrites an
/// existing backup.
pub fn backup_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| LEGACY_FILE_NAME.to_string());

    let candidate = path.with_file_name(format!("{}.bak", file_name));
    if !candidate.exists() {
        return candidate;
    }

    let stamp = timestamp::now().format("%Y%m%d%H%M%S%6f");
    path.with_file_name(format!("{}.{}.bak", file_name, stamp))
}
