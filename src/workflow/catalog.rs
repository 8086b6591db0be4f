//! Workflow Catalog
//!
//! Resolves workflow ids to validated definitions. Definitions are read
//! from `{workflows_dir}/{id}.yaml` (or `.yml`) and kept in a bounded
//! cache; workflows can also be registered in memory.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use super::model::Workflow;
use super::parser::load_workflow;
use super::validator::{is_valid_workflow_id, validate_workflow};
use crate::cache::BoundedCache;
use crate::error::WorkflowError;

const EXTENSIONS: [&str; 2] = ["yaml", "yml"];

/// Default number of parsed workflows kept in memory.
pub const DEFAULT_CATALOG_CAPACITY: usize = 64;

#[derive(Debug)]
pub struct WorkflowCatalog {
    dir: Option<PathBuf>,
    registered: Mutex<HashMap<String, Arc<Workflow>>>,
    cache: BoundedCache<String, Arc<Workflow>>,
}

impl WorkflowCatalog {
    /// Catalog backed by a directory of YAML files.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            registered: Mutex::new(HashMap::new()),
            cache: BoundedCache::new(DEFAULT_CATALOG_CAPACITY),
        }
    }

    /// Catalog holding only registered workflows.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            registered: Mutex::new(HashMap::new()),
            cache: BoundedCache::new(0),
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Registers a workflow that takes precedence over files on disk.
    pub fn register(&self, workflow: Workflow) -> Result<(), WorkflowError> {
        validate_workflow(&workflow)?;
        debug!("Registered workflow '{}'", workflow.id);
        self.cache.remove(&workflow.id);
        self.registered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(workflow.id.clone(), Arc::new(workflow));
        Ok(())
    }

    /// Resolves a workflow by id.
    pub fn get(&self, id: &str) -> Result<Arc<Workflow>, WorkflowError> {
        if !is_valid_workflow_id(id) {
            return Err(WorkflowError::InvalidId(id.to_string()));
        }

        if let Some(workflow) = self
            .registered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
        {
            return Ok(Arc::clone(workflow));
        }

        let key = id.to_string();
        if let Some(workflow) = self.cache.get(&key) {
            return Ok(workflow);
        }

        let path = self
            .find_file(id)
            .ok_or_else(|| WorkflowError::NotFound(id.to_string()))?;
        let mut workflow = load_workflow(&path)?;
        if workflow.id != id {
            warn!(
                "Workflow file {} declares id '{}', using '{}'",
                path.display(),
                workflow.id,
                id
            );
            workflow.id = key.clone();
        }

        let workflow = Arc::new(workflow);
        self.cache.insert(key, Arc::clone(&workflow));
        Ok(workflow)
    }

    /// Ids of every registered workflow and workflow file, sorted.
    pub fn list_ids(&self) -> Vec<String> {
        let mut ids: BTreeSet<String> = self
            .registered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();

        if let Some(dir) = &self.dir {
            if let Ok(entries) = fs::read_dir(dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    let is_yaml = path
                        .extension()
                        .and_then(|e| e.to_str())
                        .map_or(false, |e| EXTENSIONS.contains(&e));
                    if !is_yaml {
                        continue;
                    }
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        if is_valid_workflow_id(stem) {
                            ids.insert(stem.to_string());
                        }
                    }
                }
            }
        }

        ids.into_iter().collect()
    }

    /// Forgets parsed files so the next lookup re-reads them.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    fn find_file(&self, id: &str) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;
        EXTENSIONS
            .iter()
            .map(|ext| dir.join(format!("{}.{}", id, ext)))
            .find(|path| path.is_file())
    }
}
