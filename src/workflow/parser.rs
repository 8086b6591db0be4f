//! Workflow Parser
//!
//! Loads workflow definitions from YAML files. The workflow id defaults
//! to the file stem and the name defaults to the id.

use std::fs;
use std::path::Path;

use log::{debug, info};

use super::model::Workflow;
use super::validator::validate_workflow;
use crate::error::WorkflowError;

/// Parses a workflow from YAML text.
///
/// `fallback_id` is used when the document does not carry an `id`.
pub fn parse_workflow(
    yaml_content: &str,
    fallback_id: &str,
    path: &Path,
) -> Result<Workflow, WorkflowError> {
    let mut workflow: Workflow =
        serde_yaml::from_str(yaml_content).map_err(|e| WorkflowError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;

    if workflow.id.trim().is_empty() {
        workflow.id = fallback_id.to_string();
    }
    if workflow.name.trim().is_empty() {
        workflow.name = workflow.id.clone();
    }

    validate_workflow(&workflow)?;
    Ok(workflow)
}

/// Loads and validates a workflow from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use runhub::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("workflows/nightly.yaml")?;
///     println!("Loaded {} steps", workflow.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<Workflow, WorkflowError> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let yaml_content = fs::read_to_string(path).map_err(|e| WorkflowError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    debug!("YAML content loaded ({} bytes)", yaml_content.len());

    let fallback_id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();

    let workflow = parse_workflow(&yaml_content, fallback_id, path)?;
    info!(
        "Parsed workflow '{}' with {} steps",
        workflow.id,
        workflow.steps.len()
    );
    Ok(workflow)
}

/// Saves a workflow to a YAML file.
pub fn save_workflow(workflow: &Workflow, path: impl AsRef<Path>) -> Result<(), WorkflowError> {
    let path = path.as_ref();
    let yaml_content = serde_yaml::to_string(workflow).map_err(|e| WorkflowError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    fs::write(path, yaml_content).map_err(|e| WorkflowError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    info!("Workflow saved to: {}", path.display());
    Ok(())
}
