//! Workflow Validation
//!
//! Checks a parsed workflow before it is admitted:
//! - Workflow id is safe to use as a file name
//! - At least one step
//! - Step ids are non-blank and unique
//! - Every step names a handler

use std::collections::HashSet;

use log::{debug, info};

use super::model::{Step, Workflow};
use crate::error::WorkflowError;

/// Validation problems, rendered into user-facing messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyWorkflow,
    DuplicateStepId(String),
    EmptyStepId,
    EmptyHandler(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyWorkflow => write!(f, "Workflow has no steps"),
            Self::DuplicateStepId(id) => write!(f, "Duplicate step ID: '{}'", id),
            Self::EmptyStepId => write!(f, "Step has empty or whitespace-only ID"),
            Self::EmptyHandler(step) => write!(f, "Step '{}' has no handler specified", step),
        }
    }
}

/// Returns true if `id` can name a workflow file.
pub fn is_valid_workflow_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn validate_step(step: &Step) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if step.id.trim().is_empty() {
        errors.push(ValidationError::EmptyStepId);
        return errors;
    }

    if step.handler.trim().is_empty() {
        errors.push(ValidationError::EmptyHandler(step.id.clone()));
    }

    errors
}

/// Collects every problem in the workflow without stopping at the first.
pub fn quick_validate(workflow: &Workflow) -> Vec<ValidationError> {
    if workflow.steps.is_empty() {
        return vec![ValidationError::EmptyWorkflow];
    }

    let mut errors = Vec::new();
    let mut seen_ids: HashSet<&str> = HashSet::new();
    for step in &workflow.steps {
        errors.extend(validate_step(step));
        if !step.id.trim().is_empty() && !seen_ids.insert(step.id.as_str()) {
            errors.push(ValidationError::DuplicateStepId(step.id.clone()));
        }
    }
    errors
}

/// Validates the entire workflow.
pub fn validate_workflow(workflow: &Workflow) -> Result<(), WorkflowError> {
    if !is_valid_workflow_id(&workflow.id) {
        return Err(WorkflowError::InvalidId(workflow.id.clone()));
    }

    let errors = quick_validate(workflow);
    if !errors.is_empty() {
        return Err(WorkflowError::Invalid {
            workflow: workflow.id.clone(),
            problems: errors.iter().map(|e| e.to_string()).collect(),
        });
    }

    debug!(
        "Step order for '{}': {:?}",
        workflow.id,
        workflow.step_ids().collect::<Vec<_>>()
    );
    info!(
        "Workflow '{}' validated: {} steps",
        workflow.id,
        workflow.steps.len()
    );
    Ok(())
}
