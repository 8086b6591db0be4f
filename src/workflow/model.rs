//! Workflow Data Model
//!
//! A workflow is an ordered list of steps, each naming the handler that
//! executes it inside the worker process.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: Nightly report
//! description: Collect and publish the nightly numbers
//! steps:
//!   - id: fetch
//!     handler: shell
//!     params:
//!       command: curl -s https://example.com/numbers.json
//!
//!   - id: publish
//!     handler: shell
//!     params:
//!       command: echo '{input}' > /tmp/report.json
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single step in a workflow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Step {
    /// Unique identifier within the workflow
    pub id: String,

    /// Name of the registered handler that runs this step
    pub handler: String,

    /// Handler-specific parameters
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Step {
    /// Creates a step with no parameters.
    ///
    /// # Example
    ///
    /// ```
    /// use runhub::workflow::Step;
    /// use serde_json::json;
    ///
    /// let step = Step::new("greet", "shell").with_params(json!({"command": "echo hi"}));
    /// assert_eq!(step.handler, "shell");
    /// ```
    pub fn new(id: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            handler: handler.into().trim().to_string(),
            params: Value::Null,
            description: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Looks up a string parameter.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    /// Looks up an unsigned integer parameter.
    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.params.get(key).and_then(Value::as_u64)
    }
}

/// A complete workflow definition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Workflow {
    /// Identifier; filled from the file name when omitted
    #[serde(default)]
    pub id: String,

    /// Human readable name; defaults to the id
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Steps in execution order
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Workflow {
    /// Creates an empty workflow.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            steps: Vec::new(),
        }
    }

    /// Creates a workflow from a list of steps.
    pub fn from_steps(id: impl Into<String>, steps: Vec<Step>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: None,
            steps,
        }
    }

    /// Appends a step. Fails if the id is already taken.
    pub fn add_step(&mut self, step: Step) -> Result<(), String> {
        if self.steps.iter().any(|s| s.id == step.id) {
            return Err(format!("Step '{}' already exists", step.id));
        }
        self.steps.push(step);
        Ok(())
    }

    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Step ids in declaration order.
    pub fn step_ids(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.id.as_str())
    }

    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_creation() {
        let step = Step::new(" fetch ", "shell")
            .with_params(json!({"command": "echo hi", "retries": 2}))
            .with_description("Fetch data");

        assert_eq!(step.id, "fetch");
        assert_eq!(step.param_str("command"), Some("echo hi"));
        assert_eq!(step.param_u64("retries"), Some(2));
        assert_eq!(step.param_str("missing"), None);
    }

    #[test]
    fn test_workflow_add_step() {
        let mut workflow = Workflow::new("wf", "WF");
        let step = Step::new("step1", "echo");

        assert!(workflow.add_step(step.clone()).is_ok());
        assert!(workflow.add_step(step).is_err());
        assert_eq!(workflow.len(), 1);
        assert!(workflow.get_step("step1").is_some());
        assert!(workflow.get_step("nope").is_none());
    }

    #[test]
    fn test_step_ids_keep_order() {
        let workflow = Workflow::from_steps(
            "wf",
            vec![Step::new("c", "echo"), Step::new("a", "echo"), Step::new("b", "echo")],
        );
        let ids: Vec<_> = workflow.step_ids().collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_display_name_falls_back_to_id() {
        let mut workflow = Workflow::new("wf", "");
        assert_eq!(workflow.display_name(), "wf");
        workflow.name = "Nice".into();
        assert_eq!(workflow.display_name(), "Nice");
    }

    #[test]
    fn test_yaml_shape() {
        let yaml = r#"
name: Demo
steps:
  - id: one
    handler: echo
  - id: two
    handler: sleep
    params:
      ms: 5
"#;
        let workflow: Workflow = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(workflow.id, "");
        assert_eq!(workflow.name, "Demo");
        assert_eq!(workflow.steps[0].params, Value::Null);
        assert_eq!(workflow.steps[1].param_u64("ms"), Some(5));
    }
}
