//! Run Data Model
//!
//! A [`RunRecord`] is the aggregate root for one workflow execution. It is
//! created `Pending` at admission, driven by step events while its worker
//! runs, and frozen once it reaches a terminal status.
//!
//! # Per-run file format
//!
//! ```json
//! {
//!   "id": "7f3c...",
//!   "workflow_id": "nightly",
//!   "workflow_name": "Nightly report",
//!   "status": "failed",
//!   "current_step": null,
//!   "started_at": "2024-05-01T10:00:00.000000Z",
//!   "completed_at": "2024-05-01T10:00:03.500000Z",
//!   "duration_ms": 3500,
//!   "input_data": {"date": "2024-05-01"},
//!   "output_data": null,
//!   "output_file": null,
//!   "steps": {
//!     "fetch": {"step_id": "fetch", "status": "completed", ...},
//!     "render": {"step_id": "render", "status": "failed", ...}
//!   },
//!   "error": "template missing",
//!   "error_step": "render",
//!   "logs": ["[2024-05-01T10:00:00.100000Z] fetching"]
//! }
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use log::debug;
use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::event::{StepEvent, StepEventKind};
use super::timestamp;

/// Lifecycle status shared by runs and steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    #[serde(alias = "canceled")]
    Cancelled,
}

impl RunStatus {
    pub const ALL: [RunStatus; 5] = [
        RunStatus::Pending,
        RunStatus::Running,
        RunStatus::Completed,
        RunStatus::Failed,
        RunStatus::Cancelled,
    ];

    /// Returns true for `Completed`, `Failed` and `Cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed | Self::Cancelled => 2,
        }
    }

    /// Whether moving from `self` to `next` respects
    /// `Pending -> Running -> terminal`. Skipping `Running` is allowed.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(format!("Unknown run status: '{}'", other)),
        }
    }
}

/// Lifecycle of one declared step within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    /// Filled from the map key when missing in older files
    #[serde(default)]
    pub step_id: String,
    pub status: RunStatus,
    #[serde(default, with = "timestamp::option")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp::option")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_millis")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl StepState {
    pub fn pending(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: RunStatus::Pending,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            error: None,
        }
    }

    /// Moves the step forward; refuses regressions and repeated transitions.
    fn advance(&mut self, next: RunStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        true
    }

    fn close(
        &mut self,
        status: RunStatus,
        at: DateTime<Utc>,
        duration_ms: Option<u64>,
        error: Option<String>,
    ) -> bool {
        if !self.advance(status) {
            return false;
        }
        self.completed_at = Some(at);
        self.duration_ms = duration_ms.or_else(|| {
            self.started_at
                .as_ref()
                .map(|start| timestamp::millis_between(start, &at))
        });
        if error.is_some() {
            self.error = error;
        }
        true
    }
}

/// Step states in declaration order with unique ids.
///
/// Serialized as a JSON object keyed by step id, preserving order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepMap {
    steps: Vec<StepState>,
}

impl StepMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates `Pending` states for the given ids, skipping duplicates.
    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut map = Self::new();
        for id in ids {
            map.insert(StepState::pending(id));
        }
        map
    }

    pub fn get(&self, step_id: &str) -> Option<&StepState> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn get_mut(&mut self, step_id: &str) -> Option<&mut StepState> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }

    /// Inserts a state, replacing one with the same id in place.
    pub fn insert(&mut self, state: StepState) {
        match self.get_mut(&state.step_id) {
            Some(existing) => *existing = state,
            None => self.steps.push(state),
        }
    }

    fn get_or_insert(&mut self, step_id: &str) -> &mut StepState {
        let index = match self.steps.iter().position(|s| s.step_id == step_id) {
            Some(index) => index,
            None => {
                self.steps.push(StepState::pending(step_id));
                self.steps.len() - 1
            }
        };
        &mut self.steps[index]
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.get(step_id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepState> {
        self.steps.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.step_id.as_str())
    }

    /// Returns the step currently running, if any.
    pub fn running(&self) -> Option<&StepState> {
        self.steps.iter().find(|s| s.status == RunStatus::Running)
    }

    pub fn count(&self, status: RunStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl Serialize for StepMap {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.steps.len()))?;
        for step in &self.steps {
            map.serialize_entry(&step.step_id, step)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for StepMap {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(StepMapVisitor)
    }
}

struct StepMapVisitor;

impl<'de> Visitor<'de> for StepMapVisitor {
    type Value = StepMap;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an object keyed by step id or a list of step states")
    }

    fn visit_map<A>(self, mut access: A) -> Result<StepMap, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut map = StepMap::new();
        while let Some((key, mut state)) = access.next_entry::<String, StepState>()? {
            if state.step_id.is_empty() {
                state.step_id = key;
            }
            map.insert(state);
        }
        Ok(map)
    }

    fn visit_seq<A>(self, mut access: A) -> Result<StepMap, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut map = StepMap::new();
        while let Some(state) = access.next_element::<StepState>()? {
            if state.step_id.is_empty() {
                return Err(de::Error::custom("step state in list form needs a step_id"));
            }
            map.insert(state);
        }
        Ok(map)
    }

    fn visit_unit<E>(self) -> Result<StepMap, E>
    where
        E: de::Error,
    {
        Ok(StepMap::new())
    }
}

/// Accepts integer or floating point milliseconds (older files used floats).
fn lenient_millis<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => {
            if let Some(v) = n.as_u64() {
                Ok(Some(v))
            } else if let Some(v) = n.as_f64() {
                Ok(Some(v.max(0.0).round() as u64))
            } else {
                Err(de::Error::custom("invalid duration"))
            }
        }
        Some(other) => Err(de::Error::custom(format!(
            "expected milliseconds, found {}",
            other
        ))),
    }
}

/// One execution of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub workflow_id: String,
    #[serde(default)]
    pub workflow_name: String,
    pub status: RunStatus,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default, with = "timestamp::option")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp::option")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_millis")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub input_data: Value,
    #[serde(default)]
    pub output_data: Option<Value>,
    #[serde(default)]
    pub output_file: Option<String>,
    #[serde(default)]
    pub steps: StepMap,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_step: Option<String>,
    #[serde(default)]
    pub logs: Vec<String>,
}

impl RunRecord {
    /// Creates a `Pending` record with one `Pending` state per declared step.
    pub fn new<I, S>(
        id: impl Into<String>,
        workflow_id: impl Into<String>,
        workflow_name: impl Into<String>,
        step_ids: I,
        input_data: Value,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            workflow_id: workflow_id.into(),
            workflow_name: workflow_name.into(),
            status: RunStatus::Pending,
            current_step: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            input_data,
            output_data: None,
            output_file: None,
            steps: StepMap::from_ids(step_ids),
            error: None,
            error_step: None,
            logs: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Moves a pending run to `Running`.
    pub fn mark_running(&mut self, at: DateTime<Utc>) -> bool {
        if self.status != RunStatus::Pending {
            return false;
        }
        self.status = RunStatus::Running;
        self.started_at = Some(at);
        true
    }

    /// Appends a rendered log line. Ignored once the run is terminal.
    pub fn append_log(&mut self, line: impl Into<String>) {
        if !self.is_terminal() {
            self.logs.push(line.into());
        }
    }

    /// Applies a worker step event.
    ///
    /// Returns false when the event was ignored: the run is terminal, or the
    /// event would move the step backwards (duplicates are expected since
    /// delivery is at-least-once).
    pub fn apply_step_event(&mut self, event: &StepEvent) -> bool {
        if self.is_terminal() {
            return false;
        }

        match event.kind {
            StepEventKind::Start => {
                // Only one step may run at a time; a new start closes the previous one.
                let previous = self
                    .steps
                    .running()
                    .filter(|s| s.step_id != event.step_id)
                    .map(|s| s.step_id.clone());
                if let Some(previous) = previous {
                    debug!(
                        "Run {}: step '{}' started while '{}' was running",
                        self.id, event.step_id, previous
                    );
                    if let Some(state) = self.steps.get_mut(&previous) {
                        state.close(RunStatus::Completed, event.timestamp, None, None);
                    }
                }

                let state = self.steps.get_or_insert(&event.step_id);
                if !state.advance(RunStatus::Running) {
                    return false;
                }
                state.started_at = Some(event.timestamp);
                self.current_step = Some(event.step_id.clone());
                true
            }
            StepEventKind::Complete => {
                let state = self.steps.get_or_insert(&event.step_id);
                if !state.close(
                    RunStatus::Completed,
                    event.timestamp,
                    event.duration_ms,
                    None,
                ) {
                    return false;
                }
                self.clear_current(&event.step_id);
                true
            }
            StepEventKind::Error => {
                let state = self.steps.get_or_insert(&event.step_id);
                let error = event
                    .error
                    .clone()
                    .or_else(|| Some("Step failed".to_string()));
                if !state.close(RunStatus::Failed, event.timestamp, event.duration_ms, error) {
                    return false;
                }
                self.error_step = Some(event.step_id.clone());
                self.clear_current(&event.step_id);
                true
            }
        }
    }

    fn clear_current(&mut self, step_id: &str) {
        if self.current_step.as_deref() == Some(step_id) {
            self.current_step = None;
        }
    }

    /// Completes the run with the worker's output.
    pub fn finish_completed(
        &mut self,
        output: Option<Value>,
        output_file: Option<String>,
        at: DateTime<Utc>,
    ) -> bool {
        if !self.close(RunStatus::Completed, at, RunStatus::Completed) {
            return false;
        }
        self.output_data = output.filter(|v| !v.is_null());
        self.output_file = output_file;
        true
    }

    /// Fails the run. The failing step is the one that reported an error,
    /// otherwise the step that was running.
    pub fn finish_failed(&mut self, error: impl Into<String>, at: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        let failing_step = self.error_step.clone().or_else(|| self.current_step.clone());
        self.close(RunStatus::Failed, at, RunStatus::Failed);
        self.error = Some(error.into());
        self.error_step = failing_step;
        true
    }

    /// Cancels the run, whether it was queued or running.
    pub fn finish_cancelled(&mut self, at: DateTime<Utc>) -> bool {
        self.close(RunStatus::Cancelled, at, RunStatus::Cancelled)
    }

    /// Shared terminal transition: running steps take `running_to`,
    /// steps that never ran become `Cancelled`.
    fn close(&mut self, status: RunStatus, at: DateTime<Utc>, running_to: RunStatus) -> bool {
        if !self.status.can_transition_to(status) {
            return false;
        }

        for step in self.steps.steps.iter_mut() {
            match step.status {
                RunStatus::Running => {
                    step.close(running_to, at, None, None);
                }
                RunStatus::Pending => {
                    step.close(RunStatus::Cancelled, at, None, None);
                }
                _ => {}
            }
        }

        self.status = status;
        self.current_step = None;
        self.completed_at = Some(at);
        self.duration_ms = self
            .started_at
            .as_ref()
            .map(|start| timestamp::millis_between(start, &at));
        true
    }

    /// Projection used by the run index.
    pub fn index_entry(&self) -> RunIndexEntry {
        RunIndexEntry {
            id: self.id.clone(),
            workflow_id: self.workflow_id.clone(),
            workflow_name: self.workflow_name.clone(),
            status: self.status,
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_ms: self.duration_ms,
            error: self.error.clone(),
        }
    }
}

/// Compact listing projection of a [`RunRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunIndexEntry {
    pub id: String,
    pub workflow_id: String,
    #[serde(default)]
    pub workflow_name: String,
    pub status: RunStatus,
    #[serde(default, with = "timestamp::option")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp::option")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_millis")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}
