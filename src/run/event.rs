//! Worker Progress Messages
//!
//! The worker process reports progress as JSON lines on stdout, one
//! [`WorkerMessage`] per line:
//!
//! ```text
//! {"type":"log","timestamp":"2024-05-01T10:00:00.000000Z","message":"fetching"}
//! {"type":"step","step_id":"fetch","kind":"start","timestamp":"..."}
//! {"type":"step","step_id":"fetch","kind":"complete","timestamp":"...","duration_ms":120}
//! {"type":"result","status":"completed","output":{"ok":true}}
//! {"type":"result","status":"failed","error":"boom"}
//! ```
//!
//! Lines that do not decode are treated as plain log text by the runner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::timestamp;

/// What happened to a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepEventKind {
    Start,
    Complete,
    Error,
}

/// A single step lifecycle event emitted by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEvent {
    pub step_id: String,
    pub kind: StepEventKind,
    #[serde(with = "timestamp", default = "timestamp::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepEvent {
    pub fn start(step_id: impl Into<String>) -> Self {
        Self::new(step_id, StepEventKind::Start)
    }

    pub fn complete(step_id: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            duration_ms: Some(duration_ms),
            ..Self::new(step_id, StepEventKind::Complete)
        }
    }

    pub fn error(step_id: impl Into<String>, duration_ms: u64, error: impl Into<String>) -> Self {
        Self {
            duration_ms: Some(duration_ms),
            error: Some(error.into()),
            ..Self::new(step_id, StepEventKind::Error)
        }
    }

    fn new(step_id: impl Into<String>, kind: StepEventKind) -> Self {
        Self {
            step_id: step_id.into(),
            kind,
            timestamp: timestamp::now(),
            duration_ms: None,
            error: None,
        }
    }
}

/// A timestamped line of free-form log text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    #[serde(with = "timestamp", default = "timestamp::now")]
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl LogLine {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            timestamp: timestamp::now(),
            message: message.into(),
        }
    }

    /// Renders the line as stored in `RunRecord::logs`.
    pub fn render(&self) -> String {
        format!("[{}] {}", timestamp::format(&self.timestamp), self.message)
    }
}

/// The terminal message of a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WorkerResult {
    Completed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_file: Option<String>,
    },
    Failed {
        error: String,
    },
}

impl WorkerResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
        }
    }
}

/// One line of the worker's stdout protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerMessage {
    Log(LogLine),
    Step(StepEvent),
    Result(WorkerResult),
}

impl WorkerMessage {
    /// Encodes the message as a single JSON line (without the newline).
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decodes one protocol line, returning `None` for anything else.
    pub fn decode(line: &str) -> Option<Self> {
        let line = line.trim();
        if !line.starts_with('{') {
            return None;
        }
        serde_json::from_str(line).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_step_event() {
        let msg = WorkerMessage::decode(
            r#"{"type":"step","step_id":"s1","kind":"complete","timestamp":"2024-01-01T00:00:00.000000Z","duration_ms":12}"#,
        )
        .unwrap();

        match msg {
            WorkerMessage::Step(ev) => {
                assert_eq!(ev.step_id, "s1");
                assert_eq!(ev.kind, StepEventKind::Complete);
                assert_eq!(ev.duration_ms, Some(12));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_decode_step_event_without_timestamp() {
        let msg = WorkerMessage::decode(r#"{"type":"step","step_id":"s1","kind":"start"}"#);
        assert!(matches!(msg, Some(WorkerMessage::Step(_))));
    }

    #[test]
    fn test_result_wire_shape() {
        let msg = WorkerMessage::Result(WorkerResult::failed("boom"));
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "result", "status": "failed", "error": "boom"})
        );
    }

    #[test]
    fn test_decode_completed_result() {
        let msg = WorkerMessage::decode(r#"{"type":"result","status":"completed","output":{"n":1}}"#);
        assert_eq!(
            msg,
            Some(WorkerMessage::Result(WorkerResult::Completed {
                output: Some(json!({"n": 1})),
                output_file: None,
            }))
        );
    }

    #[test]
    fn test_decode_rejects_plain_text() {
        assert!(WorkerMessage::decode("hello world").is_none());
        assert!(WorkerMessage::decode("{not json").is_none());
        assert!(WorkerMessage::decode(r#"{"type":"unknown"}"#).is_none());
    }

    #[test]
    fn test_log_line_render() {
        let line = LogLine {
            timestamp: timestamp::parse("2024-01-01T00:00:00Z").unwrap(),
            message: "hello".to_string(),
        };
        assert_eq!(line.render(), "[2024-01-01T00:00:00.000000Z] hello");
    }
}
