//! Worker Mode
//!
//! Entry point of the child process started by the Process Runner. The
//! worker is invoked as `runhub worker --workflows-dir DIR <workflow_id>
//! <args_json>`, runs the workflow with the built-in handlers and writes
//! its progress as JSON lines on stdout, ending with one result line.

use std::path::{Path, PathBuf};

use log::{error, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::run::{WorkerMessage, WorkerResult};
use crate::workflow::WorkflowCatalog;

use super::engine::{Engine, EventSink, StdoutSink};
use super::handlers::HandlerRegistry;

/// Exit code for a completed run.
pub const EXIT_COMPLETED: i32 = 0;
/// Exit code for a failed run.
pub const EXIT_FAILED: i32 = 1;
/// Exit code when the arguments could not be decoded.
pub const EXIT_BAD_ARGS: i32 = 2;

/// The JSON document passed as the worker's second argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerArgs {
    pub run_id: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
}

/// Runs one workflow and reports to stdout. Returns the exit code.
pub fn run_worker(workflows_dir: &Path, workflow_id: &str, args_json: &str) -> i32 {
    run_worker_with(
        workflows_dir,
        workflow_id,
        args_json,
        HandlerRegistry::with_builtins(),
        &StdoutSink::new(),
    )
}

/// [`run_worker`] with an explicit registry and sink.
pub fn run_worker_with(
    workflows_dir: &Path,
    workflow_id: &str,
    args_json: &str,
    registry: HandlerRegistry,
    sink: &dyn EventSink,
) -> i32 {
    let args: WorkerArgs = match serde_json::from_str(args_json) {
        Ok(args) => args,
        Err(e) => {
            error!("Invalid worker arguments: {}", e);
            sink.emit(WorkerMessage::Result(WorkerResult::failed(format!(
                "Invalid worker arguments: {}",
                e
            ))));
            return EXIT_BAD_ARGS;
        }
    };

    let catalog = WorkflowCatalog::new(workflows_dir);
    let workflow = match catalog.get(workflow_id) {
        Ok(workflow) => workflow,
        Err(e) => {
            error!("{}", e);
            sink.emit(WorkerMessage::Result(WorkerResult::failed(e.to_string())));
            return EXIT_FAILED;
        }
    };

    info!("Worker running '{}' for run {}", workflow_id, args.run_id);
    let mut engine = Engine::new(workflow, registry);
    if let Some(dir) = &args.output_dir {
        engine.set_output_dir(dir);
    }

    let result = engine.run(&args.run_id, args.input, sink);
    let code = match result {
        WorkerResult::Completed { .. } => EXIT_COMPLETED,
        WorkerResult::Failed { .. } => EXIT_FAILED,
    };
    sink.emit(WorkerMessage::Result(result));
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct MemorySink(Mutex<Vec<WorkerMessage>>);

    impl EventSink for MemorySink {
        fn emit(&self, message: WorkerMessage) {
            self.0.lock().unwrap().push(message);
        }
    }

    impl MemorySink {
        fn last(&self) -> Option<WorkerMessage> {
            self.0.lock().unwrap().last().cloned()
        }
    }

    fn args(input: Value) -> String {
        serde_json::to_string(&WorkerArgs {
            run_id: "r1".into(),
            input,
            output_dir: None,
        })
        .unwrap()
    }

    #[test]
    fn test_worker_runs_workflow_from_directory() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("wf.yaml"),
            "steps:\n  - id: a\n    handler: echo\n",
        )
        .unwrap();

        let sink = MemorySink::default();
        let code = run_worker_with(
            dir.path(),
            "wf",
            &args(json!({"x": 1})),
            HandlerRegistry::with_builtins(),
            &sink,
        );

        assert_eq!(code, EXIT_COMPLETED);
        assert_eq!(
            sink.last(),
            Some(WorkerMessage::Result(WorkerResult::Completed {
                output: Some(json!({"x": 1})),
                output_file: None
            }))
        );
    }

    #[test]
    fn test_worker_reports_unknown_workflow() {
        let dir = tempdir().unwrap();
        let sink = MemorySink::default();
        let code = run_worker_with(
            dir.path(),
            "missing",
            &args(json!({})),
            HandlerRegistry::with_builtins(),
            &sink,
        );

        assert_eq!(code, EXIT_FAILED);
        assert!(matches!(
            sink.last(),
            Some(WorkerMessage::Result(WorkerResult::Failed { .. }))
        ));
    }

    #[test]
    fn test_worker_rejects_bad_args() {
        let dir = tempdir().unwrap();
        let sink = MemorySink::default();
        let code = run_worker_with(
            dir.path(),
            "wf",
            "not json",
            HandlerRegistry::with_builtins(),
            &sink,
        );
        assert_eq!(code, EXIT_BAD_ARGS);
    }

    #[test]
    fn test_worker_args_shape() {
        let decoded: WorkerArgs = serde_json::from_str(r#"{"run_id":"abc"}"#).unwrap();
        assert_eq!(decoded.input, Value::Null);
        assert_eq!(decoded.output_dir, None);
    }
}
