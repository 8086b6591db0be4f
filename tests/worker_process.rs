//! End-to-end tests driving the real binary as the worker process.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use runhub::config::{RunnerConfig, WorkerCommand};
use runhub::execution::Orchestrator;
use runhub::run::{RunRecord, RunStatus, WorkerMessage, WorkerResult};
use runhub::store::RunStore;
use runhub::workflow::WorkflowCatalog;
use serde_json::json;
use tempfile::tempdir;

const BIN: &str = env!("CARGO_BIN_EXE_runhub");

fn write_workflows(dir: &Path) {
    fs::create_dir_all(dir).unwrap();
    fs::write(
        dir.join("greet.yaml"),
        r#"
name: Greeting
steps:
  - id: first
    handler: echo
  - id: second
    handler: echo
    params:
      value:
        greeting: hello
"#,
    )
    .unwrap();
    fs::write(
        dir.join("broken.yaml"),
        r#"
name: Broken
steps:
  - id: ok
    handler: echo
  - id: boom
    handler: fail
    params:
      message: disk on fire
  - id: never
    handler: echo
"#,
    )
    .unwrap();
    fs::write(
        dir.join("passthrough.yaml"),
        "steps:\n  - id: only\n    handler: echo\n",
    )
    .unwrap();
}

fn worker_output(workflows: &Path, workflow_id: &str, args: &str) -> (i32, Vec<WorkerMessage>) {
    let output = Command::new(BIN)
        .arg("worker")
        .arg("--workflows-dir")
        .arg(workflows)
        .arg(workflow_id)
        .arg(args)
        .output()
        .unwrap();

    let messages = String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(WorkerMessage::decode)
        .collect();
    (output.status.code().unwrap(), messages)
}

#[test]
fn test_worker_mode_emits_protocol() {
    let dir = tempdir().unwrap();
    write_workflows(dir.path());

    let (code, messages) = worker_output(dir.path(), "greet", r#"{"run_id":"r1","input":{}}"#);

    assert_eq!(code, 0);
    let steps = messages
        .iter()
        .filter(|m| matches!(m, WorkerMessage::Step(_)))
        .count();
    assert_eq!(steps, 4);
    assert_eq!(
        messages.last(),
        Some(&WorkerMessage::Result(WorkerResult::Completed {
            output: Some(json!({"greeting": "hello"})),
            output_file: None,
        }))
    );
}

#[test]
fn test_worker_mode_exit_codes() {
    let dir = tempdir().unwrap();
    write_workflows(dir.path());

    let (code, messages) = worker_output(dir.path(), "broken", r#"{"run_id":"r2"}"#);
    assert_eq!(code, 1);
    assert!(matches!(
        messages.last(),
        Some(WorkerMessage::Result(WorkerResult::Failed { error })) if error == "disk on fire"
    ));

    let (code, _) = worker_output(dir.path(), "greet", "not json");
    assert_eq!(code, 2);
}

struct Harness {
    _dir: tempfile::TempDir,
    orchestrator: Orchestrator,
}

fn harness() -> Harness {
    let dir = tempdir().unwrap();
    let workflows = dir.path().join("workflows");
    write_workflows(&workflows);

    let mut config = RunnerConfig::new(dir.path().join("data"));
    config.set_workflows_dir(&workflows);
    config.set_worker(WorkerCommand::new(BIN).args([
        "worker".to_string(),
        "--workflows-dir".to_string(),
        workflows.display().to_string(),
    ]));
    config.set_poll_interval(Duration::from_millis(20));

    let store = Arc::new(RunStore::open(&config.data_dir).unwrap());
    let catalog = Arc::new(WorkflowCatalog::new(&workflows));
    Harness {
        orchestrator: Orchestrator::with_parts(config, store, catalog),
        _dir: dir,
    }
}

fn wait_terminal(orchestrator: &Orchestrator, run_id: &str) -> RunRecord {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        if let Some(record) = orchestrator.get(run_id).unwrap() {
            if record.is_terminal() {
                return record;
            }
        }
        assert!(Instant::now() < deadline, "run {} did not finish", run_id);
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn test_orchestrated_runs_with_real_worker() {
    let h = harness();
    let orch = &h.orchestrator;

    let ok = orch.submit("greet", json!({"name": "ada"})).unwrap();
    let failed = orch.submit("broken", json!({})).unwrap();

    let record = wait_terminal(orch, &ok);
    assert_eq!(record.status, RunStatus::Completed);
    assert_eq!(record.workflow_name, "Greeting");
    assert_eq!(record.output_data, Some(json!({"greeting": "hello"})));
    assert!(record.steps.iter().all(|s| s.status == RunStatus::Completed));
    assert!(record.logs.iter().any(|l| l.contains("Starting workflow 'greet'")));

    let record = wait_terminal(orch, &failed);
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("disk on fire"));
    assert_eq!(record.error_step.as_deref(), Some("boom"));
    assert_eq!(record.steps.get("ok").unwrap().status, RunStatus::Completed);
    assert_eq!(record.steps.get("boom").unwrap().status, RunStatus::Failed);
    assert_eq!(record.steps.get("never").unwrap().status, RunStatus::Cancelled);
}

#[test]
fn test_large_output_goes_to_file() {
    let h = harness();
    let orch = &h.orchestrator;

    let blob = "x".repeat(80 * 1024);
    let run_id = orch.submit("passthrough", json!({ "blob": blob })).unwrap();
    let record = wait_terminal(orch, &run_id);

    assert_eq!(record.status, RunStatus::Completed);
    assert_eq!(record.output_data, None);
    let file = record.output_file.expect("output file");
    let written: serde_json::Value = serde_json::from_str(&fs::read_to_string(file).unwrap()).unwrap();
    assert_eq!(written["blob"].as_str().map(str::len), Some(80 * 1024));
}
