//! Workflow Execution Engine
//!
//! Runs a workflow's steps inside the worker process:
//! - Steps run sequentially in declaration order
//! - Each step receives the previous step's output (the first step gets
//!   the run input)
//! - Progress is reported through an [`EventSink`] as step events and
//!   log lines, followed by exactly one result
//!
//! Outputs too large to embed in a run record are written to
//! `{output_dir}/{run_id}.json` and reported by path.

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{error, info, warn};
use serde_json::Value;

use crate::run::{LogLine, StepEvent, WorkerMessage, WorkerResult};
use crate::workflow::{Step, Workflow};

use super::handlers::{HandlerRegistry, StepContext};

/// Serialized outputs above this size go to a file instead of the record.
pub const DEFAULT_INLINE_LIMIT: usize = 64 * 1024;

/// Destination of worker progress messages.
pub trait EventSink: Send + Sync {
    fn emit(&self, message: WorkerMessage);
}

/// Writes each message as one JSON line on stdout.
pub struct StdoutSink {
    out: Mutex<io::Stdout>,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self {
            out: Mutex::new(io::stdout()),
        }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for StdoutSink {
    fn emit(&self, message: WorkerMessage) {
        let line = match message.encode() {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to encode worker message: {}", e);
                return;
            }
        };
        let mut out = self.out.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // The parent reads line by line; flush so progress is not delayed
        if writeln!(out, "{}", line).and_then(|_| out.flush()).is_err() {
            warn!("Worker stdout closed, dropping message");
        }
    }
}

/// Routes handler log calls to the sink, tagged with the step id.
struct StepLogger<'a> {
    sink: &'a dyn EventSink,
    step_id: &'a str,
}

impl StepContext for StepLogger<'_> {
    fn log(&self, message: &str) {
        self.sink.emit(WorkerMessage::Log(LogLine::new(format!(
            "[{}] {}",
            self.step_id, message
        ))));
    }
}

/// Sequential step engine.
///
/// # Example
///
/// ```rust,no_run
/// use runhub::execution::{Engine, HandlerRegistry, StdoutSink};
/// use runhub::workflow::WorkflowCatalog;
/// use serde_json::json;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let catalog = WorkflowCatalog::new("workflows");
///     let mut engine = Engine::new(catalog.get("nightly")?, HandlerRegistry::with_builtins());
///     engine.set_output_dir("/tmp/outputs");
///
///     let result = engine.run("run-1", json!({}), &StdoutSink::new());
///     println!("{:?}", result);
///     Ok(())
/// }
/// ```
pub struct Engine {
    workflow: Arc<Workflow>,
    registry: HandlerRegistry,
    output_dir: Option<PathBuf>,
    inline_limit: usize,
}

impl Engine {
    pub fn new(workflow: Arc<Workflow>, registry: HandlerRegistry) -> Self {
        Self {
            workflow,
            registry,
            output_dir: None,
            inline_limit: DEFAULT_INLINE_LIMIT,
        }
    }

    /// Sets where oversized outputs are written.
    pub fn set_output_dir(&mut self, dir: impl Into<PathBuf>) {
        self.output_dir = Some(dir.into());
    }

    /// Sets the largest output (in serialized bytes) kept inline.
    pub fn set_inline_limit(&mut self, limit: usize) {
        self.inline_limit = limit;
    }

    /// Executes every step and returns the result.
    ///
    /// The result is also the last thing the caller should emit; the
    /// engine itself only emits step events and log lines.
    pub fn run(&self, run_id: &str, input: Value, sink: &dyn EventSink) -> WorkerResult {
        let start_time = Instant::now();
        sink.emit(WorkerMessage::Log(LogLine::new(format!(
            "Starting workflow '{}' ({} steps)",
            self.workflow.id,
            self.workflow.steps.len()
        ))));

        let mut current = input;
        for step in &self.workflow.steps {
            current = match self.run_step(step, current, sink) {
                Ok(output) => output,
                Err(message) => return WorkerResult::failed(message),
            };
        }

        info!(
            "Workflow '{}' finished in {:.2?}",
            self.workflow.id,
            start_time.elapsed()
        );
        self.finish(run_id, current)
    }

    fn run_step(&self, step: &Step, input: Value, sink: &dyn EventSink) -> Result<Value, String> {
        sink.emit(WorkerMessage::Step(StepEvent::start(&step.id)));
        let started = Instant::now();

        let logger = StepLogger {
            sink,
            step_id: &step.id,
        };
        let outcome = self
            .registry
            .get(&step.handler)
            .and_then(|handler| handler.run(step, input, &logger));
        let elapsed = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(output) => {
                sink.emit(WorkerMessage::Step(StepEvent::complete(&step.id, elapsed)));
                Ok(output)
            }
            Err(e) => {
                let message = e.to_string();
                error!("Step '{}' failed: {}", step.id, message);
                sink.emit(WorkerMessage::Step(StepEvent::error(
                    &step.id, elapsed, &message,
                )));
                Err(message)
            }
        }
    }

    fn finish(&self, run_id: &str, value: Value) -> WorkerResult {
        if value.is_null() {
            return WorkerResult::Completed {
                output: None,
                output_file: None,
            };
        }

        let Some(dir) = &self.output_dir else {
            return WorkerResult::Completed {
                output: Some(value),
                output_file: None,
            };
        };

        let bytes = match serde_json::to_vec(&value) {
            Ok(bytes) => bytes,
            Err(e) => return WorkerResult::failed(format!("Failed to encode output: {}", e)),
        };
        if bytes.len() <= self.inline_limit {
            return WorkerResult::Completed {
                output: Some(value),
                output_file: None,
            };
        }

        let path = dir.join(format!("{}.json", run_id));
        let written = fs::create_dir_all(dir).and_then(|_| fs::write(&path, &bytes));
        match written {
            Ok(()) => {
                info!("Output of {} bytes written to {}", bytes.len(), path.display());
                WorkerResult::Completed {
                    output: None,
                    output_file: Some(path.display().to_string()),
                }
            }
            Err(e) => WorkerResult::failed(format!(
                "Failed to write output file {}: {}",
                path.display(),
                e
            )),
        }
    }
}
