//! Run Orchestrator
//!
//! Ties the execution queue, the process runner and the run store
//! together. Clients submit, cancel and query runs through
//! [`Orchestrator`]; one consumer thread executes queued runs one at a
//! time.
//!
//! Live (not yet persisted as terminal) records are owned by the
//! orchestrator and kept in memory. Worker progress is applied to them
//! as it arrives and written to the store every `flush_interval` and at
//! the terminal transition. Once a terminal record is saved the
//! in-memory copy is dropped and the store becomes the source of truth.
//!
//! Locks guard the live map, the cancel set, the worker handle table and
//! the observer list. None of them is held across file I/O, process
//! waits or channel receives.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde_json::Value;
use uuid::Uuid;

use crate::config::RunnerConfig;
use crate::error::{AdmissionError, StoreError};
use crate::monitoring::ResourceMonitor;
use crate::run::{timestamp, RunRecord, RunStatus, StepEvent, WorkerResult};
use crate::store::{RunPage, RunQuery, RunStore};
use crate::workflow::WorkflowCatalog;

use super::queue::{ExecutionQueue, Pop, QueueStatus, QueuedJob};
use super::runner::{ProcessRunner, Termination, WorkerChannels, WorkerHandle};
use super::worker::WorkerArgs;

/// How long the idle consumer waits on the queue before housekeeping.
const IDLE_POLL: Duration = Duration::from_millis(500);

/// Longest the consumer keeps draining a finished worker's output.
const DRAIN_WINDOW: Duration = Duration::from_secs(1);

/// Progress notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum RunUpdate {
    Status { run_id: String, status: RunStatus },
    Step { run_id: String, event: StepEvent },
    Log { run_id: String, line: String },
}

impl RunUpdate {
    pub fn run_id(&self) -> &str {
        match self {
            Self::Status { run_id, .. } | Self::Step { run_id, .. } | Self::Log { run_id, .. } => {
                run_id
            }
        }
    }
}

/// How the consumer stopped supervising a worker.
enum Finish {
    Result(WorkerResult),
    Cancelled(Termination),
}

struct Shared {
    config: RunnerConfig,
    store: Arc<RunStore>,
    catalog: Arc<WorkflowCatalog>,
    runner: ProcessRunner,
    queue: ExecutionQueue,
    live: Mutex<HashMap<String, RunRecord>>,
    cancel_requests: Mutex<HashSet<String>>,
    handles: Mutex<HashMap<String, WorkerHandle>>,
    observers: Mutex<Vec<Sender<RunUpdate>>>,
    shutting_down: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Client-facing run orchestration.
///
/// # Example
///
/// ```rust,no_run
/// use runhub::config::RunnerConfig;
/// use runhub::execution::Orchestrator;
/// use serde_json::json;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let orchestrator = Orchestrator::start(RunnerConfig::from_env())?;
///     let run_id = orchestrator.submit("nightly", json!({"day": "monday"}))?;
///
///     let status = orchestrator.queue_status();
///     println!("running: {:?}, queued: {}", status.current_running, status.queue_size);
///
///     if let Some(record) = orchestrator.get(&run_id)? {
///         println!("{} is {}", record.id, record.status);
///     }
///     Ok(())
/// }
/// ```
pub struct Orchestrator {
    shared: Arc<Shared>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Opens the store and catalog named by `config` and starts the consumer.
    pub fn start(config: RunnerConfig) -> Result<Self, StoreError> {
        let store = RunStore::open_with(
            &config.data_dir,
            config.index_capacity,
            config.record_cache_capacity,
        )?;
        let catalog = WorkflowCatalog::new(&config.workflows_dir);
        Ok(Self::with_parts(config, Arc::new(store), Arc::new(catalog)))
    }

    /// Starts the consumer over an existing store and catalog.
    pub fn with_parts(
        config: RunnerConfig,
        store: Arc<RunStore>,
        catalog: Arc<WorkflowCatalog>,
    ) -> Self {
        let recovered = recover_interrupted(&store);
        if recovered > 0 {
            warn!("Marked {} interrupted runs as failed", recovered);
        }

        let runner = ProcessRunner::new(config.worker_command());
        let shared = Arc::new(Shared {
            config,
            store,
            catalog,
            runner,
            queue: ExecutionQueue::new(),
            live: Mutex::new(HashMap::new()),
            cancel_requests: Mutex::new(HashSet::new()),
            handles: Mutex::new(HashMap::new()),
            observers: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        });

        let consumer = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || shared.consume())
        };

        Self {
            shared,
            consumer: Mutex::new(Some(consumer)),
        }
    }

    pub fn store(&self) -> &Arc<RunStore> {
        &self.shared.store
    }

    pub fn catalog(&self) -> &Arc<WorkflowCatalog> {
        &self.shared.catalog
    }

    /// Admits a run and returns its id without waiting for execution.
    pub fn submit(&self, workflow_id: &str, input: Value) -> Result<String, AdmissionError> {
        let shared = &self.shared;
        if shared.is_shutting_down() {
            return Err(AdmissionError::ShuttingDown);
        }

        let workflow = shared
            .catalog
            .get(workflow_id)
            .map_err(AdmissionError::UnknownWorkflow)?;

        if !input.is_object() {
            return Err(AdmissionError::MalformedInput(format!(
                "input must be a JSON object, got {}",
                json_kind(&input)
            )));
        }

        let run_id = Uuid::new_v4().to_string();
        let record = RunRecord::new(
            &run_id,
            &workflow.id,
            workflow.display_name(),
            workflow.step_ids(),
            input,
        );

        if let Err(e) = shared.store.save(&record) {
            warn!("Run {} admitted but not yet persisted: {}", run_id, e);
        }
        lock(&shared.live).insert(run_id.clone(), record);

        let job = QueuedJob {
            run_id: run_id.clone(),
            workflow_id: workflow.id.clone(),
        };
        if !shared.queue.push(job) {
            lock(&shared.live).remove(&run_id);
            if let Err(e) = shared.store.delete(&run_id) {
                warn!("Failed to remove rejected run {}: {}", run_id, e);
            }
            return Err(AdmissionError::ShuttingDown);
        }

        info!("Queued run {} for workflow '{}'", run_id, workflow.id);
        shared.notify(RunUpdate::Status {
            run_id: run_id.clone(),
            status: RunStatus::Pending,
        });
        Ok(run_id)
    }

    /// Requests cancellation of a queued or running run.
    ///
    /// Returns false if the run is unknown or already terminal. The
    /// transition itself happens on the consumer thread.
    pub fn cancel(&self, run_id: &str) -> bool {
        let cancellable = lock(&self.shared.live)
            .get(run_id)
            .map_or(false, |record| !record.is_terminal());
        if !cancellable {
            return false;
        }

        let newly = lock(&self.shared.cancel_requests).insert(run_id.to_string());
        if newly {
            info!("Cancellation requested for run {}", run_id);
        }
        true
    }

    /// Looks a run up in memory first, then in the store.
    pub fn get(&self, run_id: &str) -> Result<Option<RunRecord>, StoreError> {
        if let Some(record) = self.shared.snapshot(run_id) {
            return Ok(Some(record));
        }
        self.shared.store.get(run_id)
    }

    pub fn list(&self, query: &RunQuery) -> Result<RunPage, StoreError> {
        self.shared.store.list(query)
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.shared.queue.status()
    }

    /// Deletes a finished run. Live runs are refused and return false.
    pub fn delete(&self, run_id: &str) -> Result<bool, StoreError> {
        if lock(&self.shared.live).contains_key(run_id) {
            warn!("Refusing to delete live run {}", run_id);
            return Ok(false);
        }
        self.shared.store.delete(run_id)
    }

    /// Receives every update from now on, per run in emission order.
    pub fn subscribe(&self) -> Receiver<RunUpdate> {
        let (tx, rx) = channel();
        lock(&self.shared.observers).push(tx);
        rx
    }

    /// Stops admission, cancels queued and running runs, and joins the
    /// consumer. Safe to call more than once.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        let first = !shared.shutting_down.swap(true, Ordering::SeqCst);
        if first {
            info!("Shutting down orchestrator");
        }

        shared.queue.close();
        for job in shared.queue.drain() {
            shared.cancel_before_start(&job.run_id);
        }

        let consumer = lock(&self.consumer).take();
        if let Some(consumer) = consumer {
            if consumer.join().is_err() {
                error!("Run consumer thread panicked");
            }
        }

        let leftover: Vec<(String, WorkerHandle)> = lock(&shared.handles).drain().collect();
        for (run_id, handle) in leftover {
            warn!("Terminating leftover worker for run {}", run_id);
            ProcessRunner::terminate(&handle, shared.config.grace_period);
        }

        shared.retry_pending_saves();
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn cancel_requested(&self, run_id: &str) -> bool {
        self.is_shutting_down() || lock(&self.cancel_requests).contains(run_id)
    }

    fn snapshot(&self, run_id: &str) -> Option<RunRecord> {
        lock(&self.live).get(run_id).cloned()
    }

    fn with_live<R>(&self, run_id: &str, f: impl FnOnce(&mut RunRecord) -> R) -> Option<R> {
        lock(&self.live).get_mut(run_id).map(f)
    }

    fn notify(&self, update: RunUpdate) {
        lock(&self.observers).retain(|tx| tx.send(update.clone()).is_ok());
    }

    /// Consumer loop: one job at a time until the queue is closed.
    fn consume(&self) {
        debug!("Run consumer started");
        loop {
            match self.queue.pop(IDLE_POLL) {
                Pop::Job(job) => {
                    self.execute(&job);
                    self.queue.finish(&job.run_id);
                    self.retry_pending_saves();
                }
                Pop::Empty => self.retry_pending_saves(),
                Pop::Closed => break,
            }
        }
        debug!("Run consumer stopped");
    }

    fn execute(&self, job: &QueuedJob) {
        let run_id = job.run_id.as_str();
        let Some(input) = self.with_live(run_id, |r| r.input_data.clone()) else {
            warn!("Dequeued run {} has no live record, skipping", run_id);
            return;
        };

        if self.cancel_requested(run_id) {
            self.cancel_before_start(run_id);
            return;
        }

        self.queue.mark_current(run_id);
        self.with_live(run_id, |r| r.mark_running(timestamp::now()));
        self.notify(RunUpdate::Status {
            run_id: run_id.to_string(),
            status: RunStatus::Running,
        });
        self.flush(run_id);

        let args = WorkerArgs {
            run_id: run_id.to_string(),
            input,
            output_dir: Some(self.store.outputs_dir()),
        };
        let channels = match self.runner.start(&job.workflow_id, &args) {
            Ok(channels) => channels,
            Err(e) => {
                error!("Run {} could not start: {}", run_id, e);
                self.with_live(run_id, |r| {
                    r.finish_failed(format!("Failed to start worker: {}", e), timestamp::now())
                });
                self.finalize(run_id);
                return;
            }
        };

        lock(&self.handles).insert(run_id.to_string(), channels.handle.clone());
        let finish = self.supervise(run_id, &channels);
        lock(&self.handles).remove(run_id);

        let now = timestamp::now();
        self.with_live(run_id, |r| match finish {
            Finish::Result(WorkerResult::Completed {
                output,
                output_file,
            }) => {
                r.finish_completed(output, output_file, now);
            }
            Finish::Result(WorkerResult::Failed { error }) => {
                r.finish_failed(error, now);
            }
            Finish::Cancelled(termination) => {
                r.append_log(format!(
                    "[{}] Run cancelled, worker {}",
                    timestamp::format(&now),
                    match termination {
                        Termination::AlreadyExited => "had already exited",
                        Termination::Graceful => "stopped",
                        Termination::Killed => "killed",
                    }
                ));
                r.finish_cancelled(now);
            }
        });
        lock(&self.cancel_requests).remove(run_id);
        self.finalize(run_id);
    }

    /// Relays worker output into the live record until a result arrives
    /// or the run is cancelled.
    fn supervise(&self, run_id: &str, channels: &WorkerChannels) -> Finish {
        let config = &self.config;
        let mut monitor = ResourceMonitor::for_process(channels.handle.pid());
        let mut last_flush = Instant::now();

        let finish = loop {
            if self.cancel_requested(run_id) {
                // A result that already arrived wins over the cancellation
                if let Ok(result) = channels.result.try_recv() {
                    break Finish::Result(result);
                }
                let termination = ProcessRunner::terminate(&channels.handle, config.grace_period);
                info!("Run {} cancelled ({:?})", run_id, termination);
                break Finish::Cancelled(termination);
            }

            self.relay(run_id, channels);

            match channels.result.recv_timeout(config.poll_interval) {
                Ok(result) => break Finish::Result(result),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    break Finish::Result(WorkerResult::failed(
                        "Worker output closed without a result",
                    ))
                }
            }

            monitor.sample();
            if last_flush.elapsed() >= config.flush_interval {
                self.flush(run_id);
                last_flush = Instant::now();
            }
        };

        if let Finish::Result(_) = finish {
            if channels.handle.wait_timeout(config.grace_period).is_none() {
                warn!("Worker for run {} did not exit after its result", run_id);
                ProcessRunner::terminate(&channels.handle, config.grace_period);
            }
        }

        // Pick up whatever the relays still hold
        let deadline = Instant::now() + DRAIN_WINDOW;
        while !self.relay(run_id, channels) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        let summary = monitor.summary_line();
        self.with_live(run_id, |r| {
            r.append_log(format!("[{}] {}", timestamp::format(&timestamp::now()), summary))
        });
        finish
    }

    /// Applies pending events and log lines. Returns true once both
    /// relays have closed.
    fn relay(&self, run_id: &str, channels: &WorkerChannels) -> bool {
        let mut events_closed = false;
        loop {
            match channels.events.try_recv() {
                Ok(event) => {
                    let applied = self.with_live(run_id, |r| r.apply_step_event(&event));
                    if applied != Some(true) {
                        debug!("Run {}: ignored step event {:?}", run_id, event);
                    }
                    self.notify(RunUpdate::Step {
                        run_id: run_id.to_string(),
                        event,
                    });
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    events_closed = true;
                    break;
                }
            }
        }

        let mut logs_closed = false;
        loop {
            match channels.logs.try_recv() {
                Ok(line) => {
                    let line = line.render();
                    self.with_live(run_id, |r| r.append_log(line.clone()));
                    self.notify(RunUpdate::Log {
                        run_id: run_id.to_string(),
                        line,
                    });
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    logs_closed = true;
                    break;
                }
            }
        }

        events_closed && logs_closed
    }

    /// Terminal `Cancelled` for a run that never reached a worker.
    fn cancel_before_start(&self, run_id: &str) {
        let now = timestamp::now();
        let cancelled = self.with_live(run_id, |r| {
            r.append_log(format!(
                "[{}] Cancelled before start",
                timestamp::format(&now)
            ));
            r.finish_cancelled(now)
        });
        lock(&self.cancel_requests).remove(run_id);
        if cancelled == Some(true) {
            info!("Run {} cancelled while queued", run_id);
            self.finalize(run_id);
        }
    }

    /// Writes an in-flight record; failures only cost freshness.
    fn flush(&self, run_id: &str) {
        if let Some(record) = self.snapshot(run_id) {
            if let Err(e) = self.store.save(&record) {
                warn!("Progress save for run {} failed: {}", run_id, e);
            }
        }
    }

    /// Persists a terminal record and hands it over to the store.
    ///
    /// If every attempt fails the record stays in the live map, where
    /// reads still find it, and is retried later.
    fn finalize(&self, run_id: &str) {
        let Some(record) = self.snapshot(run_id) else {
            return;
        };
        self.notify(RunUpdate::Status {
            run_id: run_id.to_string(),
            status: record.status,
        });

        let attempts = self.config.save_retries.max(1);
        for attempt in 1..=attempts {
            match self.store.save(&record) {
                Ok(()) => {
                    lock(&self.live).remove(run_id);
                    info!("Run {} finished: {}", run_id, record.status);
                    return;
                }
                Err(e) => {
                    warn!(
                        "Saving run {} failed (attempt {}/{}): {}",
                        run_id, attempt, attempts, e
                    );
                    if attempt < attempts {
                        thread::sleep(Duration::from_millis(50 * u64::from(attempt)));
                    }
                }
            }
        }
        error!("Run {} kept in memory until it can be saved", run_id);
    }

    /// Retries terminal records whose save failed earlier.
    fn retry_pending_saves(&self) {
        let pending: Vec<RunRecord> = lock(&self.live)
            .values()
            .filter(|r| r.is_terminal())
            .cloned()
            .collect();

        for record in pending {
            match self.store.save(&record) {
                Ok(()) => {
                    lock(&self.live).remove(&record.id);
                    info!("Run {} saved after earlier failure", record.id);
                }
                Err(e) => debug!("Run {} still unsaved: {}", record.id, e),
            }
        }
    }
}

/// Fails runs a previous process left `Pending` or `Running`.
fn recover_interrupted(store: &RunStore) -> usize {
    let mut recovered = 0;
    for entry in store.unfinished() {
        let mut record = match store.get(&entry.id) {
            Ok(Some(record)) => record,
            Ok(None) => continue,
            Err(e) => {
                warn!("Cannot recover run {}: {}", entry.id, e);
                continue;
            }
        };
        if record.is_terminal() {
            // Finished, but the index was not written before the exit
            match store.reindex(&record) {
                Ok(()) => debug!("Reindexed finished run {}", record.id),
                Err(e) => warn!("Cannot reindex run {}: {}", record.id, e),
            }
            continue;
        }

        let now = timestamp::now();
        record.append_log(format!(
            "[{}] Runner stopped before this run finished",
            timestamp::format(&now)
        ));
        record.finish_failed("Run interrupted: the runner exited before it finished", now);
        match store.save(&record) {
            Ok(()) => recovered += 1,
            Err(e) => warn!("Cannot recover run {}: {}", record.id, e),
        }
    }
    recovered
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
