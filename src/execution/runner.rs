//! Process Runner
//!
//! Starts one run in its own worker process and relays what the worker
//! writes back over three channels:
//! - result: exactly one [`WorkerResult`]
//! - logs: timestamped [`LogLine`]s
//! - events: [`StepEvent`]s in emission order
//!
//! Stdout lines are decoded as [`WorkerMessage`]s; anything that does not
//! decode, and every stderr line, is relayed as a log line. A worker that
//! closes stdout without sending a result gets a synthesized failure.
//!
//! On unix the worker leads its own process group so that termination
//! also reaches anything it spawned.

use std::io::{BufRead, BufReader};
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::WorkerCommand;
use crate::error::RunnerError;
use crate::run::{LogLine, StepEvent, WorkerMessage, WorkerResult};

use super::worker::WorkerArgs;

/// Polling step while waiting for a process to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How long the stdout relay waits for the exit status after EOF.
const EXIT_STATUS_WAIT: Duration = Duration::from_secs(2);

/// Shared handle on a running worker process.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pid: u32,
    child: Arc<Mutex<Child>>,
}

impl WorkerHandle {
    fn new(child: Child) -> Self {
        Self {
            pid: child.id(),
            child: Arc::new(Mutex::new(child)),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    fn lock(&self) -> MutexGuard<'_, Child> {
        self.child.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Exit status if the process has exited. Never blocks.
    pub fn try_status(&self) -> Option<ExitStatus> {
        self.lock().try_wait().ok().flatten()
    }

    pub fn has_exited(&self) -> bool {
        self.try_status().is_some()
    }

    /// Polls for the exit status until `timeout` passes.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.try_status() {
                return Some(status);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    fn kill(&self) {
        let mut child = self.lock();
        if let Err(e) = child.kill() {
            debug!("Kill of worker {} failed: {}", self.pid, e);
        }
        let _ = child.wait();
    }
}

/// The receiving ends of a started worker.
#[derive(Debug)]
pub struct WorkerChannels {
    pub result: Receiver<WorkerResult>,
    pub logs: Receiver<LogLine>,
    pub events: Receiver<StepEvent>,
    pub handle: WorkerHandle,
}

/// How [`ProcessRunner::terminate`] ended the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// It had already exited
    AlreadyExited,
    /// It exited within the grace period
    Graceful,
    /// It had to be killed
    Killed,
}

/// Launches workers with a fixed command.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    command: WorkerCommand,
}

impl ProcessRunner {
    pub fn new(command: WorkerCommand) -> Self {
        Self { command }
    }

    pub fn command(&self) -> &WorkerCommand {
        &self.command
    }

    /// Starts a worker for `workflow_id` and begins relaying its output.
    pub fn start(&self, workflow_id: &str, args: &WorkerArgs) -> Result<WorkerChannels, RunnerError> {
        let args_json = serde_json::to_string(args)?;

        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .arg(workflow_id)
            .arg(&args_json)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|e| RunnerError::Spawn {
            program: self.command.display_name(),
            source: e,
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let handle = WorkerHandle::new(child);

        let (stdout, stderr) = match (stdout, stderr) {
            (Some(out), Some(err)) => (out, err),
            (None, _) => {
                handle.kill();
                return Err(RunnerError::MissingPipe("stdout"));
            }
            (_, None) => {
                handle.kill();
                return Err(RunnerError::MissingPipe("stderr"));
            }
        };

        info!(
            "Started worker {} for run {} ({})",
            handle.pid(),
            args.run_id,
            workflow_id
        );

        let (result_tx, result_rx) = channel();
        let (log_tx, log_rx) = channel();
        let (event_tx, event_rx) = channel();

        let relay = spawn_stdout_relay(
            &args.run_id,
            stdout,
            handle.clone(),
            result_tx,
            log_tx.clone(),
            event_tx,
        )
        .and_then(|_| spawn_stderr_relay(&args.run_id, stderr, log_tx));

        if let Err(e) = relay {
            handle.kill();
            return Err(RunnerError::Relay(e));
        }

        Ok(WorkerChannels {
            result: result_rx,
            logs: log_rx,
            events: event_rx,
            handle,
        })
    }

    /// Stops a worker: SIGTERM to its process group, then a kill once
    /// `grace` has passed.
    pub fn terminate(handle: &WorkerHandle, grace: Duration) -> Termination {
        if handle.has_exited() {
            return Termination::AlreadyExited;
        }

        info!("Terminating worker {}", handle.pid());
        signal_group(handle.pid(), Signal::Term);

        if handle.wait_timeout(grace).is_some() {
            return Termination::Graceful;
        }

        warn!(
            "Worker {} still running after {:?}, killing it",
            handle.pid(),
            grace
        );
        signal_group(handle.pid(), Signal::Kill);
        handle.kill();
        Termination::Killed
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) {
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // Negative pid addresses the whole process group
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), sig) };
    if rc != 0 {
        debug!(
            "Signal to process group {} failed: {}",
            pid,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: Signal) {}

fn spawn_stdout_relay(
    run_id: &str,
    stdout: ChildStdout,
    handle: WorkerHandle,
    result_tx: Sender<WorkerResult>,
    log_tx: Sender<LogLine>,
    event_tx: Sender<StepEvent>,
) -> std::io::Result<()> {
    let run_id = run_id.to_string();
    thread::Builder::new()
        .name(format!("stdout-{}", run_id))
        .spawn(move || {
            let mut got_result = false;
            for line in BufReader::new(stdout).lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        debug!("Run {} stdout read failed: {}", run_id, e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                // Send errors mean the orchestrator stopped listening
                match WorkerMessage::decode(&line) {
                    Some(WorkerMessage::Log(log)) => {
                        let _ = log_tx.send(log);
                    }
                    Some(WorkerMessage::Step(event)) => {
                        let _ = event_tx.send(event);
                    }
                    Some(WorkerMessage::Result(result)) => {
                        if got_result {
                            warn!("Run {} sent more than one result, ignoring", run_id);
                        } else {
                            got_result = true;
                            let _ = result_tx.send(result);
                        }
                    }
                    None => {
                        let _ = log_tx.send(LogLine::new(line));
                    }
                }
            }

            if !got_result {
                let reason = match handle.wait_timeout(EXIT_STATUS_WAIT) {
                    Some(status) => describe_exit(status),
                    None => "closed its output".to_string(),
                };
                warn!("Worker for run {} {} without a result", run_id, reason);
                let _ = result_tx.send(WorkerResult::failed(format!(
                    "Worker process {} without reporting a result",
                    reason
                )));
            }
            debug!("Run {} stdout relay finished", run_id);
        })
        .map(|_| ())
}

fn spawn_stderr_relay(run_id: &str, stderr: ChildStderr, log_tx: Sender<LogLine>) -> std::io::Result<()> {
    thread::Builder::new()
        .name(format!("stderr-{}", run_id))
        .spawn(move || {
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            // Read raw bytes so invalid UTF-8 does not end the relay
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let text = String::from_utf8_lossy(&buf);
                        let text = text.trim_end();
                        if !text.is_empty() {
                            let _ = log_tx.send(LogLine::new(text));
                        }
                    }
                }
            }
        })
        .map(|_| ())
}

fn describe_exit(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exited with status {}", code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("was killed by signal {}", signal);
        }
    }
    "exited".to_string()
}
