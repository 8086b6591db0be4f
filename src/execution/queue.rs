//! Execution Queue
//!
//! Unbounded FIFO of admitted runs with a single consumer. Pushing never
//! blocks on execution. The consumer pops one job at a time; the popped
//! job stays "current" until the consumer calls [`ExecutionQueue::finish`],
//! which is what [`ExecutionQueue::status`] reports as running.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// One admitted run waiting for the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub run_id: String,
    pub workflow_id: String,
}

/// Snapshot of the queue for `queue_status`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueStatus {
    pub current_running: Option<String>,
    pub queue_size: usize,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<QueuedJob>,
    current: Option<String>,
    closed: bool,
}

/// What [`ExecutionQueue::pop`] found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pop {
    Job(QueuedJob),
    /// Nothing arrived before the timeout
    Empty,
    /// The queue was closed and drained
    Closed,
}

#[derive(Debug, Default)]
pub struct ExecutionQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl ExecutionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends a job. Returns false if the queue is closed.
    pub fn push(&self, job: QueuedJob) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.pending.push_back(job);
        drop(state);
        self.available.notify_one();
        true
    }

    /// Takes the oldest job, waiting up to `timeout`.
    ///
    /// The job is not reported as running until the consumer calls
    /// [`ExecutionQueue::mark_current`].
    pub fn pop(&self, timeout: Duration) -> Pop {
        let state = self.lock();
        let (mut state, _) = self
            .available
            .wait_timeout_while(state, timeout, |s| s.pending.is_empty() && !s.closed)
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match state.pending.pop_front() {
            Some(job) => Pop::Job(job),
            None if state.closed => Pop::Closed,
            None => Pop::Empty,
        }
    }

    /// Reports `run_id` as the running job.
    pub fn mark_current(&self, run_id: &str) {
        self.lock().current = Some(run_id.to_string());
    }

    /// Clears the current job once the consumer is done with it.
    pub fn finish(&self, run_id: &str) {
        let mut state = self.lock();
        if state.current.as_deref() == Some(run_id) {
            state.current = None;
        }
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.lock();
        QueueStatus {
            current_running: state.current.clone(),
            queue_size: state.pending.len(),
        }
    }

    /// True if `run_id` is waiting (not yet popped).
    pub fn contains(&self, run_id: &str) -> bool {
        self.lock().pending.iter().any(|job| job.run_id == run_id)
    }

    /// Rejects further pushes and wakes the consumer.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Removes and returns every waiting job.
    pub fn drain(&self) -> Vec<QueuedJob> {
        self.lock().pending.drain(..).collect()
    }
}
