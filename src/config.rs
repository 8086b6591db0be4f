//! Runner Configuration
//!
//! Settings shared by the orchestrator, the run store and the process
//! runner. Defaults can be overlaid from the environment:
//!
//! | Variable               | Setting          |
//! |------------------------|------------------|
//! | `RUNHUB_DATA_DIR`      | data directory   |
//! | `RUNHUB_WORKFLOWS_DIR` | workflows dir    |
//! | `RUNHUB_GRACE_MS`      | grace period     |
//! | `RUNHUB_FLUSH_MS`      | flush interval   |

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::warn;
use once_cell::sync::Lazy;

use crate::store::run_store::{DEFAULT_CACHE_CAPACITY, DEFAULT_INDEX_CAPACITY};

/// `$HOME/.runhub`, or `./.runhub` when no home directory is set.
pub static DEFAULT_DATA_DIR: Lazy<PathBuf> = Lazy::new(|| {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".runhub")
});

/// How to start a worker process.
///
/// The runner appends `<workflow_id> <args_json>` to `args`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// This executable in worker mode.
    pub fn current_exe(workflows_dir: &Path) -> Self {
        let program = env::current_exe().unwrap_or_else(|e| {
            warn!("Cannot resolve current executable ({}), using 'runhub' from PATH", e);
            PathBuf::from("runhub")
        });
        Self::new(program).args([
            "worker".to_string(),
            "--workflows-dir".to_string(),
            workflows_dir.display().to_string(),
        ])
    }

    /// Program name for log messages.
    pub fn display_name(&self) -> String {
        self.program.display().to_string()
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub data_dir: PathBuf,
    pub workflows_dir: PathBuf,
    /// Worker command; `None` runs this executable in worker mode
    pub worker: Option<WorkerCommand>,
    /// Longest the consumer blocks on a worker's result channel
    pub poll_interval: Duration,
    /// How often an in-flight record is written to the store
    pub flush_interval: Duration,
    /// Time a worker gets to exit after SIGTERM before it is killed
    pub grace_period: Duration,
    pub index_capacity: usize,
    pub record_cache_capacity: usize,
    /// Attempts at persisting a terminal record before keeping it in memory
    pub save_retries: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        let data_dir = DEFAULT_DATA_DIR.clone();
        Self {
            workflows_dir: data_dir.join("workflows"),
            data_dir,
            worker: None,
            poll_interval: Duration::from_millis(100),
            flush_interval: Duration::from_secs(2),
            grace_period: Duration::from_secs(5),
            index_capacity: DEFAULT_INDEX_CAPACITY,
            record_cache_capacity: DEFAULT_CACHE_CAPACITY,
            save_retries: 3,
        }
    }
}

impl RunnerConfig {
    /// Defaults rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            workflows_dir: data_dir.join("workflows"),
            data_dir,
            ..Self::default()
        }
    }

    /// Defaults overlaid with `RUNHUB_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(dir) = env::var_os("RUNHUB_DATA_DIR") {
            config = Self::new(dir);
        }
        if let Some(dir) = env::var_os("RUNHUB_WORKFLOWS_DIR") {
            config.set_workflows_dir(dir);
        }
        if let Some(ms) = millis_var("RUNHUB_GRACE_MS") {
            config.set_grace_period(ms);
        }
        if let Some(ms) = millis_var("RUNHUB_FLUSH_MS") {
            config.set_flush_interval(ms);
        }
        config
    }

    /// Sets the data directory. The workflows directory follows unless it
    /// was changed from its default.
    pub fn set_data_dir(&mut self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        if self.workflows_dir == self.data_dir.join("workflows") {
            self.workflows_dir = dir.join("workflows");
        }
        self.data_dir = dir;
    }

    pub fn set_workflows_dir(&mut self, dir: impl Into<PathBuf>) {
        self.workflows_dir = dir.into();
    }

    pub fn set_worker(&mut self, worker: WorkerCommand) {
        self.worker = Some(worker);
    }

    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval;
    }

    pub fn set_flush_interval(&mut self, interval: Duration) {
        self.flush_interval = interval;
    }

    pub fn set_grace_period(&mut self, grace: Duration) {
        self.grace_period = grace;
    }

    pub fn set_index_capacity(&mut self, capacity: usize) {
        self.index_capacity = capacity;
    }

    pub fn set_record_cache_capacity(&mut self, capacity: usize) {
        self.record_cache_capacity = capacity;
    }

    pub fn set_save_retries(&mut self, retries: u32) {
        self.save_retries = retries;
    }

    /// The configured worker, or this executable in worker mode.
    pub fn worker_command(&self) -> WorkerCommand {
        self.worker
            .clone()
            .unwrap_or_else(|| WorkerCommand::current_exe(&self.workflows_dir))
    }

    /// Directory for outputs too large to embed in a record.
    pub fn outputs_dir(&self) -> PathBuf {
        self.data_dir.join(crate::store::run_store::OUTPUTS_DIR)
    }
}

fn millis_var(name: &str) -> Option<Duration> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(_) => {
            warn!("Ignoring {}: '{}' is not a number of milliseconds", name, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::new("/tmp/rh");
        assert_eq!(config.workflows_dir, PathBuf::from("/tmp/rh/workflows"));
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.flush_interval, Duration::from_secs(2));
        assert_eq!(config.grace_period, Duration::from_secs(5));
        assert_eq!(config.save_retries, 3);
        assert_eq!(config.outputs_dir(), PathBuf::from("/tmp/rh/outputs"));
    }

    #[test]
    fn test_set_data_dir_moves_default_workflows_dir() {
        let mut config = RunnerConfig::new("/a");
        config.set_data_dir("/b");
        assert_eq!(config.workflows_dir, PathBuf::from("/b/workflows"));

        config.set_workflows_dir("/custom");
        config.set_data_dir("/c");
        assert_eq!(config.workflows_dir, PathBuf::from("/custom"));
    }

    #[test]
    fn test_worker_command_fallback() {
        let mut config = RunnerConfig::new("/a");
        let fallback = config.worker_command();
        assert_eq!(fallback.args[0], "worker");
        assert_eq!(fallback.args[2], "/a/workflows");

        config.set_worker(WorkerCommand::new("sh").arg("-c").arg("true"));
        assert_eq!(config.worker_command().program, PathBuf::from("sh"));
        assert_eq!(config.worker_command().args, vec!["-c", "true"]);
    }

    #[test]
    fn test_default_data_dir_is_named() {
        assert!(DEFAULT_DATA_DIR.ends_with(".runhub"));
    }
}
