//! Worker Resource Monitoring
//!
//! Samples CPU and memory of a worker process while the orchestrator
//! supervises it, and condenses the samples into one log line for the
//! run record.

use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessRefreshKind, System};

/// A single resource usage sample.
#[derive(Debug, Clone)]
pub struct ResourceSample {
    /// When this sample was taken
    pub timestamp: Instant,
    /// CPU usage percentage (0-100+)
    pub cpu_usage: f32,
    /// Memory usage in megabytes
    pub memory_mb: u64,
}

/// Monitors resource usage of one process.
///
/// # Example
///
/// ```rust,ignore
/// use runhub::monitoring::ResourceMonitor;
///
/// let mut monitor = ResourceMonitor::for_process(child.id());
/// while child.try_wait()?.is_none() {
///     monitor.sample();
///     std::thread::sleep(std::time::Duration::from_millis(100));
/// }
/// println!("{}", monitor.summary_line());
/// ```
pub struct ResourceMonitor {
    system: System,
    pid: Pid,
    samples: Vec<ResourceSample>,
    warmup_done: bool,
    last_sample: Option<Instant>,
    min_interval: Duration,
}

impl ResourceMonitor {
    /// Creates a monitor for the process with the given OS pid.
    pub fn for_process(pid: u32) -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(pid),
            samples: Vec::new(),
            warmup_done: false,
            last_sample: None,
            min_interval: Duration::from_millis(250),
        }
    }

    /// Sets the minimum interval between samples.
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn pid(&self) -> u32 {
        self.pid.as_u32()
    }

    /// Takes a resource usage sample.
    ///
    /// The first call only primes CPU accounting. Later calls are
    /// rate-limited by `min_interval`. A process that is gone yields no
    /// sample.
    pub fn sample(&mut self) {
        let now = Instant::now();

        if self.warmup_done {
            if let Some(last) = self.last_sample {
                if now.duration_since(last) < self.min_interval {
                    return;
                }
            }
        }

        let refresh_kind = ProcessRefreshKind::new().with_cpu().with_memory();
        if !self.system.refresh_process_specifics(self.pid, refresh_kind) {
            return;
        }
        self.last_sample = Some(now);

        if !self.warmup_done {
            self.warmup_done = true;
            return;
        }

        if let Some(process) = self.system.process(self.pid) {
            self.samples.push(ResourceSample {
                timestamp: now,
                cpu_usage: process.cpu_usage(),
                memory_mb: process.memory() / (1024 * 1024),
            });
        }
    }

    /// One-line summary suitable for a run log.
    pub fn summary_line(&self) -> String {
        if self.samples.is_empty() {
            return "Worker resources: no samples collected".to_string();
        }

        format!(
            "Worker resources: avg CPU {:.1}%, peak memory {} MB ({} samples)",
            self.average_cpu(),
            self.peak_memory_mb(),
            self.samples.len()
        )
    }

    pub fn samples(&self) -> &[ResourceSample] {
        &self.samples
    }

    /// Returns the peak memory usage in MB.
    pub fn peak_memory_mb(&self) -> u64 {
        self.samples.iter().map(|s| s.memory_mb).max().unwrap_or(0)
    }

    /// Returns the average CPU usage.
    pub fn average_cpu(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.cpu_usage).sum::<f32>() / self.samples.len() as f32
    }
}
