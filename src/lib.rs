//! runhub - Sequential Workflow Run Orchestration
//!
//! Accepts requests to run named workflows, executes them one at a time
//! in isolated worker processes, and keeps a durable record of every run:
//! status, per-step progress, logs, output and timing.
//!
//! # Architecture
//!
//! The library is organized into these modules:
//!
//! - [`run`]: Run records, step states, worker protocol and statistics
//! - [`store`]: Durable run store with a summary index and legacy import
//! - [`execution`]: Orchestrator, queue, process runner and worker side
//! - [`workflow`]: Workflow definitions, YAML parsing and the catalog
//! - [`monitoring`]: Worker resource sampling and step timelines
//! - [`config`]: Runner settings and environment overrides
//! - [`cache`]: Bounded LRU cache shared by the store and catalog
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```rust,no_run
//! use runhub::config::RunnerConfig;
//! use runhub::execution::Orchestrator;
//! use runhub::store::RunQuery;
//! use serde_json::json;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let orchestrator = Orchestrator::start(RunnerConfig::from_env())?;
//!
//!     // Returns as soon as the run is queued
//!     let run_id = orchestrator.submit("report", json!({"month": "2024-03"}))?;
//!     println!("queued {}", run_id);
//!
//!     let page = orchestrator.list(&RunQuery::new(20).workflow("report"))?;
//!     for entry in page.entries {
//!         println!("{} {}", entry.id, entry.status);
//!     }
//!
//!     orchestrator.shutdown();
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod run;
pub mod store;
pub mod workflow;

// Re-export commonly used types
pub use config::RunnerConfig;
pub use execution::{Orchestrator, RunUpdate};
pub use run::{RunRecord, RunStatus};
pub use store::{RunQuery, RunStore};
pub use workflow::model::{Step, Workflow};
pub use workflow::parser::load_workflow;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "runhub";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "runhub");
    }

    #[test]
    fn test_module_exports_step() {
        let step = Step::new("fetch", "shell");
        assert_eq!(step.id, "fetch");
        assert_eq!(step.handler, "shell");
    }

    #[test]
    fn test_module_exports_record() {
        let record = RunRecord::new("r1", "wf", "WF", ["a"], serde_json::json!({}));
        assert_eq!(record.status, RunStatus::Pending);
        assert!(!record.is_terminal());
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
