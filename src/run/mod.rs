//! Run Data Model Module
//!
//! Canonical representation of workflow runs and their stable
//! on-disk / on-wire encoding.
//!
//! # Structure
//!
//! - [`model`]: RunRecord, StepState, RunStatus, RunIndexEntry
//! - [`event`]: Step events, log lines and the worker line protocol
//! - [`timestamp`]: Fixed-format timestamp serialization
//! - [`stats`]: Per-workflow aggregation over index entries

pub mod event;
pub mod model;
pub mod stats;
pub mod timestamp;

pub use event::{LogLine, StepEvent, StepEventKind, WorkerMessage, WorkerResult};
pub use model::{RunIndexEntry, RunRecord, RunStatus, StepMap, StepState};
pub use stats::{summarize, Outcome, SkipReason, WorkflowStats};
