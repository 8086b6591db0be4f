//! Workflow Execution Module
//!
//! Runs workflows in isolated worker processes and tracks them from
//! admission to their terminal status.
//!
//! # Architecture
//!
//! - [`orchestrator`]: Client-facing submit/cancel/query and the run consumer
//! - [`queue`]: FIFO of admitted runs, one executing at a time
//! - [`runner`]: Worker process launch, output relays and termination
//! - [`worker`]: The worker side: argument decoding and result reporting
//! - [`engine`]: Sequential step execution inside the worker
//! - [`handlers`]: Named step handlers

pub mod engine;
pub mod handlers;
pub mod orchestrator;
pub mod queue;
pub mod runner;
pub mod worker;

pub use engine::{Engine, EventSink, StdoutSink};
pub use handlers::{HandlerRegistry, StepContext, StepHandler};
pub use orchestrator::{Orchestrator, RunUpdate};
pub use queue::{ExecutionQueue, QueueStatus};
pub use runner::{ProcessRunner, Termination, WorkerHandle};
pub use worker::{run_worker, WorkerArgs};
