//! Run Monitoring Module
//!
//! Observability helpers for runs: resource usage of worker processes
//! and step timelines of run records.
//!
//! # Components
//!
//! - [`ResourceMonitor`]: CPU and memory sampling of a worker process
//! - [`ExecutionTimeline`]: Step spans rendered as a Gantt chart

pub mod resource;
pub mod timeline;

pub use resource::{ResourceMonitor, ResourceSample};
pub use timeline::{ExecutionTimeline, TimelineEntry};
