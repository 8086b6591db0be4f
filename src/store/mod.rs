//! Run Store Module
//!
//! Durable storage for run records.
//!
//! # Layout
//!
//! ```text
//! {data_dir}/
//!   runs/{run_id}.json     one record per run
//!   runs_index.json        compact listing index
//!   outputs/{run_id}.json  large run outputs
//!   workflow_runs.json     legacy monolithic file (imported once)
//! ```

pub mod index;
pub mod legacy;
pub mod run_store;

pub use index::{RunPage, RunQuery, MAX_PAGE_SIZE};
pub use run_store::{is_valid_run_id, RunStore};
