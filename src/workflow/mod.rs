//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, parsing, and
//! resolving workflows.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Step, Workflow)
//! - [`parser`]: YAML parsing and loading
//! - [`validator`]: Validation rules
//! - [`catalog`]: Id-based lookup with caching

pub mod catalog;
pub mod model;
pub mod parser;
pub mod validator;

pub use catalog::WorkflowCatalog;
pub use model::{Step, Workflow};
pub use parser::load_workflow;
