//! Error Types
//!
//! One error enum per concern. Worker failures are not errors here:
//! they are recorded on the run itself.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the run store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Corrupt JSON in {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize {what}: {source}")]
    Serialize {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid run id: '{0}'")]
    InvalidRunId(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors loading or validating workflow definitions.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Workflow '{0}' not found")]
    NotFound(String),

    #[error("Invalid workflow id: '{0}'")]
    InvalidId(String),

    #[error("Failed to read workflow file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse workflow YAML '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Workflow '{workflow}' is invalid: {}", .problems.join("; "))]
    Invalid {
        workflow: String,
        problems: Vec<String>,
    },
}

/// Requests rejected synchronously by `Orchestrator::submit`.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("Unknown workflow: {0}")]
    UnknownWorkflow(#[source] WorkflowError),

    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Orchestrator is shutting down")]
    ShuttingDown,
}

/// Errors starting or talking to a worker process.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Failed to spawn worker '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Worker {0} pipe was not captured")]
    MissingPipe(&'static str),

    #[error("Failed to encode worker arguments: {0}")]
    Args(#[from] serde_json::Error),

    #[error("Failed to start relay thread: {0}")]
    Relay(#[source] io::Error),
}

/// Errors raised by a step handler inside the worker.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Unknown handler '{0}'")]
    UnknownHandler(String),

    #[error("Invalid params for step '{step}': {message}")]
    InvalidParams { step: String, message: String },

    #[error("{0}")]
    Failed(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
