//! Error types for result-table
//!
//! Every variant carries enough context (conflicting run id, expected vs.
//! actual metric sets, lock path) to fix the calling code.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// result-table error types
#[derive(Error, Debug)]
pub enum Error {
    /// Lock retries exhausted; no mutation was applied
    #[error("Result table is locked: gave up on {path} after {attempts} attempts\nIf no other process is running, remove the stale lock file by hand")]
    LockTimeout {
        /// Sentinel file that could not be acquired
        path: PathBuf,
        /// Number of attempts made
        attempts: u32,
    },

    /// Named category does not exist in the table
    #[error("Invalid category name: {0}")]
    InvalidCategory(String),

    /// Category already exists in the table
    #[error("Category already exists: {0}")]
    CategoryExists(String),

    /// Identical experiment already filled and updates are not allowed
    #[error("Experiment already exists! RunId: {run_id} (name: {name})\nAdd a hyperparameter distinguishing the repetition instead of re-running it")]
    DuplicateExperiment {
        /// Run id of the existing filled record
        run_id: u64,
        /// Experiment name
        name: String,
    },

    /// Written metric names differ from the table schema
    #[error("Registered metrics and passed metrics are not the same!\nExpected: {expected:?}\nActual: {actual:?}")]
    MetricMismatch {
        /// Metric names declared by the table
        expected: Vec<String>,
        /// Metric names passed to the socket
        actual: Vec<String>,
    },

    /// Socket used after its single terminal action
    #[error("Record socket for RunId {run_id} has already been written or discarded.\nRegister a new record to write again")]
    DoubleWrite {
        /// Run id the socket was bound to
        run_id: u64,
    },

    /// Value not representable in the persisted document
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Builder refused to overwrite an existing table
    #[error("The table has already been created: {0}")]
    TableExists(PathBuf),

    /// Table schema is malformed or from an unsupported version
    #[error("Invalid table schema: {0}")]
    InvalidSchema(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
