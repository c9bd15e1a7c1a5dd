//! # result-table: Write-Once Experiment Result Store
//!
//! **Version**: 0.3.0
//!
//! A tiny embedded, append-mostly store that independent training processes
//! share to record each experiment's outcome exactly once. It never silently
//! overwrites a prior result.
//!
//! ## Design Principles (Toyota Way Aligned)
//!
//! - **Poka-Yoke**: Write-once sockets and exact metric sets make partial
//!   or repeated writes impossible to commit
//! - **Jidoka**: Duplicate experiments stop at registration, before any
//!   training time is spent
//! - **Genchi Genbutsu**: Every mutation reloads the file under the lock;
//!   nothing is decided against a cached copy
//! - **Muda elimination**: Crashed runs are swept instead of leaving
//!   phantom rows behind
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use result_table::{Hyperparameters, ResultTable};
//!
//! let table = ResultTable::open("results/resultTable.json")?;
//! table.install_crash_handler();
//!
//! let hyper = Hyperparameters::new().with("lr", 0.01).with("dataset", "Huge");
//! let socket = table.register("CNNTest1", "CNN1.yaml", Some("CNN"), &hyper)?;
//!
//! // ... training ...
//!
//! socket.write([("crossEntropy", 0.31), ("F1", 0.92)])?;
//! # Ok::<(), result_table::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod error;
pub mod lock;
pub mod table;

pub use error::{Error, Result};
pub use lock::LockPolicy;
pub use table::{
    ExportRow, Fingerprint, Hyperparameters, Record, RecordSocket, RecordStatus, ResultTable,
    TableBuilder,
};
