//! Result Table: write-once experiment results shared across processes
//!
//! ## Record lifecycle
//!
//! ```text
//! register ──> Created ──write──> Filled ──register (allow_update)──> Updating
//!                 │                  ▲                                   │
//!                 │ register again   └──────────write / discard──────────┘
//!                 ▼
//!              Filling ──write──> Filled
//!
//! Created / Filling ──discard or crash sweep──> removed
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use result_table::{Hyperparameters, ResultTable, TableBuilder};
//!
//! // Once, in a setup script
//! let table = TableBuilder::new(["accuracy", "crossEntropy"], "results/resultTable.json").build()?;
//! table.add_category("CNN")?;
//!
//! // In every experiment process
//! let table = ResultTable::open("results/resultTable.json")?;
//! table.install_crash_handler();
//! let socket = table.register("experiment1", "config.yaml", Some("CNN"), &Hyperparameters::new())?;
//! socket.write([("accuracy", 0.93), ("crossEntropy", 0.21)])?;
//! # Ok::<(), result_table::Error>(())
//! ```

mod builder;
mod document;
mod export;
mod hyperparams;
mod record;
mod socket;
mod store;

pub use builder::TableBuilder;
pub use document::{DEFAULT_CATEGORY, RESERVED_COLUMNS, SCHEMA_VERSION};
pub use export::ExportRow;
pub use hyperparams::{Fingerprint, Hyperparameters};
pub use record::{Record, RecordStatus};
pub use socket::RecordSocket;
pub use store::{PanicHook, ResultTable};
