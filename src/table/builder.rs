//! Table Builder - one-time creation of a result table file

use super::document::{check_metric_names, TableDocument};
use super::ResultTable;
use crate::lock::LockPolicy;
use crate::{Error, Result};
use std::fs;
use std::path::PathBuf;
use tracing::info;

/// Creates a new result table. Building never replaces an existing file.
///
/// Every metric the table will ever record must be declared here; each
/// write has to provide all of them.
///
/// ## Example
///
/// ```rust,no_run
/// use result_table::TableBuilder;
///
/// let table = TableBuilder::new(["F1", "crossEntropy"], "rtable.json").build()?;
/// table.add_category("CNN")?;
/// table.add_category("Transformer")?;
/// # Ok::<(), result_table::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct TableBuilder {
    metrics: Vec<String>,
    path: PathBuf,
    round_decimal: usize,
    allow_update: bool,
    lock_policy: LockPolicy,
}

impl TableBuilder {
    /// Start a builder for the given metric names and file path.
    #[must_use]
    pub fn new<I, S>(metrics: I, path: impl Into<PathBuf>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            metrics: metrics.into_iter().map(Into::into).collect(),
            path: path.into(),
            round_decimal: 3,
            allow_update: false,
            lock_policy: LockPolicy::default(),
        }
    }

    /// Decimals kept when rendering the text report (default 3).
    #[must_use]
    pub const fn round_decimal(mut self, decimals: usize) -> Self {
        self.round_decimal = decimals;
        self
    }

    /// Allow filled records to be re-registered and overwritten
    /// (default false).
    #[must_use]
    pub const fn allow_update(mut self, allow: bool) -> Self {
        self.allow_update = allow;
        self
    }

    /// Lock policy of the returned handle.
    #[must_use]
    pub const fn lock_policy(mut self, policy: LockPolicy) -> Self {
        self.lock_policy = policy;
        self
    }

    /// Write the empty table and open it.
    ///
    /// # Errors
    ///
    /// * [`Error::TableExists`] if the path already exists
    /// * [`Error::InvalidSchema`] for duplicate or empty metric names, or
    ///   names taken by record fields (see [`RESERVED_COLUMNS`](super::RESERVED_COLUMNS))
    /// * [`Error::Io`] if the file or its parent directory cannot be created
    pub fn build(self) -> Result<ResultTable> {
        check_metric_names(&self.metrics)?;
        if self.path.exists() {
            return Err(Error::TableExists(self.path));
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let doc = TableDocument::new(name, self.metrics, self.round_decimal, self.allow_update);
        doc.create(&self.path)?;
        info!(path = %self.path.display(), metrics = ?doc.metrics, "Result table built");

        ResultTable::open_with(&self.path, self.lock_policy)
    }
}
