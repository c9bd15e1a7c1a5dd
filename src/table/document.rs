//! Persisted result document and the merge of pending modifications.
//!
//! The document is read fresh under the lock before every mutation and
//! written back with write-temp-then-rename, so a concurrent reader sees
//! either the previous or the next version, never a torn file.

use super::{Record, RecordStatus};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Current on-disk schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Category used when a registration names none.
pub const DEFAULT_CATEGORY: &str = "defaultCategory";

/// Column names taken by record and export fields; no metric may use them.
pub const RESERVED_COLUMNS: &[&str] = &[
    "runId",
    "name",
    "config",
    "hyperparameters",
    "status",
    "lastModified",
    "filled",
    "category",
    "experiment",
    "configuration",
];

/// Reject metric lists a record could not store side by side with its own
/// fields: empty names, duplicates, and [`RESERVED_COLUMNS`].
pub(crate) fn check_metric_names(metrics: &[String]) -> Result<()> {
    let mut seen = HashSet::new();
    for metric in metrics {
        if metric.is_empty() {
            return Err(Error::InvalidSchema("empty metric name".to_string()));
        }
        if RESERVED_COLUMNS.contains(&metric.as_str()) {
            return Err(Error::InvalidSchema(format!(
                "metric name {metric} collides with a record field"
            )));
        }
        if !seen.insert(metric.as_str()) {
            return Err(Error::InvalidSchema(format!(
                "duplicate metric name: {metric}"
            )));
        }
    }
    Ok(())
}

const fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

/// Table identity and policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub(crate) name: String,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) format: String,
    pub(crate) allow_update: bool,
    #[serde(default = "default_schema_version")]
    pub(crate) schema_version: u32,
    /// Highest run id ever handed out, including discarded ones.
    #[serde(default)]
    pub(crate) last_run_id: u64,
}

/// Presentation preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    pub(crate) round_decimal: usize,
}

/// Intended outcome of a pending modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingAction {
    /// Append or replace the row with the carried record.
    Commit,
    /// Remove the reservation, or restore the filled row it replaced.
    Discard,
}

/// A change this process is responsible for, merged into the latest
/// document on the next persistence pass.
#[derive(Debug, Clone)]
pub struct PendingModification {
    pub(crate) category: String,
    pub(crate) action: PendingAction,
    pub(crate) record: Record,
    /// Row as it was before a reuse (fill or update) registration.
    pub(crate) prior: Option<Record>,
}

impl PendingModification {
    pub(crate) const fn run_id(&self) -> u64 {
        self.record.run_id()
    }
}

/// In-memory form of the persisted table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDocument {
    pub(crate) metadata: Metadata,
    pub(crate) preferences: Preferences,
    pub(crate) metrics: Vec<String>,
    pub(crate) records: IndexMap<String, Vec<Record>>,
}

impl TableDocument {
    /// Empty document with no categories.
    pub(crate) fn new(
        name: impl Into<String>,
        metrics: Vec<String>,
        round_decimal: usize,
        allow_update: bool,
    ) -> Self {
        Self {
            metadata: Metadata {
                name: name.into(),
                created_at: Utc::now(),
                format: "JSON".to_string(),
                allow_update,
                schema_version: SCHEMA_VERSION,
                last_run_id: 0,
            },
            preferences: Preferences { round_decimal },
            metrics,
            records: IndexMap::new(),
        }
    }

    /// Read and validate the document at `path`, seeding the default
    /// category when none exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read,
    /// [`Error::Serialization`] if it is not a valid document, and
    /// [`Error::InvalidSchema`] for unsupported versions or records whose
    /// metric slots disagree with the schema.
    pub(crate) fn read(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        let mut doc: Self = serde_json::from_slice(&bytes)?;
        doc.validate()?;
        if doc.records.is_empty() {
            doc.records.insert(DEFAULT_CATEGORY.to_string(), Vec::new());
        }
        Ok(doc)
    }

    fn validate(&self) -> Result<()> {
        if self.metadata.schema_version > SCHEMA_VERSION {
            return Err(Error::InvalidSchema(format!(
                "schema version {} is newer than supported version {SCHEMA_VERSION}",
                self.metadata.schema_version
            )));
        }
        check_metric_names(&self.metrics)?;
        for (category, rows) in &self.records {
            if let Some(bad) = rows.iter().find(|r| !r.is_consistent(&self.metrics)) {
                return Err(Error::InvalidSchema(format!(
                    "record {} in category {category} does not match metrics {:?}",
                    bad.run_id(),
                    self.metrics
                )));
            }
        }
        Ok(())
    }

    /// Create the document at `path`, refusing to replace an existing file.
    pub(crate) fn create(&self, path: &Path) -> Result<()> {
        let payload = serde_json::to_vec_pretty(self)?;
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(Error::TableExists(path.to_path_buf()));
            }
            Err(e) => return Err(Error::Io(e)),
        };
        file.write_all(&payload)?;
        file.sync_all()?;
        Ok(())
    }

    /// Replace the document at `path` atomically.
    ///
    /// The payload is serialized before anything touches the disk; any
    /// failure afterwards removes the temporary file before returning.
    pub(crate) fn write_atomic(&self, path: &Path) -> Result<()> {
        let payload = serde_json::to_vec_pretty(self)?;
        let tmp_path = temp_path(path);
        if let Err(e) = write_and_rename(&tmp_path, path, &payload) {
            let _ = fs::remove_file(&tmp_path);
            return Err(Error::Io(e));
        }
        debug!(path = %path.display(), bytes = payload.len(), "Result table persisted");
        Ok(())
    }

    /// Largest run id among live rows.
    pub(crate) fn max_live_run_id(&self) -> u64 {
        self.records
            .values()
            .flatten()
            .map(Record::run_id)
            .max()
            .unwrap_or(0)
    }

    /// Hand out the next run id; never returns 0 nor a previously used id.
    pub(crate) fn allocate_run_id(&mut self) -> u64 {
        let next = self.metadata.last_run_id.max(self.max_live_run_id()) + 1;
        self.metadata.last_run_id = next;
        next
    }

    /// Row with `run_id` in `category`.
    pub(crate) fn find(&self, category: &str, run_id: u64) -> Option<&Record> {
        self.records
            .get(category)?
            .iter()
            .find(|r| r.run_id() == run_id)
    }

    /// Merge one pending modification by run id.
    ///
    /// A discard removes the row only while it is unfilled, and reverts an
    /// update reservation to the committed row it replaced. Filled rows are
    /// never removed.
    pub(crate) fn apply(&mut self, modification: &PendingModification) {
        let rows = self
            .records
            .entry(modification.category.clone())
            .or_default();
        let position = rows
            .iter()
            .position(|r| r.run_id() == modification.run_id());

        match (modification.action, position) {
            (PendingAction::Commit, Some(idx)) => rows[idx] = modification.record.clone(),
            (PendingAction::Commit, None) => rows.push(modification.record.clone()),
            (PendingAction::Discard, Some(idx)) => {
                let row = &rows[idx];
                if !row.is_filled() {
                    rows.remove(idx);
                } else if row.status() == RecordStatus::Updating {
                    if let Some(prior) = modification.prior.as_ref().filter(|p| p.is_filled()) {
                        rows[idx] = prior.clone();
                    }
                }
            }
            (PendingAction::Discard, None) => {}
        }
    }

    /// Total number of rows across categories.
    pub(crate) fn record_count(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }
}

fn write_and_rename(tmp_path: &Path, path: &Path, payload: &[u8]) -> io::Result<()> {
    let mut tmp_file = fs::File::create(tmp_path)?;
    tmp_file.write_all(payload)?;
    tmp_file.sync_all()?;
    fs::rename(tmp_path, path)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}
