//! Exporter - flattened, read-only views of a result table
//!
//! Exports load the document once without taking the lock, so they may lag
//! behind concurrent writers. Never base a commit decision on them.

use super::document::{TableDocument, DEFAULT_CATEGORY};
use super::{RecordStatus, ResultTable};
use crate::Result;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Hyperparameter pairs shown before the report elides the rest.
const SUMMARY_PAIRS: usize = 3;

/// One flattened row of the export.
///
/// Column order: run id, category, experiment, hyperparameters,
/// configuration, each metric in schema order, status, last modified.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRow {
    /// Run identifier.
    pub run_id: u64,
    /// Category name.
    pub category: String,
    /// Experiment name.
    pub experiment: String,
    /// Hyperparameter summary (first three pairs).
    pub hyperparameters: String,
    /// Configuration file reference.
    pub configuration: String,
    /// Metric values in schema order.
    #[serde(flatten)]
    pub metrics: IndexMap<String, Option<f64>>,
    /// Record status.
    pub status: RecordStatus,
    /// Time of the last mutation.
    pub last_modified: DateTime<Utc>,
}

impl ExportRow {
    /// Value of one metric column.
    #[must_use]
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied().flatten()
    }
}

fn rows(doc: &TableDocument) -> Vec<ExportRow> {
    doc.records
        .iter()
        .flat_map(|(category, records)| {
            records.iter().map(move |record| ExportRow {
                run_id: record.run_id(),
                category: category.clone(),
                experiment: record.name().to_string(),
                hyperparameters: record.hyperparameters().summary(SUMMARY_PAIRS),
                configuration: record.config().to_string(),
                metrics: doc
                    .metrics
                    .iter()
                    .map(|m| (m.clone(), record.metric(m)))
                    .collect(),
                status: record.status(),
                last_modified: record.last_modified(),
            })
        })
        .collect()
}

/// Render the lossy text report: rows grouped by category, the default
/// category left blank, metrics rounded to the table preference.
fn render(doc: &TableDocument) -> String {
    let decimals = doc.preferences.round_decimal;
    let mut header: Vec<String> = [
        "Category",
        "Run Id",
        "Experiment",
        "Hyperparameters",
        "Configuration",
    ]
    .iter()
    .map(ToString::to_string)
    .collect();
    header.extend(doc.metrics.iter().cloned());
    header.push("Status".to_string());
    header.push("Last Modified".to_string());

    let mut lines = vec![header];
    let mut previous_category: Option<&str> = None;
    let exported = rows(doc);
    for row in &exported {
        let category = if previous_category == Some(row.category.as_str())
            || row.category == DEFAULT_CATEGORY
        {
            String::new()
        } else {
            row.category.clone()
        };
        previous_category = Some(row.category.as_str());

        let mut line = vec![
            category,
            row.run_id.to_string(),
            row.experiment.clone(),
            row.hyperparameters.clone(),
            row.configuration.clone(),
        ];
        line.extend(row.metrics.values().map(|v| match v {
            Some(v) => format!("{v:.decimals$}"),
            None => "-".to_string(),
        }));
        line.push(row.status.to_string());
        line.push(row.last_modified.format("%Y-%m-%d %H:%M:%S").to_string());
        lines.push(line);
    }

    let columns = lines[0].len();
    let widths: Vec<usize> = (0..columns)
        .map(|c| lines.iter().map(|l| l[c].chars().count()).max().unwrap_or(0))
        .collect();

    let mut out = String::new();
    for line in &lines {
        let cells: Vec<String> = line
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect();
        out.push_str(cells.join("  ").trim_end());
        out.push('\n');
    }
    out
}

impl ResultTable {
    /// Flatten every record of every category into rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or stays locked.
    pub fn export(&self) -> Result<Vec<ExportRow>> {
        let doc = self.shared().load_unlocked()?;
        Ok(rows(&doc))
    }

    /// Render the text report from a fresh load.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or stays locked.
    pub fn render_text(&self) -> Result<String> {
        let doc = self.shared().load_unlocked()?;
        Ok(render(&doc))
    }

    /// Save the text report to `path`, creating parent directories.
    ///
    /// The report is lossy (rounded, summarized); use [`ResultTable::export`]
    /// or [`ResultTable::to_json`] for analysis.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be loaded or the file written.
    pub fn to_text(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = self.render_text()?;
        write_creating_parent(path.as_ref(), text.as_bytes())
    }

    /// Save the exported rows to `path` as a JSON array.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be loaded or the file written.
    pub fn to_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let payload = serde_json::to_vec_pretty(&self.export()?)?;
        write_creating_parent(path.as_ref(), &payload)
    }
}

fn write_creating_parent(path: &Path, payload: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, payload)?;
    debug!(path = %path.display(), "Report written");
    Ok(())
}

/// Text report of the last loaded snapshot.
impl fmt::Display for ResultTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&render(&self.shared().snapshot()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockPolicy;
    use crate::table::{Hyperparameters, TableBuilder};
    use std::time::Duration;

    fn table(dir: &Path) -> ResultTable {
        let t = TableBuilder::new(["loss", "accuracy"], dir.join("rtable.json"))
            .round_decimal(2)
            .lock_policy(
                LockPolicy::new()
                    .max_attempts(50)
                    .base_delay(Duration::from_millis(1))
                    .jitter(Duration::from_millis(3)),
            )
            .build()
            .unwrap();
        t.add_category("CNN").unwrap();
        t
    }

    #[test]
    fn test_export_column_order() {
        let dir = tempfile::tempdir().unwrap();
        let t = table(dir.path());
        let socket = t
            .register("exp1", "cfg.yaml", Some("CNN"), &Hyperparameters::new())
            .unwrap();
        socket.write([("accuracy", 0.9), ("loss", 0.5)]).unwrap();

        let rows = t.export().unwrap();
        assert_eq!(rows.len(), 1);
        let keys: Vec<&String> = rows[0].metrics.keys().collect();
        assert_eq!(keys, vec!["loss", "accuracy"]);

        let json = serde_json::to_value(&rows[0]).unwrap();
        assert_eq!(json["runId"], 1);
        assert_eq!(json["category"], "CNN");
        assert_eq!(json["status"], "Filled");
        assert_eq!(json["loss"], 0.5);
    }

    #[test]
    fn test_text_report_rounds_and_groups() {
        let dir = tempfile::tempdir().unwrap();
        let t = table(dir.path());
        let hp = Hyperparameters::new()
            .with("a", 1)
            .with("b", 2)
            .with("c", 3)
            .with("d", 4);
        t.register("exp1", "cfg.yaml", Some("CNN"), &hp)
            .unwrap()
            .write([("loss", 0.123_456), ("accuracy", 0.9)])
            .unwrap();
        t.register("exp2", "cfg.yaml", None, &Hyperparameters::new())
            .unwrap();

        let text = t.render_text().unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Category"));
        assert!(text.contains("0.12"));
        assert!(!text.contains("0.123"));
        assert!(text.contains("a:1, b:2, c:3, ..."));
        assert!(lines.iter().any(|l| l.starts_with("CNN")));
        assert!(!text.contains("defaultCategory"));
        assert!(text.contains("Created"));
    }

    #[test]
    fn test_to_text_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let t = table(dir.path());
        let out = dir.path().join("results").join("CompiledResults.txt");
        t.to_text(&out).unwrap();
        assert!(fs::read_to_string(&out).unwrap().starts_with("Category"));
    }
}
