//! Record - one row of experiment provenance and metric outcomes

use super::Fingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle status of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    /// Freshly reserved, never written.
    Created,
    /// Unfilled reservation reused by a later registration.
    Filling,
    /// Filled record re-registered for an update.
    Updating,
    /// Metrics committed.
    Filled,
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "Created",
            Self::Filling => "Filling",
            Self::Updating => "Updating",
            Self::Filled => "Filled",
        };
        f.write_str(s)
    }
}

/// A single row of a result table.
///
/// Metric slots are either all present (`filled == true`) or all absent.
/// In the persisted document they sit next to the provenance fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    run_id: u64,
    name: String,
    config: String,
    hyperparameters: Fingerprint,
    status: RecordStatus,
    last_modified: DateTime<Utc>,
    filled: bool,
    #[serde(flatten)]
    metrics: BTreeMap<String, Option<f64>>,
}

impl Record {
    /// Create an unfilled record with one empty slot per metric.
    #[must_use]
    pub fn new(
        run_id: u64,
        name: impl Into<String>,
        config: impl Into<String>,
        hyperparameters: Fingerprint,
        metric_names: &[String],
    ) -> Self {
        Self {
            run_id,
            name: name.into(),
            config: config.into(),
            hyperparameters,
            status: RecordStatus::Created,
            last_modified: Utc::now(),
            filled: false,
            metrics: metric_names.iter().map(|m| (m.clone(), None)).collect(),
        }
    }

    /// Run identifier, unique across the whole table.
    #[must_use]
    pub const fn run_id(&self) -> u64 {
        self.run_id
    }

    /// Experiment name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration file reference.
    #[must_use]
    pub fn config(&self) -> &str {
        &self.config
    }

    /// Hyperparameter fingerprint.
    #[must_use]
    pub const fn hyperparameters(&self) -> &Fingerprint {
        &self.hyperparameters
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> RecordStatus {
        self.status
    }

    /// Time of the last mutation.
    #[must_use]
    pub const fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    /// Whether the metrics have been committed.
    #[must_use]
    pub const fn is_filled(&self) -> bool {
        self.filled
    }

    /// Value of one metric slot; `None` if unfilled or unknown.
    #[must_use]
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied().flatten()
    }

    /// All metric slots keyed by name.
    #[must_use]
    pub const fn metrics(&self) -> &BTreeMap<String, Option<f64>> {
        &self.metrics
    }

    /// Whether this record was registered with the same identity triple.
    #[must_use]
    pub fn matches(&self, name: &str, config: &str, fingerprint: &Fingerprint) -> bool {
        self.name == name && self.config == config && &self.hyperparameters == fingerprint
    }

    pub(crate) fn set_status(&mut self, status: RecordStatus) {
        self.status = status;
        self.last_modified = Utc::now();
    }

    /// Copy every metric value in and mark the record filled.
    pub(crate) fn fill(&mut self, values: &BTreeMap<String, f64>) {
        self.metrics = values.iter().map(|(k, v)| (k.clone(), Some(*v))).collect();
        self.filled = true;
        self.set_status(RecordStatus::Filled);
    }

    /// Whether the slot set equals `metric_names` and honors the
    /// all-present / all-absent rule.
    pub(crate) fn is_consistent(&self, metric_names: &[String]) -> bool {
        if self.metrics.len() != metric_names.len()
            || !metric_names.iter().all(|m| self.metrics.contains_key(m))
        {
            return false;
        }
        if self.filled {
            self.metrics.values().all(Option::is_some)
        } else {
            self.metrics.values().all(Option::is_none)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Hyperparameters;

    fn schema() -> Vec<String> {
        vec!["loss".to_string(), "accuracy".to_string()]
    }

    #[test]
    fn test_new_record_is_unfilled() {
        let record = Record::new(1, "exp1", "cfg.yaml", Fingerprint::default(), &schema());
        assert_eq!(record.status(), RecordStatus::Created);
        assert!(!record.is_filled());
        assert_eq!(record.metric("loss"), None);
        assert!(record.is_consistent(&schema()));
    }

    #[test]
    fn test_fill_sets_all_slots() {
        let mut record = Record::new(1, "exp1", "cfg.yaml", Fingerprint::default(), &schema());
        let values: BTreeMap<String, f64> =
            [("loss".to_string(), 0.5), ("accuracy".to_string(), 0.9)].into();
        record.fill(&values);

        assert!(record.is_filled());
        assert_eq!(record.status(), RecordStatus::Filled);
        assert_eq!(record.metric("accuracy"), Some(0.9));
        assert!(record.is_consistent(&schema()));
    }

    #[test]
    fn test_serialized_metrics_are_flattened() {
        let fp = Hyperparameters::new().with("lr", 0.01).fingerprint();
        let record = Record::new(7, "exp1", "cfg.yaml", fp, &schema());
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["runId"], 7);
        assert_eq!(json["hyperparameters"], r#"{"lr":0.01}"#);
        assert_eq!(json["status"], "Created");
        assert!(json["loss"].is_null());
        assert!(json.get("metrics").is_none());

        let back: Record = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_partial_fill_is_inconsistent() {
        let json = serde_json::json!({
            "runId": 1, "name": "e", "config": "c", "hyperparameters": "",
            "status": "Filled", "lastModified": "2024-01-01T00:00:00Z",
            "filled": true, "loss": 0.4, "accuracy": null
        });
        let record: Record = serde_json::from_value(json).unwrap();
        assert!(!record.is_consistent(&schema()));
    }
}
