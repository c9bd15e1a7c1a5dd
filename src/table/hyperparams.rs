//! Hyperparameter snapshot and its normalized fingerprint

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Flat key → value mapping of the hyperparameters of one run.
///
/// Keys are kept sorted, so two snapshots with the same pairs always yield
/// the same [`Fingerprint`] whatever the insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hyperparameters {
    values: BTreeMap<String, Value>,
}

impl Hyperparameters {
    /// Create an empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a hyperparameter, builder style.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Add or replace a hyperparameter.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Look up a hyperparameter.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Number of hyperparameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Normalized representation used for deduplication.
    ///
    /// The pairs encoded as one compact JSON object in key order. Keys are
    /// JSON-escaped, so no two distinct snapshots share a fingerprint, and
    /// nested objects are key-sorted too.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        let encoded = serde_json::Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        Fingerprint(encoded.to_string())
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Hyperparameters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Order-stable encoding of a [`Hyperparameters`] snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Raw encoded form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First `max` pairs as `key:value`, joined by `", "`, with a trailing
    /// `", ..."` when pairs were left out.
    #[must_use]
    pub fn summary(&self, max: usize) -> String {
        let Ok(pairs) = serde_json::from_str::<BTreeMap<String, Value>>(&self.0) else {
            return self.0.clone();
        };
        let shown: Vec<String> = pairs
            .iter()
            .take(max)
            .map(|(k, v)| format!("{k}:{v}"))
            .collect();
        if pairs.len() > max {
            format!("{}, ...", shown.join(", "))
        } else {
            shown.join(", ")
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_ignores_insertion_order() {
        let a = Hyperparameters::new().with("lr", 0.01).with("batch", 32);
        let b = Hyperparameters::new().with("batch", 32).with("lr", 0.01);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().as_str(), r#"{"batch":32,"lr":0.01}"#);
    }

    #[test]
    fn test_fingerprint_distinguishes_values() {
        let a = Hyperparameters::new().with("lr", 0.01);
        let b = Hyperparameters::new().with("lr", 0.001);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_string_values_are_quoted() {
        let hp = Hyperparameters::new().with("dataset", "Huge");
        assert_eq!(hp.fingerprint().as_str(), r#"{"dataset":"Huge"}"#);
        assert_eq!(hp.fingerprint().summary(3), r#"dataset:"Huge""#);
    }

    #[test]
    fn test_empty_fingerprint() {
        let hp = Hyperparameters::new();
        assert!(hp.is_empty());
        assert_eq!(hp.fingerprint().as_str(), "{}");
        assert_eq!(hp.fingerprint().summary(3), "");
        assert_eq!(Fingerprint::default().summary(3), "");
    }

    #[test]
    fn test_summary_truncates_after_three() {
        let hp: Hyperparameters = [("a", 1), ("b", 2), ("c", 3), ("d", 4)].into_iter().collect();
        assert_eq!(hp.fingerprint().summary(3), "a:1, b:2, c:3, ...");

        let short: Hyperparameters = [("a", 1), ("b", 2)].into_iter().collect();
        assert_eq!(short.fingerprint().summary(3), "a:1, b:2");
    }

    #[test]
    fn test_separator_characters_in_keys_stay_distinct() {
        let split = Hyperparameters::new().with("a", 1).with("b", 2);
        let joined = Hyperparameters::new().with("a:1\nb", 2);
        assert_ne!(split.fingerprint(), joined.fingerprint());
    }
}
