//! The key-to-result mapping returned when a batch closes.

use std::ops::Index;

use indexmap::IndexMap;
use serde::Serialize;

use crate::operation::RawResult;

/// Results of a closed batch, in registration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct BatchResults {
    results: IndexMap<String, RawResult>,
}

impl BatchResults {
    /// Create from a result map.
    pub fn new(results: IndexMap<String, RawResult>) -> Self {
        Self { results }
    }

    /// Get the result of a key.
    pub fn get(&self, key: &str) -> Option<&RawResult> {
        self.results.get(key)
    }

    /// Check if a key has a result.
    pub fn contains_key(&self, key: &str) -> bool {
        self.results.contains_key(key)
    }

    /// Iterate over `(key, result)` pairs.
    pub fn iter(&self) -> indexmap::map::Iter<'_, String, RawResult> {
        self.results.iter()
    }

    /// Iterate over the keys.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.results.keys().map(String::as_str)
    }

    /// Number of results.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Check if the batch was empty.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Results that produced rows or counters.
    pub fn successful(&self) -> impl Iterator<Item = (&str, &RawResult)> {
        self.results
            .iter()
            .filter(|(_, r)| !r.is_failure())
            .map(|(k, r)| (k.as_str(), r))
    }

    /// Results that failed.
    pub fn failed(&self) -> impl Iterator<Item = (&str, &RawResult)> {
        self.results
            .iter()
            .filter(|(_, r)| r.is_failure())
            .map(|(k, r)| (k.as_str(), r))
    }

    /// Check if any operation failed.
    pub fn has_failures(&self) -> bool {
        self.results.values().any(RawResult::is_failure)
    }

    /// Fraction of successful operations (1.0 for an empty batch).
    pub fn success_rate(&self) -> f64 {
        if self.results.is_empty() {
            return 1.0;
        }
        self.successful().count() as f64 / self.results.len() as f64
    }

    /// Take the underlying map.
    pub fn into_inner(self) -> IndexMap<String, RawResult> {
        self.results
    }
}

impl Index<&str> for BatchResults {
    type Output = RawResult;

    fn index(&self, key: &str) -> &RawResult {
        &self.results[key]
    }
}

impl IntoIterator for BatchResults {
    type Item = (String, RawResult);
    type IntoIter = indexmap::map::IntoIter<String, RawResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}

impl<'a> IntoIterator for &'a BatchResults {
    type Item = (&'a String, &'a RawResult);
    type IntoIter = indexmap::map::Iter<'a, String, RawResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.iter()
    }
}

impl From<IndexMap<String, RawResult>> for BatchResults {
    fn from(results: IndexMap<String, RawResult>) -> Self {
        Self::new(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use serde_json::json;

    fn sample() -> BatchResults {
        let mut map = IndexMap::new();
        map.insert(
            "k".to_string(),
            RawResult::Rows {
                rows: vec![json!({"a": 1, "b": "x"}).as_object().cloned().unwrap()],
            },
        );
        map.insert(
            "ins".to_string(),
            RawResult::Exec {
                affected_rows: 3,
                insert_id: 7,
            },
        );
        map.insert(
            "bad".to_string(),
            RawResult::failure(FailureKind::Query, "syntax", 1064),
        );
        map.insert("slow".to_string(), RawResult::timeout());
        BatchResults::new(map)
    }

    #[test]
    fn test_partitions() {
        let results = sample();
        assert_eq!(results.len(), 4);
        assert!(results.has_failures());
        assert_eq!(
            results.successful().map(|(k, _)| k).collect::<Vec<_>>(),
            vec!["k", "ins"]
        );
        assert_eq!(
            results.failed().map(|(k, _)| k).collect::<Vec<_>>(),
            vec!["bad", "slow"]
        );
        assert_eq!(results.success_rate(), 0.5);
    }

    #[test]
    fn test_index_and_round_trip() {
        let results = sample();
        assert_eq!(
            serde_json::to_value(results["k"].rows().unwrap()).unwrap(),
            json!([{"a": 1, "b": "x"}])
        );
        assert_eq!(results["ins"].affected_rows(), Some(3));
        assert_eq!(results["ins"].insert_id(), Some(7));
        assert!(results.get("missing").is_none());
    }

    #[test]
    fn test_empty() {
        let results = BatchResults::default();
        assert!(results.is_empty());
        assert!(!results.has_failures());
        assert_eq!(results.success_rate(), 1.0);
        assert_eq!(results.into_inner().len(), 0);
    }

    #[test]
    fn test_serialize_transparent() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["ins"], json!({"type": "exec", "affected_rows": 3, "insert_id": 7}));
    }
}
