//! The renderable query unit sent to the server.

use std::time::Duration;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value as JsonValue;

use crate::document::Etag;

/// Append-only table of named query parameters.
///
/// Insertion order is kept so the same builder calls always produce the same
/// table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameters {
    entries: Vec<(String, JsonValue)>,
}

impl Parameters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `value` under the next sequential name (`p0`, `p1`, ...).
    ///
    /// Equal values are not merged; every call gets its own slot.
    pub fn add(&mut self, value: JsonValue) -> String {
        let name = format!("p{}", self.entries.len());
        self.entries.push((name.clone(), value));
        name
    }

    /// Register a value under a caller-chosen name. Returns `false` when the
    /// name is already taken.
    pub fn add_named(&mut self, name: impl Into<String>, value: JsonValue) -> bool {
        let name = name.into();
        if self.contains(&name) {
            return false;
        }
        self.entries.push((name, value));
        true
    }

    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.entries
            .iter()
            .find(|(candidate, _)| candidate == name)
            .map(|(_, value)| value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(candidate, _)| candidate == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &JsonValue)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }
}

impl Serialize for Parameters {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Query text plus everything the server needs to run it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexQuery {
    pub query: String,
    pub query_parameters: Parameters,
    pub start: usize,
    pub page_size: Option<usize>,
    pub wait_for_non_stale_results: bool,
    /// Results must reflect at least this etag.
    pub cutoff_etag: Option<Etag>,
    pub wait_for_non_stale_results_timeout: Option<Duration>,
    pub disable_caching: bool,
}

impl IndexQuery {
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    /// Stable identity of the query, used to recognise repeated requests.
    pub fn cache_key(&self) -> String {
        let parameters = serde_json::to_string(&self.query_parameters).unwrap_or_default();
        format!(
            "{}|{}|{}|{:?}",
            self.query, parameters, self.start, self.page_size
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parameters_are_sequential_and_not_deduplicated() {
        let mut params = Parameters::new();
        assert_eq!(params.add(json!("a")), "p0");
        assert_eq!(params.add(json!("a")), "p1");
        assert_eq!(params.add(json!(3)), "p2");
        assert_eq!(params.len(), 3);
        assert_eq!(params.get("p1"), Some(&json!("a")));
    }

    #[test]
    fn named_parameters_reject_duplicates() {
        let mut params = Parameters::new();
        assert!(params.add_named("name", json!("Oren")));
        assert!(!params.add_named("name", json!("Ayende")));
        assert_eq!(params.get("name"), Some(&json!("Oren")));
    }

    #[test]
    fn parameters_serialize_in_insertion_order() {
        let mut params = Parameters::new();
        for i in 0..12 {
            params.add(json!(i));
        }
        let text = serde_json::to_string(&params).unwrap();
        assert!(text.starts_with(r#"{"p0":0,"p1":1,"p2":2"#));
        assert!(text.ends_with(r#""p11":11}"#));
    }

    #[test]
    fn cache_key_changes_with_paging() {
        let mut first = IndexQuery::new("FROM Users");
        let key = first.cache_key();
        first.start = 10;
        assert_ne!(key, first.cache_key());
    }
}
