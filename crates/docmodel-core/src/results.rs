//! Server responses consumed by the session.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::document::{Document, Etag};

/// Response to a query request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Returned documents; `None` for a slot the server could not resolve.
    pub results: Vec<Option<Document>>,
    pub includes: Vec<Document>,
    pub is_stale: bool,
    pub non_authoritative: bool,
    pub total_results: u64,
    pub skipped_results: u64,
    pub index_name: String,
    pub index_etag: Option<Etag>,
    pub result_etag: Option<Etag>,
    pub duration_ms: u64,
}

impl QueryResult {
    /// Freeze every document so the result can be shared as a snapshot.
    pub fn ensure_snapshot(&mut self) {
        for doc in self.results.iter_mut().flatten() {
            doc.freeze();
        }
        for doc in &mut self.includes {
            doc.freeze();
        }
    }

    /// Structural copy sharing document storage, with mutable documents.
    #[must_use]
    pub fn create_snapshot(&self) -> Self {
        Self {
            results: self
                .results
                .iter()
                .map(|doc| doc.as_ref().map(Document::snapshot))
                .collect(),
            includes: self.includes.iter().map(Document::snapshot).collect(),
            index_name: self.index_name.clone(),
            ..*self
        }
    }
}

/// Response to a load-by-ids or load-starting-with request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultiLoadResult {
    pub results: Vec<Option<Document>>,
    pub includes: Vec<Document>,
    pub non_authoritative: bool,
}

impl MultiLoadResult {
    /// Whether any returned document carries the non-authoritative flag.
    pub fn has_non_authoritative(&self) -> bool {
        self.non_authoritative
            || self
                .results
                .iter()
                .flatten()
                .any(Document::is_non_authoritative)
    }
}

/// Facet request descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Facet {
    /// Field to aggregate on.
    pub name: String,
    /// Explicit ranges (e.g. `Price < 10`); empty for distinct-value facets.
    pub ranges: Vec<String>,
    pub max_results: Option<usize>,
}

impl Facet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ranges: Vec::new(),
            max_results: None,
        }
    }

    #[must_use]
    pub fn range(mut self, range: impl Into<String>) -> Self {
        self.ranges.push(range.into());
        self
    }

    #[must_use]
    pub fn max_results(mut self, max: usize) -> Self {
        self.max_results = Some(max);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacetValue {
    pub range: String,
    pub hits: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FacetResult {
    pub values: Vec<FacetValue>,
    pub remaining_hits: u64,
}

/// Facet results keyed by facet name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FacetResults {
    pub results: HashMap<String, FacetResult>,
}

/// Outcome of one command in a save batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub key: String,
    /// New etag for puts; `None` for deletes.
    pub etag: Option<Etag>,
    pub deleted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str) -> Document {
        Document::from_json(json!({"@metadata": {"@id": id}})).unwrap()
    }

    #[test]
    fn snapshot_freezes_then_copies() {
        let mut result = QueryResult {
            results: vec![Some(doc("users/1")), None],
            includes: vec![doc("companies/1")],
            is_stale: true,
            total_results: 1,
            ..QueryResult::default()
        };
        result.ensure_snapshot();
        assert!(result.results[0].as_ref().unwrap().is_frozen());
        assert!(result.includes[0].is_frozen());

        let copy = result.create_snapshot();
        let original = result.results[0].as_ref().unwrap();
        let copied = copy.results[0].as_ref().unwrap();
        assert!(copied.shares_storage_with(original));
        assert!(!copied.is_frozen());
        assert!(copy.is_stale);
        assert_eq!(copy.results.len(), 2);
    }

    #[test]
    fn non_authoritative_detected_per_document() {
        let mut flagged = doc("users/1");
        flagged
            .set_metadata(crate::constants::METADATA_NON_AUTHORITATIVE, json!(true))
            .unwrap();
        let result = MultiLoadResult {
            results: vec![Some(flagged), None],
            ..MultiLoadResult::default()
        };
        assert!(result.has_non_authoritative());
        assert!(!MultiLoadResult::default().has_non_authoritative());
    }
}
