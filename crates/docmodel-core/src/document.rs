//! Documents and version tokens.
//!
//! A [`Document`] is a JSON object shared through an `Arc`. Cloning a document
//! or taking a [`Document::snapshot`] is a pointer copy; the first mutation of
//! a shared document copies the underlying map (copy-on-write). A frozen
//! document rejects every mutation with [`Error::Frozen`], which lets the
//! session hand out cached snapshots without fear of them changing underneath
//! a later diff.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value as JsonValue};

use crate::constants::{METADATA, METADATA_ETAG, METADATA_ID, METADATA_NON_AUTHORITATIVE};
use crate::error::{Error, FrozenError, Result};

/// Opaque, monotonically advancing revision marker of a document or index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Etag(pub u64);

impl fmt::Display for Etag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A JSON object with freeze and copy-on-write snapshot semantics.
#[derive(Clone, Default)]
pub struct Document {
    fields: Arc<Map<String, JsonValue>>,
    frozen: bool,
}

impl Document {
    /// Create an empty, mutable document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing JSON map.
    #[must_use]
    pub fn from_map(fields: Map<String, JsonValue>) -> Self {
        Self {
            fields: Arc::new(fields),
            frozen: false,
        }
    }

    /// Build a document from a JSON value, which must be an object.
    pub fn from_json(value: JsonValue) -> Result<Self> {
        match value {
            JsonValue::Object(map) => Ok(Self::from_map(map)),
            other => Err(Error::conversion(
                None,
                "Document",
                format!("expected a JSON object, found {}", json_kind(&other)),
            )),
        }
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.fields.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &JsonValue)> {
        self.fields.iter()
    }

    /// Borrow the underlying map.
    pub fn as_map(&self) -> &Map<String, JsonValue> {
        &self.fields
    }

    /// Set a property, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: JsonValue) -> Result<Option<JsonValue>> {
        let key = key.into();
        self.ensure_mutable(&key)?;
        Ok(Arc::make_mut(&mut self.fields).insert(key, value))
    }

    /// Remove a property, returning its value.
    pub fn remove(&mut self, key: &str) -> Result<Option<JsonValue>> {
        self.ensure_mutable(key)?;
        if !self.fields.contains_key(key) {
            return Ok(None);
        }
        Ok(Arc::make_mut(&mut self.fields).remove(key))
    }

    /// The `@metadata` object, if present.
    pub fn metadata(&self) -> Option<&Map<String, JsonValue>> {
        self.fields.get(METADATA).and_then(JsonValue::as_object)
    }

    /// A single metadata entry.
    pub fn metadata_value(&self, name: &str) -> Option<&JsonValue> {
        self.metadata().and_then(|meta| meta.get(name))
    }

    /// Set a metadata entry, creating the `@metadata` object on demand.
    pub fn set_metadata(&mut self, name: impl Into<String>, value: JsonValue) -> Result<()> {
        self.ensure_mutable(METADATA)?;
        let fields = Arc::make_mut(&mut self.fields);
        let entry = fields
            .entry(METADATA.to_string())
            .or_insert_with(|| JsonValue::Object(Map::new()));
        if !entry.is_object() {
            *entry = JsonValue::Object(Map::new());
        }
        if let JsonValue::Object(meta) = entry {
            meta.insert(name.into(), value);
        }
        Ok(())
    }

    /// Document key from `@metadata.@id`.
    pub fn id(&self) -> Option<&str> {
        self.metadata_value(METADATA_ID).and_then(JsonValue::as_str)
    }

    /// Etag from `@metadata.@etag`.
    pub fn etag(&self) -> Option<Etag> {
        self.metadata_value(METADATA_ETAG)
            .and_then(JsonValue::as_u64)
            .map(Etag)
    }

    /// Whether the server flagged this read as possibly out of date.
    pub fn is_non_authoritative(&self) -> bool {
        self.metadata_value(METADATA_NON_AUTHORITATIVE)
            .and_then(JsonValue::as_bool)
            .unwrap_or(false)
    }

    /// Freeze in place. Nested values are only reachable through `&`, so
    /// freezing the root freezes the whole tree.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Consume and return a frozen document.
    #[must_use]
    pub fn frozen(mut self) -> Self {
        self.freeze();
        self
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Cheap mutable copy sharing storage until first write.
    #[must_use]
    pub fn snapshot(&self) -> Self {
        Self {
            fields: Arc::clone(&self.fields),
            frozen: false,
        }
    }

    /// Whether two documents share the same storage.
    pub fn shares_storage_with(&self, other: &Document) -> bool {
        Arc::ptr_eq(&self.fields, &other.fields)
    }

    /// Copy of the body without the `@metadata` object.
    pub fn body(&self) -> Map<String, JsonValue> {
        self.fields
            .iter()
            .filter(|(key, _)| key.as_str() != METADATA)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(self.fields.as_ref().clone())
    }

    pub fn into_map(self) -> Map<String, JsonValue> {
        Arc::try_unwrap(self.fields).unwrap_or_else(|shared| shared.as_ref().clone())
    }

    fn ensure_mutable(&self, property: &str) -> Result<()> {
        if self.frozen {
            return Err(Error::Frozen(FrozenError {
                property: property.to_string(),
            }));
        }
        Ok(())
    }
}

pub(crate) fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.fields, &other.fields) || self.fields == other.fields
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("fields", &self.fields)
            .field("frozen", &self.frozen)
            .finish()
    }
}

impl From<Map<String, JsonValue>> for Document {
    fn from(fields: Map<String, JsonValue>) -> Self {
        Self::from_map(fields)
    }
}

impl Serialize for Document {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.fields.as_ref().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Document {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Map::deserialize(deserializer).map(Self::from_map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user_doc() -> Document {
        Document::from_json(json!({
            "name": "Ayende",
            "age": 40,
            "@metadata": { "@id": "users/1", "@etag": 7 }
        }))
        .unwrap()
    }

    #[test]
    fn reads_metadata() {
        let doc = user_doc();
        assert_eq!(doc.id(), Some("users/1"));
        assert_eq!(doc.etag(), Some(Etag(7)));
        assert!(!doc.is_non_authoritative());
        assert_eq!(doc.body().len(), 2);
    }

    #[test]
    fn frozen_document_rejects_mutation() {
        let mut doc = user_doc().frozen();
        let err = doc.insert("name", json!("Oren")).unwrap_err();
        assert!(matches!(err, Error::Frozen(ref e) if e.property == "name"));
        assert!(doc.remove("age").is_err());
        assert!(doc.set_metadata("@etag", json!(8)).is_err());
        assert_eq!(doc.get("name"), Some(&json!("Ayende")));
    }

    #[test]
    fn snapshot_is_copy_on_write() {
        let frozen = user_doc().frozen();
        let mut copy = frozen.snapshot();
        assert!(copy.shares_storage_with(&frozen));
        assert!(!copy.is_frozen());

        copy.insert("name", json!("Oren")).unwrap();
        assert!(!copy.shares_storage_with(&frozen));
        assert_eq!(frozen.get("name"), Some(&json!("Ayende")));
        assert_eq!(copy.get("name"), Some(&json!("Oren")));
    }

    #[test]
    fn non_object_json_is_a_conversion_error() {
        let err = Document::from_json(json!([1, 2])).unwrap_err();
        assert!(matches!(err, Error::Conversion(_)));
    }

    #[test]
    fn set_metadata_creates_object() {
        let mut doc = Document::new();
        doc.set_metadata(METADATA_ID, json!("orders/1")).unwrap();
        assert_eq!(doc.id(), Some("orders/1"));
    }
}
