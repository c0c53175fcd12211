//! Canonical documents for tracked entities.
//!
//! [`SnapshotCache`] converts a tracked entity into the document the session
//! would send to the server. During a save pass, a [`CachingScope`] makes
//! repeated conversions of the same key return the same frozen snapshot, so
//! change detection and batch building see one consistent view.
//!
//! Fields that the server document carries but the entity type does not map
//! are remembered per key and written back on conversion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use docmodel_core::constants::METADATA;
use docmodel_core::{Document, Error, Result, entity_from_json, write_identity};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};

use crate::identity_map::{TrackedEntry, normalize_key};

type SharedCache = Arc<Mutex<Option<HashMap<String, Document>>>>;

/// Converter from tracked entities to canonical documents.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    cache: SharedCache,
    unmapped: HashMap<String, Map<String, JsonValue>>,
}

/// Guard for a save pass. Dropping it discards every cached snapshot.
#[derive(Debug)]
#[must_use = "the caching scope ends when the guard is dropped"]
pub struct CachingScope {
    cache: SharedCache,
}

impl Drop for CachingScope {
    fn drop(&mut self) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entries) = cache.take() {
            tracing::trace!(cached = entries.len(), "Caching scope closed");
        }
    }
}

impl SnapshotCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start caching conversions until the returned guard is dropped.
    ///
    /// Only one scope may be open at a time.
    pub fn begin_caching_scope(&self) -> Result<CachingScope> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if cache.is_some() {
            return Err(Error::InvalidSessionState(
                "a caching scope is already active".to_string(),
            ));
        }
        *cache = Some(HashMap::new());
        Ok(CachingScope {
            cache: Arc::clone(&self.cache),
        })
    }

    pub fn is_caching(&self) -> bool {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Canonical, frozen document for a tracked entry.
    ///
    /// The body is the serialized entity without its identity property, plus
    /// any remembered unmapped fields; `@metadata` is the entry's metadata.
    pub fn to_document(&self, entry: &TrackedEntry) -> Result<Document> {
        let cache_key = normalize_key(entry.key());
        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(document) = cache.as_ref().and_then(|docs| docs.get(&cache_key)) {
                tracing::trace!(key = entry.key(), "Snapshot cache hit");
                return Ok(document.clone());
            }
        }

        let mut body = entry.to_json()?;
        if let Some(property) = &entry.identity_property {
            body.remove(property);
        }
        if let Some(unmapped) = self.unmapped.get(&cache_key) {
            for (name, value) in unmapped {
                if !body.contains_key(name) {
                    body.insert(name.clone(), value.clone());
                }
            }
        }
        body.insert(METADATA.to_string(), JsonValue::Object(entry.metadata.clone()));
        let document = Document::from_map(body).frozen();

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(docs) = cache.as_mut() {
            docs.insert(cache_key, document.clone());
        }
        Ok(document)
    }

    /// Remember the fields of `original` that `mapped` (the entity's own
    /// serialization) does not carry.
    pub fn remember_unmapped(
        &mut self,
        key: &str,
        original: &Map<String, JsonValue>,
        mapped: &Map<String, JsonValue>,
    ) {
        let unmapped: Map<String, JsonValue> = original
            .iter()
            .filter(|(name, _)| name.as_str() != METADATA && !mapped.contains_key(*name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        let key = normalize_key(key);
        if unmapped.is_empty() {
            self.unmapped.remove(&key);
        } else {
            tracing::trace!(key = %key, fields = unmapped.len(), "Remembering unmapped fields");
            self.unmapped.insert(key, unmapped);
        }
    }

    pub fn unmapped_fields(&self, key: &str) -> Option<&Map<String, JsonValue>> {
        self.unmapped.get(&normalize_key(key))
    }

    pub fn forget(&mut self, key: &str) {
        self.unmapped.remove(&normalize_key(key));
    }

    pub fn clear(&mut self) {
        self.unmapped.clear();
    }
}

/// Rebuild an entity from a document body, writing `key` into its identity
/// property when the body does not already hold one.
///
/// The key is tried as a string first; when that does not fit the entity and
/// the key ends in a number (`users/42`), the number is used instead.
pub fn hydrate<T: DeserializeOwned>(
    key: Option<&str>,
    mut body: Map<String, JsonValue>,
    identity_property: Option<&str>,
) -> Result<T> {
    let (Some(key), Some(property)) = (key, identity_property) else {
        return entity_from_json(body, key);
    };
    if !docmodel_core::identity_is_unset(&body, property) {
        return entity_from_json(body, Some(key));
    }

    write_identity(&mut body, property, key);
    let numeric_tail = key
        .rsplit('/')
        .next()
        .and_then(|tail| tail.parse::<i64>().ok());
    let fallback = numeric_tail.map(|n| {
        let mut numeric = body.clone();
        numeric.insert(property.to_string(), JsonValue::from(n));
        numeric
    });

    match entity_from_json(body, Some(key)) {
        Ok(entity) => Ok(entity),
        Err(err) => match fallback {
            Some(numeric) => entity_from_json(numeric, Some(key)).map_err(|_| err),
            None => Err(err),
        },
    }
}
