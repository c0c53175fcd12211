//! Identity Map pattern for tracking one entity instance per document key.
//!
//! The Identity Map ensures that each document corresponds to exactly one
//! entity instance within a session. This provides:
//!
//! - **Uniqueness**: Same key always returns the same `Arc`
//! - **Cache**: Avoids redundant round trips for the same document
//! - **Consistency**: Changes to an entity are visible everywhere it's used
//!
//! # Design
//!
//! Keys are compared case-insensitively. Entries hold a type-erased
//! `Arc<RwLock<T>>` plus a monomorphized serializer, so the session can turn
//! any tracked entity back into JSON without knowing its type. A reverse index
//! from the `Arc` address finds the entry for an entity the caller hands back.
//!
//! Besides tracked entries the map remembers two kinds of documents it has
//! seen without materializing an entity: documents delivered through includes
//! (converted on first load) and keys confirmed missing on the server.
//!
//! # Example
//!
//! ```ignore
//! let mut map = IdentityMap::new();
//! map.insert(TrackedEntry::new("users/1", Arc::new(RwLock::new(user)), ...));
//!
//! let first = map.get::<User>("users/1")?.unwrap();
//! let second = map.get::<User>("USERS/1")?.unwrap();
//! assert!(Arc::ptr_eq(&first, &second));
//! ```

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use docmodel_core::constants::METADATA_ETAG;
use docmodel_core::{
    Document, Entity, Error, Etag, IdentityConflictKind, Result, entity_to_json,
};
use serde_json::{Map, Value as JsonValue};

/// A reference to an entity tracked by a session.
pub type EntityRef<T> = Arc<RwLock<T>>;

/// A guard for reading a tracked entity.
pub type EntityReadGuard<'a, T> = std::sync::RwLockReadGuard<'a, T>;

/// A guard for writing to a tracked entity.
pub type EntityWriteGuard<'a, T> = std::sync::RwLockWriteGuard<'a, T>;

type SerializeFn = fn(&(dyn Any + Send + Sync), &str) -> Result<Map<String, JsonValue>>;

fn serialize_tracked<T: Entity>(
    entity: &(dyn Any + Send + Sync),
    key: &str,
) -> Result<Map<String, JsonValue>> {
    let Some(entity) = entity.downcast_ref::<EntityRef<T>>() else {
        return Err(Error::conversion(
            Some(key),
            std::any::type_name::<T>(),
            "tracked entity has a different type",
        ));
    };
    let guard = entity.read().unwrap_or_else(|e| e.into_inner());
    entity_to_json(&*guard, Some(key))
}

/// Address of the value behind an entity reference.
pub(crate) fn instance_address<T>(entity: &EntityRef<T>) -> usize {
    Arc::as_ptr(entity).cast::<()>() as usize
}

/// Lower-cased lookup key.
pub(crate) fn normalize_key(key: &str) -> String {
    key.to_lowercase()
}

/// One document known to the session.
pub struct TrackedEntry {
    key: String,
    /// Type-erased `EntityRef<T>`.
    entity: Box<dyn Any + Send + Sync>,
    instance: usize,
    type_id: TypeId,
    type_name: &'static str,
    serialize: SerializeFn,
    /// Serialized property that mirrors the key, if any.
    pub identity_property: Option<String>,
    pub etag: Option<Etag>,
    /// Document as last seen on the server (frozen). Empty for new entities.
    pub original: Document,
    pub metadata: Map<String, JsonValue>,
    pub deleted: bool,
    /// Stored in this session and not yet saved.
    pub is_new: bool,
}

impl TrackedEntry {
    pub fn new<T: Entity>(
        key: impl Into<String>,
        entity: EntityRef<T>,
        original: Document,
        metadata: Map<String, JsonValue>,
        identity_property: Option<String>,
    ) -> Self {
        let etag = metadata
            .get(METADATA_ETAG)
            .and_then(JsonValue::as_u64)
            .map(Etag);
        Self {
            key: key.into(),
            instance: instance_address(&entity),
            entity: Box::new(entity),
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            serialize: serialize_tracked::<T>,
            identity_property,
            etag,
            original: original.frozen(),
            metadata,
            deleted: false,
            is_new: false,
        }
    }

    #[must_use]
    pub fn mark_new(mut self) -> Self {
        self.is_new = true;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is_type<T: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    /// The tracked entity, if it has type `T`.
    pub fn entity<T: Entity>(&self) -> Option<EntityRef<T>> {
        self.entity.downcast_ref::<EntityRef<T>>().map(Arc::clone)
    }

    /// Current state of the entity as a JSON object.
    pub fn to_json(&self) -> Result<Map<String, JsonValue>> {
        (self.serialize)(self.entity.as_ref(), &self.key)
    }
}

impl std::fmt::Debug for TrackedEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedEntry")
            .field("key", &self.key)
            .field("type_name", &self.type_name)
            .field("etag", &self.etag)
            .field("deleted", &self.deleted)
            .field("is_new", &self.is_new)
            .finish_non_exhaustive()
    }
}

/// Identity map of a session.
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: HashMap<String, TrackedEntry>,
    by_instance: HashMap<usize, String>,
    included: HashMap<String, Document>,
    missing: HashSet<String>,
}

impl IdentityMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an entry. Fails when the key is already tracked.
    pub fn insert(&mut self, entry: TrackedEntry) -> Result<()> {
        let normalized = normalize_key(&entry.key);
        if self.entries.contains_key(&normalized) {
            return Err(Error::identity_conflict(
                IdentityConflictKind::KeyTaken,
                entry.key,
            ));
        }
        tracing::trace!(
            key = %entry.key,
            entity = entry.type_name,
            "Tracking entity"
        );
        self.missing.remove(&normalized);
        self.included.remove(&normalized);
        self.by_instance.insert(entry.instance, normalized.clone());
        self.entries.insert(normalized, entry);
        Ok(())
    }

    /// The tracked entity under `key`.
    ///
    /// Fails when the key is tracked with a different type.
    pub fn get<T: Entity>(&self, key: &str) -> Result<Option<EntityRef<T>>> {
        let Some(entry) = self.entries.get(&normalize_key(key)) else {
            return Ok(None);
        };
        match entry.entity::<T>() {
            Some(entity) => {
                tracing::trace!(key, "Identity map hit");
                Ok(Some(entity))
            }
            None => Err(Error::identity_conflict(
                IdentityConflictKind::KeyTaken,
                entry.key.clone(),
            )),
        }
    }

    pub fn entry(&self, key: &str) -> Option<&TrackedEntry> {
        self.entries.get(&normalize_key(key))
    }

    pub fn entry_mut(&mut self, key: &str) -> Option<&mut TrackedEntry> {
        self.entries.get_mut(&normalize_key(key))
    }

    /// The entry tracking this exact instance.
    pub fn entry_for<T>(&self, entity: &EntityRef<T>) -> Option<&TrackedEntry> {
        let key = self.by_instance.get(&instance_address(entity))?;
        self.entries.get(key)
    }

    pub fn entry_for_mut<T>(&mut self, entity: &EntityRef<T>) -> Option<&mut TrackedEntry> {
        let key = self.by_instance.get(&instance_address(entity))?;
        self.entries.get_mut(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(&normalize_key(key))
    }

    pub fn remove(&mut self, key: &str) -> Option<TrackedEntry> {
        let entry = self.entries.remove(&normalize_key(key))?;
        self.by_instance.remove(&entry.instance);
        Some(entry)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedEntry> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TrackedEntry> {
        self.entries.values_mut()
    }

    /// Keys of all tracked entries, sorted for deterministic batches.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.values().map(|e| e.key.clone()).collect();
        keys.sort();
        keys
    }

    /// Remember a document delivered through an include path.
    pub fn register_included(&mut self, document: Document) {
        let Some(key) = document.id().map(normalize_key) else {
            return;
        };
        if self.entries.contains_key(&key) {
            return;
        }
        self.missing.remove(&key);
        self.included.insert(key, document);
    }

    pub fn take_included(&mut self, key: &str) -> Option<Document> {
        self.included.remove(&normalize_key(key))
    }

    pub fn is_included(&self, key: &str) -> bool {
        self.included.contains_key(&normalize_key(key))
    }

    /// Record that the server has no document under `key`.
    pub fn register_missing(&mut self, key: &str) {
        let key = normalize_key(key);
        if !self.entries.contains_key(&key) {
            tracing::trace!(key = %key, "Registering confirmed-missing key");
            self.missing.insert(key);
        }
    }

    pub fn is_missing(&self, key: &str) -> bool {
        self.missing.contains(&normalize_key(key))
    }

    pub fn forget_missing(&mut self, key: &str) {
        self.missing.remove(&normalize_key(key));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_instance.clear();
        self.included.clear();
        self.missing.clear();
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
