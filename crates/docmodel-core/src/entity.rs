//! Entity trait and per-type metadata.
//!
//! Entities are plain serde types. The trait only carries the two facts the
//! session cannot infer from serialization: which collection the type lives in
//! and which property (if any) mirrors the document key.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};

use crate::document::json_kind;
use crate::error::{Error, Result};

/// Where an entity keeps its document key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentityProperty {
    /// Use the conventions' identity property name.
    #[default]
    Convention,
    /// A specific serialized property.
    Named(&'static str),
    /// The type does not expose its key.
    Absent,
}

/// Trait for types stored as documents.
///
/// # Example
///
/// ```ignore
/// use docmodel_core::{Entity, IdentityProperty};
///
/// #[derive(Serialize, Deserialize)]
/// struct User {
///     id: Option<String>,
///     name: String,
/// }
///
/// impl Entity for User {}
///
/// #[derive(Serialize, Deserialize)]
/// struct AuditEntry {
///     message: String,
/// }
///
/// impl Entity for AuditEntry {
///     const COLLECTION: Option<&'static str> = Some("Audit");
///     const IDENTITY: IdentityProperty = IdentityProperty::Absent;
/// }
/// ```
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Collection name; derived from the type name by conventions when `None`.
    const COLLECTION: Option<&'static str> = None;

    /// Identity property of the serialized form.
    const IDENTITY: IdentityProperty = IdentityProperty::Convention;
}

/// Reflection-style facts about an entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityInfo {
    /// Full Rust type path.
    pub type_name: &'static str,
    /// Last path segment without generics, e.g. `User`.
    pub short_name: String,
    pub declared_collection: Option<&'static str>,
    pub identity: IdentityProperty,
}

/// Metadata for `T`, computed once per type for the whole process.
pub fn entity_info<T: Entity>() -> Arc<EntityInfo> {
    static REGISTRY: OnceLock<RwLock<HashMap<TypeId, Arc<EntityInfo>>>> = OnceLock::new();
    let registry = REGISTRY.get_or_init(|| RwLock::new(HashMap::new()));
    let type_id = TypeId::of::<T>();

    {
        let table = registry.read().unwrap_or_else(|e| e.into_inner());
        if let Some(info) = table.get(&type_id) {
            return Arc::clone(info);
        }
    }

    let type_name = std::any::type_name::<T>();
    let info = Arc::new(EntityInfo {
        type_name,
        short_name: short_type_name(type_name).to_string(),
        declared_collection: T::COLLECTION,
        identity: T::IDENTITY,
    });
    tracing::trace!(type_name, "registering entity metadata");
    let mut table = registry.write().unwrap_or_else(|e| e.into_inner());
    Arc::clone(table.entry(type_id).or_insert(info))
}

fn short_type_name(type_name: &str) -> &str {
    let without_generics = type_name.split('<').next().unwrap_or(type_name);
    without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics)
}

/// Serialize an entity into a JSON object.
pub fn entity_to_json<T: Serialize>(entity: &T, key: Option<&str>) -> Result<Map<String, JsonValue>> {
    let type_name = std::any::type_name::<T>();
    match serde_json::to_value(entity) {
        Ok(JsonValue::Object(map)) => Ok(map),
        Ok(other) => Err(Error::conversion(
            key,
            type_name,
            format!("entity serialized to {} instead of an object", json_kind(&other)),
        )),
        Err(err) => Err(Error::conversion(key, type_name, err.to_string())),
    }
}

/// Rebuild an entity from a JSON object.
pub fn entity_from_json<T: DeserializeOwned>(
    body: Map<String, JsonValue>,
    key: Option<&str>,
) -> Result<T> {
    serde_json::from_value(JsonValue::Object(body))
        .map_err(|err| Error::conversion(key, std::any::type_name::<T>(), err.to_string()))
}

/// Write a document key into the identity property of `body`.
///
/// String identities take the key verbatim. When the property already holds a
/// number, the numeric tail of the key (`users/42` -> `42`) is written instead
/// so the entity still deserializes.
pub fn write_identity(body: &mut Map<String, JsonValue>, property: &str, key: &str) {
    let numeric = matches!(body.get(property), Some(JsonValue::Number(_)));
    let value = if numeric {
        key.rsplit('/')
            .next()
            .and_then(|tail| tail.parse::<i64>().ok())
            .map_or_else(|| JsonValue::String(key.to_string()), JsonValue::from)
    } else {
        JsonValue::String(key.to_string())
    };
    body.insert(property.to_string(), value);
}

/// Whether the identity property is missing, null, empty or zero.
pub fn identity_is_unset(body: &Map<String, JsonValue>, property: &str) -> bool {
    match body.get(property) {
        None | Some(JsonValue::Null) => true,
        Some(JsonValue::String(s)) => s.is_empty(),
        Some(JsonValue::Number(n)) => n.as_i64() == Some(0) || n.as_u64() == Some(0),
        Some(_) => false,
    }
}
