//! Client conventions: naming, key generation, defaults.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value as JsonValue;

use crate::entity::{Entity, IdentityProperty, entity_info};

/// How the server should compare values when sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderingType {
    #[default]
    String,
    Long,
    Double,
    AlphaNumeric,
}

impl OrderingType {
    /// Suffix for an ORDER BY term, if the type is not the default.
    pub const fn as_query_suffix(&self) -> Option<&'static str> {
        match self {
            OrderingType::String => None,
            OrderingType::Long => Some("AS long"),
            OrderingType::Double => Some("AS double"),
            OrderingType::AlphaNumeric => Some("AS alphaNumeric"),
        }
    }
}

/// Defaults shared by every session of a store.
///
/// # Example
///
/// ```ignore
/// let conventions = Conventions::default()
///     .default_query_timeout(Duration::from_secs(60))
///     .allow_queries_on_id(true);
/// ```
#[derive(Debug, Clone)]
pub struct Conventions {
    /// Identity property used when an entity does not name one.
    pub identity_property_name: String,
    /// Separator between collection prefix and identifier in generated keys.
    pub identity_parts_separator: String,
    /// Wait budget for `wait_for_non_stale_results` without explicit timeout.
    pub default_query_timeout: Duration,
    /// Wait budget for reads that must be authoritative.
    pub non_authoritative_timeout: Duration,
    /// Pause before re-sending a stale or non-authoritative read.
    pub retry_delay: Duration,
    /// Allow dynamic queries that only filter on the document key.
    pub allow_queries_on_id: bool,
    /// Upper bound on requests per session. Retries of a stale or
    /// non-authoritative read are not counted.
    pub max_requests_per_session: usize,
    /// Send etags with puts and deletes.
    pub use_optimistic_concurrency: bool,
    key_counters: Arc<Mutex<HashMap<String, u64>>>,
}

impl Default for Conventions {
    fn default() -> Self {
        Self {
            identity_property_name: "id".to_string(),
            identity_parts_separator: "/".to_string(),
            default_query_timeout: Duration::from_secs(15),
            non_authoritative_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_millis(100),
            allow_queries_on_id: false,
            max_requests_per_session: 30,
            use_optimistic_concurrency: false,
            key_counters: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Conventions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn identity_property_name(mut self, name: impl Into<String>) -> Self {
        self.identity_property_name = name.into();
        self
    }

    #[must_use]
    pub fn identity_parts_separator(mut self, separator: impl Into<String>) -> Self {
        self.identity_parts_separator = separator.into();
        self
    }

    #[must_use]
    pub fn default_query_timeout(mut self, timeout: Duration) -> Self {
        self.default_query_timeout = timeout;
        self
    }

    #[must_use]
    pub fn non_authoritative_timeout(mut self, timeout: Duration) -> Self {
        self.non_authoritative_timeout = timeout;
        self
    }

    #[must_use]
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    #[must_use]
    pub fn allow_queries_on_id(mut self, value: bool) -> Self {
        self.allow_queries_on_id = value;
        self
    }

    #[must_use]
    pub fn max_requests_per_session(mut self, value: usize) -> Self {
        self.max_requests_per_session = value;
        self
    }

    #[must_use]
    pub fn use_optimistic_concurrency(mut self, value: bool) -> Self {
        self.use_optimistic_concurrency = value;
        self
    }

    /// Collection for `T`: the declared one, else the pluralized type name.
    pub fn collection_name<T: Entity>(&self) -> String {
        let info = entity_info::<T>();
        match info.declared_collection {
            Some(collection) => collection.to_string(),
            None => pluralize(&info.short_name),
        }
    }

    /// Identity property for `T`, if the type has one.
    pub fn identity_property<T: Entity>(&self) -> Option<String> {
        match entity_info::<T>().identity {
            IdentityProperty::Convention => Some(self.identity_property_name.clone()),
            IdentityProperty::Named(name) => Some(name.to_string()),
            IdentityProperty::Absent => None,
        }
    }

    /// Sort type the server should use for values like `value`.
    pub fn default_ordering(&self, value: &JsonValue) -> OrderingType {
        match value {
            JsonValue::Number(n) if n.is_i64() || n.is_u64() => OrderingType::Long,
            JsonValue::Number(_) => OrderingType::Double,
            _ => OrderingType::String,
        }
    }

    /// Document key for an identity property value.
    ///
    /// Strings are used verbatim; numbers become `collection/number` with the
    /// collection lower-cased. Other values have no key.
    pub fn document_key_from_identity(&self, collection: &str, value: &JsonValue) -> Option<String> {
        match value {
            JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
            JsonValue::Number(n) if n.as_i64() != Some(0) && n.as_u64() != Some(0) => {
                Some(format!(
                    "{}{}{}",
                    collection.to_lowercase(),
                    self.identity_parts_separator,
                    n
                ))
            }
            _ => None,
        }
    }

    /// Generate a fresh key for a new document of `collection`.
    pub fn generate_document_key(&self, collection: &str) -> String {
        let prefix = collection.to_lowercase();
        let mut counters = self.key_counters.lock().unwrap_or_else(|e| e.into_inner());
        let next = counters.entry(prefix.clone()).or_insert(0);
        *next += 1;
        format!("{}{}{}", prefix, self.identity_parts_separator, next)
    }
}

fn pluralize(name: &str) -> String {
    let lower = name.to_lowercase();
    if lower.ends_with('s') || lower.ends_with('x') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{name}es")
    } else if lower.ends_with('y')
        && !matches!(lower.chars().rev().nth(1), Some('a' | 'e' | 'i' | 'o' | 'u'))
    {
        format!("{}ies", &name[..name.len() - 1])
    } else {
        format!("{name}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Serialize, Deserialize)]
    struct Company {
        id: String,
    }

    impl Entity for Company {}

    #[derive(Serialize, Deserialize)]
    struct LogLine {
        text: String,
    }

    impl Entity for LogLine {
        const COLLECTION: Option<&'static str> = Some("Logs");
        const IDENTITY: IdentityProperty = IdentityProperty::Absent;
    }

    #[test]
    fn defaults() {
        let conventions = Conventions::default();
        assert_eq!(conventions.default_query_timeout, Duration::from_secs(15));
        assert_eq!(conventions.identity_property_name, "id");
        assert!(!conventions.allow_queries_on_id);
        assert_eq!(conventions.retry_delay, Duration::from_millis(100));
    }

    #[test]
    fn collection_and_identity_resolution() {
        let conventions = Conventions::default().identity_property_name("Id");
        assert_eq!(conventions.collection_name::<Company>(), "Companies");
        assert_eq!(conventions.identity_property::<Company>().as_deref(), Some("Id"));
        assert_eq!(conventions.collection_name::<LogLine>(), "Logs");
        assert_eq!(conventions.identity_property::<LogLine>(), None);
    }

    #[test]
    fn pluralization() {
        assert_eq!(pluralize("User"), "Users");
        assert_eq!(pluralize("Address"), "Addresses");
        assert_eq!(pluralize("Key"), "Keys");
        assert_eq!(pluralize("Box"), "Boxes");
    }

    #[test]
    fn ordering_per_value_type() {
        let conventions = Conventions::default();
        assert_eq!(conventions.default_ordering(&json!(3)), OrderingType::Long);
        assert_eq!(conventions.default_ordering(&json!(3.5)), OrderingType::Double);
        assert_eq!(conventions.default_ordering(&json!("x")), OrderingType::String);
    }

    #[test]
    fn keys_for_non_string_identities() {
        let conventions = Conventions::default();
        assert_eq!(
            conventions.document_key_from_identity("Users", &json!(7)).as_deref(),
            Some("users/7")
        );
        assert_eq!(
            conventions.document_key_from_identity("Users", &json!("people/1")).as_deref(),
            Some("people/1")
        );
        assert_eq!(conventions.document_key_from_identity("Users", &json!(0)), None);
        assert_eq!(conventions.document_key_from_identity("Users", &json!(null)), None);
    }

    #[test]
    fn generated_keys_are_sequential_per_collection() {
        let conventions = Conventions::default();
        assert_eq!(conventions.generate_document_key("Orders"), "orders/1");
        assert_eq!(conventions.generate_document_key("Orders"), "orders/2");
        assert_eq!(conventions.generate_document_key("Users"), "users/1");
    }
}
