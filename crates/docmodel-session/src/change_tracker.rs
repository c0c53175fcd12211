//! Change tracking and dirty detection for docmodel sessions.
//!
//! Changes are found by comparing the canonical document of a tracked entity
//! with the document the session originally received from the server.

use docmodel_core::Document;
use serde_json::Value as JsonValue;

/// Kind of difference between two versions of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Entity stored in this session, never saved
    NewDocument,
    /// Entity marked for deletion
    DocumentDeleted,
    FieldAdded,
    FieldRemoved,
    FieldChanged,
    /// `@metadata` differs
    MetadataChanged,
}

/// One difference found by [`diff`].
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    /// Top-level field name; empty for whole-document changes.
    pub field_name: String,
    pub old_value: Option<JsonValue>,
    pub new_value: Option<JsonValue>,
    pub change: ChangeKind,
}

impl DocumentChange {
    pub fn whole_document(change: ChangeKind) -> Self {
        Self {
            field_name: String::new(),
            old_value: None,
            new_value: None,
            change,
        }
    }
}

/// Field-level differences between `original` and `current`.
///
/// Changes are reported in field-name order.
#[tracing::instrument(level = "trace", skip_all)]
pub fn diff(original: &Document, current: &Document) -> Vec<DocumentChange> {
    let before = original.body();
    let after = current.body();
    let mut changes = Vec::new();

    let mut names: Vec<&String> = before.keys().chain(after.keys()).collect();
    names.sort();
    names.dedup();

    for name in names {
        match (before.get(name), after.get(name)) {
            (Some(old), Some(new)) if old != new => changes.push(DocumentChange {
                field_name: name.clone(),
                old_value: Some(old.clone()),
                new_value: Some(new.clone()),
                change: ChangeKind::FieldChanged,
            }),
            (Some(old), None) => changes.push(DocumentChange {
                field_name: name.clone(),
                old_value: Some(old.clone()),
                new_value: None,
                change: ChangeKind::FieldRemoved,
            }),
            (None, Some(new)) => changes.push(DocumentChange {
                field_name: name.clone(),
                old_value: None,
                new_value: Some(new.clone()),
                change: ChangeKind::FieldAdded,
            }),
            _ => {}
        }
    }

    if original.metadata() != current.metadata() {
        changes.push(DocumentChange {
            field_name: docmodel_core::constants::METADATA.to_string(),
            old_value: original.get(docmodel_core::constants::METADATA).cloned(),
            new_value: current.get(docmodel_core::constants::METADATA).cloned(),
            change: ChangeKind::MetadataChanged,
        });
    }

    tracing::trace!(changed = changes.len(), "Document diff");
    changes
}

/// Whether `current` differs from `original` in any field or in metadata.
pub fn is_dirty(original: &Document, current: &Document) -> bool {
    original != current
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: JsonValue) -> Document {
        Document::from_json(value).unwrap()
    }

    #[test]
    fn test_identical_documents_have_no_changes() {
        let a = doc(json!({"Name": "a", "Age": 3, "@metadata": {"@id": "users/1"}}));
        let b = doc(json!({"Age": 3, "Name": "a", "@metadata": {"@id": "users/1"}}));
        assert!(diff(&a, &b).is_empty());
        assert!(!is_dirty(&a, &b));
    }

    #[test]
    fn test_field_changes_in_name_order() {
        let a = doc(json!({"Name": "a", "Age": 3, "Gone": true}));
        let b = doc(json!({"Name": "b", "Age": 3, "Added": 1}));
        let changes = diff(&a, &b);
        let summary: Vec<(&str, ChangeKind)> = changes
            .iter()
            .map(|c| (c.field_name.as_str(), c.change))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("Added", ChangeKind::FieldAdded),
                ("Gone", ChangeKind::FieldRemoved),
                ("Name", ChangeKind::FieldChanged),
            ]
        );
        assert_eq!(changes[2].old_value, Some(json!("a")));
        assert_eq!(changes[2].new_value, Some(json!("b")));
        assert!(is_dirty(&a, &b));
    }

    #[test]
    fn test_metadata_change_is_reported() {
        let a = doc(json!({"Name": "a", "@metadata": {"Tag": 1}}));
        let b = doc(json!({"Name": "a", "@metadata": {"Tag": 2}}));
        let changes = diff(&a, &b);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change, ChangeKind::MetadataChanged);
    }
}
