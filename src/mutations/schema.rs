//! Registry of set-valued fields and their mutation strategy.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::set_field::SetField;

/// Declared set-valued fields, keyed by collection and field name.
///
/// Serializes as a plain list of [`SetField`] declarations.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<SetField>", into = "Vec<SetField>")]
pub struct FieldSchema {
    fields: HashMap<(String, String), SetField>,
}

impl FieldSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Field set of the social platform: memberships, likes and bookmarks
    /// are atomic arrays; message reactions map an emoji to its reactors.
    /// Pod membership keeps `memberCount` in step.
    pub fn social() -> Self {
        let mut schema = Self::new();
        schema
            .declare(
                SetField::atomic("pods", "members")
                    .touching("updatedAt")
                    .counted_by("memberCount"),
            )
            .declare(SetField::atomic("chatRooms", "members").touching("lastActivity"))
            .declare(SetField::atomic("podPosts", "likes").touching("updatedAt"))
            .declare(SetField::atomic("podPosts", "bookmarks"))
            .declare(SetField::atomic("startups", "bookmarks"))
            .declare(SetField::atomic("projects", "bookmarks"))
            .declare(SetField::composite("chatMessages", "reactions"));
        schema
    }

    /// Add or replace a declaration.
    pub fn declare(&mut self, field: SetField) -> &mut Self {
        self.fields
            .insert((field.collection.clone(), field.field.clone()), field);
        self
    }

    pub fn get(&self, collection: &str, field: &str) -> Option<&SetField> {
        self.fields.get(&(collection.to_string(), field.to_string()))
    }

    /// Declaration for a field, or `InvalidArgument` if undeclared.
    pub fn lookup(&self, collection: &str, field: &str) -> Result<&SetField> {
        self.get(collection, field).ok_or_else(|| {
            SyncError::InvalidArgument(format!(
                "field '{}.{}' is not a declared set field",
                collection, field
            ))
        })
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl From<Vec<SetField>> for FieldSchema {
    fn from(fields: Vec<SetField>) -> Self {
        let mut schema = Self::new();
        for field in fields {
            schema.declare(field);
        }
        schema
    }
}

impl From<FieldSchema> for Vec<SetField> {
    fn from(schema: FieldSchema) -> Self {
        let mut fields: Vec<SetField> = schema.fields.into_values().collect();
        fields.sort_by(|a, b| (&a.collection, &a.field).cmp(&(&b.collection, &b.field)));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutations::FieldKind;

    #[test]
    fn test_social_schema_kinds() {
        let schema = FieldSchema::social();
        assert_eq!(schema.len(), 7);
        assert_eq!(schema.lookup("pods", "members").unwrap().kind, FieldKind::Atomic);
        assert_eq!(
            schema.lookup("pods", "members").unwrap().counter.as_deref(),
            Some("memberCount")
        );
        assert_eq!(
            schema.lookup("chatRooms", "members").unwrap().touch.as_deref(),
            Some("lastActivity")
        );
        assert_eq!(
            schema.lookup("chatMessages", "reactions").unwrap().kind,
            FieldKind::Composite
        );
    }

    #[test]
    fn test_undeclared_field_is_invalid_argument() {
        let err = FieldSchema::social().lookup("pods", "owners").unwrap_err();
        assert!(matches!(err, SyncError::InvalidArgument(_)));
    }

    #[test]
    fn test_loads_from_json_list() {
        let schema: FieldSchema = serde_json::from_str(
            r#"[{"collection": "teams", "field": "members", "kind": "atomic", "touch": "updatedAt"},
                {"collection": "posts", "field": "votes", "kind": "composite"}]"#,
        )
        .unwrap();
        assert_eq!(schema.len(), 2);
        assert_eq!(schema.lookup("posts", "votes").unwrap().touch, None);
    }
}
