//! The flat document: the single wire-and-cache shape every object in the
//! declared graph is reduced to before it leaves the serializer.
//!
//! A flat document is a JSON object whose reserved, underscore-prefixed keys
//! carry metadata (`_instance_type`, `_tstamp`, `_operation`, `_anchor_id`,
//! `_user_key`, `_deleted`, `_grid_ref`) and whose remaining keys are the
//! object's own scalar fields. Nested objects are never embedded; they are
//! represented as foreign-key scalars and shipped as their own documents.

use crate::error::{Error, Result};
use crate::{AnchorId, InstanceType, Tstamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What produced this document: the initial snapshot, or a live delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    InitialState,
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            Operation::InitialState => "initial_state",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

/// An object reduced to its flat, cacheable form.
///
/// Field order is not significant; equality and the delta algorithm both
/// operate on the key/value map, not on serialization order.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatDocument {
    fields: Map<String, Value>,
}

impl FlatDocument {
    pub fn new(
        instance_type: impl Into<InstanceType>,
        id: impl Into<String>,
        anchor_id: impl Into<AnchorId>,
        tstamp: Tstamp,
        operation: Operation,
    ) -> Self {
        let mut fields = Map::new();
        fields.insert("id".into(), Value::String(id.into()));
        fields.insert(
            "_instance_type".into(),
            Value::String(instance_type.into()),
        );
        fields.insert("_anchor_id".into(), Value::String(anchor_id.into()));
        fields.insert("_tstamp".into(), Value::from(tstamp.as_f64()));
        fields.insert(
            "_operation".into(),
            Value::String(operation.as_wire_str().into()),
        );
        Self { fields }
    }

    /// The sentinel frame that closes out the initial snapshot for a single
    /// anchor: `{_instance_type: "", _tstamp: T, _operation: "end_initial_state", id: 0}`.
    pub fn end_initial_state(tstamp: Tstamp) -> Self {
        let mut fields = Map::new();
        fields.insert("id".into(), Value::from(0));
        fields.insert("_instance_type".into(), Value::String(String::new()));
        fields.insert("_tstamp".into(), Value::from(tstamp.as_f64()));
        fields.insert(
            "_operation".into(),
            Value::String("end_initial_state".into()),
        );
        Self { fields }
    }

    pub fn from_object(object: Value) -> Result<Self> {
        match object {
            Value::Object(fields) => Ok(Self { fields }),
            _ => Err(Error::NotAnObject),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn id(&self) -> Option<&str> {
        self.fields.get("id").and_then(Value::as_str)
    }

    pub fn instance_type(&self) -> Option<&str> {
        self.fields.get("_instance_type").and_then(Value::as_str)
    }

    pub fn anchor_id(&self) -> Option<&str> {
        self.fields.get("_anchor_id").and_then(Value::as_str)
    }

    pub fn user_key(&self) -> Option<&str> {
        self.fields.get("_user_key").and_then(Value::as_str)
    }

    pub fn operation(&self) -> Option<&str> {
        self.fields.get("_operation").and_then(Value::as_str)
    }

    pub fn is_deleted(&self) -> bool {
        self.fields
            .get("_deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn grid_ref(&self) -> Option<&str> {
        self.fields.get("_grid_ref").and_then(Value::as_str)
    }

    /// Meta fields are never part of a delta; only user-defined fields are.
    pub fn is_meta_field(key: &str) -> bool {
        key.starts_with('_') || key == "id"
    }

    pub fn user_fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields
            .iter()
            .filter(|(k, _)| !Self::is_meta_field(k))
    }

    /// Drop every user field, keeping only `id` and the `_`-prefixed
    /// metadata. Used to turn a document into a GridFS pointer record that
    /// must not re-trip the size ceiling it was built to avoid.
    pub fn retain_meta_only(&mut self) {
        self.fields.retain(|k, _| Self::is_meta_field(k));
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub(crate) fn as_map_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.fields
    }
}

impl Serialize for FlatDocument {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.fields.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FlatDocument {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let fields = Map::deserialize(deserializer)?;
        Ok(Self { fields })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn end_initial_state_sentinel_shape() {
        let doc = FlatDocument::end_initial_state(Tstamp::new(10, 0));
        assert_eq!(doc.instance_type(), Some(""));
        assert_eq!(doc.operation(), Some("end_initial_state"));
        assert_eq!(doc.id(), None); // id is numeric 0, not a string
        assert_eq!(doc.get("id"), Some(&json!(0)));
    }

    #[test]
    fn meta_fields_excluded_from_user_fields() {
        let mut doc = FlatDocument::new(
            "Room",
            "room-1",
            "room-1",
            Tstamp::new(1, 0),
            Operation::Create,
        );
        doc.set("name", json!("lobby"));
        doc.set("capacity", json!(10));

        let user: Vec<_> = doc.user_fields().map(|(k, _)| k.clone()).collect();
        assert!(user.contains(&"name".to_string()));
        assert!(user.contains(&"capacity".to_string()));
        assert!(!user.iter().any(|k| k.starts_with('_')));
        assert!(!user.contains(&"id".to_string()));
    }

    #[test]
    fn retain_meta_only_drops_user_fields_but_keeps_meta() {
        let mut doc = FlatDocument::new("Room", "room-1", "room-1", Tstamp::new(1, 0), Operation::Create);
        doc.set("name", json!("lobby"));
        doc.set("_user_key", json!("alice"));

        doc.retain_meta_only();

        assert_eq!(doc.get("name"), None);
        assert_eq!(doc.instance_type(), Some("Room"));
        assert_eq!(doc.user_key(), Some("alice"));
        assert_eq!(doc.id(), Some("room-1"));
    }

    #[test]
    fn roundtrips_through_json() {
        let mut doc = FlatDocument::new(
            "Room",
            "room-1",
            "room-1",
            Tstamp::new(1, 500_000),
            Operation::Update,
        );
        doc.set("name", json!("lobby"));

        let json = serde_json::to_string(&doc).unwrap();
        let parsed: FlatDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(doc, parsed);
    }
}
