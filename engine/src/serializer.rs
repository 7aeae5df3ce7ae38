//! The serializer boundary.
//!
//! Turning an authoritative-store object into a flat document is, from the
//! core's point of view, a pure function: same object, same timestamp, same
//! document. What actually implements it (reading ORM fields, computing
//! derived columns) is entirely outside this crate's concern — the core only
//! needs the contract below.

use crate::document::{FlatDocument, Operation};
use crate::error::Result;
use crate::{AnchorId, InstanceType, Tstamp};
use serde_json::Value;

/// Converts authoritative objects of a single instance type into flat
/// documents, and reports which anchor(s) a document belongs to.
pub trait Serializer: Send + Sync {
    /// The instance type this serializer handles.
    fn instance_type(&self) -> InstanceType;

    /// Serialize `object` (an opaque JSON projection of the authoritative
    /// record) as it stands at `tstamp`.
    fn serialize(&self, object: &Value, tstamp: Tstamp, operation: Operation)
        -> Result<FlatDocument>;

    /// Build the delete pre-image: the minimal document a client needs to
    /// remove the object from its local state. Must be computed before the
    /// authoritative record is actually deleted, since by commit time it may
    /// no longer exist to read from.
    fn serialize_delete(&self, object: &Value, tstamp: Tstamp) -> Result<FlatDocument> {
        self.serialize(object, tstamp, Operation::Delete)
    }

    /// Every anchor id this document should be broadcast under. A document
    /// can belong to more than one anchor (e.g. a shared participant record
    /// visible under several rooms).
    fn anchors_for(&self, object: &Value) -> Vec<AnchorId>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct RoomSerializer;

    impl Serializer for RoomSerializer {
        fn instance_type(&self) -> InstanceType {
            "Room".into()
        }

        fn serialize(
            &self,
            object: &Value,
            tstamp: Tstamp,
            operation: Operation,
        ) -> Result<FlatDocument> {
            let id = object["id"].as_str().unwrap_or_default();
            let mut doc = FlatDocument::new("Room", id, id, tstamp, operation);
            doc.set("name", object["name"].clone());
            Ok(doc)
        }

        fn anchors_for(&self, object: &Value) -> Vec<AnchorId> {
            vec![object["id"].as_str().unwrap_or_default().to_string()]
        }
    }

    #[test]
    fn serializes_into_flat_document() {
        let serializer = RoomSerializer;
        let object = json!({"id": "room-1", "name": "lobby"});
        let doc = serializer
            .serialize(&object, Tstamp::new(1, 0), Operation::Create)
            .unwrap();
        assert_eq!(doc.instance_type(), Some("Room"));
        assert_eq!(doc.get("name"), Some(&json!("lobby")));
        assert_eq!(serializer.anchors_for(&object), vec!["room-1".to_string()]);
    }
}
