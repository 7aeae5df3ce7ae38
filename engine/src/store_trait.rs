//! The authoritative-store boundary.
//!
//! The snapshot loader needs to walk the declared graph starting from an
//! anchor's root object. What backs that lookup (a relational database, an
//! in-memory fixture for tests, anything else) is out of scope for this
//! system; this trait is the entire surface the core consumes.

use crate::graph::GraphEdge;
use crate::AnchorId;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;

/// An error from the authoritative store. Deliberately opaque — the core
/// only needs to know a lookup failed, not why.
#[derive(Debug, Clone)]
pub struct StoreError(pub String);

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "authoritative store error: {}", self.0)
    }
}

impl std::error::Error for StoreError {}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait AuthoritativeStore: Send + Sync {
    /// Fetch the anchor's own root object, or `None` if the anchor doesn't
    /// exist.
    async fn fetch_anchor(&self, anchor_id: &AnchorId) -> StoreResult<Option<Value>>;

    /// Fetch every child of `parent` that a graph edge declares, keyed by the
    /// edge's foreign key field.
    async fn fetch_children(&self, parent: &Value, edge: &GraphEdge) -> StoreResult<Vec<Value>>;
}
