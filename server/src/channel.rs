//! A declared channel: one schema graph, one authoritative store, one
//! serializer set, one set of RPC action handlers. Channels are registered
//! once at startup (see [`crate::channel_registry`]) and read-only
//! thereafter.

use crate::coalescer::Transaction;
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use sync_core::{AuthoritativeStore, ChannelName, SchemaGraph, Serializer};

/// A client-invoked RPC action, dispatched by name from `{callId, action,
/// params}` frames (spec.md §4.7). Runs inside an enclosing transaction so
/// any authoritative-store mutation it makes can enqueue a broadcast via
/// `tx` (spec.md §4.5) rather than going through a separate signal path.
#[async_trait]
pub trait Action: Send + Sync {
    async fn call(&self, tx: &Transaction<'_>, anchor_id: &str, user: &str, params: Value) -> Result<Value>;
}

/// An event pushed by a group delivery that the connection handler doesn't
/// know how to interpret generically — e.g. `instances.list.add`, which
/// becomes a `{prependAnchor}` frame (spec.md §4.7's "Server -> client
/// other" frames).
#[async_trait]
pub trait GroupEventHandler: Send + Sync {
    async fn handle(&self, anchor_id: &str, payload: Value) -> Result<Option<Value>>;
}

/// Per-channel authorization check, run once per anchor a connection wants
/// to follow (`has_permission(user, **kwargs)` upstream). A channel with no
/// access control of its own should return `Ok(true)` unconditionally.
#[async_trait]
pub trait AnchorAuthorizer: Send + Sync {
    async fn authorize(&self, user: &str, anchor_id: &str) -> Result<bool>;
}

/// Grants every authenticated user access to every anchor. The right
/// default for a channel that doesn't restrict anchor visibility.
pub struct AllowAll;

#[async_trait]
impl AnchorAuthorizer for AllowAll {
    async fn authorize(&self, _user: &str, _anchor_id: &str) -> Result<bool> {
        Ok(true)
    }
}

pub struct Channel {
    pub name: ChannelName,
    pub graph: SchemaGraph,
    pub store: Arc<dyn AuthoritativeStore>,
    pub serializers: HashMap<String, Arc<dyn Serializer>>,
    pub actions: HashMap<String, Arc<dyn Action>>,
    pub group_events: HashMap<String, Arc<dyn GroupEventHandler>>,
    pub authorizer: Arc<dyn AnchorAuthorizer>,
}

impl Channel {
    pub fn serializer_for(&self, instance_type: &str) -> Option<&Arc<dyn Serializer>> {
        self.serializers.get(instance_type)
    }

    pub fn action(&self, name: &str) -> Option<&Arc<dyn Action>> {
        self.actions.get(name)
    }

    pub fn group_event(&self, name: &str) -> Option<&Arc<dyn GroupEventHandler>> {
        self.group_events.get(name)
    }
}
