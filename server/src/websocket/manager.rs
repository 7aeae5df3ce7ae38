//! WebSocket connection manager.
//!
//! Each connection owns its own coordination-store subscriptions (see
//! [`crate::handlers::connection`]); this manager just tracks, per process,
//! which connections exist and which anchors they're following, so a
//! process-local event — a group-event handler's `{prependAnchor}`, an
//! administrative system message triggered in-process — can be routed to
//! the right sockets without round-tripping through the coordination store.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use sync_core::{AnchorId, ChannelName};
use tokio::sync::mpsc;

/// Sender for frames destined for a single connection's socket.
pub type MessageSender = mpsc::UnboundedSender<Value>;

#[derive(Debug)]
pub struct Connection {
    pub id: String,
    pub user: Option<String>,
    pub sender: MessageSender,
}

/// Manages active connections and their anchor memberships. Thread-safe,
/// shared across handlers via `Arc`.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    connections: DashMap<String, Connection>,
    anchor_members: DashMap<(ChannelName, AnchorId), HashSet<String>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            anchor_members: DashMap::new(),
        }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new connection, returning its id.
    pub fn register(&self, user: Option<String>, sender: MessageSender) -> String {
        let conn_id = uuid::Uuid::new_v4().to_string();
        self.connections.insert(
            conn_id.clone(),
            Connection {
                id: conn_id.clone(),
                user,
                sender,
            },
        );
        tracing::info!(conn_id = %conn_id, "connection registered");
        conn_id
    }

    /// Drop a connection and remove it from every anchor it was following.
    pub fn unregister(&self, conn_id: &str) {
        if self.connections.remove(conn_id).is_none() {
            return;
        }
        self.anchor_members.retain(|_, members| {
            members.remove(conn_id);
            !members.is_empty()
        });
        tracing::info!(conn_id = %conn_id, "connection unregistered");
    }

    pub fn join_anchor(&self, conn_id: &str, channel: &ChannelName, anchor_id: &AnchorId) {
        self.anchor_members
            .entry((channel.clone(), anchor_id.clone()))
            .or_default()
            .insert(conn_id.to_string());
    }

    pub fn leave_anchor(&self, conn_id: &str, channel: &ChannelName, anchor_id: &AnchorId) {
        let key = (channel.clone(), anchor_id.clone());
        if let Some(mut members) = self.anchor_members.get_mut(&key) {
            members.remove(conn_id);
            let empty = members.is_empty();
            drop(members);
            if empty {
                self.anchor_members.remove(&key);
            }
        }
    }

    /// Whether any local connection is still following this anchor — lets
    /// the connection handler drop the process's single coordination-store
    /// subscription once nobody local needs it anymore.
    pub fn has_members(&self, channel: &ChannelName, anchor_id: &AnchorId) -> bool {
        self.anchor_members
            .get(&(channel.clone(), anchor_id.clone()))
            .map(|m| !m.is_empty())
            .unwrap_or(false)
    }

    /// Fan a decoded group message out to every local connection following
    /// this anchor. Returns the number of connections it reached.
    pub fn deliver_to_anchor(&self, channel: &ChannelName, anchor_id: &AnchorId, payload: Value) -> usize {
        let Some(members) = self.anchor_members.get(&(channel.clone(), anchor_id.clone())) else {
            return 0;
        };
        let mut sent = 0;
        for conn_id in members.iter() {
            if let Some(conn) = self.connections.get(conn_id) {
                if conn.sender.send(payload.clone()).is_ok() {
                    sent += 1;
                }
            }
        }
        sent
    }

    /// Broadcast an administrative message to every connection, regardless
    /// of anchor membership.
    pub fn deliver_to_all(&self, payload: Value) -> usize {
        let mut sent = 0;
        for entry in self.connections.iter() {
            if entry.value().sender.send(payload.clone()).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    pub fn send_to(&self, conn_id: &str, payload: Value) -> bool {
        self.connections
            .get(conn_id)
            .map(|conn| conn.sender.send(payload).is_ok())
            .unwrap_or(false)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn register_and_unregister_clears_memberships() {
        let manager = ConnectionManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let channel = "rooms".to_string();
        let anchor = "room-1".to_string();

        let conn_id = manager.register(Some("u1".into()), tx);
        manager.join_anchor(&conn_id, &channel, &anchor);
        assert!(manager.has_members(&channel, &anchor));

        manager.unregister(&conn_id);
        assert!(!manager.has_members(&channel, &anchor));
        assert_eq!(manager.connection_count(), 0);
    }

    #[test]
    fn deliver_to_anchor_reaches_only_members() {
        let manager = ConnectionManager::new();
        let channel = "rooms".to_string();
        let anchor = "room-1".to_string();

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let conn1 = manager.register(None, tx1);
        let _conn2 = manager.register(None, tx2);
        manager.join_anchor(&conn1, &channel, &anchor);

        let sent = manager.deliver_to_anchor(&channel, &anchor, json!({"id": 1}));
        assert_eq!(sent, 1);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }
}
