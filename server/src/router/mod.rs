//! The subscription router (spec.md §4.6): fans a document out to every
//! connection following the anchor it belongs to, plus the per-user group
//! and the system-wide administrative channel. Implemented directly over
//! the coordination store's pub/sub, since both are the same "coordination
//! store" component in spec.md §2's component table — there's no separate
//! group-messaging layer to route through.

use crate::coordination::CoordinationClient;
use crate::error::Result;
use sync_core::{AnchorId, ChannelName, FlatDocument};

/// The administrative channel every connection's system-wide listener is
/// implicitly a member of, regardless of which anchors it follows.
pub const SYSTEM_CHANNEL: &str = "__system__";

pub struct SubscriptionRouter {
    coordination: CoordinationClient,
}

impl SubscriptionRouter {
    pub fn new(coordination: CoordinationClient) -> Self {
        Self { coordination }
    }

    /// The anchor-wide group every connection following this anchor joins.
    pub fn anchor_group(channel: &ChannelName, anchor: &AnchorId) -> String {
        format!("{channel}_{anchor}")
    }

    /// The narrower, per-user group used for documents only one user's
    /// connections should receive (e.g. a private unread-count update).
    pub fn user_group(channel: &ChannelName, anchor: &AnchorId, user: &str) -> String {
        format!("{channel}_{anchor}_{user}")
    }

    /// Re-encode a document through the canonical flat-document encoder and
    /// publish it to every member of the anchor's group (and, when the
    /// document carries a `_user_key`, the narrower per-user group too).
    pub async fn broadcast(&self, channel: &ChannelName, document: &FlatDocument) -> Result<()> {
        let Some(anchor_id) = document.anchor_id().map(str::to_string) else {
            return Ok(());
        };

        let canonical = serde_json::to_string(document)
            .map_err(|e| crate::error::AppError::InternalInvariant(format!("document not encodable: {e}")))?;

        // A document with `_user_key` goes only to that user's private
        // group; one without goes to every subscriber of the anchor. Never
        // both — the whole point of `_user_key` is to keep the document out
        // of the broadly-shared group.
        let group = match document.user_key() {
            Some(user) => Self::user_group(channel, &anchor_id, user),
            None => Self::anchor_group(channel, &anchor_id),
        };
        self.coordination.publish(&group, &canonical).await?;

        Ok(())
    }

    /// Publish a named group event (spec.md §4.7's "Server -> client other":
    /// `{runtimeVar}` / `{prependAnchor}`) into an anchor's group alongside
    /// its ordinary document deltas. Carried as `{event, payload}` so the
    /// per-connection receive loop can tell it apart from a `FlatDocument`
    /// and dispatch it through the channel's `group_events` handler table
    /// instead of forwarding it as-is.
    pub async fn broadcast_group_event(
        &self,
        channel: &ChannelName,
        anchor: &AnchorId,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        let envelope = serde_json::json!({ "event": event, "payload": payload });
        let encoded = serde_json::to_string(&envelope)
            .map_err(|e| crate::error::AppError::InternalInvariant(format!("group event not encodable: {e}")))?;
        self.coordination.publish(&Self::anchor_group(channel, anchor), &encoded).await
    }

    /// Publish an administrative message (anchor-list add/remove, server
    /// status) to every connection, regardless of which anchors it follows.
    pub async fn send_system_message(&self, payload: &serde_json::Value) -> Result<()> {
        let encoded = serde_json::to_string(payload)
            .map_err(|e| crate::error::AppError::InternalInvariant(format!("system message not encodable: {e}")))?;
        self.coordination.publish(SYSTEM_CHANNEL, &encoded).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_keys_match_the_documented_scheme() {
        let channel = "rooms".to_string();
        let anchor = "room-1".to_string();
        assert_eq!(
            SubscriptionRouter::anchor_group(&channel, &anchor),
            "rooms_room-1"
        );
        assert_eq!(
            SubscriptionRouter::user_group(&channel, &anchor, "user-9"),
            "rooms_room-1_user-9"
        );
    }

    #[test]
    fn user_scoped_document_picks_the_private_group_exclusively() {
        use sync_core::{FlatDocument, Operation, Tstamp};

        let mut doc = FlatDocument::new("Message", "room-1", "7", Tstamp::new(1, 0), Operation::Create);
        doc.set("_user_key", serde_json::Value::String("user-9".into()));

        let target = match doc.user_key() {
            Some(user) => SubscriptionRouter::user_group("rooms", "room-1", user),
            None => SubscriptionRouter::anchor_group("rooms", "room-1"),
        };
        assert_eq!(target, "rooms_room-1_user-9");
    }
}
