//! Coordination store key naming.
//!
//! Every key for a given anchor is derived from `{channel}:{anchor_id}:` so
//! the expiry sweeper can enumerate every anchor of a channel with a single
//! `SCAN` over `{channel}:*:state`.

use sync_core::{AnchorId, ChannelName};

/// The full set of coordination keys maintained per anchor.
#[derive(Debug, Clone)]
pub struct AnchorKeys {
    prefix: String,
}

impl AnchorKeys {
    pub fn new(channel: &ChannelName, anchor_id: &AnchorId) -> Self {
        Self {
            prefix: format!("{channel}:{anchor_id}"),
        }
    }

    /// The anchor's current `CacheState`, stored as an integer code.
    pub fn state(&self) -> String {
        format!("{}:state", self.prefix)
    }

    /// Last time the anchor was touched by a session, as a coordination
    /// store timestamp. Read by the expiry sweeper to decide staleness.
    pub fn access_time(&self) -> String {
        format!("{}:access_time", self.prefix)
    }

    /// The ordered list of flat documents written while the anchor was
    /// building or live. Followers that join during HEATING catch up by
    /// reading this list from where they left off.
    pub fn instances(&self) -> String {
        format!("{}:instances", self.prefix)
    }

    /// Active reader (session) count.
    pub fn readers(&self) -> String {
        format!("{}:readers", self.prefix)
    }

    /// Pub/sub channel announcing new entries on `instances()`.
    pub fn instances_trigger(&self) -> String {
        format!("{}:instances_trigger", self.prefix)
    }

    /// Count of in-flight builder sessions (used to decide HEATING -> HOT).
    pub fn sessions(&self) -> String {
        format!("{}:sessions", self.prefix)
    }

    /// Timestamp of the last time every reader disconnected, used by
    /// `start_cooling_if_stale`.
    pub fn last_disconnect(&self) -> String {
        format!("{}:last_disconnect", self.prefix)
    }

    /// The glob the expiry sweeper scans to enumerate every anchor of a
    /// channel.
    pub fn scan_pattern(channel: &ChannelName) -> String {
        format!("{channel}:*:state")
    }

    /// Extract the anchor id back out of a key matched by `scan_pattern`.
    pub fn anchor_id_from_state_key(channel: &ChannelName, key: &str) -> Option<AnchorId> {
        let prefix = format!("{channel}:");
        let rest = key.strip_prefix(&prefix)?;
        rest.strip_suffix(":state").map(|s| s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_share_a_common_prefix() {
        let keys = AnchorKeys::new(&"rooms".to_string(), &"room-1".to_string());
        assert_eq!(keys.state(), "rooms:room-1:state");
        assert_eq!(keys.instances(), "rooms:room-1:instances");
    }

    #[test]
    fn anchor_id_recovered_from_scanned_state_key() {
        let channel = "rooms".to_string();
        let key = "rooms:room-42:state";
        assert_eq!(
            AnchorKeys::anchor_id_from_state_key(&channel, key),
            Some("room-42".to_string())
        );
    }
}
