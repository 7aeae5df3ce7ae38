//! Anchor identity and the cache-state vocabulary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The id of the root object a client subscribes to within a channel.
pub type AnchorId = String;

/// The name of a declared channel (one schema graph, one set of coordination
/// keys, one document-cache collection).
pub type ChannelName = String;

/// The `_instance_type` discriminator carried on every flat document.
pub type InstanceType = String;

/// The four states an anchor's cache can be in. See the state machine design
/// in the coordination store client for the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
    Cold,
    Heating,
    Hot,
    Cooling,
}

impl CacheState {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(CacheState::Cold),
            1 => Some(CacheState::Heating),
            2 => Some(CacheState::Hot),
            3 => Some(CacheState::Cooling),
            _ => None,
        }
    }

    pub fn as_code(&self) -> i64 {
        match self {
            CacheState::Cold => 0,
            CacheState::Heating => 1,
            CacheState::Hot => 2,
            CacheState::Cooling => 3,
        }
    }
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CacheState::Cold => "cold",
            CacheState::Heating => "heating",
            CacheState::Hot => "hot",
            CacheState::Cooling => "cooling",
        };
        write!(f, "{s}")
    }
}

/// A fully-qualified anchor: which channel it lives in plus its id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Anchor {
    pub channel: ChannelName,
    pub id: AnchorId,
}

impl Anchor {
    pub fn new(channel: impl Into<ChannelName>, id: impl Into<AnchorId>) -> Self {
        Self {
            channel: channel.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_state_roundtrips_through_code() {
        for state in [
            CacheState::Cold,
            CacheState::Heating,
            CacheState::Hot,
            CacheState::Cooling,
        ] {
            assert_eq!(CacheState::from_code(state.as_code()), Some(state));
        }
    }

    #[test]
    fn unknown_code_is_none() {
        assert_eq!(CacheState::from_code(42), None);
    }

    #[test]
    fn anchor_display() {
        let anchor = Anchor::new("rooms", "room-1");
        assert_eq!(anchor.to_string(), "rooms:room-1");
    }
}
