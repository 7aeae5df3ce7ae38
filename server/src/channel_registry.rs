//! The set of declared channels, populated once at startup and read-only
//! afterward (spec.md §9 Design Notes). No macro-driven auto-registration —
//! channels are registered explicitly in `main.rs`.

use crate::channel::Channel;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};
use sync_core::ChannelName;

static REGISTRY: OnceLock<RwLock<HashMap<ChannelName, Arc<Channel>>>> = OnceLock::new();

pub struct ChannelRegistry;

impl ChannelRegistry {
    fn map() -> &'static RwLock<HashMap<ChannelName, Arc<Channel>>> {
        REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
    }

    pub fn register(channel: Channel) {
        let name = channel.name.clone();
        Self::map()
            .write()
            .expect("channel registry lock poisoned")
            .insert(name, Arc::new(channel));
    }

    pub fn get(name: &str) -> Option<Arc<Channel>> {
        Self::map()
            .read()
            .expect("channel registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn names() -> Vec<ChannelName> {
        Self::map()
            .read()
            .expect("channel registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}
