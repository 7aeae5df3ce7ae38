//! The coordination store: the Redis-compatible backend behind the anchor
//! cache state machine, the instance list followers catch up against, and
//! the subscription router's group pub/sub.

mod client;
mod keys;
mod state_machine;

pub use client::CoordinationClient;
pub use keys::AnchorKeys;
pub use state_machine::StateMachine;
