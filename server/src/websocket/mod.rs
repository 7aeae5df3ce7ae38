//! WebSocket transport: the wire protocol (spec.md §4.7) and the
//! process-local connection registry that fans coordination-store group
//! messages out to sockets.

mod manager;
mod protocol;

pub use manager::{ConnectionManager, MessageSender};
pub use protocol::*;
