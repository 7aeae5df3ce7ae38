//! Per-connection protocol handlers: handshake authentication/authorization
//! (`auth.rs`) and the full per-connection state machine (`connection.rs`).

mod auth;
mod connection;

pub use auth::{authenticate, authorize, AuthUser};
pub use connection::upgrade;
