//! # sync-core
//!
//! The pure, IO-free core of a real-time anchor state synchronization
//! engine. A client subscribes to an anchor; this crate models the data
//! shapes and algorithms involved in streaming it a snapshot of a declared
//! object graph and then every subsequent change, without knowing anything
//! about the coordination store, the document cache, or the transport that
//! actually move the bytes.
//!
//! ## Core concepts
//!
//! - [`Anchor`] / [`CacheState`] — the subscribable root and the four states
//!   its cache can be in (cold, heating, hot, cooling).
//! - [`FlatDocument`] — the single shape every object is reduced to before
//!   it is cached or sent over the wire: scalar fields plus reserved
//!   underscore-prefixed metadata.
//! - [`SchemaGraph`] / [`GraphNode`] — the declared tree of instance types a
//!   channel walks to build an anchor's initial state.
//! - [`minimal_delta`] — the diff between two versions of the same document,
//!   including the deliberate list-as-set comparison rule.
//! - [`Tstamp`] — a coordination-store-issued timestamp; never a local wall
//!   clock reading, so it orders consistently across processes.
//!
//! ## External interfaces
//!
//! [`Serializer`] and [`AuthoritativeStore`] are the two traits real
//! deployments implement against an actual data model; this crate only
//! depends on their contracts.

pub mod anchor;
pub mod delta;
pub mod document;
pub mod error;
pub mod graph;
pub mod serializer;
pub mod store_trait;
pub mod tstamp;

pub use anchor::{Anchor, AnchorId, CacheState, ChannelName, InstanceType};
pub use delta::minimal_delta;
pub use document::{FlatDocument, Operation};
pub use error::Error;
pub use graph::{GraphEdge, GraphNode, SchemaGraph};
pub use serializer::Serializer;
pub use store_trait::{AuthoritativeStore, StoreError, StoreResult};
pub use tstamp::{Tstamp, TstampWire};
