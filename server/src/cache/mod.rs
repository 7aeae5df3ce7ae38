//! The persistent document cache (spec.md §4.2): the second tier behind the
//! in-memory instance list, durable across process restarts and what a HOT
//! anchor serves its initial snapshot from directly.

mod mongo;

pub use mongo::{DocumentCache, MongoDocumentCache, MAX_INLINE_DOCUMENT_BYTES};
