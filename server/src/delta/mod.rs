//! Delta computation: the algorithm that turns "a fresh copy of this object"
//! into "the smallest thing a client needs to stay in sync" (spec.md §4.3).

mod writer;

pub use writer::DeltaWriter;
