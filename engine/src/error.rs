//! Error types for the sync core.

use crate::{AnchorId, InstanceType};
use thiserror::Error;

/// All possible errors surfaced by the pure core.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("anchor not found: {0}")]
    AnchorNotFound(AnchorId),

    #[error("unknown instance type: {0}")]
    UnknownInstanceType(InstanceType),

    #[error("graph node '{0}' would introduce a cycle")]
    GraphCycle(InstanceType),

    #[error("document missing required field: {0}")]
    MissingField(&'static str),

    #[error("document field '{0}' has the wrong shape")]
    InvalidField(&'static str),

    #[error("document is not a JSON object")]
    NotAnObject,
}

/// Result type for sync-core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::AnchorNotFound("room-1".into());
        assert_eq!(err.to_string(), "anchor not found: room-1");

        let err = Error::UnknownInstanceType("Widget".into());
        assert_eq!(err.to_string(), "unknown instance type: Widget");
    }
}
