//! DOM exceptions surfaced synchronously to callers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomError {
    /// The requested tree mutation would break the tree shape
    /// (cycle, wrong node kind for the position, detached anchor).
    #[error("hierarchy request error: {0}")]
    HierarchyRequest(&'static str),

    /// The node belongs to a different document/tree.
    #[error("wrong document")]
    WrongDocument,

    /// The referenced node does not exist in this tree.
    #[error("node not found")]
    NotFound,

    /// A name contains characters invalid in this context.
    #[error("invalid character in {0:?}")]
    InvalidCharacter(String),

    /// The operation is not supported on this node kind.
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),
}
