use thiserror::Error;

use crate::path::MAX_DEPTH;

/// Errors produced by the spatial layer.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SpatialError {
    /// Attaching below `MAX_DEPTH` levels is rejected before any mutation.
    #[error("partition depth limit of {MAX_DEPTH} exceeded")]
    DepthExceeded,

    /// The target child slot already holds a node.
    #[error("quadrant {0:?} of the target node is already occupied")]
    SlotOccupied(crate::quad::Quadrant),

    /// A packed path byte decoded to fewer quadrants than its declared length.
    #[error("packed path declares {expected} quadrants but carries {actual} bytes")]
    TruncatedPath { expected: usize, actual: usize },

    /// A `NodeId` that is not (or no longer) present in the arena.
    #[error("node id {0:?} is not present in the tree")]
    UnknownNode(crate::tree::NodeId),

    /// The tree already has a root.
    #[error("the tree already has a root node")]
    RootOccupied,

    /// The operation needs a root and the tree is empty.
    #[error("operation requires a non-empty tree")]
    EmptyTree,
}
