//! # Starweave Spatial
//!
//! Spatial foundation for the Starweave arena: axis-aligned square regions
//! ([`Quad`]), quadrant path encoding ([`NodePath`]), the arena-backed
//! partition tree ([`PartitionTree`]) that both the arbiter and the compute
//! nodes build their world view on, and the pure combat geometry used by the
//! scan/shoot pipeline.
//!
//! Everything in this crate is synchronous and allocation-light; the async
//! layers live in `starweave_bus` and the binaries.

pub mod geom;
pub mod path;
pub mod quad;
pub mod tree;

mod error;

pub use error::SpatialError;
pub use geom::Vec2;
pub use path::{NodePath, MAX_DEPTH};
pub use quad::{Quad, Quadrant};
pub use tree::{NodeId, PartitionTree, TreeNode};
