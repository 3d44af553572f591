//! Core octree data model: Morton codec, per-dimension constants, the
//! octant value type, the process-local tree and the replicated partition
//! table.

pub mod constants;
pub mod local;
pub mod morton;
pub mod octant;
pub mod partition;

pub use constants::{TreeConstants, INFO_ITEM_COUNT, MAX_LENGTH, MAX_LEVEL};
pub use local::{EntityKind, Intersection, LocalTree, TreeHandle};
pub use octant::{Octant, OctantWire};
pub use partition::PartitionTable;
