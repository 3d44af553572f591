//! # para-octree
//!
//! para-octree is a distributed parallel **linear octree** (2D quadtree /
//! 3D octree) over the unit cube, designed for adaptive mesh refinement in
//! scientific computing codes. Space is partitioned into axis-aligned cubic
//! cells ("octants") stored as a globally Morton-sorted sequence; non-leaf
//! octants are never stored.
//!
//! ## Features
//! - Per-octant adaptive refinement and coarsening driven by signed markers,
//!   with a strict 2:1 size-balance invariant across faces (optionally edges
//!   and nodes)
//! - Distribution of octants across processes with one contiguous Morton
//!   range per rank, plus uniform, weighted and family-compact load
//!   balancing
//! - A multi-layer ghost halo mirroring remote octants within a
//!   configurable number of neighborhood rings, built by an accretion
//!   algorithm that grows source sets across process boundaries
//! - Pluggable communication backends (serial, threaded mailbox, MPI) for
//!   all collective and point-to-point exchanges
//! - A versioned binary dump/restore of the full distributed state
//!
//! ## Usage
//! Add `para-octree` as a dependency and enable features as needed:
//!
//! ```toml
//! [dependencies]
//! para-octree = "0.1"
//! # Optional features:
//! # features = ["mpi-support", "rayon"]
//! ```
//!
//! A tree starts serial (every rank holds the root) and is adapted with
//! markers; the first `load_balance` call distributes it:
//!
//! ```
//! use para_octree::{NoComm, ParaTree};
//!
//! let mut tree = ParaTree::new(2, NoComm).unwrap();
//! tree.adapt_global_refine(false).unwrap();
//! for idx in 0..tree.get_num_octants() {
//!     let center = tree.get_center(idx);
//!     if center[0] < 0.5 {
//!         tree.set_marker(idx, 1).unwrap();
//!     }
//! }
//! tree.adapt(false).unwrap();
//! assert!(tree.check_21_balance());
//! ```
//!
//! Local octant indices are only stable between mutations: any adapt or
//! load balance may move them, signalled by the tree's `status` counter.
//! External data keyed by local index should be realigned through
//! [`ParaTree::get_mapping`] or carried along a load balance with the
//! [`LoadBalanceData`](crate::algs::LoadBalanceData) callbacks.

pub mod algs;
pub mod comm;
pub mod error;
pub mod geometry;
pub mod para_tree;
pub mod tree;

pub use crate::algs::{LoadBalanceData, LoadBalanceRanges};
pub use crate::comm::{CommTag, Communicator, NoComm, RayonComm, Wait};
pub use crate::error::OctreeError;
pub use crate::geometry::{CoordinateMapper, UnitCube};
pub use crate::para_tree::{Operation, ParaTree, NO_OWNER};
pub use crate::tree::{EntityKind, Intersection, Octant, TreeHandle, MAX_LENGTH, MAX_LEVEL};

#[cfg(feature = "mpi-support")]
pub use crate::comm::MpiComm;
