//! OctreeError: unified error type for the para-octree public APIs.
//!
//! Programmer errors (invalid state or parameter) surface as dedicated
//! variants; communication failures are wrapped verbatim. The tree never
//! recovers locally, every error is propagated to the caller.

use thiserror::Error;

/// Unified error type for octree operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OctreeError {
    /// The tree only supports two- and three-dimensional domains.
    #[error("invalid dimension {0} (expected 2 or 3)")]
    InvalidDimension(u8),
    /// A level outside `[0, MAX_LEVEL]` was requested.
    #[error("invalid level {0} (maximum is {1})")]
    InvalidLevel(u8, u8),
    /// The tree is in the pre-adapt state; markers and balance options are
    /// frozen until `adapt` completes.
    #[error("cannot update tree until adaption is completed")]
    AdaptionPending,
    /// Requested number of ghost layers is outside the supported range.
    #[error("invalid number of ghost layers {0} (supported range is 1..={1})")]
    InvalidGhostLayers(usize, usize),
    /// An invalid 2:1 balance codimension was requested.
    #[error("invalid balance codimension {0} for dimension {1}")]
    InvalidBalanceCodim(u8, u8),
    /// The dump stream carries an unsupported format version.
    #[error("dump version {found} does not match the supported version {expected}")]
    DumpVersionMismatch {
        /// Version supported by this build.
        expected: i32,
        /// Version found in the stream.
        found: i32,
    },
    /// The dump was taken on a different number of processes.
    #[error("the restore was saved with {saved} processes but {current} are running")]
    ProcessCountMismatch {
        /// Process count recorded in the dump.
        saved: usize,
        /// Process count of the current communicator.
        current: usize,
    },
    /// Mapping information was requested but the last operation did not
    /// record any.
    #[error("no mapping is available for the last operation")]
    MappingUnavailable,
    /// A local octant index is out of range.
    #[error("octant index {0} is out of range")]
    InvalidOctantIndex(u32),
    /// A point-to-point or collective exchange failed.
    #[error("communication failure: {0}")]
    CommFailure(String),
    /// An I/O error while dumping or restoring the tree.
    #[error("i/o failure: {0}")]
    Io(String),
}

impl From<std::io::Error> for OctreeError {
    fn from(err: std::io::Error) -> Self {
        OctreeError::Io(err.to_string())
    }
}
