//! Message passing: the communicator trait, its backends, and the
//! collectives the octree is built on.

pub mod collectives;
pub mod communicator;

pub use collectives::{
    all_gather, all_gather_uniform, all_gather_varlen, all_reduce, all_reduce_max_i8,
    all_reduce_or, all_reduce_sum_u64, exchange_buffers,
};
pub use communicator::{CommTag, Communicator, ExchangeCommTags, NoComm, RayonComm, Wait};

#[cfg(feature = "mpi-support")]
pub use communicator::MpiComm;

/// Fixed tag bases for the octree's internal protocols.
///
/// Collectives issued on the same tag are matched by FIFO channel order, so
/// one base per protocol is enough; two-phase exchanges take two consecutive
/// tags.
pub mod tags {
    use super::CommTag;

    pub const REDUCE: CommTag = CommTag::new(0x0100);
    pub const PARTITION: CommTag = CommTag::new(0x0110);
    pub const DESCENDANTS: CommTag = CommTag::new(0x0120);
    pub const WEIGHTS: CommTag = CommTag::new(0x0130);
    pub const FAMILY: CommTag = CommTag::new(0x0140);
    pub const MARKERS: CommTag = CommTag::new(0x0150);
    pub const ACCRETION: CommTag = CommTag::new(0x0160);
    pub const GHOSTS: CommTag = CommTag::new(0x0170);
    pub const LOAD_BALANCE: CommTag = CommTag::new(0x0180);
    pub const LOAD_BALANCE_DATA: CommTag = CommTag::new(0x0190);
}
