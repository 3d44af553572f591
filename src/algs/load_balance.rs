//! Partition computation and exchange-range arithmetic for load balancing.
//!
//! A target partition is an array of per-rank octant counts over the global
//! Morton order: uniform, weighted (equal weight per rank, walked over the
//! global prefix sum) or family-compact (the uniform/weighted split is
//! corrected so that sibling families at a chosen level never straddle a
//! process boundary). Send and receive ranges fall out of intersecting the
//! current partition with the target one in global index space.

use std::collections::BTreeMap;

use crate::comm::{all_gather_varlen, tags, Communicator, ExchangeCommTags};
use crate::tree::constants::MAX_LEVEL;
use crate::tree::local::LocalTree;
use crate::tree::partition::PartitionTable;

/// Half-open local-index ranges exchanged with other ranks during a load
/// balance, recorded for the embedding application.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadBalanceRanges {
    /// Whether the ranges were computed for the first (serial) distribution.
    pub serial: bool,
    /// rank -> `[begin, end)` local indices sent there.
    pub send: BTreeMap<usize, (u32, u32)>,
    /// rank -> `[begin, end)` local indices (after the balance) received
    /// from there.
    pub recv: BTreeMap<usize, (u32, u32)>,
}

impl LoadBalanceRanges {
    pub fn clear(&mut self) {
        self.serial = false;
        self.send.clear();
        self.recv.clear();
    }
}

/// User payload carried along a load balance.
///
/// The tree drives these callbacks around its own send/recv ranges:
/// `gather` serializes the payload of an octant about to leave, `scatter`
/// rebuilds it at the octant's new local index. Indices passed to `gather`
/// are pre-balance, indices passed to `scatter` post-balance.
pub trait LoadBalanceData {
    /// Serialize the payload of local octant `idx` onto `buf`.
    fn gather(&self, idx: u32, buf: &mut Vec<u8>);
    /// Restore the payload of local octant `idx` from `buf`.
    fn scatter(&mut self, idx: u32, buf: &[u8]);
}

/// No-payload marker for plain octant redistribution.
pub struct NoData;

impl LoadBalanceData for NoData {
    fn gather(&self, _idx: u32, _buf: &mut Vec<u8>) {}
    fn scatter(&mut self, _idx: u32, _buf: &[u8]) {}
}

/// Uniform target partition: `floor(N/P)` per rank, the first `N mod P`
/// ranks take one extra octant.
pub fn compute_partition_uniform(global_count: u64, nproc: usize) -> Vec<u32> {
    let division = (global_count / nproc as u64) as u32;
    let remainder = (global_count % nproc as u64) as u32;
    (0..nproc as u32)
        .map(|i| if i < remainder { division + 1 } else { division })
        .collect()
}

/// Weighted target partition: walk the global weighted prefix sum and hand
/// each rank the smallest contiguous run reaching the remaining average.
pub fn compute_partition_weighted<C: Communicator>(
    comm: &C,
    weights: &[f64],
    serial: bool,
    global_count: u64,
    nproc: usize,
) -> Vec<u32> {
    // If the tree is serial every rank already holds all octants, hence
    // local weights and global weights coincide.
    let global_weights: Vec<f64> = if serial || comm.size() == 1 {
        weights.to_vec()
    } else {
        all_gather_varlen(comm, ExchangeCommTags::from_base(tags::WEIGHTS), weights)
            .into_iter()
            .flatten()
            .collect()
    };
    debug_assert_eq!(global_weights.len() as u64, global_count);

    let mut partition = vec![0u32; nproc];
    let mut assigned = 0usize;
    for i in 0..nproc - 1 {
        let unassigned: f64 = global_weights[assigned..].iter().sum();
        let target = unassigned / (nproc - i) as f64;

        let mut part_weight = 0.0;
        while part_weight < target {
            part_weight += global_weights[assigned];
            partition[i] += 1;
            assigned += 1;
            if assigned == global_weights.len() {
                break;
            }
        }
        if assigned == global_weights.len() {
            break;
        }
    }
    partition[nproc - 1] = (global_count - assigned as u64) as u32;
    partition
}

/// Correct a target partition so families at the requested level stay
/// compact on one process.
///
/// `levels_above` counts levels above the deepest one in the tree; the
/// boundary octant of every new process interface is shifted forward or
/// backward to the nearest family-aligned split, whichever correction is
/// smaller. Corrections are computed by the current owner of each new
/// interface and shared with everyone.
pub fn apply_family_constraint<C: Communicator>(
    comm: &C,
    tree: &LocalTree,
    table: &PartitionTable,
    serial: bool,
    max_depth: i8,
    levels_above: u8,
    partition: &mut [u32],
) {
    let nproc = comm.size();
    let rank = comm.rank();
    if nproc == 1 {
        return;
    }

    let level = ((max_depth as i32 - levels_above as i32).max(1) as u8).min(MAX_LEVEL);
    let block = 1u32 << (MAX_LEVEL - level);
    let dim = tree.dim();

    let local_count = tree.num_octants() as u64;
    let my_offset = if serial {
        0
    } else {
        table.global_offset(rank)
    };
    let my_end = my_offset + if serial { local_count } else { table.count(rank) };

    // Offset of a coordinate triple within the family block at `level`.
    let block_rest = |idx: u32| -> u64 {
        let oct = tree.octant(idx);
        let mut rest = (oct.coords()[0] % block) as u64 + (oct.coords()[1] % block) as u64;
        if dim == 3 {
            rest += (oct.coords()[2] % block) as u64;
        }
        rest
    };

    // Corrections for the interfaces this rank currently owns, as
    // (interface, shift) pairs.
    let mut corrections: Vec<[i64; 2]> = Vec::new();
    let mut sum = 0u64;
    for interface in 0..nproc - 1 {
        sum += partition[interface] as u64;
        if sum < my_offset || sum >= my_end {
            continue;
        }

        // Local index of the first octant of the next partition; shift it to
        // the nearest family-aligned octant, preferring the smaller move.
        // A direction that never reaches an aligned octant inside the local
        // range is overdimensioned out of the comparison.
        let istart = (sum - my_offset) as u32;
        let nocts = tree.num_octants();

        let forward = (istart..nocts)
            .find(|&i| block_rest(i) == 0)
            .map_or(nocts as i64, |i| (i - istart) as i64);
        let backward = (0..=istart)
            .rev()
            .find(|&i| block_rest(i) == 0)
            .map_or(nocts as i64, |i| (istart - i) as i64);

        let shift = if forward < backward { forward } else { -backward };
        corrections.push([interface as i64, shift]);
    }

    // Everyone learns every correction; each interface has exactly one
    // current owner.
    let flat: Vec<i64> = corrections.iter().flat_map(|c| [c[0], c[1]]).collect();
    let gathered = all_gather_varlen(comm, ExchangeCommTags::from_base(tags::FAMILY), &flat);

    let mut shifts = vec![0i64; nproc - 1];
    for row in gathered {
        for pair in row.chunks_exact(2) {
            shifts[pair[0] as usize] = pair[1];
        }
    }

    // A shift extends the left partition (positive) or the right one
    // (negative); each rank gains its own shift and loses its
    // predecessor's. The sum over all ranks is untouched.
    for p in 0..nproc {
        let mut count = partition[p] as i64;
        if p < nproc - 1 {
            count += shifts[p];
        }
        if p > 0 {
            count -= shifts[p - 1];
        }
        debug_assert!(count >= 0, "family correction emptied partition {p}");
        partition[p] = count as u32;
    }
}

/// Intersections of `rank_a`'s range in partition schema `a` with every
/// range of schema `b`, in global indices.
pub fn eval_partition_intersections(
    a: &[u32],
    rank_a: usize,
    b: &[u32],
) -> BTreeMap<usize, (u64, u64)> {
    let mut intersections = BTreeMap::new();
    if a[rank_a] == 0 {
        return intersections;
    }

    let nproc = a.len();
    let mut offsets_a = vec![0u64; nproc + 1];
    let mut offsets_b = vec![0u64; nproc + 1];
    for i in 0..nproc {
        offsets_a[i + 1] = offsets_a[i] + a[i] as u64;
        offsets_b[i + 1] = offsets_b[i] + b[i] as u64;
    }

    let begin_a = offsets_a[rank_a];
    let end_a = offsets_a[rank_a + 1];

    for rank_b in 0..nproc {
        let begin_b = offsets_b[rank_b];
        let end_b = offsets_b[rank_b + 1];
        let lo = begin_a.max(begin_b);
        let hi = end_a.min(end_b);
        if lo < hi {
            intersections.insert(rank_b, (lo, hi));
        }
        if end_b >= end_a {
            break;
        }
    }
    intersections
}

/// Local-index ranges this rank sends to every other rank when moving from
/// `current` to `updated`.
pub fn eval_send_ranges(
    current: &[u32],
    updated: &[u32],
    rank: usize,
) -> BTreeMap<usize, (u32, u32)> {
    let offset: u64 = current[..rank].iter().map(|&c| c as u64).sum();
    eval_partition_intersections(current, rank, updated)
        .into_iter()
        .filter(|&(r, _)| r != rank)
        .map(|(r, (lo, hi))| (r, ((lo - offset) as u32, (hi - offset) as u32)))
        .collect()
}

/// Local-index ranges this rank receives from every other rank when moving
/// from `current` to `updated`; indices are post-balance.
pub fn eval_recv_ranges(
    current: &[u32],
    updated: &[u32],
    rank: usize,
) -> BTreeMap<usize, (u32, u32)> {
    let offset: u64 = updated[..rank].iter().map(|&c| c as u64).sum();
    eval_partition_intersections(updated, rank, current)
        .into_iter()
        .filter(|&(r, _)| r != rank)
        .map(|(r, (lo, hi))| (r, ((lo - offset) as u32, (hi - offset) as u32)))
        .collect()
}

/// The current partition expressed as per-rank counts. In the serial case
/// every rank reports itself as owning all octants at offset zero.
pub fn current_partition_counts(
    table: &PartitionTable,
    serial: bool,
    rank: usize,
    local_count: u32,
) -> Vec<u32> {
    let nproc = table.nproc();
    let mut counts = vec![0u32; nproc];
    if serial {
        counts[rank] = local_count;
    } else {
        for p in 0..nproc {
            counts[p] = table.count(p) as u32;
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::NoComm;

    #[test]
    fn uniform_partition_spreads_remainder() {
        assert_eq!(compute_partition_uniform(64, 2), vec![32, 32]);
        assert_eq!(compute_partition_uniform(64, 3), vec![22, 21, 21]);
        assert_eq!(compute_partition_uniform(2, 3), vec![1, 1, 0]);
    }

    #[test]
    fn weighted_partition_tracks_weight_not_count() {
        // Four octants, the first carries almost all weight.
        let weights = [10.0, 1.0, 1.0, 1.0];
        let partition = compute_partition_weighted(&NoComm, &weights, true, 4, 2);
        assert_eq!(partition.iter().sum::<u32>(), 4);
        assert_eq!(partition, vec![1, 3]);
    }

    #[test]
    fn intersections_split_by_schema() {
        // Current: rank 0 owns [0, 6), rank 1 owns [6, 8).
        // Updated: even split [0, 4), [4, 8).
        let current = [6, 2];
        let updated = [4, 4];
        let send0 = eval_send_ranges(&current, &updated, 0);
        assert_eq!(send0.len(), 1);
        assert_eq!(send0[&1], (4, 6));
        let recv1 = eval_recv_ranges(&current, &updated, 1);
        assert_eq!(recv1[&0], (0, 2));
        let send1 = eval_send_ranges(&current, &updated, 1);
        assert!(send1.is_empty());
    }

    #[test]
    fn serial_first_split_sends_slices_everywhere() {
        // Serial: every rank pretends to own all 8 octants.
        let updated = [4, 4];
        let current_r1 = [0, 8];
        let send = eval_send_ranges(&current_r1, &updated, 1);
        // Rank 1 keeps [4, 8) and "sends" [0, 4) to rank 0.
        assert_eq!(send[&0], (0, 4));
    }
}
