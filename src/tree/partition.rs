//! Replicated partition table.
//!
//! Every rank holds, for every process `p`, the global index of `p`'s last
//! octant and the Morton keys of `p`'s first and last descendants. This is
//! enough to locate the owner of any global index or Morton key without
//! cross-process pointers.
//!
//! Empty partitions inherit descendants from their neighbors: the first
//! descendant propagates backwards from the next non-empty process, the last
//! descendant forwards from the previous one. Rank 0 is never empty.

/// Per-process partition ranges, replicated on every rank.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionTable {
    last_global_idx: Vec<u64>,
    first_desc: Vec<u64>,
    last_desc: Vec<u64>,
}

impl PartitionTable {
    /// Table for a serial tree: every rank holds all `count` octants.
    pub fn new_serial(nproc: usize, count: u64, first_desc: u64, last_desc: u64) -> Self {
        Self {
            last_global_idx: vec![count.wrapping_sub(1); nproc],
            first_desc: vec![first_desc; nproc],
            last_desc: vec![last_desc; nproc],
        }
    }

    /// Rebuild from raw replicated arrays (used by restore).
    pub fn from_raw(last_global_idx: Vec<u64>, first_desc: Vec<u64>, last_desc: Vec<u64>) -> Self {
        debug_assert_eq!(last_global_idx.len(), first_desc.len());
        debug_assert_eq!(last_global_idx.len(), last_desc.len());
        Self {
            last_global_idx,
            first_desc,
            last_desc,
        }
    }

    #[inline]
    pub fn nproc(&self) -> usize {
        self.last_global_idx.len()
    }

    #[inline]
    pub fn last_global_idx(&self) -> &[u64] {
        &self.last_global_idx
    }

    #[inline]
    pub fn first_desc(&self) -> &[u64] {
        &self.first_desc
    }

    #[inline]
    pub fn last_desc(&self) -> &[u64] {
        &self.last_desc
    }

    /// Global index of the first octant owned by `rank`.
    #[inline]
    pub fn global_offset(&self, rank: usize) -> u64 {
        if rank == 0 {
            0
        } else {
            self.last_global_idx[rank - 1].wrapping_add(1)
        }
    }

    /// Number of octants owned by `rank`.
    #[inline]
    pub fn count(&self, rank: usize) -> u64 {
        self.last_global_idx[rank]
            .wrapping_add(1)
            .saturating_sub(self.global_offset(rank))
    }

    /// Total number of octants across all ranks.
    #[inline]
    pub fn global_count(&self) -> u64 {
        self.last_global_idx[self.nproc() - 1].wrapping_add(1)
    }

    /// Find the rank owning the element with the given Morton key.
    ///
    /// Returns `None` if the key is past the last descendant of the last
    /// process.
    pub fn find_owner(&self, morton: u64) -> Option<usize> {
        let nproc = self.nproc();
        if morton > self.last_desc[nproc - 1] {
            return None;
        }
        let owner = self.last_desc.partition_point(|&desc| desc < morton);
        debug_assert!(owner < nproc);
        // An empty partition shares its predecessor's last descendant; the
        // partition point lands on the earliest entry, which is the rank
        // that actually owns octants.
        Some(owner)
    }

    /// Find the rank owning the given global index.
    ///
    /// Returns `None` if the index is past the end of the tree.
    pub fn owner_of_global(&self, global_idx: u64) -> Option<usize> {
        let nproc = self.nproc();
        if global_idx > self.last_global_idx[nproc - 1] {
            return None;
        }
        Some(
            self.last_global_idx
                .partition_point(|&last| last < global_idx),
        )
    }

    /// Replace the per-rank counts; `counts[p]` is the number of octants on
    /// rank `p`.
    pub fn update_from_counts(&mut self, counts: &[u64]) {
        debug_assert_eq!(counts.len(), self.nproc());
        let mut sum = 0u64;
        for (p, &count) in counts.iter().enumerate() {
            sum += count;
            self.last_global_idx[p] = sum.wrapping_sub(1);
        }
    }

    /// Replace the descendant ranges and apply the empty-partition
    /// propagation rules.
    pub fn update_descendants(&mut self, first: Vec<u64>, last: Vec<u64>) {
        debug_assert_eq!(first.len(), self.nproc());
        debug_assert_eq!(last.len(), self.nproc());
        self.first_desc = first;
        self.last_desc = last;

        let nproc = self.nproc();
        if nproc == 1 {
            return;
        }

        // First descendants propagate backwards from the next non-empty
        // process; a trailing empty partition owns nothing at all.
        let pp = nproc - 1;
        if self.count(pp) == 0 {
            self.first_desc[pp] = u64::MAX;
        }
        for p in (1..pp).rev() {
            if self.count(p) == 0 {
                self.first_desc[p] = self.first_desc[p + 1];
            }
        }

        // Last descendants propagate forwards from the previous process.
        for p in 1..nproc {
            if self.count(p) == 0 {
                self.last_desc[p] = self.last_desc[p - 1];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_lookup_by_global_index() {
        let table = PartitionTable::from_raw(vec![9, 19, 29], vec![0, 0, 0], vec![0, 0, 0]);
        assert_eq!(table.owner_of_global(0), Some(0));
        assert_eq!(table.owner_of_global(9), Some(0));
        assert_eq!(table.owner_of_global(10), Some(1));
        assert_eq!(table.owner_of_global(29), Some(2));
        assert_eq!(table.owner_of_global(30), None);
        assert_eq!(table.global_offset(2), 20);
        assert_eq!(table.count(1), 10);
    }

    #[test]
    fn owner_lookup_by_morton() {
        let table = PartitionTable::from_raw(vec![7, 15], vec![0, 32], vec![31, 63]);
        assert_eq!(table.find_owner(0), Some(0));
        assert_eq!(table.find_owner(31), Some(0));
        assert_eq!(table.find_owner(32), Some(1));
        assert_eq!(table.find_owner(63), Some(1));
        assert_eq!(table.find_owner(64), None);
    }

    #[test]
    fn empty_partitions_inherit_descendants() {
        let mut table = PartitionTable::from_raw(vec![9, 9, 19], vec![0; 3], vec![0; 3]);
        table.update_descendants(vec![0, 123, 40], vec![39, 456, 63]);
        // Rank 1 is empty: first descendant comes from rank 2, last from
        // rank 0, and Morton ownership skips it entirely.
        assert_eq!(table.first_desc()[1], 40);
        assert_eq!(table.last_desc()[1], 39);
        assert_eq!(table.find_owner(39), Some(0));
        assert_eq!(table.find_owner(40), Some(2));
    }
}
