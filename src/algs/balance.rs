//! Cross-process 2:1 balance engine.
//!
//! The local marker fixpoint runs first; while the tree is distributed,
//! border markers are exchanged onto the neighbor ghosts and the local
//! fixpoint reruns seeded from the ghosts, until a full round changes no
//! marker anywhere.

use std::collections::BTreeMap;

use crate::algs::ghost::BordersPerProc;
use crate::comm::{all_reduce_or, exchange_buffers, tags, Communicator, ExchangeCommTags};
use crate::error::OctreeError;
use crate::tree::local::LocalTree;

/// Send the markers of the border octants to every neighboring process and
/// overwrite the local ghost markers with what the owners report.
///
/// Returns whether any local ghost marker changed.
pub fn exchange_markers<C: Communicator>(
    comm: &C,
    tree: &mut LocalTree,
    borders: &BordersPerProc,
) -> Result<bool, OctreeError> {
    let mut sends: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
    for (&target, sources) in borders {
        let buf: Vec<u8> = sources
            .iter()
            .map(|&idx| tree.octant(idx).marker() as u8)
            .collect();
        sends.insert(target, buf);
    }

    let received = exchange_buffers(comm, ExchangeCommTags::from_base(tags::MARKERS), &sends)?;

    let mut updated = false;
    let spans = tree.ghost_rank_spans.clone();
    for (sender, start, len) in spans {
        let Some(buf) = received.get(&sender) else {
            continue;
        };
        if buf.len() != len as usize {
            return Err(OctreeError::CommFailure(format!(
                "marker exchange with rank {sender} carried {} markers, expected {len}",
                buf.len()
            )));
        }
        for (k, &raw) in buf.iter().enumerate() {
            let marker = raw as i8;
            let ghost = &mut tree.ghosts[(start + k as u32) as usize];
            if ghost.marker() != marker {
                ghost.set_marker(marker);
                updated = true;
            }
        }
    }
    Ok(updated)
}

/// Iterative 2:1 balance across all processes.
///
/// `balance_new` controls whether octants freshly created by the current
/// adaptation seed the propagation as well.
pub fn balance_21<C: Communicator>(
    comm: &C,
    tree: &mut LocalTree,
    borders: &BordersPerProc,
    serial: bool,
    balance_new: bool,
) -> Result<(), OctreeError> {
    log::trace!("2:1 balance: local fixpoint");
    tree.local_balance(balance_new, false);

    if serial || comm.size() == 1 {
        return Ok(());
    }

    loop {
        // Exchange markers across processes.
        let updated = exchange_markers(comm, tree, borders)?;
        if !all_reduce_or(comm, tags::REDUCE, updated) {
            break;
        }

        // Propagate the marker changes applied by other processes inward.
        let changed = tree.local_balance(balance_new, true);
        if !all_reduce_or(comm, tags::REDUCE, changed) {
            break;
        }
    }
    log::trace!("2:1 balance: converged");
    Ok(())
}
