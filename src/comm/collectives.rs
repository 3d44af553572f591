//! Collective operations layered on the [`Communicator`] trait.
//!
//! Every collective is built from matched `isend`/`irecv` pairs issued in the
//! same order on all ranks, so any backend that ships bytes FIFO per
//! `(src, dst, tag)` channel can run them. Sparse exchanges discover their
//! receives with an all-gather of per-destination byte counts instead of a
//! probe.
//!
//! All helpers short-circuit when `comm.size() == 1`.

use std::collections::BTreeMap;

use bytemuck::Pod;

use crate::comm::communicator::{CommTag, Communicator, ExchangeCommTags, Wait};
use crate::error::OctreeError;

/// Gather one fixed-size value from every rank; result is indexed by rank.
pub fn all_gather<C, T>(comm: &C, tag: CommTag, value: T) -> Vec<T>
where
    C: Communicator,
    T: Pod,
{
    let size = comm.size();
    let rank = comm.rank();
    if size == 1 {
        return vec![value];
    }

    let bytes = bytemuck::bytes_of(&value);
    let item_len = bytes.len();

    let mut handles = Vec::with_capacity(size - 1);
    for peer in 0..size {
        if peer != rank {
            let mut buf = vec![0u8; item_len];
            handles.push((peer, comm.irecv(peer, tag.as_u16(), &mut buf)));
        }
    }
    for peer in 0..size {
        if peer != rank {
            let _ = comm.isend(peer, tag.as_u16(), bytes);
        }
    }

    let mut out = vec![value; size];
    for (peer, handle) in handles {
        let data = handle.wait().unwrap_or_default();
        out[peer] = bytemuck::pod_read_unaligned(&data[..item_len]);
    }
    out
}

/// Gather a slice of the same length from every rank.
///
/// Callers must guarantee that every rank passes `len` items; the length is
/// not exchanged.
pub fn all_gather_uniform<C, T>(comm: &C, tag: CommTag, items: &[T]) -> Vec<Vec<T>>
where
    C: Communicator,
    T: Pod,
{
    let size = comm.size();
    let rank = comm.rank();
    if size == 1 {
        return vec![items.to_vec()];
    }

    let bytes: &[u8] = bytemuck::cast_slice(items);
    let buf_len = bytes.len();

    let mut handles = Vec::with_capacity(size - 1);
    for peer in 0..size {
        if peer != rank {
            let mut buf = vec![0u8; buf_len];
            handles.push((peer, comm.irecv(peer, tag.as_u16(), &mut buf)));
        }
    }
    for peer in 0..size {
        if peer != rank {
            let _ = comm.isend(peer, tag.as_u16(), bytes);
        }
    }

    let mut out = vec![Vec::new(); size];
    out[rank] = items.to_vec();
    for (peer, handle) in handles {
        let data = handle.wait().unwrap_or_default();
        out[peer] = bytemuck::pod_collect_to_vec(&data[..buf_len]);
    }
    out
}

/// Gather a variable-length slice from every rank (sizes phase, then data).
pub fn all_gather_varlen<C, T>(comm: &C, tags: ExchangeCommTags, items: &[T]) -> Vec<Vec<T>>
where
    C: Communicator,
    T: Pod,
{
    let size = comm.size();
    let rank = comm.rank();
    if size == 1 {
        return vec![items.to_vec()];
    }

    let counts = all_gather(comm, tags.sizes, items.len() as u64);

    let bytes: &[u8] = bytemuck::cast_slice(items);
    let item_size = core::mem::size_of::<T>();

    let mut handles = Vec::with_capacity(size - 1);
    for peer in 0..size {
        if peer != rank {
            let mut buf = vec![0u8; counts[peer] as usize * item_size];
            handles.push((peer, comm.irecv(peer, tags.data.as_u16(), &mut buf)));
        }
    }
    for peer in 0..size {
        if peer != rank {
            let _ = comm.isend(peer, tags.data.as_u16(), bytes);
        }
    }

    let mut out = vec![Vec::new(); size];
    out[rank] = items.to_vec();
    for (peer, handle) in handles {
        let want = counts[peer] as usize * item_size;
        let data = handle.wait().unwrap_or_default();
        out[peer] = bytemuck::pod_collect_to_vec(&data[..want]);
    }
    out
}

/// Reduce one value per rank with a commutative combiner.
pub fn all_reduce<C, T, F>(comm: &C, tag: CommTag, value: T, combine: F) -> T
where
    C: Communicator,
    T: Pod,
    F: Fn(T, T) -> T,
{
    let gathered = all_gather(comm, tag, value);
    let mut acc = value;
    for (peer, v) in gathered.into_iter().enumerate() {
        if peer != comm.rank() {
            acc = combine(acc, v);
        }
    }
    acc
}

/// Logical-OR reduction of a local flag.
pub fn all_reduce_or<C: Communicator>(comm: &C, tag: CommTag, value: bool) -> bool {
    all_reduce(comm, tag, value as u8, |a, b| a | b) != 0
}

/// Sum reduction of a local count.
pub fn all_reduce_sum_u64<C: Communicator>(comm: &C, tag: CommTag, value: u64) -> u64 {
    all_reduce(comm, tag, value, |a, b| a + b)
}

/// Max reduction of a local depth.
pub fn all_reduce_max_i8<C: Communicator>(comm: &C, tag: CommTag, value: i8) -> i8 {
    all_reduce(comm, tag, value, |a, b| a.max(b))
}

/// Sparse neighbor exchange of opaque byte buffers.
///
/// `sends` maps destination rank to payload. The result maps source rank to
/// the received payload, and only contains ranks that sent a non-empty
/// buffer. A buffer addressed to the caller itself is moved over directly.
pub fn exchange_buffers<C: Communicator>(
    comm: &C,
    tags: ExchangeCommTags,
    sends: &BTreeMap<usize, Vec<u8>>,
) -> Result<BTreeMap<usize, Vec<u8>>, OctreeError> {
    let size = comm.size();
    let rank = comm.rank();

    let mut received = BTreeMap::new();
    if let Some(own) = sends.get(&rank) {
        if !own.is_empty() {
            received.insert(rank, own.clone());
        }
    }
    if size == 1 {
        return Ok(received);
    }

    // Sizes phase: every rank learns how many bytes each peer addressed
    // to it.
    let mut counts = vec![0u64; size];
    for (&dest, payload) in sends {
        if dest >= size {
            return Err(OctreeError::CommFailure(format!(
                "exchange addressed to rank {dest} of {size}"
            )));
        }
        counts[dest] = payload.len() as u64;
    }
    let matrix = all_gather_uniform(comm, tags.sizes, &counts);

    // Data phase: matched point-to-point transfers for non-empty entries.
    let mut handles = Vec::new();
    for (peer, row) in matrix.iter().enumerate() {
        if peer == rank {
            continue;
        }
        let incoming = row[rank] as usize;
        if incoming > 0 {
            let mut buf = vec![0u8; incoming];
            handles.push((peer, incoming, comm.irecv(peer, tags.data.as_u16(), &mut buf)));
        }
    }
    for (&dest, payload) in sends {
        if dest != rank && !payload.is_empty() {
            let _ = comm.isend(dest, tags.data.as_u16(), payload);
        }
    }

    for (peer, want, handle) in handles {
        let data = handle
            .wait()
            .ok_or_else(|| OctreeError::CommFailure(format!("no data received from rank {peer}")))?;
        if data.len() < want {
            return Err(OctreeError::CommFailure(format!(
                "short receive from rank {peer}: {} of {want} bytes",
                data.len()
            )));
        }
        received.insert(peer, data);
    }

    Ok(received)
}
