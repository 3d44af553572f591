//! Communication abstraction for intra-process (threaded) and inter-process
//! (MPI) message passing.
//!
//! Wire format conventions (for the higher-level protocols built on top):
//! - All integers are LE fixed width (u32 counts/tags/ranks, u64 IDs).
//! - Structs are #[repr(C)] and bytemuck::Pod-safe; no #[repr(packed)].
//! - Receivers may truncate to their provided buffer length; higher layers
//!   must exchange sizes first if exact lengths are required.

use once_cell::sync::Lazy;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

/// Non-blocking communication interface (minimal by design).
///
/// Implementors provide asynchronous send/receive operations and waitable
/// handles. Every collective the octree needs is layered on these two calls,
/// so a backend only has to ship bytes between ranks.
pub trait Communicator: Send + Sync + 'static {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle;

    /// Returns true if this communicator is NoComm (for test logic).
    fn is_no_comm(&self) -> bool {
        false
    }

    /// Rank of this process (0..size-1).
    fn rank(&self) -> usize;
    /// Total number of ranks.
    fn size(&self) -> usize;

    /// Synchronization barrier (default: no-op for single-rank comms).
    fn barrier(&self) {}
}

/// Tag newtype for safer tag arithmetic.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct CommTag(u16);

impl CommTag {
    /// Create a new tag from a raw `u16`.
    #[inline]
    pub const fn new(tag: u16) -> Self {
        Self(tag)
    }

    /// Return the underlying `u16` value.
    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Safely offset the tag by `dx`, wrapping on overflow.
    #[inline]
    pub const fn offset(self, dx: u16) -> Self {
        Self(self.0.wrapping_add(dx))
    }
}

impl From<u16> for CommTag {
    #[inline]
    fn from(x: u16) -> Self {
        CommTag::new(x)
    }
}

/// Convenience bundle of tags for a two-phase (sizes, then data) exchange.
#[derive(Copy, Clone, Debug)]
pub struct ExchangeCommTags {
    /// Tag used during the size-exchange phase.
    pub sizes: CommTag,
    /// Tag used during the data-exchange phase.
    pub data: CommTag,
}

impl ExchangeCommTags {
    /// Construct tags from a base, assigning deterministic offsets per phase.
    #[inline]
    pub const fn from_base(base: CommTag) -> Self {
        Self {
            sizes: base,
            data: base.offset(1),
        }
    }
}

/// Compile-time no-op comm for pure serial use.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}

    fn irecv(&self, _peer: usize, _tag: u16, _buf: &mut [u8]) {}

    fn is_no_comm(&self) -> bool {
        true
    }

    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }
}

// --- RayonComm: intra-process / multi-thread ---

// (world, src, dst, tag). The world id isolates concurrent communicator
// sessions living in one process, e.g. parallel test cases.
type Key = (u64, usize, usize, u16);

#[derive(Default)]
struct Slot {
    q: VecDeque<Vec<u8>>,
}

struct Mailbox {
    map: Mutex<HashMap<Key, Arc<(Mutex<Slot>, Condvar)>>>,
}

static MAILBOX: Lazy<Mailbox> = Lazy::new(|| Mailbox {
    map: Mutex::new(HashMap::new()),
});

static NEXT_WORLD: AtomicU64 = AtomicU64::new(1);

fn mailbox_entry(key: Key) -> Arc<(Mutex<Slot>, Condvar)> {
    let mut g = MAILBOX.map.lock().expect("MAILBOX poisoned");
    g.entry(key)
        .or_insert_with(|| Arc::new((Mutex::new(Slot::default()), Condvar::new())))
        .clone()
}

pub struct LocalSendHandle;

impl Wait for LocalSendHandle {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

pub struct LocalRecvHandle {
    cell: Arc<(Mutex<Slot>, Condvar)>,
    want_len: usize,
}

impl Wait for LocalRecvHandle {
    fn wait(self) -> Option<Vec<u8>> {
        let (lock, cv) = &*self.cell;
        let mut slot = lock.lock().expect("Slot poisoned");
        while slot.q.is_empty() {
            slot = cv.wait(slot).expect("Condvar poisoned");
        }
        let mut msg = slot.q.pop_front().expect("q non-empty");
        msg.truncate(self.want_len.min(msg.len()));
        Some(msg)
    }
}

/// Mailbox-backed communicator running all ranks inside one process.
///
/// Used to exercise genuinely distributed code paths on threads; every rank
/// of a session is constructed from the same [`RayonComm::world`] handle.
#[derive(Clone, Debug)]
pub struct RayonComm {
    world: u64,
    rank: usize,
    size: usize,
}

impl RayonComm {
    /// Allocate a fresh communication world for `size` ranks.
    ///
    /// Returns one communicator per rank; hand each to its own thread.
    pub fn world(size: usize) -> Vec<Self> {
        let world = NEXT_WORLD.fetch_add(1, Ordering::Relaxed);
        (0..size).map(|rank| Self { world, rank, size }).collect()
    }

    /// Construct a single rank of an explicitly numbered world.
    pub fn new_in_world(world: u64, rank: usize, size: usize) -> Self {
        Self { world, rank, size }
    }
}

// Reserved tag for the mailbox barrier protocol.
const BARRIER_TAG: u16 = u16::MAX;

impl Communicator for RayonComm {
    type SendHandle = LocalSendHandle;
    type RecvHandle = LocalRecvHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        let key = (self.world, self.rank, peer, tag);
        let entry = mailbox_entry(key);
        let (lock, cv) = &*entry;
        {
            let mut slot = lock.lock().expect("Slot poisoned");
            slot.q.push_back(buf.to_vec());
        }
        cv.notify_all();
        LocalSendHandle
    }

    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle {
        let key = (self.world, peer, self.rank, tag);
        LocalRecvHandle {
            cell: mailbox_entry(key),
            want_len: buf.len(),
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) {
        // Token all-exchange: every rank sends one byte to every other rank
        // and waits for one byte from every other rank. FIFO slot order keeps
        // successive barriers matched.
        if self.size == 1 {
            return;
        }
        for peer in 0..self.size {
            if peer != self.rank {
                let _ = self.isend(peer, BARRIER_TAG, &[0u8]);
            }
        }
        for peer in 0..self.size {
            if peer != self.rank {
                let mut token = [0u8; 1];
                let h = self.irecv(peer, BARRIER_TAG, &mut token);
                let _ = h.wait();
            }
        }
    }
}

// --- MPI backend ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    //! Inter-process backend over rsmpi.
    //!
    //! Buffers handed to MPI must stay pinned until the request completes,
    //! so both handle types own their bytes through [`PinnedBuffer`] and
    //! release them on wait or drop. The octree's exchange protocols wait
    //! every receive and let matched sends drain, hence a handle dropped
    //! with its request still pending is a protocol bug upstream; it is
    //! logged rather than silently discarded.
    //!
    //! Tags are the `u16` values of [`CommTag`] widened to the MPI `i32`
    //! tag space, which keeps them clear of the backend-reserved range.

    use super::*;
    use core::ptr::NonNull;
    use mpi::collective::CommunicatorCollectives;
    use mpi::environment::Universe;
    use mpi::point_to_point::{Destination, Source};
    use mpi::request::{Request, StaticScope};
    use mpi::topology::{Communicator as _, SimpleCommunicator};

    /// Heap allocation pinned for the lifetime of one MPI request.
    struct PinnedBuffer {
        raw: NonNull<[u8]>,
    }

    impl PinnedBuffer {
        fn from_vec(data: Vec<u8>) -> Self {
            let raw = Box::into_raw(data.into_boxed_slice());
            Self {
                raw: unsafe { NonNull::new_unchecked(raw) },
            }
        }

        fn zeroed(len: usize) -> Self {
            Self::from_vec(vec![0u8; len])
        }

        /// View the pinned bytes with an unbound lifetime.
        ///
        /// Safety: the caller must drop the returned reference before the
        /// buffer itself is dropped; the request holding it must have
        /// completed.
        unsafe fn pinned_slice(&self) -> &'static [u8] {
            &*self.raw.as_ptr()
        }

        /// Mutable variant of [`pinned_slice`](Self::pinned_slice), for
        /// receive requests.
        #[allow(clippy::mut_from_ref)]
        unsafe fn pinned_slice_mut(&self) -> &'static mut [u8] {
            &mut *self.raw.as_ptr()
        }

        /// Reclaim the bytes, consuming the pin.
        fn into_vec(self) -> Vec<u8> {
            let boxed = unsafe { Box::from_raw(self.raw.as_ptr()) };
            core::mem::forget(self);
            Vec::from(boxed)
        }
    }

    impl Drop for PinnedBuffer {
        fn drop(&mut self) {
            unsafe { drop(Box::from_raw(self.raw.as_ptr())) };
        }
    }

    /// Communicator backend running every rank as an MPI process.
    pub struct MpiComm {
        _universe: Universe,
        world: SimpleCommunicator,
        rank: usize,
        size: usize,
    }

    unsafe impl Send for MpiComm {}
    unsafe impl Sync for MpiComm {}

    impl Default for MpiComm {
        /// Initialize MPI and bind to the world communicator.
        ///
        /// The universe is owned by the communicator; MPI is finalized when
        /// the last clone of the environment goes away.
        fn default() -> Self {
            let universe = mpi::initialize().expect("MPI initialization failed");
            let world = universe.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Self {
                _universe: universe,
                world,
                rank,
                size,
            }
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiSendHandle;
        type RecvHandle = MpiRecvHandle;

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
            debug_assert!(peer < self.size, "send addressed to rank {peer} of {}", self.size);
            let buffer = PinnedBuffer::from_vec(buf.to_vec());
            let request = self.world.process_at_rank(peer as i32).immediate_send_with_tag(
                StaticScope,
                unsafe { buffer.pinned_slice() },
                tag as i32,
            );
            MpiSendHandle {
                request: Some(request),
                buffer: Some(buffer),
            }
        }

        fn irecv(&self, peer: usize, tag: u16, template: &mut [u8]) -> Self::RecvHandle {
            debug_assert!(peer < self.size, "receive addressed to rank {peer} of {}", self.size);
            let len = template.len();
            let buffer = PinnedBuffer::zeroed(len);
            let request = self
                .world
                .process_at_rank(peer as i32)
                .immediate_receive_into_with_tag(
                    StaticScope,
                    unsafe { buffer.pinned_slice_mut() },
                    tag as i32,
                );
            MpiRecvHandle {
                request: Some(request),
                buffer: Some(buffer),
                len,
            }
        }

        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }

        fn barrier(&self) {
            self.world.barrier();
        }
    }

    pub struct MpiSendHandle {
        request: Option<Request<'static, [u8], StaticScope>>,
        buffer: Option<PinnedBuffer>,
    }

    impl Wait for MpiSendHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            if let Some(request) = self.request.take() {
                let _ = request.wait();
            }
            self.buffer = None;
            None
        }
    }

    impl Drop for MpiSendHandle {
        fn drop(&mut self) {
            if let Some(request) = self.request.take() {
                log::warn!("mpi send handle dropped before its request completed");
                let _ = request.test();
            }
        }
    }

    pub struct MpiRecvHandle {
        request: Option<Request<'static, [u8], StaticScope>>,
        buffer: Option<PinnedBuffer>,
        len: usize,
    }

    impl Wait for MpiRecvHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            if let Some(request) = self.request.take() {
                let _ = request.wait();
            }
            let buffer = self.buffer.take()?;
            let mut data = buffer.into_vec();
            data.truncate(self.len);
            Some(data)
        }
    }

    impl Drop for MpiRecvHandle {
        fn drop(&mut self) {
            if let Some(request) = self.request.take() {
                log::warn!("mpi receive handle dropped before its request completed");
                let _ = request.test();
            }
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mailbox_round_trip() {
        let comms = RayonComm::world(2);
        let msg = b"hello";
        let _s = comms[0].isend(1, 7, msg);

        let mut buf = [0u8; 5];
        let h = comms[1].irecv(0, 7, &mut buf);
        assert_eq!(h.wait().unwrap(), msg);
    }

    #[test]
    fn mailbox_fifo_order() {
        let comms = RayonComm::world(2);
        for i in 0..10u8 {
            let _ = comms[0].isend(1, 8, &[i]);
        }
        let mut out = Vec::new();
        for _ in 0..10 {
            let mut b = [0u8; 1];
            let h = comms[1].irecv(0, 8, &mut b);
            out.push(h.wait().unwrap()[0]);
        }
        assert_eq!(out, (0u8..10u8).collect::<Vec<_>>());
    }

    #[test]
    fn worlds_do_not_cross_talk() {
        let a = RayonComm::world(2);
        let b = RayonComm::world(2);

        let _ = a[0].isend(1, 9, &[1]);
        let _ = b[0].isend(1, 9, &[2]);

        let mut buf = [0u8; 1];
        let h = b[1].irecv(0, 9, &mut buf);
        assert_eq!(h.wait().unwrap(), vec![2]);
    }

    #[test]
    fn truncation_is_ok() {
        let comms = RayonComm::world(2);
        let _ = comms[0].isend(1, 10, &[1, 2, 3, 4, 5, 6]);
        let mut b = [0u8; 4];
        let h = comms[1].irecv(0, 10, &mut b);
        assert_eq!(h.wait().unwrap(), vec![1, 2, 3, 4]);
    }
}
