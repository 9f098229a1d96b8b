// Multi-destination send: instantiate a message on every destination or on
// none. Each instantiation stages a node under a provisional sequence in the
// destination queue; commit assigns one final sequence and flips every node
// committed. A destination reset in between unlinks the staged node, and the
// commit observes the missing link and discards that destination silently.

use std::os::fd::OwnedFd;
use std::sync::Arc;

use arrayvec::ArrayVec;
use tracing::trace;

use crate::domain::Domain;
use crate::message::{FD_NUM_SIZE, Message};
use crate::peer::{ActiveRef, Peer, PeerInfo};
use crate::queue::{CommitResult, QueueKey};
use crate::{Error, Result};

/// Destinations held inline before spilling to the heap; the common unicast
/// and small-multicast cases never allocate.
const INLINE_DESTS: usize = 8;

struct TxDest {
    aref: ActiveRef,
    info: Arc<PeerInfo>,
    logical_id: u64,
    key: QueueKey,
    slice_offset: u64,
    slice_size: u64,
    n_fds: u64,
}

enum Dests {
    Inline(ArrayVec<TxDest, INLINE_DESTS>),
    Heap(Vec<TxDest>),
}

impl Dests {
    fn with_capacity(n: usize) -> Dests {
        if n <= INLINE_DESTS {
            Dests::Inline(ArrayVec::new())
        } else {
            Dests::Heap(Vec::with_capacity(n))
        }
    }

    fn push(&mut self, dest: TxDest) {
        match self {
            Dests::Inline(arr) => arr.push(dest),
            Dests::Heap(vec) => vec.push(dest),
        }
    }

    fn pop(&mut self) -> Option<TxDest> {
        match self {
            Dests::Inline(arr) => arr.pop(),
            Dests::Heap(vec) => vec.pop(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Dests::Inline(arr) => arr.len(),
            Dests::Heap(vec) => vec.len(),
        }
    }
}

pub(crate) struct Transaction<'d> {
    domain: &'d Arc<Domain>,
    uid: u64,
    payload: Vec<u8>,
    fds: Vec<OwnedFd>,
    convey_errors: bool,
    dests: Dests,
    done: bool,
}

impl<'d> Transaction<'d> {
    pub(crate) fn new(
        domain: &'d Arc<Domain>,
        uid: u64,
        payload: Vec<u8>,
        fds: Vec<OwnedFd>,
        convey_errors: bool,
        n_destinations: usize,
    ) -> Transaction<'d> {
        Transaction {
            domain,
            uid,
            payload,
            fds,
            convey_errors,
            dests: Dests::with_capacity(n_destinations),
            done: false,
        }
    }

    /// Stages the message on one destination: active reference, quota
    /// charge, pool slice, payload copy, queue node. Fails without touching
    /// the other destinations; the caller aborts the whole transaction.
    pub(crate) fn instantiate(&mut self, peer: Arc<Peer>) -> Result<()> {
        let aref = peer.acquire_ref().ok_or(Error::Shutdown)?;
        let info = peer.dereference().ok_or(Error::Shutdown)?;
        let logical_id = peer.logical_id();

        // Each destination carries its own duplicates of the fds.
        let mut fds = Vec::with_capacity(self.fds.len());
        for fd in &self.fds {
            fds.push(fd.try_clone().map_err(|_| Error::NoMemory)?);
        }

        let n_fds = fds.len() as u64;
        let slice_size = slice_aligned(self.payload.len() as u64 + n_fds * FD_NUM_SIZE);

        let mut locked = info.lock.lock();
        let pool_size = locked.pool.size();
        locked.quota.charge(self.uid, slice_size, n_fds, pool_size)?;
        let slice_offset = match locked.pool.alloc(slice_size) {
            Ok(offset) => offset,
            Err(e) => {
                locked.quota.discharge(self.uid, slice_size, n_fds);
                return Err(e);
            }
        };
        if let Err(e) = locked.pool.write(slice_offset, 0, &self.payload) {
            locked.pool.release_engine(slice_offset);
            locked.quota.discharge(self.uid, slice_size, n_fds);
            return Err(e);
        }

        let msg = Message {
            slice_offset,
            slice_size,
            n_bytes: self.payload.len() as u64,
            fds,
            uid: self.uid,
            convey_errors: self.convey_errors,
        };
        let key = locked.queue.stage(self.domain.provisional_seq(), msg);
        drop(locked);

        self.dests.push(TxDest {
            aref,
            info,
            logical_id,
            key,
            slice_offset,
            slice_size,
            n_fds,
        });
        Ok(())
    }

    pub(crate) fn n_dests(&self) -> usize {
        self.dests.len()
    }

    /// Publishes every staged node under one final sequence. Destinations
    /// reset since instantiation are discarded silently.
    pub(crate) fn commit(mut self) {
        let final_seq = self.domain.next_commit_seq();
        while let Some(dest) = self.dests.pop() {
            let mut locked = dest.info.lock.lock();
            if dest.aref.peer().logical_id() != dest.logical_id {
                // Stale tag: a reset unlinked the staged node and flushed
                // its slice already. The offset may have been reused since,
                // so the pool must not be touched here.
                drop(locked);
                trace!(seq = final_seq, "dropping commit against reset peer");
                continue;
            }
            match locked.queue.commit(dest.key, final_seq) {
                CommitResult::Committed => {
                    dest.info
                        .n_committed
                        .store(locked.queue.n_committed(), std::sync::atomic::Ordering::Release);
                    dest.info
                        .head_fds
                        .store(locked.queue.head_fds(), std::sync::atomic::Ordering::Release);
                    drop(locked);
                    dest.aref.peer().waitq.notify_all();
                }
                // Cancelled either way: the reset already flushed the pool,
                // dropping the stale message only closes its fds.
                CommitResult::Cancelled(_) => drop(locked),
            }
        }
        self.done = true;
        trace!(seq = final_seq, "transaction committed");
    }

    /// Unwinds every staged node, slice and quota charge.
    pub(crate) fn abort(&mut self) {
        while let Some(dest) = self.dests.pop() {
            let mut locked = dest.info.lock.lock();
            if locked.queue.unlink(dest.key).is_some() {
                locked.pool.release_engine(dest.slice_offset);
                locked
                    .quota
                    .discharge(self.uid, dest.slice_size, dest.n_fds);
            }
        }
        self.done = true;
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.abort();
        }
    }
}

fn slice_aligned(size: u64) -> u64 {
    (size.max(1) + 7) & !7
}
