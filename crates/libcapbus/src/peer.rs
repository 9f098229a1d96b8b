// Peer lifecycle: the externally visible handle, its private state, the name
// bindings, and the connect/reset/query/teardown protocol.
//
// Locking: the op lock serializes CONNECT/DISCONNECT (write side) against the
// data-path commands (read side); the domain lock is always taken outside the
// per-peer locks; PeerInfo's own mutex nests innermost. `info` is read-copy:
// data-path readers load the Arc once under an active reference and the
// object stays alive until the last reader drops it, however long teardown
// ran in between.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use cmd_proto::{
    CONNECT_FLAG_MASK, CONNECT_FLAG_MONITOR, CONNECT_FLAG_PEER, CONNECT_FLAG_QUERY,
    CONNECT_FLAG_RESET, CmdConnect, NAME_MAX_SIZE,
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::active::{ActiveGate, WaitQueue};
use crate::dispatch::Caller;
use crate::domain::{Domain, DomainState};
use crate::pool::Pool;
use crate::queue::Queue;
use crate::user::{Quota, User};
use crate::{Error, Result};

/// One name binding. The byte string is immutable; membership in the domain
/// tree is keyed by it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerName {
    pub name: Bytes,
}

/// Outgoing capability handles: id -> target peer, plus the reverse index
/// used to hand the same id back for a repeated resolve. Ids are monotonic
/// and never recycled.
#[derive(Default)]
pub(crate) struct HandleMap {
    by_id: BTreeMap<u64, Weak<Peer>>,
    by_peer: BTreeMap<u64, u64>,
    next_id: u64,
}

impl HandleMap {
    pub(crate) fn get_or_alloc(&mut self, target: &Arc<Peer>) -> u64 {
        let logical = target.logical_id();
        if let Some(id) = self.by_peer.get(&logical) {
            return *id;
        }
        self.next_id += 1;
        self.by_id.insert(self.next_id, Arc::downgrade(target));
        self.by_peer.insert(logical, self.next_id);
        self.next_id
    }

    pub(crate) fn lookup(&self, id: u64) -> Option<Weak<Peer>> {
        self.by_id.get(&id).cloned()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }
}

pub(crate) struct PeerInfoLocked {
    pub(crate) pool: Pool,
    pub(crate) queue: Queue,
    pub(crate) handles: HandleMap,
    pub(crate) quota: Quota,
}

/// Per-peer private state, created by the first successful CONNECT and torn
/// down after queue and pool flush.
pub struct PeerInfo {
    pub(crate) lock: Mutex<PeerInfoLocked>,
    user: Mutex<Option<Arc<User>>>,
    // Readiness hints readable without the lock, kept in step by the paths
    // that mutate the queue.
    pub(crate) n_committed: AtomicUsize,
    pub(crate) head_fds: AtomicUsize,
}

impl PeerInfo {
    pub(crate) fn new(pool_size: u64) -> Result<Arc<PeerInfo>> {
        let pool = Pool::new(pool_size)?;
        Ok(Arc::new(PeerInfo {
            lock: Mutex::new(PeerInfoLocked {
                pool,
                queue: Queue::default(),
                handles: HandleMap::default(),
                quota: Quota::default(),
            }),
            user: Mutex::new(None),
            n_committed: AtomicUsize::new(0),
            head_fds: AtomicUsize::new(0),
        }))
    }

    pub fn pool_size(&self) -> u64 {
        self.lock.lock().pool.size()
    }

    pub(crate) fn set_user(&self, user: Arc<User>) {
        *self.user.lock() = Some(user);
    }

    pub(crate) fn take_user(&self) -> Option<Arc<User>> {
        self.user.lock().take()
    }

    /// Discards all queued messages and every pool slice. Committed nodes
    /// free their slice and message; staged nodes are only unlinked, which is
    /// what their still-running transaction observes at commit time.
    pub(crate) fn reset(&self) {
        let mut locked = self.lock.lock();
        let committed = locked.queue.flush();
        for msg in &committed {
            locked.pool.unpublish(msg.slice_offset);
            locked.pool.release_engine(msg.slice_offset);
        }
        drop(committed);
        locked.queue.post_flush();
        locked.pool.flush();
        locked.quota.reset();
        self.n_committed.store(0, Ordering::Relaxed);
        self.head_fds.store(0, Ordering::Relaxed);
    }
}

/// Active reference on a peer: while held, `Peer::dereference` is stable and
/// teardown blocks in its drain barrier.
pub(crate) struct ActiveRef {
    peer: Arc<Peer>,
}

impl ActiveRef {
    pub(crate) fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }
}

impl Drop for ActiveRef {
    fn drop(&mut self) {
        self.peer.active.release(&self.peer.waitq);
    }
}

/// An addressable endpoint owned by a user identity. Created detached from
/// any domain; bound by CONNECT; destroyed by the caller only after teardown.
pub struct Peer {
    pub(crate) op_lock: RwLock<()>,
    pub(crate) waitq: WaitQueue,
    active: ActiveGate,
    info: ArcSwapOption<PeerInfo>,
    names: Mutex<Vec<PeerName>>,
    logical_id: AtomicU64,
    monitor: AtomicBool,
    linked: AtomicBool,
}

impl Peer {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> Arc<Peer> {
        Arc::new(Peer {
            op_lock: RwLock::new(()),
            waitq: WaitQueue::default(),
            active: ActiveGate::default(),
            info: ArcSwapOption::from(None),
            names: Mutex::new(Vec::new()),
            logical_id: AtomicU64::new(0),
            monitor: AtomicBool::new(false),
            linked: AtomicBool::new(false),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.is_active()
    }

    pub fn is_deactivated(&self) -> bool {
        self.active.is_deactivated()
    }

    pub fn is_monitor(&self) -> bool {
        self.monitor.load(Ordering::Relaxed)
    }

    pub(crate) fn logical_id(&self) -> u64 {
        self.logical_id.load(Ordering::SeqCst)
    }

    /// Stable snapshot of the private state. Non-null while the caller holds
    /// an active reference.
    pub fn dereference(&self) -> Option<Arc<PeerInfo>> {
        self.info.load_full()
    }

    pub(crate) fn acquire_ref(self: &Arc<Self>) -> Option<ActiveRef> {
        self.active
            .acquire()
            .then(|| ActiveRef { peer: self.clone() })
    }

    pub(crate) fn deactivate(&self) {
        self.active.deactivate();
        self.waitq.notify_all();
    }

    pub(crate) fn drain_active(&self) {
        self.active.drain(&self.waitq);
    }

    /// Blocks until the wait queue moves; poll-style readers use this
    /// between AGAIN returns.
    pub fn wait(&self, seen_generation: u64) {
        self.waitq.wait_past(seen_generation);
    }

    pub fn readiness_generation(&self) -> u64 {
        self.waitq.generation()
    }

    // ---- connect protocol ----

    /// One entry point for all CONNECT modes. Returns the pool size to write
    /// back, if any.
    pub(crate) fn connect(
        self: &Arc<Self>,
        domain: &Arc<Domain>,
        caller: &Caller,
        cmd: &CmdConnect<'_>,
    ) -> Result<Option<u64>> {
        if cmd.flags & !CONNECT_FLAG_MASK != 0 {
            return Err(Error::InvalidArgument);
        }
        let mode = cmd.flags & (CONNECT_FLAG_PEER | CONNECT_FLAG_MONITOR | CONNECT_FLAG_RESET);
        if mode.count_ones() > 1 {
            return Err(Error::InvalidArgument);
        }
        if !cmd.names.is_empty() && !caller.admin {
            return Err(Error::PermissionDenied);
        }
        if self.active.is_deactivated() {
            return Err(Error::Shutdown);
        }
        let query = cmd.flags & CONNECT_FLAG_QUERY != 0;
        if mode & (CONNECT_FLAG_PEER | CONNECT_FLAG_MONITOR) != 0 {
            let size = self.connect_new(domain, caller, cmd)?;
            Ok(query.then_some(size))
        } else if mode == CONNECT_FLAG_RESET {
            Ok(Some(self.connect_reset(domain, cmd)?))
        } else if query {
            Ok(Some(self.connect_query()?))
        } else {
            Err(Error::InvalidArgument)
        }
    }

    fn connect_new(
        self: &Arc<Self>,
        domain: &Arc<Domain>,
        caller: &Caller,
        cmd: &CmdConnect<'_>,
    ) -> Result<u64> {
        if !self.active.is_new() {
            // Rebind attempt on a live peer: only an exact repeat of pool
            // size and name set is acknowledged.
            let info = self.dereference().ok_or(Error::Shutdown)?;
            if info.pool_size() != cmd.pool_size {
                return Err(Error::NamesDiffer);
            }
            self.names_check(cmd.names)?;
            return Err(Error::AlreadyConnected);
        }

        let info = PeerInfo::new(cmd.pool_size)?;
        info.set_user(domain.users.bind(caller.uid));
        let names = parse_names(cmd.names)?;

        let mut state = domain.state.write();
        if !state.active {
            if let Some(user) = info.take_user() {
                domain.users.release(user);
            }
            return Err(Error::Shutdown);
        }
        if let Some(max) = domain.max_peers() {
            if state.n_peers >= max {
                if let Some(user) = info.take_user() {
                    domain.users.release(user);
                }
                return Err(Error::NoMemory);
            }
        }

        let mut inserted: Vec<Bytes> = Vec::new();
        for pn in &names {
            if state.names.contains_key(&pn.name) {
                // Unwind the already-inserted prefix; the whole transaction
                // aborts.
                for name in &inserted {
                    state.names.remove(name);
                }
                if let Some(user) = info.take_user() {
                    domain.users.release(user);
                }
                debug!(name = ?pn.name, "connect aborted, name exists");
                return Err(Error::NameExists);
            }
            state.names.insert(pn.name.clone(), Arc::downgrade(self));
            inserted.push(pn.name.clone());
        }

        // Attach names by prepending in wire order; the list then iterates
        // in reverse wire order, with the first wire name as its tail.
        {
            let mut list = self.names.lock();
            debug_assert!(list.is_empty());
            for pn in names {
                list.insert(0, pn);
            }
        }
        state.peers.push(Arc::downgrade(self));
        state.n_peers += 1;
        self.logical_id.store(domain.allocate_id(), Ordering::SeqCst);
        self.monitor
            .store(cmd.flags & CONNECT_FLAG_MONITOR != 0, Ordering::Relaxed);
        self.linked.store(true, Ordering::SeqCst);
        self.info.store(Some(info));
        let activated = self.active.activate();
        debug_assert!(activated);
        drop(state);

        debug!(
            pool_size = cmd.pool_size,
            n_names = inserted.len(),
            monitor = self.is_monitor(),
            "peer connected"
        );
        Ok(cmd.pool_size)
    }

    fn connect_reset(&self, domain: &Domain, cmd: &CmdConnect<'_>) -> Result<u64> {
        if self.active.is_new() {
            return Err(Error::NotConnected);
        }
        if cmd.pool_size != 0 || !cmd.names.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let info = self.dereference().ok_or(Error::Shutdown)?;
        let size = info.pool_size();
        // Bump the logical id first: transactions committing against the
        // old identity observe the mismatch and discard themselves.
        self.logical_id.store(domain.allocate_id(), Ordering::SeqCst);
        info.reset();
        debug!("peer reset");
        Ok(size)
    }

    fn connect_query(&self) -> Result<u64> {
        if self.active.is_new() {
            return Err(Error::NotConnected);
        }
        let info = self.dereference().ok_or(Error::Shutdown)?;
        Ok(info.pool_size())
    }

    // ---- teardown ----

    /// Caller-initiated teardown. Deactivates, drains in-flight operations,
    /// then unbinds from the domain. Exactly one caller wins; losers get
    /// `Shutdown`.
    pub fn teardown(self: &Arc<Self>, domain: &Domain) -> Result<()> {
        let _guard = self.op_lock.write();
        self.deactivate();
        self.active.drain(&self.waitq);

        let mut state = domain.state.write();
        let mut info_out: Option<Arc<PeerInfo>> = None;
        let won = self.active.cleanup(&self.waitq, || {
            info_out = self.info.swap(None);
            {
                let mut list = self.names.lock();
                for pn in list.drain(..) {
                    state.names.remove(&pn.name);
                }
            }
            if let Some(info) = &info_out {
                if let Some(user) = info.take_user() {
                    domain.users.release(user);
                }
            }
            if self.linked.swap(false, Ordering::SeqCst) {
                let me = Arc::as_ptr(self);
                state.peers.retain(|weak| weak.as_ptr() != me);
                state.n_peers -= 1;
            }
        });
        drop(state);

        if !won {
            return Err(Error::Shutdown);
        }
        // Queue and pool flush outside the domain lock; the Arc keeps the
        // object alive for any reader that dereferenced before the swap.
        if let Some(info) = info_out {
            info.reset();
        }
        debug!("peer torn down");
        Ok(())
    }

    /// Domain-side teardown: the caller already deactivated and drained this
    /// peer and holds the domain lock. Peer-list removal is skipped, the
    /// domain resets its list wholesale. Safe to call repeatedly.
    pub(crate) fn teardown_for_domain(
        &self,
        state: &mut DomainState,
        domain: &Domain,
    ) -> Option<Arc<PeerInfo>> {
        let mut info_out: Option<Arc<PeerInfo>> = None;
        self.active.cleanup(&self.waitq, || {
            info_out = self.info.swap(None);
            {
                let mut list = self.names.lock();
                for pn in list.drain(..) {
                    state.names.remove(&pn.name);
                }
            }
            if let Some(info) = &info_out {
                if let Some(user) = info.take_user() {
                    domain.users.release(user);
                }
            }
            self.linked.store(false, Ordering::SeqCst);
        });
        info_out
    }

    // ---- name checks ----

    /// Walks the name list front-to-back. Returns the number of names seen
    /// when the match is the tail, zero when the match sits earlier, and
    /// `NamesDiffer` when there is no match.
    pub fn name_check(&self, name: &[u8]) -> Result<usize> {
        let list = self.names.lock();
        let mut seen = 0;
        for (i, pn) in list.iter().enumerate() {
            seen += 1;
            if pn.name.as_ref() == name {
                return Ok(if i + 1 == list.len() { seen } else { 0 });
            }
        }
        Err(Error::NamesDiffer)
    }

    /// Verifies that `buf` (concatenated NUL-terminated names) is pointwise
    /// equal to the registered names, tail identity included: the first
    /// supplied name must be the list's tail, i.e. the caller's ordered view
    /// agrees with the peer's.
    pub fn names_check(&self, buf: &[u8]) -> Result<()> {
        let names = parse_names(buf)?;
        let mut registered_total = None;
        for (i, pn) in names.iter().enumerate() {
            let n = self.name_check(&pn.name)?;
            if i == 0 {
                if n == 0 {
                    return Err(Error::NamesDiffer);
                }
                registered_total = Some(n);
            } else if n != 0 {
                return Err(Error::NamesDiffer);
            }
        }
        match registered_total {
            Some(total) if total != names.len() => Err(Error::NamesDiffer),
            Some(_) => Ok(()),
            None if self.names.lock().is_empty() => Ok(()),
            None => Err(Error::NamesDiffer),
        }
    }

    #[cfg(test)]
    pub(crate) fn names_snapshot(&self) -> Vec<Bytes> {
        self.names.lock().iter().map(|pn| pn.name.clone()).collect()
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        // Freeing requires teardown to have run (or the peer to have never
        // connected).
        debug_assert!(self.names.get_mut().is_empty());
        debug_assert!(self.info.load().is_none());
        debug_assert!(!self.linked.load(Ordering::SeqCst));
        trace!("peer freed");
    }
}

/// Splits a names buffer into owned bindings. The buffer is a concatenation
/// of NUL-terminated strings: no empty substring, terminator included.
pub(crate) fn parse_names(buf: &[u8]) -> Result<Vec<PeerName>> {
    let mut names = Vec::new();
    if buf.is_empty() {
        return Ok(names);
    }
    if *buf.last().unwrap() != 0 {
        return Err(Error::Malformed);
    }
    for chunk in buf[..buf.len() - 1].split(|b| *b == 0) {
        if chunk.is_empty() {
            return Err(Error::Malformed);
        }
        if chunk.len() + 1 > NAME_MAX_SIZE {
            return Err(Error::NameTooLong);
        }
        names.push(PeerName {
            name: Bytes::copy_from_slice(chunk),
        });
    }
    Ok(names)
}
