// The domain: uniqueness and lifecycle authority enclosing a set of peers.
// It owns the byte-ordered name tree, the peer list, the user table and the
// global sequence allocators. Structural changes happen under the write side
// of the state lock; `resolve` only ever takes the read side.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::peer::Peer;
use crate::user::UserRegistry;
use crate::{Error, Result};

#[derive(Debug, Default, Clone, Copy)]
pub struct DomainOptions {
    /// Cap on concurrently connected peers; `None` means unlimited.
    pub max_peers: Option<usize>,
}

pub(crate) struct DomainState {
    pub(crate) names: BTreeMap<Bytes, Weak<Peer>>,
    pub(crate) peers: Vec<Weak<Peer>>,
    pub(crate) n_peers: usize,
    pub(crate) active: bool,
}

pub struct Domain {
    pub(crate) state: RwLock<DomainState>,
    pub(crate) users: UserRegistry,
    // Global commit sequence; always even, staged nodes use seq+1.
    seq: AtomicU64,
    // Logical peer-id allocator; every activation and reset gets a fresh id.
    ids: AtomicU64,
    max_peers: Option<usize>,
}

impl Domain {
    pub fn new(options: DomainOptions) -> Arc<Domain> {
        debug!(?options, "domain created");
        Arc::new(Domain {
            state: RwLock::new(DomainState {
                names: BTreeMap::new(),
                peers: Vec::new(),
                n_peers: 0,
                active: true,
            }),
            users: UserRegistry::default(),
            seq: AtomicU64::new(0),
            ids: AtomicU64::new(0),
            max_peers: options.max_peers,
        })
    }

    pub(crate) fn allocate_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Provisional (odd) sequence for staging a queue node.
    pub(crate) fn provisional_seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire) | 1
    }

    /// Final (even) sequence shared by every destination of one commit.
    pub(crate) fn next_commit_seq(&self) -> u64 {
        self.seq.fetch_add(2, Ordering::AcqRel) + 2
    }

    pub(crate) fn max_peers(&self) -> Option<usize> {
        self.max_peers
    }

    /// Name lookup under the read lock; never blocks writers out of
    /// linearizability, only throughput.
    pub fn resolve(&self, name: &[u8]) -> Result<Arc<Peer>> {
        let state = self.state.read();
        state
            .names
            .get(name)
            .and_then(Weak::upgrade)
            .ok_or(Error::NoSuchEntry)
    }

    pub fn n_peers(&self) -> usize {
        self.state.read().n_peers
    }

    pub fn n_names(&self) -> usize {
        self.state.read().names.len()
    }

    pub fn is_active(&self) -> bool {
        self.state.read().active
    }

    /// Deactivates and tears down every peer. Safe to call repeatedly;
    /// later calls are no-ops.
    pub fn shutdown(&self) {
        let peers: Vec<Arc<Peer>> = {
            let mut state = self.state.write();
            if !state.active {
                return;
            }
            state.active = false;
            state.peers.iter().filter_map(Weak::upgrade).collect()
        };

        for peer in &peers {
            peer.deactivate();
        }
        for peer in &peers {
            peer.drain_active();
        }

        let mut freed = Vec::new();
        {
            let mut state = self.state.write();
            for peer in &peers {
                if let Some(info) = peer.teardown_for_domain(&mut state, self) {
                    freed.push(info);
                }
            }
            state.peers.clear();
            state.n_peers = 0;
        }
        // Queue and pool teardown happens outside the domain lock.
        for info in freed {
            info.reset();
        }
        info!(n_peers = peers.len(), "domain shut down");
    }
}
