// Per-peer receive queue: an ordered multiset of message nodes keyed by
// sequence number. A node staged by an in-flight transaction carries an odd
// provisional sequence; commit re-keys it to the final even sequence. Readers
// only ever see the head when it is committed, so a multicast becomes visible
// on every destination at once and never out of order.

use std::collections::BTreeMap;

use crate::message::Message;

pub type QueueKey = (u64, u64);

#[derive(Debug)]
pub struct QueueEntry {
    pub msg: Message,
    pub committed: bool,
    epoch: u64,
}

#[derive(Default)]
pub struct Queue {
    entries: BTreeMap<QueueKey, QueueEntry>,
    epoch: u64,
    next_tie: u64,
}

pub enum CommitResult {
    Committed,
    /// The staged node is gone or stale: a reset ran in between. The missing
    /// link is the cancellation signal; a stale node is handed back for its
    /// resources to be dropped.
    Cancelled(Option<Message>),
}

impl Queue {
    /// Stages an uncommitted node under a provisional (odd) sequence.
    pub fn stage(&mut self, provisional_seq: u64, msg: Message) -> QueueKey {
        debug_assert!(provisional_seq % 2 == 1);
        self.next_tie += 1;
        let key = (provisional_seq, self.next_tie);
        self.entries.insert(
            key,
            QueueEntry {
                msg,
                committed: false,
                epoch: self.epoch,
            },
        );
        key
    }

    /// Re-keys a staged node to its final sequence and marks it committed.
    /// A node unlinked by a reset, or staged before a `post_flush`, is
    /// cancelled instead.
    pub fn commit(&mut self, key: QueueKey, final_seq: u64) -> CommitResult {
        debug_assert!(final_seq % 2 == 0);
        let Some(entry) = self.entries.remove(&key) else {
            return CommitResult::Cancelled(None);
        };
        if entry.epoch != self.epoch {
            return CommitResult::Cancelled(Some(entry.msg));
        }
        self.entries.insert(
            (final_seq, key.1),
            QueueEntry {
                msg: entry.msg,
                committed: true,
                epoch: entry.epoch,
            },
        );
        CommitResult::Committed
    }

    /// Removes a staged node, if it is still linked.
    pub fn unlink(&mut self, key: QueueKey) -> Option<Message> {
        self.entries.remove(&key).map(|e| e.msg)
    }

    /// Head of the queue, only when it is a committed node. A staged node in
    /// front hides everything behind it until its sender commits or aborts.
    pub fn peek_head(&self) -> Option<&Message> {
        let (_, entry) = self.entries.iter().next()?;
        entry.committed.then_some(&entry.msg)
    }

    pub fn pop_head(&mut self) -> Option<Message> {
        let (key, entry) = self.entries.iter().next()?;
        if !entry.committed {
            return None;
        }
        let key = *key;
        Some(self.entries.remove(&key).unwrap().msg)
    }

    /// Number of fds on the committed head, for the lock-free recv estimate.
    pub fn head_fds(&self) -> usize {
        self.peek_head().map(|m| m.n_files()).unwrap_or(0)
    }

    pub fn n_committed(&self) -> usize {
        self.entries.values().filter(|e| e.committed).count()
    }

    /// Post-order walk of the reset path: drains every node, handing the
    /// committed messages back for slice and quota teardown. Staged nodes
    /// are only unlinked; their transactions observe the cancellation at
    /// commit time.
    pub fn flush(&mut self) -> Vec<Message> {
        let mut committed = Vec::new();
        for (_, entry) in std::mem::take(&mut self.entries) {
            if entry.committed {
                committed.push(entry.msg);
            }
        }
        committed
    }

    /// Invalidates all outstanding provisional sequences; commits staged
    /// before this point are discarded on arrival.
    pub fn post_flush(&mut self) {
        self.epoch += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(n_bytes: u64) -> Message {
        Message {
            slice_offset: 0,
            slice_size: n_bytes,
            n_bytes,
            fds: Vec::new(),
            uid: 0,
            convey_errors: false,
        }
    }

    #[test]
    fn test_staged_head_hides_queue() {
        let mut q = Queue::default();
        let key = q.stage(1, msg(8));
        assert!(q.peek_head().is_none());
        assert!(q.pop_head().is_none());

        assert!(matches!(q.commit(key, 2), CommitResult::Committed));
        assert_eq!(q.peek_head().unwrap().n_bytes, 8);
        assert_eq!(q.n_committed(), 1);
    }

    #[test]
    fn test_commit_order_is_delivery_order() {
        let mut q = Queue::default();
        let k1 = q.stage(1, msg(1));
        let k2 = q.stage(1, msg(2));
        // Second stage commits first and must be delivered first.
        assert!(matches!(q.commit(k2, 2), CommitResult::Committed));
        assert!(matches!(q.commit(k1, 4), CommitResult::Committed));
        assert_eq!(q.pop_head().unwrap().n_bytes, 2);
        assert_eq!(q.pop_head().unwrap().n_bytes, 1);
        assert!(q.pop_head().is_none());
    }

    #[test]
    fn test_unlinked_node_cancels_commit() {
        let mut q = Queue::default();
        let key = q.stage(1, msg(8));
        assert!(q.unlink(key).is_some());
        assert!(matches!(q.commit(key, 2), CommitResult::Cancelled(None)));
    }

    #[test]
    fn test_post_flush_invalidates_epoch() {
        let mut q = Queue::default();
        let key = q.stage(1, msg(8));
        q.post_flush();
        match q.commit(key, 2) {
            CommitResult::Cancelled(Some(m)) => assert_eq!(m.n_bytes, 8),
            _ => panic!("stale commit must be discarded"),
        }
        assert!(q.peek_head().is_none());
    }

    #[test]
    fn test_flush_returns_committed_only() {
        let mut q = Queue::default();
        let k1 = q.stage(1, msg(1));
        q.stage(1, msg(2));
        assert!(matches!(q.commit(k1, 2), CommitResult::Committed));
        let committed = q.flush();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].n_bytes, 1);
        assert_eq!(q.n_committed(), 0);
    }
}
