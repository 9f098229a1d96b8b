// User accounting. Peers connected under the same uid share one interned
// `User`; the interning table holds weak references so an entry dies with its
// last peer. Quota charges in-flight messages on the destination pool against
// the sending user, so one chatty sender cannot starve everyone else.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use dashmap::DashMap;

use crate::{Error, Result};

/// Fraction of the destination pool one sending user may occupy.
const QUOTA_POOL_SHARE_DIV: u64 = 4;
const QUOTA_SLICES_MAX: u64 = 1 << 14;
const QUOTA_FDS_MAX: u64 = 1 << 10;

#[derive(Debug)]
pub struct User {
    pub uid: u64,
}

#[derive(Default)]
pub struct UserRegistry {
    users: DashMap<u64, Weak<User>>,
}

impl UserRegistry {
    /// Pins the accounting object for `uid`, creating it on first use.
    pub fn bind(&self, uid: u64) -> Arc<User> {
        use dashmap::mapref::entry::Entry;
        match self.users.entry(uid) {
            Entry::Occupied(mut occ) => match occ.get().upgrade() {
                Some(user) => user,
                None => {
                    let user = Arc::new(User { uid });
                    occ.insert(Arc::downgrade(&user));
                    user
                }
            },
            Entry::Vacant(vac) => {
                let user = Arc::new(User { uid });
                vac.insert(Arc::downgrade(&user));
                user
            }
        }
    }

    /// Drops a pinned reference and prunes the table entry when it was the
    /// last one. Callers serialize through the domain lock.
    pub fn release(&self, user: Arc<User>) {
        let uid = user.uid;
        drop(user);
        self.users
            .remove_if(&uid, |_, weak| weak.strong_count() == 0);
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Usage {
    bytes: u64,
    slices: u64,
    fds: u64,
}

/// Per-destination tracker of in-flight resources, by sending uid.
#[derive(Default)]
pub struct Quota {
    per_user: HashMap<u64, Usage>,
}

impl Quota {
    pub fn charge(&mut self, uid: u64, bytes: u64, fds: u64, pool_size: u64) -> Result<()> {
        let usage = self.per_user.entry(uid).or_default();
        let max_bytes = pool_size / QUOTA_POOL_SHARE_DIV;
        if usage.bytes + bytes > max_bytes
            || usage.slices + 1 > QUOTA_SLICES_MAX
            || usage.fds + fds > QUOTA_FDS_MAX
        {
            return Err(Error::NoMemory);
        }
        usage.bytes += bytes;
        usage.slices += 1;
        usage.fds += fds;
        Ok(())
    }

    pub fn discharge(&mut self, uid: u64, bytes: u64, fds: u64) {
        if let Some(usage) = self.per_user.get_mut(&uid) {
            usage.bytes = usage.bytes.saturating_sub(bytes);
            usage.slices = usage.slices.saturating_sub(1);
            usage.fds = usage.fds.saturating_sub(fds);
            if usage.slices == 0 && usage.bytes == 0 && usage.fds == 0 {
                self.per_user.remove(&uid);
            }
        }
    }

    pub fn reset(&mut self) {
        self.per_user.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_interns_per_uid() {
        let reg = UserRegistry::default();
        let a = reg.bind(1000);
        let b = reg.bind(1000);
        let c = reg.bind(1001);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_release_prunes_last_reference() {
        let reg = UserRegistry::default();
        let a = reg.bind(1000);
        let b = reg.bind(1000);
        reg.release(a);
        assert_eq!(reg.len(), 1);
        reg.release(b);
        assert!(reg.is_empty());
        reg.bind(1000);
    }

    #[test]
    fn test_quota_pool_share() {
        let mut quota = Quota::default();
        // Pool of 4096: each user gets 1024 bytes of in-flight budget.
        quota.charge(1, 1000, 0, 4096).unwrap();
        assert_eq!(quota.charge(1, 100, 0, 4096).err(), Some(Error::NoMemory));
        // Another user has an independent share.
        quota.charge(2, 1000, 0, 4096).unwrap();
        quota.discharge(1, 1000, 0);
        quota.charge(1, 1024, 0, 4096).unwrap();
    }

    #[test]
    fn test_quota_fd_cap() {
        let mut quota = Quota::default();
        assert_eq!(
            quota.charge(1, 0, QUOTA_FDS_MAX + 1, 4096).err(),
            Some(Error::NoMemory)
        );
        quota.charge(1, 0, QUOTA_FDS_MAX, 4096).unwrap();
    }
}
