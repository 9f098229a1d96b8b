// Reference-counted lifecycle gate. A gate starts NEW, is activated exactly
// once, hands out active references while ACTIVE, and once deactivated lets a
// single caller run the teardown callback after all references drained.
//
// The gate never knows its owner; wakeups go through the wait queue the owner
// passes in, so the owner can share one queue between the gate and its poll
// readers.

use parking_lot::{Condvar, Mutex};

/// Generation-counted wait queue. `notify_all` bumps the generation so a
/// waiter that sampled it before the wakeup never sleeps through it.
pub struct WaitQueue {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl Default for WaitQueue {
    fn default() -> Self {
        WaitQueue {
            generation: Mutex::new(0),
            cond: Condvar::new(),
        }
    }
}

impl WaitQueue {
    pub fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    pub fn notify_all(&self) {
        let mut generation = self.generation.lock();
        *generation += 1;
        self.cond.notify_all();
    }

    /// Blocks until the generation moves past `seen`.
    pub fn wait_past(&self, seen: u64) {
        let mut generation = self.generation.lock();
        while *generation == seen {
            self.cond.wait(&mut generation);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    New,
    Active,
    Deactivated,
}

struct GateState {
    phase: Phase,
    refs: u64,
    cleaned: bool,
}

pub struct ActiveGate {
    state: Mutex<GateState>,
}

impl Default for ActiveGate {
    fn default() -> Self {
        ActiveGate {
            state: Mutex::new(GateState {
                phase: Phase::New,
                refs: 0,
                cleaned: false,
            }),
        }
    }
}

impl ActiveGate {
    pub fn is_new(&self) -> bool {
        self.state.lock().phase == Phase::New
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().phase == Phase::Active
    }

    /// True from deactivation onwards, drained or still draining.
    pub fn is_deactivated(&self) -> bool {
        self.state.lock().phase == Phase::Deactivated
    }

    /// NEW -> ACTIVE. Legal only once; returns whether the transition
    /// happened.
    pub fn activate(&self) -> bool {
        let mut st = self.state.lock();
        if st.phase != Phase::New {
            return false;
        }
        st.phase = Phase::Active;
        true
    }

    /// Idempotent; also takes a never-activated gate straight to
    /// DEACTIVATED so teardown of a NEW peer drains trivially.
    pub fn deactivate(&self) {
        self.state.lock().phase = Phase::Deactivated;
    }

    /// Takes an active reference. Fails unless the gate is ACTIVE.
    pub fn acquire(&self) -> bool {
        let mut st = self.state.lock();
        if st.phase != Phase::Active {
            return false;
        }
        st.refs += 1;
        true
    }

    /// Drops an active reference; the last one out of a deactivated gate
    /// wakes the drainers.
    pub fn release(&self, waitq: &WaitQueue) {
        let mut st = self.state.lock();
        debug_assert!(st.refs > 0);
        st.refs -= 1;
        let wake = st.refs == 0 && st.phase == Phase::Deactivated;
        drop(st);
        if wake {
            waitq.notify_all();
        }
    }

    /// Blocks until the reference count reaches zero. Call after
    /// `deactivate`, otherwise new references can keep arriving.
    pub fn drain(&self, waitq: &WaitQueue) {
        loop {
            let seen = waitq.generation();
            {
                let st = self.state.lock();
                debug_assert!(st.phase != Phase::Active);
                if st.refs == 0 {
                    return;
                }
            }
            waitq.wait_past(seen);
        }
    }

    /// Drains, then runs `f` exactly once across all concurrent callers.
    /// Returns `true` to the winner. The callback runs in the caller's
    /// context, under whatever locks the caller already holds.
    pub fn cleanup(&self, waitq: &WaitQueue, f: impl FnOnce()) -> bool {
        self.drain(waitq);
        {
            let mut st = self.state.lock();
            if st.cleaned {
                return false;
            }
            st.cleaned = true;
        }
        f();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_phases() {
        let gate = ActiveGate::default();
        assert!(gate.is_new());
        assert!(!gate.acquire());

        assert!(gate.activate());
        assert!(gate.is_active());
        assert!(!gate.activate());

        gate.deactivate();
        assert!(gate.is_deactivated());
        assert!(!gate.acquire());
        gate.deactivate();
        assert!(gate.is_deactivated());
    }

    #[test]
    fn test_deactivate_from_new() {
        let gate = ActiveGate::default();
        gate.deactivate();
        assert!(gate.is_deactivated());
        assert!(!gate.activate());
    }

    #[test]
    fn test_cleanup_runs_once() {
        let gate = ActiveGate::default();
        let waitq = WaitQueue::default();
        gate.activate();
        gate.deactivate();

        let ran = AtomicU32::new(0);
        assert!(gate.cleanup(&waitq, || {
            ran.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!gate.cleanup(&waitq, || {
            ran.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drain_blocks_until_release() {
        let gate = Arc::new(ActiveGate::default());
        let waitq = Arc::new(WaitQueue::default());
        gate.activate();
        assert!(gate.acquire());
        gate.deactivate();

        let released = Arc::new(AtomicU32::new(0));
        let handle = {
            let (gate, waitq, released) = (gate.clone(), waitq.clone(), released.clone());
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(50));
                released.store(1, Ordering::SeqCst);
                gate.release(&waitq);
            })
        };

        gate.drain(&waitq);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        handle.join().unwrap();
    }

    #[test]
    fn test_cleanup_race_single_winner() {
        let gate = Arc::new(ActiveGate::default());
        let waitq = Arc::new(WaitQueue::default());
        gate.activate();
        gate.deactivate();

        let wins = Arc::new(AtomicU32::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (gate, waitq, wins) = (gate.clone(), waitq.clone(), wins.clone());
                std::thread::spawn(move || {
                    if gate.cleanup(&waitq, || {
                        std::thread::sleep(std::time::Duration::from_millis(10));
                    }) {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
    }
}
