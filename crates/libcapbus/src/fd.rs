// File-descriptor plumbing for the receive path. Descriptor numbers are
// reserved up front by holding placeholder fds (lowest-free allocation gives
// bottom-up numbers), so that once a message is dequeued, installing its fds
// over the placeholders cannot run out of table space.

use std::fs::File;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};

use tracing::warn;

use crate::{Error, Result};

const PLACEHOLDER: &str = "/dev/null";

#[derive(Default)]
pub(crate) struct FdReserve {
    slots: Vec<OwnedFd>,
}

impl FdReserve {
    pub(crate) fn count(&self) -> usize {
        self.slots.len()
    }

    /// Grows the reservation to `n` slots, close-on-exec. Surplus slots are
    /// given back when the reservation drops.
    pub(crate) fn reserve_up_to(&mut self, n: usize) -> Result<()> {
        while self.slots.len() < n {
            let placeholder = File::open(PLACEHOLDER).map_err(|_| Error::NoMemory)?;
            self.slots.push(OwnedFd::from(placeholder));
        }
        self.slots.sort_by_key(|fd| fd.as_raw_fd());
        Ok(())
    }

    /// Descriptor numbers the first `n` installs will land on, bottom-up.
    pub(crate) fn numbers(&self, n: usize) -> Vec<RawFd> {
        self.slots[..n].iter().map(|fd| fd.as_raw_fd()).collect()
    }

    /// Replaces the first `fds.len()` placeholders with close-on-exec
    /// duplicates of the message fds. The installed numbers belong to the
    /// caller afterwards.
    pub(crate) fn install(&mut self, fds: &[OwnedFd]) -> Result<()> {
        for fd in fds {
            let slot = self.slots.remove(0);
            let number = slot.as_raw_fd();
            let rc = unsafe { libc::dup3(fd.as_raw_fd(), number, libc::O_CLOEXEC) };
            if rc < 0 {
                warn!(number, "dup3 failed installing received fd");
                return Err(Error::Fault);
            }
            // The number now refers to the message file and is owned by the
            // caller; forget the placeholder handle.
            let _ = slot.into_raw_fd();
        }
        Ok(())
    }
}
