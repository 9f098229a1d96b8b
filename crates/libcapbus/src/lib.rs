//!
//! Peer lifecycle and dispatch engine for a capability-based local IPC bus.
//!
//! A [`Peer`] is an addressable endpoint owned by a user identity, hosting a
//! private receive queue, a pool for message payloads and an optional set of
//! well-known names registered in an enclosing [`Domain`]. All control flow
//! is caller-driven: commands are dispatched through [`Peer::ioctl`] with
//! caller memory abstracted behind [`UserMem`].
//!
//! # Quick usage example
//!
//! ```
//! use libcapbus::{Caller, Domain, DomainOptions, Peer, UserMem, VecUserMem};
//! use libcapbus::cmd_proto::{self, CmdConnect, CONNECT_FLAG_PEER};
//!
//! let domain = Domain::new(DomainOptions::default());
//! let peer = Peer::new();
//! let caller = Caller { uid: 1000, admin: true };
//!
//! let mut mem = VecUserMem::new(4096);
//! let mut block = [0u8; 64];
//! let len = CmdConnect {
//!     flags: CONNECT_FLAG_PEER,
//!     pool_size: 4096,
//!     names: b"org.example.svc\0",
//! }
//! .serialize(&mut block)
//! .unwrap();
//! mem.write(0, &block[..len]).unwrap();
//!
//! peer.ioctl(&domain, &caller, cmd_proto::CMD_CONNECT, 0, &mut mem)
//!     .unwrap();
//! assert!(peer.is_active());
//! peer.teardown(&domain).unwrap();
//! ```

mod active;
mod dispatch;
mod domain;
mod error;
mod fd;
mod message;
mod peer;
mod pool;
mod queue;
mod transaction;
mod user;
mod usermem;

pub use active::{ActiveGate, WaitQueue};
pub use dispatch::Caller;
pub use domain::{Domain, DomainOptions};
pub use error::{Error, Result};
pub use message::{FD_NUM_SIZE, Message};
pub use peer::{Peer, PeerInfo, PeerName};
pub use pool::Pool;
pub use queue::{CommitResult, Queue, QueueEntry, QueueKey};
pub use user::{Quota, User, UserRegistry};
pub use usermem::{UserMem, VecUserMem};

pub use cmd_proto;


/// The cargo version of libcapbus.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
