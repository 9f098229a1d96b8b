// Command dispatch: the ioctl-style entry point and the data-path handlers.
// CONNECT and DISCONNECT hold the op lock exclusively; SEND, RECV and
// SLICE_RELEASE hold it shared plus an active reference, so they run
// concurrently with each other and block teardown in its drain barrier.

use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use cmd_proto::{
    CONNECT_POOL_SIZE_OFFSET, CmdConnect, CmdRecv, CmdResolve, CmdSend, FD_MAX, NAME_MAX_SIZE,
    RECV_FLAG_MASK, RECV_FLAG_PEEK, RECV_OUTPUT_OFFSET, RESOLVE_ID_OFFSET, SEND_FLAG_CONVEY_ERRORS,
    SEND_FLAG_IGNORE_UNKNOWN, SEND_FLAG_MASK, SendVec, VEC_ENTRY_SIZE, VEC_MAX,
};
use tracing::trace;

use crate::domain::Domain;
use crate::fd::FdReserve;
use crate::message::FD_NUM_SIZE;
use crate::peer::{Peer, PeerInfo};
use crate::transaction::Transaction;
use crate::usermem::UserMem;
use crate::{Error, Result};

/// Ambient identity of the calling task: uid for user accounting, plus the
/// ADMIN capability in the domain's user namespace, which gates name claims.
#[derive(Debug, Clone, Copy)]
pub struct Caller {
    pub uid: u64,
    pub admin: bool,
}

fn read_block(mem: &dyn UserMem, arg: u64) -> Result<Vec<u8>> {
    let mut size_buf = [0u8; 4];
    mem.read(arg, &mut size_buf)?;
    let size = cmd_proto::declared_size(&size_buf)?;
    let mut block = vec![0u8; size as usize];
    mem.read(arg, &mut block)?;
    Ok(block)
}

fn single_name(buf: &[u8]) -> Result<&[u8]> {
    if buf.len() > NAME_MAX_SIZE {
        return Err(Error::NameTooLong);
    }
    if buf.len() < 2 || buf[buf.len() - 1] != 0 {
        return Err(Error::InvalidArgument);
    }
    let name = &buf[..buf.len() - 1];
    if name.contains(&0) {
        return Err(Error::InvalidArgument);
    }
    Ok(name)
}

impl Peer {
    /// Dispatches one command by integer code against this peer.
    pub fn ioctl(
        self: &Arc<Self>,
        domain: &Arc<Domain>,
        caller: &Caller,
        code: u32,
        arg: u64,
        mem: &mut dyn UserMem,
    ) -> Result<()> {
        trace!(code, arg, "dispatch");
        match code {
            cmd_proto::CMD_CONNECT => self.cmd_connect(domain, caller, arg, mem),
            cmd_proto::CMD_RESOLVE => self.cmd_resolve(domain, arg, mem),
            cmd_proto::CMD_DISCONNECT => {
                if arg != 0 {
                    return Err(Error::InvalidArgument);
                }
                self.teardown(domain)
            }
            cmd_proto::CMD_SLICE_RELEASE => self.cmd_slice_release(arg, mem),
            cmd_proto::CMD_SEND => self.cmd_send(domain, caller, arg, mem),
            cmd_proto::CMD_RECV => self.cmd_recv(arg, mem),
            other => Err(Error::NoSuchIoctl(other)),
        }
    }

    fn cmd_connect(
        self: &Arc<Self>,
        domain: &Arc<Domain>,
        caller: &Caller,
        arg: u64,
        mem: &mut dyn UserMem,
    ) -> Result<()> {
        let _guard = self.op_lock.write();
        let block = read_block(mem, arg)?;
        let cmd = CmdConnect::deserialize(&block)?;
        if let Some(pool_size) = self.connect(domain, caller, &cmd)? {
            // Copy-out after the fact; a fault does not revert the connect.
            mem.write(
                arg + CONNECT_POOL_SIZE_OFFSET as u64,
                &pool_size.to_le_bytes(),
            )?;
        }
        Ok(())
    }

    fn cmd_resolve(
        self: &Arc<Self>,
        domain: &Arc<Domain>,
        arg: u64,
        mem: &mut dyn UserMem,
    ) -> Result<()> {
        let block = read_block(mem, arg)?;
        let cmd = CmdResolve::deserialize(&block)?;
        if cmd.flags != 0 {
            return Err(Error::InvalidArgument);
        }
        let name = single_name(cmd.name)?;
        let target = domain.resolve(name)?;

        // The handle id lives in the caller's own maps, so the caller must
        // itself be connected.
        let _guard = self.op_lock.read();
        let _aref = self.acquire_ref().ok_or(Error::Shutdown)?;
        let info = self.dereference().ok_or(Error::Shutdown)?;
        let id = info.lock.lock().handles.get_or_alloc(&target);
        trace!(id, "name resolved");
        mem.write(arg + RESOLVE_ID_OFFSET as u64, &id.to_le_bytes())
    }

    fn cmd_slice_release(self: &Arc<Self>, arg: u64, mem: &mut dyn UserMem) -> Result<()> {
        let _guard = self.op_lock.read();
        let _aref = self.acquire_ref().ok_or(Error::Shutdown)?;
        let info = self.dereference().ok_or(Error::Shutdown)?;
        let offset = mem.read_u64(arg)?;
        info.lock.lock().pool.release_user(offset)
    }

    fn lookup_dest(&self, sender: &Arc<PeerInfo>, id: u64) -> Option<Arc<Peer>> {
        sender
            .lock
            .lock()
            .handles
            .lookup(id)
            .and_then(|weak| weak.upgrade())
    }

    fn cmd_send(
        self: &Arc<Self>,
        domain: &Arc<Domain>,
        caller: &Caller,
        arg: u64,
        mem: &mut dyn UserMem,
    ) -> Result<()> {
        let _guard = self.op_lock.read();
        let _aref = self.acquire_ref().ok_or(Error::Shutdown)?;
        let sender = self.dereference().ok_or(Error::Shutdown)?;

        let block = read_block(mem, arg)?;
        let cmd = CmdSend::deserialize(&block)?;
        if cmd.flags & !SEND_FLAG_MASK != 0 {
            return Err(Error::InvalidArgument);
        }
        if cmd.n_vecs > VEC_MAX || cmd.n_fds > FD_MAX {
            return Err(Error::InvalidArgument);
        }
        let n_dests = usize::try_from(cmd.n_destinations).map_err(|_| Error::InvalidArgument)?;
        let ignore_unknown = cmd.flags & SEND_FLAG_IGNORE_UNKNOWN != 0;
        let convey_errors = cmd.flags & SEND_FLAG_CONVEY_ERRORS != 0;

        // Gather the payload vectors; any fault here is fatal to the send.
        let mut payload = Vec::new();
        for i in 0..cmd.n_vecs {
            let mut entry = [0u8; VEC_ENTRY_SIZE];
            mem.read(cmd.ptr_vecs + i * VEC_ENTRY_SIZE as u64, &mut entry)?;
            let vec = SendVec::deserialize(&entry).map_err(|_| Error::Fault)?;
            let len = usize::try_from(vec.len).map_err(|_| Error::InvalidArgument)?;
            let start = payload.len();
            payload.resize(start + len, 0);
            mem.read(vec.ptr, &mut payload[start..])?;
        }

        // Pin the files to transfer; the message carries its own duplicates.
        let mut fds = Vec::with_capacity(cmd.n_fds as usize);
        for i in 0..cmd.n_fds {
            let num = mem.read_u64(cmd.ptr_fds + i * 8)?;
            let raw = RawFd::try_from(num).map_err(|_| Error::InvalidArgument)?;
            let dup = unsafe { libc::fcntl(raw, libc::F_DUPFD_CLOEXEC, 0) };
            if dup < 0 {
                return Err(Error::InvalidArgument);
            }
            fds.push(unsafe { OwnedFd::from_raw_fd(dup) });
        }

        // Handle ids ride along for capability transfer; each must be a
        // known outgoing handle of the sender.
        for i in 0..cmd.n_handles {
            let id = mem.read_u64(cmd.ptr_handles + i * 8)?;
            let known = sender.lock.lock().handles.lookup(id).is_some();
            if !known && !ignore_unknown {
                return Err(Error::NoSuchEntry);
            }
        }

        let mut tx = Transaction::new(domain, caller.uid, payload, fds, convey_errors, n_dests);
        if cmd.n_destinations == 1 {
            // Unicast fastpath: one id read, no array walk.
            let id = mem.read_u64(cmd.ptr_destinations)?;
            match self.lookup_dest(&sender, id) {
                Some(peer) => match tx.instantiate(peer) {
                    Ok(()) => {}
                    Err(Error::Shutdown) if ignore_unknown => {}
                    Err(e) => return Err(e),
                },
                None if ignore_unknown => {}
                None => return Err(Error::NoSuchEntry),
            }
        } else {
            for i in 0..cmd.n_destinations {
                let id = mem.read_u64(cmd.ptr_destinations + i * 8)?;
                let peer = match self.lookup_dest(&sender, id) {
                    Some(peer) => peer,
                    None if ignore_unknown => continue,
                    None => return Err(Error::NoSuchEntry),
                };
                match tx.instantiate(peer) {
                    Ok(()) => {}
                    // A destination torn down mid-walk counts as unknown.
                    Err(Error::Shutdown) if ignore_unknown => {}
                    Err(e) => return Err(e),
                }
            }
        }
        trace!(n_dests = tx.n_dests(), "send committing");
        tx.commit();
        Ok(())
    }

    fn cmd_recv(self: &Arc<Self>, arg: u64, mem: &mut dyn UserMem) -> Result<()> {
        let _guard = self.op_lock.read();
        let _aref = self.acquire_ref().ok_or(Error::Shutdown)?;
        let info = self.dereference().ok_or(Error::Shutdown)?;

        let block = read_block(mem, arg)?;
        let cmd = CmdRecv::deserialize(&block)?;
        if cmd.flags & !RECV_FLAG_MASK != 0 {
            return Err(Error::InvalidArgument);
        }
        if cmd.msg_offset != 0 || cmd.msg_size != 0 || cmd.msg_fds != 0 {
            return Err(Error::InvalidArgument);
        }

        if cmd.flags & RECV_FLAG_PEEK != 0 {
            let out = {
                let mut locked = info.lock.lock();
                let (offset, n_files) = match locked.queue.peek_head() {
                    Some(msg) => (msg.slice_offset, msg.n_files()),
                    None => return Err(Error::Again),
                };
                let size = locked.pool.publish(offset)?;
                CmdRecv {
                    flags: 0,
                    msg_offset: offset,
                    msg_size: size,
                    msg_fds: n_files as u64,
                }
            };
            return mem.write(arg + RECV_OUTPUT_OFFSET as u64, &out.serialize_output());
        }

        // Lock-free estimate first; a transient miss is just AGAIN.
        if info.n_committed.load(std::sync::atomic::Ordering::Acquire) == 0 {
            return Err(Error::Again);
        }
        let mut wanted = info.head_fds.load(std::sync::atomic::Ordering::Acquire);
        let mut reserve = FdReserve::default();
        let (msg, out) = loop {
            // Grow the fd reservation outside the lock, then re-check the
            // head: pre-allocation pressure must never drop a message after
            // dequeue.
            reserve.reserve_up_to(wanted)?;
            let mut locked = info.lock.lock();
            let head_fds = match locked.queue.peek_head() {
                Some(msg) => msg.n_files(),
                None => return Err(Error::Again),
            };
            if head_fds > reserve.count() {
                wanted = head_fds;
                drop(locked);
                continue;
            }

            let Some(msg) = locked.queue.pop_head() else {
                return Err(Error::Again);
            };
            info.n_committed.store(
                locked.queue.n_committed(),
                std::sync::atomic::Ordering::Release,
            );
            info.head_fds
                .store(locked.queue.head_fds(), std::sync::atomic::Ordering::Release);
            locked
                .quota
                .discharge(msg.uid, msg.slice_size, msg.n_files() as u64);

            let size = locked.pool.publish(msg.slice_offset)?;
            let n_files = msg.n_files();
            if n_files == 0 {
                locked.pool.release_engine(msg.slice_offset);
            } else {
                // Publish the installed-to-be numbers at the slice tail
                // before touching the fd table.
                let mut tail = Vec::with_capacity(n_files * FD_NUM_SIZE as usize);
                for n in reserve.numbers(n_files) {
                    tail.extend_from_slice(&(n as u64).to_le_bytes());
                }
                let at = size - n_files as u64 * FD_NUM_SIZE;
                if let Err(e) = locked.pool.write(msg.slice_offset, at, &tail) {
                    // The queue cannot be restored without breaking the
                    // ordering; the message is dropped. The error is only
                    // conveyed when the sender asked for it.
                    locked.pool.unpublish(msg.slice_offset);
                    locked.pool.release_engine(msg.slice_offset);
                    let convey = msg.convey_errors;
                    drop(locked);
                    drop(msg);
                    return Err(if convey { e } else { Error::Again });
                }
                locked.pool.release_engine(msg.slice_offset);
            }
            let out = CmdRecv {
                flags: 0,
                msg_offset: msg.slice_offset,
                msg_size: size,
                msg_fds: n_files as u64,
            };
            break (msg, out);
        };

        // Surplus reserved fds go back to the platform when `reserve` drops;
        // the first n_files slots become the caller's descriptors.
        if msg.n_files() > 0 {
            reserve.install(&msg.fds)?;
        }
        drop(msg);
        mem.write(arg + RECV_OUTPUT_OFFSET as u64, &out.serialize_output())
    }
}
