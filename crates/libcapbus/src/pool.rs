// Per-peer payload arena. An anonymous page-aligned mapping of fixed size,
// carved into slices. A slice is held by the engine from allocation until the
// owning message is consumed, and by the caller from publication until
// SLICE_RELEASE; the backing range is recycled once both holds are gone.

use std::collections::BTreeMap;

use memmap2::MmapMut;
use tracing::trace;

use crate::{Error, Result};

const SLICE_ALIGN: u64 = 8;

fn align_up(v: u64) -> u64 {
    (v + SLICE_ALIGN - 1) & !(SLICE_ALIGN - 1)
}

#[derive(Debug)]
struct Slice {
    size: u64,
    // Engine hold: set at allocation, cleared when the message is consumed.
    busy: bool,
    // Caller hold: set at publication, cleared by SLICE_RELEASE.
    user_ref: bool,
}

pub struct Pool {
    map: MmapMut,
    size: u64,
    slices: BTreeMap<u64, Slice>,
}

impl Pool {
    pub fn new(size: u64) -> Result<Pool> {
        if size == 0 || size % cmd_proto::PAGE_SIZE != 0 || size > cmd_proto::POOL_SIZE_MAX {
            return Err(Error::InvalidArgument);
        }
        let map = MmapMut::map_anon(size as usize).map_err(|_| Error::NoMemory)?;
        Ok(Pool {
            map,
            size,
            slices: BTreeMap::new(),
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn n_slices(&self) -> usize {
        self.slices.len()
    }

    /// First-fit allocation of an engine-held slice.
    pub fn alloc(&mut self, size: u64) -> Result<u64> {
        let size = align_up(size.max(1));
        let mut cursor = 0u64;
        let mut place = None;
        for (offset, slice) in self.slices.iter() {
            if offset - cursor >= size {
                place = Some(cursor);
                break;
            }
            cursor = offset + align_up(slice.size);
        }
        let offset = match place {
            Some(o) => o,
            None if self.size - cursor >= size => cursor,
            None => return Err(Error::NoMemory),
        };
        self.slices.insert(
            offset,
            Slice {
                size,
                busy: true,
                user_ref: false,
            },
        );
        trace!(offset, size, "pool slice allocated");
        Ok(offset)
    }

    fn slice_range(&self, offset: u64, at: u64, len: usize) -> Result<std::ops::Range<usize>> {
        let slice = self.slices.get(&offset).ok_or(Error::NoSuchEntry)?;
        let end = at.checked_add(len as u64).ok_or(Error::NoMemory)?;
        if end > slice.size {
            return Err(Error::NoMemory);
        }
        let start = (offset + at) as usize;
        Ok(start..start + len)
    }

    /// Writes into an allocated slice at a slice-relative position.
    pub fn write(&mut self, offset: u64, at: u64, data: &[u8]) -> Result<()> {
        let range = self.slice_range(offset, at, data.len())?;
        self.map[range].copy_from_slice(data);
        Ok(())
    }

    pub fn read(&self, offset: u64, at: u64, out: &mut [u8]) -> Result<()> {
        let range = self.slice_range(offset, at, out.len())?;
        out.copy_from_slice(&self.map[range]);
        Ok(())
    }

    /// Makes the slice caller-visible; returns its size. Idempotent so a
    /// repeated peek republishes the same head.
    pub fn publish(&mut self, offset: u64) -> Result<u64> {
        let slice = self.slices.get_mut(&offset).ok_or(Error::NoSuchEntry)?;
        slice.user_ref = true;
        Ok(slice.size)
    }

    /// Caller-side release by offset; only a published slice qualifies.
    pub fn release_user(&mut self, offset: u64) -> Result<()> {
        let slice = self.slices.get_mut(&offset).ok_or(Error::NoSuchEntry)?;
        if !slice.user_ref {
            return Err(Error::NoSuchEntry);
        }
        slice.user_ref = false;
        self.maybe_free(offset);
        Ok(())
    }

    /// Engine-side release, when the owning message is consumed or dropped.
    pub fn release_engine(&mut self, offset: u64) {
        if let Some(slice) = self.slices.get_mut(&offset) {
            slice.busy = false;
            self.maybe_free(offset);
        }
    }

    /// Drops the caller hold without requiring it to be set, for unwinding a
    /// publication that never reached the caller.
    pub fn unpublish(&mut self, offset: u64) {
        if let Some(slice) = self.slices.get_mut(&offset) {
            slice.user_ref = false;
            self.maybe_free(offset);
        }
    }

    fn maybe_free(&mut self, offset: u64) {
        if let Some(slice) = self.slices.get(&offset) {
            if !slice.busy && !slice.user_ref {
                self.slices.remove(&offset);
                trace!(offset, "pool slice freed");
            }
        }
    }

    /// Releases every slice, caller holds included.
    pub fn flush(&mut self) {
        self.slices.clear();
    }
}
