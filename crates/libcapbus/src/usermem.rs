// Caller-memory abstraction. All command marshalling (copy-in of parameter
// blocks, destination arrays and payload vectors, copy-out of results) goes
// through this trait so the engine never touches raw pointers and faults stay
// injectable in tests.

use crate::{Error, Result};

pub trait UserMem {
    fn read(&self, addr: u64, out: &mut [u8]) -> Result<()>;
    fn write(&mut self, addr: u64, data: &[u8]) -> Result<()>;

    fn read_u64(&self, addr: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}

/// Flat-arena implementation backed by a `Vec<u8>`. Addresses are offsets
/// into the arena. Used by the tests and by in-process embedders that stage
/// their command blocks in a scratch buffer.
pub struct VecUserMem {
    mem: Vec<u8>,
}

impl VecUserMem {
    pub fn new(size: usize) -> Self {
        VecUserMem {
            mem: vec![0u8; size],
        }
    }

    fn range(&self, addr: u64, len: usize) -> Result<std::ops::Range<usize>> {
        let start = usize::try_from(addr).map_err(|_| Error::Fault)?;
        let end = start.checked_add(len).ok_or(Error::Fault)?;
        if end > self.mem.len() {
            return Err(Error::Fault);
        }
        Ok(start..end)
    }
}

impl UserMem for VecUserMem {
    fn read(&self, addr: u64, out: &mut [u8]) -> Result<()> {
        let range = self.range(addr, out.len())?;
        out.copy_from_slice(&self.mem[range]);
        Ok(())
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        let range = self.range(addr, data.len())?;
        self.mem[range].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_roundtrip() {
        let mut mem = VecUserMem::new(64);
        mem.write(8, b"hello").unwrap();
        let mut out = [0u8; 5];
        mem.read(8, &mut out).unwrap();
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn test_out_of_bounds_faults() {
        let mut mem = VecUserMem::new(16);
        assert_eq!(mem.write(12, b"hello"), Err(Error::Fault));
        let mut out = [0u8; 8];
        assert_eq!(mem.read(u64::MAX, &mut out), Err(Error::Fault));
    }
}
