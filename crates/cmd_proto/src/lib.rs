// Command protocol for the capbus dispatch surface: parameter block layout,
// command codes, flag constants, limits.
//
// Every parameter block is a little-endian POD record with a leading `size`
// and `flags`. Variable-length blocks carry trailing payload bytes inside the
// declared size. This crate only validates shape; the engine owns semantics.

use byteorder::{ByteOrder, LE};

const SIZE_LEN: usize = 4;
const FLAGS_LEN: usize = 8;
const HEADER_LEN: usize = SIZE_LEN + FLAGS_LEN;

/// Largest parameter block the engine will copy in.
pub const MAX_CMD_SIZE: usize = 1 << 20;

/// Name length bounds, including the NUL terminator.
pub const NAME_MAX_SIZE: usize = 256;

pub const VEC_MAX: u64 = 512;
pub const FD_MAX: u64 = 256;

pub const PAGE_SIZE: u64 = 4096;
pub const POOL_SIZE_MAX: u64 = 1 << 32;

/// One entry of the send payload vector array in caller memory.
pub const VEC_ENTRY_SIZE: usize = 16;

/// One destination (or fd number) entry in caller memory.
pub const ID_ENTRY_SIZE: usize = 8;

pub const CMD_CONNECT: u32 = 0x10;
pub const CMD_RESOLVE: u32 = 0x11;
pub const CMD_DISCONNECT: u32 = 0x12;
pub const CMD_SLICE_RELEASE: u32 = 0x13;
pub const CMD_SEND: u32 = 0x14;
pub const CMD_RECV: u32 = 0x15;

pub const CONNECT_FLAG_PEER: u64 = 1 << 0;
pub const CONNECT_FLAG_MONITOR: u64 = 1 << 1;
pub const CONNECT_FLAG_QUERY: u64 = 1 << 2;
pub const CONNECT_FLAG_RESET: u64 = 1 << 3;
pub const CONNECT_FLAG_MASK: u64 =
    CONNECT_FLAG_PEER | CONNECT_FLAG_MONITOR | CONNECT_FLAG_QUERY | CONNECT_FLAG_RESET;

pub const SEND_FLAG_IGNORE_UNKNOWN: u64 = 1 << 0;
pub const SEND_FLAG_CONVEY_ERRORS: u64 = 1 << 1;
pub const SEND_FLAG_MASK: u64 = SEND_FLAG_IGNORE_UNKNOWN | SEND_FLAG_CONVEY_ERRORS;

pub const RECV_FLAG_PEEK: u64 = 1 << 0;
pub const RECV_FLAG_MASK: u64 = RECV_FLAG_PEEK;

// Copy-out offsets within the fixed parts, for single-field writebacks.
pub const CONNECT_POOL_SIZE_OFFSET: usize = HEADER_LEN;
pub const RESOLVE_ID_OFFSET: usize = HEADER_LEN;
pub const RECV_OUTPUT_OFFSET: usize = HEADER_LEN;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DeserializeError {
    #[error("not enough data: expected at least {expected} bytes, got {got}")]
    NotEnoughData { expected: usize, got: usize },
    #[error("declared size {declared} smaller than fixed part {fixed}")]
    SizeTooSmall { declared: u32, fixed: usize },
    #[error("declared size {declared} overruns the supplied buffer of {len} bytes")]
    SizeOverrun { declared: u32, len: usize },
    #[error("declared size {declared} larger than the {MAX_CMD_SIZE} cap")]
    SizeTooLarge { declared: u32 },
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SerializeError {
    #[error("not enough space in buffer")]
    NoSpaceInBuffer,
}

/// Reads the leading `size` field without decoding the rest.
pub fn declared_size(buf: &[u8]) -> Result<u32, DeserializeError> {
    if buf.len() < SIZE_LEN {
        return Err(DeserializeError::NotEnoughData {
            expected: SIZE_LEN,
            got: buf.len(),
        });
    }
    let size = LE::read_u32(&buf[0..SIZE_LEN]);
    if size as usize > MAX_CMD_SIZE {
        return Err(DeserializeError::SizeTooLarge { declared: size });
    }
    Ok(size)
}

fn check_fixed(buf: &[u8], fixed: usize) -> Result<(u32, u64), DeserializeError> {
    let size = declared_size(buf)?;
    if (size as usize) < fixed {
        return Err(DeserializeError::SizeTooSmall {
            declared: size,
            fixed,
        });
    }
    if size as usize > buf.len() {
        return Err(DeserializeError::SizeOverrun {
            declared: size,
            len: buf.len(),
        });
    }
    let flags = LE::read_u64(&buf[SIZE_LEN..HEADER_LEN]);
    Ok((size, flags))
}

fn put_header(out: &mut [u8], size: u32, flags: u64) {
    LE::write_u32(&mut out[0..SIZE_LEN], size);
    LE::write_u64(&mut out[SIZE_LEN..HEADER_LEN], flags);
}

/// CONNECT parameter block. `names` is the trailing concatenation of
/// NUL-terminated strings, possibly empty.
#[derive(Debug, PartialEq, Eq)]
pub struct CmdConnect<'a> {
    pub flags: u64,
    pub pool_size: u64,
    pub names: &'a [u8],
}

impl<'a> CmdConnect<'a> {
    pub const FIXED_SIZE: usize = HEADER_LEN + 8;

    pub fn deserialize(buf: &'a [u8]) -> Result<Self, DeserializeError> {
        let (size, flags) = check_fixed(buf, Self::FIXED_SIZE)?;
        let pool_size = LE::read_u64(&buf[HEADER_LEN..Self::FIXED_SIZE]);
        Ok(CmdConnect {
            flags,
            pool_size,
            names: &buf[Self::FIXED_SIZE..size as usize],
        })
    }

    pub fn serialized_len(&self) -> usize {
        Self::FIXED_SIZE + self.names.len()
    }

    pub fn serialize(&self, out: &mut [u8]) -> Result<usize, SerializeError> {
        let len = self.serialized_len();
        if out.len() < len {
            return Err(SerializeError::NoSpaceInBuffer);
        }
        put_header(out, len as u32, self.flags);
        LE::write_u64(&mut out[HEADER_LEN..Self::FIXED_SIZE], self.pool_size);
        out[Self::FIXED_SIZE..len].copy_from_slice(self.names);
        Ok(len)
    }
}

/// RESOLVE parameter block. `id` is written back by the engine on success.
#[derive(Debug, PartialEq, Eq)]
pub struct CmdResolve<'a> {
    pub flags: u64,
    pub id: u64,
    pub name: &'a [u8],
}

impl<'a> CmdResolve<'a> {
    pub const FIXED_SIZE: usize = HEADER_LEN + 8;

    pub fn deserialize(buf: &'a [u8]) -> Result<Self, DeserializeError> {
        let (size, flags) = check_fixed(buf, Self::FIXED_SIZE)?;
        let id = LE::read_u64(&buf[HEADER_LEN..Self::FIXED_SIZE]);
        Ok(CmdResolve {
            flags,
            id,
            name: &buf[Self::FIXED_SIZE..size as usize],
        })
    }

    pub fn serialized_len(&self) -> usize {
        Self::FIXED_SIZE + self.name.len()
    }

    pub fn serialize(&self, out: &mut [u8]) -> Result<usize, SerializeError> {
        let len = self.serialized_len();
        if out.len() < len {
            return Err(SerializeError::NoSpaceInBuffer);
        }
        put_header(out, len as u32, self.flags);
        LE::write_u64(&mut out[HEADER_LEN..Self::FIXED_SIZE], self.id);
        out[Self::FIXED_SIZE..len].copy_from_slice(self.name);
        Ok(len)
    }
}

/// SEND parameter block. All pointers are caller-memory addresses.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CmdSend {
    pub flags: u64,
    pub ptr_destinations: u64,
    pub n_destinations: u64,
    pub ptr_vecs: u64,
    pub n_vecs: u64,
    pub ptr_handles: u64,
    pub n_handles: u64,
    pub ptr_fds: u64,
    pub n_fds: u64,
}

impl CmdSend {
    pub const FIXED_SIZE: usize = HEADER_LEN + 8 * 8;

    pub fn deserialize(buf: &[u8]) -> Result<Self, DeserializeError> {
        let (_, flags) = check_fixed(buf, Self::FIXED_SIZE)?;
        let f = |i: usize| LE::read_u64(&buf[HEADER_LEN + i * 8..HEADER_LEN + (i + 1) * 8]);
        Ok(CmdSend {
            flags,
            ptr_destinations: f(0),
            n_destinations: f(1),
            ptr_vecs: f(2),
            n_vecs: f(3),
            ptr_handles: f(4),
            n_handles: f(5),
            ptr_fds: f(6),
            n_fds: f(7),
        })
    }

    pub fn serialize(&self, out: &mut [u8]) -> Result<usize, SerializeError> {
        if out.len() < Self::FIXED_SIZE {
            return Err(SerializeError::NoSpaceInBuffer);
        }
        put_header(out, Self::FIXED_SIZE as u32, self.flags);
        let fields = [
            self.ptr_destinations,
            self.n_destinations,
            self.ptr_vecs,
            self.n_vecs,
            self.ptr_handles,
            self.n_handles,
            self.ptr_fds,
            self.n_fds,
        ];
        for (i, v) in fields.iter().enumerate() {
            LE::write_u64(&mut out[HEADER_LEN + i * 8..HEADER_LEN + (i + 1) * 8], *v);
        }
        Ok(Self::FIXED_SIZE)
    }
}

/// RECV parameter block. The three trailing fields are outputs and must be
/// zero on input; the engine enforces that.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CmdRecv {
    pub flags: u64,
    pub msg_offset: u64,
    pub msg_size: u64,
    pub msg_fds: u64,
}

impl CmdRecv {
    pub const FIXED_SIZE: usize = HEADER_LEN + 8 * 3;

    pub fn deserialize(buf: &[u8]) -> Result<Self, DeserializeError> {
        let (_, flags) = check_fixed(buf, Self::FIXED_SIZE)?;
        let f = |i: usize| LE::read_u64(&buf[HEADER_LEN + i * 8..HEADER_LEN + (i + 1) * 8]);
        Ok(CmdRecv {
            flags,
            msg_offset: f(0),
            msg_size: f(1),
            msg_fds: f(2),
        })
    }

    pub fn serialize(&self, out: &mut [u8]) -> Result<usize, SerializeError> {
        if out.len() < Self::FIXED_SIZE {
            return Err(SerializeError::NoSpaceInBuffer);
        }
        put_header(out, Self::FIXED_SIZE as u32, self.flags);
        for (i, v) in [self.msg_offset, self.msg_size, self.msg_fds]
            .iter()
            .enumerate()
        {
            LE::write_u64(&mut out[HEADER_LEN + i * 8..HEADER_LEN + (i + 1) * 8], *v);
        }
        Ok(Self::FIXED_SIZE)
    }

    /// Serializes the output fields alone, for the engine's copy-out at
    /// [`RECV_OUTPUT_OFFSET`].
    pub fn serialize_output(&self) -> [u8; 24] {
        let mut out = [0u8; 24];
        LE::write_u64(&mut out[0..8], self.msg_offset);
        LE::write_u64(&mut out[8..16], self.msg_size);
        LE::write_u64(&mut out[16..24], self.msg_fds);
        out
    }
}

/// One iovec-style entry of the send payload array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendVec {
    pub ptr: u64,
    pub len: u64,
}

impl SendVec {
    pub fn deserialize(buf: &[u8]) -> Result<Self, DeserializeError> {
        if buf.len() < VEC_ENTRY_SIZE {
            return Err(DeserializeError::NotEnoughData {
                expected: VEC_ENTRY_SIZE,
                got: buf.len(),
            });
        }
        Ok(SendVec {
            ptr: LE::read_u64(&buf[0..8]),
            len: LE::read_u64(&buf[8..16]),
        })
    }

    pub fn serialize(&self, out: &mut [u8]) -> Result<usize, SerializeError> {
        if out.len() < VEC_ENTRY_SIZE {
            return Err(SerializeError::NoSpaceInBuffer);
        }
        LE::write_u64(&mut out[0..8], self.ptr);
        LE::write_u64(&mut out[8..16], self.len);
        Ok(VEC_ENTRY_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_roundtrip() {
        let cmd = CmdConnect {
            flags: CONNECT_FLAG_PEER | CONNECT_FLAG_QUERY,
            pool_size: 4096,
            names: b"a\0b\0",
        };
        let mut buf = [0u8; 64];
        let len = cmd.serialize(&mut buf).unwrap();
        assert_eq!(len, CmdConnect::FIXED_SIZE + 4);
        let back = CmdConnect::deserialize(&buf[..len]).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn test_connect_trailing_bytes_bounded_by_declared_size() {
        let cmd = CmdConnect {
            flags: CONNECT_FLAG_PEER,
            pool_size: 4096,
            names: b"x\0",
        };
        let mut buf = [0u8; 64];
        let len = cmd.serialize(&mut buf).unwrap();
        // Extra garbage beyond the declared size must not leak into names.
        buf[len] = 0xff;
        let back = CmdConnect::deserialize(&buf[..len + 1]).unwrap();
        assert_eq!(back.names, b"x\0");
    }

    #[test]
    fn test_size_too_small() {
        let mut buf = [0u8; 64];
        LE::write_u32(&mut buf[0..4], 4);
        assert_eq!(
            CmdConnect::deserialize(&buf),
            Err(DeserializeError::SizeTooSmall {
                declared: 4,
                fixed: CmdConnect::FIXED_SIZE
            })
        );
    }

    #[test]
    fn test_size_overrun() {
        let mut buf = [0u8; 24];
        LE::write_u32(&mut buf[0..4], 200);
        assert_eq!(
            CmdConnect::deserialize(&buf),
            Err(DeserializeError::SizeOverrun {
                declared: 200,
                len: 24
            })
        );
    }

    #[test]
    fn test_send_roundtrip() {
        let cmd = CmdSend {
            flags: SEND_FLAG_IGNORE_UNKNOWN,
            ptr_destinations: 0x1000,
            n_destinations: 2,
            ptr_vecs: 0x2000,
            n_vecs: 1,
            ptr_handles: 0,
            n_handles: 0,
            ptr_fds: 0x3000,
            n_fds: 3,
        };
        let mut buf = [0u8; CmdSend::FIXED_SIZE];
        cmd.serialize(&mut buf).unwrap();
        assert_eq!(CmdSend::deserialize(&buf).unwrap(), cmd);
    }

    #[test]
    fn test_recv_roundtrip_and_output() {
        let cmd = CmdRecv {
            flags: RECV_FLAG_PEEK,
            ..Default::default()
        };
        let mut buf = [0u8; CmdRecv::FIXED_SIZE];
        cmd.serialize(&mut buf).unwrap();
        assert_eq!(CmdRecv::deserialize(&buf).unwrap(), cmd);

        let out = CmdRecv {
            flags: 0,
            msg_offset: 128,
            msg_size: 64,
            msg_fds: 2,
        }
        .serialize_output();
        assert_eq!(LE::read_u64(&out[0..8]), 128);
        assert_eq!(LE::read_u64(&out[8..16]), 64);
        assert_eq!(LE::read_u64(&out[16..24]), 2);
    }

    #[test]
    fn test_resolve_roundtrip() {
        let cmd = CmdResolve {
            flags: 0,
            id: 0,
            name: b"org.bus.svc\0",
        };
        let mut buf = [0u8; 64];
        let len = cmd.serialize(&mut buf).unwrap();
        assert_eq!(CmdResolve::deserialize(&buf[..len]).unwrap(), cmd);
    }

    #[test]
    fn test_declared_size_cap() {
        let mut buf = [0u8; 8];
        LE::write_u32(&mut buf[0..4], (MAX_CMD_SIZE + 1) as u32);
        assert!(matches!(
            declared_size(&buf),
            Err(DeserializeError::SizeTooLarge { .. })
        ));
    }
}
