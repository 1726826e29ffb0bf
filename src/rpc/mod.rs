//! Length-prefixed, tagged request/response framing over a byte stream.
//!
//! Frames are a fixed 32-byte little-endian header followed by exactly
//! `size` payload bytes. The 64-bit tag is chosen by the request sender
//! and echoed by the response, which is what lets many requests share one
//! connection with arbitrary completion order (see [`ooo`]).
//!
//! [`Stub`] is the client endpoint, [`Skeleton`] the server dispatcher.

use crate::error::{Error, Result};

pub mod ooo;
mod skeleton;
mod stub;

pub use skeleton::{BufAllocator, HeapAllocator, Skeleton};
pub use stub::Stub;

/// Frame marker; anything else at a frame boundary means the peer is not
/// speaking this protocol (or the stream is corrupt).
pub const MAGIC: u64 = 0x4962_b4d2_4caa_439e;

/// Protocol version carried in every header.
pub const VERSION: u32 = 0;

/// Encoded header size in bytes.
pub const HEADER_SIZE: usize = 32;

////////////////////////////////////////////////////////////////////////////////
// FunctionId
////////////////////////////////////////////////////////////////////////////////

/// Identity of a remote operation: interface id + function id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId {
    pub iid: u32,
    pub fid: u32,
}

impl FunctionId {
    pub const fn new(iid: u32, fid: u32) -> Self {
        FunctionId { iid, fid }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Header
////////////////////////////////////////////////////////////////////////////////

/// A decoded frame header. The magic and version are implicit: encoding
/// always writes them, decoding rejects mismatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Payload size in bytes; zero is a valid, empty payload.
    pub size: u32,
    pub function: FunctionId,
    /// Chosen by the request sender to demultiplex responses.
    pub tag: u64,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&MAGIC.to_le_bytes());
        buf[8..12].copy_from_slice(&VERSION.to_le_bytes());
        buf[12..16].copy_from_slice(&self.size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.function.iid.to_le_bytes());
        buf[20..24].copy_from_slice(&self.function.fid.to_le_bytes());
        buf[24..32].copy_from_slice(&self.tag.to_le_bytes());
        buf
    }

    /// Decode and validate a header. A magic or version mismatch cannot be
    /// resynchronized and reports [`Error::ConnectionReset`]; the caller
    /// is expected to shut the stream down.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Header> {
        let magic = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        if magic != MAGIC {
            log::error!("frame magic mismatch: {:#x}", magic);
            return Err(Error::ConnectionReset);
        }
        let version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        if version != VERSION {
            log::error!("frame version mismatch: {}", version);
            return Err(Error::ConnectionReset);
        }
        Ok(Header {
            size: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            function: FunctionId {
                iid: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
                fid: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            },
            tag: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn header_layout_is_bit_exact() {
        let header = Header {
            size: 0x11223344,
            function: FunctionId::new(9527, 1),
            tag: 0xDEAD_BEEF_CAFE_F00D,
        };
        let encoded = header.encode();
        assert_eq!(encoded.len(), 32);
        // magic, little endian
        assert_eq!(
            &encoded[0..8],
            &[0x9e, 0x43, 0xaa, 0x4c, 0xd2, 0xb4, 0x62, 0x49]
        );
        // version 0
        assert_eq!(&encoded[8..12], &[0, 0, 0, 0]);
        // payload size
        assert_eq!(&encoded[12..16], &[0x44, 0x33, 0x22, 0x11]);
        // function id {iid, fid}
        assert_eq!(&encoded[16..20], &9527u32.to_le_bytes());
        assert_eq!(&encoded[20..24], &1u32.to_le_bytes());
        // tag
        assert_eq!(&encoded[24..32], &0xDEAD_BEEF_CAFE_F00Du64.to_le_bytes());

        assert_eq!(Header::decode(&encoded).unwrap(), header);
    }

    #[test]
    fn zero_size_frame_is_valid() {
        let header = Header {
            size: 0,
            function: FunctionId::new(1, 2),
            tag: 3,
        };
        let decoded = Header::decode(&header.encode()).unwrap();
        assert_eq!(decoded.size, 0);
    }

    #[test]
    fn magic_mismatch_is_fatal() {
        let header = Header {
            size: 0,
            function: FunctionId::new(1, 2),
            tag: 3,
        };
        let mut encoded = header.encode();
        encoded[0] ^= 0xFF;
        assert!(matches!(
            Header::decode(&encoded),
            Err(Error::ConnectionReset)
        ));
    }

    #[test]
    fn version_mismatch_is_fatal() {
        let header = Header {
            size: 0,
            function: FunctionId::new(1, 2),
            tag: 3,
        };
        let mut encoded = header.encode();
        encoded[8] = 7;
        assert!(matches!(
            Header::decode(&encoded),
            Err(Error::ConnectionReset)
        ));
    }
}
