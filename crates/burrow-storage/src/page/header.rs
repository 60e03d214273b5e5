//! Disk chunk header.
//!
//! Every chunk written by the reconciler begins with this fixed-size header.
//!
//! # Layout (20 bytes, little-endian)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//!   0       2   magic (0x4257 = "BW")
//!   2       1   page_type
//!   3       1   reserved
//!   4       4   entries (cells on the chunk, or data length for overflow)
//!   8       8   starting recno (column stores; zero for row stores)
//!  16       4   data_len (bytes of cell data following the header)
//! ```

use burrow_common::constants::CHUNK_MAGIC;
use burrow_common::{BurrowError, BurrowResult};
use bytes::{Buf, BufMut};

use super::types::PageType;

/// Size of the chunk header in bytes.
pub const CHUNK_HEADER_SIZE: usize = 20;

/// The fixed header at the front of every written chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Type of the page this chunk encodes.
    pub page_type: PageType,
    /// Number of cells in the chunk; for overflow chunks, the item length.
    pub entries: u32,
    /// Starting record number (column stores; zero for row stores).
    pub recno: u64,
    /// Bytes of cell data following the header.
    pub data_len: u32,
}

impl ChunkHeader {
    /// Creates a header for a page type with all counters zeroed.
    #[must_use]
    pub fn new(page_type: PageType) -> Self {
        Self {
            page_type,
            entries: 0,
            recno: 0,
            data_len: 0,
        }
    }

    /// Serializes the header into the first `CHUNK_HEADER_SIZE` bytes of
    /// `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is smaller than `CHUNK_HEADER_SIZE`.
    pub fn write_to(&self, buf: &mut [u8]) {
        assert!(
            buf.len() >= CHUNK_HEADER_SIZE,
            "buffer too small for chunk header"
        );
        let mut b = &mut buf[..CHUNK_HEADER_SIZE];
        b.put_u16_le(CHUNK_MAGIC);
        b.put_u8(self.page_type.as_u8());
        b.put_u8(0); // reserved
        b.put_u32_le(self.entries);
        b.put_u64_le(self.recno);
        b.put_u32_le(self.data_len);
    }

    /// Deserializes a header from the front of `buf`.
    pub fn read_from(buf: &[u8]) -> BurrowResult<Self> {
        if buf.len() < CHUNK_HEADER_SIZE {
            return Err(BurrowError::Corruption {
                message: "short chunk header".to_string(),
            });
        }
        let mut b = &buf[..CHUNK_HEADER_SIZE];
        let magic = b.get_u16_le();
        if magic != CHUNK_MAGIC {
            return Err(BurrowError::Corruption {
                message: format!("bad chunk magic 0x{magic:04X}"),
            });
        }
        let type_byte = b.get_u8();
        let page_type = PageType::from_u8(type_byte).ok_or_else(|| BurrowError::Corruption {
            message: format!("illegal page type {type_byte}"),
        })?;
        let _reserved = b.get_u8();
        let entries = b.get_u32_le();
        let recno = b.get_u64_le();
        let data_len = b.get_u32_le();
        Ok(Self {
            page_type,
            entries,
            recno,
            data_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let hdr = ChunkHeader {
            page_type: PageType::ColVar,
            entries: 42,
            recno: 1_000_000,
            data_len: 512,
        };
        let mut buf = [0u8; CHUNK_HEADER_SIZE];
        hdr.write_to(&mut buf);
        assert_eq!(ChunkHeader::read_from(&buf).unwrap(), hdr);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut buf = [0u8; CHUNK_HEADER_SIZE];
        ChunkHeader::new(PageType::RowLeaf).write_to(&mut buf);
        buf[0] ^= 0xFF;
        assert!(ChunkHeader::read_from(&buf).is_err());
    }

    #[test]
    fn test_rejects_short_buffer() {
        assert!(ChunkHeader::read_from(&[0u8; 4]).is_err());
    }
}
