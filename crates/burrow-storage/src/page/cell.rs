//! Cell codec: the variable-length records packed after the chunk header.
//!
//! A cell starts with a descriptor byte carrying the cell type and three
//! presence flags; optional fields follow in a fixed order. Lengths and
//! repeat counts are LEB128 varints.
//!
//! ```text
//! descriptor: bits 0-2  cell type
//!             0x08      PREFIX  - key cells: prefix-length byte follows
//!             0x10      RLE     - value/delete/overflow cells: repeat-count
//!                                 varint follows (absent means 1)
//!             0x20      LEN     - key/value cells: data-length varint
//!                                 follows (absent means zero-length)
//!
//! KEY        desc [prefix] [len] suffix-bytes
//! KEY_OVFL   desc [rle] addr:u32 size:u32
//! VALUE      desc [rle] [len] data-bytes
//! VALUE_OVFL desc [rle] addr:u32 size:u32
//! DEL        desc [rle]
//! OFF        desc addr:u32 size:u32
//! OFF_RECNO  desc addr:u32 size:u32 recno:u64
//! ```
//!
//! A zero-length key cell with no prefix is the bare descriptor byte; the
//! row-leaf trailing cell depends on that.

use burrow_common::{BlockAddr, BurrowError, BurrowResult};
use bytes::BufMut;

use crate::block::BlockRef;

/// Cell type discriminants (descriptor bits 0-2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellType {
    /// Key cell: prefix length plus suffix bytes.
    Key = 0,
    /// Key stored in an overflow block.
    KeyOvfl = 1,
    /// Value cell: optional repeat count plus data bytes.
    Value = 2,
    /// Value stored in an overflow block.
    ValueOvfl = 3,
    /// Deleted-record run (column stores).
    Del = 4,
    /// Child block reference (row-store internal pages).
    Off = 5,
    /// Child block reference plus starting recno (column internal pages).
    OffRecno = 6,
}

impl CellType {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Key),
            1 => Some(Self::KeyOvfl),
            2 => Some(Self::Value),
            3 => Some(Self::ValueOvfl),
            4 => Some(Self::Del),
            5 => Some(Self::Off),
            6 => Some(Self::OffRecno),
            _ => None,
        }
    }
}

const TYPE_MASK: u8 = 0x07;
const FLAG_PREFIX: u8 = 0x08;
const FLAG_RLE: u8 = 0x10;
const FLAG_LEN: u8 = 0x20;

/// Maximum encoded size of a cell head (descriptor plus fixed fields).
pub const MAX_CELL_HEAD: usize = 24;

/// An encoded cell head: everything before the payload bytes.
///
/// Key and value payloads are copied onto the page separately so large data
/// is never staged twice.
#[derive(Debug, Clone, Copy)]
pub struct CellHead {
    buf: [u8; MAX_CELL_HEAD],
    len: u8,
}

impl Default for CellHead {
    fn default() -> Self {
        Self::new()
    }
}

impl CellHead {
    fn new() -> Self {
        Self {
            buf: [0; MAX_CELL_HEAD],
            len: 0,
        }
    }

    fn push(&mut self, b: u8) {
        self.buf[self.len as usize] = b;
        self.len += 1;
    }

    fn put_varint(&mut self, mut v: u64) {
        loop {
            let mut b = (v & 0x7F) as u8;
            v >>= 7;
            if v != 0 {
                b |= 0x80;
            }
            self.push(b);
            if v == 0 {
                break;
            }
        }
    }

    fn put_u32(&mut self, v: u32) {
        let mut rest = &mut self.buf[self.len as usize..];
        rest.put_u32_le(v);
        self.len += 4;
    }

    fn put_u64(&mut self, v: u64) {
        let mut rest = &mut self.buf[self.len as usize..];
        rest.put_u64_le(v);
        self.len += 8;
    }

    /// The encoded bytes.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }

    /// Encoded length in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// True if nothing has been encoded.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Packs a key cell head for `suffix_len` payload bytes with `prefix`
/// leading bytes shared with the previous key.
#[must_use]
pub fn pack_key(prefix: u8, suffix_len: usize) -> CellHead {
    let mut head = CellHead::new();
    let mut desc = CellType::Key as u8;
    if prefix != 0 {
        desc |= FLAG_PREFIX;
    }
    if suffix_len != 0 {
        desc |= FLAG_LEN;
    }
    head.push(desc);
    if prefix != 0 {
        head.push(prefix);
    }
    if suffix_len != 0 {
        head.put_varint(suffix_len as u64);
    }
    head
}

/// Packs a value cell head for `data_len` payload bytes repeated `rle`
/// times (`rle` 0 and 1 both mean a single record).
#[must_use]
pub fn pack_value(rle: u64, data_len: usize) -> CellHead {
    let mut head = CellHead::new();
    let mut desc = CellType::Value as u8;
    if rle > 1 {
        desc |= FLAG_RLE;
    }
    if data_len != 0 {
        desc |= FLAG_LEN;
    }
    head.push(desc);
    if rle > 1 {
        head.put_varint(rle);
    }
    if data_len != 0 {
        head.put_varint(data_len as u64);
    }
    head
}

/// Packs a deleted-record run.
#[must_use]
pub fn pack_del(rle: u64) -> CellHead {
    let mut head = CellHead::new();
    let mut desc = CellType::Del as u8;
    if rle > 1 {
        desc |= FLAG_RLE;
    }
    head.push(desc);
    if rle > 1 {
        head.put_varint(rle);
    }
    head
}

/// Packs an overflow reference cell (complete; no payload follows).
///
/// # Panics
///
/// Panics if `cell_type` is not `KeyOvfl` or `ValueOvfl`.
#[must_use]
pub fn pack_ovfl(cell_type: CellType, rle: u64, block: BlockRef) -> CellHead {
    assert!(
        matches!(cell_type, CellType::KeyOvfl | CellType::ValueOvfl),
        "not an overflow cell type"
    );
    let mut head = CellHead::new();
    let mut desc = cell_type as u8;
    if rle > 1 {
        desc |= FLAG_RLE;
    }
    head.push(desc);
    if rle > 1 {
        head.put_varint(rle);
    }
    head.put_u32(block.addr.as_u32());
    head.put_u32(block.size);
    head
}

/// Packs a row-store child reference (complete; no payload follows).
#[must_use]
pub fn pack_off(block: BlockRef) -> CellHead {
    let mut head = CellHead::new();
    head.push(CellType::Off as u8);
    head.put_u32(block.addr.as_u32());
    head.put_u32(block.size);
    head
}

/// Packs a column-store child reference (complete; no payload follows).
#[must_use]
pub fn pack_off_recno(block: BlockRef, recno: u64) -> CellHead {
    let mut head = CellHead::new();
    head.push(CellType::OffRecno as u8);
    head.put_u32(block.addr.as_u32());
    head.put_u32(block.size);
    head.put_u64(recno);
    head
}

/// The single-byte trailing zero-length key cell written after the last
/// entry of every row-leaf chunk.
#[must_use]
pub fn trailing_key_byte() -> u8 {
    CellType::Key as u8
}

/// A decoded cell.
///
/// `data_start..data_start + data_len` locates the payload inside the image
/// the cell was unpacked from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnpackedCell {
    /// Cell type.
    pub cell_type: CellType,
    /// Prefix length (key cells).
    pub prefix: u8,
    /// Repeat count (1 when absent).
    pub rle: u64,
    /// Payload offset within the source image.
    pub data_start: usize,
    /// Payload length in bytes.
    pub data_len: usize,
    /// Referenced block (overflow and child cells).
    pub block: BlockRef,
    /// Starting recno (column child cells).
    pub recno: u64,
    /// Total encoded cell length, head plus payload.
    pub len: usize,
}

impl UnpackedCell {
    /// Returns the payload slice within `image`.
    #[must_use]
    pub fn data<'a>(&self, image: &'a [u8]) -> &'a [u8] {
        &image[self.data_start..self.data_start + self.data_len]
    }
}

fn get_varint(buf: &[u8], pos: &mut usize) -> BurrowResult<u64> {
    let mut v: u64 = 0;
    let mut shift = 0u32;
    loop {
        let b = *buf.get(*pos).ok_or_else(short)?;
        *pos += 1;
        v |= u64::from(b & 0x7F) << shift;
        if b & 0x80 == 0 {
            return Ok(v);
        }
        shift += 7;
        if shift >= 64 {
            return Err(BurrowError::Corruption {
                message: "varint overflow".to_string(),
            });
        }
    }
}

fn get_u32(buf: &[u8], pos: &mut usize) -> BurrowResult<u32> {
    let bytes: [u8; 4] = buf
        .get(*pos..*pos + 4)
        .ok_or_else(short)?
        .try_into()
        .expect("slice length checked");
    *pos += 4;
    Ok(u32::from_le_bytes(bytes))
}

fn get_u64(buf: &[u8], pos: &mut usize) -> BurrowResult<u64> {
    let bytes: [u8; 8] = buf
        .get(*pos..*pos + 8)
        .ok_or_else(short)?
        .try_into()
        .expect("slice length checked");
    *pos += 8;
    Ok(u64::from_le_bytes(bytes))
}

fn short() -> BurrowError {
    BurrowError::Corruption {
        message: "truncated cell".to_string(),
    }
}

/// Decodes the cell starting at `offset` in `image`.
pub fn unpack(image: &[u8], offset: usize) -> BurrowResult<UnpackedCell> {
    let mut pos = offset;
    let desc = *image.get(pos).ok_or_else(short)?;
    pos += 1;

    let cell_type = CellType::from_u8(desc & TYPE_MASK).ok_or_else(|| BurrowError::Corruption {
        message: format!("illegal cell type {}", desc & TYPE_MASK),
    })?;

    let mut cell = UnpackedCell {
        cell_type,
        prefix: 0,
        rle: 1,
        data_start: 0,
        data_len: 0,
        block: BlockRef::INVALID,
        recno: 0,
        len: 0,
    };

    if desc & FLAG_PREFIX != 0 {
        if cell_type != CellType::Key {
            return Err(BurrowError::Corruption {
                message: "prefix flag on non-key cell".to_string(),
            });
        }
        cell.prefix = *image.get(pos).ok_or_else(short)?;
        pos += 1;
    }
    if desc & FLAG_RLE != 0 {
        cell.rle = get_varint(image, &mut pos)?;
        if cell.rle == 0 {
            return Err(BurrowError::Corruption {
                message: "zero repeat count".to_string(),
            });
        }
    }

    match cell_type {
        CellType::Key | CellType::Value => {
            if desc & FLAG_LEN != 0 {
                cell.data_len = get_varint(image, &mut pos)? as usize;
            }
            cell.data_start = pos;
            if image.len() < pos + cell.data_len {
                return Err(short());
            }
            pos += cell.data_len;
        }
        CellType::KeyOvfl | CellType::ValueOvfl | CellType::Off => {
            let addr = get_u32(image, &mut pos)?;
            let size = get_u32(image, &mut pos)?;
            cell.block = BlockRef::new(BlockAddr::new(addr), size);
        }
        CellType::OffRecno => {
            let addr = get_u32(image, &mut pos)?;
            let size = get_u32(image, &mut pos)?;
            cell.block = BlockRef::new(BlockAddr::new(addr), size);
            cell.recno = get_u64(image, &mut pos)?;
        }
        CellType::Del => {}
    }

    cell.len = pos - offset;
    Ok(cell)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack_with_payload(head: CellHead, payload: &[u8]) -> Vec<u8> {
        let mut buf = head.as_slice().to_vec();
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn test_key_cell_round_trip() {
        let img = pack_with_payload(pack_key(3, 5), b"abcde");
        let cell = unpack(&img, 0).unwrap();
        assert_eq!(cell.cell_type, CellType::Key);
        assert_eq!(cell.prefix, 3);
        assert_eq!(cell.data(&img), b"abcde");
        assert_eq!(cell.len, img.len());
    }

    #[test]
    fn test_zero_length_key_is_one_byte() {
        let head = pack_key(0, 0);
        assert_eq!(head.len(), 1);
        let img = head.as_slice().to_vec();
        let cell = unpack(&img, 0).unwrap();
        assert_eq!(cell.cell_type, CellType::Key);
        assert_eq!(cell.data_len, 0);
        assert_eq!(cell.len, 1);
        assert_eq!(head.as_slice()[0], trailing_key_byte());
    }

    #[test]
    fn test_value_cell_round_trip() {
        let img = pack_with_payload(pack_value(7, 4), b"data");
        let cell = unpack(&img, 0).unwrap();
        assert_eq!(cell.cell_type, CellType::Value);
        assert_eq!(cell.rle, 7);
        assert_eq!(cell.data(&img), b"data");
    }

    #[test]
    fn test_value_rle_one_omitted() {
        let a = pack_value(1, 4);
        let b = pack_value(0, 4);
        assert_eq!(a.as_slice(), b.as_slice());
        let img = pack_with_payload(a, b"data");
        assert_eq!(unpack(&img, 0).unwrap().rle, 1);
    }

    #[test]
    fn test_del_cell_round_trip() {
        let img = pack_del(500).as_slice().to_vec();
        let cell = unpack(&img, 0).unwrap();
        assert_eq!(cell.cell_type, CellType::Del);
        assert_eq!(cell.rle, 500);
        assert_eq!(cell.data_len, 0);
    }

    #[test]
    fn test_ovfl_cells_round_trip() {
        let block = BlockRef::new(BlockAddr::new(9), 4096);
        for (t, rle) in [(CellType::KeyOvfl, 1), (CellType::ValueOvfl, 12)] {
            let img = pack_ovfl(t, rle, block).as_slice().to_vec();
            let cell = unpack(&img, 0).unwrap();
            assert_eq!(cell.cell_type, t);
            assert_eq!(cell.rle, rle);
            assert_eq!(cell.block, block);
        }
    }

    #[test]
    fn test_off_cells_round_trip() {
        let block = BlockRef::new(BlockAddr::new(3), 777);
        let img = pack_off(block).as_slice().to_vec();
        let cell = unpack(&img, 0).unwrap();
        assert_eq!(cell.cell_type, CellType::Off);
        assert_eq!(cell.block, block);

        let img = pack_off_recno(block, 123_456).as_slice().to_vec();
        let cell = unpack(&img, 0).unwrap();
        assert_eq!(cell.cell_type, CellType::OffRecno);
        assert_eq!(cell.block, block);
        assert_eq!(cell.recno, 123_456);
        assert_eq!(cell.len, 17);
    }

    #[test]
    fn test_unpack_rejects_truncation() {
        let img = pack_with_payload(pack_value(1, 10), b"short");
        assert!(unpack(&img, 0).is_err());
        assert!(unpack(&[], 0).is_err());
    }

    #[test]
    fn test_large_varint() {
        let img = pack_del(u64::MAX / 2).as_slice().to_vec();
        assert_eq!(unpack(&img, 0).unwrap().rle, u64::MAX / 2);
    }
}
