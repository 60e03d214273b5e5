//! Reconciliation context and the split machine.
//!
//! Building a disk image is cheap until the image outgrows the maximum page
//! size; restarting at that point would throw away overflow writes and
//! compressed data already produced. Instead, the context records a
//! boundary every time the image approaches a split-size window. If the
//! maximum is eventually crossed, the saved boundaries are replayed to
//! write the finished chunks and the unwritten remnant slides to the front
//! of the working buffer; if the page fits after all, the boundaries
//! collapse into a single chunk.

use burrow_common::{BurrowError, BurrowResult};

use crate::block::BlockRef;
use crate::page::cell::{self, CellHead, CellType};
use crate::page::header::{ChunkHeader, CHUNK_HEADER_SIZE};
use crate::page::mem::read_overflow;
use crate::page::types::PageType;

use super::RecEnv;

/// Where the split machine is within one reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SplitState {
    /// Tracking split-size checkpoints inside the maximum page size.
    Boundary,
    /// Past the last full split-size window; the next crossing is the
    /// maximum page size itself.
    Max,
    /// No boundary checks: chunks are written as they fill.
    TrackingOff,
}

/// A potential split point recorded while building the image.
///
/// `start` is meaningful only while the working buffer is intact; once a
/// chunk is written, only `recno`, `entries`, `key`, and `block` remain
/// meaningful.
#[derive(Debug, Clone, Default)]
pub(crate) struct Boundary {
    /// Offset of the chunk's first cell byte in the working buffer.
    pub start: usize,
    /// Starting record number of the chunk (column stores).
    pub recno: u64,
    /// Records in the chunk.
    pub entries: u32,
    /// Promoted first key of the chunk (row stores).
    pub key: Vec<u8>,
    /// Written address and size, once the chunk is on disk.
    pub block: Option<BlockRef>,
}

/// Growth quantum for the boundary list.
const BND_GROW: usize = 20;

/// A key or value cell being assembled: encoded head plus payload bytes.
#[derive(Debug, Default)]
pub(crate) struct KvCell {
    pub head: CellHead,
    pub data: Vec<u8>,
    /// head.len() + data.len(); zero means "no cell".
    pub len: usize,
}

/// Selects which of the two cell slots an operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kv {
    Key,
    Val,
}

/// Per-table reconciliation context, created lazily on the first
/// reconciliation and reused for every page of the table.
#[derive(Debug)]
pub struct Reconciler {
    /// Type of the page being reconciled.
    pub(crate) page_type: PageType,
    /// Working disk-image buffer, always `page_size` bytes long.
    pub(crate) dsk: Vec<u8>,
    pub(crate) page_size: usize,
    pub(crate) split_size: usize,
    split_pct: u32,
    alloc_size: usize,

    pub(crate) bnd: Vec<Boundary>,
    pub(crate) bnd_next: usize,
    pub(crate) bnd_state: SplitState,
    /// Entries already accounted to recorded boundaries.
    total_entries: u32,

    /// Current record number.
    pub(crate) recno: u64,
    /// Entries in the image not yet written out.
    pub(crate) entries: u32,
    /// First free byte offset in the working buffer.
    pub(crate) first_free: usize,
    /// Bytes remaining in the current chunk.
    pub(crate) space_avail: usize,

    /// True until the 0th key of an internal page has been built; that key
    /// is truncated because tree search treats it as minus infinity.
    pub(crate) cell_zero: bool,
    /// Pending first-key correction when merging a split-created subtree.
    pub(crate) merge_key: Option<Vec<u8>>,

    /// Key and value cells being assembled.
    pub(crate) key: KvCell,
    pub(crate) val: KvCell,

    /// Full copy of the key being built.
    pub(crate) cur: Vec<u8>,
    /// Full copy of the last key built (or last value, on column leaves).
    pub(crate) last: Vec<u8>,

    pub(crate) key_pfx_compress: bool,
    pub(crate) key_pfx_compress_conf: bool,
    pub(crate) key_sfx_compress: bool,
    pub(crate) key_sfx_compress_conf: bool,
}

impl Reconciler {
    /// Creates a context configured for one table.
    #[must_use]
    pub fn new(config: &crate::config::BtreeConfig) -> Self {
        Self {
            page_type: PageType::RowLeaf,
            dsk: Vec::new(),
            page_size: 0,
            split_size: 0,
            split_pct: config.split_pct,
            alloc_size: config.alloc_size,
            bnd: Vec::new(),
            bnd_next: 0,
            bnd_state: SplitState::TrackingOff,
            total_entries: 0,
            recno: 0,
            entries: 0,
            first_free: CHUNK_HEADER_SIZE,
            space_avail: 0,
            cell_zero: false,
            merge_key: None,
            key: KvCell::default(),
            val: KvCell::default(),
            cur: Vec::new(),
            last: Vec::new(),
            key_pfx_compress: false,
            key_pfx_compress_conf: config.prefix_compression,
            key_sfx_compress: false,
            key_sfx_compress_conf: config.internal_key_truncate,
        }
    }

    /// Discards transient state after a failed pass so the next attempt
    /// starts clean.
    pub(crate) fn reset(&mut self) {
        self.bnd_next = 0;
        self.entries = 0;
        self.total_entries = 0;
        self.first_free = CHUNK_HEADER_SIZE;
        self.space_avail = 0;
        self.merge_key = None;
        self.cur.clear();
        self.last.clear();
        self.key = KvCell::default();
        self.val = KvCell::default();
    }

    /// Ensures the boundary list can hold the current slot plus the primed
    /// next slot.
    pub(crate) fn bnd_grow(&mut self) {
        while self.bnd.len() < self.bnd_next + 2 {
            self.bnd.reserve(BND_GROW);
            self.bnd.push(Boundary::default());
        }
    }

    /// Initializes the context for one page.
    pub(crate) fn split_init(&mut self, page_type: PageType, recno: u64, max: usize) {
        self.page_type = page_type;

        // New page, compression off until a full key lands.
        self.key_pfx_compress = false;
        self.key_sfx_compress = false;

        self.dsk.clear();
        self.dsk.resize(max, 0);

        // Splitting to the maximum size would make a packed page split
        // over and over; target a smaller chunk. Fixed-width pages are
        // allocated at full size and never anything smaller.
        self.page_size = max;
        self.split_size = if page_type == PageType::ColFix {
            max
        } else {
            split_page_size(max, self.alloc_size, self.split_pct)
        };
        debug_assert!(self.split_size > CHUNK_HEADER_SIZE);

        // A split size equal to the page size leaves nothing to track.
        self.bnd_state = if self.page_size == self.split_size {
            SplitState::TrackingOff
        } else {
            SplitState::Boundary
        };

        self.bnd_next = 0;
        self.bnd_grow();
        self.bnd[0] = Boundary {
            start: CHUNK_HEADER_SIZE,
            recno,
            entries: 0,
            key: Vec::new(),
            block: None,
        };

        self.total_entries = 0;
        self.recno = recno;
        self.entries = 0;
        self.first_free = CHUNK_HEADER_SIZE;
        self.space_avail = self.split_size - CHUNK_HEADER_SIZE;

        self.cell_zero = false;
        self.merge_key = None;
    }

    /// Accounts `nentries` new records occupying `size` bytes already
    /// placed at `first_free`.
    pub(crate) fn incr(&mut self, nentries: u32, size: usize) {
        debug_assert!(self.space_avail >= size);
        self.entries += nentries;
        self.space_avail -= size;
        self.first_free += size;
    }

    /// Copies the assembled key or value cell into the image and accounts
    /// for `nentries` new records.
    pub(crate) fn copy_incr(&mut self, which: Kv, nentries: u32) {
        let kv = match which {
            Kv::Key => std::mem::take(&mut self.key),
            Kv::Val => std::mem::take(&mut self.val),
        };
        debug_assert_eq!(kv.len, kv.head.len() + kv.data.len());

        let start = self.first_free;
        self.dsk[start..start + kv.head.len()].copy_from_slice(kv.head.as_slice());
        self.dsk[start + kv.head.len()..start + kv.len].copy_from_slice(&kv.data);
        self.incr(nentries, kv.len);

        match which {
            Kv::Key => self.key = kv,
            Kv::Val => self.val = kv,
        }
    }

    /// Handles a boundary crossing: records a split point, replays saved
    /// boundaries after crossing the maximum, or writes the filled chunk.
    pub(crate) fn split(&mut self, env: &RecEnv<'_>) -> BurrowResult<()> {
        match self.bnd_state {
            SplitState::Boundary => {
                // Record where the split would have happened.
                self.bnd_grow();
                self.bnd[self.bnd_next].entries = self.entries - self.total_entries;
                self.total_entries = self.entries;
                self.bnd_next += 1;

                // Prime the next chunk's start point and promoted key.
                let next = self.bnd_next;
                self.bnd[next].recno = self.recno;
                self.bnd[next].start = self.first_free;
                self.bnd[next].entries = 0;
                self.bnd[next].block = None;
                if self.page_type.is_row() {
                    self.split_row_promote(env)?;
                }

                // Another split-size window if one fits inside the page
                // size; otherwise track the maximum boundary with whatever
                // space remains.
                let current_len = self.first_free;
                if current_len + self.split_size <= self.page_size {
                    self.space_avail = self.split_size - CHUNK_HEADER_SIZE;
                } else {
                    self.bnd_state = SplitState::Max;
                    self.space_avail =
                        (self.page_size - CHUNK_HEADER_SIZE).saturating_sub(current_len);
                }
            }
            SplitState::Max => {
                // The image crossed the maximum page size: write the
                // chunks tracked so far and keep going.
                self.split_fixup(env)?;
                self.bnd_state = SplitState::TrackingOff;
            }
            SplitState::TrackingOff => {
                // Write the current chunk directly.
                self.bnd_grow();
                let idx = self.bnd_next;
                self.bnd_next += 1;

                let recno = self.bnd[idx].recno;
                let entries = self.entries;
                let content = self.first_free;
                let block =
                    write_chunk(env, self.page_type, recno, entries, &mut self.dsk, content)?;
                self.bnd[idx].entries = entries;
                self.bnd[idx].block = Some(block);

                let next = self.bnd_next;
                self.bnd[next].recno = self.recno;
                self.bnd[next].entries = 0;
                self.bnd[next].block = None;
                if self.page_type.is_row() {
                    self.split_row_promote(env)?;
                }

                self.entries = 0;
                self.first_free = CHUNK_HEADER_SIZE;
                self.space_avail = self.split_size - CHUNK_HEADER_SIZE;
            }
        }
        Ok(())
    }

    /// Writes the trailing chunk; collapses the recorded boundaries into a
    /// single replacement image if the page never crossed the maximum.
    pub(crate) fn split_finish(&mut self, env: &RecEnv<'_>) -> BurrowResult<()> {
        // No entries only happens when the page was entirely empty: any
        // split leaves at least the entry that forced it.
        if self.entries == 0 {
            if self.bnd_next != 0 {
                return Err(BurrowError::corruption("empty chunk after a split"));
            }
            return Ok(());
        }

        let idx = if self.bnd_state == SplitState::TrackingOff {
            self.bnd_grow();
            let idx = self.bnd_next;
            self.bnd_next += 1;
            idx
        } else {
            // Everything fit: the boundary checks were wasted work and the
            // first slot stands for the whole page.
            self.bnd_next = 1;
            0
        };

        self.bnd[idx].entries = self.entries;
        let recno = self.bnd[idx].recno;
        let entries = self.entries;
        let content = self.first_free;
        let block = write_chunk(env, self.page_type, recno, entries, &mut self.dsk, content)?;
        self.bnd[idx].block = Some(block);
        Ok(())
    }

    /// Replays the saved boundaries after crossing the maximum page size:
    /// writes each tracked chunk, then slides the unwritten remnant to the
    /// front of the working buffer.
    fn split_fixup(&mut self, env: &RecEnv<'_>) -> BurrowResult<()> {
        let mut tmp = env.scratch.get(self.split_size + 1);

        for i in 0..self.bnd_next {
            let start = self.bnd[i].start;
            let len = self.bnd[i + 1].start - start;
            tmp[CHUNK_HEADER_SIZE..CHUNK_HEADER_SIZE + len]
                .copy_from_slice(&self.dsk[start..start + len]);
            let block = write_chunk(
                env,
                self.page_type,
                self.bnd[i].recno,
                self.bnd[i].entries,
                &mut tmp,
                CHUNK_HEADER_SIZE + len,
            )?;
            self.bnd[i].block = Some(block);
        }

        // The remnant must fit a fresh split-size chunk.
        let last_start = self.bnd[self.bnd_next].start;
        let len = self.first_free - last_start;
        if len >= self.split_size - CHUNK_HEADER_SIZE {
            return Err(BurrowError::corruption("split remnant exceeds chunk size"));
        }
        self.dsk.copy_within(last_start..self.first_free, CHUNK_HEADER_SIZE);

        self.entries -= self.total_entries;
        self.first_free = CHUNK_HEADER_SIZE + len;
        self.space_avail = (self.split_size - CHUNK_HEADER_SIZE) - len;
        Ok(())
    }

    /// Records the promoted key for the chunk about to start.
    ///
    /// The first call also has to recover chunk 0's key from the image,
    /// because boundaries are recorded between chunks, never before the
    /// first one.
    fn split_row_promote(&mut self, env: &RecEnv<'_>) -> BurrowResult<()> {
        if self.bnd_next == 1 {
            let first = cell::unpack(&self.dsk, CHUNK_HEADER_SIZE)?;
            let key = match first.cell_type {
                CellType::Key => {
                    // The first key on a page is never prefix-compressed.
                    if first.prefix != 0 {
                        return Err(BurrowError::corruption("first key carries a prefix"));
                    }
                    decode_key(env, first.data(&self.dsk))
                }
                CellType::KeyOvfl => {
                    let raw = read_overflow(env.blocks, first.block)?;
                    decode_key(env, &raw)
                }
                _ => return Err(BurrowError::corruption("first cell is not a key")),
            };
            self.bnd[0].key = key;
        }

        // Suffix compression: the promoted key only needs enough bytes to
        // sort above the previous chunk's last key. Only leaf promotions
        // qualify; repeating the truncation up the tree loses information.
        let size = if self.page_type == PageType::RowLeaf && self.key_sfx_compress {
            let common = std::cmp::min(self.last.len(), self.cur.len());
            let mut size = common + 1;
            for i in 0..common {
                if self.last[i] != self.cur[i] {
                    size = i + 1;
                    break;
                }
            }
            std::cmp::min(size, self.cur.len())
        } else {
            self.cur.len()
        };

        let key = self.cur[..size].to_vec();
        self.bnd[self.bnd_next].key = key;
        Ok(())
    }
}

/// Split chunks target `page_size * pct / 100`, rounded up to an
/// allocation-size multiple and capped at the page size.
fn split_page_size(page_size: usize, alloc_size: usize, pct: u32) -> usize {
    let target = page_size * pct as usize / 100;
    let aligned = target.div_ceil(alloc_size) * alloc_size;
    aligned.clamp(alloc_size, page_size)
}

fn decode_key(env: &RecEnv<'_>, data: &[u8]) -> Vec<u8> {
    match &env.codecs.key {
        Some(c) => c.decode(data),
        None => data.to_vec(),
    }
}

/// Finalizes a chunk's header and writes it through the block manager.
///
/// Row-store leaf chunks get a trailing zero-length key cell after the last
/// entry: zero-length values are detected by key-cell adjacency, and the
/// last value on the chunk needs a following key cell to be detectable.
pub(crate) fn write_chunk(
    env: &RecEnv<'_>,
    page_type: PageType,
    recno: u64,
    entries: u32,
    buf: &mut [u8],
    mut content_len: usize,
) -> BurrowResult<BlockRef> {
    if page_type == PageType::RowLeaf {
        debug_assert!(content_len < buf.len());
        buf[content_len] = cell::trailing_key_byte();
        content_len += 1;
    }

    let header = ChunkHeader {
        page_type,
        entries,
        recno,
        data_len: (content_len - CHUNK_HEADER_SIZE) as u32,
    };
    header.write_to(buf);

    let block = env.blocks.write(&buf[..content_len])?;
    tracing::trace!(
        %page_type, entries, recno, size = content_len, addr = %block.addr,
        "wrote chunk"
    );
    Ok(block)
}
