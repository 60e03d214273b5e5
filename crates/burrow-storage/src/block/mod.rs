//! Block manager: writes, reads, and frees opaque on-disk blocks.
//!
//! The reconciler consumes this interface; it never interprets addresses.
//! Addresses are opaque 32-bit tokens handed out at write time, with
//! `BlockAddr::INVALID` reserved. Statistics counters are kept so callers
//! can observe write and free traffic (the overflow-reuse contract is
//! verified through them).

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use burrow_common::{BlockAddr, BurrowError, BurrowResult};
use parking_lot::Mutex;

/// An on-disk block reference: opaque address plus size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRef {
    /// Opaque block address.
    pub addr: BlockAddr,
    /// Block size in bytes.
    pub size: u32,
}

impl BlockRef {
    /// A reference that names no block.
    pub const INVALID: Self = Self {
        addr: BlockAddr::INVALID,
        size: 0,
    };

    /// Creates a block reference.
    #[inline]
    #[must_use]
    pub const fn new(addr: BlockAddr, size: u32) -> Self {
        Self { addr, size }
    }

    /// Checks whether this reference names a real block.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.addr.is_valid()
    }
}

/// Snapshot of block manager activity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockStats {
    /// Number of blocks written since creation.
    pub writes: u64,
    /// Number of blocks freed since creation.
    pub frees: u64,
    /// Number of currently live blocks.
    pub live: u64,
}

/// Interface to the block allocator.
///
/// Implementations are internally synchronized; the engine calls them from
/// multiple threads.
pub trait BlockManager: Send + Sync {
    /// Writes an image as a new block, returning its reference.
    fn write(&self, image: &[u8]) -> BurrowResult<BlockRef>;

    /// Reads a block's image.
    fn read(&self, block: BlockRef) -> BurrowResult<Vec<u8>>;

    /// Releases a block for reuse.
    fn free(&self, block: BlockRef) -> BurrowResult<()>;

    /// Returns activity counters.
    fn stats(&self) -> BlockStats;
}

#[derive(Debug, Default)]
struct MemBlocks {
    next_addr: u32,
    blocks: HashMap<u32, Vec<u8>>,
}

/// In-memory block manager.
///
/// Backs tests and ephemeral tables; semantics match the file-backed
/// manager exactly.
#[derive(Debug, Default)]
pub struct MemBlockManager {
    inner: Mutex<MemBlocks>,
    writes: AtomicU64,
    frees: AtomicU64,
}

impl MemBlockManager {
    /// Creates an empty in-memory block manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockManager for MemBlockManager {
    fn write(&self, image: &[u8]) -> BurrowResult<BlockRef> {
        let mut inner = self.inner.lock();
        let addr = inner.next_addr;
        if addr == BlockAddr::INVALID.as_u32() {
            return Err(BurrowError::internal("block address space exhausted"));
        }
        inner.next_addr += 1;
        inner.blocks.insert(addr, image.to_vec());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(BlockRef::new(BlockAddr::new(addr), image.len() as u32))
    }

    fn read(&self, block: BlockRef) -> BurrowResult<Vec<u8>> {
        let inner = self.inner.lock();
        inner
            .blocks
            .get(&block.addr.as_u32())
            .cloned()
            .ok_or_else(|| BurrowError::not_found(format!("block {}", block.addr)))
    }

    fn free(&self, block: BlockRef) -> BurrowResult<()> {
        let mut inner = self.inner.lock();
        if inner.blocks.remove(&block.addr.as_u32()).is_none() {
            return Err(BurrowError::not_found(format!("block {}", block.addr)));
        }
        self.frees.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn stats(&self) -> BlockStats {
        let live = self.inner.lock().blocks.len() as u64;
        BlockStats {
            writes: self.writes.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            live,
        }
    }
}

#[derive(Debug)]
struct FileBlocks {
    file: File,
    next_addr: u32,
    // addr -> (file offset, size); freed entries are dropped from the map.
    index: HashMap<u32, (u64, u32)>,
    tail: u64,
}

/// File-backed block manager.
///
/// Blocks are appended to a single backing file; the address index is kept
/// in memory. Frees drop index entries without reclaiming file space, which
/// is enough for the engine's contract (a compacting allocator is a drop-in
/// replacement behind the same trait).
#[derive(Debug)]
pub struct FileBlockManager {
    inner: Mutex<FileBlocks>,
    writes: AtomicU64,
    frees: AtomicU64,
}

impl FileBlockManager {
    /// Opens or creates a block file at `path`.
    pub fn open(path: impl AsRef<Path>) -> BurrowResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        let tail = file.metadata()?.len();
        Ok(Self {
            inner: Mutex::new(FileBlocks {
                file,
                next_addr: 0,
                index: HashMap::new(),
                tail,
            }),
            writes: AtomicU64::new(0),
            frees: AtomicU64::new(0),
        })
    }
}

impl BlockManager for FileBlockManager {
    fn write(&self, image: &[u8]) -> BurrowResult<BlockRef> {
        let mut inner = self.inner.lock();
        let addr = inner.next_addr;
        if addr == BlockAddr::INVALID.as_u32() {
            return Err(BurrowError::internal("block address space exhausted"));
        }
        let offset = inner.tail;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(image)?;
        inner.next_addr += 1;
        inner.tail = offset + image.len() as u64;
        inner.index.insert(addr, (offset, image.len() as u32));
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(BlockRef::new(BlockAddr::new(addr), image.len() as u32))
    }

    fn read(&self, block: BlockRef) -> BurrowResult<Vec<u8>> {
        let mut inner = self.inner.lock();
        let (offset, size) = *inner
            .index
            .get(&block.addr.as_u32())
            .ok_or_else(|| BurrowError::not_found(format!("block {}", block.addr)))?;
        let mut buf = vec![0u8; size as usize];
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn free(&self, block: BlockRef) -> BurrowResult<()> {
        let mut inner = self.inner.lock();
        if inner.index.remove(&block.addr.as_u32()).is_none() {
            return Err(BurrowError::not_found(format!("block {}", block.addr)));
        }
        self.frees.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn stats(&self) -> BlockStats {
        let live = self.inner.lock().index.len() as u64;
        BlockStats {
            writes: self.writes.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            live,
        }
    }
}

/// Hands out the block manager backing a named table.
///
/// Checkpoints share their table's block space, so the source is keyed by
/// name alone.
pub trait BlockSource: Send + Sync {
    /// Opens (or creates) the block manager for `name`.
    fn open(&self, name: &str) -> BurrowResult<std::sync::Arc<dyn BlockManager>>;
}

/// In-memory block source: one [`MemBlockManager`] per table name.
#[derive(Debug, Default)]
pub struct MemBlockSource {
    tables: Mutex<HashMap<String, std::sync::Arc<MemBlockManager>>>,
}

impl MemBlockSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockSource for MemBlockSource {
    fn open(&self, name: &str) -> BurrowResult<std::sync::Arc<dyn BlockManager>> {
        let mut tables = self.tables.lock();
        let manager = tables
            .entry(name.to_string())
            .or_insert_with(|| std::sync::Arc::new(MemBlockManager::new()));
        Ok(std::sync::Arc::clone(manager) as std::sync::Arc<dyn BlockManager>)
    }
}
