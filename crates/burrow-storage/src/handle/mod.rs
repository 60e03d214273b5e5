//! Data handles: per-table, per-checkpoint lifecycle anchors.
//!
//! A data handle is the durable anchor for one open `(name, checkpoint)`
//! pair: it owns the handle lock, the state flags, the reference count,
//! the configuration string, and the backing tree. Handles are created on
//! first open, retained until connection shutdown, and never freed while
//! any session points at them.

mod registry;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use burrow_common::{BurrowError, BurrowResult};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};

use crate::meta::Catalog;
use crate::tree::Btree;

pub use registry::{Connection, SchemaGuard, SchemaLock};

/// Request flags for [`Connection::get`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags(u32);

impl OpenFlags {
    /// No flags: a shared, read-locked handle.
    pub const NONE: Self = Self(0);
    /// Request exclusive access; fails with busy rather than waiting.
    pub const EXCLUSIVE: Self = Self(1 << 0);
    /// Acquire the handle and its lock without opening the tree.
    pub const LOCK_ONLY: Self = Self(1 << 1);
    /// Open for salvage (implies exclusive use).
    pub const SALVAGE: Self = Self(1 << 2);
    /// Open for upgrade (implies exclusive use).
    pub const UPGRADE: Self = Self(1 << 3);
    /// Open for verify (implies exclusive use).
    pub const VERIFY: Self = Self(1 << 4);

    const SPECIAL: u32 = Self::SALVAGE.0 | Self::UPGRADE.0 | Self::VERIFY.0;

    /// Checks if every flag in `other` is set.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any special (salvage/upgrade/verify) flag is set.
    #[inline]
    #[must_use]
    pub const fn is_special(self) -> bool {
        self.0 & Self::SPECIAL != 0
    }
}

impl std::ops::BitOr for OpenFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// Handle state bits.
const DH_OPEN: u32 = 1 << 0;
const DH_EXCLUSIVE: u32 = 1 << 1;
const DH_SALVAGE: u32 = 1 << 2;
const DH_UPGRADE: u32 = 1 << 3;
const DH_VERIFY: u32 = 1 << 4;
const DH_SPECIAL: u32 = DH_SALVAGE | DH_UPGRADE | DH_VERIFY;

/// A data handle: the lifecycle anchor for one open table or checkpoint.
pub struct DataHandle {
    name: String,
    checkpoint: Option<String>,
    /// The handle lock protecting open/close transitions. Owned guards
    /// from this lock live inside [`HandleGuard`].
    lock: Arc<RwLock<()>>,
    flags: AtomicU32,
    refcnt: AtomicU32,
    config: Mutex<Option<String>>,
    tree: Mutex<Option<Btree>>,
}

impl DataHandle {
    pub(crate) fn new(name: &str, checkpoint: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            checkpoint: checkpoint.map(str::to_string),
            lock: Arc::new(RwLock::new(())),
            flags: AtomicU32::new(0),
            refcnt: AtomicU32::new(0),
            config: Mutex::new(None),
            tree: Mutex::new(None),
        }
    }

    /// The table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The checkpoint name; `None` is the live tree.
    #[must_use]
    pub fn checkpoint(&self) -> Option<&str> {
        self.checkpoint.as_deref()
    }

    /// The configuration string the handle was opened with.
    #[must_use]
    pub fn config(&self) -> Option<String> {
        self.config.lock().clone()
    }

    /// Current reference count.
    #[must_use]
    pub fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::SeqCst)
    }

    /// True if the backing tree is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.flags.load(Ordering::SeqCst) & DH_OPEN != 0
    }

    /// True if a thread holds the handle exclusively.
    #[must_use]
    pub fn is_exclusive(&self) -> bool {
        self.flags.load(Ordering::SeqCst) & DH_EXCLUSIVE != 0
    }

    /// True if the handle is open in a special (salvage/upgrade/verify)
    /// mode.
    #[must_use]
    pub fn is_special(&self) -> bool {
        self.flags.load(Ordering::SeqCst) & DH_SPECIAL != 0
    }

    fn set_flag(&self, bit: u32) {
        self.flags.fetch_or(bit, Ordering::SeqCst);
    }

    fn clear_flag(&self, bit: u32) {
        self.flags.fetch_and(!bit, Ordering::SeqCst);
    }

    fn set_special_from(&self, flags: OpenFlags) {
        let mut bits = 0;
        if flags.contains(OpenFlags::SALVAGE) {
            bits |= DH_SALVAGE;
        }
        if flags.contains(OpenFlags::UPGRADE) {
            bits |= DH_UPGRADE;
        }
        if flags.contains(OpenFlags::VERIFY) {
            bits |= DH_VERIFY;
        }
        if bits != 0 {
            self.set_flag(bits);
        }
    }

    /// Syncs and closes the backing tree.
    ///
    /// If the handle is open and not in a special mode, the tree is
    /// checkpointed first; the tree is closed and the open/special flags
    /// cleared either way, and the first error wins. Idempotent when
    /// already closed.
    pub fn sync_and_close(&self, catalog: &dyn Catalog) -> BurrowResult<()> {
        if !self.is_open() {
            return Ok(());
        }

        let mut ret = Ok(());
        if !self.is_special() {
            if let Some(tree) = self.tree.lock().as_mut() {
                ret = tree.checkpoint(catalog);
            }
        }

        tracing::debug!(name = %self.name, checkpoint = ?self.checkpoint, "closing handle");
        *self.tree.lock() = None;
        self.clear_flag(DH_OPEN | DH_SPECIAL);

        ret
    }

    /// Runs `f` against the backing tree.
    pub fn with_tree<R>(&self, f: impl FnOnce(&mut Btree) -> R) -> BurrowResult<R> {
        let mut tree = self.tree.lock();
        match tree.as_mut() {
            Some(tree) => Ok(f(tree)),
            None => Err(BurrowError::internal(format!(
                "handle {} has no open tree",
                self.name
            ))),
        }
    }

    pub(crate) fn set_tree(&self, tree: Btree) {
        *self.tree.lock() = Some(tree);
    }

    pub(crate) fn set_config(&self, config: String) {
        *self.config.lock() = Some(config);
    }
}

impl std::fmt::Debug for DataHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataHandle")
            .field("name", &self.name)
            .field("checkpoint", &self.checkpoint)
            .field("open", &self.is_open())
            .field("exclusive", &self.is_exclusive())
            .field("refcnt", &self.refcnt())
            .finish()
    }
}

/// The lock held by a [`HandleGuard`].
#[derive(Debug)]
pub(crate) enum HandleLock {
    Read(ArcRwLockReadGuard<RawRwLock, ()>),
    Write(ArcRwLockWriteGuard<RawRwLock, ()>),
}

/// A session's hold on a data handle: a reference plus a read or write
/// lock, released through [`Connection::release`].
pub struct HandleGuard {
    pub(crate) dh: Arc<DataHandle>,
    pub(crate) lock: Option<HandleLock>,
}

impl HandleGuard {
    /// The handle.
    #[must_use]
    pub fn handle(&self) -> &Arc<DataHandle> {
        &self.dh
    }

    /// True if this guard holds the handle's writer lock.
    #[must_use]
    pub fn is_write(&self) -> bool {
        matches!(self.lock, Some(HandleLock::Write(_)))
    }

    /// Runs `f` against the handle's backing tree.
    pub fn with_tree<R>(&self, f: impl FnOnce(&mut Btree) -> R) -> BurrowResult<R> {
        self.dh.with_tree(f)
    }

    pub(crate) fn unlock(&mut self) {
        self.lock = None;
    }
}

impl std::fmt::Debug for HandleGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleGuard")
            .field("handle", &self.dh)
            .field("write", &self.is_write())
            .finish()
    }
}

/// Spins until the handle is usable: open and read-locked for shared
/// requests, or write-locked (open or closed) for exclusive ones.
///
/// Exclusive requests never block: if the writer lock isn't immediately
/// available, the caller gets `Busy` and decides whether to retry.
pub(crate) fn open_lock(dh: &Arc<DataHandle>, flags: OpenFlags) -> BurrowResult<HandleLock> {
    let exclusive = flags.contains(OpenFlags::EXCLUSIVE);
    loop {
        // Special modes own the handle; shared access must wait for them
        // to finish.
        if !exclusive && dh.is_special() {
            return Err(BurrowError::busy(&dh.name));
        }

        // If the open flag is visible under a read lock, the handle can't
        // be closed out from under us.
        if dh.is_open() && !exclusive {
            let guard = dh.lock.read_arc();
            if dh.is_open() {
                return Ok(HandleLock::Read(guard));
            }
            drop(guard);
        }

        // Closed, or exclusive wanted: try for the writer lock without
        // blocking, in case another thread is mid-open.
        if let Some(guard) = dh.lock.try_write_arc() {
            // Opened while we were waiting: a shared request drops back to
            // a read lock.
            if dh.is_open() && !exclusive {
                drop(guard);
                continue;
            }
            dh.set_flag(DH_EXCLUSIVE);
            return Ok(HandleLock::Write(guard));
        } else if exclusive {
            return Err(BurrowError::busy(&dh.name));
        }

        std::thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MemCatalog;

    #[test]
    fn test_open_flags() {
        let flags = OpenFlags::EXCLUSIVE | OpenFlags::SALVAGE;
        assert!(flags.contains(OpenFlags::EXCLUSIVE));
        assert!(flags.contains(OpenFlags::SALVAGE));
        assert!(!flags.contains(OpenFlags::VERIFY));
        assert!(flags.is_special());
        assert!(!OpenFlags::EXCLUSIVE.is_special());
    }

    #[test]
    fn test_sync_and_close_idempotent() {
        let catalog = MemCatalog::new();
        let dh = DataHandle::new("table:a", None);
        assert!(!dh.is_open());
        dh.sync_and_close(&catalog).unwrap();
        dh.sync_and_close(&catalog).unwrap();
        assert!(!dh.is_open());
    }

    #[test]
    fn test_open_lock_shared_on_open_handle() {
        let dh = Arc::new(DataHandle::new("table:a", None));
        dh.set_flag(DH_OPEN);

        let lock = open_lock(&dh, OpenFlags::NONE).unwrap();
        assert!(matches!(lock, HandleLock::Read(_)));
        assert!(!dh.is_exclusive());
    }

    #[test]
    fn test_open_lock_write_on_closed_handle() {
        let dh = Arc::new(DataHandle::new("table:a", None));

        let lock = open_lock(&dh, OpenFlags::NONE).unwrap();
        assert!(matches!(lock, HandleLock::Write(_)));
        assert!(dh.is_exclusive());
    }

    #[test]
    fn test_open_lock_exclusive_busy_under_reader() {
        let dh = Arc::new(DataHandle::new("table:a", None));
        dh.set_flag(DH_OPEN);

        let _reader = open_lock(&dh, OpenFlags::NONE).unwrap();
        let err = open_lock(&dh, OpenFlags::EXCLUSIVE).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_open_lock_shared_busy_in_special_mode() {
        let dh = Arc::new(DataHandle::new("table:a", None));
        dh.set_flag(DH_OPEN | DH_SALVAGE);

        let err = open_lock(&dh, OpenFlags::NONE).unwrap_err();
        assert!(err.is_transient());
    }
}
