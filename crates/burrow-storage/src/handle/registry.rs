//! The connection-wide handle registry.
//!
//! The registry owns the `(name, checkpoint) -> handle` mapping. Every
//! mutation — acquiring, releasing, bulk-closing, shutdown — happens under
//! the process-wide schema lock, which the caller holds and proves by
//! passing the guard; the registry relies on that for list stability.
//! Per-handle reader/writer locks protect the open/closed transitions
//! themselves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use burrow_common::{BurrowError, BurrowResult};
use parking_lot::{Mutex, MutexGuard};

use crate::block::BlockSource;
use crate::config::BtreeConfig;
use crate::tree::Btree;

use super::{open_lock, DataHandle, HandleGuard, HandleLock, OpenFlags};
use super::{DH_EXCLUSIVE, DH_OPEN};

/// The process-wide schema lock.
///
/// Registry operations take a [`SchemaGuard`] parameter: holding the guard
/// is the compile-time proof that the caller owns the lock for the whole
/// schema operation, which may span several registry calls.
#[derive(Debug, Default)]
pub struct SchemaLock {
    inner: Mutex<()>,
}

impl SchemaLock {
    /// Acquires the schema lock.
    pub fn lock(&self) -> SchemaGuard<'_> {
        SchemaGuard {
            _guard: self.inner.lock(),
        }
    }
}

/// Proof of schema-lock ownership.
#[must_use = "registry operations are only safe while the schema lock is held"]
pub struct SchemaGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl std::fmt::Debug for SchemaGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SchemaGuard")
    }
}

/// A connection: the schema lock, the handle registry, and the
/// collaborators handles are opened against.
pub struct Connection {
    schema: SchemaLock,
    handles: Mutex<Vec<Arc<DataHandle>>>,
    catalog: Arc<dyn crate::meta::Catalog>,
    source: Arc<dyn BlockSource>,
    file_open: AtomicU64,
}

impl Connection {
    /// Name of the metadata table; skipped by [`Connection::apply`] and
    /// closed last at shutdown.
    pub const METADATA_NAME: &'static str = "metadata:";

    /// Creates a connection over a catalog and a block source.
    #[must_use]
    pub fn new(
        catalog: Arc<dyn crate::meta::Catalog>,
        source: Arc<dyn BlockSource>,
    ) -> Self {
        Self {
            schema: SchemaLock::default(),
            handles: Mutex::new(Vec::new()),
            catalog,
            source,
            file_open: AtomicU64::new(0),
        }
    }

    /// Acquires the schema lock.
    ///
    /// Exclusive handle guards must be released within the same critical
    /// section that acquired them; shared guards may outlive it.
    pub fn schema_lock(&self) -> SchemaGuard<'_> {
        self.schema.lock()
    }

    /// The metadata catalog.
    #[must_use]
    pub fn catalog(&self) -> &Arc<dyn crate::meta::Catalog> {
        &self.catalog
    }

    /// Number of successful and attempted handle acquisitions.
    #[must_use]
    pub fn file_open_count(&self) -> u64 {
        self.file_open.load(Ordering::Relaxed)
    }

    /// Number of handles in the registry.
    #[must_use]
    pub fn handle_count(&self, _schema: &SchemaGuard<'_>) -> usize {
        self.handles.lock().len()
    }

    fn is_metadata(name: &str) -> bool {
        name == Self::METADATA_NAME
    }

    /// Gets a usable handle for `(name, checkpoint)`, opening the backing
    /// tree if needed.
    ///
    /// On success the guard holds either an open, read-locked handle, or a
    /// write-locked handle with the exclusive flag set when
    /// [`OpenFlags::EXCLUSIVE`] was requested. Exclusive requests fail with
    /// `Busy` rather than waiting. A missing catalog entry fails with
    /// `NotFound`. Failure undoes exactly what the call did: the lock is
    /// released, the exclusive flag cleared, and the reference dropped.
    pub fn get(
        &self,
        _schema: &SchemaGuard<'_>,
        name: &str,
        checkpoint: Option<&str>,
        flags: OpenFlags,
    ) -> BurrowResult<HandleGuard> {
        self.file_open.fetch_add(1, Ordering::Relaxed);

        // Find the handle, or create one, locked, before it becomes
        // visible in the list.
        let mut created_lock: Option<HandleLock> = None;
        let dh = {
            let mut handles = self.handles.lock();
            match handles
                .iter()
                .find(|h| h.name() == name && h.checkpoint() == checkpoint)
            {
                Some(h) => {
                    h.refcnt.fetch_add(1, Ordering::SeqCst);
                    Arc::clone(h)
                }
                None => {
                    let dh = Arc::new(DataHandle::new(name, checkpoint));
                    let guard = dh.lock.write_arc();
                    dh.set_flag(DH_EXCLUSIVE);
                    dh.refcnt.store(1, Ordering::SeqCst);
                    handles.push(Arc::clone(&dh));
                    created_lock = Some(HandleLock::Write(guard));
                    dh
                }
            }
        };

        let lock = match created_lock {
            Some(lock) => lock,
            None => match open_lock(&dh, flags) {
                Ok(lock) => lock,
                Err(e) => {
                    dh.refcnt.fetch_sub(1, Ordering::SeqCst);
                    return Err(e);
                }
            },
        };
        let mut guard = HandleGuard {
            dh,
            lock: Some(lock),
        };

        if let Err(e) = self.get_open(&mut guard, flags) {
            if guard.is_write() {
                guard.dh.clear_flag(DH_EXCLUSIVE);
            }
            guard.unlock();
            guard.dh.refcnt.fetch_sub(1, Ordering::SeqCst);
            return Err(e);
        }

        debug_assert!(
            flags.contains(OpenFlags::LOCK_ONLY)
                || flags.contains(OpenFlags::EXCLUSIVE) == guard.dh.is_exclusive()
        );
        Ok(guard)
    }

    fn get_open(&self, guard: &mut HandleGuard, flags: OpenFlags) -> BurrowResult<()> {
        // Already open in the required mode, or the caller only wanted the
        // lock.
        if flags.contains(OpenFlags::LOCK_ONLY)
            || (guard.dh.is_open() && !flags.is_special())
        {
            return Ok(());
        }

        // A missing catalog entry is the engine's file-not-found.
        let config = self.catalog.read(guard.dh.name())?;
        self.btree_open(guard, &config, flags)
    }

    /// Opens the backing tree under the writer lock, then drops to a read
    /// lock unless exclusive access was requested.
    fn btree_open(
        &self,
        guard: &mut HandleGuard,
        config: &str,
        flags: OpenFlags,
    ) -> BurrowResult<()> {
        debug_assert!(guard.is_write() && guard.dh.is_exclusive());
        let dh = Arc::clone(&guard.dh);

        dh.set_config(config.to_string());

        // Reopening with a new configuration or special flags: close the
        // old tree first.
        if dh.is_open() {
            dh.sync_and_close(self.catalog.as_ref())?;
        }

        dh.set_special_from(flags);

        loop {
            let tree_config = BtreeConfig::from_config_string(config)?;
            let addr = self.catalog.checkpoint_addr(dh.name(), dh.checkpoint())?;
            let blocks = self.source.open(dh.name())?;
            let tree = Btree::open(
                dh.name().to_string(),
                tree_config,
                blocks,
                addr,
                dh.checkpoint().is_some(),
            )?;
            dh.set_tree(tree);
            dh.set_flag(DH_OPEN);
            tracing::debug!(name = %dh.name(), checkpoint = ?dh.checkpoint(), "opened handle");

            // Drop back to a read lock if that is all that was needed.
            if !flags.contains(OpenFlags::EXCLUSIVE) {
                dh.clear_flag(DH_EXCLUSIVE);
                guard.unlock();
                guard.lock = Some(open_lock(&dh, flags)?);
            }
            if dh.is_open() {
                return Ok(());
            }
            // Raced with a close while reacquiring; open again.
        }
    }

    /// Releases a handle reference.
    ///
    /// The last release closes the backing tree (the handle structure
    /// itself is retained until shutdown).
    pub fn release(&self, _schema: &SchemaGuard<'_>, mut guard: HandleGuard) -> BurrowResult<()> {
        let dh = Arc::clone(&guard.dh);

        let prev = dh.refcnt.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev >= 1);
        let inuse = prev > 1;

        if inuse {
            if guard.is_write() {
                dh.clear_flag(DH_EXCLUSIVE);
            }
            guard.unlock();
            return Ok(());
        }

        // Last reference: take the writer lock so the close can't race a
        // reader (the schema lock keeps new references out).
        if !guard.is_write() {
            guard.unlock();
            let lock = dh.lock.write_arc();
            dh.set_flag(DH_EXCLUSIVE);
            guard.lock = Some(HandleLock::Write(lock));
        }

        let ret = if dh.is_open() {
            dh.sync_and_close(self.catalog.as_ref())
        } else {
            Ok(())
        };

        dh.clear_flag(DH_EXCLUSIVE);
        guard.unlock();
        ret
    }

    /// Applies `func` to every open, non-exclusive, non-metadata handle.
    pub fn apply(
        &self,
        _schema: &SchemaGuard<'_>,
        mut func: impl FnMut(&Arc<DataHandle>) -> BurrowResult<()>,
    ) -> BurrowResult<()> {
        let snapshot: Vec<_> = self.handles.lock().clone();
        for dh in &snapshot {
            if dh.is_open() && !dh.is_exclusive() && !Self::is_metadata(dh.name()) {
                func(dh)?;
            }
        }
        Ok(())
    }

    /// Closes every handle whose name matches, including all checkpoint
    /// handles.
    ///
    /// Transactional: every matching handle is write-locked without
    /// blocking first, so a busy handle (an active cursor, a concurrent
    /// opener) fails the whole operation before anything is closed.
    pub fn close_all(&self, _schema: &SchemaGuard<'_>, name: &str) -> BurrowResult<()> {
        let matching: Vec<_> = self
            .handles
            .lock()
            .iter()
            .filter(|h| h.name() == name)
            .cloned()
            .collect();

        // Phase one: lock everything or nothing.
        let mut locked = Vec::with_capacity(matching.len());
        for dh in &matching {
            match dh.lock.try_write_arc() {
                Some(lock) => {
                    dh.set_flag(DH_EXCLUSIVE);
                    locked.push((Arc::clone(dh), lock));
                }
                None => {
                    for (dh, lock) in locked {
                        dh.clear_flag(DH_EXCLUSIVE);
                        drop(lock);
                    }
                    return Err(BurrowError::busy(name));
                }
            }
        }

        // Phase two: close. The first failure stops the walk and is
        // reported to the caller.
        let mut ret = Ok(());
        for (dh, lock) in locked {
            if ret.is_ok() && dh.is_open() {
                ret = dh.sync_and_close(self.catalog.as_ref());
            }
            dh.clear_flag(DH_EXCLUSIVE);
            drop(lock);
        }
        ret
    }

    /// Closes and drops every handle at connection shutdown.
    ///
    /// Ordinary tables close first — closing them checkpoints their trees,
    /// which may touch the metadata — and the metadata handle closes last.
    /// Every close is attempted; the first error is reported.
    pub fn discard_all(&self, _schema: &SchemaGuard<'_>) -> BurrowResult<()> {
        let snapshot: Vec<_> = self.handles.lock().clone();
        let mut ret = Ok(());

        for dh in snapshot.iter().filter(|h| !Self::is_metadata(h.name())) {
            let r = self.discard_one(dh);
            if ret.is_ok() {
                ret = r;
            }
        }
        for dh in snapshot.iter().filter(|h| Self::is_metadata(h.name())) {
            let r = self.discard_one(dh);
            if ret.is_ok() {
                ret = r;
            }
        }

        self.handles.lock().clear();
        ret
    }

    fn discard_one(&self, dh: &Arc<DataHandle>) -> BurrowResult<()> {
        if !dh.is_open() {
            return Ok(());
        }
        let lock = dh.lock.write_arc();
        dh.set_flag(DH_EXCLUSIVE);
        let ret = dh.sync_and_close(self.catalog.as_ref());
        dh.clear_flag(DH_EXCLUSIVE);
        drop(lock);
        ret
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("handles", &self.handles.lock().len())
            .field("file_open", &self.file_open_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemBlockSource;
    use crate::meta::{Catalog, MemCatalog};

    fn test_connection() -> (Connection, Arc<MemCatalog>) {
        let catalog = Arc::new(MemCatalog::new());
        catalog.create_table("table:a", &BtreeConfig::for_testing().to_config_string());
        let source = Arc::new(MemBlockSource::new());
        (Connection::new(catalog.clone(), source), catalog)
    }

    #[test]
    fn test_get_shares_one_handle() {
        let (conn, _) = test_connection();
        let schema = conn.schema_lock();

        let a = conn.get(&schema, "table:a", None, OpenFlags::NONE).unwrap();
        let b = conn.get(&schema, "table:a", None, OpenFlags::NONE).unwrap();

        assert!(Arc::ptr_eq(a.handle(), b.handle()));
        assert_eq!(a.handle().refcnt(), 2);
        assert!(a.handle().is_open());
        assert!(!a.handle().is_exclusive());
        assert_eq!(conn.handle_count(&schema), 1);

        conn.release(&schema, a).unwrap();
        conn.release(&schema, b).unwrap();
    }

    #[test]
    fn test_distinct_checkpoints_distinct_handles() {
        let (conn, catalog) = test_connection();
        let schema = conn.schema_lock();

        // Materialize a checkpoint entry so the snapshot handle can open.
        let live = conn.get(&schema, "table:a", None, OpenFlags::NONE).unwrap();
        live.with_tree(|t| t.named_checkpoint(catalog.as_ref(), "snap"))
            .unwrap()
            .unwrap();

        let snap = conn
            .get(&schema, "table:a", Some("snap"), OpenFlags::NONE)
            .unwrap();
        assert!(!Arc::ptr_eq(live.handle(), snap.handle()));
        assert_eq!(conn.handle_count(&schema), 2);

        conn.release(&schema, live).unwrap();
        conn.release(&schema, snap).unwrap();
    }

    #[test]
    fn test_missing_table_is_not_found() {
        let (conn, _) = test_connection();
        let schema = conn.schema_lock();

        let err = conn
            .get(&schema, "table:absent", None, OpenFlags::NONE)
            .unwrap_err();
        assert!(matches!(err, BurrowError::NotFound { .. }));

        // The failed open left a registry entry but no reference; a later
        // create-then-open works.
        let dh = conn.handles.lock()[0].clone();
        assert_eq!(dh.refcnt(), 0);
    }

    #[test]
    fn test_exclusive_busy_against_reader() {
        let (conn, _) = test_connection();
        let schema = conn.schema_lock();

        let reader = conn.get(&schema, "table:a", None, OpenFlags::NONE).unwrap();
        let err = conn
            .get(&schema, "table:a", None, OpenFlags::EXCLUSIVE)
            .unwrap_err();
        assert!(err.is_transient());

        // The failed exclusive attempt dropped its reference.
        assert_eq!(reader.handle().refcnt(), 1);
        conn.release(&schema, reader).unwrap();
    }

    #[test]
    fn test_exclusive_get_sets_flag() {
        let (conn, _) = test_connection();
        let schema = conn.schema_lock();

        let guard = conn
            .get(&schema, "table:a", None, OpenFlags::EXCLUSIVE)
            .unwrap();
        assert!(guard.handle().is_exclusive());
        assert!(guard.is_write());
        assert!(guard.handle().is_open());

        conn.release(&schema, guard).unwrap();
        let dh = conn.handles.lock()[0].clone();
        assert!(!dh.is_exclusive());
    }

    #[test]
    fn test_release_last_reference_closes() {
        let (conn, _) = test_connection();
        let schema = conn.schema_lock();

        let guard = conn.get(&schema, "table:a", None, OpenFlags::NONE).unwrap();
        let dh = Arc::clone(guard.handle());
        conn.release(&schema, guard).unwrap();

        assert_eq!(dh.refcnt(), 0);
        assert!(!dh.is_open());
        // The handle structure survives until shutdown.
        assert_eq!(conn.handle_count(&schema), 1);
    }

    #[test]
    fn test_close_all_busy_with_active_reader() {
        let (conn, _) = test_connection();
        let schema = conn.schema_lock();

        let reader = conn.get(&schema, "table:a", None, OpenFlags::NONE).unwrap();
        let err = conn.close_all(&schema, "table:a").unwrap_err();
        assert!(err.is_transient());

        // Nothing changed.
        assert!(reader.handle().is_open());
        assert_eq!(reader.handle().refcnt(), 1);
        assert!(!reader.handle().is_exclusive());

        conn.release(&schema, reader).unwrap();
        conn.close_all(&schema, "table:a").unwrap();
        let dh = conn.handles.lock()[0].clone();
        assert!(!dh.is_open());
    }

    #[test]
    fn test_apply_skips_exclusive_and_metadata() {
        let (conn, catalog) = test_connection();
        catalog.create_table("table:b", &BtreeConfig::for_testing().to_config_string());
        catalog.create_table(
            Connection::METADATA_NAME,
            &BtreeConfig::for_testing().to_config_string(),
        );
        let schema = conn.schema_lock();

        let a = conn.get(&schema, "table:a", None, OpenFlags::NONE).unwrap();
        let b = conn
            .get(&schema, "table:b", None, OpenFlags::EXCLUSIVE)
            .unwrap();
        let m = conn
            .get(&schema, Connection::METADATA_NAME, None, OpenFlags::NONE)
            .unwrap();

        let mut seen = Vec::new();
        conn.apply(&schema, |dh| {
            seen.push(dh.name().to_string());
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec!["table:a".to_string()]);

        conn.release(&schema, a).unwrap();
        conn.release(&schema, b).unwrap();
        conn.release(&schema, m).unwrap();
    }

    #[test]
    fn test_discard_all_closes_everything() {
        let (conn, catalog) = test_connection();
        catalog.create_table(
            Connection::METADATA_NAME,
            &BtreeConfig::for_testing().to_config_string(),
        );
        let schema = conn.schema_lock();

        let a = conn.get(&schema, "table:a", None, OpenFlags::NONE).unwrap();
        let m = conn
            .get(&schema, Connection::METADATA_NAME, None, OpenFlags::NONE)
            .unwrap();
        let (dh_a, dh_m) = (Arc::clone(a.handle()), Arc::clone(m.handle()));
        conn.release(&schema, a).unwrap();
        conn.release(&schema, m).unwrap();

        // Reopen both so discard has real work.
        let a = conn.get(&schema, "table:a", None, OpenFlags::NONE).unwrap();
        conn.release(&schema, a).unwrap();
        let a = conn.get(&schema, "table:a", None, OpenFlags::NONE).unwrap();
        let m = conn
            .get(&schema, Connection::METADATA_NAME, None, OpenFlags::NONE)
            .unwrap();
        drop(m);
        drop(a);

        conn.discard_all(&schema).unwrap();
        assert_eq!(conn.handle_count(&schema), 0);
        assert!(!dh_a.is_open());
        assert!(!dh_m.is_open());
    }
}
