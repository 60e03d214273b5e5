//! Metadata catalog: per-table configuration and checkpoint addresses.
//!
//! The handle layer consumes this interface. A missing entry surfaces as
//! `BurrowError::NotFound`, which the handle layer reports unchanged as the
//! engine's ENOENT-equivalent.

use std::collections::HashMap;

use burrow_common::{BurrowError, BurrowResult};
use parking_lot::Mutex;

use crate::block::BlockRef;

/// Interface to the per-table metadata catalog.
pub trait Catalog: Send + Sync {
    /// Returns the configuration string stored for `name`.
    fn read(&self, name: &str) -> BurrowResult<String>;

    /// Returns the root address cookie for `(name, checkpoint)`, or `None`
    /// if the table has never been checkpointed (an empty tree).
    fn checkpoint_addr(&self, name: &str, checkpoint: Option<&str>)
        -> BurrowResult<Option<BlockRef>>;

    /// Records the root address for `(name, checkpoint)`.
    fn set_checkpoint_addr(
        &self,
        name: &str,
        checkpoint: Option<&str>,
        addr: Option<BlockRef>,
    ) -> BurrowResult<()>;
}

#[derive(Debug, Default)]
struct CatalogEntry {
    config: String,
    // checkpoint name ("" = live tree) -> root address
    roots: HashMap<String, Option<BlockRef>>,
}

/// In-memory catalog implementation.
#[derive(Debug, Default)]
pub struct MemCatalog {
    tables: Mutex<HashMap<String, CatalogEntry>>,
}

impl MemCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table entry with the given configuration string.
    pub fn create_table(&self, name: &str, config: &str) {
        let mut tables = self.tables.lock();
        tables.entry(name.to_string()).or_default().config = config.to_string();
    }

    /// Drops a table entry.
    pub fn drop_table(&self, name: &str) {
        self.tables.lock().remove(name);
    }
}

fn ckpt_key(checkpoint: Option<&str>) -> String {
    checkpoint.unwrap_or("").to_string()
}

impl Catalog for MemCatalog {
    fn read(&self, name: &str) -> BurrowResult<String> {
        let tables = self.tables.lock();
        tables
            .get(name)
            .map(|e| e.config.clone())
            .ok_or_else(|| BurrowError::not_found(name))
    }

    fn checkpoint_addr(
        &self,
        name: &str,
        checkpoint: Option<&str>,
    ) -> BurrowResult<Option<BlockRef>> {
        let tables = self.tables.lock();
        let entry = tables
            .get(name)
            .ok_or_else(|| BurrowError::not_found(name))?;
        match entry.roots.get(&ckpt_key(checkpoint)) {
            Some(addr) => Ok(*addr),
            // A live tree that has never been checkpointed is empty; a
            // named checkpoint that was never created does not exist.
            None if checkpoint.is_none() => Ok(None),
            None => Err(BurrowError::not_found(format!(
                "{name} checkpoint {}",
                checkpoint.unwrap_or_default()
            ))),
        }
    }

    fn set_checkpoint_addr(
        &self,
        name: &str,
        checkpoint: Option<&str>,
        addr: Option<BlockRef>,
    ) -> BurrowResult<()> {
        let mut tables = self.tables.lock();
        let entry = tables
            .get_mut(name)
            .ok_or_else(|| BurrowError::not_found(name))?;
        entry.roots.insert(ckpt_key(checkpoint), addr);
        Ok(())
    }
}
