//! The backing tree of one data handle.
//!
//! A `Btree` ties together a table's configuration, its block manager, the
//! in-memory root page, and the per-table reconciliation context (created
//! lazily on the first reconciliation, reused for every page after that).
//!
//! The checkpoint pathway reconciles dirty pages bottom-up — reconciling a
//! child marks its parent modified, since the parent must absorb the new
//! child state — then records the root address in the catalog. A root
//! split is resolved by promoting the transient merge page to be the new
//! root and reconciling again.

use std::sync::Arc;

use burrow_common::memory::ScratchPool;
use burrow_common::{BurrowError, BurrowResult};

use crate::block::{BlockManager, BlockRef};
use crate::codec::CodecSet;
use crate::config::BtreeConfig;
use crate::meta::Catalog;
use crate::page::mem::{Page, PageData, RecResult, Update};
use crate::rec::{self, RecEnv, Reconciler, SalvageState};

/// A table's backing tree.
pub struct Btree {
    name: String,
    config: BtreeConfig,
    codecs: CodecSet,
    blocks: Arc<dyn BlockManager>,
    scratch: ScratchPool,
    root: Option<Page>,
    rec: Option<Box<Reconciler>>,
    root_addr: Option<BlockRef>,
    readonly: bool,
}

impl Btree {
    /// Opens a tree over a block manager.
    ///
    /// `root_addr` is the checkpoint cookie from the catalog; `None` means
    /// an empty tree. Checkpoint handles open readonly: their snapshot is
    /// immutable by definition.
    pub fn open(
        name: String,
        config: BtreeConfig,
        blocks: Arc<dyn BlockManager>,
        root_addr: Option<BlockRef>,
        readonly: bool,
    ) -> BurrowResult<Self> {
        let codecs = CodecSet::none();
        let root = match root_addr {
            None => None,
            Some(addr) => {
                let image = blocks.read(addr)?;
                let mut page = Page::from_image(&image, blocks.as_ref(), &config, &codecs)?;
                page.disk = Some(addr);
                Some(page)
            }
        };

        Ok(Self {
            name,
            config,
            codecs,
            blocks,
            scratch: ScratchPool::new(),
            root,
            rec: None,
            root_addr,
            readonly,
        })
    }

    /// The table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The tree's configuration.
    #[must_use]
    pub fn config(&self) -> &BtreeConfig {
        &self.config
    }

    /// The tree's block manager.
    #[must_use]
    pub fn blocks(&self) -> &Arc<dyn BlockManager> {
        &self.blocks
    }

    /// The root address recorded by the last checkpoint.
    #[must_use]
    pub fn root_addr(&self) -> Option<BlockRef> {
        self.root_addr
    }

    /// The in-memory root page, if any.
    #[must_use]
    pub fn root(&self) -> Option<&Page> {
        self.root.as_ref()
    }

    /// Mutable access to the in-memory root page.
    pub fn root_mut(&mut self) -> Option<&mut Page> {
        self.root.as_mut()
    }

    /// Installs a root page (used when building trees outside the normal
    /// insert path).
    pub fn set_root(&mut self, page: Page) {
        self.root = Some(page);
    }

    /// Configures entropy codecs for this tree.
    pub fn set_codecs(&mut self, codecs: CodecSet) {
        self.codecs = codecs;
    }

    /// Inserts or updates a row-store key.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> BurrowResult<()> {
        self.row_apply(key, Update::Set(value.to_vec()))
    }

    /// Removes a row-store key.
    pub fn remove(&mut self, key: &[u8]) -> BurrowResult<()> {
        self.row_apply(key, Update::Remove)
    }

    fn row_apply(&mut self, key: &[u8], update: Update) -> BurrowResult<()> {
        if self.readonly {
            return Err(BurrowError::InvalidArgument {
                message: "checkpoint handles are read-only".to_string(),
            });
        }
        if self.root.is_none() {
            self.root = Some(Page::new_row_leaf());
        }
        let Self {
            root,
            blocks,
            config,
            codecs,
            ..
        } = self;
        let page = root.as_mut().expect("root was just ensured");
        row_descend_apply(blocks.as_ref(), config, codecs, page, key, update)
    }

    /// Applies an update to a column-store record, descending to the leaf
    /// that owns its record number.
    pub fn col_apply(&mut self, recno: u64, update: Update) -> BurrowResult<()> {
        if self.readonly {
            return Err(BurrowError::InvalidArgument {
                message: "checkpoint handles are read-only".to_string(),
            });
        }
        let Self {
            root,
            blocks,
            config,
            codecs,
            ..
        } = self;
        let page = root.as_mut().ok_or_else(|| BurrowError::InvalidArgument {
            message: "column tree has no root page".to_string(),
        })?;
        col_descend_apply(blocks.as_ref(), config, codecs, page, recno, update)
    }

    fn env(&self) -> RecEnv<'_> {
        RecEnv {
            blocks: self.blocks.as_ref(),
            config: &self.config,
            codecs: &self.codecs,
            scratch: &self.scratch,
        }
    }

    /// Reconciles the root page directly; primarily for salvage, which
    /// feeds the reconciler page by page.
    pub fn reconcile_root(&mut self, salvage: Option<&mut SalvageState>) -> BurrowResult<()> {
        let Self {
            root,
            rec,
            blocks,
            config,
            codecs,
            scratch,
            ..
        } = self;
        let page = root
            .as_mut()
            .ok_or_else(|| BurrowError::internal("tree has no root page"))?;
        let env = RecEnv {
            blocks: blocks.as_ref(),
            config,
            codecs,
            scratch,
        };
        let r: &mut Reconciler = rec.get_or_insert_with(|| Box::new(Reconciler::new(config)));
        rec::reconcile(r, &env, page, salvage)
    }

    /// Checkpoints the tree: reconciles every dirty page bottom-up and
    /// records the live root address in the catalog.
    pub fn checkpoint(&mut self, catalog: &dyn Catalog) -> BurrowResult<()> {
        if self.readonly {
            return Ok(());
        }

        let Self {
            name,
            root,
            rec,
            blocks,
            config,
            codecs,
            scratch,
            root_addr,
            ..
        } = self;

        if let Some(page) = root.as_mut() {
            let env = RecEnv {
                blocks: blocks.as_ref(),
                config,
                codecs,
                scratch,
            };
            let r: &mut Reconciler = rec.get_or_insert_with(|| Box::new(Reconciler::new(config)));

            checkpoint_walk(r, &env, page)?;

            loop {
                let split = matches!(
                    page.modify.as_ref().and_then(|m| m.rec_result.as_ref()),
                    Some(RecResult::Split(_))
                );
                if split {
                    // The root split: the transient merge page becomes the
                    // new root and is reconciled in its own right, deepening
                    // the tree by one level.
                    let merge = match page.modify_mut().rec_result.take() {
                        Some(RecResult::Split(merge)) => merge,
                        _ => unreachable!("split checked above"),
                    };
                    let mut new_root = *merge;
                    new_root.merge = false;
                    new_root.mark_dirty();
                    *page = new_root;
                    rec::reconcile(r, &env, page, None)?;
                    continue;
                }

                match page.modify.as_ref().and_then(|m| m.rec_result.as_ref()) {
                    Some(RecResult::Empty) => *root_addr = None,
                    Some(RecResult::Replace(block)) => *root_addr = Some(*block),
                    Some(RecResult::Split(_)) => unreachable!("split handled above"),
                    None => {} // clean root; address unchanged
                }
                break;
            }
        }

        catalog.set_checkpoint_addr(name, None, *root_addr)?;
        tracing::debug!(name = %name, root = ?root_addr, "checkpoint complete");
        Ok(())
    }

    /// Checkpoints the tree and records the result under a checkpoint
    /// name, creating an immutable named snapshot.
    pub fn named_checkpoint(
        &mut self,
        catalog: &dyn Catalog,
        checkpoint: &str,
    ) -> BurrowResult<()> {
        self.checkpoint(catalog)?;
        catalog.set_checkpoint_addr(&self.name, Some(checkpoint), self.root_addr)
    }
}

impl std::fmt::Debug for Btree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Btree")
            .field("name", &self.name)
            .field("root_addr", &self.root_addr)
            .field("readonly", &self.readonly)
            .finish()
    }
}

/// Reconciles dirty pages bottom-up; reconciling a child marks the parent
/// modified. Returns true if this page was reconciled.
fn checkpoint_walk(r: &mut Reconciler, env: &RecEnv<'_>, page: &mut Page) -> BurrowResult<bool> {
    let mut child_changed = false;
    match &mut page.data {
        PageData::RowInt(p) => {
            for child in &mut p.children {
                if let Some(cp) = child.page.as_deref_mut() {
                    if checkpoint_walk(r, env, cp)? {
                        child_changed = true;
                    }
                }
            }
        }
        PageData::ColInt(p) => {
            for child in &mut p.children {
                if let Some(cp) = child.page.as_deref_mut() {
                    if checkpoint_walk(r, env, cp)? {
                        child_changed = true;
                    }
                }
            }
        }
        _ => {}
    }

    if child_changed {
        page.mark_dirty();
    }
    if page.is_modified() {
        rec::reconcile(r, env, page, None)?;
        return Ok(true);
    }
    Ok(false)
}

fn row_descend_apply(
    blocks: &dyn BlockManager,
    config: &BtreeConfig,
    codecs: &CodecSet,
    page: &mut Page,
    key: &[u8],
    update: Update,
) -> BurrowResult<()> {
    match &mut page.data {
        PageData::RowLeaf(p) => {
            p.apply(key, update);
            page.mark_dirty();
            Ok(())
        }
        PageData::RowInt(p) => {
            // The last child whose routing key sorts at or below the
            // search key; the 0th child routes everything smaller.
            let mut idx = 0;
            for (i, child) in p.children.iter().enumerate().skip(1) {
                if child.key.data.as_slice() <= key {
                    idx = i;
                } else {
                    break;
                }
            }
            let child = &mut p.children[idx];
            if child.page.is_none() {
                let addr = child.addr.ok_or_else(|| {
                    BurrowError::corruption("child has neither a page nor an address")
                })?;
                let image = blocks.read(addr)?;
                let mut cp = Page::from_image(&image, blocks, config, codecs)?;
                cp.disk = Some(addr);
                child.page = Some(Box::new(cp));
            }
            row_descend_apply(
                blocks,
                config,
                codecs,
                child.page.as_deref_mut().expect("child was just loaded"),
                key,
                update,
            )
        }
        _ => Err(BurrowError::InvalidArgument {
            message: "not a row-store tree".to_string(),
        }),
    }
}

fn col_descend_apply(
    blocks: &dyn BlockManager,
    config: &BtreeConfig,
    codecs: &CodecSet,
    page: &mut Page,
    recno: u64,
    update: Update,
) -> BurrowResult<()> {
    match &mut page.data {
        PageData::ColVar(p) => {
            p.apply(recno, update);
            page.mark_dirty();
            Ok(())
        }
        PageData::ColFix(p) => {
            p.apply(recno, update);
            page.mark_dirty();
            Ok(())
        }
        PageData::ColInt(p) => {
            let mut idx = 0;
            for (i, child) in p.children.iter().enumerate().skip(1) {
                if child.recno <= recno {
                    idx = i;
                } else {
                    break;
                }
            }
            let child = &mut p.children[idx];
            if child.page.is_none() {
                let addr = child.addr.ok_or_else(|| {
                    BurrowError::corruption("child has neither a page nor an address")
                })?;
                let image = blocks.read(addr)?;
                let mut cp = Page::from_image(&image, blocks, config, codecs)?;
                cp.disk = Some(addr);
                child.page = Some(Box::new(cp));
            }
            col_descend_apply(
                blocks,
                config,
                codecs,
                child.page.as_deref_mut().expect("child was just loaded"),
                recno,
                update,
            )
        }
        _ => Err(BurrowError::InvalidArgument {
            message: "not a column-store tree".to_string(),
        }),
    }
}
