//! Page reconciliation.
//!
//! Reconciliation turns a dirty in-memory page into one or more bit-exact
//! disk images: it walks the page's entries with their layered updates,
//! builds cells, splits the image at tracked boundaries when it outgrows
//! the maximum page size, and records the outcome on the page — empty,
//! replaced by a single new image, or split into a transient internal page
//! the parent absorbs at its own next reconciliation.
//!
//! Reconciliation is single-writer per page; callers serialize. On any
//! failure the working state is discarded and the page stays dirty, so a
//! later pass can retry; no partial result is ever reachable from a
//! persisted parent.

mod build;
mod col;
mod row;
pub(crate) mod split;
pub mod track;

use burrow_common::memory::ScratchPool;
use burrow_common::{BurrowError, BurrowResult};

pub use split::Reconciler;

use crate::block::BlockManager;
use crate::codec::CodecSet;
use crate::config::BtreeConfig;
use crate::page::mem::{
    ColChild, ColIntPage, Item, Page, PageData, RecResult, RowChild, RowIntPage,
};
use crate::page::types::PageType;

/// Salvage directions for one page: how many leading records in the
/// namespace are missing entirely, how many of the page's records to skip
/// and take, and whether the window has been consumed.
#[derive(Debug, Clone, Default)]
pub struct SalvageState {
    /// Records missing from the namespace before the page's first record.
    pub missing: u64,
    /// Leading page records to discard.
    pub skip: u64,
    /// Page records to keep (zero means all).
    pub take: u64,
    /// Set once the take window is exhausted.
    pub done: bool,
}

/// The collaborators one reconciliation needs.
pub struct RecEnv<'a> {
    /// The block allocator chunks and overflow items are written through.
    pub blocks: &'a dyn BlockManager,
    /// The table's configuration.
    pub config: &'a BtreeConfig,
    /// Optional entropy codecs for keys and values.
    pub codecs: &'a CodecSet,
    /// Scratch buffers for staging images.
    pub scratch: &'a ScratchPool,
}

/// Reconciles a dirty page into persistent disk images.
///
/// Preconditions: the page is marked modified. Postconditions: the page's
/// modify record holds the outcome and all stale tracked blocks have been
/// freed. The caller is responsible for marking the page's parent
/// modified, since the parent must eventually absorb the new child state.
pub fn reconcile(
    r: &mut Reconciler,
    env: &RecEnv<'_>,
    page: &mut Page,
    salvage: Option<&mut SalvageState>,
) -> BurrowResult<()> {
    if !page.is_modified() {
        return Err(BurrowError::internal("reconciling a clean page"));
    }

    tracing::debug!(page_type = %page.page_type(), "reconcile start");

    // Publish the snapshot point before reading anything from the page:
    // changes racing in after this stay dirty for the next pass.
    page.publish_disk_gen();

    match reconcile_page(r, env, page, salvage) {
        Ok(()) => {
            tracing::debug!(
                chunks = r.bnd_next,
                outcome = match page.modify.as_ref().and_then(|m| m.rec_result.as_ref()) {
                    Some(RecResult::Empty) => "empty",
                    Some(RecResult::Replace(_)) => "replace",
                    Some(RecResult::Split(_)) => "split",
                    None => "none",
                },
                "reconcile done"
            );
            Ok(())
        }
        Err(e) => {
            // All-or-nothing: drop the transient state and leave the page
            // dirty for a retry.
            r.reset();
            page.mark_dirty();
            Err(e)
        }
    }
}

fn reconcile_page(
    r: &mut Reconciler,
    env: &RecEnv<'_>,
    page: &mut Page,
    salvage: Option<&mut SalvageState>,
) -> BurrowResult<()> {
    {
        let Page { data, modify, .. } = page;
        let modify = modify.as_mut().expect("modified page has a modify record");

        // Overflow blocks written by the previous pass are provisionally
        // discarded; cells that still reference them reactivate them.
        modify.track.restart_ovfl();
        let track = &mut modify.track;

        match data {
            PageData::ColFix(p) => match salvage {
                Some(s) => col::rec_col_fix_slvg(r, env, p, s)?,
                None => col::rec_col_fix(r, env, p)?,
            },
            PageData::ColInt(p) => col::rec_col_int(r, env, p, track)?,
            PageData::ColVar(p) => col::rec_col_var(r, env, p, track, salvage)?,
            PageData::RowInt(p) => row::rec_row_int(r, env, p, track)?,
            PageData::RowLeaf(p) => row::rec_row_leaf(r, env, p, track, salvage)?,
        }
    }

    write_wrapup(r, env, page)
}

/// Records the reconciliation outcome on the page and releases stale
/// blocks.
fn write_wrapup(r: &mut Reconciler, env: &RecEnv<'_>, page: &mut Page) -> BurrowResult<()> {
    let page_type = page.page_type();
    let modify = page.modify_mut();

    // A previous reconciliation's result is about to be replaced; queue
    // its blocks for freeing.
    match modify.rec_result.take() {
        None | Some(RecResult::Empty) => {}
        Some(RecResult::Replace(block)) => modify.track.track_block(block),
        Some(RecResult::Split(merge)) => match &merge.data {
            PageData::RowInt(p) => {
                for child in &p.children {
                    if let Some(block) = child.addr {
                        modify.track.track_block(block);
                    }
                }
            }
            PageData::ColInt(p) => {
                for child in &p.children {
                    if let Some(block) = child.addr {
                        modify.track.track_block(block);
                    }
                }
            }
            _ => return Err(BurrowError::corruption("merge page is not internal")),
        },
    }

    let result = match r.bnd_next {
        // Nothing written: every record is gone. The parent drops its
        // reference at its own next reconciliation.
        0 => RecResult::Empty,
        // The common case: one page in, one page out.
        1 => {
            let block = r.bnd[0]
                .block
                .ok_or_else(|| BurrowError::corruption("single chunk was never written"))?;
            RecResult::Replace(block)
        }
        // The page split. Build the transient internal page referencing
        // the chunks; it is flagged for merge so every ancestor folds it
        // in rather than deepening the tree.
        n => {
            let mut merge = match page_type {
                PageType::RowLeaf | PageType::RowInt => {
                    let mut children = Vec::with_capacity(n);
                    for bnd in &r.bnd[..n] {
                        let block = bnd
                            .block
                            .ok_or_else(|| BurrowError::corruption("split chunk never written"))?;
                        children.push(RowChild {
                            key: Item::plain(bnd.key.clone()),
                            addr: Some(block),
                            page: None,
                        });
                    }
                    Page::new(PageData::RowInt(RowIntPage { children }))
                }
                PageType::ColFix | PageType::ColVar | PageType::ColInt => {
                    let mut children = Vec::with_capacity(n);
                    for bnd in &r.bnd[..n] {
                        let block = bnd
                            .block
                            .ok_or_else(|| BurrowError::corruption("split chunk never written"))?;
                        children.push(ColChild {
                            recno: bnd.recno,
                            addr: Some(block),
                            page: None,
                        });
                    }
                    Page::new(PageData::ColInt(ColIntPage {
                        recno: r.bnd[0].recno,
                        children,
                    }))
                }
                PageType::Ovfl => return Err(BurrowError::corruption("illegal page type")),
            };
            merge.merge = true;
            RecResult::Split(Box::new(merge))
        }
    };
    modify.rec_result = Some(result);

    // Free everything still queued: old images, replaced overflow blocks,
    // and overflow items nothing reactivated.
    modify.track.discard(env.blocks)
}
