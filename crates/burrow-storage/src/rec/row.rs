//! Row-store page walks.

use burrow_common::{BurrowError, BurrowResult};

use crate::block::BlockRef;
use crate::page::cell::CellType;
use crate::page::mem::{RecResult, RowInsert, RowIntPage, RowLeafPage};
use crate::page::types::PageType;
use crate::rec::split::{Kv, Reconciler};
use crate::rec::track::TrackList;
use crate::rec::{RecEnv, SalvageState};

/// Reconciles a row-store leaf page.
///
/// Replays per-slot updates over the on-page entries, honoring deletes and
/// zero-length values, and merges the insert lists: the one before the
/// first on-page key, then the one hanging off each slot.
pub(crate) fn rec_row_leaf(
    r: &mut Reconciler,
    env: &RecEnv<'_>,
    page: &RowLeafPage,
    track: &mut TrackList,
    salvage: Option<&mut SalvageState>,
) -> BurrowResult<()> {
    r.split_init(PageType::RowLeaf, 0, env.config.max_leaf_page);

    // Salvage occasionally wants leading records skipped.
    let mut slvg_skip = salvage.map_or(0, |s| s.skip);

    // K/V pairs inserted before the first on-page key.
    rec_row_leaf_insert(r, env, track, &page.insert_smallest)?;

    for slot in &page.slots {
        if slvg_skip != 0 {
            slvg_skip -= 1;
            continue;
        }

        // Build the value cell.
        match &slot.update {
            None => {
                if let Some(block) = slot.value.ovfl {
                    // Unchanged overflow value: re-reference its block.
                    r.set_ovfl_ref(Kv::Val, CellType::ValueOvfl, 0, block);
                } else if slot.value.data.is_empty() {
                    r.clear_val();
                } else {
                    r.build_val(env, track, &slot.value.data, 0)?;
                }
            }
            Some(update) => {
                // The stored value is being replaced; free its overflow
                // block if it had one.
                if let Some(block) = slot.value.ovfl {
                    track.track_block(block);
                }

                match update.data() {
                    None => {
                        // Deleted pair: free an overflow key too, then move
                        // on to the slot's insert list.
                        if let Some(block) = slot.key.ovfl {
                            track.track_block(block);
                        }
                        rec_row_leaf_insert(r, env, track, &slot.inserts)?;
                        continue;
                    }
                    Some(data) if data.is_empty() => r.clear_val(),
                    Some(data) => r.build_val(env, track, data, 0)?,
                }
            }
        }

        // Build the key cell; an existing overflow key is re-referenced
        // rather than rebuilt.
        let ovfl_key = match slot.key.ovfl {
            Some(block) => {
                r.set_ovfl_ref(Kv::Key, CellType::KeyOvfl, 0, block);
                true
            }
            None => r.build_key(env, track, Some(&slot.key.data), false)?,
        };

        // Boundary: the pair plus the trailing key cell must fit. Crossing
        // a split point invalidates prefix compression until a full key is
        // written; a re-referenced overflow key needs its bytes saved for
        // promotion.
        while r.key.len + r.val.len + 1 > r.space_avail {
            if ovfl_key && slot.key.ovfl.is_some() {
                r.cur.clear();
                r.cur.extend_from_slice(&slot.key.data);
            }
            r.split(env)?;

            r.key_pfx_compress = false;
            if !ovfl_key {
                r.build_key(env, track, None, false)?;
            }
        }

        r.copy_incr(Kv::Key, 1);
        if r.val.len != 0 {
            r.copy_incr(Kv::Val, 0);
        }
        r.key_state_update(ovfl_key);

        // K/V pairs inserted after this slot's key.
        rec_row_leaf_insert(r, env, track, &slot.inserts)?;
    }

    r.split_finish(env)
}

/// Walks an insert list, writing K/V pairs.
fn rec_row_leaf_insert(
    r: &mut Reconciler,
    env: &RecEnv<'_>,
    track: &mut TrackList,
    inserts: &[RowInsert],
) -> BurrowResult<()> {
    for ins in inserts {
        let data = match ins.update.data() {
            None => continue, // deleted before ever reaching disk
            Some(data) => data,
        };

        if data.is_empty() {
            r.clear_val();
        } else {
            r.build_val(env, track, data, 0)?;
        }
        let ovfl_key = r.build_key(env, track, Some(&ins.key), false)?;

        while r.key.len + r.val.len + 1 > r.space_avail {
            r.split(env)?;

            r.key_pfx_compress = false;
            if !ovfl_key {
                r.build_key(env, track, None, false)?;
            }
        }

        r.copy_incr(Kv::Key, 1);
        if r.val.len != 0 {
            r.copy_incr(Kv::Val, 0);
        }
        r.key_state_update(ovfl_key);
    }
    Ok(())
}

/// How a child reference resolves during an internal-page walk.
enum ChildState<'a> {
    /// Use this address.
    Addr(BlockRef),
    /// The child emptied; drop the reference.
    Dropped,
    /// The child split; merge the transient internal page inline.
    Merge(&'a RowIntPage),
}

fn resolve_row_child<'a>(
    child: &'a crate::page::mem::RowChild,
) -> BurrowResult<ChildState<'a>> {
    let page = match &child.page {
        None => {
            let addr = child.addr.ok_or_else(|| {
                BurrowError::corruption("child has neither a page nor an address")
            })?;
            return Ok(ChildState::Addr(addr));
        }
        Some(page) => page,
    };

    match page.modify.as_ref().and_then(|m| m.rec_result.as_ref()) {
        Some(RecResult::Empty) => Ok(ChildState::Dropped),
        Some(RecResult::Replace(block)) => Ok(ChildState::Addr(*block)),
        Some(RecResult::Split(merge)) => match &merge.data {
            crate::page::mem::PageData::RowInt(p) => Ok(ChildState::Merge(p)),
            _ => Err(BurrowError::corruption("row split produced a non-row merge page")),
        },
        None => {
            if page.merge {
                // The child is itself a transient merge page.
                match &page.data {
                    crate::page::mem::PageData::RowInt(p) => Ok(ChildState::Merge(p)),
                    _ => Err(BurrowError::corruption("merge page is not internal")),
                }
            } else {
                let addr = child.addr.ok_or_else(|| {
                    BurrowError::corruption("clean in-memory child has no address")
                })?;
                Ok(ChildState::Addr(addr))
            }
        }
    }
}

/// Reconciles a row-store internal page.
pub(crate) fn rec_row_int(
    r: &mut Reconciler,
    env: &RecEnv<'_>,
    page: &RowIntPage,
    track: &mut TrackList,
) -> BurrowResult<()> {
    r.split_init(PageType::RowInt, 0, env.config.max_intl_page);

    // The 0th key is never consulted by tree search (nothing can sort less
    // than it), so it's truncated rather than stored whole.
    r.cell_zero = true;

    for child in &page.children {
        let off = match resolve_row_child(child)? {
            ChildState::Addr(block) => block,
            ChildState::Dropped => {
                // The reference disappears; an overflow key goes with it.
                if let Some(block) = child.key.ovfl {
                    track.track_block(block);
                }
                continue;
            }
            ChildState::Merge(merge) => {
                // The subtree's 0th key may have been bypassed by a
                // smaller insert; the original reference's key is the one
                // known to sort below everything in the subtree.
                r.merge_key = Some(child.key.data.clone());
                rec_row_merge(r, env, merge, track)?;
                continue;
            }
        };

        // Build the key cell; overflow keys are re-referenced, and the 0th
        // key is truncated to a single byte.
        let ovfl_key = match child.key.ovfl {
            Some(block) => {
                r.set_ovfl_ref(Kv::Key, CellType::KeyOvfl, 0, block);
                true
            }
            None => {
                let data = &child.key.data;
                let take = if r.cell_zero { data.len().min(1) } else { data.len() };
                r.build_key(env, track, Some(&data[..take]), true)?
            }
        };
        r.cell_zero = false;

        r.val.head = crate::page::cell::pack_off(off);
        r.val.data.clear();
        r.val.len = r.val.head.len();

        while r.key.len + r.val.len > r.space_avail {
            if ovfl_key && child.key.ovfl.is_some() {
                r.cur.clear();
                r.cur.extend_from_slice(&child.key.data);
            }
            r.split(env)?;

            r.key_pfx_compress = false;
            if !ovfl_key {
                r.build_key(env, track, None, true)?;
            }
        }

        r.copy_incr(Kv::Key, 1);
        debug_assert!(off.is_valid());
        r.copy_incr(Kv::Val, 0);

        r.key_state_update(ovfl_key);
    }

    r.split_finish(env)
}

/// Recursively folds a transient merge page's children into the image
/// being built for an ancestor.
fn rec_row_merge(
    r: &mut Reconciler,
    env: &RecEnv<'_>,
    page: &RowIntPage,
    track: &mut TrackList,
) -> BurrowResult<()> {
    for child in &page.children {
        let off = match resolve_row_child(child)? {
            ChildState::Addr(block) => block,
            ChildState::Dropped => continue,
            ChildState::Merge(merge) => {
                rec_row_merge(r, env, merge, track)?;
                continue;
            }
        };

        // The first merged key is the correction saved by the top-level
        // walk, when one is pending.
        let key_data = match r.merge_key.take() {
            Some(key) => key,
            None => child.key.data.clone(),
        };
        let take = if r.cell_zero { key_data.len().min(1) } else { key_data.len() };
        let ovfl_key = r.build_key(env, track, Some(&key_data[..take]), true)?;
        r.cell_zero = false;

        r.val.head = crate::page::cell::pack_off(off);
        r.val.data.clear();
        r.val.len = r.val.head.len();

        while r.key.len + r.val.len > r.space_avail {
            r.split(env)?;

            r.key_pfx_compress = false;
            if !ovfl_key {
                r.build_key(env, track, None, true)?;
            }
        }

        r.copy_incr(Kv::Key, 1);
        debug_assert!(off.is_valid());
        r.copy_incr(Kv::Val, 0);

        r.key_state_update(ovfl_key);
    }
    Ok(())
}
