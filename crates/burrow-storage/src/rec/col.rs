//! Column-store page walks.

use burrow_common::{BurrowError, BurrowResult};

use crate::block::BlockRef;
use crate::page::bitfield::{bit_get, bit_set, bitstr_size};
use crate::page::cell::{self, CellType};
use crate::page::mem::{ColFixPage, ColIntPage, ColVarPage, RecResult, Update, VarCell};
use crate::page::types::PageType;
use crate::rec::split::{Kv, Reconciler};
use crate::rec::track::TrackList;
use crate::rec::{RecEnv, SalvageState};

/// Reconciles a column-store internal page.
pub(crate) fn rec_col_int(
    r: &mut Reconciler,
    env: &RecEnv<'_>,
    page: &ColIntPage,
    track: &mut TrackList,
) -> BurrowResult<()> {
    r.split_init(PageType::ColInt, page.recno, env.config.max_intl_page);

    // Top-level and merge walks look identical for column stores: the only
    // payload is the child-reference triple, always taken from memory.
    rec_col_merge(r, env, page, track)?;

    r.split_finish(env)
}

/// Recursively walks an internal page and any merge pages hanging off it.
fn rec_col_merge(
    r: &mut Reconciler,
    env: &RecEnv<'_>,
    page: &ColIntPage,
    track: &mut TrackList,
) -> BurrowResult<()> {
    for child in &page.children {
        // Keep the starting record number current in case of a split.
        r.recno = child.recno;

        let off = match &child.page {
            None => child.addr.ok_or_else(|| {
                BurrowError::corruption("child has neither a page nor an address")
            })?,
            Some(cp) => match cp.modify.as_ref().and_then(|m| m.rec_result.as_ref()) {
                Some(RecResult::Empty) => {
                    // Column formats can't delete pages: dropping one would
                    // tear a hole in the record-number namespace.
                    return Err(BurrowError::corruption("empty column-store child"));
                }
                Some(RecResult::Replace(block)) => *block,
                Some(RecResult::Split(merge)) => {
                    let merge = match &merge.data {
                        crate::page::mem::PageData::ColInt(p) => p,
                        _ => {
                            return Err(BurrowError::corruption(
                                "column split produced a non-column merge page",
                            ))
                        }
                    };
                    rec_col_merge(r, env, merge, track)?;
                    continue;
                }
                None => {
                    if cp.merge {
                        let merge = match &cp.data {
                            crate::page::mem::PageData::ColInt(p) => p,
                            _ => return Err(BurrowError::corruption("merge page is not internal")),
                        };
                        rec_col_merge(r, env, merge, track)?;
                        continue;
                    }
                    child.addr.ok_or_else(|| {
                        BurrowError::corruption("clean in-memory child has no address")
                    })?
                }
            },
        };

        let head = cell::pack_off_recno(off, child.recno);
        while head.len() > r.space_avail {
            r.split(env)?;
        }

        debug_assert!(off.is_valid());
        r.val.head = head;
        r.val.data.clear();
        r.val.len = head.len();
        r.copy_incr(Kv::Val, 1);
    }
    Ok(())
}

fn update_byte(update: &Update) -> u8 {
    match update.data() {
        Some(data) => data.first().copied().unwrap_or(0),
        None => 0,
    }
}

/// Reconciles a fixed-width column-store leaf page.
///
/// The base bit string is copied into the image, updates are applied in
/// place, and the append list is replayed, filling record-number gaps with
/// zero-valued entries.
pub(crate) fn rec_col_fix(
    r: &mut Reconciler,
    env: &RecEnv<'_>,
    page: &ColFixPage,
) -> BurrowResult<()> {
    let width = env.config.fixed_bit_width;
    r.split_init(PageType::ColFix, page.recno, env.config.max_leaf_page);

    // Copy the stored records and layer the updates over them.
    let base_len = bitstr_size(page.entries as usize * usize::from(width));
    if base_len > r.space_avail {
        return Err(BurrowError::corruption("fixed-width page exceeds its maximum"));
    }
    let base = r.first_free;
    r.dsk[base..base + base_len].copy_from_slice(&page.bitf[..base_len]);
    for upd in &page.updates {
        let idx = (upd.recno - page.recno) as usize;
        bit_set(&mut r.dsk[base..], idx, width, update_byte(&upd.update));
    }

    let mut entry = page.entries as usize;
    let capacity = r.space_avail * 8 / usize::from(width);
    let mut nrecs = capacity.saturating_sub(entry);
    r.recno += u64::from(page.entries);

    // Replay the append list.
    for ins in &page.append {
        loop {
            // Appends may have left gaps in the record-number namespace.
            while nrecs > 0 && r.recno < ins.recno {
                let base = r.first_free;
                bit_set(&mut r.dsk[base..], entry, width, 0);
                nrecs -= 1;
                entry += 1;
                r.recno += 1;
            }

            if nrecs > 0 {
                let base = r.first_free;
                bit_set(&mut r.dsk[base..], entry, width, update_byte(&ins.update));
                nrecs -= 1;
                entry += 1;
                r.recno += 1;
                break;
            }

            // The chunk filled up; write it and keep going.
            r.incr(entry as u32, bitstr_size(entry * usize::from(width)));
            r.split(env)?;

            entry = 0;
            nrecs = r.space_avail * 8 / usize::from(width);
        }
    }

    r.incr(entry as u32, bitstr_size(entry * usize::from(width)));
    r.split_finish(env)
}

/// Reconciles a fixed-width column-store leaf page during salvage.
///
/// Salvage replaces missing leading records with zero-valued entries, then
/// copies a skip/take window of the page's records. Overlapping ranges
/// should be impossible for fixed-width pages, but the arithmetic defends
/// against them anyway.
pub(crate) fn rec_col_fix_slvg(
    r: &mut Reconciler,
    env: &RecEnv<'_>,
    page: &ColFixPage,
    salvage: &mut SalvageState,
) -> BurrowResult<()> {
    let width = env.config.fixed_bit_width;
    r.split_init(PageType::ColFix, page.recno, env.config.max_leaf_page);

    let mut page_take = if salvage.take == 0 {
        u64::from(page.entries)
    } else {
        salvage.take
    };
    let mut page_start = salvage.skip;

    loop {
        let mut entry = 0usize;
        let mut nrecs = r.space_avail * 8 / usize::from(width);

        while nrecs > 0 && salvage.missing > 0 {
            let base = r.first_free;
            bit_set(&mut r.dsk[base..], entry, width, 0);
            nrecs -= 1;
            salvage.missing -= 1;
            entry += 1;
        }

        while nrecs > 0 && page_take > 0 {
            let base = r.first_free;
            let v = bit_get(&page.bitf, page_start as usize, width);
            bit_set(&mut r.dsk[base..], entry, width, v);
            nrecs -= 1;
            page_take -= 1;
            page_start += 1;
            entry += 1;
        }

        r.recno += entry as u64;
        r.incr(entry as u32, bitstr_size(entry * usize::from(width)));

        if salvage.missing == 0 && page_take == 0 {
            break;
        }
        r.split(env)?;
    }

    salvage.done = true;
    r.split_finish(env)
}

/// The value handed to the variable-width helper.
enum HelperVal<'a> {
    /// A run of deleted records.
    Deleted,
    /// A run of identical values.
    Value(&'a [u8]),
    /// An untouched overflow cell, re-referenced without decoding.
    RawOvfl(BlockRef),
}

/// Builds and places one variable-width cell, applying the salvage window
/// (skip leading records, take a bounded count) to the run length.
fn rec_col_var_helper(
    r: &mut Reconciler,
    env: &RecEnv<'_>,
    track: &mut TrackList,
    salvage: Option<&mut SalvageState>,
    val: HelperVal<'_>,
    mut rle: u64,
) -> BurrowResult<()> {
    // Salvage may discard records from the front or back of the page, and
    // the records are buried in RLE runs; adjust here rather than
    // complicating every caller's loop.
    if let Some(salvage) = salvage {
        if salvage.done {
            return Ok(());
        }
        if salvage.skip != 0 {
            if rle <= salvage.skip {
                salvage.skip -= rle;
                return Ok(());
            }
            rle -= salvage.skip;
            salvage.skip = 0;
        }
        if salvage.take != 0 {
            if rle <= salvage.take {
                salvage.take -= rle;
            } else {
                rle = salvage.take;
                salvage.take = 0;
            }
            if salvage.take == 0 {
                salvage.done = true;
            }
        }
    }

    match val {
        HelperVal::Deleted => {
            r.val.head = cell::pack_del(rle);
            r.val.data.clear();
            r.val.len = r.val.head.len();
        }
        HelperVal::RawOvfl(block) => {
            r.set_ovfl_ref(Kv::Val, CellType::ValueOvfl, rle, block);
        }
        HelperVal::Value(data) => r.build_val(env, track, data, rle)?,
    }

    while r.val.len > r.space_avail {
        r.split(env)?;
    }

    debug_assert!(rle <= u64::from(u32::MAX));
    r.copy_incr(Kv::Val, rle as u32);
    r.recno += rle;
    Ok(())
}

/// Reconciles a variable-width column-store leaf page.
///
/// Tracks a current comparison record through the walk: while the next
/// record matches (both deleted, or byte-equal), the run grows; otherwise
/// the tracked run is flushed and restarted. Overflow cells with no
/// pending updates pass through untouched and break the chain.
pub(crate) fn rec_col_var(
    r: &mut Reconciler,
    env: &RecEnv<'_>,
    page: &ColVarPage,
    track: &mut TrackList,
    mut salvage: Option<&mut SalvageState>,
) -> BurrowResult<()> {
    r.split_init(PageType::ColVar, page.recno, env.config.max_leaf_page);

    // Salvage may need deleted records writing first to plug a hole in the
    // record-number namespace; that consumes the cookie's missing count on
    // its own, without the helper's skip/take machinery.
    let slvg_missing = salvage.as_ref().map_or(0, |s| s.missing);
    if slvg_missing != 0 {
        rec_col_var_helper(r, env, track, None, HelperVal::Deleted, slvg_missing)?;
    }

    let mut src_recno = r.recno;
    let mut rle: u64 = 0;
    let mut can_compare = false;
    let mut last_deleted = false;
    // r.last carries the value being tracked for run-length encoding.
    r.last.clear();

    for entry in &page.entries {
        // Untouched overflow cells are re-referenced as raw cells; flush
        // whatever run was being tracked, the chain is broken.
        if let VarCell::Val { item, rle: cell_rle } = &entry.cell {
            if let (Some(block), true) = (item.ovfl, entry.updates.is_empty()) {
                if can_compare {
                    let last = std::mem::take(&mut r.last);
                    let hv = if last_deleted {
                        HelperVal::Deleted
                    } else {
                        HelperVal::Value(&last)
                    };
                    rec_col_var_helper(r, env, track, salvage.as_deref_mut(), hv, rle)?;
                    r.last = last;
                    can_compare = false;
                }

                rec_col_var_helper(
                    r,
                    env,
                    track,
                    salvage.as_deref_mut(),
                    HelperVal::RawOvfl(block),
                    *cell_rle,
                )?;
                src_recno += cell_rle;
                continue;
            }
        }

        let (nrepeat, orig_deleted, orig_data) = match &entry.cell {
            VarCell::Del { rle } => (*rle, true, &[][..]),
            VarCell::Val { item, rle } => {
                // Records of this overflow cell are being rewritten; the
                // underlying blocks go back to the allocator.
                if let Some(block) = item.ovfl {
                    track.track_block(block);
                }
                (*rle, false, item.data.as_slice())
            }
        };

        // Walk the run, folding in updates by record number. The update
        // list is sorted, so only the next one needs checking.
        let mut updates = entry.updates.iter().peekable();
        let mut n: u64 = 0;
        while n < nrepeat {
            let deleted;
            let data;
            let repeat_count;
            match updates.peek() {
                Some(u) if u.recno == src_recno => {
                    let u = updates.next().expect("peeked");
                    deleted = u.update.is_remove();
                    data = u.update.data().unwrap_or(&[]);
                    repeat_count = 1;
                }
                next => {
                    deleted = orig_deleted;
                    data = orig_data;
                    // Repeat up to the next update, or to the run's end.
                    repeat_count = match next {
                        None => nrepeat - n,
                        Some(u) => (u.recno - src_recno).min(nrepeat - n),
                    };
                }
            }

            if can_compare {
                if (deleted && last_deleted)
                    || (!last_deleted && !deleted && r.last.as_slice() == data)
                {
                    // Same record as the last one: extend the run.
                    rle += repeat_count;
                    n += repeat_count;
                    src_recno += repeat_count;
                    continue;
                }

                let last = std::mem::take(&mut r.last);
                let hv = if last_deleted {
                    HelperVal::Deleted
                } else {
                    HelperVal::Value(&last)
                };
                rec_col_var_helper(r, env, track, salvage.as_deref_mut(), hv, rle)?;
                r.last = last;
            }

            if !deleted {
                r.last.clear();
                r.last.extend_from_slice(data);
            }
            last_deleted = deleted;
            rle = repeat_count;
            can_compare = true;

            n += repeat_count;
            src_recno += repeat_count;
        }
    }

    // Replay the append list, one record at a time; gaps in the namespace
    // become deleted records.
    for ins in &page.append {
        while src_recno <= ins.recno {
            let (deleted, data) = if src_recno < ins.recno {
                (true, &[][..])
            } else {
                (
                    ins.update.is_remove(),
                    ins.update.data().unwrap_or(&[]),
                )
            };

            if can_compare {
                if (deleted && last_deleted)
                    || (!last_deleted && !deleted && r.last.as_slice() == data)
                {
                    rle += 1;
                    src_recno += 1;
                    continue;
                }

                let last = std::mem::take(&mut r.last);
                let hv = if last_deleted {
                    HelperVal::Deleted
                } else {
                    HelperVal::Value(&last)
                };
                rec_col_var_helper(r, env, track, salvage.as_deref_mut(), hv, rle)?;
                r.last = last;
            }

            if !deleted {
                r.last.clear();
                r.last.extend_from_slice(data);
            }
            last_deleted = deleted;
            rle = 1;
            can_compare = true;
            src_recno += 1;
        }
    }

    // Flush the final tracked run.
    if can_compare {
        let last = std::mem::take(&mut r.last);
        let hv = if last_deleted {
            HelperVal::Deleted
        } else {
            HelperVal::Value(&last)
        };
        rec_col_var_helper(r, env, track, salvage.as_deref_mut(), hv, rle)?;
        r.last = last;
    }

    r.split_finish(env)
}
