//! Tracked-block list.
//!
//! Each modified page keeps a list of block references touched by
//! reconciliation: old images and replaced overflow blocks queued for
//! freeing, and live overflow blocks that may be reused if their bytes are
//! unchanged next time the page is written.
//!
//! The protocol across one reconciliation:
//! 1. `restart_ovfl` flips every live overflow entry to discard state.
//! 2. While building cells, `reactivate` searches for a discarded overflow
//!    entry with the same source bytes; a hit flips it back to live and its
//!    block is reused without a new write.
//! 3. `discard` frees everything still queued (stale blocks and overflow
//!    entries nothing reactivated); live overflow entries survive into the
//!    next reconciliation.

use burrow_common::BurrowResult;

use crate::block::{BlockManager, BlockRef};

/// State of a tracked block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    /// Cleared slot.
    Empty,
    /// A block queued for freeing (an old page image or replaced overflow).
    Block,
    /// A live overflow block, eligible for reuse.
    Ovfl,
    /// An overflow block provisionally queued for freeing; reactivated if
    /// its bytes are written again unchanged.
    OvflDiscard,
}

/// One tracked block.
#[derive(Debug, Clone)]
pub struct Tracked {
    /// Entry state.
    pub kind: TrackKind,
    /// Source bytes of an overflow item, used to match reuse candidates.
    /// `None` for plain blocks and for overflow keys, which are never
    /// reused.
    pub ref_bytes: Option<Vec<u8>>,
    /// The block.
    pub block: BlockRef,
}

/// Growth quantum for the entry list; amortizes allocation the same way
/// the boundary list does.
const TRACK_GROW: usize = 20;

/// Per-page list of tracked blocks.
#[derive(Debug, Default)]
pub struct TrackList {
    entries: Vec<Tracked>,
}

impl TrackList {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of non-empty entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|t| t.kind != TrackKind::Empty)
            .count()
    }

    /// True if no entries are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&mut self, entry: Tracked) {
        if self.entries.len() == self.entries.capacity() {
            self.entries.reserve(TRACK_GROW);
        }
        self.entries.push(entry);
    }

    /// Queues a block for freeing at wrap-up.
    pub fn track_block(&mut self, block: BlockRef) {
        self.push(Tracked {
            kind: TrackKind::Block,
            ref_bytes: None,
            block,
        });
    }

    /// Records a newly written overflow block.
    ///
    /// `ref_bytes` carries the item's source bytes for values; overflow
    /// keys pass `None` and are rewritten on every reconciliation.
    pub fn track_ovfl(&mut self, ref_bytes: Option<Vec<u8>>, block: BlockRef) {
        self.push(Tracked {
            kind: TrackKind::Ovfl,
            ref_bytes,
            block,
        });
    }

    /// Flips live overflow entries to discard state at the start of a
    /// reconciliation.
    pub fn restart_ovfl(&mut self) {
        for entry in &mut self.entries {
            if entry.kind == TrackKind::Ovfl {
                entry.kind = TrackKind::OvflDiscard;
            }
        }
    }

    /// Searches for a discarded overflow entry whose source bytes equal
    /// `ref_bytes`; on a hit the entry goes back to live state and its
    /// block is returned for reuse.
    ///
    /// `None` never matches: overflow keys are not tracked for reuse.
    pub fn reactivate(&mut self, ref_bytes: Option<&[u8]>) -> Option<BlockRef> {
        let ref_bytes = ref_bytes?;
        for entry in &mut self.entries {
            if matches!(entry.kind, TrackKind::Ovfl | TrackKind::OvflDiscard)
                && entry.ref_bytes.as_deref() == Some(ref_bytes)
            {
                // A live entry here would mean two cells claimed the same
                // overflow item in a single pass.
                debug_assert!(entry.kind == TrackKind::OvflDiscard);
                entry.kind = TrackKind::Ovfl;
                return Some(entry.block);
            }
        }
        None
    }

    /// Frees every queued block through the block manager; live overflow
    /// entries survive.
    pub fn discard(&mut self, blocks: &dyn BlockManager) -> BurrowResult<()> {
        for entry in &mut self.entries {
            match entry.kind {
                TrackKind::Empty | TrackKind::Ovfl => continue,
                TrackKind::Block | TrackKind::OvflDiscard => {
                    tracing::trace!(addr = %entry.block.addr, size = entry.block.size,
                        "discarding tracked block");
                    blocks.free(entry.block)?;
                    entry.kind = TrackKind::Empty;
                    entry.ref_bytes = None;
                    entry.block = BlockRef::INVALID;
                }
            }
        }
        Ok(())
    }

    /// Iterates non-empty entries.
    pub fn iter(&self) -> impl Iterator<Item = &Tracked> {
        self.entries.iter().filter(|t| t.kind != TrackKind::Empty)
    }
}
