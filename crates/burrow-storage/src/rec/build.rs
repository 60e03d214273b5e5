//! Key and value cell construction.
//!
//! One key or value at a time is assembled into the context's cell slots:
//! prefix compression against the last key, optional codec encoding, and
//! promotion to an overflow block when the encoded item exceeds the
//! per-page item limit. Overflow values whose source bytes are unchanged
//! since the last reconciliation reuse their existing block.

use burrow_common::constants::MAX_KEY_PREFIX;
use burrow_common::BurrowResult;

use crate::page::cell::{self, CellType};
use crate::page::header::{ChunkHeader, CHUNK_HEADER_SIZE};
use crate::page::types::PageType;
use crate::rec::split::{Kv, KvCell, Reconciler};
use crate::rec::track::TrackList;
use crate::rec::RecEnv;

impl Reconciler {
    /// Builds a key cell in the key slot.
    ///
    /// `data` is the full key; `None` means "rebuild from the saved copy of
    /// the current key", used when a prefix-compressed form can no longer
    /// be used (the caller just crossed a split point, or an oversized key
    /// must be written whole). Returns true if the key was promoted to an
    /// overflow block.
    pub(crate) fn build_key(
        &mut self,
        env: &RecEnv<'_>,
        track: &mut TrackList,
        data: Option<&[u8]>,
        is_internal: bool,
    ) -> BurrowResult<bool> {
        let mut prefix: u8 = 0;

        match data {
            None => {
                // The saved full key, verbatim.
                self.key.data.clear();
                self.key.data.extend_from_slice(&self.cur);
            }
            Some(data) => {
                // Keep a full copy: it seeds prefix comparisons and is the
                // fallback if the compressed form can't be used.
                self.cur.clear();
                self.cur.extend_from_slice(data);

                if self.key_pfx_compress {
                    // The previous key sorts first, so the keys differ; a
                    // one-byte wire field caps the removable prefix.
                    let max = data.len().min(self.last.len()).min(MAX_KEY_PREFIX);
                    while (prefix as usize) < max
                        && data[prefix as usize] == self.last[prefix as usize]
                    {
                        prefix += 1;
                    }
                }

                self.key.data.clear();
                self.key.data.extend_from_slice(&data[prefix as usize..]);
            }
        }

        if let Some(codec) = &env.codecs.key {
            self.key.data = codec.encode(&self.key.data);
        }

        let max_item = if is_internal {
            env.config.max_intl_item
        } else {
            env.config.max_leaf_item
        };
        if self.key.data.len() > max_item {
            // Overflow keys are never prefix-compressed; retry with the
            // full key if this one was.
            if prefix == 0 {
                self.build_ovfl(env, track, Kv::Key, CellType::KeyOvfl, 0, None)?;
                return Ok(true);
            }
            return self.build_key(env, track, None, is_internal);
        }

        self.key.head = cell::pack_key(prefix, self.key.data.len());
        self.key.len = self.key.head.len() + self.key.data.len();
        Ok(false)
    }

    /// Builds a value cell in the value slot.
    ///
    /// `rle` is the repeat count for column stores (zero or one both mean a
    /// single record). Oversized values are promoted to overflow blocks,
    /// reusing an unchanged block from the previous reconciliation when the
    /// tracker has one.
    pub(crate) fn build_val(
        &mut self,
        env: &RecEnv<'_>,
        track: &mut TrackList,
        data: &[u8],
        rle: u64,
    ) -> BurrowResult<()> {
        self.val.data.clear();
        self.val.data.extend_from_slice(data);

        if !data.is_empty() {
            if let Some(codec) = &env.codecs.value {
                self.val.data = codec.encode(&self.val.data);
            }

            if self.val.data.len() > env.config.max_leaf_item {
                return self.build_ovfl(
                    env,
                    track,
                    Kv::Val,
                    CellType::ValueOvfl,
                    rle,
                    Some(data),
                );
            }
        }

        self.val.head = cell::pack_value(rle, self.val.data.len());
        self.val.len = self.val.head.len() + self.val.data.len();
        Ok(())
    }

    /// Stores the slot's payload in an overflow block and rewrites the
    /// slot as a reference cell.
    ///
    /// `ref_bytes` identifies the item for reuse matching: values pass
    /// their source bytes, keys pass `None` and are rewritten every time.
    fn build_ovfl(
        &mut self,
        env: &RecEnv<'_>,
        track: &mut TrackList,
        which: Kv,
        cell_type: CellType,
        rle: u64,
        ref_bytes: Option<&[u8]>,
    ) -> BurrowResult<()> {
        let kv = match which {
            Kv::Key => &mut self.key,
            Kv::Val => &mut self.val,
        };

        let block = match track.reactivate(ref_bytes) {
            Some(block) => block,
            None => {
                let block = write_ovfl_chunk(env, &kv.data)?;
                track.track_ovfl(ref_bytes.map(<[u8]>::to_vec), block);
                block
            }
        };

        kv.head = cell::pack_ovfl(cell_type, rle, block);
        kv.data.clear();
        kv.len = kv.head.len();
        Ok(())
    }

    /// Rewrites a slot as a reference to an existing overflow block, with
    /// no new write (the block's contents are known to be current).
    pub(crate) fn set_ovfl_ref(
        &mut self,
        which: Kv,
        cell_type: CellType,
        rle: u64,
        block: crate::block::BlockRef,
    ) {
        let kv = match which {
            Kv::Key => &mut self.key,
            Kv::Val => &mut self.val,
        };
        kv.head = cell::pack_ovfl(cell_type, rle, block);
        kv.data.clear();
        kv.len = kv.head.len();
    }

    /// Clears the value slot: no value cell will be written.
    pub(crate) fn clear_val(&mut self) {
        self.val = KvCell::default();
    }

    /// Updates compression state after a key lands on the page.
    ///
    /// An overflow key leaves the last-key state alone (it holds no bytes
    /// to compress against) and disables suffix compression, because the
    /// next promotion would have nothing to truncate against. A normal key
    /// becomes the new last key and re-enables whatever the configuration
    /// allows.
    pub(crate) fn key_state_update(&mut self, ovfl_key: bool) {
        if ovfl_key {
            self.key_sfx_compress = false;
        } else {
            std::mem::swap(&mut self.cur, &mut self.last);
            self.key_pfx_compress = self.key_pfx_compress_conf;
            self.key_sfx_compress = self.key_sfx_compress_conf;
        }
    }
}

/// Writes one overflow chunk: a header plus the item bytes.
fn write_ovfl_chunk(env: &RecEnv<'_>, data: &[u8]) -> BurrowResult<crate::block::BlockRef> {
    let mut tmp = env.scratch.get(CHUNK_HEADER_SIZE + data.len());
    let header = ChunkHeader {
        page_type: PageType::Ovfl,
        entries: data.len() as u32,
        recno: 0,
        data_len: data.len() as u32,
    };
    header.write_to(&mut tmp);
    tmp[CHUNK_HEADER_SIZE..].copy_from_slice(data);
    env.blocks.write(&tmp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockManager, MemBlockManager};
    use crate::codec::CodecSet;
    use crate::config::BtreeConfig;
    use crate::page::mem::read_overflow;
    use burrow_common::memory::ScratchPool;

    struct Fixture {
        blocks: MemBlockManager,
        config: BtreeConfig,
        codecs: CodecSet,
        scratch: ScratchPool,
    }

    impl Fixture {
        fn new(config: BtreeConfig) -> Self {
            Self {
                blocks: MemBlockManager::new(),
                config,
                codecs: CodecSet::none(),
                scratch: ScratchPool::new(),
            }
        }

        fn env(&self) -> RecEnv<'_> {
            RecEnv {
                blocks: &self.blocks,
                config: &self.config,
                codecs: &self.codecs,
                scratch: &self.scratch,
            }
        }
    }

    fn setup(config: &BtreeConfig) -> (Reconciler, TrackList) {
        let mut r = Reconciler::new(config);
        r.split_init(PageType::RowLeaf, 0, config.max_leaf_page);
        (r, TrackList::new())
    }

    #[test]
    fn test_prefix_compression() {
        let fx = Fixture::new(BtreeConfig::for_testing());
        let (mut r, mut track) = setup(&fx.config);

        let ovfl = r.build_key(&fx.env(), &mut track, Some(b"apple"), false).unwrap();
        assert!(!ovfl);
        assert_eq!(r.key.data, b"apple");
        r.key_state_update(false);

        let ovfl = r.build_key(&fx.env(), &mut track, Some(b"applesauce"), false).unwrap();
        assert!(!ovfl);
        // 5 shared bytes elided.
        assert_eq!(r.key.data, b"sauce");
        let mut img = r.key.head.as_slice().to_vec();
        img.extend_from_slice(&r.key.data);
        let parsed = cell::unpack(&img, 0).unwrap();
        assert_eq!(parsed.prefix, 5);
    }

    #[test]
    fn test_prefix_capped_at_255() {
        let fx = Fixture::new(BtreeConfig::for_testing().with_max_leaf_item(4096));
        let (mut r, mut track) = setup(&fx.config);

        let base = vec![b'a'; 300];
        let mut longer = base.clone();
        longer.push(b'z');

        r.build_key(&fx.env(), &mut track, Some(&base), false).unwrap();
        r.key_state_update(false);
        r.build_key(&fx.env(), &mut track, Some(&longer), false).unwrap();

        // 300 shared bytes, but only 255 can be elided.
        assert_eq!(r.key.data.len(), longer.len() - 255);
    }

    #[test]
    fn test_rebuild_from_saved_key() {
        let fx = Fixture::new(BtreeConfig::for_testing());
        let (mut r, mut track) = setup(&fx.config);

        r.build_key(&fx.env(), &mut track, Some(b"hello"), false).unwrap();
        r.key_state_update(false);
        r.build_key(&fx.env(), &mut track, Some(b"help"), false).unwrap();
        assert_eq!(r.key.data, b"p");

        // After a split the compressed form is unusable; None rebuilds the
        // full key.
        r.key_pfx_compress = false;
        r.build_key(&fx.env(), &mut track, None, false).unwrap();
        assert_eq!(r.key.data, b"help");
    }

    #[test]
    fn test_value_overflow_promotion_and_reuse() {
        let fx = Fixture::new(BtreeConfig::for_testing().with_max_leaf_item(64));
        let (mut r, mut track) = setup(&fx.config);

        let big = vec![0xCD; 500];
        r.build_val(&fx.env(), &mut track, &big, 0).unwrap();

        let writes_after_first = fx.blocks.stats().writes;
        assert_eq!(writes_after_first, 1);

        // The overflow chunk holds the bytes.
        let mut img = r.val.head.as_slice().to_vec();
        img.extend_from_slice(&r.val.data);
        let parsed = cell::unpack(&img, 0).unwrap();
        assert_eq!(parsed.cell_type, CellType::ValueOvfl);
        assert_eq!(read_overflow(&fx.blocks, parsed.block).unwrap(), big);

        // Next reconciliation: same bytes reuse the block.
        track.restart_ovfl();
        r.build_val(&fx.env(), &mut track, &big, 0).unwrap();
        assert_eq!(fx.blocks.stats().writes, writes_after_first);
        track.discard(&fx.blocks).unwrap();
        assert_eq!(fx.blocks.stats().frees, 0);
    }

    #[test]
    fn test_oversized_prefixed_key_retries_with_full_key() {
        let fx = Fixture::new(BtreeConfig::for_testing().with_max_leaf_item(100));
        let (mut r, mut track) = setup(&fx.config);

        let mut a = vec![b'k'; 90];
        a.push(b'a');
        let mut b = vec![b'k'; 90];
        b.extend_from_slice(&vec![b'b'; 60]);

        r.build_key(&fx.env(), &mut track, Some(&a), false).unwrap();
        r.key_state_update(false);

        // b's suffix alone fits, but the full key does not: the overflow
        // object must carry the whole key, not the suffix.
        let ovfl = r.build_key(&fx.env(), &mut track, Some(&b), false).unwrap();
        assert!(ovfl);
        let img = r.key.head.as_slice().to_vec();
        let parsed = cell::unpack(&img, 0).unwrap();
        assert_eq!(parsed.cell_type, CellType::KeyOvfl);
        assert_eq!(read_overflow(&fx.blocks, parsed.block).unwrap(), b);
    }

    #[test]
    fn test_ovfl_key_disables_suffix_compression() {
        let fx = Fixture::new(BtreeConfig::for_testing().with_max_leaf_item(8));
        let (mut r, mut track) = setup(&fx.config);
        r.key_sfx_compress = true;

        let ovfl = r
            .build_key(&fx.env(), &mut track, Some(&vec![b'x'; 50]), false)
            .unwrap();
        assert!(ovfl);
        r.key_state_update(true);
        assert!(!r.key_sfx_compress);
        // Last-key state untouched: prefix state preserved for later keys.
    }
}
