//! Column-store reconciliation: run-length encoding, fixed-width packing,
//! gap filling, and salvage windows.

use std::sync::Arc;

use burrow_common::memory::ScratchPool;
use burrow_storage::block::MemBlockManager;
use burrow_storage::codec::CodecSet;
use burrow_storage::config::BtreeConfig;
use burrow_storage::page::bitfield::{bit_get, bit_set, bitstr_size};
use burrow_storage::page::{
    ChunkHeader, ColFixPage, ColVarPage, Item, Page, PageData, RecResult, Update, VarCell,
    VarEntry, CHUNK_HEADER_SIZE,
};
use burrow_storage::rec::{reconcile, RecEnv, Reconciler, SalvageState};
use burrow_storage::{BlockManager, PageType};

struct Fixture {
    blocks: Arc<MemBlockManager>,
    config: BtreeConfig,
    codecs: CodecSet,
    scratch: ScratchPool,
}

impl Fixture {
    fn new(config: BtreeConfig) -> Self {
        Self {
            blocks: Arc::new(MemBlockManager::new()),
            config,
            codecs: CodecSet::none(),
            scratch: ScratchPool::new(),
        }
    }

    fn env(&self) -> RecEnv<'_> {
        RecEnv {
            blocks: self.blocks.as_ref(),
            config: &self.config,
            codecs: &self.codecs,
            scratch: &self.scratch,
        }
    }

    fn reconcile(&self, page: &mut Page, salvage: Option<&mut SalvageState>) {
        let mut r = Reconciler::new(&self.config);
        page.mark_dirty();
        reconcile(&mut r, &self.env(), page, salvage).expect("reconcile succeeds");
    }

    fn chunks(&self, page: &Page) -> Vec<Vec<u8>> {
        match page.modify.as_ref().and_then(|m| m.rec_result.as_ref()) {
            Some(RecResult::Replace(block)) => vec![self.blocks.read(*block).unwrap()],
            Some(RecResult::Split(merge)) => match &merge.data {
                PageData::ColInt(p) => p
                    .children
                    .iter()
                    .map(|c| self.blocks.read(c.addr.unwrap()).unwrap())
                    .collect(),
                other => panic!("unexpected merge page {other:?}"),
            },
            other => panic!("no chunks for {other:?}"),
        }
    }
}

/// Decodes a variable-width chunk into (deleted, bytes, rle) runs.
fn decode_runs(fx: &Fixture, image: &[u8]) -> Vec<(bool, Vec<u8>, u64)> {
    let page = Page::from_image(image, fx.blocks.as_ref(), &fx.config, &fx.codecs).unwrap();
    match page.data {
        PageData::ColVar(p) => p
            .entries
            .into_iter()
            .map(|e| match e.cell {
                VarCell::Del { rle } => (true, Vec::new(), rle),
                VarCell::Val { item, rle } => (false, item.data, rle),
            })
            .collect(),
        other => panic!("expected a column leaf, got {other:?}"),
    }
}

fn var_page_of_runs(recno: u64, runs: &[(&[u8], u64)]) -> Page {
    let entries = runs
        .iter()
        .map(|(data, rle)| VarEntry {
            cell: VarCell::Val {
                item: Item::plain(data.to_vec()),
                rle: *rle,
            },
            updates: Vec::new(),
        })
        .collect();
    Page::new(PageData::ColVar(ColVarPage {
        recno,
        entries,
        append: Vec::new(),
    }))
}

#[test]
fn overwrite_mid_run_produces_three_runs() {
    let fx = Fixture::new(BtreeConfig::for_testing());

    // Records 1..=1000 all "v", then record 500 overwritten with "w".
    let mut page = var_page_of_runs(1, &[(b"v", 1000)]);
    if let PageData::ColVar(p) = &mut page.data {
        p.apply(500, Update::Set(b"w".to_vec()));
    }
    fx.reconcile(&mut page, None);

    let images = fx.chunks(&page);
    assert_eq!(images.len(), 1);
    let header = ChunkHeader::read_from(&images[0]).unwrap();
    assert_eq!(header.page_type, PageType::ColVar);
    assert_eq!(header.recno, 1);
    assert_eq!(header.entries, 1000);

    assert_eq!(
        decode_runs(&fx, &images[0]),
        vec![
            (false, b"v".to_vec(), 499),
            (false, b"w".to_vec(), 1),
            (false, b"v".to_vec(), 500),
        ]
    );
}

#[test]
fn rle_groups_round_trip() {
    let fx = Fixture::new(BtreeConfig::for_testing());

    let runs: Vec<(&[u8], u64)> = vec![
        (b"aaa", 17),
        (b"bb", 1),
        (b"aaa", 3),
        (b"cccc", 250),
    ];
    let mut page = var_page_of_runs(10, &runs);
    fx.reconcile(&mut page, None);

    let images = fx.chunks(&page);
    let decoded = decode_runs(&fx, &images[0]);
    assert_eq!(decoded.len(), runs.len());
    for ((deleted, data, rle), (expect_data, expect_rle)) in decoded.iter().zip(&runs) {
        assert!(!deleted);
        assert_eq!(data.as_slice(), *expect_data);
        assert_eq!(rle, expect_rle);
        assert!(*rle >= 1);
    }
}

#[test]
fn adjacent_equal_runs_coalesce() {
    let fx = Fixture::new(BtreeConfig::for_testing());

    // Two physically separate but equal runs, plus updates that make the
    // middle record equal too: the whole page collapses to one run.
    let mut page = var_page_of_runs(1, &[(b"x", 10), (b"y", 1), (b"x", 10)]);
    if let PageData::ColVar(p) = &mut page.data {
        p.apply(11, Update::Set(b"x".to_vec()));
    }
    fx.reconcile(&mut page, None);

    let images = fx.chunks(&page);
    assert_eq!(
        decode_runs(&fx, &images[0]),
        vec![(false, b"x".to_vec(), 21)]
    );
}

#[test]
fn deleted_records_encode_as_del_runs() {
    let fx = Fixture::new(BtreeConfig::for_testing());

    let mut page = var_page_of_runs(1, &[(b"v", 10)]);
    if let PageData::ColVar(p) = &mut page.data {
        for recno in 4..=6 {
            p.apply(recno, Update::Remove);
        }
    }
    fx.reconcile(&mut page, None);

    let images = fx.chunks(&page);
    assert_eq!(
        decode_runs(&fx, &images[0]),
        vec![
            (false, b"v".to_vec(), 3),
            (true, Vec::new(), 3),
            (false, b"v".to_vec(), 4),
        ]
    );
}

#[test]
fn append_list_gaps_become_deleted_records() {
    let fx = Fixture::new(BtreeConfig::for_testing());

    let mut page = var_page_of_runs(1, &[(b"v", 5)]);
    if let PageData::ColVar(p) = &mut page.data {
        // Records 6..=7 never written; record 8 appended.
        p.apply(8, Update::Set(b"w".to_vec()));
    }
    fx.reconcile(&mut page, None);

    let images = fx.chunks(&page);
    assert_eq!(
        decode_runs(&fx, &images[0]),
        vec![
            (false, b"v".to_vec(), 5),
            (true, Vec::new(), 2),
            (false, b"w".to_vec(), 1),
        ]
    );
    let header = ChunkHeader::read_from(&images[0]).unwrap();
    assert_eq!(header.entries, 8);
}

#[test]
fn untouched_overflow_cell_passes_through_raw() {
    let config = BtreeConfig::for_testing().with_max_leaf_item(32);
    let fx = Fixture::new(config);

    // Seed an overflow value through a first reconciliation.
    let big = vec![0x5A; 200];
    let mut page = var_page_of_runs(1, &[(&big, 4), (b"s", 2)]);
    fx.reconcile(&mut page, None);
    let writes_after_seed = fx.blocks.stats().writes;
    assert_eq!(writes_after_seed, 2, "overflow block plus page image");

    // Reload the image: the overflow cell now references its block.
    let images = fx.chunks(&page);
    let mut reloaded =
        Page::from_image(&images[0], fx.blocks.as_ref(), &fx.config, &fx.codecs).unwrap();
    let ovfl_block = match &reloaded.data {
        PageData::ColVar(p) => match &p.entries[0].cell {
            VarCell::Val { item, .. } => item.ovfl.expect("overflow value"),
            other => panic!("unexpected {other:?}"),
        },
        other => panic!("unexpected {other:?}"),
    };

    // Update only the plain run; the overflow cell is untouched and must
    // be re-emitted raw, referencing the same block.
    if let PageData::ColVar(p) = &mut reloaded.data {
        p.apply(5, Update::Set(b"t".to_vec()));
    }
    fx.reconcile(&mut reloaded, None);

    let images = fx.chunks(&reloaded);
    let runs = decode_runs(&fx, &images[0]);
    assert_eq!(runs[0], (false, big.clone(), 4));
    let reparsed =
        Page::from_image(&images[0], fx.blocks.as_ref(), &fx.config, &fx.codecs).unwrap();
    match &reparsed.data {
        PageData::ColVar(p) => match &p.entries[0].cell {
            VarCell::Val { item, .. } => {
                assert_eq!(item.ovfl, Some(ovfl_block), "same overflow block, no decode");
            }
            other => panic!("unexpected {other:?}"),
        },
        other => panic!("unexpected {other:?}"),
    }
    // The overflow block was never rewritten.
    assert_eq!(fx.blocks.stats().writes, writes_after_seed + 1);
}

#[test]
fn col_var_salvage_window() {
    let fx = Fixture::new(BtreeConfig::for_testing());

    // 3 missing records, skip 2, take 5 of a 10-record page.
    let mut page = var_page_of_runs(10, &[(b"v", 10)]);
    let mut salvage = SalvageState {
        missing: 3,
        skip: 2,
        take: 5,
        done: false,
    };
    fx.reconcile(&mut page, Some(&mut salvage));
    assert!(salvage.done);

    let images = fx.chunks(&page);
    assert_eq!(
        decode_runs(&fx, &images[0]),
        vec![(true, Vec::new(), 3), (false, b"v".to_vec(), 5)]
    );
}

#[test]
fn col_fix_packs_and_applies_updates() {
    let config = BtreeConfig::for_testing().with_fixed_bit_width(8);
    let fx = Fixture::new(config);

    let entries = 16u32;
    let width = 8u8;
    let mut bitf = vec![0u8; bitstr_size(entries as usize * usize::from(width))];
    for i in 0..entries as usize {
        bit_set(&mut bitf, i, width, i as u8);
    }
    let mut page = Page::new(PageData::ColFix(ColFixPage {
        recno: 1,
        entries,
        bitf,
        updates: Vec::new(),
        append: Vec::new(),
    }));
    if let PageData::ColFix(p) = &mut page.data {
        p.apply(3, Update::Set(vec![0xEE]));
    }
    fx.reconcile(&mut page, None);

    let images = fx.chunks(&page);
    let header = ChunkHeader::read_from(&images[0]).unwrap();
    assert_eq!(header.page_type, PageType::ColFix);
    assert_eq!(header.entries, 16);
    assert_eq!(header.recno, 1);

    let bits = &images[0][CHUNK_HEADER_SIZE..];
    assert_eq!(bit_get(bits, 2, width), 0xEE, "update applied in place");
    assert_eq!(bit_get(bits, 5, width), 5, "other records untouched");
}

#[test]
fn col_fix_append_gaps_fill_with_zeroes() {
    let config = BtreeConfig::for_testing().with_fixed_bit_width(8);
    let fx = Fixture::new(config);

    let mut page = Page::new(PageData::ColFix(ColFixPage {
        recno: 1,
        entries: 4,
        bitf: vec![0x11, 0x22, 0x33, 0x44],
        updates: Vec::new(),
        append: Vec::new(),
    }));
    if let PageData::ColFix(p) = &mut page.data {
        // Records 5..=7 skipped; record 8 appended.
        p.apply(8, Update::Set(vec![0x99]));
    }
    fx.reconcile(&mut page, None);

    let images = fx.chunks(&page);
    let header = ChunkHeader::read_from(&images[0]).unwrap();
    assert_eq!(header.entries, 8);

    let bits = &images[0][CHUNK_HEADER_SIZE..];
    assert_eq!(bit_get(bits, 3, 8), 0x44);
    assert_eq!(bit_get(bits, 4, 8), 0, "gap filled with zero");
    assert_eq!(bit_get(bits, 5, 8), 0, "gap filled with zero");
    assert_eq!(bit_get(bits, 6, 8), 0, "gap filled with zero");
    assert_eq!(bit_get(bits, 7, 8), 0x99);
}

#[test]
fn col_fix_salvage_missing_and_window() {
    let config = BtreeConfig::for_testing().with_fixed_bit_width(8);
    let fx = Fixture::new(config);

    let mut page = Page::new(PageData::ColFix(ColFixPage {
        recno: 100,
        entries: 8,
        bitf: (1..=8u8).collect(),
        updates: Vec::new(),
        append: Vec::new(),
    }));
    let mut salvage = SalvageState {
        missing: 2,
        skip: 3,
        take: 4,
        done: false,
    };
    fx.reconcile(&mut page, Some(&mut salvage));
    assert!(salvage.done);

    let images = fx.chunks(&page);
    let header = ChunkHeader::read_from(&images[0]).unwrap();
    assert_eq!(header.entries, 6, "2 missing plus 4 taken");

    let bits = &images[0][CHUNK_HEADER_SIZE..];
    assert_eq!(bit_get(bits, 0, 8), 0);
    assert_eq!(bit_get(bits, 1, 8), 0);
    // Records 4..=7 of the page (values 4..=7) follow the missing run.
    for i in 0..4 {
        assert_eq!(bit_get(bits, 2 + i, 8), 4 + i as u8);
    }
}

#[test]
fn col_var_splits_keep_recnos_ascending() {
    let config = BtreeConfig::for_testing()
        .with_max_leaf_page(512)
        .with_alloc_size(64);
    let fx = Fixture::new(config);

    // Distinct 16-byte values defeat run-length encoding, forcing bulk.
    let runs: Vec<(Vec<u8>, u64)> = (0..120)
        .map(|i| (format!("value-{i:010}").into_bytes(), 1))
        .collect();
    let borrowed: Vec<(&[u8], u64)> = runs.iter().map(|(d, r)| (d.as_slice(), *r)).collect();
    let mut page = var_page_of_runs(1, &borrowed);
    fx.reconcile(&mut page, None);

    let merge = match page.modify.as_ref().unwrap().rec_result.as_ref() {
        Some(RecResult::Split(merge)) => merge,
        other => panic!("expected a split, got {other:?}"),
    };
    let children = match &merge.data {
        PageData::ColInt(p) => &p.children,
        other => panic!("unexpected merge page {other:?}"),
    };
    assert!(children.len() >= 2);
    assert_eq!(children[0].recno, 1);

    // Starting recnos ascend strictly, and each chunk's header agrees with
    // its merge-page entry.
    let mut expected_recno = 1;
    for pair in children.windows(2) {
        assert!(pair[0].recno < pair[1].recno);
    }
    let mut total = 0u64;
    for child in children {
        let image = fx.blocks.read(child.addr.unwrap()).unwrap();
        let header = ChunkHeader::read_from(&image).unwrap();
        assert_eq!(header.recno, child.recno);
        assert_eq!(header.recno, expected_recno);
        expected_recno += u64::from(header.entries);
        total += u64::from(header.entries);
    }
    assert_eq!(total, 120);
}
