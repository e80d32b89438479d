mod common;

use test_log::test;
use zedstore::{
    pager::INVALID_BLOCK,
    tree::node::{self, TreeOpaque, FLAG_FOLLOW_RIGHT, FLAG_ROOT},
    AttributeSpec, CompressionType, Config, Datum, Slice, Snapshot, Tid, UndoPtr,
};

/// Containers would fuse the single items we want to cut between, so
/// these trees run uncompressed.
fn open_plain(path: &std::path::Path) -> zedstore::Result<zedstore::Store> {
    Config::new(path)
        .attributes(&[AttributeSpec::fixed(8)])
        .compression(CompressionType::None)
        .open()
}

/// Freezes a split between the leaf rewrite and the downlink insert, the
/// way a paused splitter (or a crash) would leave the tree: the left page
/// advertises follow-right, the right page has no parent. Descents must
/// find rows through the right-link, and finishing the split must make
/// them findable through the new downlink.
#[test]
fn split_recovers_through_right_link() -> zedstore::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = open_plain(dir.path())?;

    // Odd TIDs keep every row a single item, so the page can be cut
    // between any two of them
    let tids: Vec<Tid> = (0..100u64).map(|i| Tid::from_raw(1 + 2 * i)).collect();
    let datums: Vec<Datum> = tids
        .iter()
        .map(|t| Some(Slice::from(t.raw().to_le_bytes())))
        .collect();

    let mut insert_tids = tids.clone();
    let mut undo = UndoPtr::INVALID;
    store.multi_insert(1, &datums, &mut insert_tids, 1, 0, &mut undo)?;

    let root_blk = common::root_block(&store, 1);

    // Perform the leaf-rewrite half of a split by hand and stop before
    // the downlink insert
    let (boundary, right_blk) = {
        let pin = store.pager.pin(root_blk)?;
        let mut leaf = pin.exclusive();

        let items = node::leaf_items(&leaf)?;
        assert!(items.len() >= 4, "need enough items to cut the page");

        let split_at = items.len() / 2;
        let boundary = items.get(split_at).expect("split point").tid();

        let (right_pin, right_blk) = store.pager.new_page()?;
        let mut right = right_pin.exclusive();

        node::format_tree_page(
            &mut right,
            &TreeOpaque {
                attno: 1,
                next: INVALID_BLOCK,
                lokey: boundary,
                hikey: Tid::MAX,
                level: 0,
                flags: 0,
            },
        );

        for item in items.iter().skip(split_at) {
            assert!(right.add_item(&item.encode()));
        }

        leaf.clear_items();
        for item in items.iter().take(split_at) {
            assert!(leaf.add_item(&item.encode()));
        }

        node::write_opaque(
            &mut leaf,
            &TreeOpaque {
                attno: 1,
                next: right_blk,
                lokey: Tid::MIN,
                hikey: boundary,
                level: 0,
                flags: FLAG_ROOT | FLAG_FOLLOW_RIGHT,
            },
        );

        (boundary, right_blk)
    };

    // The half-split tree still passes verification: the orphan is
    // covered by its left neighbor's follow-right flag
    common::assert_tree_healthy(&store, 1);

    // Descender one: a lookup of the new right page's first row chases
    // the right-link and succeeds
    let found = store
        .scan(1, boundary, boundary.next(), Snapshot::Any)?
        .collect::<zedstore::Result<Vec<_>>>()?;

    assert_eq!(1, found.len());
    assert_eq!(boundary, found.first().expect("row found").tid);

    // Resume the splitter: install the downlink (this grows the root)
    let left_guard = store.pager.pin(root_blk)?.exclusive();
    zedstore::tree::downlink::insert_downlink(&store, 1, left_guard, boundary, right_blk)?;

    // The left page no longer advertises an in-progress split
    {
        let pin = store.pager.pin(root_blk)?;
        let opaque = node::read_opaque(&pin.share());
        assert!(!opaque.follow_right());
        assert!(!opaque.is_root(), "the root moved up a level");
    }

    // The root directory now points at an internal page with both children
    let new_root = common::root_block(&store, 1);
    assert_ne!(root_blk, new_root);

    {
        let pin = store.pager.pin(new_root)?;
        let page = pin.share();
        let opaque = node::read_opaque(&page);

        assert_eq!(1, opaque.level);
        assert!(opaque.is_root());
        assert_eq!(2, page.item_count());

        assert_eq!(root_blk, node::entry_at(&page, 0).child);
        assert_eq!(right_blk, node::entry_at(&page, 1).child);
        assert_eq!(boundary, node::entry_at(&page, 1).tid);
    }

    // Descender two: the same lookup now resolves through the downlink
    let found = store
        .scan(1, boundary, boundary.next(), Snapshot::Any)?
        .collect::<zedstore::Result<Vec<_>>>()?;
    assert_eq!(1, found.len());

    // And the whole key range still reads back in order
    let all = store
        .scan(1, Tid::MIN, Tid::MAX, Snapshot::Any)?
        .collect::<zedstore::Result<Vec<_>>>()?;

    assert_eq!(100, all.len());
    for (i, tuple) in all.iter().enumerate() {
        assert_eq!(Tid::from_raw(1 + 2 * i as u64), tuple.tid);
    }

    common::assert_tree_healthy(&store, 1);

    Ok(())
}

/// Writers keep working against a half-split tree too: an insert whose
/// key belongs right of the frozen boundary lands on the orphan page via
/// the right-link, and the split completes later without losing it.
#[test]
fn writer_descends_through_follow_right() -> zedstore::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = open_plain(dir.path())?;

    let tids: Vec<Tid> = (0..10u64).map(|i| Tid::from_raw(1 + 2 * i)).collect();
    let datums: Vec<Datum> = tids
        .iter()
        .map(|t| Some(Slice::from(t.raw().to_le_bytes())))
        .collect();

    let mut insert_tids = tids.clone();
    let mut undo = UndoPtr::INVALID;
    store.multi_insert(1, &datums, &mut insert_tids, 1, 0, &mut undo)?;

    let root_blk = common::root_block(&store, 1);

    // Freeze a split at TID 11
    let boundary = Tid::from_raw(11);
    let right_blk = {
        let pin = store.pager.pin(root_blk)?;
        let mut leaf = pin.exclusive();

        let items = node::leaf_items(&leaf)?;
        let split_at = items.iter().position(|i| i.tid() >= boundary).expect("mid");

        let (right_pin, right_blk) = store.pager.new_page()?;
        let mut right = right_pin.exclusive();

        node::format_tree_page(
            &mut right,
            &TreeOpaque {
                attno: 1,
                next: INVALID_BLOCK,
                lokey: boundary,
                hikey: Tid::MAX,
                level: 0,
                flags: 0,
            },
        );

        for item in items.iter().skip(split_at) {
            assert!(right.add_item(&item.encode()));
        }

        leaf.clear_items();
        for item in items.iter().take(split_at) {
            assert!(leaf.add_item(&item.encode()));
        }

        node::write_opaque(
            &mut leaf,
            &TreeOpaque {
                attno: 1,
                next: right_blk,
                lokey: Tid::MIN,
                hikey: boundary,
                level: 0,
                flags: FLAG_ROOT | FLAG_FOLLOW_RIGHT,
            },
        );

        right_blk
    };

    // An appending insert descends by key, chases right, and lands on
    // the orphan page
    let mut new_tids = [Tid::INVALID];
    let mut undo = UndoPtr::INVALID;
    store.multi_insert(
        1,
        &[Some(Slice::from(999u64.to_le_bytes()))],
        &mut new_tids,
        2,
        0,
        &mut undo,
    )?;
    assert_eq!(Tid::from_raw(20), new_tids[0]);

    // Finish the split
    let left_guard = store.pager.pin(root_blk)?.exclusive();
    zedstore::tree::downlink::insert_downlink(&store, 1, left_guard, boundary, right_blk)?;

    let all = store
        .scan(1, Tid::MIN, Tid::MAX, Snapshot::Any)?
        .collect::<zedstore::Result<Vec<_>>>()?;
    assert_eq!(11, all.len());

    common::assert_tree_healthy(&store, 1);

    Ok(())
}
