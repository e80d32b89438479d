mod common;

use test_log::test;
use zedstore::{
    tree::rewrite::fetch_item, AttributeSpec, ItemFlags, Slice, Snapshot, Tid, UndoPtr,
};

/// A dead tombstone survives page rewrites while the UNDO horizon is at
/// or below its marker, is elided by the first rewrite after the horizon
/// passes, and its TID becomes usable again.
#[test]
fn tombstone_lifecycle() -> zedstore::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = common::open_store(dir.path(), &[AttributeSpec::fixed(8)])?;
    let attr = AttributeSpec::fixed(8);

    let mut tids = vec![Tid::INVALID; 20];
    let mut undo = UndoPtr::INVALID;
    let datums: Vec<_> = (0..20u64).map(|i| Some(Slice::from(i.to_le_bytes()))).collect();
    store.multi_insert(1, &datums, &mut tids, 1, 0, &mut undo)?;

    let seven = Tid::from_raw(7);
    let marker = store.next_undo_counter()?;

    store.mark_item_dead(1, seven, marker)?;

    let leaf_items =
        |store: &zedstore::Store| -> zedstore::Result<Option<zedstore::tree::rewrite::FetchedItem>> {
            let root = common::root_block(store, 1);
            let pin = store.pager.pin(root)?;
            let page = pin.share();
            fetch_item(&page, &attr, store.compression, seven)
        };

    // The tombstone is there and the row is gone from scans
    let found = leaf_items(&store)?.expect("tombstone present");
    assert!(found.flags.contains(ItemFlags::DEAD));
    assert_eq!(marker, found.undo);

    let visible: Vec<_> = store
        .scan(1, Tid::MIN, Tid::MAX, Snapshot::Any)?
        .collect::<zedstore::Result<Vec<_>>>()?;
    assert_eq!(19, visible.len());
    assert!(visible.iter().all(|t| t.tid != seven));

    // Marking dead twice yields the same page image as once
    let image_once = {
        let root = common::root_block(&store, 1);
        store.pager.pin(root)?.share().bytes().to_vec()
    };

    store.mark_item_dead(1, seven, marker)?;

    let image_twice = {
        let root = common::root_block(&store, 1);
        store.pager.pin(root)?.share().bytes().to_vec()
    };
    assert_eq!(image_once, image_twice);

    // A rewrite below the horizon keeps the tombstone
    let other = Tid::from_raw(15);
    store.mark_item_dead(1, other, store.next_undo_counter()?)?;
    assert!(leaf_items(&store)?.is_some(), "tombstone must survive rewrites");

    // Push the horizon past the marker; the next rewrite elides it
    store.advance_undo_horizon(UndoPtr::from_raw(marker.raw() + 10))?;
    store.mark_item_dead(1, Tid::from_raw(16), store.next_undo_counter()?)?;

    assert!(
        leaf_items(&store)?.is_none(),
        "tombstone should be gone after the horizon passed"
    );

    // The TID is reusable now
    let mut reuse_tids = [seven];
    let mut reuse_undo = UndoPtr::INVALID;
    store.multi_insert(
        1,
        &[Some(Slice::from(777u64.to_le_bytes()))],
        &mut reuse_tids,
        2,
        0,
        &mut reuse_undo,
    )?;

    let found = leaf_items(&store)?.expect("row reinserted at the freed TID");
    assert!(!found.flags.contains(ItemFlags::DEAD));
    assert_eq!(
        777u64.to_le_bytes().as_slice(),
        &**found.datum.as_ref().expect("non-null"),
    );

    common::assert_tree_healthy(&store, 1);

    Ok(())
}

/// Rolling back a deletion restores visibility, and replaying the
/// rollback with a stale pointer is a no-op.
#[test]
fn undo_item_deletion_is_idempotent() -> zedstore::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = common::open_store(dir.path(), &[AttributeSpec::fixed(8)])?;

    let inserter = store.transactions().begin();
    common::insert_batch(&store, 5, inserter, 0, |i| {
        Some(Slice::from((i as u64).to_le_bytes()))
    })?;
    store.transactions().commit(inserter);

    let deleter = store.transactions().begin();
    let target = Tid::from_raw(3);
    store.delete_row(target, deleter, 0, &store.mvcc_for(deleter, 0))?;

    // The pointer the delete installed is the newest record
    let delete_ptr = UndoPtr::from_raw(store.next_undo_counter()?.raw() - 1);

    store.transactions().abort(deleter);

    // Roll the deletion back (vacuum after an abort does this)
    store.undo_item_deletion(zedstore::META_ATTRIBUTE, target, delete_ptr)?;

    let rows = common::visible_row_tids(&store, store.mvcc_snapshot())?;
    assert_eq!(5, rows.len());
    assert!(rows.contains(&target));

    // Replaying with the now-stale pointer changes nothing
    let image_before = {
        let root = common::root_block(&store, zedstore::META_ATTRIBUTE);
        store.pager.pin(root)?.share().bytes().to_vec()
    };

    store.undo_item_deletion(zedstore::META_ATTRIBUTE, target, delete_ptr)?;

    let image_after = {
        let root = common::root_block(&store, zedstore::META_ATTRIBUTE);
        store.pager.pin(root)?.share().bytes().to_vec()
    };

    assert_eq!(image_before, image_after);

    Ok(())
}
