mod common;

use test_log::test;
use zedstore::{AttributeSpec, Slice, Tid, UndoPtr, UndoRecord};

/// Updates one row three times in distinct transactions and checks the
/// resulting UNDO chain and per-snapshot version visibility.
#[test]
fn update_chain_three_versions() -> zedstore::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = common::open_store(dir.path(), &[AttributeSpec::fixed(8)])?;

    let inserter = store.transactions().begin();
    common::insert_batch(&store, 1_000, inserter, 0, |i| {
        Some(Slice::from((i as u64).to_le_bytes()))
    })?;
    store.transactions().commit(inserter);

    let snap_v0 = store.mvcc_snapshot();

    // Three updates in three transactions, each against the newest version
    let mut version = Tid::from_raw(10);
    let mut snapshots = Vec::new();

    for generation in 0u64..3 {
        let updater = store.transactions().begin();

        let (outcome, new_tid) = store.update_row(
            version,
            &[Some(Slice::from((9_000 + generation).to_le_bytes()))],
            updater,
            0,
            &store.mvcc_for(updater, 0),
            false,
        )?;

        assert!(
            matches!(outcome, zedstore::UpdateOutcome::Ok { .. }),
            "update {generation} failed: {outcome:?}"
        );
        assert_eq!(Tid::from_raw(1_001 + generation), new_tid);

        store.transactions().commit(updater);
        snapshots.push(store.mvcc_snapshot());
        version = new_tid;
    }

    // The log holds three update records forming one chain
    let next = store.next_undo_counter()?;
    let mut updates = Vec::new();

    for counter in 1..next.raw() {
        if let Some(UndoRecord::Update { new_tid, prev, .. }) =
            store.undo.fetch(&store.pager, UndoPtr::from_raw(counter))?
        {
            updates.push((UndoPtr::from_raw(counter), new_tid, prev));
        }
    }

    assert_eq!(3, updates.len());
    assert_eq!(Tid::from_raw(1_001), updates[0].1);
    assert_eq!(Tid::from_raw(1_002), updates[1].1);
    assert_eq!(Tid::from_raw(1_003), updates[2].1);

    // Each update chains to the record that created the version it replaced
    assert_eq!(updates[0].0, updates[1].2);
    assert_eq!(updates[1].0, updates[2].2);

    // The latest reachable new_tid is the third version
    assert_eq!(Tid::from_raw(1_003), updates[2].1);

    // Version visibility per snapshot: before any update, row 10; after
    // update N, exactly version 1000+N
    let v0 = common::visible_row_tids(&store, snap_v0)?;
    assert!(v0.contains(&Tid::from_raw(10)));
    assert!(!v0.contains(&Tid::from_raw(1_001)));

    let expectations = [
        (0usize, 1_001u64),
        (1, 1_002),
        (2, 1_003),
    ];

    for (idx, visible_version) in expectations {
        let rows = common::visible_row_tids(&store, snapshots[idx].clone())?;

        assert!(
            !rows.contains(&Tid::from_raw(10)),
            "snapshot {idx} must not see the original version"
        );

        for candidate in 1_001u64..=1_003 {
            assert_eq!(
                candidate == visible_version,
                rows.contains(&Tid::from_raw(candidate)),
                "snapshot {idx}, version {candidate}"
            );
        }

        // Row count is stable: one version per logical row
        assert_eq!(1_000, rows.len());
    }

    common::assert_tree_healthy(&store, zedstore::META_ATTRIBUTE);

    Ok(())
}

/// An uncommitted update leaves other snapshots on the old version and
/// reports the conflict to a rival writer.
#[test]
fn update_conflict_reporting() -> zedstore::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = common::open_store(dir.path(), &[AttributeSpec::fixed(8)])?;

    let inserter = store.transactions().begin();
    common::insert_batch(&store, 5, inserter, 0, |i| {
        Some(Slice::from((i as u64).to_le_bytes()))
    })?;
    store.transactions().commit(inserter);

    let updater = store.transactions().begin();
    let (outcome, new_tid) = store.update_row(
        Tid::from_raw(2),
        &[Some(Slice::from(77u64.to_le_bytes()))],
        updater,
        0,
        &store.mvcc_for(updater, 0),
        false,
    )?;
    assert!(matches!(outcome, zedstore::UpdateOutcome::Ok { .. }));

    // Everyone else still sees the old version
    let rows = common::visible_row_tids(&store, store.mvcc_snapshot())?;
    assert!(rows.contains(&Tid::from_raw(2)));
    assert!(!rows.contains(&new_tid));

    // A rival updater is told who is in the way
    let rival = store.transactions().begin();
    let (outcome, _) = store.update_row(
        Tid::from_raw(2),
        &[Some(Slice::from(88u64.to_le_bytes()))],
        rival,
        0,
        &store.mvcc_for(rival, 0),
        false,
    )?;

    assert!(matches!(
        outcome,
        zedstore::UpdateOutcome::BeingModified(zedstore::ConflictInfo { xmax, .. }) if xmax == updater
    ));

    // After the commit the same attempt reports the committed update
    store.transactions().commit(updater);

    let (outcome, _) = store.update_row(
        Tid::from_raw(2),
        &[Some(Slice::from(88u64.to_le_bytes()))],
        rival,
        1,
        &store.mvcc_for(rival, 1),
        false,
    )?;

    assert!(matches!(
        outcome,
        zedstore::UpdateOutcome::Updated(_, tid) if tid == new_tid
    ));

    Ok(())
}
