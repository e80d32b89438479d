mod common;

use rand::{rngs::StdRng, RngCore, SeedableRng};
use test_log::test;
use zedstore::{AttributeSpec, Datum, Slice, Snapshot, Tid, UndoPtr};

/// Builds a tree of 1000 fixed-width 200-byte rows in one batch and
/// checks that it split, scans back in order, and reports the next TID.
#[test]
fn array_build_and_split() -> zedstore::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = common::open_store(dir.path(), &[AttributeSpec::fixed(200)])?;

    let mut rng = StdRng::seed_from_u64(0xDECAF);
    let mut payloads = Vec::with_capacity(1_000);
    for _ in 0..1_000 {
        let mut buf = vec![0u8; 200];
        rng.fill_bytes(&mut buf);
        payloads.push(buf);
    }

    let datums: Vec<Datum> = payloads.iter().map(|p| Some(Slice::from(p.clone()))).collect();
    let mut tids = vec![Tid::INVALID; 1_000];
    let mut undo = UndoPtr::INVALID;

    store.multi_insert(1, &datums, &mut tids, 1, 0, &mut undo)?;

    // TIDs were assigned densely from 1
    for (i, tid) in tids.iter().enumerate() {
        assert_eq!(Tid::from_raw(i as u64 + 1), *tid);
    }

    // 200 KiB of incompressible rows cannot be one leaf
    assert!(
        store.pager.block_count() > 2,
        "tree should have split into multiple leaves"
    );
    common::assert_tree_healthy(&store, 1);

    // Scanning [1, 1001) returns all 1000 rows in order with their data
    let tuples = store
        .scan(1, Tid::from_raw(1), Tid::from_raw(1_001), Snapshot::Any)?
        .collect::<zedstore::Result<Vec<_>>>()?;

    assert_eq!(1_000, tuples.len());

    for (i, tuple) in tuples.iter().enumerate() {
        assert_eq!(Tid::from_raw(i as u64 + 1), tuple.tid);
        let datum = tuple.datum.as_ref().expect("rows are non-null");
        assert_eq!(payloads.get(i).expect("payload exists").as_slice(), &**datum);
    }

    assert_eq!(Tid::from_raw(1_001), store.get_last_tid(1)?);

    Ok(())
}

/// Sequential single-row batches keep assigning strictly increasing TIDs.
#[test]
fn tid_assignment_is_monotone() -> zedstore::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = common::open_store(dir.path(), &[AttributeSpec::fixed(8)])?;

    let mut last = Tid::INVALID;

    for i in 0..100u64 {
        let mut tids = [Tid::INVALID];
        let mut undo = UndoPtr::INVALID;

        store.multi_insert(
            1,
            &[Some(Slice::from(i.to_le_bytes()))],
            &mut tids,
            1,
            0,
            &mut undo,
        )?;

        assert!(tids[0] > last, "TIDs must be strictly increasing");
        last = tids[0];
    }

    assert_eq!(Tid::from_raw(101), store.get_last_tid(1)?);

    Ok(())
}
