#![allow(dead_code)]

use zedstore::{
    AttributeSpec, Cid, Config, Datum, Slice, Snapshot, Store, Tid, UndoPtr, Xid, META_ATTRIBUTE,
};

/// Opens a store with one meta-attribute and the given data attributes.
pub fn open_store(path: &std::path::Path, attrs: &[AttributeSpec]) -> zedstore::Result<Store> {
    Config::new(path).attributes(attrs).open()
}

/// Inserts `n` rows in one batch: meta items carrying visibility, plus
/// matching items in data attribute 1.
pub fn insert_batch<F: FnMut(usize) -> Datum>(
    store: &Store,
    n: usize,
    xid: Xid,
    cid: Cid,
    mut datum: F,
) -> zedstore::Result<Vec<Tid>> {
    let mut tids = vec![Tid::INVALID; n];
    let mut undo = UndoPtr::INVALID;

    let metas: Vec<Datum> = vec![Some(Slice::empty()); n];
    store.multi_insert(META_ATTRIBUTE, &metas, &mut tids, xid, cid, &mut undo)?;

    let datums: Vec<Datum> = (0..n).map(&mut datum).collect();
    let mut data_tids = tids.clone();
    let mut data_undo = undo;
    store.multi_insert(1, &datums, &mut data_tids, xid, cid, &mut data_undo)?;

    Ok(tids)
}

/// TIDs of all rows visible under `snapshot`, via a meta-attribute scan.
pub fn visible_row_tids(store: &Store, snapshot: Snapshot) -> zedstore::Result<Vec<Tid>> {
    store
        .scan(META_ATTRIBUTE, Tid::MIN, Tid::MAX, snapshot)?
        .map(|tuple| tuple.map(|t| t.tid))
        .collect()
}

/// Asserts that one attribute tree passes every structural invariant.
pub fn assert_tree_healthy(store: &Store, attno: u16) {
    let violations = store.verify(attno).expect("verification should run");
    assert!(violations.is_empty(), "tree invariants violated: {violations:#?}");
}

/// Decodes a leaf page's items, expanding compressed containers, so
/// tests can assert on the logical item structure.
pub fn logical_leaf_items(
    store: &Store,
    page: &zedstore::page::PageBuf,
) -> zedstore::Result<Vec<zedstore::LeafItem>> {
    let mut out = Vec::new();

    for item in zedstore::tree::node::leaf_items(page)? {
        match item {
            zedstore::LeafItem::Compressed(container) => {
                let raw = zedstore::compression::decompress(
                    store.compression,
                    &container.payload,
                    container.uncompressed_size,
                )?;

                for sub in zedstore::item::decode_container(&raw)? {
                    out.push(sub);
                }
            }
            other => out.push(other),
        }
    }

    Ok(out)
}

/// Root block of one attribute tree, straight from the root directory.
pub fn root_block(store: &Store, attno: u16) -> zedstore::BlockNumber {
    let meta_pin = store.pager.pin(0).expect("metapage is pinnable");
    let meta_page = meta_pin.share();

    zedstore::meta::directory_entry(&meta_page, attno)
        .expect("attribute exists")
        .root
}
