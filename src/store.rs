// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    attribute::{AttrNumber, AttributeSpec, META_ATTRIBUTE},
    config::Config,
    item::Datum,
    meta::{self, META_BLOCK},
    page::tag,
    pager::PageStore,
    snapshot::{MvccSnapshot, Snapshot},
    tid::Tid,
    tree,
    txn::{Cid, TransactionRegistry, Xid},
    undo::{UndoLog, UndoPtr},
    visibility::{LockMode, UpdateOutcome},
    CompressionType, Slice,
};
use parking_lot::RwLock;
use std::{path::PathBuf, sync::Arc};

pub use crate::tree::scan::{ScanTuple, TidScan};

/// Name of the page file inside the store folder.
const STORE_FILE: &str = "store";

/// Shared state behind a [`Store`] handle
pub struct StoreInner {
    /// Page buffer adapter over the store file
    #[doc(hidden)]
    pub pager: PageStore,

    /// The UNDO log
    #[doc(hidden)]
    pub undo: UndoLog,

    /// Transaction status oracle
    #[doc(hidden)]
    pub registry: TransactionRegistry,

    /// Container compression
    #[doc(hidden)]
    pub compression: CompressionType,

    /// Attribute shapes, indexed by attribute number (0 = meta)
    pub(crate) attrs: RwLock<Vec<AttributeSpec>>,

    #[allow(dead_code)]
    path: PathBuf,
}

impl StoreInner {
    /// Shape of one attribute.
    pub(crate) fn attribute(&self, attno: AttrNumber) -> crate::Result<AttributeSpec> {
        self.attrs
            .read()
            .get(usize::from(attno))
            .copied()
            .ok_or(crate::Error::Config("no such attribute"))
    }
}

/// A column-oriented table store: one B+-tree per attribute plus an
/// UNDO log, all in one page file
///
/// `Store` is a cheap-to-clone handle; clones share the same state.
#[derive(Clone)]
pub struct Store(#[doc(hidden)] pub Arc<StoreInner>);

impl std::ops::Deref for Store {
    type Target = StoreInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Store {
    /// Opens or creates the store described by `config`.
    pub(crate) fn open(config: Config) -> crate::Result<Self> {
        std::fs::create_dir_all(&config.path)?;
        let file = config.path.join(STORE_FILE);

        let inner = if file.try_exists()? && std::fs::metadata(&file)?.len() > 0 {
            log::info!("recovering store at {:?}", config.path);

            let pager = PageStore::open(&file)?;

            let attrs = {
                let meta_pin = pager.pin(META_BLOCK)?;
                let meta_page = meta_pin.share();

                if meta_page.page_tag() != tag::META {
                    return Err(crate::Error::Corruption {
                        block: META_BLOCK,
                        reason: "block 0 is not a metapage",
                    });
                }

                #[allow(clippy::cast_possible_truncation)]
                let specs = (0..meta::n_entries(&meta_page))
                    .filter_map(|i| {
                        meta::directory_entry(&meta_page, i as AttrNumber).map(|e| e.spec)
                    })
                    .collect::<Vec<_>>();
                specs
            };

            let undo = UndoLog::new();
            undo.rebuild(&pager)?;

            StoreInner {
                pager,
                undo,
                registry: TransactionRegistry::new(),
                compression: config.compression,
                attrs: RwLock::new(attrs),
                path: config.path,
            }
        } else {
            log::info!("creating store at {:?}", config.path);

            let pager = PageStore::create(&file)?;

            let (meta_pin, blk) = pager.new_page()?;
            debug_assert_eq!(META_BLOCK, blk);
            meta::init_metapage(&mut meta_pin.exclusive(), &config.attributes)?;
            drop(meta_pin);

            let mut attrs = vec![AttributeSpec::meta()];
            attrs.extend_from_slice(&config.attributes);

            StoreInner {
                pager,
                undo: UndoLog::new(),
                registry: TransactionRegistry::new(),
                compression: config.compression,
                attrs: RwLock::new(attrs),
                path: config.path,
            }
        };

        Ok(Self(Arc::new(inner)))
    }

    /// The transaction status registry.
    #[must_use]
    pub fn transactions(&self) -> &TransactionRegistry {
        &self.registry
    }

    /// An MVCC snapshot of the current commit state for a read-only
    /// observer.
    #[must_use]
    pub fn mvcc_snapshot(&self) -> Snapshot {
        Snapshot::mvcc_from_registry(&self.registry, 0, 0)
    }

    /// An MVCC snapshot owned by `xid` at command `cid`.
    #[must_use]
    pub fn mvcc_for(&self, xid: Xid, cid: Cid) -> MvccSnapshot {
        match Snapshot::mvcc_from_registry(&self.registry, xid, cid) {
            Snapshot::Mvcc(snapshot) => snapshot,
            _ => unreachable!("registry snapshots are MVCC"),
        }
    }

    /// Number of user attributes (the meta-attribute not included).
    #[must_use]
    pub fn attribute_count(&self) -> usize {
        self.attrs.read().len() - 1
    }

    /// Extends the table with additional attributes.
    pub fn add_attributes(&self, specs: &[AttributeSpec]) -> crate::Result<()> {
        let meta_pin = self.pager.pin(META_BLOCK)?;
        let mut meta_page = meta_pin.exclusive();

        meta::add_attributes(&mut meta_page, specs)?;
        self.attrs.write().extend_from_slice(specs);

        Ok(())
    }

    /// Starts a scan over `[start_tid, end_tid)` of one attribute.
    ///
    /// The returned iterator yields `(tid, datum)` tuples visible under
    /// `snapshot`, in ascending TID order. Dropping it ends the scan.
    pub fn scan(
        &self,
        attno: AttrNumber,
        start_tid: Tid,
        end_tid: Tid,
        snapshot: Snapshot,
    ) -> crate::Result<TidScan> {
        TidScan::new(self.clone(), attno, start_tid, end_tid, snapshot)
    }

    /// One past the rightmost row: the next TID an insert would assign.
    pub fn get_last_tid(&self, attno: AttrNumber) -> crate::Result<Tid> {
        tree::mutate::get_last_tid(self, attno)
    }

    /// Inserts a batch of datums into one attribute tree.
    ///
    /// Invalid `tids` are assigned (strictly ascending); on the
    /// meta-attribute a single UNDO insert record is written for the
    /// batch and returned through `undo_ptr`.
    pub fn multi_insert(
        &self,
        attno: AttrNumber,
        datums: &[Datum],
        tids: &mut [Tid],
        xid: Xid,
        cid: Cid,
        undo_ptr: &mut UndoPtr,
    ) -> crate::Result<()> {
        tree::mutate::multi_insert(self, attno, datums, tids, xid, cid, undo_ptr)
    }

    /// Deletes the row version at `tid` in one attribute tree.
    pub fn delete(
        &self,
        attno: AttrNumber,
        tid: Tid,
        xid: Xid,
        cid: Cid,
        snapshot: &MvccSnapshot,
    ) -> crate::Result<UpdateOutcome> {
        tree::mutate::delete(self, attno, tid, xid, cid, snapshot)
    }

    /// Updates the row version at `old_tid`, returning the new TID.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &self,
        attno: AttrNumber,
        old_tid: Tid,
        new_datum: Datum,
        xid: Xid,
        cid: Cid,
        snapshot: &MvccSnapshot,
        key_update: bool,
    ) -> crate::Result<(UpdateOutcome, Tid)> {
        tree::mutate::update(self, attno, old_tid, new_datum, xid, cid, snapshot, key_update)
    }

    /// Locks the row version at `tid`.
    #[allow(clippy::too_many_arguments)]
    pub fn lock_item(
        &self,
        attno: AttrNumber,
        tid: Tid,
        xid: Xid,
        cid: Cid,
        snapshot: &MvccSnapshot,
        mode: LockMode,
    ) -> crate::Result<UpdateOutcome> {
        tree::mutate::lock_item(self, attno, tid, xid, cid, snapshot, mode)
    }

    /// Replaces the item at `tid` with a tombstone retained until the
    /// UNDO horizon passes `undo_ptr`.
    pub fn mark_item_dead(
        &self,
        attno: AttrNumber,
        tid: Tid,
        undo_ptr: UndoPtr,
    ) -> crate::Result<()> {
        tree::mutate::mark_item_dead(self, attno, tid, undo_ptr)
    }

    /// Rolls back the deletion whose record sits at `undo_ptr`; a no-op
    /// for any other chain state.
    pub fn undo_item_deletion(
        &self,
        attno: AttrNumber,
        tid: Tid,
        undo_ptr: UndoPtr,
    ) -> crate::Result<()> {
        tree::mutate::undo_item_deletion(self, attno, tid, undo_ptr)
    }

    /// Inserts one full row: a meta-attribute item carrying visibility
    /// plus one item per data attribute, all at one fresh TID.
    pub fn insert_row(&self, values: &[Datum], xid: Xid, cid: Cid) -> crate::Result<Tid> {
        if values.len() != self.attribute_count() {
            return Err(crate::Error::Config("row width does not match the table"));
        }

        let mut tids = [Tid::INVALID];
        let mut undo_ptr = UndoPtr::INVALID;

        self.multi_insert(
            META_ATTRIBUTE,
            &[Some(Slice::empty())],
            &mut tids,
            xid,
            cid,
            &mut undo_ptr,
        )?;

        for (i, value) in values.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let attno = (i + 1) as AttrNumber;
            let mut attr_tids = tids;
            let mut attr_undo = undo_ptr;

            self.multi_insert(
                attno,
                std::slice::from_ref(value),
                &mut attr_tids,
                xid,
                cid,
                &mut attr_undo,
            )?;
        }

        Ok(tids[0])
    }

    /// Deletes one full row (the meta-attribute carries the deletion;
    /// data items become invisible through it).
    pub fn delete_row(
        &self,
        tid: Tid,
        xid: Xid,
        cid: Cid,
        snapshot: &MvccSnapshot,
    ) -> crate::Result<UpdateOutcome> {
        self.delete(META_ATTRIBUTE, tid, xid, cid, snapshot)
    }

    /// Updates one full row to `values`, returning the new row's TID.
    pub fn update_row(
        &self,
        old_tid: Tid,
        values: &[Datum],
        xid: Xid,
        cid: Cid,
        snapshot: &MvccSnapshot,
        key_update: bool,
    ) -> crate::Result<(UpdateOutcome, Tid)> {
        if values.len() != self.attribute_count() {
            return Err(crate::Error::Config("row width does not match the table"));
        }

        let (outcome, new_tid) = self.update(
            META_ATTRIBUTE,
            old_tid,
            Some(Slice::empty()),
            xid,
            cid,
            snapshot,
            key_update,
        )?;

        if !matches!(outcome, UpdateOutcome::Ok { .. }) {
            return Ok((outcome, Tid::INVALID));
        }

        for (i, value) in values.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let attno = (i + 1) as AttrNumber;
            let mut attr_tids = [new_tid];
            let mut attr_undo = UndoPtr::INVALID;

            self.multi_insert(
                attno,
                std::slice::from_ref(value),
                &mut attr_tids,
                xid,
                cid,
                &mut attr_undo,
            )?;
        }

        Ok((outcome, new_tid))
    }

    /// Checks one attribute tree against its structural invariants.
    pub fn verify(&self, attno: AttrNumber) -> crate::Result<Vec<String>> {
        tree::verify::verify(self, attno)
    }

    /// The counter below which no snapshot can observe UNDO records.
    pub fn oldest_live_undo(&self) -> crate::Result<UndoPtr> {
        self.undo.oldest_live(&self.pager)
    }

    /// The next UNDO counter that would be assigned.
    pub fn next_undo_counter(&self) -> crate::Result<UndoPtr> {
        let meta_pin = self.pager.pin(META_BLOCK)?;
        let opaque = meta::read_opaque(&meta_pin.share());
        Ok(UndoPtr::from_raw(opaque.undo_counter))
    }

    /// Advances the UNDO horizon (monotone), allowing record storage
    /// below it to be recycled. The caller asserts no live snapshot can
    /// still observe anything below `to`.
    pub fn advance_undo_horizon(&self, to: UndoPtr) -> crate::Result<()> {
        self.undo.advance_oldest(&self.pager, to)
    }

    /// Writes all dirty pages back to the store file.
    pub fn persist(&self) -> crate::Result<()> {
        self.pager.persist()
    }
}
