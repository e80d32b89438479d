// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Non-scan mutations.
//!
//! All of them share one shape: descend to the covering leaf with an
//! exclusive latch, look the row version up, consult visibility where it
//! matters, append an UNDO record, and hand the change to the leaf
//! rewriter. Only the meta-attribute writes UNDO records; data attribute
//! items carry an invalid pointer and defer all visibility to the row's
//! meta item.
//!
//! Conflicts are returned, never retried here: waiting for another
//! transaction is the caller's business, after all latches are released.

use crate::{
    attribute::{AttrNumber, META_ATTRIBUTE},
    error::corrupt,
    item::{self, Datum, ItemFlags, LeafItem, SingleItem},
    page::PageBuf,
    snapshot::MvccSnapshot,
    store::StoreInner,
    tid::Tid,
    tree::{
        descend::{descend, tree_root, LatchKind},
        node,
        rewrite::{self, FetchedItem, RewriteSpec},
    },
    txn::{Cid, Xid},
    undo::{UndoPtr, UndoRecord},
    visibility::{LockMode, UpdateOutcome, VisibilityChecker},
    Slice,
};

/// Last TID covered by any item on a leaf.
fn last_tid_on_page(page: &PageBuf) -> crate::Result<Option<Tid>> {
    match page.item_count() {
        0 => Ok(None),
        n => Ok(Some(LeafItem::decode(page.item(n - 1))?.last_tid())),
    }
}

/// The `prev` pointer a new chain head should carry: the current head,
/// or whatever lies beneath it when the head may be discarded.
fn chain_prev(inner: &StoreInner, head: UndoPtr, discard: bool) -> crate::Result<UndoPtr> {
    if !discard {
        return Ok(head);
    }

    Ok(inner
        .undo
        .fetch(&inner.pager, head)?
        .map_or(UndoPtr::INVALID, |rec| rec.prev()))
}

/// Inserts a batch of datums, assigning TIDs when the caller passes
/// invalid ones. On the meta-attribute, writes one UNDO insert record for
/// the batch (unless the caller brings a pointer) and returns it through
/// `undo_ptr`.
pub fn multi_insert(
    inner: &StoreInner,
    attno: AttrNumber,
    datums: &[Datum],
    tids: &mut [Tid],
    xid: Xid,
    cid: Cid,
    undo_ptr: &mut UndoPtr,
) -> crate::Result<()> {
    assert_eq!(datums.len(), tids.len());

    if datums.is_empty() {
        return Ok(());
    }

    let attr = inner.attribute(attno)?;
    tree_root(inner, attno, true)?;

    let assign = !tids.first().copied().unwrap_or(Tid::INVALID).is_valid();

    if assign {
        debug_assert!(tids.iter().all(|t| !t.is_valid()));

        let Some(latch) = descend(inner, attno, Tid::MAX, 0, LatchKind::Exclusive)? else {
            return corrupt(0, "tree vanished between root creation and descent");
        };
        let leaf = latch.into_exclusive();

        let opaque = node::read_opaque(&leaf);
        let first_new = last_tid_on_page(&leaf)?.map_or(opaque.lokey, Tid::next);

        for (i, tid) in tids.iter_mut().enumerate() {
            *tid = first_new.advance(i as u64);
        }

        let item_undo = batch_undo_record(inner, attno, tids, xid, cid, undo_ptr)?;
        let items = item::build_leaf_items(&attr, tids, datums, item_undo)?;

        log::trace!(
            "attribute {attno}: appending {} rows from {first_new}",
            tids.len()
        );

        rewrite::rewrite_leaf(
            inner,
            attno,
            &attr,
            leaf,
            RewriteSpec {
                old_tid: Tid::INVALID,
                replacement: None,
                new_items: items,
            },
        )?;

        return Ok(());
    }

    // Caller-specified TIDs: strictly ascending, routed page by page
    for pair in tids.windows(2) {
        if pair.first().zip(pair.get(1)).is_some_and(|(a, b)| a >= b) {
            return Err(crate::Error::Config("insert TIDs must be strictly ascending"));
        }
    }

    let item_undo = batch_undo_record(inner, attno, tids, xid, cid, undo_ptr)?;

    let mut start = 0usize;
    while start < tids.len() {
        #[allow(clippy::expect_used)]
        let first = *tids.get(start).expect("start is in range");

        let Some(latch) = descend(inner, attno, first, 0, LatchKind::Exclusive)? else {
            return corrupt(0, "tree vanished between root creation and descent");
        };
        let leaf = latch.into_exclusive();
        let hikey = node::read_opaque(&leaf).hikey;

        let end = start
            + tids
                .get(start..)
                .map_or(0, |rest| rest.iter().take_while(|t| **t < hikey).count());
        debug_assert!(end > start);

        let items = item::build_leaf_items(
            &attr,
            tids.get(start..end).unwrap_or_default(),
            datums.get(start..end).unwrap_or_default(),
            item_undo,
        )?;

        rewrite::rewrite_leaf(
            inner,
            attno,
            &attr,
            leaf,
            RewriteSpec {
                old_tid: Tid::INVALID,
                replacement: None,
                new_items: items,
            },
        )?;

        start = end;
    }

    Ok(())
}

/// Writes the batch's UNDO insert record on the meta-attribute; data
/// attributes never reference the UNDO log from their items.
fn batch_undo_record(
    inner: &StoreInner,
    attno: AttrNumber,
    tids: &[Tid],
    xid: Xid,
    cid: Cid,
    undo_ptr: &mut UndoPtr,
) -> crate::Result<UndoPtr> {
    if attno != META_ATTRIBUTE {
        return Ok(UndoPtr::INVALID);
    }

    if !undo_ptr.is_valid() {
        *undo_ptr = inner.undo.append(
            &inner.pager,
            &UndoRecord::Insert {
                xid,
                cid,
                tid: tids.first().copied().unwrap_or(Tid::INVALID),
            },
        )?;
    }

    Ok(*undo_ptr)
}

/// One past the rightmost row of an attribute tree: the next TID an
/// assigning insert would use.
pub fn get_last_tid(inner: &StoreInner, attno: AttrNumber) -> crate::Result<Tid> {
    inner.attribute(attno)?;

    match descend(inner, attno, Tid::MAX, 0, LatchKind::Shared)? {
        None => Ok(Tid::MIN),
        Some(latch) => {
            let page = latch.page();
            let opaque = node::read_opaque(page);
            Ok(last_tid_on_page(page)?.map_or(opaque.lokey, Tid::next))
        }
    }
}

/// Marks the row version at `tid` deleted.
pub fn delete(
    inner: &StoreInner,
    attno: AttrNumber,
    tid: Tid,
    xid: Xid,
    cid: Cid,
    snapshot: &MvccSnapshot,
) -> crate::Result<UpdateOutcome> {
    let attr = inner.attribute(attno)?;

    let Some(latch) = descend(inner, attno, tid, 0, LatchKind::Exclusive)? else {
        return Ok(UpdateOutcome::Missing);
    };
    let leaf = latch.into_exclusive();

    let Some(found) = rewrite::fetch_item(&leaf, &attr, inner.compression, tid)? else {
        return Ok(UpdateOutcome::Missing);
    };

    let checker = VisibilityChecker::new(&inner.pager, &inner.undo, &inner.registry)?;
    let outcome = checker.satisfies_update(snapshot, tid, found.flags, found.undo, LockMode::Exclusive)?;

    let UpdateOutcome::Ok { discard_undo } = outcome else {
        return Ok(outcome);
    };

    let ptr = if attno == META_ATTRIBUTE {
        let prev = chain_prev(inner, found.undo, discard_undo)?;
        inner
            .undo
            .append(&inner.pager, &UndoRecord::Delete { xid, cid, tid, prev })?
    } else {
        UndoPtr::INVALID
    };

    let replacement = replacement_item(tid, &found, ItemFlags::DELETED, ptr);

    log::trace!("attribute {attno}: delete {tid} by xid {xid}");

    if !rewrite::rewrite_leaf(
        inner,
        attno,
        &attr,
        leaf,
        RewriteSpec {
            old_tid: tid,
            replacement: Some(replacement),
            new_items: Vec::new(),
        },
    )? {
        return Ok(UpdateOutcome::Missing);
    }

    Ok(UpdateOutcome::Ok {
        discard_undo,
    })
}

/// Builds the rewritten version of an existing item with fresh state
/// flags and a new chain head.
fn replacement_item(tid: Tid, found: &FetchedItem, extra: ItemFlags, undo: UndoPtr) -> LeafItem {
    let flags = found
        .flags
        .without(ItemFlags::DELETED)
        .without(ItemFlags::UPDATED)
        .with(extra);

    LeafItem::Single(SingleItem {
        tid,
        flags,
        undo,
        datum: found.datum.clone().unwrap_or_else(Slice::empty),
    })
}

/// Replaces the row version at `old_tid` with a new version at a freshly
/// assigned TID, chaining both through one UNDO update record.
#[allow(clippy::too_many_arguments)]
pub fn update(
    inner: &StoreInner,
    attno: AttrNumber,
    old_tid: Tid,
    new_datum: Datum,
    xid: Xid,
    cid: Cid,
    snapshot: &MvccSnapshot,
    key_update: bool,
) -> crate::Result<(UpdateOutcome, Tid)> {
    let attr = inner.attribute(attno)?;

    let Some(latch) = descend(inner, attno, old_tid, 0, LatchKind::Exclusive)? else {
        return Ok((UpdateOutcome::Missing, Tid::INVALID));
    };
    let old_leaf = latch.into_exclusive();

    let Some(found) = rewrite::fetch_item(&old_leaf, &attr, inner.compression, old_tid)? else {
        return Ok((UpdateOutcome::Missing, Tid::INVALID));
    };

    let requested = if key_update {
        LockMode::Exclusive
    } else {
        LockMode::NoKeyExclusive
    };

    let checker = VisibilityChecker::new(&inner.pager, &inner.undo, &inner.registry)?;
    let outcome = checker.satisfies_update(snapshot, old_tid, found.flags, found.undo, requested)?;

    let UpdateOutcome::Ok { discard_undo } = outcome else {
        return Ok((outcome, Tid::INVALID));
    };

    let prev = chain_prev(inner, found.undo, discard_undo)?;
    let old_opaque = node::read_opaque(&old_leaf);

    let new_version = |new_tid: Tid, ptr: UndoPtr| {
        let (flags, datum) = match &new_datum {
            Some(d) => (ItemFlags::empty(), d.clone()),
            None => (ItemFlags::NULL, Slice::empty()),
        };

        LeafItem::Single(SingleItem {
            tid: new_tid,
            flags,
            undo: ptr,
            datum,
        })
    };

    let new_tid;

    if old_opaque.hikey == Tid::MAX {
        // The old version lives on the rightmost page; one rewrite does
        // both halves of the update
        new_tid = last_tid_on_page(&old_leaf)?.map_or(old_opaque.lokey, Tid::next);
        let ptr = update_undo_record(inner, attno, old_tid, new_tid, prev, xid, cid, key_update)?;

        let replacement = replacement_item(old_tid, &found, ItemFlags::UPDATED, ptr);

        if !rewrite::rewrite_leaf(
            inner,
            attno,
            &attr,
            old_leaf,
            RewriteSpec {
                old_tid,
                replacement: Some(replacement),
                new_items: vec![new_version(new_tid, ptr)],
            },
        )? {
            return Ok((UpdateOutcome::Missing, Tid::INVALID));
        }
    } else {
        // New versions land on the rightmost page; latch it as well
        // (left before right: old_tid precedes every fresh TID)
        let Some(right_latch) = descend(inner, attno, Tid::MAX, 0, LatchKind::Exclusive)? else {
            return corrupt(old_leaf.block(), "rightmost leaf disappeared");
        };
        let right_leaf = right_latch.into_exclusive();

        let right_opaque = node::read_opaque(&right_leaf);
        new_tid = last_tid_on_page(&right_leaf)?.map_or(right_opaque.lokey, Tid::next);

        let ptr = update_undo_record(inner, attno, old_tid, new_tid, prev, xid, cid, key_update)?;

        rewrite::rewrite_leaf(
            inner,
            attno,
            &attr,
            right_leaf,
            RewriteSpec {
                old_tid: Tid::INVALID,
                replacement: None,
                new_items: vec![new_version(new_tid, ptr)],
            },
        )?;

        let replacement = replacement_item(old_tid, &found, ItemFlags::UPDATED, ptr);

        if !rewrite::rewrite_leaf(
            inner,
            attno,
            &attr,
            old_leaf,
            RewriteSpec {
                old_tid,
                replacement: Some(replacement),
                new_items: Vec::new(),
            },
        )? {
            return Ok((UpdateOutcome::Missing, Tid::INVALID));
        }
    }

    log::trace!("attribute {attno}: update {old_tid} -> {new_tid} by xid {xid}");

    Ok((UpdateOutcome::Ok { discard_undo }, new_tid))
}

#[allow(clippy::too_many_arguments)]
fn update_undo_record(
    inner: &StoreInner,
    attno: AttrNumber,
    old_tid: Tid,
    new_tid: Tid,
    prev: UndoPtr,
    xid: Xid,
    cid: Cid,
    key_update: bool,
) -> crate::Result<UndoPtr> {
    if attno != META_ATTRIBUTE {
        return Ok(UndoPtr::INVALID);
    }

    inner.undo.append(
        &inner.pager,
        &UndoRecord::Update {
            xid,
            cid,
            tid: old_tid,
            prev,
            new_tid,
            key_update,
        },
    )
}

/// Locks the row version at `tid` by chaining a tuple-lock record onto
/// its UNDO chain.
pub fn lock_item(
    inner: &StoreInner,
    attno: AttrNumber,
    tid: Tid,
    xid: Xid,
    cid: Cid,
    snapshot: &MvccSnapshot,
    mode: LockMode,
) -> crate::Result<UpdateOutcome> {
    let attr = inner.attribute(attno)?;

    let Some(latch) = descend(inner, attno, tid, 0, LatchKind::Exclusive)? else {
        return Ok(UpdateOutcome::Missing);
    };
    let leaf = latch.into_exclusive();

    let Some(found) = rewrite::fetch_item(&leaf, &attr, inner.compression, tid)? else {
        return Ok(UpdateOutcome::Missing);
    };

    let checker = VisibilityChecker::new(&inner.pager, &inner.undo, &inner.registry)?;
    let outcome = checker.satisfies_update(snapshot, tid, found.flags, found.undo, mode)?;

    let UpdateOutcome::Ok { discard_undo } = outcome else {
        return Ok(outcome);
    };

    // Holding the same or a stronger lock already: nothing to do
    if !discard_undo && found.undo.is_valid() {
        if let Some(UndoRecord::TupleLock {
            xid: holder,
            mode: held,
            ..
        }) = inner.undo.fetch(&inner.pager, found.undo)?
        {
            if holder == xid && held.admits(mode) {
                return Ok(UpdateOutcome::Ok {
                    discard_undo: false,
                });
            }
        }
    }

    let ptr = if attno == META_ATTRIBUTE {
        let prev = chain_prev(inner, found.undo, discard_undo)?;
        inner.undo.append(
            &inner.pager,
            &UndoRecord::TupleLock {
                xid,
                cid,
                tid,
                prev,
                mode,
            },
        )?
    } else {
        UndoPtr::INVALID
    };

    let replacement = replacement_item(tid, &found, ItemFlags::empty(), ptr);

    log::trace!("attribute {attno}: lock {tid} ({mode:?}) by xid {xid}");

    if !rewrite::rewrite_leaf(
        inner,
        attno,
        &attr,
        leaf,
        RewriteSpec {
            old_tid: tid,
            replacement: Some(replacement),
            new_items: Vec::new(),
        },
    )? {
        return Ok(UpdateOutcome::Missing);
    }

    Ok(UpdateOutcome::Ok {
        discard_undo,
    })
}

/// Replaces the item at `tid` with a size-zero tombstone that survives
/// until the UNDO horizon passes `undo_ptr`.
pub fn mark_item_dead(
    inner: &StoreInner,
    attno: AttrNumber,
    tid: Tid,
    undo_ptr: UndoPtr,
) -> crate::Result<()> {
    let attr = inner.attribute(attno)?;

    let Some(latch) = descend(inner, attno, tid, 0, LatchKind::Exclusive)? else {
        return Ok(());
    };
    let leaf = latch.into_exclusive();

    if rewrite::fetch_item(&leaf, &attr, inner.compression, tid)?.is_none() {
        log::debug!("attribute {attno}: mark-dead of missing {tid}");
        return Ok(());
    }

    let tombstone = LeafItem::Single(SingleItem {
        tid,
        flags: ItemFlags::DEAD,
        undo: undo_ptr,
        datum: Slice::empty(),
    });

    rewrite::rewrite_leaf(
        inner,
        attno,
        &attr,
        leaf,
        RewriteSpec {
            old_tid: tid,
            replacement: Some(tombstone),
            new_items: Vec::new(),
        },
    )?;

    Ok(())
}

/// Rolls back a deletion: if the item's chain head is exactly `undo_ptr`,
/// the gone flags are cleared and the head popped. Anything else is a
/// no-op, so vacuum-rollback can be replayed safely.
pub fn undo_item_deletion(
    inner: &StoreInner,
    attno: AttrNumber,
    tid: Tid,
    undo_ptr: UndoPtr,
) -> crate::Result<()> {
    let attr = inner.attribute(attno)?;

    let Some(latch) = descend(inner, attno, tid, 0, LatchKind::Exclusive)? else {
        return Ok(());
    };
    let leaf = latch.into_exclusive();

    let Some(found) = rewrite::fetch_item(&leaf, &attr, inner.compression, tid)? else {
        return Ok(());
    };

    if found.undo != undo_ptr || !found.flags.is_gone() {
        return Ok(());
    }

    let prev = inner
        .undo
        .fetch(&inner.pager, undo_ptr)?
        .map_or(UndoPtr::INVALID, |rec| rec.prev());

    let replacement = replacement_item(tid, &found, ItemFlags::empty(), prev);

    log::trace!("attribute {attno}: deletion of {tid} rolled back");

    rewrite::rewrite_leaf(
        inner,
        attno,
        &attr,
        leaf,
        RewriteSpec {
            old_tid: tid,
            replacement: Some(replacement),
            new_items: Vec::new(),
        },
    )?;

    Ok(())
}
