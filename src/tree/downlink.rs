// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Downlink maintenance: inserting `(lokey, child)` entries for freshly
//! split pages, splitting internal pages that run out of room, and
//! growing a new root.
//!
//! The caller holds the left sibling exclusively; this module releases it
//! after the downlink is in place and the left page's follow-right flag
//! is cleared. Root growth additionally latches the metapage, which is
//! always taken last.

use crate::{
    attribute::AttrNumber,
    error::corrupt,
    meta::{self, META_BLOCK},
    page::{PageBuf, LINE_POINTER_SIZE},
    pager::{BlockNumber, ExclusivePage},
    store::StoreInner,
    tid::Tid,
    tree::{
        descend::{descend, LatchKind},
        node::{
            self, InternalEntry, TreeOpaque, FLAG_FOLLOW_RIGHT, FLAG_ROOT, INTERNAL_ENTRY_SIZE,
            TREE_SPECIAL_SIZE,
        },
    },
};

/// Installs the downlink `(right_lokey, right_blk)` for a page that just
/// split off `left`'s right side, growing the tree if `left` is the root.
///
/// Releases the `left` latch before returning.
pub fn insert_downlink(
    inner: &StoreInner,
    attno: AttrNumber,
    mut left: ExclusivePage,
    right_lokey: Tid,
    right_blk: BlockNumber,
) -> crate::Result<()> {
    let left_opaque = node::read_opaque(&left);

    if left_opaque.is_root() {
        return grow_root(inner, attno, left, right_lokey, right_blk);
    }

    let parent_level = left_opaque.level + 1;

    let Some(latch) = descend(inner, attno, left_opaque.lokey, parent_level, LatchKind::Exclusive)?
    else {
        return corrupt(left.block(), "split page has neither root flag nor parent");
    };
    let parent = latch.into_exclusive();

    // Re-find the left page's own entry; anything else means the tree
    // and the directory disagree
    let Some(idx) = node::search(&parent, left_opaque.lokey) else {
        return corrupt(parent.block(), "downlink mismatch during re-find");
    };

    let entry = node::entry_at(&parent, idx);
    if entry.tid != left_opaque.lokey || entry.child != left.block() {
        return corrupt(parent.block(), "downlink mismatch during re-find");
    }

    insert_internal_entry(
        inner,
        attno,
        parent,
        InternalEntry {
            tid: right_lokey,
            child: right_blk,
        },
    )?;

    // Only now may descents stop chasing the right-link
    node::write_opaque(
        &mut left,
        &TreeOpaque {
            flags: left_opaque.flags & !FLAG_FOLLOW_RIGHT,
            ..left_opaque
        },
    );

    Ok(())
}

/// Replaces the root with a new internal page over `left` and its new
/// right sibling, and repoints the root directory.
fn grow_root(
    inner: &StoreInner,
    attno: AttrNumber,
    mut left: ExclusivePage,
    right_lokey: Tid,
    right_blk: BlockNumber,
) -> crate::Result<()> {
    let left_opaque = node::read_opaque(&left);

    let (root_pin, root_blk) = inner.pager.new_page()?;
    let mut root = root_pin.exclusive();

    node::format_tree_page(
        &mut root,
        &TreeOpaque {
            attno,
            next: crate::pager::INVALID_BLOCK,
            lokey: Tid::MIN,
            hikey: Tid::MAX,
            level: left_opaque.level + 1,
            flags: FLAG_ROOT,
        },
    );

    let left_entry = InternalEntry {
        tid: left_opaque.lokey,
        child: left.block(),
    };
    let right_entry = InternalEntry {
        tid: right_lokey,
        child: right_blk,
    };

    assert!(root.add_item(&left_entry.encode()));
    assert!(root.add_item(&right_entry.encode()));

    node::write_opaque(
        &mut left,
        &TreeOpaque {
            flags: left_opaque.flags & !(FLAG_ROOT | FLAG_FOLLOW_RIGHT),
            ..left_opaque
        },
    );

    // The metapage is latched last in the global order
    let meta_pin = inner.pager.pin(META_BLOCK)?;
    let mut meta_page = meta_pin.exclusive();
    meta::set_root(&mut meta_page, attno, root_blk);

    log::debug!(
        "attribute {attno}: root grew to level {} at block {root_blk}",
        left_opaque.level + 1
    );

    Ok(())
}

/// Capacity of an internal page in entries.
fn internal_capacity() -> usize {
    PageBuf::capacity(TREE_SPECIAL_SIZE) / (INTERNAL_ENTRY_SIZE + LINE_POINTER_SIZE)
}

/// Inserts an entry into an internal page, splitting it 90/10 when full.
fn insert_internal_entry(
    inner: &StoreInner,
    attno: AttrNumber,
    mut parent: ExclusivePage,
    entry: InternalEntry,
) -> crate::Result<()> {
    let opaque = node::read_opaque(&parent);
    let mut entries = node::entries(&parent);

    let pos = entries.partition_point(|e| e.tid < entry.tid);

    if entries.get(pos).is_some_and(|e| e.tid == entry.tid) {
        return corrupt(parent.block(), "duplicate downlink key");
    }

    entries.insert(pos, entry);

    if entries.len() <= internal_capacity() {
        parent.clear_items();
        for e in &entries {
            assert!(parent.add_item(&e.encode()));
        }
        return Ok(());
    }

    // Full: split by entry count, heavily left-leaning since TIDs are
    // assigned in ascending order
    let split_at = (entries.len() * 9 / 10).clamp(1, entries.len() - 1);
    let right_entries = entries.split_off(split_at);

    #[allow(clippy::expect_used)]
    let split_key = right_entries.first().expect("right half is nonempty").tid;

    let (right_pin, right_blk) = inner.pager.new_page()?;

    {
        let mut right = right_pin.exclusive();

        node::format_tree_page(
            &mut right,
            &TreeOpaque {
                attno,
                next: opaque.next,
                lokey: split_key,
                hikey: opaque.hikey,
                level: opaque.level,
                flags: 0,
            },
        );

        for e in &right_entries {
            assert!(right.add_item(&e.encode()));
        }
    }

    parent.clear_items();
    for e in &entries {
        assert!(parent.add_item(&e.encode()));
    }

    node::write_opaque(
        &mut parent,
        &TreeOpaque {
            hikey: split_key,
            next: right_blk,
            flags: opaque.flags | FLAG_FOLLOW_RIGHT,
            ..opaque
        },
    );

    log::debug!(
        "attribute {attno}: internal page {} split at {split_key}, level {}",
        parent.block(),
        opaque.level
    );

    // The new internal page needs its own downlink one level up
    insert_downlink(inner, attno, parent, split_key, right_blk)
}
