// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Leaf rewrite: replace-or-elide one row version, merge in new items,
//! then repack the page with recompression, spilling into new right
//! siblings when the result no longer fits.
//!
//! New sibling pages are allocated before anything is written, so an
//! out-of-space failure cannot leave the split half-applied. Downlinks
//! are installed left-to-right afterwards; until each one is in place the
//! left neighbor carries the follow-right flag descents recover by.

use crate::{
    attribute::{AttrNumber, AttributeSpec},
    compression::{self, AddOutcome, BoundedCompressor, CompressionType},
    error::corrupt,
    item::{
        self, compressed_item_len, CompressedItem, Datum, ItemFlags, LeafItem, SingleItem,
    },
    page::{PageBuf, LINE_POINTER_SIZE},
    pager::ExclusivePage,
    store::StoreInner,
    tid::Tid,
    tree::{
        downlink,
        node::{self, TreeOpaque, FLAG_FOLLOW_RIGHT, TREE_SPECIAL_SIZE},
    },
    undo::UndoPtr,
    Slice,
};

/// One logical row version found on a leaf
#[derive(Clone, Debug)]
pub struct FetchedItem {
    /// The version's flag word
    pub flags: ItemFlags,

    /// Head of the version's UNDO chain
    pub undo: UndoPtr,

    /// The datum (`None` for null)
    pub datum: Datum,
}

/// Looks up the row version at `tid` on a latched leaf, descending into
/// array items and compressed containers as needed.
pub fn fetch_item(
    page: &PageBuf,
    attr: &AttributeSpec,
    compression: CompressionType,
    tid: Tid,
) -> crate::Result<Option<FetchedItem>> {
    for idx in 0..page.item_count() {
        let raw = LeafItem::decode(page.item(idx))?;

        if raw.last_tid() < tid {
            continue;
        }
        if raw.tid() > tid {
            return Ok(None);
        }

        match raw {
            LeafItem::Single(single) => {
                return Ok(Some(fetched_from_single(&single)));
            }

            LeafItem::Array(array) => {
                return fetched_from_array(&array, attr, tid).map(Some);
            }

            LeafItem::Compressed(container) => {
                let raw_payload =
                    compression::decompress(compression, &container.payload, container.uncompressed_size)?;

                for sub in item::decode_container(&raw_payload)? {
                    if sub.last_tid() < tid {
                        continue;
                    }
                    if sub.tid() > tid {
                        return Ok(None);
                    }

                    return match sub {
                        LeafItem::Single(single) => Ok(Some(fetched_from_single(&single))),
                        LeafItem::Array(array) => fetched_from_array(&array, attr, tid).map(Some),
                        LeafItem::Compressed(_) => Err(crate::Error::Corruption {
                            block: 0,
                            reason: "nested compressed item",
                        }),
                    };
                }

                return Ok(None);
            }
        }
    }

    Ok(None)
}

fn fetched_from_single(single: &SingleItem) -> FetchedItem {
    FetchedItem {
        flags: single.flags,
        undo: single.undo,
        datum: if single.flags.contains(ItemFlags::NULL) {
            None
        } else {
            Some(single.datum.clone())
        },
    }
}

fn fetched_from_array(
    array: &item::ArrayItem,
    attr: &AttributeSpec,
    tid: Tid,
) -> crate::Result<FetchedItem> {
    let elements = array.elements(attr)?;
    let offset = (tid.raw() - array.tid.raw()) as usize;

    let datum = elements
        .get(offset)
        .map(|(_, d)| d.clone())
        .ok_or(crate::Error::Corruption {
            block: 0,
            reason: "array item does not cover its TID range",
        })?;

    Ok(FetchedItem {
        flags: array.flags,
        undo: array.undo,
        datum,
    })
}

/// What a leaf rewrite should do
pub struct RewriteSpec {
    /// Row version to replace or elide; invalid for pure inserts
    pub old_tid: Tid,

    /// Replacement for `old_tid`; `None` elides it
    pub replacement: Option<LeafItem>,

    /// Items to merge in, strictly ascending, non-overlapping with the
    /// surviving items
    pub new_items: Vec<LeafItem>,
}

/// Rewrites a latched leaf according to `spec`.
///
/// Returns `false` without touching the page when `old_tid` is valid but
/// no item covers it.
pub fn rewrite_leaf(
    inner: &StoreInner,
    attno: AttrNumber,
    attr: &AttributeSpec,
    leaf: ExclusivePage,
    spec: RewriteSpec,
) -> crate::Result<bool> {
    let blk = leaf.block();
    let oldest = inner.undo.oldest_live(&inner.pager)?;

    let mut list: Vec<LeafItem> = Vec::new();
    let mut found = !spec.old_tid.is_valid();

    for idx in 0..leaf.item_count() {
        let raw = LeafItem::decode(leaf.item(idx))?;

        if let LeafItem::Compressed(container) = &raw {
            let covers =
                spec.old_tid.is_valid() && container.tid <= spec.old_tid && spec.old_tid <= container.lasttid;

            if covers {
                // Decompress in place and keep walking its contents
                let raw_payload = compression::decompress(
                    inner.compression,
                    &container.payload,
                    container.uncompressed_size,
                )?;

                for sub in item::decode_container(&raw_payload)? {
                    if matches!(sub, LeafItem::Compressed(_)) {
                        return corrupt(blk, "nested compressed item");
                    }
                    apply_one(attr, &spec, sub, oldest, &mut list, &mut found)?;
                }

                continue;
            }
        }

        apply_one(attr, &spec, raw, oldest, &mut list, &mut found)?;
    }

    if !found {
        return Ok(false);
    }

    let merged = merge_new_items(blk, list, spec.new_items)?;

    recompress_and_write(inner, attno, leaf, merged)?;
    Ok(true)
}

/// Applies the replace/elide rules to one uncompressed item.
fn apply_one(
    attr: &AttributeSpec,
    spec: &RewriteSpec,
    raw: LeafItem,
    oldest: UndoPtr,
    list: &mut Vec<LeafItem>,
    found: &mut bool,
) -> crate::Result<()> {
    let covers = spec.old_tid.is_valid() && raw.tid() <= spec.old_tid && spec.old_tid <= raw.last_tid();

    if covers {
        *found = true;

        match raw {
            LeafItem::Single(_) => {
                if let Some(replacement) = &spec.replacement {
                    list.push(replacement.clone());
                }
            }

            LeafItem::Array(array) => {
                let elements = array.elements(attr)?;
                let split = (spec.old_tid.raw() - array.tid.raw()) as usize;

                push_array_slice(attr, &array, elements.get(..split), list)?;

                if let Some(replacement) = &spec.replacement {
                    list.push(replacement.clone());
                }

                push_array_slice(attr, &array, elements.get(split + 1..), list)?;
            }

            LeafItem::Compressed(_) => {
                // Covering containers were decompressed by the caller
                unreachable!("compressed items are unpacked before the rewrite rules")
            }
        }

        return Ok(());
    }

    // Tombstones whose horizon has passed are dropped on rewrite
    if raw.flags().contains(ItemFlags::DEAD) {
        if let LeafItem::Single(single) = &raw {
            if single.undo.raw() < oldest.raw() {
                log::trace!("eliding dead item at {}", single.tid);
                return Ok(());
            }
        }
    }

    list.push(raw);
    Ok(())
}

/// Re-emits a slice of array elements as fresh items sharing the array's
/// UNDO pointer and flags.
fn push_array_slice(
    attr: &AttributeSpec,
    array: &item::ArrayItem,
    elements: Option<&[(Tid, Datum)]>,
    list: &mut Vec<LeafItem>,
) -> crate::Result<()> {
    let Some(elements) = elements else {
        return Ok(());
    };
    if elements.is_empty() {
        return Ok(());
    }

    let tids: Vec<Tid> = elements.iter().map(|(t, _)| *t).collect();
    let datums: Vec<Datum> = elements.iter().map(|(_, d)| d.clone()).collect();

    let mut rebuilt = item::build_leaf_items(attr, &tids, &datums, array.undo)?;

    // Non-null/dead state is uniform across the original array
    if array.flags.raw() != 0 && !array.flags.contains(ItemFlags::NULL) {
        for item in &mut rebuilt {
            match item {
                LeafItem::Single(s) => s.flags = s.flags.with(array.flags),
                LeafItem::Array(a) => a.flags = a.flags.with(array.flags),
                LeafItem::Compressed(_) => {}
            }
        }
    }

    list.append(&mut rebuilt);
    Ok(())
}

/// Merges new items into the rewrite list, keeping strict TID order.
fn merge_new_items(
    blk: crate::pager::BlockNumber,
    existing: Vec<LeafItem>,
    new_items: Vec<LeafItem>,
) -> crate::Result<Vec<LeafItem>> {
    if new_items.is_empty() {
        return Ok(existing);
    }

    let mut merged = Vec::with_capacity(existing.len() + new_items.len());
    let mut a = existing.into_iter().peekable();
    let mut b = new_items.into_iter().peekable();

    loop {
        let take_a = match (a.peek(), b.peek()) {
            (Some(x), Some(y)) => x.tid() < y.tid(),
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };

        let next = if take_a {
            a.next()
        } else {
            b.next()
        };

        #[allow(clippy::expect_used)]
        let next = next.expect("peeked item exists");

        if let Some(prev) = merged.last() {
            let prev: &LeafItem = prev;
            if next.tid() <= prev.last_tid() {
                return corrupt(blk, "overlapping items in leaf rewrite");
            }
        }

        merged.push(next);
    }

    Ok(merged)
}

/// One packed (possibly compressed) item ready for page placement.
struct EncodedLeaf {
    bytes: Vec<u8>,
    first: Tid,
}

/// Payload budget for one compressed container: it must fit an empty page
/// together with its header and line pointer.
fn container_budget() -> usize {
    PageBuf::capacity(TREE_SPECIAL_SIZE) - LINE_POINTER_SIZE - compressed_item_len(0)
}

fn flush_batch(comp: BoundedCompressor, batch: &mut Vec<LeafItem>, out: &mut Vec<EncodedLeaf>) {
    if batch.is_empty() {
        return;
    }

    match comp.finish() {
        Some((payload, uncompressed_size)) => {
            let first = batch.first().map_or(Tid::INVALID, LeafItem::tid);
            let last = batch.last().map_or(Tid::INVALID, LeafItem::last_tid);

            let container = LeafItem::Compressed(CompressedItem {
                tid: first,
                lasttid: last,
                uncompressed_size,
                payload: Slice::from(payload),
            });

            out.push(EncodedLeaf {
                bytes: container.encode(),
                first,
            });
        }

        // Compression did not shrink the batch: store the items as-is
        None => {
            for item in batch.drain(..) {
                out.push(EncodedLeaf {
                    first: item.tid(),
                    bytes: item.encode(),
                });
            }
        }
    }

    batch.clear();
}

/// Packs an item list, feeding uncompressed runs through the compressor
/// and passing already-compressed containers straight through.
fn pack(compression: CompressionType, items: Vec<LeafItem>) -> Vec<EncodedLeaf> {
    let budget = container_budget();

    let mut out = Vec::new();
    let mut batch: Vec<LeafItem> = Vec::new();
    let mut comp = BoundedCompressor::begin(compression, budget);

    for item in items {
        if matches!(item, LeafItem::Compressed(_)) {
            let pending = std::mem::replace(&mut comp, BoundedCompressor::begin(compression, budget));
            flush_batch(pending, &mut batch, &mut out);

            out.push(EncodedLeaf {
                first: item.tid(),
                bytes: item.encode(),
            });
            continue;
        }

        let encoded = item.encode();

        match comp.add(&encoded) {
            AddOutcome::Fit => batch.push(item),

            AddOutcome::Full => {
                let pending =
                    std::mem::replace(&mut comp, BoundedCompressor::begin(compression, budget));
                flush_batch(pending, &mut batch, &mut out);

                match comp.add(&encoded) {
                    AddOutcome::Fit => batch.push(item),

                    // A lone item the compressor cannot fit goes out raw
                    AddOutcome::Full => out.push(EncodedLeaf {
                        first: item.tid(),
                        bytes: encoded,
                    }),
                }
            }
        }
    }

    flush_batch(comp, &mut batch, &mut out);
    out
}

fn write_image(page: &mut PageBuf, image: &[EncodedLeaf]) {
    page.clear_items();
    for enc in image {
        assert!(page.add_item(&enc.bytes), "page image exceeds page capacity");
    }
}

/// Repacks `items` onto the latched leaf, spilling into new right
/// siblings and installing their downlinks.
pub fn recompress_and_write(
    inner: &StoreInner,
    attno: AttrNumber,
    mut leaf: ExclusivePage,
    items: Vec<LeafItem>,
) -> crate::Result<()> {
    let orig = node::read_opaque(&leaf);
    let capacity = PageBuf::capacity(TREE_SPECIAL_SIZE);

    let packed = pack(inner.compression, items);

    // Paginate into page images; a new image starts whenever the current
    // one has no room, and its first TID becomes the split boundary
    let mut images: Vec<Vec<EncodedLeaf>> = Vec::new();
    let mut current: Vec<EncodedLeaf> = Vec::new();
    let mut used = 0usize;

    for enc in packed {
        let need = enc.bytes.len() + LINE_POINTER_SIZE;
        debug_assert!(need <= capacity, "packed item exceeds page capacity");

        if used + need > capacity && !current.is_empty() {
            images.push(std::mem::take(&mut current));
            used = 0;
        }

        used += need;
        current.push(enc);
    }

    images.push(current);

    if images.len() == 1 {
        write_image(&mut leaf, images.first().map_or(&[][..], Vec::as_slice));
        return Ok(());
    }

    // Allocate all new sibling buffers before writing anything, so
    // running out of space cannot corrupt intermediate state
    let mut rights = Vec::with_capacity(images.len() - 1);
    for _ in 1..images.len() {
        rights.push(inner.pager.new_page()?);
    }

    let boundaries: Vec<Tid> = images
        .iter()
        .skip(1)
        .map(|img| img.first().map_or(Tid::INVALID, |e| e.first))
        .collect();

    log::debug!(
        "attribute {attno}: leaf {} split into {} pages at {:?}",
        leaf.block(),
        images.len(),
        boundaries
    );

    // Write the left image over the original page
    write_image(&mut leaf, images.first().map_or(&[][..], Vec::as_slice));
    node::write_opaque(
        &mut leaf,
        &TreeOpaque {
            hikey: *boundaries.first().unwrap_or(&orig.hikey),
            next: rights.first().map_or(orig.next, |(_, blk)| *blk),
            flags: orig.flags | FLAG_FOLLOW_RIGHT,
            ..orig
        },
    );

    // Write the spilled images; non-last pages point right and carry
    // follow-right until their sibling's downlink is installed
    for (i, (pin, _)) in rights.iter().enumerate() {
        let mut guard = pin.exclusive();

        let lokey = *boundaries.get(i).unwrap_or(&orig.hikey);
        let hikey = *boundaries.get(i + 1).unwrap_or(&orig.hikey);

        let (next, flags) = if i + 1 < rights.len() {
            (
                rights.get(i + 1).map_or(orig.next, |(_, blk)| *blk),
                FLAG_FOLLOW_RIGHT,
            )
        } else {
            (orig.next, orig.flags & FLAG_FOLLOW_RIGHT)
        };

        node::format_tree_page(
            &mut guard,
            &TreeOpaque {
                attno,
                next,
                lokey,
                hikey,
                level: orig.level,
                flags,
            },
        );

        write_image(&mut guard, images.get(i + 1).map_or(&[][..], Vec::as_slice));
    }

    // Install downlinks left to right; each call releases its left latch
    let mut left = leaf;
    for (i, (pin, blk)) in rights.iter().enumerate() {
        let right_lokey = *boundaries.get(i).unwrap_or(&orig.hikey);

        let next_left = if i + 1 < rights.len() {
            Some(pin)
        } else {
            None
        };

        downlink::insert_downlink(inner, attno, left, right_lokey, *blk)?;

        match next_left {
            Some(pin) => left = pin.exclusive(),
            None => break,
        }
    }

    Ok(())
}
