// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Leaf scans.
//!
//! A scan descends once to the leaf containing its start TID and then
//! walks right-links. Page latches are held only while copying qualifying
//! items into scan-owned memory; decompression and array unpacking happen
//! after the latch is dropped, and tuples are handed out one at a time
//! from the scan's buffer.

use crate::{
    attribute::{AttrNumber, AttributeSpec},
    compression,
    error::corrupt,
    item::{self, Datum, ItemFlags, LeafItem},
    page::tag,
    pager::{BlockNumber, INVALID_BLOCK},
    snapshot::Snapshot,
    store::Store,
    tid::Tid,
    tree::{
        descend::{descend, LatchKind, LatchedPage},
        node,
    },
    undo::UndoPtr,
    visibility::VisibilityChecker,
};
use std::collections::VecDeque;

/// One tuple yielded by a scan
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScanTuple {
    /// Row identifier
    pub tid: Tid,

    /// The datum; `None` is null
    pub datum: Datum,
}

/// A materialized row version awaiting its visibility check
struct BufferedVersion {
    tid: Tid,
    flags: ItemFlags,
    undo: UndoPtr,
    datum: Datum,
}

/// Iterator over one attribute's tree in TID order, filtered through a
/// snapshot
///
/// Dropping the scan releases everything; there is no explicit end call.
pub struct TidScan {
    store: Store,
    attno: AttrNumber,
    attr: AttributeSpec,
    snapshot: Snapshot,
    end_tid: Tid,

    next_tid: Tid,
    cur_blk: Option<BlockNumber>,
    buffer: VecDeque<BufferedVersion>,
    horizon: UndoPtr,
    started: bool,
    finished: bool,
}

impl TidScan {
    /// Positions a new scan over `[start_tid, end_tid)`.
    pub fn new(
        store: Store,
        attno: AttrNumber,
        start_tid: Tid,
        end_tid: Tid,
        snapshot: Snapshot,
    ) -> crate::Result<Self> {
        let attr = store.attribute(attno)?;
        let horizon = store.undo.oldest_live(&store.pager)?;

        log::trace!("attribute {attno}: scan [{start_tid}, {end_tid})");

        Ok(Self {
            store,
            attno,
            attr,
            snapshot,
            end_tid,
            next_tid: if start_tid.is_valid() { start_tid } else { Tid::MIN },
            cur_blk: None,
            buffer: VecDeque::new(),
            horizon,
            started: false,
            finished: false,
        })
    }

    /// Copies the next page's qualifying items into the buffer.
    fn refill(&mut self) -> crate::Result<()> {
        if self.next_tid >= self.end_tid {
            self.finished = true;
            return Ok(());
        }

        // Position on the next page: initial descent, then right-links
        let mut latch = if self.started {
            let Some(blk) = self.cur_blk else {
                self.finished = true;
                return Ok(());
            };
            LatchedPage::Shared(self.store.pager.pin(blk)?.share())
        } else {
            self.started = true;
            match descend(&self.store, self.attno, self.next_tid, 0, LatchKind::Shared)? {
                Some(latch) => latch,
                None => {
                    self.finished = true;
                    return Ok(());
                }
            }
        };

        // A split may have moved our position right since the sibling
        // link was recorded
        let mut hops = 0u32;
        let opaque = loop {
            hops += 1;
            if hops > self.store.pager.block_count() {
                return corrupt(latch.block(), "right-link cycle during scan");
            }

            let page = latch.page();

            if page.page_tag() != tag::TREE {
                return corrupt(latch.block(), "scan reached a non-tree page");
            }

            let opaque = node::read_opaque(page);

            if opaque.attno != self.attno || opaque.level != 0 {
                return corrupt(latch.block(), "scan left its leaf level");
            }

            if self.next_tid < opaque.hikey {
                break opaque;
            }

            if opaque.next == latch.block() {
                return corrupt(latch.block(), "leaf right-link points to itself");
            }

            if opaque.next == INVALID_BLOCK {
                self.finished = true;
                return Ok(());
            }

            latch = LatchedPage::Shared(
                self.store
                    .pager
                    .release_and_share(
                        match latch {
                            LatchedPage::Shared(guard) => guard,
                            LatchedPage::Exclusive(_) => unreachable!("scans latch shared"),
                        },
                        opaque.next,
                    )?,
            );
        };

        // Copy qualifying items into scan memory while latched; the item
        // decoder already copies payload bytes out of the page
        let mut copied: Vec<LeafItem> = Vec::new();
        {
            let page = latch.page();

            for idx in 0..page.item_count() {
                let raw = LeafItem::decode(page.item(idx))?;

                if raw.last_tid() < self.next_tid {
                    continue;
                }
                if raw.tid() >= self.end_tid {
                    break;
                }

                copied.push(raw);
            }
        }

        let blk = latch.block();
        drop(latch);

        // Latch released: unpack containers and arrays at leisure
        self.horizon = self.store.undo.oldest_live(&self.store.pager)?;

        for item in copied {
            self.expand(blk, item, false)?;
        }

        self.cur_blk = if opaque.next == INVALID_BLOCK {
            self.finished = true;
            None
        } else if opaque.hikey >= self.end_tid {
            self.finished = true;
            None
        } else {
            Some(opaque.next)
        };

        Ok(())
    }

    /// Expands one copied item into buffered row versions.
    fn expand(&mut self, blk: BlockNumber, raw: LeafItem, nested: bool) -> crate::Result<()> {
        match raw {
            LeafItem::Single(single) => {
                if single.tid >= self.next_tid && single.tid < self.end_tid {
                    let datum = if single.flags.contains(ItemFlags::NULL) {
                        None
                    } else {
                        Some(single.datum.clone())
                    };

                    self.buffer.push_back(BufferedVersion {
                        tid: single.tid,
                        flags: single.flags,
                        undo: single.undo,
                        datum,
                    });
                }
            }

            LeafItem::Array(array) => {
                for (tid, datum) in array.elements(&self.attr)? {
                    if tid < self.next_tid || tid >= self.end_tid {
                        continue;
                    }

                    self.buffer.push_back(BufferedVersion {
                        tid,
                        flags: array.flags,
                        undo: array.undo,
                        datum,
                    });
                }
            }

            LeafItem::Compressed(container) => {
                if nested {
                    return corrupt(blk, "nested compressed item");
                }

                let raw_payload = compression::decompress(
                    self.store.compression,
                    &container.payload,
                    container.uncompressed_size,
                )?;

                for sub in item::decode_container(&raw_payload)? {
                    self.expand(blk, sub, true)?;
                }
            }
        }

        Ok(())
    }
}

impl Iterator for TidScan {
    type Item = crate::Result<ScanTuple>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            while let Some(version) = self.buffer.pop_front() {
                if version.tid < self.next_tid {
                    continue;
                }

                if version.tid >= self.end_tid {
                    self.finished = true;
                    self.buffer.clear();
                    return None;
                }

                self.next_tid = version.tid.next();

                let checker = VisibilityChecker::with_horizon(
                    &self.store.pager,
                    &self.store.undo,
                    &self.store.registry,
                    self.horizon,
                );

                let visible = fail_iter!(checker.satisfies(
                    &self.snapshot,
                    version.tid,
                    version.flags,
                    version.undo,
                ));

                if visible {
                    return Some(Ok(ScanTuple {
                        tid: version.tid,
                        datum: version.datum,
                    }));
                }
            }

            if self.finished {
                return None;
            }

            fail_iter!(self.refill());
        }
    }
}
