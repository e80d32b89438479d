// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Append-only UNDO log.
//!
//! Visibility records live on dedicated pages chained from the metapage.
//! Records are addressed by a monotonically increasing counter; counter
//! assignment is serialized by the metapage latch, so a counter becomes
//! visible to readers only after its record is in place. Storage below the
//! oldest-live counter is recycled, because by definition no reader can
//! observe records below it.

mod record;

pub use record::UndoRecord;

use crate::{
    coding::{Decode, Encode},
    error::corrupt,
    meta::{self, META_BLOCK},
    page::{tag, PageBuf},
    pager::{BlockNumber, PageStore, INVALID_BLOCK},
};
use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;
use std::io::Cursor;

/// Opaque tail of an UNDO page: next(4) first_counter(8) reserved(8) pad(2) tag(2).
const UNDO_SPECIAL_SIZE: usize = 24;

/// Address of an UNDO record: a monotonic counter
///
/// `0` is reserved as the invalid pointer; data-attribute items carry it.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct UndoPtr(u64);

impl UndoPtr {
    /// The invalid pointer.
    pub const INVALID: Self = Self(0);

    /// Constructs from the raw counter.
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw counter value.
    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Whether this pointer addresses a record.
    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for UndoPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn read_next(page: &PageBuf) -> BlockNumber {
    LittleEndian::read_u32(&page.special_area()[0..4])
}

fn write_next(page: &mut PageBuf, next: BlockNumber) {
    LittleEndian::write_u32(&mut page.special_area_mut()[0..4], next);
}

fn read_first_counter(page: &PageBuf) -> u64 {
    LittleEndian::read_u64(&page.special_area()[4..12])
}

fn write_first_counter(page: &mut PageBuf, counter: u64) {
    LittleEndian::write_u64(&mut page.special_area_mut()[4..12], counter);
}

/// The UNDO log of one store
///
/// Holds only the in-memory page index (first counter per UNDO page);
/// everything durable lives on the pages and the metapage.
pub struct UndoLog {
    /// `(first_counter, block)` per UNDO page, ascending
    index: Mutex<Vec<(u64, BlockNumber)>>,
}

impl Default for UndoLog {
    fn default() -> Self {
        Self::new()
    }
}

impl UndoLog {
    /// Creates an empty log handle.
    #[must_use]
    pub fn new() -> Self {
        Self {
            index: Mutex::new(Vec::new()),
        }
    }

    /// Rebuilds the page index from the on-disk chain (store re-open).
    pub fn rebuild(&self, pager: &PageStore) -> crate::Result<()> {
        let meta_pin = pager.pin(META_BLOCK)?;
        let opaque = meta::read_opaque(&meta_pin.share());

        let mut index = Vec::new();
        let mut blk = opaque.undo_head;
        let mut hops = 0u32;

        while blk != INVALID_BLOCK {
            let page = pager.pin(blk)?.share();

            if page.page_tag() != tag::UNDO {
                return corrupt(blk, "UNDO chain leads to a non-UNDO page");
            }

            index.push((read_first_counter(&page), blk));

            let next = read_next(&page);
            drop(page);

            hops += 1;
            if hops > pager.block_count() {
                return corrupt(blk, "cycle in UNDO page chain");
            }

            blk = next;
        }

        log::debug!("rebuilt UNDO index over {} pages", index.len());

        *self.index.lock() = index;
        Ok(())
    }

    /// Appends a record, assigning the next counter.
    pub fn append(&self, pager: &PageStore, record: &UndoRecord) -> crate::Result<UndoPtr> {
        let meta_pin = pager.pin(META_BLOCK)?;
        let mut meta_page = meta_pin.exclusive();

        let mut opaque = meta::read_opaque(&meta_page);
        let counter = opaque.undo_counter;
        let encoded = record.encode_into_vec();

        let appended = if opaque.undo_tail == INVALID_BLOCK {
            false
        } else {
            let tail_pin = pager.pin(opaque.undo_tail)?;
            let mut tail = tail_pin.exclusive();

            if tail.free_space() >= encoded.len() {
                assert!(tail.add_item(&encoded));
                true
            } else {
                // Tail is full; chain a fresh page behind it below
                false
            }
        };

        if !appended {
            let (new_pin, new_blk) = pager.new_page()?;
            let mut new_page = new_pin.exclusive();

            new_page.format(UNDO_SPECIAL_SIZE, tag::UNDO);
            write_first_counter(&mut new_page, counter);
            write_next(&mut new_page, INVALID_BLOCK);
            assert!(new_page.add_item(&encoded));

            if opaque.undo_tail == INVALID_BLOCK {
                opaque.undo_head = new_blk;
            } else {
                let tail_pin = pager.pin(opaque.undo_tail)?;
                write_next(&mut tail_pin.exclusive(), new_blk);
            }

            opaque.undo_tail = new_blk;
            self.index.lock().push((counter, new_blk));

            log::trace!("UNDO log grew to block {new_blk}");
        }

        opaque.undo_counter = counter + 1;
        meta::write_opaque(&mut meta_page, &opaque);

        log::trace!("UNDO append {record:?} at {counter}");

        Ok(UndoPtr::from_raw(counter))
    }

    /// Fetches the record at `ptr`.
    ///
    /// Returns `None` if `ptr` is below the oldest-live counter (its
    /// storage may already be recycled) or beyond the last assigned one.
    pub fn fetch(&self, pager: &PageStore, ptr: UndoPtr) -> crate::Result<Option<UndoRecord>> {
        if !ptr.is_valid() {
            return Ok(None);
        }

        {
            let meta_pin = pager.pin(META_BLOCK)?;
            let opaque = meta::read_opaque(&meta_pin.share());

            if ptr.raw() < opaque.undo_oldest || ptr.raw() >= opaque.undo_counter {
                return Ok(None);
            }
        }

        let blk = {
            let index = self.index.lock();
            let pos = index.partition_point(|(first, _)| *first <= ptr.raw());
            match pos.checked_sub(1).and_then(|p| index.get(p)) {
                Some((_, blk)) => *blk,
                None => return Ok(None),
            }
        };

        let page = pager.pin(blk)?.share();

        if page.page_tag() != tag::UNDO {
            return corrupt(blk, "UNDO pointer leads to a non-UNDO page");
        }

        let idx = (ptr.raw() - read_first_counter(&page)) as usize;
        if idx >= page.item_count() {
            return Ok(None);
        }

        let record = UndoRecord::decode_from(&mut Cursor::new(page.item(idx)))?;
        Ok(Some(record))
    }

    /// The counter below which no reader can observe records.
    pub fn oldest_live(&self, pager: &PageStore) -> crate::Result<UndoPtr> {
        let meta_pin = pager.pin(META_BLOCK)?;
        let opaque = meta::read_opaque(&meta_pin.share());
        Ok(UndoPtr::from_raw(opaque.undo_oldest))
    }

    /// Advances the oldest-live counter (monotone) and recycles UNDO pages
    /// that hold only dead records.
    ///
    /// Advancing to `to` asserts that no reader can observe any record
    /// below `to` anymore, which is what makes recycling safe.
    pub fn advance_oldest(&self, pager: &PageStore, to: UndoPtr) -> crate::Result<()> {
        let meta_pin = pager.pin(META_BLOCK)?;
        let mut meta_page = meta_pin.exclusive();

        let mut opaque = meta::read_opaque(&meta_page);

        if to.raw() <= opaque.undo_oldest {
            return Ok(());
        }

        opaque.undo_oldest = to.raw();

        while opaque.undo_head != INVALID_BLOCK && opaque.undo_head != opaque.undo_tail {
            let blk = opaque.undo_head;
            let page = pager.pin(blk)?.share();

            let last = read_first_counter(&page) + page.item_count() as u64 - 1;
            if last >= opaque.undo_oldest {
                break;
            }

            let next = read_next(&page);
            drop(page);

            pager.free_page(blk);
            self.index.lock().retain(|(_, b)| *b != blk);
            opaque.undo_head = next;

            log::debug!("recycled UNDO block {blk} (records below {})", opaque.undo_oldest);
        }

        meta::write_opaque(&mut meta_page, &opaque);

        Ok(())
    }
}
