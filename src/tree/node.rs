// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Tree page layout: the opaque tail shared by leaves and internal pages,
//! and the `{tid, child}` entries internal pages are made of.

use crate::{
    attribute::AttrNumber,
    coding::DecodeError,
    item::LeafItem,
    page::{tag, PageBuf},
    pager::BlockNumber,
    tid::Tid,
};
use byteorder::{ByteOrder, LittleEndian};

/// Opaque tail of a tree page:
/// attno(2) next(4) lokey(8) hikey(8) level(2) flags(2) pad(2) tag(2).
pub const TREE_SPECIAL_SIZE: usize = 30;

/// Encoded size of one internal entry.
pub const INTERNAL_ENTRY_SIZE: usize = 12;

/// The page's right sibling may lack its parent downlink; descents with
/// `key >= hikey` must chase the right-link.
pub const FLAG_FOLLOW_RIGHT: u16 = 0x01;

/// The page is its tree's root.
pub const FLAG_ROOT: u16 = 0x02;

/// Opaque tail of a tree page
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TreeOpaque {
    /// Attribute this tree belongs to
    pub attno: AttrNumber,

    /// Right sibling at the same level; [`crate::pager::INVALID_BLOCK`]
    /// for the rightmost page
    pub next: BlockNumber,

    /// Inclusive low key
    pub lokey: Tid,

    /// Exclusive high key
    pub hikey: Tid,

    /// 0 for leaves, growing towards the root
    pub level: u16,

    /// `FLAG_*` bits
    pub flags: u16,
}

impl TreeOpaque {
    /// Whether the follow-right bit is set.
    #[must_use]
    pub fn follow_right(&self) -> bool {
        self.flags & FLAG_FOLLOW_RIGHT != 0
    }

    /// Whether this page is its tree's root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.flags & FLAG_ROOT != 0
    }
}

/// Reads the opaque tail of a tree page.
#[must_use]
pub fn read_opaque(page: &PageBuf) -> TreeOpaque {
    let special = page.special_area();

    TreeOpaque {
        attno: LittleEndian::read_u16(&special[0..2]),
        next: LittleEndian::read_u32(&special[2..6]),
        lokey: Tid::from_raw(LittleEndian::read_u64(&special[6..14])),
        hikey: Tid::from_raw(LittleEndian::read_u64(&special[14..22])),
        level: LittleEndian::read_u16(&special[22..24]),
        flags: LittleEndian::read_u16(&special[24..26]),
    }
}

/// Writes the opaque tail of a tree page.
pub fn write_opaque(page: &mut PageBuf, opaque: &TreeOpaque) {
    let special = page.special_area_mut();

    LittleEndian::write_u16(&mut special[0..2], opaque.attno);
    LittleEndian::write_u32(&mut special[2..6], opaque.next);
    LittleEndian::write_u64(&mut special[6..14], opaque.lokey.raw());
    LittleEndian::write_u64(&mut special[14..22], opaque.hikey.raw());
    LittleEndian::write_u16(&mut special[22..24], opaque.level);
    LittleEndian::write_u16(&mut special[24..26], opaque.flags);
}

/// Formats a tree page with the given opaque state.
pub fn format_tree_page(page: &mut PageBuf, opaque: &TreeOpaque) {
    page.format(TREE_SPECIAL_SIZE, tag::TREE);
    write_opaque(page, opaque);
}

/// One downlink on an internal page
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct InternalEntry {
    /// Low key of the child's range
    pub tid: Tid,

    /// Child block
    pub child: BlockNumber,
}

impl InternalEntry {
    /// Encodes the entry.
    #[must_use]
    pub fn encode(&self) -> [u8; INTERNAL_ENTRY_SIZE] {
        let mut buf = [0u8; INTERNAL_ENTRY_SIZE];
        LittleEndian::write_u64(&mut buf[0..8], self.tid.raw());
        LittleEndian::write_u32(&mut buf[8..12], self.child);
        buf
    }

    /// Decodes an entry from raw item bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != INTERNAL_ENTRY_SIZE {
            return Err(DecodeError::InvalidHeader("InternalEntry"));
        }

        Ok(Self {
            tid: Tid::from_raw(LittleEndian::read_u64(&bytes[0..8])),
            child: LittleEndian::read_u32(&bytes[8..12]),
        })
    }
}

/// Reads entry `idx` of an internal page.
///
/// # Panics
///
/// Panics if the bytes at `idx` are not an internal entry.
#[must_use]
#[allow(clippy::expect_used)]
pub fn entry_at(page: &PageBuf, idx: usize) -> InternalEntry {
    InternalEntry::decode(page.item(idx)).expect("internal page holds fixed-size entries")
}

/// All entries of an internal page, in order.
#[must_use]
pub fn entries(page: &PageBuf) -> Vec<InternalEntry> {
    (0..page.item_count()).map(|i| entry_at(page, i)).collect()
}

/// Binary search: index of the largest entry with `tid <= key`.
///
/// `None` means the key is below the page's first entry, which a
/// well-formed descent never sees (the first entry's tid equals the
/// page's low key).
#[must_use]
pub fn search(page: &PageBuf, key: Tid) -> Option<usize> {
    let mut left = 0;
    let mut right = page.item_count();

    // NOTE: Hand-rolled partition point, same shape the scan search uses
    while left < right {
        let mid = (left + right) / 2;

        if entry_at(page, mid).tid <= key {
            left = mid + 1;
        } else {
            right = mid;
        }
    }

    left.checked_sub(1)
}

/// Decodes every leaf item on a page, in TID order.
pub fn leaf_items(page: &PageBuf) -> Result<Vec<LeafItem>, DecodeError> {
    (0..page.item_count())
        .map(|i| LeafItem::decode(page.item(i)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn internal_page(keys: &[u64]) -> PageBuf {
        let mut page = PageBuf::new_zeroed();
        format_tree_page(
            &mut page,
            &TreeOpaque {
                attno: 1,
                next: crate::pager::INVALID_BLOCK,
                lokey: Tid::from_raw(*keys.first().expect("nonempty")),
                hikey: Tid::MAX,
                level: 1,
                flags: 0,
            },
        );

        for (i, key) in keys.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let entry = InternalEntry {
                tid: Tid::from_raw(*key),
                child: (i + 1) as BlockNumber,
            };
            assert!(page.add_item(&entry.encode()));
        }

        page
    }

    #[test]
    fn opaque_roundtrip() {
        let mut page = PageBuf::new_zeroed();
        let opaque = TreeOpaque {
            attno: 3,
            next: 42,
            lokey: Tid::from_raw(100),
            hikey: Tid::from_raw(200),
            level: 2,
            flags: FLAG_FOLLOW_RIGHT | FLAG_ROOT,
        };

        format_tree_page(&mut page, &opaque);

        assert_eq!(opaque, read_opaque(&page));
        assert_eq!(tag::TREE, page.page_tag());
        assert!(read_opaque(&page).follow_right());
        assert!(read_opaque(&page).is_root());
    }

    #[test]
    fn internal_search_picks_covering_child() {
        let page = internal_page(&[10, 20, 30, 40]);

        // Exact hits choose the entry itself
        assert_eq!(Some(0), search(&page, Tid::from_raw(10)));
        assert_eq!(Some(2), search(&page, Tid::from_raw(30)));

        // Between entries, the left neighbor covers the key
        assert_eq!(Some(0), search(&page, Tid::from_raw(15)));
        assert_eq!(Some(3), search(&page, Tid::from_raw(999)));

        // Below the first entry
        assert_eq!(None, search(&page, Tid::from_raw(5)));
    }

    #[test]
    fn internal_search_single_entry() {
        let page = internal_page(&[1]);
        assert_eq!(Some(0), search(&page, Tid::from_raw(1)));
        assert_eq!(Some(0), search(&page, Tid::MAX));
    }

    #[test]
    fn internal_entry_roundtrip() {
        let entry = InternalEntry {
            tid: Tid::from_raw(77),
            child: 1_234,
        };

        let decoded = InternalEntry::decode(&entry.encode()).expect("should decode");
        assert_eq!(entry, decoded);
    }
}
