// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The metapage: block 0 of every store.
//!
//! Its opaque tail carries the UNDO log state (head/tail blocks, next
//! counter, oldest live counter); its body is the root directory mapping
//! attribute numbers to tree root blocks.

use crate::{
    attribute::{AttrNumber, AttributeSpec},
    page::{PageBuf, PAGE_HEADER_SIZE, PAGE_SIZE},
    pager::{BlockNumber, INVALID_BLOCK},
};
use byteorder::{ByteOrder, LittleEndian};

/// The metapage is always the first block.
pub const META_BLOCK: BlockNumber = 0;

/// Opaque tail: head(4) tail(4) counter(8) oldest(8) pad(2) tag(2).
const META_SPECIAL_SIZE: usize = 28;

/// Bytes per root directory entry: root(4) attlen(2) byval(1).
const DIR_ENTRY_SIZE: usize = 7;

/// UNDO log state kept in the metapage's opaque tail
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MetaOpaque {
    /// Oldest UNDO page still holding live records
    pub undo_head: BlockNumber,

    /// UNDO page currently being appended to
    pub undo_tail: BlockNumber,

    /// Next UNDO counter to assign
    pub undo_counter: u64,

    /// Counter below which no reader can observe UNDO records
    pub undo_oldest: u64,
}

/// One root directory slot
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DirectoryEntry {
    /// Root block of the attribute's tree; [`INVALID_BLOCK`] if empty
    pub root: BlockNumber,

    /// Attribute shape
    pub spec: AttributeSpec,
}

/// Reads the UNDO state from a metapage.
#[must_use]
pub fn read_opaque(page: &PageBuf) -> MetaOpaque {
    let special = page.special_area();

    MetaOpaque {
        undo_head: LittleEndian::read_u32(&special[0..4]),
        undo_tail: LittleEndian::read_u32(&special[4..8]),
        undo_counter: LittleEndian::read_u64(&special[8..16]),
        undo_oldest: LittleEndian::read_u64(&special[16..24]),
    }
}

/// Writes the UNDO state into a metapage.
pub fn write_opaque(page: &mut PageBuf, opaque: &MetaOpaque) {
    let special = page.special_area_mut();

    LittleEndian::write_u32(&mut special[0..4], opaque.undo_head);
    LittleEndian::write_u32(&mut special[4..8], opaque.undo_tail);
    LittleEndian::write_u64(&mut special[8..16], opaque.undo_counter);
    LittleEndian::write_u64(&mut special[16..24], opaque.undo_oldest);
}

/// Formats block 0: empty root directory slots for the meta-attribute plus
/// `attrs`, and UNDO counters starting at 1.
pub fn init_metapage(page: &mut PageBuf, attrs: &[AttributeSpec]) -> crate::Result<()> {
    if attrs.is_empty() {
        return Err(crate::Error::Config("a table needs at least one attribute"));
    }

    let n_entries = attrs.len() + 1;
    if 4 + n_entries * DIR_ENTRY_SIZE > PAGE_SIZE - PAGE_HEADER_SIZE - META_SPECIAL_SIZE {
        return Err(crate::Error::Config("root directory does not fit the metapage"));
    }

    page.format(META_SPECIAL_SIZE, crate::page::tag::META);

    write_opaque(
        page,
        &MetaOpaque {
            undo_head: INVALID_BLOCK,
            undo_tail: INVALID_BLOCK,
            undo_counter: 1,
            undo_oldest: 1,
        },
    );

    let body = page.body_mut();

    #[allow(clippy::cast_possible_truncation)]
    LittleEndian::write_u32(&mut body[0..4], n_entries as u32);

    write_entry(body, 0, &DirectoryEntry {
        root: INVALID_BLOCK,
        spec: AttributeSpec::meta(),
    });

    for (i, spec) in attrs.iter().enumerate() {
        write_entry(body, i + 1, &DirectoryEntry {
            root: INVALID_BLOCK,
            spec: *spec,
        });
    }

    log::debug!("initialized metapage with {} attributes", attrs.len());

    Ok(())
}

/// Number of directory entries (the meta-attribute included).
#[must_use]
pub fn n_entries(page: &PageBuf) -> usize {
    LittleEndian::read_u32(&page.body()[0..4]) as usize
}

fn entry_offset(attno: AttrNumber) -> usize {
    4 + usize::from(attno) * DIR_ENTRY_SIZE
}

/// Reads one directory entry; `None` for an attribute the store does not have.
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub fn directory_entry(page: &PageBuf, attno: AttrNumber) -> Option<DirectoryEntry> {
    if usize::from(attno) >= n_entries(page) {
        return None;
    }

    let body = page.body();
    let off = entry_offset(attno);
    let raw = body.get(off..off + DIR_ENTRY_SIZE)?;

    Some(DirectoryEntry {
        root: LittleEndian::read_u32(&raw[0..4]),
        spec: AttributeSpec {
            attlen: LittleEndian::read_u16(&raw[4..6]) as i16,
            byval: raw[6] != 0,
        },
    })
}

fn write_entry(body: &mut [u8], idx: usize, entry: &DirectoryEntry) {
    let off = 4 + idx * DIR_ENTRY_SIZE;
    let raw = &mut body[off..off + DIR_ENTRY_SIZE];

    LittleEndian::write_u32(&mut raw[0..4], entry.root);
    #[allow(clippy::cast_sign_loss)]
    LittleEndian::write_u16(&mut raw[4..6], entry.spec.attlen as u16);
    raw[6] = u8::from(entry.spec.byval);
}

/// Overwrites an attribute's root block.
///
/// # Panics
///
/// Panics if the attribute does not exist.
pub fn set_root(page: &mut PageBuf, attno: AttrNumber, root: BlockNumber) {
    assert!(usize::from(attno) < n_entries(page), "no such attribute");

    let body = page.body_mut();
    let off = entry_offset(attno);
    LittleEndian::write_u32(&mut body[off..off + 4], root);
}

/// Appends attributes to the root directory.
pub fn add_attributes(page: &mut PageBuf, specs: &[AttributeSpec]) -> crate::Result<()> {
    let current = n_entries(page);
    let total = current + specs.len();

    if 4 + total * DIR_ENTRY_SIZE > PAGE_SIZE - PAGE_HEADER_SIZE - META_SPECIAL_SIZE {
        return Err(crate::Error::Config("root directory does not fit the metapage"));
    }

    let body = page.body_mut();

    for (i, spec) in specs.iter().enumerate() {
        write_entry(body, current + i, &DirectoryEntry {
            root: INVALID_BLOCK,
            spec: *spec,
        });
    }

    #[allow(clippy::cast_possible_truncation)]
    LittleEndian::write_u32(&mut body[0..4], total as u32);

    log::debug!("root directory grown to {total} entries");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn metapage_init_and_read() -> crate::Result<()> {
        let mut page = PageBuf::new_zeroed();
        init_metapage(&mut page, &[AttributeSpec::fixed(8), AttributeSpec::varlen()])?;

        assert_eq!(crate::page::tag::META, page.page_tag());
        assert_eq!(3, n_entries(&page));

        let opaque = read_opaque(&page);
        assert_eq!(1, opaque.undo_counter);
        assert_eq!(1, opaque.undo_oldest);
        assert_eq!(INVALID_BLOCK, opaque.undo_head);

        let meta_attr = directory_entry(&page, 0).expect("meta-attribute entry");
        assert_eq!(0, meta_attr.spec.attlen);
        assert_eq!(INVALID_BLOCK, meta_attr.root);

        let second = directory_entry(&page, 2).expect("second attribute");
        assert_eq!(-1, second.spec.attlen);

        assert!(directory_entry(&page, 3).is_none());

        Ok(())
    }

    #[test]
    fn metapage_set_root() -> crate::Result<()> {
        let mut page = PageBuf::new_zeroed();
        init_metapage(&mut page, &[AttributeSpec::fixed(4)])?;

        set_root(&mut page, 1, 17);
        assert_eq!(17, directory_entry(&page, 1).expect("entry").root);

        Ok(())
    }

    #[test]
    fn metapage_zero_attributes_rejected() {
        let mut page = PageBuf::new_zeroed();
        assert!(matches!(
            init_metapage(&mut page, &[]),
            Err(crate::Error::Config(_))
        ));
    }

    #[test]
    fn metapage_add_attributes() -> crate::Result<()> {
        let mut page = PageBuf::new_zeroed();
        init_metapage(&mut page, &[AttributeSpec::fixed(4)])?;

        add_attributes(&mut page, &[AttributeSpec::varlen()])?;

        assert_eq!(3, n_entries(&page));
        let added = directory_entry(&page, 2).expect("added entry");
        assert_eq!(-1, added.spec.attlen);
        assert_eq!(INVALID_BLOCK, added.root);

        Ok(())
    }

    #[test]
    fn metapage_directory_overflow() {
        let mut page = PageBuf::new_zeroed();
        let too_many = vec![AttributeSpec::fixed(4); 2_000];
        assert!(matches!(
            init_metapage(&mut page, &too_many),
            Err(crate::Error::Config(_))
        ));
    }

    #[test]
    fn metapage_opaque_roundtrip() -> crate::Result<()> {
        let mut page = PageBuf::new_zeroed();
        init_metapage(&mut page, &[AttributeSpec::fixed(4)])?;

        let opaque = MetaOpaque {
            undo_head: 5,
            undo_tail: 9,
            undo_counter: 1_234,
            undo_oldest: 1_000,
        };
        write_opaque(&mut page, &opaque);

        assert_eq!(opaque, read_opaque(&page));

        Ok(())
    }
}
