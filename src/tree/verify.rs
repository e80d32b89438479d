// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Structural verification of one attribute tree.
//!
//! Walks the tree from the root and checks the at-rest invariants:
//! downlink/lokey/hikey agreement, item ordering and bounds, right-link
//! continuity per level, follow-right orphan rules, and compressed-item
//! containment. Violations are collected as human-readable strings
//! instead of failing fast, so tests can assert on all of them at once.

use crate::{
    attribute::AttrNumber,
    compression,
    item::{self, LeafItem},
    page::tag,
    pager::{BlockNumber, INVALID_BLOCK},
    store::StoreInner,
    tid::Tid,
    tree::{descend::tree_root, node},
};
use std::collections::BTreeMap;

#[derive(Clone, Debug)]
struct PageInfo {
    blk: BlockNumber,
    lokey: Tid,
    hikey: Tid,
    next: BlockNumber,
    follow_right: bool,
}

/// Checks every structural invariant of one attribute tree, returning a
/// list of violations (empty for a healthy tree).
pub fn verify(inner: &StoreInner, attno: AttrNumber) -> crate::Result<Vec<String>> {
    let mut violations = Vec::new();

    let Some(root) = tree_root(inner, attno, false)? else {
        return Ok(violations);
    };

    // Pages per level in parent-traversal (left-to-right) order
    let mut levels: BTreeMap<u16, Vec<PageInfo>> = BTreeMap::new();

    walk(
        inner,
        attno,
        root,
        Tid::MIN,
        Tid::MAX,
        None,
        &mut levels,
        &mut violations,
    )?;

    // Right-link continuity per level: every parent-reachable page must
    // appear on its level's chain, in order; extra chain members are
    // legal only behind a follow-right page (an in-progress split)
    for (level, pages) in &levels {
        let Some(first) = pages.first() else { continue };

        let mut chain: Vec<PageInfo> = Vec::new();
        let mut blk = first.blk;
        let mut hops = 0u32;

        while blk != INVALID_BLOCK {
            hops += 1;
            if hops > inner.pager.block_count() {
                violations.push(format!("level {level}: right-link cycle at block {blk}"));
                break;
            }

            let page = inner.pager.pin(blk)?.share();
            let opaque = node::read_opaque(&page);

            chain.push(PageInfo {
                blk,
                lokey: opaque.lokey,
                hikey: opaque.hikey,
                next: opaque.next,
                follow_right: opaque.follow_right(),
            });

            blk = opaque.next;
        }

        // Key ranges tile the key space along the chain
        for pair in chain.windows(2) {
            if let (Some(a), Some(b)) = (pair.first(), pair.get(1)) {
                if a.hikey != b.lokey {
                    violations.push(format!(
                        "level {level}: block {} hikey {} != right sibling {} lokey {}",
                        a.blk, a.hikey, b.blk, b.lokey
                    ));
                }
            }
        }

        let reachable: Vec<BlockNumber> = pages.iter().map(|p| p.blk).collect();
        let mut prev_follow_right = false;

        for info in &chain {
            if !reachable.contains(&info.blk) {
                if prev_follow_right {
                    // An orphan is fine mid-split, but it must start at
                    // its left neighbor's hikey (checked above) and no
                    // parent entry may point at it (checked by absence)
                } else {
                    violations.push(format!(
                        "level {level}: block {} is on the chain but has no downlink \
                         and its left neighbor does not advertise follow-right",
                        info.blk
                    ));
                }
            }

            prev_follow_right = info.follow_right;
        }

        // And the other way around: every downlinked page is on the chain
        for info in pages {
            if !chain.iter().any(|c| c.blk == info.blk) {
                violations.push(format!(
                    "level {level}: block {} has a downlink but is not reachable \
                     by right-link traversal",
                    info.blk
                ));
            }
        }
    }

    Ok(violations)
}

/// Recursively checks one page and its subtree.
#[allow(clippy::too_many_arguments)]
fn walk(
    inner: &StoreInner,
    attno: AttrNumber,
    blk: BlockNumber,
    expect_lokey: Tid,
    expect_hikey: Tid,
    expect_level: Option<u16>,
    levels: &mut BTreeMap<u16, Vec<PageInfo>>,
    violations: &mut Vec<String>,
) -> crate::Result<()> {
    let page = inner.pager.pin(blk)?.share();

    if page.page_tag() != tag::TREE {
        violations.push(format!("block {blk}: not a tree page"));
        return Ok(());
    }

    let opaque = node::read_opaque(&page);

    if opaque.attno != attno {
        violations.push(format!(
            "block {blk}: belongs to attribute {}, expected {attno}",
            opaque.attno
        ));
        return Ok(());
    }

    if opaque.lokey != expect_lokey {
        violations.push(format!(
            "block {blk}: lokey {} does not match downlink {expect_lokey}",
            opaque.lokey
        ));
    }

    if opaque.hikey != expect_hikey && !opaque.follow_right() {
        violations.push(format!(
            "block {blk}: hikey {} does not match parent range bound {expect_hikey}",
            opaque.hikey
        ));
    }

    if let Some(expected) = expect_level {
        if opaque.level != expected {
            violations.push(format!(
                "block {blk}: level {} where parent promises {expected}",
                opaque.level
            ));
        }
    }

    levels.entry(opaque.level).or_default().push(PageInfo {
        blk,
        lokey: opaque.lokey,
        hikey: opaque.hikey,
        next: opaque.next,
        follow_right: opaque.follow_right(),
    });

    if opaque.level == 0 {
        verify_leaf_items(inner, blk, &page, &opaque, violations)?;
        return Ok(());
    }

    // Internal page: entries strictly ascending, first entry at lokey
    let entries = node::entries(&page);

    if entries.is_empty() {
        violations.push(format!("block {blk}: internal page with no entries"));
        return Ok(());
    }

    if entries.first().is_some_and(|e| e.tid != opaque.lokey) {
        violations.push(format!(
            "block {blk}: first entry does not equal the page's lokey {}",
            opaque.lokey
        ));
    }

    for pair in entries.windows(2) {
        if pair.first().zip(pair.get(1)).is_some_and(|(a, b)| a.tid >= b.tid) {
            violations.push(format!("block {blk}: entries out of order"));
        }
    }

    drop(page);

    for (i, entry) in entries.iter().enumerate() {
        let child_hikey = entries
            .get(i + 1)
            .map_or(opaque.hikey, |next| next.tid);

        walk(
            inner,
            attno,
            entry.child,
            entry.tid,
            child_hikey,
            Some(opaque.level - 1),
            levels,
            violations,
        )?;
    }

    Ok(())
}

fn verify_leaf_items(
    inner: &StoreInner,
    blk: BlockNumber,
    page: &crate::page::PageBuf,
    opaque: &node::TreeOpaque,
    violations: &mut Vec<String>,
) -> crate::Result<()> {
    let mut prev_last = None::<Tid>;

    for idx in 0..page.item_count() {
        let item = match LeafItem::decode(page.item(idx)) {
            Ok(item) => item,
            Err(e) => {
                violations.push(format!("block {blk}: undecodable leaf item {idx}: {e}"));
                continue;
            }
        };

        if item.tid() < opaque.lokey || item.last_tid() >= opaque.hikey {
            violations.push(format!(
                "block {blk}: item [{}, {}] outside page range [{}, {})",
                item.tid(),
                item.last_tid(),
                opaque.lokey,
                opaque.hikey
            ));
        }

        if prev_last.is_some_and(|prev| item.tid() <= prev) {
            violations.push(format!(
                "block {blk}: item at {} overlaps or disorders its predecessor",
                item.tid()
            ));
        }
        prev_last = Some(item.last_tid());

        if let LeafItem::Compressed(container) = &item {
            match compression::decompress(
                inner.compression,
                &container.payload,
                container.uncompressed_size,
            )
            .and_then(|raw| item::decode_container(&raw).map_err(crate::Error::Decode))
            {
                Ok(subs) => {
                    for sub in subs {
                        if matches!(sub, LeafItem::Compressed(_)) {
                            violations.push(format!("block {blk}: nested compressed item"));
                        }

                        if sub.tid() < container.tid || sub.last_tid() > container.lasttid {
                            violations.push(format!(
                                "block {blk}: contained item [{}, {}] outside container \
                                 [{}, {}]",
                                sub.tid(),
                                sub.last_tid(),
                                container.tid,
                                container.lasttid
                            ));
                        }
                    }
                }
                Err(e) => {
                    violations.push(format!("block {blk}: container does not inflate: {e}"));
                }
            }
        }
    }

    Ok(())
}
