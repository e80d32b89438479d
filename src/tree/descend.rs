// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Tree descent with right-link recovery.
//!
//! The metapage is consulted only for the root block and released before
//! any tree page is latched, and each level's latch is dropped before the
//! next level's is taken, so the global latch order stays acyclic: tree
//! pages child-before-parent and left-before-right, the metapage last.
//! A descent observing `key >= hikey` chases the right-link when
//! the page advertises an in-progress split, and otherwise restarts from
//! the root, remembering the dead end; reaching the same dead end twice
//! is a corruption error.

use crate::{
    attribute::AttrNumber,
    error::corrupt,
    meta::{self, META_BLOCK},
    page::{tag, PageBuf},
    pager::{BlockNumber, ExclusivePage, SharedPage, INVALID_BLOCK},
    store::StoreInner,
    tid::Tid,
    tree::node::{self, TreeOpaque, FLAG_ROOT},
};

/// Which latch a descent takes on the pages it visits
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LatchKind {
    /// Shared latches; pure readers
    Shared,

    /// Exclusive latches; mutations
    Exclusive,
}

/// A latched tree page of either kind
pub enum LatchedPage {
    /// Shared latch
    Shared(SharedPage),

    /// Exclusive latch
    Exclusive(ExclusivePage),
}

impl LatchedPage {
    /// The underlying page.
    #[must_use]
    pub fn page(&self) -> &PageBuf {
        match self {
            Self::Shared(guard) => guard,
            Self::Exclusive(guard) => guard,
        }
    }

    /// The latched block number.
    #[must_use]
    pub fn block(&self) -> BlockNumber {
        match self {
            Self::Shared(guard) => guard.block(),
            Self::Exclusive(guard) => guard.block(),
        }
    }

    /// Unwraps an exclusive latch.
    ///
    /// # Panics
    ///
    /// Panics if the latch is shared.
    #[must_use]
    pub fn into_exclusive(self) -> ExclusivePage {
        match self {
            Self::Exclusive(guard) => guard,
            Self::Shared(_) => panic!("descent did not take an exclusive latch"),
        }
    }
}

/// Returns the root block of an attribute tree.
///
/// With `create`, an empty tree gets a fresh root leaf covering the whole
/// key space; without, `None` is returned for an empty tree.
pub fn tree_root(
    inner: &StoreInner,
    attno: AttrNumber,
    create: bool,
) -> crate::Result<Option<BlockNumber>> {
    {
        let meta_pin = inner.pager.pin(META_BLOCK)?;
        let meta_page = meta_pin.share();

        let Some(entry) = meta::directory_entry(&meta_page, attno) else {
            return Err(crate::Error::Config("no such attribute"));
        };

        if entry.root != INVALID_BLOCK {
            return Ok(Some(entry.root));
        }
    }

    if !create {
        return Ok(None);
    }

    // Take the metapage exclusively and re-check; another writer may have
    // created the root in the meantime
    let meta_pin = inner.pager.pin(META_BLOCK)?;
    let mut meta_page = meta_pin.exclusive();

    let Some(entry) = meta::directory_entry(&meta_page, attno) else {
        return Err(crate::Error::Config("no such attribute"));
    };

    if entry.root != INVALID_BLOCK {
        return Ok(Some(entry.root));
    }

    let (root_pin, root_blk) = inner.pager.new_page()?;

    node::format_tree_page(
        &mut root_pin.exclusive(),
        &TreeOpaque {
            attno,
            next: INVALID_BLOCK,
            lokey: Tid::MIN,
            hikey: Tid::MAX,
            level: 0,
            flags: FLAG_ROOT,
        },
    );

    meta::set_root(&mut meta_page, attno, root_blk);

    log::debug!("attribute {attno}: created root leaf at block {root_blk}");

    Ok(Some(root_blk))
}

/// Descends to the page at `target_level` whose range covers `key`,
/// latched per `kind`. Returns `None` for an empty tree.
pub fn descend(
    inner: &StoreInner,
    attno: AttrNumber,
    key: Tid,
    target_level: u16,
    kind: LatchKind,
) -> crate::Result<Option<LatchedPage>> {
    let mut deadends: Vec<BlockNumber> = Vec::new();

    'restart: loop {
        let Some(root) = tree_root(inner, attno, false)? else {
            return Ok(None);
        };

        let mut blk = root;
        let mut latch: Option<LatchedPage> = None;
        let mut hops = 0u32;

        loop {
            hops += 1;
            if hops > inner.pager.block_count().saturating_mul(2) {
                return corrupt(blk, "descent did not terminate (right-link cycle)");
            }

            let pin = inner.pager.pin(blk)?;
            let next_latch = match kind {
                LatchKind::Shared => LatchedPage::Shared(pin.share()),
                LatchKind::Exclusive => LatchedPage::Exclusive(pin.exclusive()),
            };

            latch = Some(next_latch);
            #[allow(clippy::expect_used)]
            let page = latch.as_ref().expect("latch is held").page();

            if page.page_tag() != tag::TREE {
                return corrupt(blk, "descent reached a non-tree page");
            }

            let opaque = node::read_opaque(page);

            if opaque.attno != attno {
                return corrupt(blk, "descent crossed into another attribute's tree");
            }

            if opaque.level < target_level {
                return corrupt(blk, "level mismatch during descent");
            }

            // The rightmost page at each level carries `Tid::MAX` as an
            // unbounded high key; no probe key lies beyond it
            if key >= opaque.hikey && opaque.hikey < Tid::MAX {
                if opaque.follow_right() {
                    if opaque.next == INVALID_BLOCK {
                        return corrupt(blk, "follow-right set without a right sibling");
                    }

                    log::trace!("attribute {attno}: chasing right-link {blk} -> {}", opaque.next);
                    blk = opaque.next;
                    latch = None;
                    continue;
                }

                // The page is no longer reachable for this key; remember
                // the dead end and retry from the root
                if deadends.contains(&blk) {
                    return corrupt(blk, "descent loop: dead end reached twice");
                }

                log::warn!("attribute {attno}: dead end at block {blk}, restarting descent");
                deadends.push(blk);
                continue 'restart;
            }

            if opaque.level == target_level {
                #[allow(clippy::expect_used)]
                return Ok(Some(latch.expect("latch is held")));
            }

            let Some(idx) = node::search(page, key) else {
                return corrupt(blk, "key below internal page low key");
            };

            blk = node::entry_at(page, idx).child;

            // The parent latch is dropped before the child is latched:
            // holding it across the child acquisition would invert the
            // child-before-parent latch order against bottom-up downlink
            // inserts. The hikey check above recovers if the child moves.
            latch = None;
        }
    }
}
