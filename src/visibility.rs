// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! MVCC visibility over UNDO chains.
//!
//! A row version's leaf item carries a pointer to the newest UNDO record
//! affecting it. Deciding visibility means classifying that record's
//! transaction (own / in-progress / committed / aborted) under the
//! snapshot's semantics, and for deleted versions walking down the chain
//! to the record that created the version.
//!
//! The oldest-live counter is sampled once per operation: anything below
//! it belongs to a transaction every snapshot agrees on, so the chain
//! walk can stop early.

use crate::{
    item::ItemFlags,
    pager::PageStore,
    snapshot::{MvccSnapshot, Snapshot},
    tid::Tid,
    txn::{Cid, TransactionRegistry, TxStatus, Xid},
    undo::{UndoLog, UndoPtr, UndoRecord},
};

/// Row lock strength, weakest to strongest
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum LockMode {
    /// Blocks only key updates
    KeyShare = 0,

    /// Blocks all updates
    Share = 1,

    /// Exclusive against other writers, shares with key readers
    NoKeyExclusive = 2,

    /// Exclusive against everything
    Exclusive = 3,
}

impl LockMode {
    /// Raw on-disk tag.
    #[must_use]
    pub fn raw(self) -> u8 {
        self as u8
    }

    /// Decodes the on-disk tag.
    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::KeyShare),
            1 => Some(Self::Share),
            2 => Some(Self::NoKeyExclusive),
            3 => Some(Self::Exclusive),
            _ => None,
        }
    }

    /// Whether a holder of `self` admits a request for `requested`.
    #[must_use]
    pub fn admits(self, requested: Self) -> bool {
        self >= requested
    }
}

/// Who a conflicting operation was, for the caller's wait/retry logic
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ConflictInfo {
    /// The row the conflict was found on
    pub tid: Tid,

    /// Conflicting transaction
    pub xmax: Xid,

    /// Conflicting command
    pub cmax: Cid,
}

/// Outcome of checking a row version for update/delete/lock
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UpdateOutcome {
    /// The operation may proceed
    Ok {
        /// The version's newest UNDO record is aborted or beyond the
        /// horizon; the rewriter may discard it from the chain
        discard_undo: bool,
    },

    /// The version is not visible to the snapshot
    Invisible,

    /// The version was already modified by the caller's own transaction
    SelfModified {
        /// Own transaction
        xmax: Xid,
        /// Command that modified the version
        cmax: Cid,
    },

    /// A running transaction holds a conflicting modification or lock
    BeingModified(ConflictInfo),

    /// The version was updated by a committed transaction
    Updated(ConflictInfo, Tid),

    /// The version was deleted by a committed transaction
    Deleted(ConflictInfo),

    /// No item exists at the requested TID
    Missing,
}

/// How a snapshot classifies a record's transaction
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum TxClass {
    Own,
    InProgress,
    Committed,
    Aborted,
}

/// Per-operation visibility context with the horizon sampled once
pub struct VisibilityChecker<'a> {
    pager: &'a PageStore,
    undo: &'a UndoLog,
    registry: &'a TransactionRegistry,
    oldest: UndoPtr,
}

impl<'a> VisibilityChecker<'a> {
    /// Creates a checker, sampling the oldest-live counter.
    pub fn new(
        pager: &'a PageStore,
        undo: &'a UndoLog,
        registry: &'a TransactionRegistry,
    ) -> crate::Result<Self> {
        let oldest = undo.oldest_live(pager)?;
        Ok(Self {
            pager,
            undo,
            registry,
            oldest,
        })
    }

    /// Creates a checker reusing an already-sampled horizon, so one
    /// operation's checks all agree on it.
    #[must_use]
    pub fn with_horizon(
        pager: &'a PageStore,
        undo: &'a UndoLog,
        registry: &'a TransactionRegistry,
        oldest: UndoPtr,
    ) -> Self {
        Self {
            pager,
            undo,
            registry,
            oldest,
        }
    }

    /// The horizon this checker was created with.
    #[must_use]
    pub fn oldest_live(&self) -> UndoPtr {
        self.oldest
    }

    fn fetch(&self, ptr: UndoPtr) -> crate::Result<Option<UndoRecord>> {
        if ptr.raw() < self.oldest.raw() {
            return Ok(None);
        }
        self.undo.fetch(self.pager, ptr)
    }

    fn classify(&self, own: Option<Xid>, xid: Xid) -> TxClass {
        if own == Some(xid) {
            return TxClass::Own;
        }

        match self.registry.status(xid) {
            TxStatus::InProgress => TxClass::InProgress,
            TxStatus::Committed => TxClass::Committed,
            TxStatus::Aborted => TxClass::Aborted,
        }
    }

    /// Walks down the chain to the record that created the version at
    /// `tid`, skipping lock records and failed delete/update records.
    ///
    /// `None` means the creator fell below the horizon, which implies it
    /// committed long ago.
    fn creator_of(&self, tid: Tid, head: UndoRecord) -> crate::Result<Option<UndoRecord>> {
        let mut rec = head;

        loop {
            match &rec {
                UndoRecord::Insert { .. } => return Ok(Some(rec)),

                UndoRecord::Update { new_tid, .. } if *new_tid == tid => return Ok(Some(rec)),

                // A lock, or a deleter that did not stick (aborted or
                // still in flight); keep walking
                _ => {
                    let prev = rec.prev();
                    if !prev.is_valid() {
                        return Ok(None);
                    }

                    match self.fetch(prev)? {
                        Some(r) => rec = r,
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    /// Whether the creator record admits the version under `snapshot`.
    fn creator_visible(&self, snapshot: &Snapshot, rec: &UndoRecord) -> bool {
        match snapshot {
            Snapshot::Any => true,

            Snapshot::SelfVisible { xid } => match self.classify(Some(*xid), rec.xid()) {
                TxClass::Own | TxClass::Committed => true,
                TxClass::InProgress | TxClass::Aborted => false,
            },

            Snapshot::Mvcc(s) => match self.classify(Some(s.xid), rec.xid()) {
                TxClass::Own => rec.cid() < s.curcid,
                TxClass::Committed => !s.sees_as_running(rec.xid()),
                TxClass::InProgress | TxClass::Aborted => false,
            },

            Snapshot::Dirty(d) => match self.classify(Some(d.xid), rec.xid()) {
                TxClass::Own => rec.cid() < d.curcid,
                TxClass::Committed => true,
                TxClass::InProgress => {
                    d.xmin.set(rec.xid());
                    true
                }
                TxClass::Aborted => false,
            },

            Snapshot::NonVacuumable => match self.classify(None, rec.xid()) {
                // In-progress insertions are live for vacuum purposes
                TxClass::Committed | TxClass::InProgress | TxClass::Own => true,
                TxClass::Aborted => false,
            },
        }
    }

    /// Whether the delete/update record removes the version under `snapshot`.
    fn deletion_applies(&self, snapshot: &Snapshot, rec: &UndoRecord) -> bool {
        match snapshot {
            Snapshot::Any => false,

            Snapshot::SelfVisible { xid } => match self.classify(Some(*xid), rec.xid()) {
                TxClass::Own | TxClass::Committed => true,
                TxClass::InProgress | TxClass::Aborted => false,
            },

            Snapshot::Mvcc(s) => match self.classify(Some(s.xid), rec.xid()) {
                TxClass::Own => rec.cid() < s.curcid,
                TxClass::Committed => !s.sees_as_running(rec.xid()),
                TxClass::InProgress | TxClass::Aborted => false,
            },

            Snapshot::Dirty(d) => match self.classify(Some(d.xid), rec.xid()) {
                TxClass::Own => rec.cid() < d.curcid,
                TxClass::Committed => true,
                TxClass::InProgress => {
                    d.xmax.set(rec.xid());
                    false
                }
                TxClass::Aborted => false,
            },

            Snapshot::NonVacuumable => {
                // Only a committed deletion makes a version vacuumable
                matches!(self.classify(None, rec.xid()), TxClass::Committed)
            }
        }
    }

    /// Decides whether the row version behind `(flags, undo)` is visible
    /// under `snapshot`.
    ///
    /// For a fixed snapshot this is a pure function of the reachable
    /// chain; items with an invalid pointer (data attributes) are always
    /// visible.
    pub fn satisfies(
        &self,
        snapshot: &Snapshot,
        tid: Tid,
        flags: ItemFlags,
        undo: UndoPtr,
    ) -> crate::Result<bool> {
        if flags.contains(ItemFlags::DEAD) {
            return Ok(false);
        }

        if !undo.is_valid() {
            return Ok(true);
        }

        if undo.raw() < self.oldest.raw() {
            // Below the horizon everything is settled: the version exists
            // unless a deletion stuck
            return Ok(!flags.is_gone());
        }

        let Some(head) = self.fetch(undo)? else {
            return Ok(!flags.is_gone());
        };

        if flags.is_gone() {
            if self.deletion_applies(snapshot, &head) {
                return Ok(false);
            }

            // The deletion does not (yet) count; the version is visible
            // iff its creator is
            return match self.creator_of(tid, head)? {
                Some(creator) => Ok(self.creator_visible(snapshot, &creator)),
                None => Ok(true),
            };
        }

        // Lock records never affect the version itself
        let creator = if head.is_lock() {
            match self.creator_of(tid, head)? {
                Some(creator) => creator,
                None => return Ok(true),
            }
        } else {
            head
        };

        Ok(self.creator_visible(snapshot, &creator))
    }

    /// Decides whether the caller may delete/update/lock the version,
    /// reporting structured conflicts.
    #[allow(clippy::too_many_lines)]
    pub fn satisfies_update(
        &self,
        snapshot: &MvccSnapshot,
        tid: Tid,
        flags: ItemFlags,
        undo: UndoPtr,
        requested: LockMode,
    ) -> crate::Result<UpdateOutcome> {
        if flags.contains(ItemFlags::DEAD) {
            return Ok(UpdateOutcome::Invisible);
        }

        if !undo.is_valid() {
            return Ok(UpdateOutcome::Ok {
                discard_undo: false,
            });
        }

        if undo.raw() < self.oldest.raw() {
            return Ok(settled_outcome(tid, flags));
        }

        let Some(head) = self.fetch(undo)? else {
            return Ok(settled_outcome(tid, flags));
        };

        if flags.is_gone() {
            let conflict = ConflictInfo {
                tid,
                xmax: head.xid(),
                cmax: head.cid(),
            };

            return Ok(match self.classify(Some(snapshot.xid), head.xid()) {
                TxClass::Own => UpdateOutcome::SelfModified {
                    xmax: head.xid(),
                    cmax: head.cid(),
                },

                TxClass::InProgress => UpdateOutcome::BeingModified(conflict),

                TxClass::Committed => match head {
                    UndoRecord::Update { new_tid, .. } => UpdateOutcome::Updated(conflict, new_tid),
                    _ => UpdateOutcome::Deleted(conflict),
                },

                // The deletion rolled back; the version is fair game and
                // the dangling record can be discarded
                TxClass::Aborted => match self.creator_of(tid, head.clone())? {
                    Some(creator)
                        if !self.creator_visible(&Snapshot::Mvcc(snapshot.clone()), &creator) =>
                    {
                        UpdateOutcome::Invisible
                    }
                    _ => UpdateOutcome::Ok { discard_undo: true },
                },
            });
        }

        if let UndoRecord::TupleLock { xid, cid, mode, .. } = &head {
            let (xid, cid, mode) = (*xid, *cid, *mode);

            // The version itself must be visible before any lock matters
            if let Some(creator) = self.creator_of(tid, head.clone())? {
                if !self.creator_visible(&Snapshot::Mvcc(snapshot.clone()), &creator) {
                    return Ok(UpdateOutcome::Invisible);
                }
            }

            return Ok(match self.classify(Some(snapshot.xid), xid) {
                // Re-locking our own row always succeeds
                TxClass::Own => UpdateOutcome::Ok {
                    discard_undo: false,
                },

                TxClass::InProgress => {
                    if mode.admits(requested) {
                        UpdateOutcome::Ok {
                            discard_undo: false,
                        }
                    } else {
                        UpdateOutcome::BeingModified(ConflictInfo {
                            tid,
                            xmax: xid,
                            cmax: cid,
                        })
                    }
                }

                TxClass::Committed | TxClass::Aborted => {
                    UpdateOutcome::Ok { discard_undo: true }
                }
            });
        }

        // Head is the creator record
        Ok(match self.classify(Some(snapshot.xid), head.xid()) {
            TxClass::Own => {
                if head.cid() < snapshot.curcid {
                    UpdateOutcome::Ok {
                        discard_undo: false,
                    }
                } else {
                    UpdateOutcome::Invisible
                }
            }

            TxClass::Committed => {
                if snapshot.sees_as_running(head.xid()) {
                    UpdateOutcome::Invisible
                } else {
                    UpdateOutcome::Ok {
                        discard_undo: false,
                    }
                }
            }

            TxClass::InProgress | TxClass::Aborted => UpdateOutcome::Invisible,
        })
    }
}

/// Outcome for a version whose newest record fell below the horizon.
fn settled_outcome(tid: Tid, flags: ItemFlags) -> UpdateOutcome {
    if flags.contains(ItemFlags::UPDATED) {
        UpdateOutcome::Updated(
            ConflictInfo {
                tid,
                xmax: 0,
                cmax: 0,
            },
            Tid::INVALID,
        )
    } else if flags.contains(ItemFlags::DELETED) {
        UpdateOutcome::Deleted(ConflictInfo {
            tid,
            xmax: 0,
            cmax: 0,
        })
    } else {
        UpdateOutcome::Ok { discard_undo: true }
    }
}
