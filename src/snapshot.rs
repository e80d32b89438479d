// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::txn::{Cid, TransactionRegistry, Xid};
use std::cell::Cell;

/// A classic MVCC snapshot: a point-in-time predicate over `{xid, cid}`
#[derive(Clone, Debug)]
pub struct MvccSnapshot {
    /// The snapshot owner's transaction, or 0 for a read-only observer
    pub xid: Xid,

    /// The owner's current command; own changes from earlier commands
    /// are visible
    pub curcid: Cid,

    /// Everything at or above this xid was not yet started when the
    /// snapshot was taken
    pub xmax: Xid,

    /// Transactions that were in progress when the snapshot was taken
    pub xip: Vec<Xid>,
}

impl MvccSnapshot {
    /// Whether the snapshot considers `xid` as still running.
    #[must_use]
    pub fn sees_as_running(&self, xid: Xid) -> bool {
        xid >= self.xmax || self.xip.contains(&xid)
    }
}

/// A dirty snapshot: sees uncommitted changes and reports who made them
///
/// When visibility encounters an in-progress inserter or deleter, it
/// records the xid here so the caller can decide whether to wait.
#[derive(Clone, Debug)]
pub struct DirtySnapshot {
    /// The observer's transaction, or 0
    pub xid: Xid,

    /// The observer's current command
    pub curcid: Cid,

    /// Set to an in-progress inserter's xid during a visibility check
    pub xmin: Cell<Xid>,

    /// Set to an in-progress deleter's xid during a visibility check
    pub xmax: Cell<Xid>,
}

impl DirtySnapshot {
    /// A dirty snapshot for the given observer.
    #[must_use]
    pub fn new(xid: Xid, curcid: Cid) -> Self {
        Self {
            xid,
            curcid,
            xmin: Cell::new(0),
            xmax: Cell::new(0),
        }
    }
}

/// Visibility semantics for a scan or mutation
#[derive(Clone, Debug)]
pub enum Snapshot {
    /// Point-in-time MVCC visibility
    Mvcc(MvccSnapshot),

    /// Sees all of the owner's own changes, including the current
    /// command's, plus everything committed
    SelfVisible {
        /// The owner's transaction
        xid: Xid,
    },

    /// Sees every non-dead row version
    Any,

    /// Sees committed and in-progress changes, reporting the
    /// in-progress xids
    Dirty(DirtySnapshot),

    /// Sees everything a vacuum must not remove: committed rows and
    /// rows still in play by running transactions
    NonVacuumable,
}

impl Snapshot {
    /// Builds an MVCC snapshot from the registry's current state.
    #[must_use]
    pub fn mvcc_from_registry(registry: &TransactionRegistry, xid: Xid, curcid: Cid) -> Self {
        let mut xip = registry.in_progress();
        xip.retain(|x| *x != xid);

        Self::Mvcc(MvccSnapshot {
            xid,
            curcid,
            xmax: registry.next_xid(),
            xip,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn mvcc_snapshot_from_registry() {
        let registry = TransactionRegistry::new();

        let a = registry.begin();
        let b = registry.begin();
        registry.commit(a);

        let Snapshot::Mvcc(snapshot) = Snapshot::mvcc_from_registry(&registry, 0, 0) else {
            panic!("expected MVCC snapshot");
        };

        assert!(!snapshot.sees_as_running(a));
        assert!(snapshot.sees_as_running(b));

        // Anything not yet assigned is running
        assert!(snapshot.sees_as_running(snapshot.xmax));
    }

    #[test]
    fn mvcc_snapshot_excludes_own_xid() {
        let registry = TransactionRegistry::new();
        let me = registry.begin();

        let Snapshot::Mvcc(snapshot) = Snapshot::mvcc_from_registry(&registry, me, 5) else {
            panic!("expected MVCC snapshot");
        };

        assert!(!snapshot.xip.contains(&me));
        assert_eq!(me, snapshot.xid);
    }
}
