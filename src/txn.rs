// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU32, Ordering::Relaxed};

/// Transaction identifier
pub type Xid = u32;

/// Command identifier within one transaction
pub type Cid = u32;

/// Outcome of a transaction as known to the storage engine
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TxStatus {
    /// Still running (or unknown)
    InProgress,

    /// Committed
    Committed,

    /// Rolled back or crashed
    Aborted,
}

/// The tree's window into the transaction manager
///
/// Visibility checks ask it whether the transaction named by an UNDO record
/// committed. Waiting for a conflicting transaction happens outside the
/// trees, so this is a plain status table with no queueing.
pub struct TransactionRegistry {
    next_xid: AtomicU32,
    statuses: RwLock<FxHashMap<Xid, TxStatus>>,
}

impl Default for TransactionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionRegistry {
    /// Creates an empty registry; xids start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_xid: AtomicU32::new(1),
            statuses: RwLock::new(FxHashMap::default()),
        }
    }

    /// Starts a transaction, returning its xid.
    pub fn begin(&self) -> Xid {
        let xid = self.next_xid.fetch_add(1, Relaxed);
        self.statuses.write().insert(xid, TxStatus::InProgress);
        log::trace!("begin xid {xid}");
        xid
    }

    /// Marks a transaction committed.
    pub fn commit(&self, xid: Xid) {
        self.statuses.write().insert(xid, TxStatus::Committed);
        log::trace!("commit xid {xid}");
    }

    /// Marks a transaction aborted.
    pub fn abort(&self, xid: Xid) {
        self.statuses.write().insert(xid, TxStatus::Aborted);
        log::trace!("abort xid {xid}");
    }

    /// Status of a transaction; unknown xids read as in-progress.
    #[must_use]
    pub fn status(&self, xid: Xid) -> TxStatus {
        self.statuses
            .read()
            .get(&xid)
            .copied()
            .unwrap_or(TxStatus::InProgress)
    }

    /// Next xid that would be assigned.
    #[must_use]
    pub fn next_xid(&self) -> Xid {
        self.next_xid.load(Relaxed)
    }

    /// All currently in-progress xids, ascending.
    #[must_use]
    pub fn in_progress(&self) -> Vec<Xid> {
        let mut xids = self
            .statuses
            .read()
            .iter()
            .filter(|(_, s)| **s == TxStatus::InProgress)
            .map(|(xid, _)| *xid)
            .collect::<Vec<_>>();
        xids.sort_unstable();
        xids
    }
}
