// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-attribute B+-trees.
//!
//! Every attribute of a store has its own tree keyed by TID. Pages carry
//! right-links and high keys in the Lehman-Yao style, so descents recover
//! from concurrent splits by chasing right instead of blocking.

pub mod descend;
pub mod downlink;
pub mod mutate;
pub mod node;
pub mod rewrite;
pub mod scan;
pub mod verify;

pub use descend::{descend, tree_root, LatchKind, LatchedPage};
pub use node::{InternalEntry, TreeOpaque, TREE_SPECIAL_SIZE};
pub use scan::TidScan;
