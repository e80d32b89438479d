// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{attribute::AttributeSpec, CompressionType, Store};
use std::path::{Path, PathBuf};

/// Store configuration, built fluently and finished with
/// [`Config::open`]
///
/// ```
/// # let folder = tempfile::tempdir()?;
/// use zedstore::{AttributeSpec, Config};
///
/// let store = Config::new(&folder)
///     .attributes(&[AttributeSpec::fixed(8), AttributeSpec::varlen()])
///     .open()?;
/// #
/// # Ok::<(), zedstore::Error>(())
/// ```
#[derive(Clone)]
pub struct Config {
    /// Directory the store lives in
    pub(crate) path: PathBuf,

    /// Column shapes for a fresh store; ignored when re-opening (the
    /// metapage is authoritative then)
    pub(crate) attributes: Vec<AttributeSpec>,

    /// Compression applied to cold leaf item runs
    pub(crate) compression: CompressionType,
}

impl Config {
    /// Initializes a new configuration for the given folder.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            attributes: Vec::new(),

            #[cfg(feature = "lz4")]
            compression: CompressionType::Lz4,

            #[cfg(not(feature = "lz4"))]
            compression: CompressionType::None,
        }
    }

    /// Sets the column shapes used when the store is created.
    ///
    /// The meta-attribute is implicit; do not include it.
    #[must_use]
    pub fn attributes(mut self, specs: &[AttributeSpec]) -> Self {
        self.attributes = specs.to_vec();
        self
    }

    /// Sets the compression type for leaf item containers.
    #[must_use]
    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Opens (or creates) the store.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or an invalid configuration
    /// (creating a store with zero attributes, for one).
    pub fn open(self) -> crate::Result<Store> {
        Store::open(self)
    }
}
