// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{DecodeError, EncodeError},
    pager::BlockNumber,
    CompressionType,
};

/// Represents errors that can occur in the storage engine
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// Decompression failed
    Decompress(CompressionType),

    /// On-disk structure is inconsistent
    ///
    /// Carries the offending block number and a short reason
    /// (descent loop, right-link cycle, nested compressed item,
    /// downlink mismatch, level mismatch).
    Corruption {
        /// Block on which the inconsistency was observed
        block: BlockNumber,

        /// What was observed
        reason: &'static str,
    },

    /// A datum exceeds the maximum size storable on a page
    ///
    /// Oversized datums must be externally toasted before insertion.
    DatumTooLarge(usize),

    /// Invalid store configuration (zero attributes, root directory overflow, ...)
    Config(&'static str),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ZedStoreError: {self:?}")
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Storage engine result
pub type Result<T> = std::result::Result<T, Error>;

/// Shorthand for the corruption class of errors.
pub(crate) fn corrupt<T>(block: BlockNumber, reason: &'static str) -> Result<T> {
    Err(Error::Corruption { block, reason })
}
