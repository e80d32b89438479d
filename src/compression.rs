// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Compression algorithm to use for leaf item containers
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[allow(clippy::module_name_repetitions)]
pub enum CompressionType {
    /// No compression
    ///
    /// Leaf items are always stored individually.
    None,

    /// LZ4 compression
    ///
    /// Recommended for use cases with a focus
    /// on speed over compression ratio.
    #[cfg(feature = "lz4")]
    Lz4,
}

impl Encode for CompressionType {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        match self {
            Self::None => {
                writer.write_u8(0)?;
            }

            #[cfg(feature = "lz4")]
            Self::Lz4 => {
                writer.write_u8(1)?;
            }
        }

        Ok(())
    }
}

impl Decode for CompressionType {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let tag = reader.read_u8()?;

        match tag {
            0 => Ok(Self::None),

            #[cfg(feature = "lz4")]
            1 => Ok(Self::Lz4),

            tag => Err(DecodeError::InvalidTag(("CompressionType", tag.into()))),
        }
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::None => "no compression",

                #[cfg(feature = "lz4")]
                Self::Lz4 => "lz4",
            }
        )
    }
}

/// Upper bound on the compressed size of `len` input bytes.
///
/// LZ4 block format worst case, plus the 4-byte length prefix.
fn worst_case_len(len: usize) -> usize {
    len + (len / 255) + 16 + 4
}

/// Outcome of feeding one more item to a [`BoundedCompressor`]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AddOutcome {
    /// The item was accepted; compressed output still fits the budget
    Fit,

    /// The item was rejected; the batch is closed
    Full,
}

/// Accumulates encoded leaf items and compresses them against a fixed
/// output budget
///
/// `add` is monotone: once it reports [`AddOutcome::Full`], every later call
/// does too. [`BoundedCompressor::finish`] yields the compressed payload, or
/// `None` when the batch is empty or compression does not shrink it, in
/// which case the caller stores the batched items uncompressed.
pub struct BoundedCompressor {
    compression: CompressionType,
    budget: usize,
    raw: Vec<u8>,
    n_items: usize,
    full: bool,
}

impl BoundedCompressor {
    /// Starts a new batch with the given output byte budget.
    #[must_use]
    pub fn begin(compression: CompressionType, budget: usize) -> Self {
        Self {
            compression,
            budget,
            raw: Vec::new(),
            n_items: 0,
            // Without a compressor there is never a gain, so the batch
            // starts closed and every item goes out uncompressed.
            full: compression == CompressionType::None,
        }
    }

    /// Number of items accepted so far.
    #[must_use]
    pub fn n_items(&self) -> usize {
        self.n_items
    }

    /// Whether no item has been accepted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.n_items == 0
    }

    /// Offers one encoded item to the batch.
    pub fn add(&mut self, encoded: &[u8]) -> AddOutcome {
        if self.full {
            return AddOutcome::Full;
        }

        let next_len = self.raw.len() + encoded.len();

        // The uncompressed size must stay representable in the container header
        if next_len > usize::from(u16::MAX) {
            self.full = true;
            return AddOutcome::Full;
        }

        if worst_case_len(next_len) <= self.budget {
            // Even the worst case fits, no need to compress yet
            self.raw.extend_from_slice(encoded);
            self.n_items += 1;
            return AddOutcome::Fit;
        }

        self.raw.extend_from_slice(encoded);

        if compress(self.compression, &self.raw).len() <= self.budget {
            self.n_items += 1;
            AddOutcome::Fit
        } else {
            self.raw.truncate(next_len - encoded.len());
            self.full = true;
            AddOutcome::Full
        }
    }

    /// Compresses the batch.
    ///
    /// Returns `(payload, uncompressed_len)`, or `None` if the batch is
    /// empty or did not shrink.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn finish(self) -> Option<(Vec<u8>, u16)> {
        if self.n_items == 0 {
            return None;
        }

        let payload = compress(self.compression, &self.raw);

        if payload.len() >= self.raw.len() {
            return None;
        }

        // NOTE: `add` keeps the raw batch within u16::MAX
        Some((payload, self.raw.len() as u16))
    }
}

fn compress(compression: CompressionType, raw: &[u8]) -> Vec<u8> {
    match compression {
        // NOTE: `begin` closes the batch immediately for CompressionType::None,
        // so this is unreachable through the public surface; returning the
        // input keeps the function total.
        CompressionType::None => raw.to_vec(),

        #[cfg(feature = "lz4")]
        CompressionType::Lz4 => lz4_flex::compress_prepend_size(raw),
    }
}

/// Inflates a container payload, checking the recorded uncompressed size.
pub fn decompress(
    compression: CompressionType,
    payload: &[u8],
    uncompressed_len: u16,
) -> crate::Result<Vec<u8>> {
    match compression {
        CompressionType::None => Err(crate::Error::Decompress(compression)),

        #[cfg(feature = "lz4")]
        CompressionType::Lz4 => {
            let raw = lz4_flex::decompress_size_prepended(payload)
                .map_err(|_| crate::Error::Decompress(compression))?;

            if raw.len() == usize::from(uncompressed_len) {
                Ok(raw)
            } else {
                Err(crate::Error::Decompress(compression))
            }
        }
    }
}
