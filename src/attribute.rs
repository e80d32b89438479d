// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// 0-based attribute number; `0` is the meta-attribute
pub type AttrNumber = u16;

/// The implicit per-row attribute that carries visibility state.
///
/// Its items hold UNDO pointers and empty datums; data attributes
/// (numbered from 1) hold the actual column values.
pub const META_ATTRIBUTE: AttrNumber = 0;

/// Shape of one column
///
/// `attlen` follows the catalog convention: a positive value is a fixed
/// byte width, `-1` marks variable-length data. `byval` is recorded for
/// format fidelity; the engine stores all datums by reference.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AttributeSpec {
    /// Fixed byte width, or `-1` for variable-length
    pub attlen: i16,

    /// Whether the type is pass-by-value at the access layer
    pub byval: bool,
}

impl AttributeSpec {
    /// A fixed-width attribute of `len` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `len` is zero or negative.
    #[must_use]
    pub fn fixed(len: i16) -> Self {
        assert!(len > 0, "fixed width must be positive");
        Self {
            attlen: len,
            byval: len <= 8,
        }
    }

    /// A variable-length attribute.
    #[must_use]
    pub fn varlen() -> Self {
        Self {
            attlen: -1,
            byval: false,
        }
    }

    /// The meta-attribute shape (zero-width, no payload).
    #[must_use]
    pub(crate) fn meta() -> Self {
        Self {
            attlen: 0,
            byval: true,
        }
    }

    /// Whether datums of this attribute have a fixed width.
    #[must_use]
    pub fn is_fixed(&self) -> bool {
        self.attlen >= 0
    }
}
