// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    tid::Tid,
    txn::{Cid, Xid},
    undo::UndoPtr,
    visibility::LockMode,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

const TYPE_INSERT: u16 = 1;
const TYPE_DELETE: u16 = 2;
const TYPE_UPDATE: u16 = 3;
const TYPE_TUPLE_LOCK: u16 = 4;

/// One visibility record in the UNDO log
///
/// Every record names the transaction and command that performed the
/// operation and the TID it applies to. Delete, update and lock records
/// chain to the row's older records through `prev`; the log itself never
/// interprets the chain.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UndoRecord {
    /// Row (range) insertion
    Insert {
        /// Inserting transaction
        xid: Xid,
        /// Inserting command
        cid: Cid,
        /// First TID the insertion covers
        tid: Tid,
    },

    /// Row deletion
    Delete {
        /// Deleting transaction
        xid: Xid,
        /// Deleting command
        cid: Cid,
        /// Deleted TID
        tid: Tid,
        /// Older chain head for this row
        prev: UndoPtr,
    },

    /// Row update; acts as deletion of the old version and insertion of
    /// the new one
    Update {
        /// Updating transaction
        xid: Xid,
        /// Updating command
        cid: Cid,
        /// Old TID
        tid: Tid,
        /// Older chain head for this row
        prev: UndoPtr,
        /// TID of the new row version
        new_tid: Tid,
        /// Whether a key column changed
        key_update: bool,
    },

    /// Row lock; never affects the version itself
    TupleLock {
        /// Locking transaction
        xid: Xid,
        /// Locking command
        cid: Cid,
        /// Locked TID
        tid: Tid,
        /// Older chain head for this row
        prev: UndoPtr,
        /// Acquired lock strength
        mode: LockMode,
    },
}

impl UndoRecord {
    /// The transaction that wrote the record.
    #[must_use]
    pub fn xid(&self) -> Xid {
        match self {
            Self::Insert { xid, .. }
            | Self::Delete { xid, .. }
            | Self::Update { xid, .. }
            | Self::TupleLock { xid, .. } => *xid,
        }
    }

    /// The command that wrote the record.
    #[must_use]
    pub fn cid(&self) -> Cid {
        match self {
            Self::Insert { cid, .. }
            | Self::Delete { cid, .. }
            | Self::Update { cid, .. }
            | Self::TupleLock { cid, .. } => *cid,
        }
    }

    /// The TID the record applies to.
    #[must_use]
    pub fn tid(&self) -> Tid {
        match self {
            Self::Insert { tid, .. }
            | Self::Delete { tid, .. }
            | Self::Update { tid, .. }
            | Self::TupleLock { tid, .. } => *tid,
        }
    }

    /// The next older record for the same row; invalid for insertions.
    #[must_use]
    pub fn prev(&self) -> UndoPtr {
        match self {
            Self::Insert { .. } => UndoPtr::INVALID,
            Self::Delete { prev, .. }
            | Self::Update { prev, .. }
            | Self::TupleLock { prev, .. } => *prev,
        }
    }

    /// Whether this is a lock record.
    #[must_use]
    pub fn is_lock(&self) -> bool {
        matches!(self, Self::TupleLock { .. })
    }

    fn type_tag(&self) -> u16 {
        match self {
            Self::Insert { .. } => TYPE_INSERT,
            Self::Delete { .. } => TYPE_DELETE,
            Self::Update { .. } => TYPE_UPDATE,
            Self::TupleLock { .. } => TYPE_TUPLE_LOCK,
        }
    }

    fn encoded_len(&self) -> usize {
        // size(2) type(2) xid(4) cid(4) tid(8)
        20 + match self {
            Self::Insert { .. } => 0,
            Self::Delete { .. } => 8,
            Self::Update { .. } => 8 + 8 + 1,
            Self::TupleLock { .. } => 8 + 1,
        }
    }
}

impl Encode for UndoRecord {
    #[allow(clippy::cast_possible_truncation)]
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u16::<LittleEndian>(self.encoded_len() as u16)?;
        writer.write_u16::<LittleEndian>(self.type_tag())?;
        writer.write_u32::<LittleEndian>(self.xid())?;
        writer.write_u32::<LittleEndian>(self.cid())?;
        writer.write_u64::<LittleEndian>(self.tid().raw())?;

        match self {
            Self::Insert { .. } => {}
            Self::Delete { prev, .. } => {
                writer.write_u64::<LittleEndian>(prev.raw())?;
            }
            Self::Update {
                prev,
                new_tid,
                key_update,
                ..
            } => {
                writer.write_u64::<LittleEndian>(prev.raw())?;
                writer.write_u64::<LittleEndian>(new_tid.raw())?;
                writer.write_u8(u8::from(*key_update))?;
            }
            Self::TupleLock { prev, mode, .. } => {
                writer.write_u64::<LittleEndian>(prev.raw())?;
                writer.write_u8(mode.raw())?;
            }
        }

        Ok(())
    }
}

impl Decode for UndoRecord {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let _size = reader.read_u16::<LittleEndian>()?;
        let type_tag = reader.read_u16::<LittleEndian>()?;
        let xid = reader.read_u32::<LittleEndian>()?;
        let cid = reader.read_u32::<LittleEndian>()?;
        let tid = Tid::from_raw(reader.read_u64::<LittleEndian>()?);

        match type_tag {
            TYPE_INSERT => Ok(Self::Insert { xid, cid, tid }),

            TYPE_DELETE => {
                let prev = UndoPtr::from_raw(reader.read_u64::<LittleEndian>()?);
                Ok(Self::Delete {
                    xid,
                    cid,
                    tid,
                    prev,
                })
            }

            TYPE_UPDATE => {
                let prev = UndoPtr::from_raw(reader.read_u64::<LittleEndian>()?);
                let new_tid = Tid::from_raw(reader.read_u64::<LittleEndian>()?);
                let key_update = reader.read_u8()? != 0;
                Ok(Self::Update {
                    xid,
                    cid,
                    tid,
                    prev,
                    new_tid,
                    key_update,
                })
            }

            TYPE_TUPLE_LOCK => {
                let prev = UndoPtr::from_raw(reader.read_u64::<LittleEndian>()?);
                let mode = LockMode::from_raw(reader.read_u8()?)
                    .ok_or(DecodeError::InvalidTag(("LockMode", 0)))?;
                Ok(Self::TupleLock {
                    xid,
                    cid,
                    tid,
                    prev,
                    mode,
                })
            }

            tag => Err(DecodeError::InvalidTag(("UndoRecord", tag))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use test_log::test;

    #[test]
    fn undo_record_roundtrip() {
        let records = [
            UndoRecord::Insert {
                xid: 5,
                cid: 0,
                tid: Tid::from_raw(10),
            },
            UndoRecord::Delete {
                xid: 6,
                cid: 2,
                tid: Tid::from_raw(10),
                prev: UndoPtr::from_raw(1),
            },
            UndoRecord::Update {
                xid: 7,
                cid: 0,
                tid: Tid::from_raw(10),
                prev: UndoPtr::from_raw(2),
                new_tid: Tid::from_raw(1_001),
                key_update: true,
            },
            UndoRecord::TupleLock {
                xid: 8,
                cid: 1,
                tid: Tid::from_raw(10),
                prev: UndoPtr::from_raw(3),
                mode: LockMode::Share,
            },
        ];

        for record in records {
            let encoded = record.encode_into_vec();
            let decoded =
                UndoRecord::decode_from(&mut Cursor::new(&encoded)).expect("should decode");
            assert_eq!(record, decoded);
        }
    }

    #[test]
    fn undo_record_invalid_tag() {
        let record = UndoRecord::Insert {
            xid: 1,
            cid: 0,
            tid: Tid::from_raw(1),
        };

        let mut encoded = record.encode_into_vec();
        encoded[2] = 0xEE;
        encoded[3] = 0xEE;

        assert!(matches!(
            UndoRecord::decode_from(&mut Cursor::new(&encoded)),
            Err(DecodeError::InvalidTag(("UndoRecord", _)))
        ));
    }
}
