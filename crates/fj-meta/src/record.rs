//! Versioned metadata record codec.
//!
//! Wire layout, little-endian:
//!
//! ```text
//! [version u16][kind u16][entity id u64][payload len u32][payload][crc32c u32]
//! ```
//!
//! The trailing CRC32c covers every preceding byte, so mutating any
//! serialized byte fails verification. Version 0 is reserved and never
//! written; a zero-filled home block therefore decodes as "absent".

use fj_error::{JournalError, Result};
use fj_types::{read_le_u16, read_le_u32, read_le_u64, write_le_u16, write_le_u32, write_le_u64};

/// Current record format version.
pub const RECORD_VERSION: u16 = 1;

/// Fixed bytes around the payload: header (16) plus trailing CRC (4).
pub const RECORD_OVERHEAD: usize = 20;

/// What a metadata record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordKind {
    InodeCreate,
    InodeUpdate,
    InodeDelete,
    DentryCreate,
    DentryDelete,
    DentryRename,
    BitmapAlloc,
    BitmapFree,
    VectorMetaCreate,
    VectorMetaUpdate,
    VectorMetaDelete,
    SuperblockUpdate,
}

impl RecordKind {
    #[must_use]
    pub fn to_wire(self) -> u16 {
        match self {
            Self::InodeCreate => 1,
            Self::InodeUpdate => 2,
            Self::InodeDelete => 3,
            Self::DentryCreate => 4,
            Self::DentryDelete => 5,
            Self::DentryRename => 6,
            Self::BitmapAlloc => 7,
            Self::BitmapFree => 8,
            Self::VectorMetaCreate => 9,
            Self::VectorMetaUpdate => 10,
            Self::VectorMetaDelete => 11,
            Self::SuperblockUpdate => 12,
        }
    }

    pub fn from_wire(value: u16) -> Result<Self> {
        match value {
            1 => Ok(Self::InodeCreate),
            2 => Ok(Self::InodeUpdate),
            3 => Ok(Self::InodeDelete),
            4 => Ok(Self::DentryCreate),
            5 => Ok(Self::DentryDelete),
            6 => Ok(Self::DentryRename),
            7 => Ok(Self::BitmapAlloc),
            8 => Ok(Self::BitmapFree),
            9 => Ok(Self::VectorMetaCreate),
            10 => Ok(Self::VectorMetaUpdate),
            11 => Ok(Self::VectorMetaDelete),
            12 => Ok(Self::SuperblockUpdate),
            other => Err(JournalError::Format(format!(
                "unknown metadata record kind: {other}"
            ))),
        }
    }
}

/// One metadata record: kind, owning entity, opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaRecord {
    pub kind: RecordKind,
    pub entity: u64,
    pub payload: Vec<u8>,
}

impl MetaRecord {
    #[must_use]
    pub fn new(kind: RecordKind, entity: u64, payload: Vec<u8>) -> Self {
        Self {
            kind,
            entity,
            payload,
        }
    }

    /// Encoded size in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        RECORD_OVERHEAD + self.payload.len()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let len = u32::try_from(self.payload.len())
            .map_err(|_| JournalError::InvalidArgument("record payload exceeds u32".into()))?;
        let mut buf = vec![0_u8; self.encoded_len()];
        write_le_u16(&mut buf, 0, RECORD_VERSION).map_err(to_format)?;
        write_le_u16(&mut buf, 2, self.kind.to_wire()).map_err(to_format)?;
        write_le_u64(&mut buf, 4, self.entity).map_err(to_format)?;
        write_le_u32(&mut buf, 12, len).map_err(to_format)?;
        buf[16..16 + self.payload.len()].copy_from_slice(&self.payload);
        let crc_offset = 16 + self.payload.len();
        let crc = crc32c::crc32c(&buf[..crc_offset]);
        write_le_u32(&mut buf, crc_offset, crc).map_err(to_format)?;
        Ok(buf)
    }

    /// Decode and verify a record.
    ///
    /// Returns `Ok(None)` when `buf` starts with version 0 (unwritten
    /// space); any other violation, including a CRC mismatch, is an error.
    pub fn decode(buf: &[u8]) -> Result<Option<Self>> {
        let version = read_le_u16(buf, 0).map_err(to_format)?;
        if version == 0 {
            return Ok(None);
        }
        if version != RECORD_VERSION {
            return Err(JournalError::Format(format!(
                "unsupported metadata record version: {version}"
            )));
        }
        let kind = RecordKind::from_wire(read_le_u16(buf, 2).map_err(to_format)?)?;
        let entity = read_le_u64(buf, 4).map_err(to_format)?;
        let len = read_le_u32(buf, 12).map_err(to_format)? as usize;
        let crc_offset = 16_usize
            .checked_add(len)
            .filter(|end| end + 4 <= buf.len())
            .ok_or_else(|| JournalError::Format("record payload length out of range".into()))?;
        let stored_crc = read_le_u32(buf, crc_offset).map_err(to_format)?;
        let computed_crc = crc32c::crc32c(&buf[..crc_offset]);
        if stored_crc != computed_crc {
            return Err(JournalError::Corruption {
                block: entity,
                detail: format!(
                    "metadata record CRC mismatch: stored {stored_crc:#010x}, computed {computed_crc:#010x}"
                ),
            });
        }
        Ok(Some(Self {
            kind,
            entity,
            payload: buf[16..crc_offset].to_vec(),
        }))
    }
}

fn to_format(err: fj_types::ParseError) -> JournalError {
    JournalError::Format(err.to_string())
}
