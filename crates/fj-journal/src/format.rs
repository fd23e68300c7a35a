//! On-disk format for the circular journal.
//!
//! All multi-byte fields are little-endian. Every block written to the log
//! starts with a fixed 48-byte [`BlockHeader`]; the superblock occupies the
//! first block of the journal extent.
//!
//! ```text
//! Journal extent:
//! +--------------+----------------------------------------------+
//! | Superblock   | circular log area (head chases tail)         |
//! | (1 block)    | descriptor / data / commit / checkpoint / …  |
//! +--------------+----------------------------------------------+
//!
//! Block header (48 bytes):
//! +------------------+---------+
//! | magic            | 4 bytes | = JOURNAL_BLOCK_MAGIC
//! | version          | 2 bytes | = 1
//! | block_type       | 2 bytes |
//! | sequence         | 8 bytes |
//! | payload_len      | 4 bytes |
//! | flags            | 4 bytes |
//! | checksum         | 8 bytes | over the payload bytes
//! | reserved         | 16 bytes| zero
//! +------------------+---------+
//! ```
//!
//! A transaction on disk is one descriptor block (listing target block
//! numbers), its data blocks, and one commit block whose payload carries a
//! checksum over the descriptor's block-number list. A descriptor without
//! a matching commit is ignored during recovery; the first header or
//! payload checksum failure terminates a recovery scan.

use crate::checksum::ChecksumAlgorithm;
use fj_error::{JournalError, Result};
use fj_types::{
    read_le_u16, read_le_u32, read_le_u64, write_le_u16, write_le_u32, write_le_u64, BlockNumber,
    CheckpointId, ParseError, SequenceNumber, TxnId, JOURNAL_BLOCK_MAGIC, JOURNAL_FORMAT_VERSION,
    JOURNAL_SUPERBLOCK_MAGIC,
};

/// Size of the fixed block header.
pub const BLOCK_HEADER_SIZE: usize = 48;

/// Size of the encoded superblock (padded; the rest of its block is zero).
pub const SUPERBLOCK_SIZE: usize = 128;

/// Block types in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Descriptor,
    Data,
    Commit,
    Revocation,
    Checkpoint,
    Barrier,
}

impl BlockType {
    #[must_use]
    pub fn to_wire(self) -> u16 {
        match self {
            Self::Descriptor => 1,
            Self::Data => 2,
            Self::Commit => 3,
            Self::Revocation => 4,
            Self::Checkpoint => 5,
            Self::Barrier => 6,
        }
    }

    pub fn from_wire(value: u16) -> Result<Self> {
        match value {
            1 => Ok(Self::Descriptor),
            2 => Ok(Self::Data),
            3 => Ok(Self::Commit),
            4 => Ok(Self::Revocation),
            5 => Ok(Self::Checkpoint),
            6 => Ok(Self::Barrier),
            other => Err(JournalError::Format(format!(
                "unknown journal block type: {other}"
            ))),
        }
    }
}

/// Header prefixing every block in the log area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub block_type: BlockType,
    pub sequence: SequenceNumber,
    pub payload_len: u32,
    pub flags: u32,
    pub checksum: u64,
}

impl BlockHeader {
    /// Encode into the first `BLOCK_HEADER_SIZE` bytes of `buf`.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < BLOCK_HEADER_SIZE {
            return Err(JournalError::InvalidArgument(format!(
                "header buffer too small: {}",
                buf.len()
            )));
        }
        write(buf, |b| {
            write_le_u32(b, 0, JOURNAL_BLOCK_MAGIC)?;
            write_le_u16(b, 4, JOURNAL_FORMAT_VERSION)?;
            write_le_u16(b, 6, self.block_type.to_wire())?;
            write_le_u64(b, 8, self.sequence.0)?;
            write_le_u32(b, 16, self.payload_len)?;
            write_le_u32(b, 20, self.flags)?;
            write_le_u64(b, 24, self.checksum)?;
            // bytes 32..48 reserved, already zero
            Ok(())
        })
    }

    /// Decode a header, validating magic and version.
    ///
    /// Returns `Ok(None)` for a block that does not carry the journal
    /// magic (unwritten log space), distinguishing "end of log" from
    /// corruption.
    pub fn decode(buf: &[u8]) -> Result<Option<Self>> {
        let magic = map_parse(read_le_u32(buf, 0))?;
        if magic != JOURNAL_BLOCK_MAGIC {
            return Ok(None);
        }
        let version = map_parse(read_le_u16(buf, 4))?;
        if version != JOURNAL_FORMAT_VERSION {
            return Err(JournalError::Format(format!(
                "unsupported journal block version: {version}"
            )));
        }
        let block_type = BlockType::from_wire(map_parse(read_le_u16(buf, 6))?)?;
        let sequence = SequenceNumber(map_parse(read_le_u64(buf, 8))?);
        let payload_len = map_parse(read_le_u32(buf, 16))?;
        let flags = map_parse(read_le_u32(buf, 20))?;
        let checksum = map_parse(read_le_u64(buf, 24))?;
        Ok(Some(Self {
            block_type,
            sequence,
            payload_len,
            flags,
            checksum,
        }))
    }
}

/// Descriptor payload: which home blocks the transaction touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorPayload {
    pub txn_id: TxnId,
    /// Operation type tag supplied by the transaction layer.
    pub op_type: u32,
    /// Actor (thread/task) id for diagnostics.
    pub actor_id: u32,
    /// Microseconds since the Unix epoch at descriptor write time.
    pub timestamp_micros: u64,
    pub targets: Vec<BlockNumber>,
}

impl DescriptorPayload {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let count = u32::try_from(self.targets.len())
            .map_err(|_| JournalError::InvalidArgument("too many descriptor targets".into()))?;
        let mut buf = vec![0_u8; 8 + 4 + 4 + 8 + 4 + self.targets.len() * 8];
        write(&mut buf, |b| {
            write_le_u64(b, 0, self.txn_id.0)?;
            write_le_u32(b, 8, self.op_type)?;
            write_le_u32(b, 12, self.actor_id)?;
            write_le_u64(b, 16, self.timestamp_micros)?;
            write_le_u32(b, 24, count)?;
            let mut offset = 28;
            for target in &self.targets {
                write_le_u64(b, offset, target.0)?;
                offset += 8;
            }
            Ok(())
        })?;
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let txn_id = TxnId(map_parse(read_le_u64(buf, 0))?);
        let op_type = map_parse(read_le_u32(buf, 8))?;
        let actor_id = map_parse(read_le_u32(buf, 12))?;
        let timestamp_micros = map_parse(read_le_u64(buf, 16))?;
        let count = map_parse(read_le_u32(buf, 24))? as usize;
        // Cap the pre-allocation at what the payload can actually hold; a
        // bogus count still fails on the per-target reads below.
        let mut targets = Vec::with_capacity(count.min(buf.len().saturating_sub(28) / 8));
        let mut offset = 28;
        for _ in 0..count {
            targets.push(BlockNumber(map_parse(read_le_u64(buf, offset))?));
            offset += 8;
        }
        Ok(Self {
            txn_id,
            op_type,
            actor_id,
            timestamp_micros,
            targets,
        })
    }

    /// Checksum over the target block-number list, stored in the commit
    /// block so recovery can tie a commit to its descriptor.
    #[must_use]
    pub fn targets_checksum(&self, alg: ChecksumAlgorithm) -> u64 {
        let mut bytes = Vec::with_capacity(self.targets.len() * 8);
        for target in &self.targets {
            bytes.extend_from_slice(&target.0.to_le_bytes());
        }
        alg.compute(&bytes)
    }
}

/// Data payload: one home-block image carried by the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPayload {
    pub target: BlockNumber,
    pub bytes: Vec<u8>,
}

impl DataPayload {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let len = u32::try_from(self.bytes.len())
            .map_err(|_| JournalError::InvalidArgument("data payload exceeds u32".into()))?;
        let mut buf = vec![0_u8; 8 + 4 + self.bytes.len()];
        write(&mut buf, |b| {
            write_le_u64(b, 0, self.target.0)?;
            write_le_u32(b, 8, len)?;
            Ok(())
        })?;
        buf[12..].copy_from_slice(&self.bytes);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let target = BlockNumber(map_parse(read_le_u64(buf, 0))?);
        let len = map_parse(read_le_u32(buf, 8))? as usize;
        let end = 12_usize
            .checked_add(len)
            .filter(|end| *end <= buf.len())
            .ok_or_else(|| JournalError::Format("data payload length out of range".into()))?;
        Ok(Self {
            target,
            bytes: buf[12..end].to_vec(),
        })
    }
}

/// Commit payload: closes a transaction in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitPayload {
    pub txn_id: TxnId,
    /// Checksum over the descriptor's block-number list.
    pub targets_checksum: u64,
    pub timestamp_micros: u64,
}

impl CommitPayload {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; 24];
        write(&mut buf, |b| {
            write_le_u64(b, 0, self.txn_id.0)?;
            write_le_u64(b, 8, self.targets_checksum)?;
            write_le_u64(b, 16, self.timestamp_micros)?;
            Ok(())
        })?;
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            txn_id: TxnId(map_parse(read_le_u64(buf, 0))?),
            targets_checksum: map_parse(read_le_u64(buf, 8))?,
            timestamp_micros: map_parse(read_le_u64(buf, 16))?,
        })
    }
}

/// Checkpoint kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointKind {
    Full,
    Incremental,
}

impl CheckpointKind {
    #[must_use]
    pub fn to_wire(self) -> u16 {
        match self {
            Self::Full => 1,
            Self::Incremental => 2,
        }
    }

    pub fn from_wire(value: u16) -> Result<Self> {
        match value {
            1 => Ok(Self::Full),
            2 => Ok(Self::Incremental),
            other => Err(JournalError::Format(format!(
                "unknown checkpoint kind: {other}"
            ))),
        }
    }
}

/// Checkpoint payload: bounds how much log recovery must replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointPayload {
    pub id: CheckpointId,
    pub kind: CheckpointKind,
    pub last_committed: SequenceNumber,
    pub live_metadata_blocks: u64,
    pub live_data_blocks: u64,
    pub timestamp_micros: u64,
}

impl CheckpointPayload {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; 42];
        write(&mut buf, |b| {
            write_le_u64(b, 0, self.id.0)?;
            write_le_u16(b, 8, self.kind.to_wire())?;
            write_le_u64(b, 10, self.last_committed.0)?;
            write_le_u64(b, 18, self.live_metadata_blocks)?;
            write_le_u64(b, 26, self.live_data_blocks)?;
            write_le_u64(b, 34, self.timestamp_micros)?;
            Ok(())
        })?;
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            id: CheckpointId(map_parse(read_le_u64(buf, 0))?),
            kind: CheckpointKind::from_wire(map_parse(read_le_u16(buf, 8))?)?,
            last_committed: SequenceNumber(map_parse(read_le_u64(buf, 10))?),
            live_metadata_blocks: map_parse(read_le_u64(buf, 18))?,
            live_data_blocks: map_parse(read_le_u64(buf, 26))?,
            timestamp_micros: map_parse(read_le_u64(buf, 34))?,
        })
    }
}

/// Revocation payload: home blocks whose earlier log copies must not be
/// replayed (the blocks were freed or reused after those writes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevocationPayload {
    pub targets: Vec<BlockNumber>,
}

impl RevocationPayload {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let count = u32::try_from(self.targets.len())
            .map_err(|_| JournalError::InvalidArgument("too many revocation targets".into()))?;
        let mut buf = vec![0_u8; 4 + self.targets.len() * 8];
        write(&mut buf, |b| {
            write_le_u32(b, 0, count)?;
            let mut offset = 4;
            for target in &self.targets {
                write_le_u64(b, offset, target.0)?;
                offset += 8;
            }
            Ok(())
        })?;
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let count = map_parse(read_le_u32(buf, 0))? as usize;
        // Same cap as the descriptor decoder: never trust a length field
        // beyond the bytes that back it.
        let mut targets = Vec::with_capacity(count.min(buf.len().saturating_sub(4) / 8));
        let mut offset = 4;
        for _ in 0..count {
            targets.push(BlockNumber(map_parse(read_le_u64(buf, offset))?));
            offset += 8;
        }
        Ok(Self { targets })
    }
}

/// Journal superblock: geometry, cursors, and running statistics.
///
/// Rewritten on clean shutdown, at checkpoints, and periodically. A
/// mismatched magic or CRC at open is a hard format error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalSuperblock {
    pub checksum_alg: ChecksumAlgorithm,
    /// First device block of the journal extent.
    pub start_block: BlockNumber,
    /// Total blocks in the extent, superblock included.
    pub block_count: u64,
    pub block_size: u32,
    /// True when the journal was cleanly shut down; recovery is skipped.
    pub clean_shutdown: bool,
    /// Log-area offset (0-based, excludes the superblock) of the head.
    pub head_pos: u64,
    /// Log-area offset of the tail.
    pub tail_pos: u64,
    /// Next sequence number to assign.
    pub sequence: SequenceNumber,
    pub last_committed: SequenceNumber,
    pub commits: u64,
    pub aborts: u64,
    pub wraps: u64,
}

impl JournalSuperblock {
    /// Encode into a buffer of at least `SUPERBLOCK_SIZE` bytes.
    ///
    /// The trailing CRC32c covers everything before it; the superblock CRC
    /// is always CRC32c regardless of the log checksum algorithm, so the
    /// algorithm field itself is protected.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < SUPERBLOCK_SIZE {
            return Err(JournalError::InvalidArgument(format!(
                "superblock buffer too small: {}",
                buf.len()
            )));
        }
        buf[..SUPERBLOCK_SIZE].fill(0);
        write(buf, |b| {
            write_le_u32(b, 0, JOURNAL_SUPERBLOCK_MAGIC)?;
            write_le_u16(b, 4, JOURNAL_FORMAT_VERSION)?;
            write_le_u16(b, 6, self.checksum_alg.to_wire())?;
            write_le_u64(b, 8, self.start_block.0)?;
            write_le_u64(b, 16, self.block_count)?;
            write_le_u32(b, 24, self.block_size)?;
            write_le_u32(b, 28, u32::from(self.clean_shutdown))?;
            write_le_u64(b, 32, self.head_pos)?;
            write_le_u64(b, 40, self.tail_pos)?;
            write_le_u64(b, 48, self.sequence.0)?;
            write_le_u64(b, 56, self.last_committed.0)?;
            write_le_u64(b, 64, self.commits)?;
            write_le_u64(b, 72, self.aborts)?;
            write_le_u64(b, 80, self.wraps)?;
            Ok(())
        })?;
        let crc = crc32c::crc32c(&buf[..SUPERBLOCK_SIZE - 4]);
        write_le_u32(buf, SUPERBLOCK_SIZE - 4, crc)
            .map_err(|e| JournalError::Format(e.to_string()))?;
        Ok(())
    }

    /// Decode and validate (magic, version, CRC, geometry).
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SUPERBLOCK_SIZE {
            return Err(JournalError::Format(format!(
                "superblock too short: {} bytes",
                buf.len()
            )));
        }
        let magic = map_parse(read_le_u32(buf, 0))?;
        if magic != JOURNAL_SUPERBLOCK_MAGIC {
            return Err(JournalError::Format(format!(
                "journal superblock magic mismatch: expected {JOURNAL_SUPERBLOCK_MAGIC:#010x}, got {magic:#010x}"
            )));
        }
        let version = map_parse(read_le_u16(buf, 4))?;
        if version != JOURNAL_FORMAT_VERSION {
            return Err(JournalError::Format(format!(
                "unsupported journal superblock version: {version}"
            )));
        }
        let stored_crc = map_parse(read_le_u32(buf, SUPERBLOCK_SIZE - 4))?;
        let computed_crc = crc32c::crc32c(&buf[..SUPERBLOCK_SIZE - 4]);
        if stored_crc != computed_crc {
            return Err(JournalError::Corruption {
                block: 0,
                detail: format!(
                    "superblock CRC mismatch: stored {stored_crc:#010x}, computed {computed_crc:#010x}"
                ),
            });
        }

        let sb = Self {
            checksum_alg: ChecksumAlgorithm::from_wire(map_parse(read_le_u16(buf, 6))?)?,
            start_block: BlockNumber(map_parse(read_le_u64(buf, 8))?),
            block_count: map_parse(read_le_u64(buf, 16))?,
            block_size: map_parse(read_le_u32(buf, 24))?,
            clean_shutdown: map_parse(read_le_u32(buf, 28))? != 0,
            head_pos: map_parse(read_le_u64(buf, 32))?,
            tail_pos: map_parse(read_le_u64(buf, 40))?,
            sequence: SequenceNumber(map_parse(read_le_u64(buf, 48))?),
            last_committed: SequenceNumber(map_parse(read_le_u64(buf, 56))?),
            commits: map_parse(read_le_u64(buf, 64))?,
            aborts: map_parse(read_le_u64(buf, 72))?,
            wraps: map_parse(read_le_u64(buf, 80))?,
        };

        if sb.block_count < 2 {
            return Err(JournalError::Format(format!(
                "journal extent too small: {} blocks",
                sb.block_count
            )));
        }
        let log_area = sb.block_count - 1;
        if sb.head_pos >= log_area || sb.tail_pos >= log_area {
            return Err(JournalError::Format(format!(
                "journal cursors out of range: head={} tail={} log_area={log_area}",
                sb.head_pos, sb.tail_pos
            )));
        }
        Ok(sb)
    }
}

fn map_parse<T>(result: std::result::Result<T, ParseError>) -> Result<T> {
    result.map_err(|e| JournalError::Format(e.to_string()))
}

fn write(
    buf: &mut [u8],
    f: impl FnOnce(&mut [u8]) -> std::result::Result<(), ParseError>,
) -> Result<()> {
    f(buf).map_err(|e| JournalError::Format(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_superblock() -> JournalSuperblock {
        JournalSuperblock {
            checksum_alg: ChecksumAlgorithm::Crc32c,
            start_block: BlockNumber(100),
            block_count: 256,
            block_size: 4096,
            clean_shutdown: false,
            head_pos: 17,
            tail_pos: 3,
            sequence: SequenceNumber(42),
            last_committed: SequenceNumber(40),
            commits: 12,
            aborts: 1,
            wraps: 0,
        }
    }

    #[test]
    fn superblock_round_trip() {
        let sb = sample_superblock();
        let mut buf = vec![0_u8; 4096];
        sb.encode_into(&mut buf).expect("encode");
        let decoded = JournalSuperblock::decode(&buf).expect("decode");
        assert_eq!(decoded, sb);
    }

    #[test]
    fn superblock_rejects_bad_magic_and_crc() {
        let sb = sample_superblock();
        let mut buf = vec![0_u8; 4096];
        sb.encode_into(&mut buf).expect("encode");

        let mut bad_magic = buf.clone();
        bad_magic[0] ^= 0xFF;
        assert!(matches!(
            JournalSuperblock::decode(&bad_magic),
            Err(JournalError::Format(_))
        ));

        let mut bad_crc = buf.clone();
        bad_crc[16] ^= 0x01;
        assert!(matches!(
            JournalSuperblock::decode(&bad_crc),
            Err(JournalError::Corruption { .. })
        ));
    }

    #[test]
    fn superblock_rejects_out_of_range_cursors() {
        let mut sb = sample_superblock();
        sb.head_pos = 255; // log area is 255 blocks, valid range 0..255
        let mut buf = vec![0_u8; 4096];
        sb.encode_into(&mut buf).expect("encode");
        assert!(JournalSuperblock::decode(&buf).is_err());
    }

    #[test]
    fn header_round_trip() {
        let header = BlockHeader {
            block_type: BlockType::Descriptor,
            sequence: SequenceNumber(7),
            payload_len: 123,
            flags: 0,
            checksum: 0xDEAD_BEEF_CAFE,
        };
        let mut buf = vec![0_u8; BLOCK_HEADER_SIZE];
        header.encode_into(&mut buf).expect("encode");
        let decoded = BlockHeader::decode(&buf).expect("decode").expect("present");
        assert_eq!(decoded, header);
    }

    #[test]
    fn header_decode_returns_none_for_unwritten_space() {
        let buf = vec![0_u8; BLOCK_HEADER_SIZE];
        assert_eq!(BlockHeader::decode(&buf).expect("decode"), None);
    }

    #[test]
    fn descriptor_round_trip_and_targets_checksum() {
        let payload = DescriptorPayload {
            txn_id: TxnId(9),
            op_type: 2,
            actor_id: 11,
            timestamp_micros: 1_700_000_000_000_000,
            targets: vec![BlockNumber(5), BlockNumber(6), BlockNumber(99)],
        };
        let encoded = payload.encode().expect("encode");
        let decoded = DescriptorPayload::decode(&encoded).expect("decode");
        assert_eq!(decoded, payload);

        let alg = ChecksumAlgorithm::Crc32c;
        assert_eq!(
            payload.targets_checksum(alg),
            decoded.targets_checksum(alg)
        );

        let mut reordered = payload.clone();
        reordered.targets.swap(0, 2);
        assert_ne!(
            payload.targets_checksum(alg),
            reordered.targets_checksum(alg)
        );
    }

    #[test]
    fn data_payload_round_trip() {
        let payload = DataPayload {
            target: BlockNumber(77),
            bytes: vec![1, 2, 3, 4, 5],
        };
        let encoded = payload.encode().expect("encode");
        assert_eq!(DataPayload::decode(&encoded).expect("decode"), payload);
    }

    #[test]
    fn data_payload_rejects_overlong_length() {
        let payload = DataPayload {
            target: BlockNumber(1),
            bytes: vec![0xAB; 32],
        };
        let mut encoded = payload.encode().expect("encode");
        // Claim more bytes than the buffer holds.
        encoded[8..12].copy_from_slice(&1000_u32.to_le_bytes());
        assert!(DataPayload::decode(&encoded).is_err());
    }

    #[test]
    fn commit_round_trip() {
        let payload = CommitPayload {
            txn_id: TxnId(3),
            targets_checksum: 0x1234_5678_9ABC,
            timestamp_micros: 55,
        };
        let encoded = payload.encode().expect("encode");
        assert_eq!(CommitPayload::decode(&encoded).expect("decode"), payload);
    }

    #[test]
    fn checkpoint_round_trip() {
        let payload = CheckpointPayload {
            id: CheckpointId(4),
            kind: CheckpointKind::Full,
            last_committed: SequenceNumber(90),
            live_metadata_blocks: 12,
            live_data_blocks: 340,
            timestamp_micros: 1_700_000_000,
        };
        let encoded = payload.encode().expect("encode");
        assert_eq!(
            CheckpointPayload::decode(&encoded).expect("decode"),
            payload
        );
    }

    #[test]
    fn revocation_round_trip() {
        let payload = RevocationPayload {
            targets: vec![BlockNumber(1), BlockNumber(2)],
        };
        let encoded = payload.encode().expect("encode");
        assert_eq!(
            RevocationPayload::decode(&encoded).expect("decode"),
            payload
        );
    }

    #[test]
    fn descriptor_target_count_is_bounded_by_payload() {
        // A count field claiming four billion targets with no bytes
        // behind it must error out, not allocate.
        let mut buf = vec![0_u8; 28];
        buf[24..28].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(DescriptorPayload::decode(&buf).is_err());
    }

    #[test]
    fn revocation_target_count_is_bounded_by_payload() {
        let buf = u32::MAX.to_le_bytes().to_vec();
        assert!(RevocationPayload::decode(&buf).is_err());
    }
}
