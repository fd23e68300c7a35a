#![forbid(unsafe_code)]
//! Block I/O collaborator surface.
//!
//! The journal and metadata layers only ever operate on fixed-size blocks
//! through the [`BlockDevice`] trait; they never assume a particular
//! storage medium. `FileByteDevice` backs the real thing, and
//! `MemBlockDevice` backs tests and crash simulation.

use fj_error::{JournalError, Result};
use fj_types::BlockNumber;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// `std::os::unix::fs::FileExt` is thread-safe and does not require a
/// shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(u64::try_from(buf.len()).map_err(|_| {
                JournalError::InvalidArgument("read length overflows u64".to_owned())
            })?)
            .ok_or_else(|| JournalError::InvalidArgument("read range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(JournalError::InvalidArgument(format!(
                "read out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }

        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(JournalError::ReadOnly);
        }
        let end = offset
            .checked_add(u64::try_from(buf.len()).map_err(|_| {
                JournalError::InvalidArgument("write length overflows u64".to_owned())
            })?)
            .ok_or_else(|| JournalError::InvalidArgument("write range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(JournalError::InvalidArgument(format!(
                "write out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }

        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Block-addressed I/O interface — the collaborator contract the journal
/// stack is written against.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

impl<D: BlockDevice + ?Sized> BlockDevice for Arc<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        (**self).read_block(block)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        (**self).write_block(block, data)
    }

    fn block_size(&self) -> u32 {
        (**self).block_size()
    }

    fn block_count(&self) -> u64 {
        (**self).block_count()
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

/// Optional raw-block pool on a collaborator device: out-of-band block
/// acquisition for callers outside any allocation group (journal extent
/// growth, scratch blocks).
pub trait RawBlockPool: Send + Sync {
    /// Acquire an unused raw block.
    fn allocate_raw_block(&self) -> Result<BlockNumber>;

    /// Return a raw block to the pool.
    fn free_raw_block(&self, block: BlockNumber) -> Result<()>;
}

/// Block device over a [`ByteDevice`], dividing it into fixed-size blocks.
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(JournalError::Format(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }

        let len = inner.len_bytes();
        let block_size_u64 = u64::from(block_size);
        let remainder = len % block_size_u64;
        if remainder != 0 {
            return Err(JournalError::Format(format!(
                "device length is not block-aligned: len_bytes={len} block_size={block_size} remainder={remainder}"
            )));
        }
        let block_count = len / block_size_u64;
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        if block.0 >= self.block_count {
            return Err(JournalError::InvalidArgument(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }

        let offset = block
            .0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| JournalError::InvalidArgument("block offset overflow".to_owned()))?;
        let mut buf = vec![0_u8; self.block_size as usize];
        self.inner.read_exact_at(offset, &mut buf)?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        let expected = self.block_size as usize;
        if data.len() != expected {
            return Err(JournalError::InvalidArgument(format!(
                "write_block data size mismatch: got={} expected={expected}",
                data.len()
            )));
        }
        if block.0 >= self.block_count {
            return Err(JournalError::InvalidArgument(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }

        let offset = block
            .0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| JournalError::InvalidArgument("block offset overflow".to_owned()))?;
        self.inner.write_all_at(offset, data)?;
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

/// In-memory block device for tests and crash simulation.
///
/// `snapshot`/`restore` let recovery tests capture device state at an
/// arbitrary point and "crash" back to it.
#[derive(Debug)]
pub struct MemBlockDevice {
    state: Mutex<MemState>,
    block_size: u32,
    block_count: u64,
}

#[derive(Debug)]
struct MemState {
    blocks: Vec<Vec<u8>>,
    raw_free: BTreeSet<u64>,
}

impl MemBlockDevice {
    /// Create a zero-filled device.
    #[must_use]
    pub fn new(block_size: u32, block_count: u64) -> Self {
        let blocks = (0..block_count)
            .map(|_| vec![0_u8; block_size as usize])
            .collect();
        Self {
            state: Mutex::new(MemState {
                blocks,
                raw_free: BTreeSet::new(),
            }),
            block_size,
            block_count,
        }
    }

    /// Seed the raw pool with a range of spare blocks.
    pub fn seed_raw_pool(&self, start: BlockNumber, count: u64) {
        let mut state = self.state.lock();
        for i in 0..count {
            state.raw_free.insert(start.0 + i);
        }
    }

    /// Capture the full device contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Vec<u8>> {
        self.state.lock().blocks.clone()
    }

    /// Restore device contents from a prior snapshot (simulated crash).
    pub fn restore(&self, snapshot: Vec<Vec<u8>>) {
        self.state.lock().blocks = snapshot;
    }

    /// Flip one byte of a block in place (corruption injection).
    pub fn corrupt_byte(&self, block: BlockNumber, offset: usize) {
        let mut state = self.state.lock();
        if let Some(data) = state.blocks.get_mut(block.0 as usize) {
            if let Some(byte) = data.get_mut(offset) {
                *byte ^= 0xFF;
            }
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let state = self.state.lock();
        let data = state
            .blocks
            .get(block.0 as usize)
            .cloned()
            .ok_or_else(|| {
                JournalError::InvalidArgument(format!(
                    "block out of range: block={} block_count={}",
                    block.0, self.block_count
                ))
            })?;
        Ok(BlockBuf::new(data))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        if data.len() != self.block_size as usize {
            return Err(JournalError::InvalidArgument(format!(
                "write_block data size mismatch: got={} expected={}",
                data.len(),
                self.block_size
            )));
        }
        let mut state = self.state.lock();
        let slot = state.blocks.get_mut(block.0 as usize).ok_or_else(|| {
            JournalError::InvalidArgument(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            ))
        })?;
        slot.copy_from_slice(data);
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

impl RawBlockPool for MemBlockDevice {
    fn allocate_raw_block(&self) -> Result<BlockNumber> {
        let mut state = self.state.lock();
        let first = state.raw_free.iter().next().copied();
        match first {
            Some(block) => {
                state.raw_free.remove(&block);
                Ok(BlockNumber(block))
            }
            None => Err(JournalError::NoSpace),
        }
    }

    fn free_raw_block(&self, block: BlockNumber) -> Result<()> {
        if block.0 >= self.block_count {
            return Err(JournalError::InvalidArgument(format!(
                "raw free out of range: block={}",
                block.0
            )));
        }
        self.state.lock().raw_free.insert(block.0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn mem_device_round_trips() {
        let dev = MemBlockDevice::new(512, 8);
        dev.write_block(BlockNumber(3), &[7_u8; 512]).expect("write");
        let read = dev.read_block(BlockNumber(3)).expect("read");
        assert_eq!(read.as_slice(), &[7_u8; 512]);
    }

    #[test]
    fn mem_device_rejects_bad_size_and_range() {
        let dev = MemBlockDevice::new(512, 8);
        assert!(dev.write_block(BlockNumber(0), &[0_u8; 100]).is_err());
        assert!(dev.write_block(BlockNumber(8), &[0_u8; 512]).is_err());
        assert!(dev.read_block(BlockNumber(99)).is_err());
    }

    #[test]
    fn mem_device_snapshot_restore() {
        let dev = MemBlockDevice::new(512, 4);
        dev.write_block(BlockNumber(1), &[1_u8; 512]).expect("write");
        let snap = dev.snapshot();
        dev.write_block(BlockNumber(1), &[2_u8; 512]).expect("write");
        dev.restore(snap);
        let read = dev.read_block(BlockNumber(1)).expect("read");
        assert_eq!(read.as_slice(), &[1_u8; 512]);
    }

    #[test]
    fn raw_pool_allocates_lowest_first() {
        let dev = MemBlockDevice::new(512, 16);
        dev.seed_raw_pool(BlockNumber(10), 3);
        assert_eq!(dev.allocate_raw_block().expect("alloc"), BlockNumber(10));
        assert_eq!(dev.allocate_raw_block().expect("alloc"), BlockNumber(11));
        dev.free_raw_block(BlockNumber(10)).expect("free");
        assert_eq!(dev.allocate_raw_block().expect("alloc"), BlockNumber(10));
        assert_eq!(dev.allocate_raw_block().expect("alloc"), BlockNumber(12));
        assert!(matches!(
            dev.allocate_raw_block(),
            Err(JournalError::NoSpace)
        ));
    }

    #[test]
    fn byte_block_device_round_trips() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(&vec![0_u8; 4096 * 4]).expect("fill");
        file.flush().expect("flush");

        let dev = FileByteDevice::open(file.path()).expect("open");
        let dev = ByteBlockDevice::new(dev, 4096).expect("device");

        dev.write_block(BlockNumber(2), &[7_u8; 4096]).expect("write");
        let read = dev.read_block(BlockNumber(2)).expect("read");
        assert_eq!(read.as_slice(), &[7_u8; 4096]);
        dev.sync().expect("sync");
    }

    #[test]
    fn byte_block_device_rejects_unaligned_length() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(&vec![0_u8; 4096 + 100]).expect("fill");
        file.flush().expect("flush");

        let dev = FileByteDevice::open(file.path()).expect("open");
        assert!(ByteBlockDevice::new(dev, 4096).is_err());
    }

    #[test]
    fn corrupt_byte_flips_content() {
        let dev = MemBlockDevice::new(512, 2);
        dev.write_block(BlockNumber(0), &[0xAA_u8; 512]).expect("write");
        dev.corrupt_byte(BlockNumber(0), 7);
        let read = dev.read_block(BlockNumber(0)).expect("read");
        assert_eq!(read.as_slice()[7], 0x55);
        assert_eq!(read.as_slice()[6], 0xAA);
    }
}
