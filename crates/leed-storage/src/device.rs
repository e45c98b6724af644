//! Block devices
//!
//! The engine addresses storage in device blocks through the [`BlockDevice`]
//! trait. [`MemDevice`] keeps everything in memory; [`FileDevice`] runs
//! positioned I/O on a file or raw device from the blocking thread pool.

use crate::raw_io::{AlignedBuf, RawFile};
use async_trait::async_trait;
use bytes::Bytes;
use leed_common::{Error, Result};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Default device block size
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Device I/O counters
#[derive(Debug, Default)]
pub struct DeviceStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub errors: AtomicU64,
}

impl DeviceStats {
    fn record_read(&self, bytes: usize) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_write(&self, bytes: usize) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// Block-addressed asynchronous storage
#[async_trait]
pub trait BlockDevice: Send + Sync {
    /// Size of one block in bytes
    fn block_size(&self) -> u32;

    /// Number of blocks on the device
    fn num_blocks(&self) -> u64;

    /// I/O counters
    fn stats(&self) -> &DeviceStats;

    /// Read `count` blocks starting at `block`
    async fn read(&self, block: u64, count: u64) -> Result<Bytes>;

    /// Write whole blocks starting at `block`
    async fn write(&self, block: u64, data: Bytes) -> Result<()>;

    /// Make completed writes durable
    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Capacity in bytes
    fn capacity(&self) -> u64 {
        self.num_blocks() * u64::from(self.block_size())
    }
}

fn check_range(device: &dyn BlockDevice, block: u64, count: u64) -> Result<()> {
    let end = block
        .checked_add(count)
        .ok_or_else(|| Error::invalid_argument("block range overflows"))?;
    if end > device.num_blocks() {
        return Err(Error::invalid_argument(format!(
            "blocks [{block}, {end}) beyond device end {}",
            device.num_blocks()
        )));
    }
    Ok(())
}

fn blocks_in(device: &dyn BlockDevice, len: usize) -> Result<u64> {
    let block_size = device.block_size() as usize;
    if len % block_size != 0 {
        return Err(Error::invalid_argument(format!(
            "write of {len} bytes is not a multiple of the {block_size}-byte block"
        )));
    }
    Ok((len / block_size) as u64)
}

/// In-memory block device
pub struct MemDevice {
    block_size: u32,
    num_blocks: u64,
    data: RwLock<Vec<u8>>,
    fail_writes: AtomicBool,
    /// Countdown to a single injected failure; 0 when disarmed
    fail_in: AtomicU64,
    stats: DeviceStats,
}

impl MemDevice {
    /// Create a zero-filled device
    #[must_use]
    pub fn new(block_size: u32, num_blocks: u64) -> Self {
        let len = usize::try_from(num_blocks * u64::from(block_size)).unwrap_or(usize::MAX);
        Self {
            block_size,
            num_blocks,
            data: RwLock::new(vec![0; len]),
            fail_writes: AtomicBool::new(false),
            fail_in: AtomicU64::new(0),
            stats: DeviceStats::default(),
        }
    }

    /// Make every following write fail until cleared
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail only the `n`th write from now; `0` disarms
    pub fn fail_nth_write(&self, n: u64) {
        self.fail_in.store(n, Ordering::SeqCst);
    }

    fn injected_failure(&self) -> bool {
        if self.fail_writes.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_in
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok_and(|previous| previous == 1)
    }

    fn byte_range(&self, block: u64, count: u64) -> std::ops::Range<usize> {
        let bs = self.block_size as usize;
        let start = block as usize * bs;
        start..start + count as usize * bs
    }
}

#[async_trait]
impl BlockDevice for MemDevice {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    async fn read(&self, block: u64, count: u64) -> Result<Bytes> {
        check_range(self, block, count)?;
        let range = self.byte_range(block, count);
        let data = Bytes::copy_from_slice(&self.data.read()[range]);
        self.stats.record_read(data.len());
        Ok(data)
    }

    async fn write(&self, block: u64, data: Bytes) -> Result<()> {
        let count = blocks_in(self, data.len())?;
        check_range(self, block, count)?;
        if self.injected_failure() {
            self.stats.record_error();
            return Err(Error::DeviceIo(std::io::Error::other("injected write failure")));
        }
        let range = self.byte_range(block, count);
        self.data.write()[range].copy_from_slice(&data);
        self.stats.record_write(data.len());
        Ok(())
    }
}

/// Device backed by a file or raw block device
pub struct FileDevice {
    file: Arc<RawFile>,
    block_size: u32,
    num_blocks: u64,
    stats: DeviceStats,
}

impl FileDevice {
    /// Open an existing device
    ///
    /// # Errors
    /// Returns an error if the path cannot be opened or the block size is
    /// unusable with the requested I/O mode.
    pub fn open(path: impl AsRef<Path>, block_size: u32, direct: bool) -> Result<Self> {
        Self::from_raw(RawFile::open(path, direct)?, block_size)
    }

    /// Create a file-backed device of `size` bytes
    ///
    /// # Errors
    /// Returns an error if the file cannot be created.
    pub fn create(path: impl AsRef<Path>, size: u64, block_size: u32, direct: bool) -> Result<Self> {
        Self::from_raw(RawFile::create(path, size, direct)?, block_size)
    }

    fn from_raw(file: RawFile, block_size: u32) -> Result<Self> {
        if !block_size.is_power_of_two() || block_size < 512 {
            return Err(Error::invalid_argument(format!(
                "block size {block_size} must be a power of two >= 512"
            )));
        }
        if file.is_direct() && block_size as usize % crate::raw_io::DIRECT_ALIGNMENT != 0 {
            return Err(Error::invalid_argument(format!(
                "direct I/O needs a block size multiple of {}",
                crate::raw_io::DIRECT_ALIGNMENT
            )));
        }
        let num_blocks = file.size() / u64::from(block_size);
        Ok(Self {
            file: Arc::new(file),
            block_size,
            num_blocks,
            stats: DeviceStats::default(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&RawFile) -> Result<T> + Send + 'static,
    {
        let file = Arc::clone(&self.file);
        let result = tokio::task::spawn_blocking(move || op(&file))
            .await
            .map_err(|e| Error::internal(format!("blocking I/O task failed: {e}")))?;
        if result.is_err() {
            self.stats.record_error();
        }
        result
    }
}

#[async_trait]
impl BlockDevice for FileDevice {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    async fn read(&self, block: u64, count: u64) -> Result<Bytes> {
        check_range(self, block, count)?;
        let offset = block * u64::from(self.block_size);
        let len = (count * u64::from(self.block_size)) as usize;
        let data = self
            .blocking(move |file| {
                if file.is_direct() {
                    let mut buf = AlignedBuf::zeroed(len);
                    file.read_exact_at(offset, &mut buf[..len])?;
                    Ok(Bytes::copy_from_slice(&buf[..len]))
                } else {
                    let mut buf = vec![0u8; len];
                    file.read_exact_at(offset, &mut buf)?;
                    Ok(Bytes::from(buf))
                }
            })
            .await?;
        self.stats.record_read(data.len());
        Ok(data)
    }

    async fn write(&self, block: u64, data: Bytes) -> Result<()> {
        let count = blocks_in(self, data.len())?;
        check_range(self, block, count)?;
        let offset = block * u64::from(self.block_size);
        let len = data.len();
        self.blocking(move |file| {
            if file.is_direct() {
                let buf = AlignedBuf::copy_from(&data);
                file.write_all_at(offset, &buf[..data.len()])
            } else {
                file.write_all_at(offset, &data)
            }
        })
        .await?;
        self.stats.record_write(len);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.blocking(RawFile::sync).await
    }
}
