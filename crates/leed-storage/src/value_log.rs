//! Value log: append-only value storage
//!
//! Record format (padded to whole device blocks):
//! ```text
//! +--------+--------+----------+----------+-------------+--------+-----+-------+
//! | Magic  | Salt   | ValueLen | Reserved | BucketHint  | CRC32C | pad | Value |
//! | 4B     | 4B     | 4B       | 4B       | 8B          | 4B     | 4B  | var   |
//! +--------+--------+----------+----------+-------------+--------+-----+-------+
//! ```
//! The CRC covers the first 24 header bytes and the value.
//!
//! Offsets are byte offsets into the value region and always block aligned.
//! The write cursor only moves forward; space is never reused. Every write
//! also stamps the owning bucket id of each block it covers into the id log.

use crate::device::BlockDevice;
use crate::layout::{ID_ENTRY_SIZE, Region, RegionLayout};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use leed_common::{BucketId, Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

/// Value record magic number
const RECORD_MAGIC: u32 = 0x4C56_414C; // "LVAL"

/// Record header size
pub const RECORD_HEADER_SIZE: usize = 32;

const CRC_FIELD: usize = 24;

/// Header at the start of every value record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    pub value_len: u32,
    pub bucket_hint: BucketId,
    pub crc: u32,
}

impl RecordHeader {
    fn prefix(salt: u32, value_len: u32, bucket_hint: BucketId) -> [u8; CRC_FIELD] {
        let mut buf = [0u8; CRC_FIELD];
        let mut cursor = &mut buf[..];
        cursor.put_u32_le(RECORD_MAGIC);
        cursor.put_u32_le(salt);
        cursor.put_u32_le(value_len);
        cursor.put_u32_le(0);
        cursor.put_u64_le(bucket_hint.as_u64());
        buf
    }

    fn checksum(salt: u32, value_len: u32, bucket_hint: BucketId, value: &[u8]) -> u32 {
        let crc = crc32c::crc32c(&Self::prefix(salt, value_len, bucket_hint));
        crc32c::crc32c_append(crc, value)
    }

    fn decode(salt: u32, data: &[u8]) -> Option<Self> {
        if data.len() < RECORD_HEADER_SIZE {
            return None;
        }
        let mut buf = data;
        if buf.get_u32_le() != RECORD_MAGIC || buf.get_u32_le() != salt {
            return None;
        }
        let value_len = buf.get_u32_le();
        buf.advance(4);
        let bucket_hint = BucketId::new(buf.get_u64_le());
        let crc = buf.get_u32_le();
        Some(Self {
            value_len,
            bucket_hint,
            crc,
        })
    }

    fn verify(&self, salt: u32, value: &[u8]) -> bool {
        Self::checksum(salt, self.value_len, self.bucket_hint, value) == self.crc
    }
}

/// Append-only value store of one shard
pub struct ValueLog {
    device: Arc<dyn BlockDevice>,
    region: Region,
    id_region: Region,
    block_size: u64,
    salt: u32,
    /// Blocks read per step when scanning
    scan_blocks: u64,
    /// Next free byte offset
    cursor: Mutex<u64>,
    /// Owner bucket id per value block, mirrored to the id region
    owners: tokio::sync::Mutex<Vec<u64>>,
}

impl ValueLog {
    /// Start an empty log on a freshly formatted device
    #[must_use]
    pub fn format(device: Arc<dyn BlockDevice>, layout: &RegionLayout, salt: u32, scan_blocks: u32) -> Self {
        Self {
            device,
            region: layout.value,
            id_region: layout.id,
            block_size: u64::from(layout.block_size),
            salt,
            scan_blocks: u64::from(scan_blocks.max(1)),
            cursor: Mutex::new(0),
            owners: tokio::sync::Mutex::new(vec![0; layout.value.blocks as usize]),
        }
    }

    /// Reopen a log, recovering the cursor and the id log mirror
    ///
    /// # Errors
    /// Returns an error if the regions cannot be read.
    pub async fn open(device: Arc<dyn BlockDevice>, layout: &RegionLayout, salt: u32, scan_blocks: u32) -> Result<Self> {
        let log = Self::format(device, layout, salt, scan_blocks);
        let cursor = log.recover_cursor().await?;
        *log.cursor.lock() = cursor;
        log.load_owners().await?;
        info!(
            "Value log opened: cursor at {} of {} bytes",
            cursor,
            log.capacity()
        );
        Ok(log)
    }

    async fn recover_cursor(&self) -> Result<u64> {
        let bs = self.block_size;
        let capacity = self.capacity();
        let mut pos = 0u64;
        let mut buf = Bytes::new();
        let mut buf_start = 0u64;

        while pos + RECORD_HEADER_SIZE as u64 <= capacity {
            if pos < buf_start || pos + bs > buf_start + buf.len() as u64 {
                let block = pos / bs;
                let count = self.scan_blocks.min(self.region.blocks - block);
                buf = self.device.read(self.region.offset + block, count).await?;
                buf_start = block * bs;
            }
            let at = (pos - buf_start) as usize;
            let Some(header) = RecordHeader::decode(self.salt, &buf[at..]) else {
                break;
            };
            let len = self.record_len(header.value_len as usize);
            if pos + len > capacity {
                break;
            }
            let record = if pos + len <= buf_start + buf.len() as u64 {
                buf.slice(at..at + len as usize)
            } else {
                self.device
                    .read(self.region.offset + pos / bs, len / bs)
                    .await?
            };
            let value = &record[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + header.value_len as usize];
            if !header.verify(self.salt, value) {
                break;
            }
            pos += len;
        }
        Ok(pos)
    }

    async fn load_owners(&self) -> Result<()> {
        let mut owners = self.owners.lock().await;
        let per_block = (self.block_size / ID_ENTRY_SIZE) as usize;
        let mut block = 0;
        while block < self.id_region.blocks {
            let count = self.scan_blocks.min(self.id_region.blocks - block);
            let data = self.device.read(self.id_region.offset + block, count).await?;
            let first = block as usize * per_block;
            for (i, mut entry) in data.chunks_exact(ID_ENTRY_SIZE as usize).enumerate() {
                if let Some(owner) = owners.get_mut(first + i) {
                    *owner = entry.get_u64_le();
                }
            }
            block += count;
        }
        Ok(())
    }

    /// Value region size in bytes
    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.region.blocks * self.block_size
    }

    /// Next free byte offset
    #[must_use]
    pub fn cursor(&self) -> u64 {
        *self.cursor.lock()
    }

    /// Move the cursor forward to at least `end`, never backward
    ///
    /// Used on open to skip past records that committed items reference
    /// but the scan did not reach. Returns whether the cursor moved.
    pub fn advance_cursor(&self, end: u64) -> bool {
        let end = end.min(self.capacity());
        let mut cursor = self.cursor.lock();
        if end <= *cursor {
            return false;
        }
        debug!("Value log cursor advanced from {} to {}", *cursor, end);
        *cursor = end;
        true
    }

    /// Bytes left for new records
    #[must_use]
    pub fn available(&self) -> u64 {
        self.capacity() - self.cursor()
    }

    /// Largest value a single record can hold
    #[must_use]
    pub fn max_value_len(&self) -> u64 {
        (self.capacity().saturating_sub(RECORD_HEADER_SIZE as u64)).min(u64::from(u32::MAX))
    }

    /// Bytes a record of `value_len` occupies, padding included
    #[must_use]
    pub const fn record_len(&self, value_len: usize) -> u64 {
        ((RECORD_HEADER_SIZE + value_len) as u64).div_ceil(self.block_size) * self.block_size
    }

    /// Reserve space for one record
    ///
    /// # Errors
    /// Returns [`Error::ValueLogFull`] if the record does not fit.
    pub fn reserve(&self, value_len: usize) -> Result<u64> {
        self.reserve_batch(&[value_len]).map(|offsets| offsets[0])
    }

    /// Reserve contiguous space for several records at once
    ///
    /// # Errors
    /// Returns [`Error::ValueLogFull`] if they do not all fit; nothing is
    /// reserved in that case.
    pub fn reserve_batch(&self, value_lens: &[usize]) -> Result<Vec<u64>> {
        let lens: Vec<u64> = value_lens.iter().map(|&len| self.record_len(len)).collect();
        let total: u64 = lens.iter().sum();

        let mut cursor = self.cursor.lock();
        let available = self.capacity() - *cursor;
        if total > available {
            return Err(Error::ValueLogFull {
                required: total,
                available,
            });
        }

        let mut offsets = Vec::with_capacity(lens.len());
        let mut at = *cursor;
        for len in lens {
            offsets.push(at);
            at += len;
        }
        *cursor = at;
        Ok(offsets)
    }

    fn encode_record(&self, buf: &mut BytesMut, value: &[u8], bucket_hint: BucketId) -> Result<()> {
        let value_len = u32::try_from(value.len()).map_err(|_| Error::ValueTooLarge {
            len: value.len(),
            max: self.max_value_len(),
        })?;
        let start = buf.len();
        buf.put_slice(&RecordHeader::prefix(self.salt, value_len, bucket_hint));
        buf.put_u32_le(RecordHeader::checksum(self.salt, value_len, bucket_hint, value));
        buf.put_u32_le(0);
        buf.put_slice(value);
        buf.resize(start + self.record_len(value.len()) as usize, 0);
        Ok(())
    }

    /// Write one record at a reserved offset
    ///
    /// # Errors
    /// Returns a device error; the reservation stays consumed.
    pub async fn write(&self, offset: u64, value: &[u8], bucket_hint: BucketId) -> Result<()> {
        self.write_batch(&[offset], &[value], &[bucket_hint]).await
    }

    /// Write records at contiguous reserved offsets with one device write
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if the offsets are not contiguous,
    /// or a device error.
    pub async fn write_batch<V: AsRef<[u8]>>(
        &self,
        offsets: &[u64],
        values: &[V],
        bucket_hints: &[BucketId],
    ) -> Result<()> {
        if offsets.is_empty() {
            return Ok(());
        }
        if offsets.len() != values.len() || offsets.len() != bucket_hints.len() {
            return Err(Error::invalid_argument("value batch arrays differ in length"));
        }

        let mut buf = BytesMut::new();
        let mut spans = Vec::with_capacity(offsets.len());
        let mut expected = offsets[0];
        for ((&offset, value), &hint) in offsets.iter().zip(values).zip(bucket_hints) {
            let value = value.as_ref();
            if offset != expected || offset % self.block_size != 0 {
                return Err(Error::invalid_argument(format!(
                    "value offset {offset} breaks the batch at {expected}"
                )));
            }
            self.encode_record(&mut buf, value, hint)?;
            let len = self.record_len(value.len());
            spans.push((offset / self.block_size, len / self.block_size, hint));
            expected += len;
        }
        if expected > self.capacity() {
            return Err(Error::invalid_argument(format!(
                "value batch ends at {expected}, past the region end {}",
                self.capacity()
            )));
        }

        let first_block = offsets[0] / self.block_size;
        self.device
            .write(self.region.offset + first_block, buf.freeze())
            .await?;
        self.record_owners(&spans).await
    }

    async fn record_owners(&self, spans: &[(u64, u64, BucketId)]) -> Result<()> {
        let per_block = self.block_size / ID_ENTRY_SIZE;
        let (Some(first), Some(last)) = (spans.first(), spans.last()) else {
            return Ok(());
        };
        let first_id_block = first.0 / per_block;
        let last_id_block = (last.0 + last.1 - 1) / per_block;

        let mut owners = self.owners.lock().await;
        for &(block, count, owner) in spans {
            for entry in &mut owners[block as usize..(block + count) as usize] {
                *entry = owner.as_u64();
            }
        }

        let start = (first_id_block * per_block) as usize;
        let end = ((last_id_block + 1) * per_block) as usize;
        let mut buf = BytesMut::with_capacity((end - start) * ID_ENTRY_SIZE as usize);
        for i in start..end {
            buf.put_u64_le(owners.get(i).copied().unwrap_or(0));
        }
        self.device
            .write(self.id_region.offset + first_id_block, buf.freeze())
            .await
    }

    /// Read a value back
    ///
    /// # Errors
    /// Returns [`Error::Corruption`] if the record at `offset` is missing,
    /// has another length or fails its checksum.
    pub async fn read(&self, offset: u64, value_len: u32) -> Result<Bytes> {
        let len = self.record_len(value_len as usize);
        if offset % self.block_size != 0 || offset + len > self.capacity() {
            return Err(Error::invalid_argument(format!(
                "value record at {offset} (+{len}) outside the value log"
            )));
        }
        let record = self
            .device
            .read(self.region.offset + offset / self.block_size, len / self.block_size)
            .await?;

        let header = RecordHeader::decode(self.salt, &record)
            .ok_or_else(|| Error::corruption(format!("no value record at offset {offset}")))?;
        if header.value_len != value_len {
            return Err(Error::corruption(format!(
                "value record at {offset} holds {} bytes, index says {value_len}",
                header.value_len
            )));
        }
        let value = record.slice(RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + value_len as usize);
        if !header.verify(self.salt, &value) {
            return Err(Error::corruption(format!(
                "value record at {offset} fails its checksum"
            )));
        }
        debug!("Read {} value bytes at offset {}", value_len, offset);
        Ok(value)
    }

    /// Bucket that owned the block at `offset` when it was last written
    pub async fn owner(&self, offset: u64) -> Option<BucketId> {
        let block = usize::try_from(offset / self.block_size).ok()?;
        self.owners.lock().await.get(block).map(|&id| BucketId::new(id))
    }
}
