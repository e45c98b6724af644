//! Bucket page format
//!
//! ```text
//! offset  size  field
//! 0       4     magic "LBKT"
//! 4       4     store salt
//! 8       8     bucket id
//! 16      8     chain version
//! 24      1     chain index
//! 25      1     chain length
//! 26      6     reserved
//! 32      268*8 item slots: key_len u8, value_len u32, value_offset u64, key [255]
//! 4092    4     crc32c of bytes 0..4092
//! ```
//!
//! A slot with `key_len == 0` is empty.

use crate::layout::PAGE_SIZE;
use crate::segment::{Bucket, Item};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use leed_common::{BucketId, Error, ITEMS_PER_BUCKET, MAX_KEY_LEN, Result};

/// Magic number at the start of every bucket page
pub const PAGE_MAGIC: u32 = 0x4C42_4B54;

const HEADER_SIZE: usize = 32;
const SLOT_SIZE: usize = 1 + 4 + 8 + MAX_KEY_LEN;
const CRC_OFFSET: usize = PAGE_SIZE as usize - 4;

const _: () = assert!(HEADER_SIZE + SLOT_SIZE * ITEMS_PER_BUCKET <= CRC_OFFSET);

/// Identity of a page within its chain
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageHeader {
    pub bucket_id: BucketId,
    pub version: u64,
    pub chain_index: u8,
    pub chain_length: u8,
}

/// Encode one bucket as a full page
#[must_use]
pub fn encode(salt: u32, header: &PageHeader, bucket: &Bucket) -> Bytes {
    let mut buf = BytesMut::with_capacity(PAGE_SIZE as usize);
    buf.put_u32_le(PAGE_MAGIC);
    buf.put_u32_le(salt);
    buf.put_u64_le(header.bucket_id.as_u64());
    buf.put_u64_le(header.version);
    buf.put_u8(header.chain_index);
    buf.put_u8(header.chain_length);
    buf.put_bytes(0, HEADER_SIZE - buf.len());

    for slot in &bucket.items {
        let start = buf.len();
        if let Some(item) = slot {
            buf.put_u8(item.key.len() as u8);
            buf.put_u32_le(item.value_length);
            buf.put_u64_le(item.value_offset);
            buf.put_slice(&item.key);
        }
        buf.put_bytes(0, start + SLOT_SIZE - buf.len());
    }

    buf.resize(CRC_OFFSET, 0);
    let crc = crc32c::crc32c(&buf);
    buf.put_u32_le(crc);
    buf.freeze()
}

/// Decode a page written by this store
///
/// # Errors
/// Returns [`Error::Corruption`] for pages with a bad magic, a foreign salt,
/// a checksum mismatch or malformed slots.
pub fn decode(salt: u32, data: &[u8]) -> Result<(PageHeader, Bucket)> {
    if data.len() < PAGE_SIZE as usize {
        return Err(Error::corruption(format!("bucket page is {} bytes", data.len())));
    }
    let page = &data[..PAGE_SIZE as usize];

    let mut buf = page;
    if buf.get_u32_le() != PAGE_MAGIC {
        return Err(Error::corruption("bucket page magic mismatch"));
    }
    if buf.get_u32_le() != salt {
        return Err(Error::corruption("bucket page belongs to another format"));
    }
    let stored_crc = (&page[CRC_OFFSET..]).get_u32_le();
    if crc32c::crc32c(&page[..CRC_OFFSET]) != stored_crc {
        return Err(Error::corruption("bucket page checksum mismatch"));
    }

    let header = PageHeader {
        bucket_id: BucketId::new(buf.get_u64_le()),
        version: buf.get_u64_le(),
        chain_index: buf.get_u8(),
        chain_length: buf.get_u8(),
    };
    if header.chain_length == 0 || header.chain_index >= header.chain_length {
        return Err(Error::corruption(format!(
            "bucket page index {} of chain length {}",
            header.chain_index, header.chain_length
        )));
    }

    let mut bucket = Bucket::default();
    for (i, slot) in bucket.items.iter_mut().enumerate() {
        let mut raw = &page[HEADER_SIZE + i * SLOT_SIZE..HEADER_SIZE + (i + 1) * SLOT_SIZE];
        let key_len = raw.get_u8() as usize;
        if key_len == 0 {
            continue;
        }
        let value_length = raw.get_u32_le();
        let value_offset = raw.get_u64_le();
        *slot = Some(Item {
            key: Bytes::copy_from_slice(&raw[..key_len]),
            value_length,
            value_offset,
        });
    }

    Ok((header, bucket))
}
