//! On-disk layout
//!
//! Device layout, in device blocks:
//! ```text
//! +------------------+  Block 0
//! |   Superblock     |  4KB - magic, version, uuid, geometry, region offsets
//! +------------------+
//! |  Bucket Region   |  2 * num_buckets page slots of 4KB each
//! +------------------+
//! |  Value Log       |  value_log_blocks blocks of block-aligned records
//! +------------------+
//! |  Id Log          |  one u64 owner bucket id per value log block
//! +------------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use leed_common::config::StoreConfig;
use leed_common::{Error, Result};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Magic number for the LEED device format
pub const MAGIC: [u8; 8] = *b"LEEDSTOR";

/// Current format version
pub const FORMAT_VERSION: u32 = 1;

/// Superblock size (4KB)
pub const SUPERBLOCK_SIZE: u64 = 4096;

/// Size of one bucket page (4KB)
pub const PAGE_SIZE: u64 = 4096;

/// Bytes per id log entry
pub const ID_ENTRY_SIZE: u64 = 8;

const CHECKSUM_OFFSET: usize = 112;

/// A contiguous run of device blocks
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Region {
    pub offset: u64,
    pub blocks: u64,
}

impl Region {
    /// First block past the region
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + self.blocks
    }
}

/// Block geometry of a formatted device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionLayout {
    pub block_size: u32,
    pub total_blocks: u64,
    /// Number of page slots in the bucket region
    pub bucket_slots: u64,
    pub bucket: Region,
    pub value: Region,
    pub id: Region,
}

impl RegionLayout {
    /// Compute the layout for a device of `total_blocks` blocks
    ///
    /// # Errors
    /// Returns [`Error::InsufficientCapacity`] when the regions do not fit, or
    /// [`Error::InvalidArgument`] for an unsupported block size.
    pub fn compute(block_size: u32, total_blocks: u64, config: &StoreConfig) -> Result<Self> {
        if !block_size.is_power_of_two()
            || block_size < 512
            || u64::from(block_size) > PAGE_SIZE
        {
            return Err(Error::invalid_argument(format!(
                "block size {block_size} must be a power of two in 512..={PAGE_SIZE}"
            )));
        }
        let bs = u64::from(block_size);
        let page_blocks = PAGE_SIZE / bs;
        let sb_blocks = SUPERBLOCK_SIZE / bs;

        let bucket_slots = config.bucket_slots();
        let bucket = Region {
            offset: sb_blocks,
            blocks: bucket_slots * page_blocks,
        };

        let value_blocks = match config.value_log_blocks {
            Some(blocks) => blocks,
            None => {
                // Largest value log whose id log still fits behind it.
                let avail = total_blocks.saturating_sub(bucket.end());
                avail * bs / (bs + ID_ENTRY_SIZE)
            }
        };
        if value_blocks == 0 {
            return Err(Error::InsufficientCapacity {
                required: bucket.end() + 2,
                available: total_blocks,
            });
        }

        let value = Region {
            offset: bucket.end(),
            blocks: value_blocks,
        };
        let id = Region {
            offset: value.end(),
            blocks: (value_blocks * ID_ENTRY_SIZE).div_ceil(bs),
        };

        if id.end() > total_blocks {
            return Err(Error::InsufficientCapacity {
                required: id.end(),
                available: total_blocks,
            });
        }

        Ok(Self {
            block_size,
            total_blocks,
            bucket_slots,
            bucket,
            value,
            id,
        })
    }

    /// Device blocks per bucket page
    #[must_use]
    pub const fn page_blocks(&self) -> u64 {
        PAGE_SIZE / self.block_size as u64
    }

    /// Device blocks taken by the superblock
    #[must_use]
    pub const fn superblock_blocks(&self) -> u64 {
        SUPERBLOCK_SIZE / self.block_size as u64
    }

    /// First device block of a bucket page slot
    #[must_use]
    pub const fn slot_block(&self, slot: u64) -> u64 {
        self.bucket.offset + slot * self.page_blocks()
    }

    /// Value log size in bytes
    #[must_use]
    pub const fn value_bytes(&self) -> u64 {
        self.value.blocks * self.block_size as u64
    }
}

/// Superblock stored at block 0
#[derive(Clone, Debug)]
pub struct Superblock {
    pub magic: [u8; 8],
    pub version: u32,
    /// Shard id this device serves
    pub ds_id: u32,
    pub store_uuid: Uuid,
    pub num_buckets: u64,
    pub log_bucket_num: u32,
    pub layout: RegionLayout,
    /// Creation time (Unix seconds)
    pub created_at: u64,
    pub checksum: u32,
}

impl Superblock {
    /// Create a superblock for a freshly formatted device
    #[must_use]
    pub fn new(ds_id: u32, config: &StoreConfig, layout: RegionLayout) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());

        let mut sb = Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            ds_id,
            store_uuid: Uuid::new_v4(),
            num_buckets: config.num_buckets,
            log_bucket_num: config.log_bucket_num,
            layout,
            created_at,
            checksum: 0,
        };
        sb.checksum = sb.compute_checksum();
        sb
    }

    /// Salt stamped into every bucket page and value record of this store
    #[must_use]
    pub fn salt(&self) -> u32 {
        let b = self.store_uuid.as_bytes();
        u32::from_le_bytes([b[0], b[1], b[2], b[3]]) ^ u32::from_le_bytes([b[12], b[13], b[14], b[15]])
    }

    /// Serialize to a full 4KB block
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = self.encode_fields();
        buf.put_u32_le(self.checksum);
        buf.resize(SUPERBLOCK_SIZE as usize, 0);
        buf.freeze()
    }

    fn encode_fields(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(SUPERBLOCK_SIZE as usize);
        buf.put_slice(&self.magic);
        buf.put_u32_le(self.version);
        buf.put_u32_le(self.ds_id);
        buf.put_slice(self.store_uuid.as_bytes());
        buf.put_u32_le(self.layout.block_size);
        buf.put_u64_le(self.layout.total_blocks);
        buf.put_u64_le(self.num_buckets);
        buf.put_u32_le(self.log_bucket_num);
        buf.put_u64_le(self.layout.bucket.offset);
        buf.put_u64_le(self.layout.bucket_slots);
        buf.put_u64_le(self.layout.value.offset);
        buf.put_u64_le(self.layout.value.blocks);
        buf.put_u64_le(self.layout.id.offset);
        buf.put_u64_le(self.layout.id.blocks);
        buf.put_u64_le(self.created_at);
        debug_assert_eq!(buf.len(), CHECKSUM_OFFSET);
        buf
    }

    fn compute_checksum(&self) -> u32 {
        crc32c::crc32c(&self.encode_fields())
    }

    /// Parse and verify a superblock
    ///
    /// # Errors
    /// Returns [`Error::Corruption`] on bad magic, version or checksum.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < CHECKSUM_OFFSET + 4 {
            return Err(Error::corruption("superblock too small"));
        }

        let mut buf = data;
        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(Error::corruption("invalid superblock magic"));
        }

        let version = buf.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(Error::corruption(format!(
                "unsupported format version: {version}"
            )));
        }

        let ds_id = buf.get_u32_le();
        let mut uuid_bytes = [0u8; 16];
        buf.copy_to_slice(&mut uuid_bytes);
        let block_size = buf.get_u32_le();
        let total_blocks = buf.get_u64_le();
        let num_buckets = buf.get_u64_le();
        let log_bucket_num = buf.get_u32_le();
        let bucket = Region {
            offset: buf.get_u64_le(),
            blocks: 0,
        };
        let bucket_slots = buf.get_u64_le();
        let value = Region {
            offset: buf.get_u64_le(),
            blocks: buf.get_u64_le(),
        };
        let id = Region {
            offset: buf.get_u64_le(),
            blocks: buf.get_u64_le(),
        };
        let created_at = buf.get_u64_le();
        let checksum = buf.get_u32_le();

        if block_size == 0 || u64::from(block_size) > PAGE_SIZE {
            return Err(Error::corruption(format!(
                "superblock block size {block_size} out of range"
            )));
        }
        let page_blocks = PAGE_SIZE / u64::from(block_size);

        let sb = Self {
            magic,
            version,
            ds_id,
            store_uuid: Uuid::from_bytes(uuid_bytes),
            num_buckets,
            log_bucket_num,
            layout: RegionLayout {
                block_size,
                total_blocks,
                bucket_slots,
                bucket: Region {
                    blocks: bucket_slots * page_blocks,
                    ..bucket
                },
                value,
                id,
            },
            created_at,
            checksum,
        };

        if sb.compute_checksum() != checksum {
            return Err(Error::corruption("superblock checksum mismatch"));
        }
        Ok(sb)
    }

    /// Check the persisted geometry against the configuration and device
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] when they disagree.
    pub fn validate(&self, config: &StoreConfig, block_size: u32, total_blocks: u64) -> Result<()> {
        if self.layout.block_size != block_size {
            return Err(Error::configuration(format!(
                "device block size {block_size} does not match formatted {}",
                self.layout.block_size
            )));
        }
        if self.layout.id.end() > total_blocks {
            return Err(Error::InsufficientCapacity {
                required: self.layout.id.end(),
                available: total_blocks,
            });
        }
        if self.num_buckets != config.num_buckets || self.log_bucket_num != config.log_bucket_num {
            return Err(Error::configuration(format!(
                "store formatted with num_buckets={} log_bucket_num={}, configured {} / {}",
                self.num_buckets, self.log_bucket_num, config.num_buckets, config.log_bucket_num
            )));
        }
        if let Some(blocks) = config.value_log_blocks
            && blocks != self.layout.value.blocks
        {
            return Err(Error::configuration(format!(
                "store formatted with value_log_blocks={}, configured {blocks}",
                self.layout.value.blocks
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> StoreConfig {
        StoreConfig {
            num_buckets: 16,
            log_bucket_num: 4,
            ..StoreConfig::default()
        }
    }

    #[test]
    fn test_layout_regions() {
        let config = StoreConfig {
            value_log_blocks: Some(100),
            ..small_config()
        };
        let layout = RegionLayout::compute(512, 1000, &config).unwrap();

        assert_eq!(layout.page_blocks(), 8);
        assert_eq!(layout.bucket.offset, 8);
        assert_eq!(layout.bucket_slots, 32);
        assert_eq!(layout.bucket.blocks, 256);
        assert_eq!(layout.value, Region { offset: 264, blocks: 100 });
        assert_eq!(layout.id, Region { offset: 364, blocks: 2 });
        assert_eq!(layout.slot_block(3), 8 + 24);
    }

    #[test]
    fn test_layout_derives_value_log() {
        let layout = RegionLayout::compute(4096, 10_000, &small_config()).unwrap();
        assert!(layout.value.blocks > 0);
        assert!(layout.id.end() <= 10_000);
        assert!(layout.id.blocks * 4096 / ID_ENTRY_SIZE >= layout.value.blocks);
    }

    #[test]
    fn test_layout_insufficient_capacity() {
        let config = StoreConfig {
            value_log_blocks: Some(1000),
            ..small_config()
        };
        let err = RegionLayout::compute(4096, 100, &config).unwrap_err();
        assert!(matches!(err, Error::InsufficientCapacity { .. }));

        let err = RegionLayout::compute(4096, 20, &small_config()).unwrap_err();
        assert!(matches!(err, Error::InsufficientCapacity { .. }));
    }

    #[test]
    fn test_superblock_roundtrip() {
        let config = small_config();
        let layout = RegionLayout::compute(4096, 10_000, &config).unwrap();
        let sb = Superblock::new(3, &config, layout);

        let bytes = sb.to_bytes();
        assert_eq!(bytes.len(), SUPERBLOCK_SIZE as usize);

        let parsed = Superblock::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.ds_id, 3);
        assert_eq!(parsed.store_uuid, sb.store_uuid);
        assert_eq!(parsed.layout, layout);
        assert_eq!(parsed.salt(), sb.salt());
        parsed.validate(&config, 4096, 10_000).unwrap();
    }

    #[test]
    fn test_superblock_detects_corruption() {
        let config = small_config();
        let layout = RegionLayout::compute(4096, 10_000, &config).unwrap();
        let mut bytes = Superblock::new(0, &config, layout).to_bytes().to_vec();
        bytes[40] ^= 0xFF;
        assert!(matches!(
            Superblock::from_bytes(&bytes),
            Err(Error::Corruption(_))
        ));
        assert!(Superblock::from_bytes(&[0u8; 4096]).is_err());
    }

    #[test]
    fn test_superblock_rejects_other_geometry() {
        let config = small_config();
        let layout = RegionLayout::compute(4096, 10_000, &config).unwrap();
        let sb = Superblock::new(0, &config, layout);
        let other = StoreConfig {
            log_bucket_num: 5,
            ..small_config()
        };
        assert!(matches!(
            sb.validate(&other, 4096, 10_000),
            Err(Error::Configuration(_))
        ));
    }
}
