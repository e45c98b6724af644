//! Core type definitions for LEED
//!
//! Identifiers, key fingerprints and the small value types exchanged between
//! the storage engine and the node layer.

use crate::error::{Error, Result};
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use xxhash_rust::xxh64::xxh64;

/// Maximum key length in bytes
pub const MAX_KEY_LEN: usize = 255;

/// Number of item slots in one bucket
pub const ITEMS_PER_BUCKET: usize = 8;

/// Largest supported `log_bucket_num`
pub const MAX_LOG_BUCKET_NUM: u32 = 63;

/// Validate a key against the engine limits
///
/// # Errors
/// Returns [`Error::InvalidKey`] for empty keys or keys longer than
/// [`MAX_KEY_LEN`].
pub fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(Error::InvalidKey(key.len()));
    }
    Ok(())
}

/// Number of distinct bucket ids for a given `log_bucket_num`
#[must_use]
pub const fn bucket_space(log_bucket_num: u32) -> u64 {
    1u64 << log_bucket_num
}

/// 64-bit hash of a key; also the key's position on the ring
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Fingerprint a key
    #[must_use]
    pub fn of(key: &[u8]) -> Self {
        Self(xxh64(key, 0))
    }

    /// Wrap a raw ring position
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Raw 64-bit value
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Bucket id: the top `log_bucket_num` bits of the fingerprint
    #[must_use]
    pub const fn bucket_id(self, log_bucket_num: u32) -> BucketId {
        if log_bucket_num == 0 {
            BucketId(0)
        } else {
            BucketId(self.0 >> (64 - log_bucket_num))
        }
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({:#018x})", self.0)
    }
}

/// Identifier of a logical bucket (a chain of bucket pages)
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
)]
#[display("{_0}")]
pub struct BucketId(u64);

impl BucketId {
    /// Create from a raw value
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw value
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// First ring position that maps to this bucket
    #[must_use]
    pub const fn ring_start(self, log_bucket_num: u32) -> u64 {
        if log_bucket_num == 0 {
            0
        } else {
            self.0 << (64 - log_bucket_num)
        }
    }
}

/// Operation kinds charged by the admission queue
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum OpKind {
    Get,
    Set,
    Delete,
}

/// Chain shape of one bucket, readable without locking
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketMeta {
    /// Number of pages in the chain, 0 if the bucket does not exist
    pub chain_length: u8,
    /// Number of live items
    pub item_count: u16,
}

impl BucketMeta {
    /// Meta of a bucket that holds nothing
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.chain_length == 0
    }
}

/// Load snapshot of an admission queue
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub capacity: u32,
    pub in_flight: u32,
}

impl QueueInfo {
    /// Capacity not yet charged
    #[must_use]
    pub const fn available(&self) -> u32 {
        self.capacity.saturating_sub(self.in_flight)
    }

    /// Whether an operation of `cost` would be admitted right away
    #[must_use]
    pub const fn can_admit(&self, cost: u32) -> bool {
        self.in_flight + cost <= self.capacity
    }

    /// Pick the index of the least loaded queue among replicas
    ///
    /// Ties keep the earliest index, so a stable replica order gives a
    /// stable choice.
    #[must_use]
    pub fn least_loaded(infos: &[Self]) -> Option<usize> {
        infos
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| a.available().cmp(&b.available()).then(ib.cmp(ia)))
            .map(|(idx, _)| idx)
    }
}
