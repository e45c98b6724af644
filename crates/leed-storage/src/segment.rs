//! In-memory bucket chains
//!
//! A [`Segment`] is the loaded chain of one bucket id (primary bucket plus
//! overflow buckets) together with the lock that guards it. All item
//! manipulation happens here; persisting and committing the result is the
//! job of [`crate::bucket_log::BucketLog`].

use crate::bucket_log::StagedChain;
use crate::lock::{LockMode, SegmentGuard};
use bytes::Bytes;
use leed_common::{BucketId, BucketMeta, ITEMS_PER_BUCKET};

/// Longest chain a bucket may grow to
pub const MAX_CHAIN_LEN: usize = 255;

/// One key and the location of its value in the value log
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Item {
    pub key: Bytes,
    pub value_length: u32,
    pub value_offset: u64,
}

/// Fixed array of item slots; `None` is an empty or tombstoned slot
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Bucket {
    pub items: [Option<Item>; ITEMS_PER_BUCKET],
}

impl Bucket {
    /// Number of occupied slots
    #[must_use]
    pub fn live(&self) -> usize {
        self.items.iter().filter(|slot| slot.is_some()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.iter().all(Option::is_none)
    }
}

/// A chain version persisted in the bucket region
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Chain {
    pub version: u64,
    pub slots: Vec<u64>,
}

/// Locked, loaded chain of one bucket id
///
/// Dropping a segment releases its lock and discards any staged pages.
/// Mutations mark it dirty; a dirty segment must be persisted before it is
/// committed.
#[derive(Debug)]
pub struct Segment {
    pub(crate) bucket_id: BucketId,
    pub(crate) buckets: Vec<Bucket>,
    /// Committed chain this segment was loaded from
    pub(crate) base: Option<Chain>,
    /// Chain written by the last put, not yet committed
    pub(crate) staged: Option<StagedChain>,
    pub(crate) dirty: bool,
    pub(crate) guard: SegmentGuard,
}

impl Segment {
    pub(crate) const fn new(
        bucket_id: BucketId,
        buckets: Vec<Bucket>,
        base: Option<Chain>,
        guard: SegmentGuard,
    ) -> Self {
        Self {
            bucket_id,
            buckets,
            base,
            staged: None,
            dirty: false,
            guard,
        }
    }

    #[must_use]
    pub const fn bucket_id(&self) -> BucketId {
        self.bucket_id
    }

    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether a put is waiting for commit
    #[must_use]
    pub const fn is_staged(&self) -> bool {
        self.staged.is_some()
    }

    #[must_use]
    pub fn is_exclusive(&self) -> bool {
        self.guard.mode() == LockMode::Exclusive
    }

    #[must_use]
    pub fn chain_length(&self) -> usize {
        self.buckets.len()
    }

    #[must_use]
    pub fn item_count(&self) -> usize {
        self.buckets.iter().map(Bucket::live).sum()
    }

    #[must_use]
    pub fn meta(&self) -> BucketMeta {
        BucketMeta {
            chain_length: u8::try_from(self.chain_length()).unwrap_or(u8::MAX),
            item_count: u16::try_from(self.item_count()).unwrap_or(u16::MAX),
        }
    }

    #[must_use]
    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Live items in chain order
    pub fn items(&self) -> impl Iterator<Item = &Item> {
        self.buckets.iter().flat_map(|b| b.items.iter().flatten())
    }

    /// Look a key up across the whole chain
    #[must_use]
    pub fn find(&self, key: &[u8]) -> Option<&Item> {
        self.position(key)
            .and_then(|(b, s)| self.buckets[b].items[s].as_ref())
    }

    fn position(&self, key: &[u8]) -> Option<(usize, usize)> {
        self.buckets.iter().enumerate().find_map(|(b, bucket)| {
            bucket
                .items
                .iter()
                .position(|slot| slot.as_ref().is_some_and(|item| item.key.as_ref() == key))
                .map(|s| (b, s))
        })
    }

    /// Point an existing key at a new value; false if the key is absent
    pub fn update(&mut self, key: &[u8], value_length: u32, value_offset: u64) -> bool {
        let Some((b, s)) = self.position(key) else {
            return false;
        };
        if let Some(item) = self.buckets[b].items[s].as_mut() {
            item.value_length = value_length;
            item.value_offset = value_offset;
            self.dirty = true;
        }
        true
    }

    /// Place a new item in the first empty slot; gives the item back when
    /// the chain is full
    pub fn insert(&mut self, item: Item) -> Result<(), Item> {
        let slot = self
            .buckets
            .iter_mut()
            .flat_map(|b| b.items.iter_mut())
            .find(|slot| slot.is_none());
        match slot {
            Some(slot) => {
                *slot = Some(item);
                self.dirty = true;
                Ok(())
            }
            None => Err(item),
        }
    }

    /// Append an empty overflow bucket
    pub(crate) fn push_bucket(&mut self) {
        self.buckets.push(Bucket::default());
        self.dirty = true;
    }

    /// Tombstone a key and repack the chain
    pub fn remove(&mut self, key: &[u8]) -> Option<Item> {
        let (b, s) = self.position(key)?;
        let item = self.buckets[b].items[s].take();
        self.dirty = true;
        self.fill_holes();
        item
    }

    /// Move items from the last bucket into holes of the buckets before it,
    /// then release the last bucket if it ended up empty. The primary bucket
    /// is never released.
    pub(crate) fn fill_holes(&mut self) {
        let n = self.buckets.len();
        if n < 2 {
            return;
        }
        let (front, last) = self.buckets.split_at_mut(n - 1);
        let last = &mut last[0];

        'holes: for hole in front.iter_mut().flat_map(|b| b.items.iter_mut()) {
            if hole.is_some() {
                continue;
            }
            let Some(source) = last.items.iter_mut().rev().find(|slot| slot.is_some()) else {
                break 'holes;
            };
            *hole = source.take();
        }

        if self.buckets.last().is_some_and(Bucket::is_empty) {
            self.buckets.pop();
        }
    }
}
