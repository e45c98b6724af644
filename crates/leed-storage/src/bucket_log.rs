//! Bucket log: the persistent hash index
//!
//! Bucket chains live in 4KB page slots of the bucket region. The directory
//! mapping bucket ids to their committed chain is kept in memory and rebuilt
//! by scanning the region on open.
//!
//! Persisting a segment is copy-on-write: `put` writes the whole chain into
//! fresh slots under a new version, `commit` switches the directory to them
//! and frees the old slots, `abort` invalidates and frees the new ones.
//! Staged pages that are neither committed nor aborted are invalidated when
//! their segment is dropped. A crash between put and commit leaves two valid
//! chains on disk; the scan keeps the newest complete one.

use crate::bitmap::SlotBitmap;
use crate::device::BlockDevice;
use crate::layout::{PAGE_SIZE, RegionLayout};
use crate::lock::{LockMode, SegmentGuard, SegmentLocks};
use crate::page::{self, PageHeader};
use crate::segment::{Bucket, Chain, Item, MAX_CHAIN_LEN, Segment};
use bytes::Bytes;
use futures::future::{join_all, try_join_all};
use leed_common::{BucketId, BucketMeta, Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Page slots read per device request while scanning
const SCAN_CHUNK_SLOTS: u64 = 64;

#[derive(Clone, Debug)]
struct DirEntry {
    chain: Chain,
    item_count: u16,
}

#[derive(Debug)]
struct Directory {
    entries: HashMap<BucketId, DirEntry>,
    slots: SlotBitmap,
    next_version: u64,
}

/// State shared with staged chains so they can clean up after themselves
struct Shared {
    device: Arc<dyn BlockDevice>,
    layout: RegionLayout,
    salt: u32,
    directory: Mutex<Directory>,
}

impl Shared {
    async fn invalidate(&self, slots: &[u64]) -> Result<()> {
        let zero = Bytes::from(vec![0u8; PAGE_SIZE as usize]);
        try_join_all(
            slots
                .iter()
                .map(|&slot| self.device.write(self.layout.slot_block(slot), zero.clone())),
        )
        .await?;
        Ok(())
    }

    fn free_slots(&self, slots: &[u64]) {
        let mut dir = self.directory.lock();
        for &slot in slots {
            dir.slots.free(slot);
        }
    }

    /// Invalidate discarded pages, then give their slots back
    async fn discard(&self, bucket_id: BucketId, slots: &[u64]) {
        if let Err(e) = self.invalidate(slots).await {
            warn!(
                "Failed to invalidate discarded pages of bucket {}: {}",
                bucket_id, e
            );
        }
        self.free_slots(slots);
    }
}

/// Pages written by a put and not yet committed
///
/// Dropping it invalidates the pages and frees their slots on a background
/// task, so an abandoned write can neither leak slots nor win the scan on
/// the next open.
pub(crate) struct StagedChain {
    bucket_id: BucketId,
    chain: Option<Chain>,
    log: Arc<Shared>,
}

impl StagedChain {
    fn into_chain(mut self) -> Option<Chain> {
        self.chain.take()
    }
}

impl fmt::Debug for StagedChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagedChain")
            .field("bucket_id", &self.bucket_id)
            .field("chain", &self.chain)
            .finish_non_exhaustive()
    }
}

impl Drop for StagedChain {
    fn drop(&mut self) {
        let Some(chain) = self.chain.take() else {
            return;
        };
        debug!(
            "Discarding {} staged pages of bucket {}",
            chain.slots.len(),
            self.bucket_id
        );
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let log = Arc::clone(&self.log);
            let bucket_id = self.bucket_id;
            handle.spawn(async move { log.discard(bucket_id, &chain.slots).await });
        } else {
            warn!(
                "Staged pages of bucket {} dropped outside a runtime, freed without invalidation",
                self.bucket_id
            );
            self.log.free_slots(&chain.slots);
        }
    }
}

/// Occupancy summary of the bucket region
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BucketLogInfo {
    pub buckets: u64,
    pub items: u64,
    pub used_slots: u64,
    pub free_slots: u64,
}

/// Persistent bucket table of one store
pub struct BucketLog {
    shared: Arc<Shared>,
    locks: SegmentLocks,
    value_tail: Option<(u64, u32)>,
}

impl BucketLog {
    /// Start with an empty table on a freshly formatted device
    #[must_use]
    pub fn format(device: Arc<dyn BlockDevice>, layout: RegionLayout, salt: u32) -> Self {
        let directory = Directory {
            entries: HashMap::new(),
            slots: SlotBitmap::new(layout.bucket_slots),
            next_version: 1,
        };
        Self::assemble(device, layout, salt, directory, None)
    }

    fn assemble(
        device: Arc<dyn BlockDevice>,
        layout: RegionLayout,
        salt: u32,
        directory: Directory,
        value_tail: Option<(u64, u32)>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                device,
                layout,
                salt,
                directory: Mutex::new(directory),
            }),
            locks: SegmentLocks::new(),
            value_tail,
        }
    }

    /// Rebuild the directory by scanning the bucket region
    ///
    /// # Errors
    /// Returns an error if the region cannot be read.
    pub async fn open(device: Arc<dyn BlockDevice>, layout: RegionLayout, salt: u32) -> Result<Self> {
        // (bucket id, version) -> pages seen for that chain version
        let mut chains: HashMap<(BucketId, u64), ScannedChain> = HashMap::new();
        let page_blocks = layout.page_blocks();
        let page_len = PAGE_SIZE as usize;

        let mut slot = 0;
        while slot < layout.bucket_slots {
            let count = SCAN_CHUNK_SLOTS.min(layout.bucket_slots - slot);
            let data = device
                .read(layout.slot_block(slot), count * page_blocks)
                .await?;
            for i in 0..count {
                let at = i as usize * page_len;
                let Ok((header, bucket)) = page::decode(salt, &data[at..at + page_len]) else {
                    continue;
                };
                let chain = chains
                    .entry((header.bucket_id, header.version))
                    .or_insert_with(|| ScannedChain::new(header.chain_length));
                chain.add(header, slot + i, &bucket);
            }
            slot += count;
        }

        let mut entries: HashMap<BucketId, DirEntry> = HashMap::new();
        let mut tails: HashMap<BucketId, Option<(u64, u32)>> = HashMap::new();
        let mut next_version = 1;
        for ((bucket_id, version), scanned) in chains {
            next_version = next_version.max(version + 1);
            let Some((slots, item_count, tail)) = scanned.complete() else {
                continue;
            };
            let newer = entries
                .get(&bucket_id)
                .is_none_or(|existing| existing.chain.version < version);
            if newer {
                entries.insert(
                    bucket_id,
                    DirEntry {
                        chain: Chain { version, slots },
                        item_count,
                    },
                );
                tails.insert(bucket_id, tail);
            }
        }
        let value_tail = tails
            .into_values()
            .flatten()
            .max_by_key(|&(offset, _)| offset);

        let mut bitmap = SlotBitmap::new(layout.bucket_slots);
        for entry in entries.values() {
            for &slot in &entry.chain.slots {
                bitmap.mark_used(slot);
            }
        }

        info!(
            "Bucket log opened: {} buckets, {} of {} slots in use",
            entries.len(),
            layout.bucket_slots - bitmap.free_count(),
            layout.bucket_slots
        );

        let directory = Directory {
            entries,
            slots: bitmap,
            next_version,
        };
        Ok(Self::assemble(device, layout, salt, directory, value_tail))
    }

    /// Committed item whose value lies furthest into the value log, as found
    /// by the scan on open
    ///
    /// Returns `(value_offset, value_length)`; `None` for a formatted log or
    /// an empty table.
    #[must_use]
    pub const fn value_tail(&self) -> Option<(u64, u32)> {
        self.value_tail
    }

    /// Lock table shared by everything that touches this log
    #[must_use]
    pub const fn locks(&self) -> &SegmentLocks {
        &self.locks
    }

    /// Lock one bucket id exclusively and load its chain
    ///
    /// # Errors
    /// Returns an error if the chain cannot be read.
    pub async fn lock(&self, id: BucketId) -> Result<Segment> {
        let guard = self.locks.acquire(id, LockMode::Exclusive).await?;
        self.load(guard).await
    }

    /// Lock the deduplicated set of ids exclusively and load their chains
    ///
    /// Segments come back sorted by bucket id.
    ///
    /// # Errors
    /// Returns an error if any chain cannot be read; all locks are released.
    pub async fn lock_many(&self, ids: &[BucketId]) -> Result<Vec<Segment>> {
        let guards = self.locks.acquire_many(ids).await?;
        try_join_all(guards.into_iter().map(|guard| self.load(guard))).await
    }

    /// Take shared access to a bucket id and load its chain
    ///
    /// # Errors
    /// Returns an error if the chain cannot be read.
    pub async fn read(&self, id: BucketId) -> Result<Segment> {
        let guard = self.locks.acquire(id, LockMode::Shared).await?;
        self.load(guard).await
    }

    async fn load(&self, guard: SegmentGuard) -> Result<Segment> {
        let shared = &self.shared;
        let id = guard.id();
        let base = shared
            .directory
            .lock()
            .entries
            .get(&id)
            .map(|entry| entry.chain.clone());

        let Some(chain) = base else {
            return Ok(Segment::new(id, Vec::new(), None, guard));
        };

        let pages = try_join_all(chain.slots.iter().map(|&slot| {
            shared
                .device
                .read(shared.layout.slot_block(slot), shared.layout.page_blocks())
        }))
        .await?;

        let mut buckets = Vec::with_capacity(pages.len());
        for (index, data) in pages.iter().enumerate() {
            let (header, bucket) = page::decode(shared.salt, data)?;
            if header.bucket_id != id
                || header.version != chain.version
                || usize::from(header.chain_index) != index
            {
                return Err(Error::corruption(format!(
                    "slot {} holds {}@v{} index {}, expected {id}@v{} index {index}",
                    chain.slots[index],
                    header.bucket_id,
                    header.version,
                    header.chain_index,
                    chain.version
                )));
            }
            buckets.push(bucket);
        }

        Ok(Segment::new(id, buckets, Some(chain), guard))
    }

    /// Insert or update an item, growing the chain when every slot is taken
    ///
    /// # Errors
    /// Returns [`Error::NoSpace`] if the chain cannot grow.
    pub fn upsert(&self, segment: &mut Segment, key: Bytes, value_length: u32, value_offset: u64) -> Result<()> {
        if segment.update(&key, value_length, value_offset) {
            return Ok(());
        }
        let item = Item {
            key,
            value_length,
            value_offset,
        };
        match segment.insert(item) {
            Ok(()) => Ok(()),
            Err(item) => {
                self.alloc_extra(segment)?;
                segment
                    .insert(item)
                    .map_err(|_| Error::internal("fresh overflow bucket has no free slot"))
            }
        }
    }

    /// Append an overflow bucket to a full chain
    fn alloc_extra(&self, segment: &mut Segment) -> Result<()> {
        let new_len = segment.chain_length() + 1;
        if new_len > MAX_CHAIN_LEN {
            return Err(Error::no_space(format!(
                "chain of bucket {} is at its maximum length",
                segment.bucket_id()
            )));
        }
        // Persisting writes the whole chain to fresh slots.
        let free = self.shared.directory.lock().slots.free_count();
        if new_len as u64 > free {
            return Err(Error::no_space(format!(
                "bucket region has {free} free slots, chain of {} needs {new_len}",
                segment.bucket_id()
            )));
        }
        segment.push_bucket();
        debug!("Bucket {} extended to {} pages", segment.bucket_id(), new_len);
        Ok(())
    }

    /// Write a dirty segment's chain to fresh slots
    ///
    /// # Errors
    /// Returns [`Error::NoSpace`] if the slots cannot be allocated, or a
    /// device error; on error nothing stays allocated.
    pub async fn put(&self, segment: &mut Segment) -> Result<()> {
        if !segment.is_exclusive() {
            return Err(Error::invalid_argument(format!(
                "put of bucket {} under a shared lock",
                segment.bucket_id()
            )));
        }
        if !segment.is_dirty() {
            return Ok(());
        }
        let chain_length = u8::try_from(segment.chain_length())
            .map_err(|_| Error::internal("chain longer than 255 pages"))?;

        // A second put before commit supersedes the first.
        if let Some(previous) = segment.staged.take() {
            self.discard(previous).await;
        }

        let chain = {
            let mut dir = self.shared.directory.lock();
            let slots = dir
                .slots
                .allocate_many(segment.chain_length())
                .ok_or_else(|| {
                    Error::no_space(format!(
                        "no free slots for the {chain_length}-page chain of bucket {}",
                        segment.bucket_id()
                    ))
                })?;
            let version = dir.next_version;
            dir.next_version += 1;
            Chain { version, slots }
        };
        // Owns the slots from here on, also if this future is dropped.
        let staged = StagedChain {
            bucket_id: segment.bucket_id,
            chain: Some(chain.clone()),
            log: Arc::clone(&self.shared),
        };

        let shared = &self.shared;
        let writes = segment.buckets.iter().enumerate().map(|(index, bucket)| {
            let header = PageHeader {
                bucket_id: segment.bucket_id,
                version: chain.version,
                chain_index: index as u8,
                chain_length,
            };
            let data = page::encode(shared.salt, &header, bucket);
            shared
                .device
                .write(shared.layout.slot_block(chain.slots[index]), data)
        });

        if let Err(e) = try_join_all(writes).await {
            warn!("Failed to persist bucket {}: {}", segment.bucket_id(), e);
            self.discard(staged).await;
            return Err(e);
        }

        segment.staged = Some(staged);
        segment.dirty = false;
        Ok(())
    }

    /// Persist several segments concurrently
    ///
    /// Every put runs to completion. If any fails, the pages staged by the
    /// others are discarded too, so the batch persists all or nothing.
    ///
    /// # Errors
    /// Returns the first failure.
    pub async fn put_bulk(&self, segments: &mut [Segment]) -> Result<()> {
        let results = join_all(segments.iter_mut().map(|segment| self.put(segment))).await;
        let Some(err) = results.into_iter().find_map(Result::err) else {
            return Ok(());
        };
        for segment in segments.iter_mut() {
            if let Some(staged) = segment.staged.take() {
                self.discard(staged).await;
            }
        }
        Err(err)
    }

    /// Make a persisted segment authoritative and release its lock
    pub fn commit(&self, mut segment: Segment) {
        let Some(staged) = segment.staged.take().and_then(StagedChain::into_chain) else {
            return;
        };
        let item_count = segment.meta().item_count;
        let mut dir = self.shared.directory.lock();
        let previous = dir.entries.insert(
            segment.bucket_id,
            DirEntry {
                chain: staged,
                item_count,
            },
        );
        if let Some(previous) = previous {
            for slot in previous.chain.slots {
                dir.slots.free(slot);
            }
        }
    }

    /// Drop a segment without committing, invalidating any staged pages
    pub async fn abort(&self, mut segment: Segment) {
        if let Some(staged) = segment.staged.take() {
            self.discard(staged).await;
        }
    }

    /// Invalidate and free a staged chain before returning
    async fn discard(&self, mut staged: StagedChain) {
        let Some(slots) = staged.chain.as_ref().map(|chain| chain.slots.clone()) else {
            return;
        };
        if let Err(e) = self.shared.invalidate(&slots).await {
            warn!(
                "Failed to invalidate discarded pages of bucket {}: {}",
                staged.bucket_id, e
            );
        }
        // Cancelled before this point, the drop finishes the job instead.
        staged.chain = None;
        self.shared.free_slots(&slots);
    }

    /// Chain shape of a bucket, without locking it
    #[must_use]
    pub fn get_meta(&self, id: BucketId) -> BucketMeta {
        self.shared
            .directory
            .lock()
            .entries
            .get(&id)
            .map(|entry| BucketMeta {
                chain_length: entry.chain.slots.len() as u8,
                item_count: entry.item_count,
            })
            .unwrap_or_default()
    }

    /// Overwrite a bucket's metadata
    ///
    /// An empty meta purges the bucket: its pages are invalidated and its
    /// slots freed. Otherwise the chain length must match and only the item
    /// count is updated.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] for a mismatched chain length.
    pub async fn put_meta(&self, id: BucketId, meta: BucketMeta) -> Result<()> {
        let _guard = self.locks.acquire(id, LockMode::Exclusive).await?;

        if !meta.is_empty() {
            let mut dir = self.shared.directory.lock();
            let entry = dir.entries.get_mut(&id).ok_or_else(|| {
                Error::invalid_argument(format!("bucket {id} does not exist"))
            })?;
            if entry.chain.slots.len() != usize::from(meta.chain_length) {
                return Err(Error::invalid_argument(format!(
                    "bucket {id} has {} pages, meta says {}",
                    entry.chain.slots.len(),
                    meta.chain_length
                )));
            }
            entry.item_count = meta.item_count;
            return Ok(());
        }

        let removed = self.shared.directory.lock().entries.remove(&id);
        if let Some(entry) = removed {
            self.shared.invalidate(&entry.chain.slots).await?;
            self.shared.free_slots(&entry.chain.slots);
            debug!("Bucket {} purged", id);
        }
        Ok(())
    }

    /// Ids of all existing buckets, ascending
    #[must_use]
    pub fn bucket_ids(&self) -> Vec<BucketId> {
        let mut ids: Vec<_> = self.shared.directory.lock().entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    #[must_use]
    pub fn info(&self) -> BucketLogInfo {
        let dir = self.shared.directory.lock();
        BucketLogInfo {
            buckets: dir.entries.len() as u64,
            items: dir.entries.values().map(|e| u64::from(e.item_count)).sum(),
            used_slots: dir.slots.total() - dir.slots.free_count(),
            free_slots: dir.slots.free_count(),
        }
    }
}

/// Pages of one (bucket id, version) found by the scan
struct ScannedChain {
    slots: Vec<Option<u64>>,
    items: usize,
    /// Item with the highest value offset
    tail: Option<(u64, u32)>,
}

impl ScannedChain {
    fn new(chain_length: u8) -> Self {
        Self {
            slots: vec![None; usize::from(chain_length)],
            items: 0,
            tail: None,
        }
    }

    fn add(&mut self, header: PageHeader, slot: u64, bucket: &Bucket) {
        let index = usize::from(header.chain_index);
        if usize::from(header.chain_length) != self.slots.len() || self.slots[index].is_some() {
            return;
        }
        self.slots[index] = Some(slot);
        self.items += bucket.live();
        for item in bucket.items.iter().flatten() {
            if self.tail.is_none_or(|(offset, _)| offset < item.value_offset) {
                self.tail = Some((item.value_offset, item.value_length));
            }
        }
    }

    fn complete(self) -> Option<(Vec<u64>, u16, Option<(u64, u32)>)> {
        let slots: Option<Vec<u64>> = self.slots.into_iter().collect();
        slots.map(|slots| (slots, u16::try_from(self.items).unwrap_or(u16::MAX), self.tail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use leed_common::ITEMS_PER_BUCKET;
    use leed_common::config::StoreConfig;

    fn setup(num_buckets: u64) -> (Arc<MemDevice>, RegionLayout, BucketLog) {
        let config = StoreConfig {
            num_buckets,
            log_bucket_num: 4,
            value_log_blocks: Some(16),
            ..StoreConfig::default()
        };
        let device = Arc::new(MemDevice::new(4096, 256));
        let layout = RegionLayout::compute(4096, 256, &config).unwrap();
        let log = BucketLog::format(device.clone(), layout, 0x5EED);
        (device, layout, log)
    }

    fn key(i: usize) -> Bytes {
        Bytes::from(format!("key-{i}"))
    }

    async fn insert(log: &BucketLog, id: BucketId, range: std::ops::Range<usize>) {
        let mut seg = log.lock(id).await.unwrap();
        for i in range {
            log.upsert(&mut seg, key(i), 8, i as u64 * 4096).unwrap();
        }
        log.put(&mut seg).await.unwrap();
        log.commit(seg);
    }

    #[tokio::test]
    async fn test_put_commit_and_reload() {
        let (_dev, _layout, log) = setup(8);
        let id = BucketId::new(3);

        insert(&log, id, 0..3).await;
        assert_eq!(
            log.get_meta(id),
            BucketMeta {
                chain_length: 1,
                item_count: 3
            }
        );

        let seg = log.read(id).await.unwrap();
        assert_eq!(seg.item_count(), 3);
        assert_eq!(seg.find(b"key-1").unwrap().value_offset, 4096);
        assert!(!seg.is_exclusive());
    }

    #[tokio::test]
    async fn test_overflow_chain() {
        let (_dev, _layout, log) = setup(8);
        let id = BucketId::new(0);

        insert(&log, id, 0..ITEMS_PER_BUCKET + 1).await;
        assert_eq!(log.get_meta(id).chain_length, 2);
        assert_eq!(log.info().used_slots, 2);

        let seg = log.read(id).await.unwrap();
        assert_eq!(seg.buckets()[0].live(), ITEMS_PER_BUCKET);
        assert_eq!(seg.buckets()[1].live(), 1);
    }

    #[tokio::test]
    async fn test_abort_discards_staged_chain() {
        let (_dev, _layout, log) = setup(8);
        let id = BucketId::new(1);
        insert(&log, id, 0..2).await;

        let mut seg = log.lock(id).await.unwrap();
        log.upsert(&mut seg, key(9), 8, 0).unwrap();
        log.put(&mut seg).await.unwrap();
        assert_eq!(log.info().used_slots, 2);
        log.abort(seg).await;

        assert_eq!(log.info().used_slots, 1);
        let seg = log.read(id).await.unwrap();
        assert!(seg.find(b"key-9").is_none());
        assert_eq!(seg.item_count(), 2);
    }

    #[tokio::test]
    async fn test_no_space_when_slots_exhausted() {
        // 2 buckets -> 4 page slots
        let (_dev, _layout, log) = setup(2);
        let id = BucketId::new(0);
        insert(&log, id, 0..ITEMS_PER_BUCKET * 2).await;
        assert_eq!(log.info().used_slots, 2);

        let mut seg = log.lock(id).await.unwrap();
        // Growing to 3 pages needs 3 free slots; only 2 are left.
        let err = log.upsert(&mut seg, key(100), 8, 0).unwrap_err();
        assert!(err.is_no_space());
    }

    #[tokio::test]
    async fn test_reopen_rebuilds_directory() {
        let (dev, layout, log) = setup(8);
        insert(&log, BucketId::new(2), 0..ITEMS_PER_BUCKET + 2).await;
        insert(&log, BucketId::new(5), 20..21).await;
        // Rewrite bucket 5 so an older version sits on disk too.
        insert(&log, BucketId::new(5), 21..22).await;

        let reopened = BucketLog::open(dev, layout, 0x5EED).await.unwrap();
        assert_eq!(reopened.bucket_ids(), vec![BucketId::new(2), BucketId::new(5)]);
        assert_eq!(reopened.get_meta(BucketId::new(2)).chain_length, 2);
        assert_eq!(reopened.get_meta(BucketId::new(5)).item_count, 2);
        assert_eq!(reopened.info().used_slots, 3);
        assert_eq!(log.value_tail(), None);
        assert_eq!(reopened.value_tail(), Some((21 * 4096, 8)));

        let seg = reopened.read(BucketId::new(5)).await.unwrap();
        assert!(seg.find(b"key-20").is_some());
        assert!(seg.find(b"key-21").is_some());
    }

    #[tokio::test]
    async fn test_reopen_ignores_other_salt() {
        let (dev, layout, log) = setup(8);
        insert(&log, BucketId::new(2), 0..1).await;
        let reopened = BucketLog::open(dev, layout, 0x0BAD).await.unwrap();
        assert!(reopened.bucket_ids().is_empty());
    }

    #[tokio::test]
    async fn test_put_meta_purges_bucket() {
        let (dev, layout, log) = setup(8);
        let id = BucketId::new(4);
        insert(&log, id, 0..3).await;

        let err = log
            .put_meta(
                id,
                BucketMeta {
                    chain_length: 2,
                    item_count: 0,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        log.put_meta(id, BucketMeta::default()).await.unwrap();
        assert!(log.get_meta(id).is_empty());
        assert_eq!(log.info().used_slots, 0);

        let reopened = BucketLog::open(dev, layout, 0x5EED).await.unwrap();
        assert!(reopened.get_meta(id).is_empty());
    }

    #[tokio::test]
    async fn test_dropped_segment_discards_staged_pages() {
        let (dev, layout, log) = setup(8);
        let id = BucketId::new(1);
        insert(&log, id, 0..2).await;

        let mut seg = log.lock(id).await.unwrap();
        log.upsert(&mut seg, key(9), 8, 0).unwrap();
        log.put(&mut seg).await.unwrap();
        assert_eq!(log.info().used_slots, 2);
        drop(seg);

        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while log.info().used_slots != 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let reopened = BucketLog::open(dev, layout, 0x5EED).await.unwrap();
        let seg = reopened.read(id).await.unwrap();
        assert!(seg.find(b"key-9").is_none());
        assert_eq!(seg.item_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_put_bulk_discards_every_staged_chain() {
        let (dev, layout, log) = setup(8);
        let ids = [BucketId::new(1), BucketId::new(2), BucketId::new(3)];
        let mut segments = log.lock_many(&ids).await.unwrap();
        for (i, seg) in segments.iter_mut().enumerate() {
            log.upsert(seg, key(i), 8, 0).unwrap();
        }

        // The first two chains persist, the third page write fails.
        dev.fail_nth_write(3);
        assert!(log.put_bulk(&mut segments).await.is_err());
        assert!(segments.iter().all(|seg| !seg.is_staged()));
        assert_eq!(log.info().used_slots, 0);
        drop(segments);

        let reopened = BucketLog::open(dev, layout, 0x5EED).await.unwrap();
        assert!(reopened.bucket_ids().is_empty());
        assert_eq!(reopened.info().used_slots, 0);
    }

    #[tokio::test]
    async fn test_failed_put_leaves_nothing_allocated() {
        let (dev, _layout, log) = setup(8);
        let id = BucketId::new(6);
        let mut seg = log.lock(id).await.unwrap();
        log.upsert(&mut seg, key(1), 8, 0).unwrap();

        dev.set_fail_writes(true);
        assert!(log.put(&mut seg).await.is_err());
        dev.set_fail_writes(false);

        assert_eq!(log.info().used_slots, 0);
        drop(seg);
        assert!(log.get_meta(id).is_empty());
    }
}
