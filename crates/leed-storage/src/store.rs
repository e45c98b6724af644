//! Storage engine of one shard
//!
//! A [`DataStore`] owns one device: its bucket log, value log, admission
//! queue and dirty-key set. Writes return a [`PendingWrite`] that keeps the
//! touched segments locked until the caller decides to commit or discard,
//! so a replicated write only becomes visible once the rest of the chain
//! agreed.

use crate::bucket_log::{BucketLog, BucketLogInfo};
use crate::device::BlockDevice;
use crate::dirty::DirtyKeys;
use crate::layout::{RegionLayout, SUPERBLOCK_SIZE, Superblock};
use crate::queue::AdmissionQueue;
use crate::segment::Segment;
use crate::value_log::ValueLog;
use bytes::Bytes;
use leed_common::config::StoreConfig;
use leed_common::{BucketId, BucketMeta, Error, Fingerprint, OpKind, QueueInfo, Result, validate_key};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Operation counters of one store
#[derive(Debug, Default)]
pub struct StoreStats {
    pub sets: AtomicU64,
    pub buffered_sets: AtomicU64,
    pub buffered_items: AtomicU64,
    pub gets: AtomicU64,
    pub deletes: AtomicU64,
    pub not_found: AtomicU64,
    pub no_space: AtomicU64,
    pub failures: AtomicU64,
    /// Distinct segments locked by write operations
    pub segments_locked: AtomicU64,
    pub commits: AtomicU64,
    pub aborts: AtomicU64,
}

impl StoreStats {
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Occupancy snapshot of a store
#[derive(Clone, Debug, Serialize)]
pub struct StoreInfo {
    pub ds_id: u32,
    pub buckets: u64,
    pub items: u64,
    pub used_slots: u64,
    pub free_slots: u64,
    pub value_log_used: u64,
    pub value_log_capacity: u64,
    pub queue: QueueInfo,
    pub dirty_keys: usize,
}

/// Findings of a full verification pass
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyReport {
    pub buckets: u64,
    pub pages: u64,
    pub items: u64,
    pub value_bytes: u64,
    /// Buckets whose chain could not be loaded
    pub bad_buckets: Vec<(u64, String)>,
    /// Items whose value could not be read back, or that sit in the wrong bucket
    pub bad_items: Vec<(String, String)>,
}

impl VerifyReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.bad_buckets.is_empty() && self.bad_items.is_empty()
    }
}

pub(crate) struct StoreInner {
    config: StoreConfig,
    superblock: Superblock,
    device: Arc<dyn BlockDevice>,
    pub(crate) bucket_log: BucketLog,
    pub(crate) value_log: ValueLog,
    queue: AdmissionQueue,
    dirty: DirtyKeys,
    stats: StoreStats,
}

/// Storage engine over one device
#[derive(Clone)]
pub struct DataStore {
    pub(crate) inner: Arc<StoreInner>,
}

impl DataStore {
    /// Format a device and start an empty store on it
    ///
    /// # Errors
    /// Returns [`Error::InsufficientCapacity`] if the layout does not fit
    /// the device, or a configuration or device error.
    pub async fn format(device: Arc<dyn BlockDevice>, config: &StoreConfig, ds_id: u32) -> Result<Self> {
        config.validate()?;
        let layout = RegionLayout::compute(device.block_size(), device.num_blocks(), config)?;
        let superblock = Superblock::new(ds_id, config, layout);

        device.write(0, superblock.to_bytes()).await?;
        device.flush().await?;

        let salt = superblock.salt();
        let bucket_log = BucketLog::format(Arc::clone(&device), layout, salt);
        let value_log = ValueLog::format(Arc::clone(&device), &layout, salt, config.compact_buf_len);

        info!(
            "Formatted store {} ({}): {} bucket slots, {} value log blocks",
            ds_id, superblock.store_uuid, layout.bucket_slots, layout.value.blocks
        );
        Ok(Self::assemble(config, superblock, device, bucket_log, value_log))
    }

    /// Open a formatted device
    ///
    /// # Errors
    /// Returns [`Error::Corruption`] for a bad superblock,
    /// [`Error::Configuration`] if the device was formatted with another
    /// geometry, or a device error.
    pub async fn open(device: Arc<dyn BlockDevice>, config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let superblock = Self::probe(device.as_ref()).await?;
        superblock.validate(config, device.block_size(), device.num_blocks())?;

        let salt = superblock.salt();
        let layout = superblock.layout;
        let bucket_log = BucketLog::open(Arc::clone(&device), layout, salt).await?;
        let value_log = ValueLog::open(Arc::clone(&device), &layout, salt, config.compact_buf_len).await?;
        // The record scan stops at the first hole a failed write left behind;
        // committed items may point past it.
        if let Some((offset, length)) = bucket_log.value_tail() {
            let end = offset + value_log.record_len(length as usize);
            if value_log.advance_cursor(end) {
                warn!(
                    "Value log scan stopped below committed data, cursor moved to {}",
                    end
                );
            }
        }

        info!(
            "Opened store {} ({}), created at {}",
            superblock.ds_id, superblock.store_uuid, superblock.created_at
        );
        Ok(Self::assemble(config, superblock, device, bucket_log, value_log))
    }

    /// Read and check the superblock of a device without opening it
    ///
    /// # Errors
    /// Returns [`Error::Corruption`] if the device holds no valid superblock.
    pub async fn probe(device: &dyn BlockDevice) -> Result<Superblock> {
        let sb_blocks = SUPERBLOCK_SIZE / u64::from(device.block_size());
        let data = device.read(0, sb_blocks.max(1)).await?;
        Superblock::from_bytes(&data)
    }

    fn assemble(
        config: &StoreConfig,
        superblock: Superblock,
        device: Arc<dyn BlockDevice>,
        bucket_log: BucketLog,
        value_log: ValueLog,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                config: config.clone(),
                superblock,
                device,
                bucket_log,
                value_log,
                queue: AdmissionQueue::new(&config.admission),
                dirty: DirtyKeys::new(),
                stats: StoreStats::default(),
            }),
        }
    }

    /// Shard id recorded in the superblock
    #[must_use]
    pub fn ds_id(&self) -> u32 {
        self.inner.superblock.ds_id
    }

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.inner.superblock
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn log_bucket_num(&self) -> u32 {
        self.inner.superblock.log_bucket_num
    }

    /// Bucket id a key hashes to
    #[must_use]
    pub fn bucket_id(&self, key: &[u8]) -> BucketId {
        Fingerprint::of(key).bucket_id(self.log_bucket_num())
    }

    #[must_use]
    pub fn queue(&self) -> &AdmissionQueue {
        &self.inner.queue
    }

    #[must_use]
    pub fn queue_info(&self) -> QueueInfo {
        self.inner.queue.info()
    }

    #[must_use]
    pub fn dirty(&self) -> &DirtyKeys {
        &self.inner.dirty
    }

    #[must_use]
    pub fn stats(&self) -> &StoreStats {
        &self.inner.stats
    }

    #[must_use]
    pub fn bucket_log(&self) -> &BucketLog {
        &self.inner.bucket_log
    }

    #[must_use]
    pub fn value_log(&self) -> &ValueLog {
        &self.inner.value_log
    }

    /// Chain shape of a bucket, without locking it
    #[must_use]
    pub fn bucket_meta(&self, id: BucketId) -> BucketMeta {
        self.inner.bucket_log.get_meta(id)
    }

    #[must_use]
    pub fn info(&self) -> StoreInfo {
        let BucketLogInfo {
            buckets,
            items,
            used_slots,
            free_slots,
        } = self.inner.bucket_log.info();
        StoreInfo {
            ds_id: self.ds_id(),
            buckets,
            items,
            used_slots,
            free_slots,
            value_log_used: self.inner.value_log.cursor(),
            value_log_capacity: self.inner.value_log.capacity(),
            queue: self.queue_info(),
            dirty_keys: self.inner.dirty.len(),
        }
    }

    /// Make completed writes durable
    ///
    /// # Errors
    /// Returns a device error.
    pub async fn flush(&self) -> Result<()> {
        self.inner.device.flush().await
    }

    /// Check that a key and value can be stored, without storing them
    ///
    /// # Errors
    /// Returns [`Error::InvalidKey`] or [`Error::ValueTooLarge`].
    pub fn validate_entry(&self, key: &[u8], value: &[u8]) -> Result<()> {
        validate_key(key)?;
        self.check_value(value).map(|_| ())
    }

    fn check_value(&self, value: &[u8]) -> Result<u32> {
        let max = self.inner.value_log.max_value_len();
        if value.len() as u64 > max {
            return Err(Error::ValueTooLarge {
                len: value.len(),
                max,
            });
        }
        u32::try_from(value.len()).map_err(|_| Error::ValueTooLarge {
            len: value.len(),
            max,
        })
    }

    fn record_outcome<T>(&self, result: &Result<T>) {
        let stats = &self.inner.stats;
        match result {
            Ok(_) => {}
            Err(e) if e.is_not_found() => StoreStats::bump(&stats.not_found, 1),
            Err(e) if e.is_no_space() => StoreStats::bump(&stats.no_space, 1),
            Err(_) => StoreStats::bump(&stats.failures, 1),
        }
    }

    /// Write a key
    ///
    /// The value write and the segment lock proceed in parallel. Admission
    /// is released once the bucket is persisted; the segment stays locked
    /// until the returned write is committed or discarded.
    ///
    /// # Errors
    /// Returns [`Error::NoSpace`] or [`Error::ValueLogFull`] when out of
    /// space, or a device error. Nothing is mutated on error.
    pub async fn set(&self, key: Bytes, value: Bytes) -> Result<PendingWrite> {
        validate_key(&key)?;
        let value_length = self.check_value(&value)?;
        let inner = &self.inner;
        let bucket_id = self.bucket_id(&key);
        StoreStats::bump(&inner.stats.sets, 1);

        let permit = inner.queue.admit(OpKind::Set).await?;
        let result: Result<Segment> = async {
            let offset = inner.value_log.reserve(value.len())?;
            let (written, locked) = tokio::join!(
                inner.value_log.write(offset, &value, bucket_id),
                inner.bucket_log.lock(bucket_id)
            );
            let mut segment = locked?;
            written?;
            StoreStats::bump(&inner.stats.segments_locked, 1);

            inner
                .bucket_log
                .upsert(&mut segment, key.clone(), value_length, offset)?;
            inner.bucket_log.put(&mut segment).await?;
            Ok(segment)
        }
        .await;
        drop(permit);

        self.record_outcome(&result);
        result.map(|segment| self.pending(vec![segment]))
    }

    /// Write several keys with one value write and one bulk persist
    ///
    /// Locks cover the deduplicated set of bucket ids. The batch is charged
    /// one set. A later duplicate key in the batch wins.
    ///
    /// # Errors
    /// As [`DataStore::set`]; a failure fails the whole batch.
    pub async fn buffered_set(&self, entries: Vec<(Bytes, Bytes)>) -> Result<PendingWrite> {
        if entries.is_empty() {
            return Ok(self.pending(Vec::new()));
        }
        let mut lengths = Vec::with_capacity(entries.len());
        for (key, value) in &entries {
            validate_key(key)?;
            lengths.push(self.check_value(value)?);
        }
        let inner = &self.inner;
        let ids: Vec<BucketId> = entries.iter().map(|(key, _)| self.bucket_id(key)).collect();
        StoreStats::bump(&inner.stats.buffered_sets, 1);
        StoreStats::bump(&inner.stats.buffered_items, entries.len() as u64);

        let permit = inner.queue.admit(OpKind::Set).await?;
        let result: Result<Vec<Segment>> = async {
            let sizes: Vec<usize> = entries.iter().map(|(_, value)| value.len()).collect();
            let offsets = inner.value_log.reserve_batch(&sizes)?;
            let values: Vec<&[u8]> = entries.iter().map(|(_, value)| value.as_ref()).collect();

            let (written, locked) = tokio::join!(
                inner.value_log.write_batch(&offsets, &values, &ids),
                inner.bucket_log.lock_many(&ids)
            );
            let mut segments = locked?;
            written?;
            StoreStats::bump(&inner.stats.segments_locked, segments.len() as u64);

            for (((key, _), &offset), (&id, &length)) in
                entries.iter().zip(&offsets).zip(ids.iter().zip(&lengths))
            {
                let index = segments
                    .binary_search_by_key(&id, Segment::bucket_id)
                    .map_err(|_| Error::internal(format!("bucket {id} missing from locked set")))?;
                inner
                    .bucket_log
                    .upsert(&mut segments[index], key.clone(), length, offset)?;
            }
            inner.bucket_log.put_bulk(&mut segments).await?;
            Ok(segments)
        }
        .await;
        drop(permit);

        debug!("Buffered set of {} keys: {:?}", entries.len(), result.as_ref().map(Vec::len));
        self.record_outcome(&result);
        result.map(|segments| self.pending(segments))
    }

    /// Read a key
    ///
    /// # Errors
    /// Returns [`Error::NotFound`] on a miss, or a device or corruption error.
    pub async fn get(&self, key: &[u8]) -> Result<Bytes> {
        self.get_with_meta(key).await.map(|(value, _)| value)
    }

    /// Read a key together with its bucket's metadata
    ///
    /// The segment stays pinned until the value has been read.
    ///
    /// # Errors
    /// As [`DataStore::get`].
    pub async fn get_with_meta(&self, key: &[u8]) -> Result<(Bytes, BucketMeta)> {
        validate_key(key)?;
        let inner = &self.inner;
        let bucket_id = self.bucket_id(key);
        StoreStats::bump(&inner.stats.gets, 1);

        let permit = inner.queue.admit(OpKind::Get).await?;
        let result: Result<(Bytes, BucketMeta)> = async {
            let segment = inner.bucket_log.read(bucket_id).await?;
            let (offset, length) = segment
                .find(key)
                .map(|item| (item.value_offset, item.value_length))
                .ok_or(Error::NotFound)?;
            let meta = segment.meta();
            let value = inner.value_log.read(offset, length).await?;
            drop(segment);
            Ok((value, meta))
        }
        .await;
        drop(permit);

        self.record_outcome(&result);
        result
    }

    /// Delete a key
    ///
    /// The slot is cleared and the chain repacked; the returned write must
    /// be committed like a set.
    ///
    /// # Errors
    /// Returns [`Error::NotFound`] if the key is absent, or a device error.
    pub async fn delete(&self, key: &[u8]) -> Result<PendingWrite> {
        validate_key(key)?;
        let inner = &self.inner;
        let bucket_id = self.bucket_id(key);
        StoreStats::bump(&inner.stats.deletes, 1);

        let permit = inner.queue.admit(OpKind::Delete).await?;
        let result: Result<Segment> = async {
            let mut segment = inner.bucket_log.lock(bucket_id).await?;
            StoreStats::bump(&inner.stats.segments_locked, 1);
            if segment.remove(key).is_none() {
                return Err(Error::NotFound);
            }
            inner.bucket_log.put(&mut segment).await?;
            Ok(segment)
        }
        .await;
        drop(permit);

        self.record_outcome(&result);
        result.map(|segment| self.pending(vec![segment]))
    }

    fn pending(&self, segments: Vec<Segment>) -> PendingWrite {
        PendingWrite {
            store: Arc::clone(&self.inner),
            segments,
        }
    }

    /// Walk every bucket and value record
    ///
    /// # Errors
    /// Only fails if a bucket lock cannot be taken; read failures are
    /// reported in the returned report.
    pub async fn verify(&self) -> Result<VerifyReport> {
        let inner = &self.inner;
        let mut report = VerifyReport::default();

        for id in inner.bucket_log.bucket_ids() {
            report.buckets += 1;
            let segment = match inner.bucket_log.read(id).await {
                Ok(segment) => segment,
                Err(e) => {
                    report.bad_buckets.push((id.as_u64(), e.to_string()));
                    continue;
                }
            };
            report.pages += segment.chain_length() as u64;

            let items: Vec<_> = segment.items().cloned().collect();
            for item in items {
                report.items += 1;
                let name = String::from_utf8_lossy(&item.key).into_owned();
                if self.bucket_id(&item.key) != id {
                    report
                        .bad_items
                        .push((name, format!("stored in bucket {id}")));
                    continue;
                }
                match inner.value_log.read(item.value_offset, item.value_length).await {
                    Ok(value) => report.value_bytes += value.len() as u64,
                    Err(e) => report.bad_items.push((name, e.to_string())),
                }
            }
        }

        if report.is_clean() {
            info!(
                "Verified store {}: {} buckets, {} items",
                self.ds_id(),
                report.buckets,
                report.items
            );
        } else {
            warn!(
                "Store {} failed verification: {} bad buckets, {} bad items",
                self.ds_id(),
                report.bad_buckets.len(),
                report.bad_items.len()
            );
        }
        Ok(report)
    }
}

/// Persisted but uncommitted write
///
/// Holds the touched segments locked. Commit makes the write visible;
/// discarding throws the persisted pages away. Dropping without either
/// releases the locks and discards the pages in the background.
#[must_use = "a pending write holds segment locks until committed"]
pub struct PendingWrite {
    store: Arc<StoreInner>,
    segments: Vec<Segment>,
}

impl std::fmt::Debug for PendingWrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingWrite")
            .field("segments", &self.segments)
            .finish_non_exhaustive()
    }
}

impl PendingWrite {
    /// Bucket ids held by this write, ascending
    #[must_use]
    pub fn bucket_ids(&self) -> Vec<BucketId> {
        self.segments.iter().map(Segment::bucket_id).collect()
    }

    /// Commit on success, discard otherwise; releases the locks
    pub async fn commit(mut self, success: bool) {
        let segments = std::mem::take(&mut self.segments);
        let stats = &self.store.stats;
        if success {
            for segment in segments {
                self.store.bucket_log.commit(segment);
            }
            StoreStats::bump(&stats.commits, 1);
        } else {
            for segment in segments {
                self.store.bucket_log.abort(segment).await;
            }
            StoreStats::bump(&stats.aborts, 1);
        }
    }
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        if self.segments.is_empty() {
            return;
        }
        warn!(
            "Pending write on {} segments dropped without commit",
            self.segments.len()
        );
        StoreStats::bump(&self.store.stats.aborts, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use leed_common::ITEMS_PER_BUCKET;

    fn config() -> StoreConfig {
        StoreConfig {
            num_buckets: 16,
            log_bucket_num: 4,
            value_log_blocks: Some(512),
            ..StoreConfig::default()
        }
    }

    async fn store() -> (Arc<MemDevice>, DataStore) {
        let device = Arc::new(MemDevice::new(4096, 1024));
        let store = DataStore::format(device.clone(), &config(), 0).await.unwrap();
        (device, store)
    }

    async fn put(store: &DataStore, key: &str, value: &str) {
        store
            .set(Bytes::from(key.to_string()), Bytes::from(value.to_string()))
            .await
            .unwrap()
            .commit(true)
            .await;
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let (_dev, store) = store().await;
        put(&store, "alpha", "one").await;
        put(&store, "beta", "two").await;

        assert_eq!(store.get(b"alpha").await.unwrap().as_ref(), b"one");
        assert_eq!(store.get(b"beta").await.unwrap().as_ref(), b"two");
        assert!(store.get(b"gamma").await.unwrap_err().is_not_found());
        assert_eq!(store.stats().not_found.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_overwrite_keeps_one_item() {
        let (_dev, store) = store().await;
        put(&store, "alpha", "one").await;
        put(&store, "alpha", "uno").await;

        assert_eq!(store.get(b"alpha").await.unwrap().as_ref(), b"uno");
        let id = store.bucket_id(b"alpha");
        assert_eq!(store.bucket_meta(id).item_count, 1);
        assert_eq!(store.info().items, 1);
    }

    #[tokio::test]
    async fn test_uncommitted_write_is_invisible_after_discard() {
        let (_dev, store) = store().await;
        put(&store, "alpha", "one").await;

        let pending = store
            .set(Bytes::from_static(b"alpha"), Bytes::from_static(b"two"))
            .await
            .unwrap();
        pending.commit(false).await;

        assert_eq!(store.get(b"alpha").await.unwrap().as_ref(), b"one");
        assert_eq!(store.stats().aborts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_get_waits_for_commit() {
        let (_dev, store) = store().await;
        let pending = store
            .set(Bytes::from_static(b"alpha"), Bytes::from_static(b"one"))
            .await
            .unwrap();

        let reader = store.clone();
        let get = tokio::spawn(async move { reader.get(b"alpha").await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!get.is_finished());

        pending.commit(true).await;
        assert_eq!(get.await.unwrap().unwrap().as_ref(), b"one");
    }

    #[tokio::test]
    async fn test_delete() {
        let (_dev, store) = store().await;
        put(&store, "alpha", "one").await;

        store.delete(b"alpha").await.unwrap().commit(true).await;
        assert!(store.get(b"alpha").await.unwrap_err().is_not_found());
        assert!(store.delete(b"alpha").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_get_with_meta() {
        let (_dev, store) = store().await;
        put(&store, "alpha", "one").await;
        let (value, meta) = store.get_with_meta(b"alpha").await.unwrap();
        assert_eq!(value.as_ref(), b"one");
        assert_eq!(meta.chain_length, 1);
        assert_eq!(meta.item_count, 1);
    }

    #[tokio::test]
    async fn test_invalid_inputs() {
        let (_dev, store) = store().await;
        let err = store
            .set(Bytes::new(), Bytes::from_static(b"v"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidKey(0)));

        let huge = Bytes::from(vec![0u8; 512 * 4096]);
        let err = store
            .set(Bytes::from_static(b"k"), huge)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ValueTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_value_log_full_fails_without_mutation() {
        let (_dev, store) = store().await;
        let big = Bytes::from(vec![1u8; 300 * 4096]);
        store
            .set(Bytes::from_static(b"a"), big.clone())
            .await
            .unwrap()
            .commit(true)
            .await;
        let err = store.set(Bytes::from_static(b"b"), big).await.unwrap_err();
        assert!(err.is_no_space());
        assert!(store.get(b"b").await.unwrap_err().is_not_found());
        assert_eq!(store.stats().no_space.load(Ordering::Relaxed), 1);
        assert_eq!(store.queue_info().in_flight, 0);
    }

    #[tokio::test]
    async fn test_failed_value_write_releases_everything() {
        let (dev, store) = store().await;
        dev.set_fail_writes(true);
        assert!(
            store
                .set(Bytes::from_static(b"a"), Bytes::from_static(b"v"))
                .await
                .is_err()
        );
        dev.set_fail_writes(false);

        assert_eq!(store.queue_info().in_flight, 0);
        assert_eq!(store.bucket_log().locks().active(), 0);
        assert!(store.get(b"a").await.unwrap_err().is_not_found());
    }

    async fn wait_for_used_slots(store: &DataStore, used: u64) {
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while store.info().used_slots != used {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_dropped_pending_write_releases_locks() {
        let (dev, store) = store().await;
        put(&store, "a", "old").await;
        let pending = store
            .set(Bytes::from_static(b"a"), Bytes::from_static(b"new"))
            .await
            .unwrap();
        assert_eq!(store.info().used_slots, 2);
        drop(pending);
        assert_eq!(store.bucket_log().locks().active(), 0);
        wait_for_used_slots(&store, 1).await;
        drop(store);

        // The abandoned pages were invalidated and cannot win the scan.
        let reopened = DataStore::open(dev, &config()).await.unwrap();
        assert_eq!(reopened.get(b"a").await.unwrap().as_ref(), b"old");
        assert_eq!(reopened.info().used_slots, 1);
    }

    #[tokio::test]
    async fn test_reopen_keeps_cursor_past_orphaned_record() {
        let (dev, store) = store().await;
        dev.set_fail_writes(true);
        assert!(
            store
                .set(Bytes::from_static(b"a"), Bytes::from_static(b"lost"))
                .await
                .is_err()
        );
        dev.set_fail_writes(false);
        put(&store, "b", "kept-b").await;
        let cursor = store.value_log().cursor();
        drop(store);

        let reopened = DataStore::open(dev, &config()).await.unwrap();
        assert_eq!(reopened.value_log().cursor(), cursor);
        put(&reopened, "c", "value-c").await;
        put(&reopened, "d", "value-d").await;
        assert_eq!(reopened.get(b"b").await.unwrap().as_ref(), b"kept-b");
        assert_eq!(reopened.get(b"c").await.unwrap().as_ref(), b"value-c");
        assert!(reopened.verify().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn test_validate_entry() {
        let (_dev, store) = store().await;
        assert!(store.validate_entry(b"k", b"v").is_ok());
        assert!(matches!(
            store.validate_entry(b"", b"v"),
            Err(Error::InvalidKey(0))
        ));
        assert!(matches!(
            store.validate_entry(b"k", &vec![0u8; 512 * 4096]),
            Err(Error::ValueTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_buffered_set_duplicate_key_last_wins() {
        let (_dev, store) = store().await;
        let pending = store
            .buffered_set(vec![
                (Bytes::from_static(b"k"), Bytes::from_static(b"first")),
                (Bytes::from_static(b"k"), Bytes::from_static(b"second")),
            ])
            .await
            .unwrap();
        assert_eq!(pending.bucket_ids().len(), 1);
        pending.commit(true).await;
        assert_eq!(store.get(b"k").await.unwrap().as_ref(), b"second");
    }

    #[tokio::test]
    async fn test_reopen_preserves_data() {
        let (dev, store) = store().await;
        for i in 0..(ITEMS_PER_BUCKET * 3) {
            put(&store, &format!("key-{i}"), &format!("value-{i}")).await;
        }
        store.delete(b"key-3").await.unwrap().commit(true).await;
        let cursor = store.value_log().cursor();
        drop(store);

        let reopened = DataStore::open(dev, &config()).await.unwrap();
        assert_eq!(reopened.value_log().cursor(), cursor);
        for i in 0..(ITEMS_PER_BUCKET * 3) {
            let got = reopened.get(format!("key-{i}").as_bytes()).await;
            if i == 3 {
                assert!(got.unwrap_err().is_not_found());
            } else {
                assert_eq!(got.unwrap(), Bytes::from(format!("value-{i}")));
            }
        }
        assert!(reopened.verify().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn test_open_rejects_other_geometry() {
        let (dev, _store) = store().await;
        let other = StoreConfig {
            log_bucket_num: 5,
            ..config()
        };
        assert!(matches!(
            DataStore::open(dev, &other).await,
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_format_rejects_small_device() {
        let device = Arc::new(MemDevice::new(4096, 64));
        let err = DataStore::format(device, &config(), 0).await.err().unwrap();
        assert!(matches!(err, Error::InsufficientCapacity { .. }));
    }

    #[tokio::test]
    async fn test_unformatted_device_rejected() {
        let device = Arc::new(MemDevice::new(4096, 1024));
        assert!(matches!(
            DataStore::open(device, &config()).await,
            Err(Error::Corruption(_))
        ));
    }
}
