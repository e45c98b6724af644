//! Range migration
//!
//! When ring membership changes, the old owner streams every live item of
//! the affected bucket-id ranges to the new owner. Open ranges are serviced
//! round-robin: each step locks the bucket at a range's cursor, advances the
//! cursor and queues the bucket's items. Transfers drain the queue with
//! bounded concurrency. A bucket stays locked until all its items are
//! delivered, so a write to a bucket either lands before its copy or sees
//! [`CopyEngine::already_migrated`] and is forwarded.
//!
//! A transfer the receiver rejects as outdated is retried with the same
//! value. Any other transfer failure aborts the process: the new owner
//! would otherwise silently miss data.

use crate::segment::Segment;
use crate::store::DataStore;
use async_trait::async_trait;
use bytes::Bytes;
use leed_common::{BucketId, BucketMeta, Error, Fingerprint, Result, bucket_space};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

/// One live item on its way to the new owner
#[derive(Clone, Debug)]
pub struct CopyItem {
    pub key: Bytes,
    pub value: Bytes,
    pub bucket_id: BucketId,
}

/// Result of handing an item to the receiver
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferOutcome {
    Delivered,
    /// The receiver holds a newer version; retry as is
    Outdated,
    /// Transport failure
    Failed(String),
}

/// Destination of migrated items
#[async_trait]
pub trait CopySink: Send + Sync {
    async fn transfer(&self, item: &CopyItem) -> TransferOutcome;
}

#[derive(Debug, Default)]
pub struct CopyStats {
    pub segments: AtomicU64,
    pub items: AtomicU64,
    pub bytes: AtomicU64,
    pub retries: AtomicU64,
    pub ranges_done: AtomicU64,
}

/// Snapshot of an open range
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeStatus {
    pub start: BucketId,
    pub end: BucketId,
    /// Next bucket to copy
    pub cursor: BucketId,
    /// Buckets whose copy has started
    pub copied: u64,
    /// Buckets in the range
    pub span: u64,
    /// Items queued or in transfer
    pub in_flight: usize,
    pub done: bool,
}

/// Resolves once every bucket of a range has been delivered
#[derive(Debug)]
pub struct RangeCompletion {
    rx: oneshot::Receiver<()>,
}

impl RangeCompletion {
    /// # Errors
    /// Returns [`Error::Internal`] if the engine went away first.
    pub async fn wait(self) -> Result<()> {
        self.rx
            .await
            .map_err(|_| Error::internal("copy engine dropped an open range"))
    }
}

struct KeyRange {
    serial: u64,
    start: u64,
    end: u64,
    span: u64,
    copied: u64,
    copying: bool,
    in_flight: usize,
    held: Option<Segment>,
    completion: Option<oneshot::Sender<()>>,
}

impl KeyRange {
    const fn drained(&self) -> bool {
        self.copied == self.span && !self.copying
    }

    fn status(&self, size: u64) -> RangeStatus {
        RangeStatus {
            start: BucketId::new(self.start),
            end: BucketId::new(self.end),
            cursor: BucketId::new((self.start + self.copied) % size),
            copied: self.copied,
            span: self.span,
            in_flight: self.in_flight,
            done: self.drained(),
        }
    }
}

struct QueuedItem {
    serial: u64,
    bucket_id: BucketId,
    key: Bytes,
    value_offset: u64,
    value_length: u32,
}

#[derive(Default)]
struct CopyState {
    ranges: Vec<KeyRange>,
    next: usize,
    queue: VecDeque<QueuedItem>,
    transfers: usize,
    next_serial: u64,
}

struct CopyInner {
    store: DataStore,
    sink: Arc<dyn CopySink>,
    concurrency: usize,
    size: u64,
    state: Mutex<CopyState>,
    stats: CopyStats,
}

/// Per-shard migration engine
#[derive(Clone)]
pub struct CopyEngine {
    inner: Arc<CopyInner>,
}

impl CopyEngine {
    /// Create an engine using the store's copy configuration
    #[must_use]
    pub fn new(store: DataStore, sink: Arc<dyn CopySink>) -> Self {
        let concurrency = store.config().copy.concurrency.max(1);
        Self::with_concurrency(store, sink, concurrency)
    }

    #[must_use]
    pub fn with_concurrency(store: DataStore, sink: Arc<dyn CopySink>, concurrency: usize) -> Self {
        let size = bucket_space(store.log_bucket_num());
        Self {
            inner: Arc::new(CopyInner {
                store,
                sink,
                concurrency: concurrency.max(1),
                size,
                state: Mutex::new(CopyState::default()),
                stats: CopyStats::default(),
            }),
        }
    }

    /// Bucket id a ring position falls into
    #[must_use]
    pub fn bucket_of(&self, position: u64) -> BucketId {
        Fingerprint::from_raw(position).bucket_id(self.inner.store.log_bucket_num())
    }

    /// Open the range of ring positions `[start, end)` for migration
    ///
    /// # Errors
    /// As [`CopyEngine::add_bucket_range`].
    pub fn add_key_range(&self, start: u64, end: u64) -> Result<RangeCompletion> {
        self.add_bucket_range(self.bucket_of(start), self.bucket_of(end))
    }

    /// Open the bucket-id range `[start, end)`; `start == end` is the whole
    /// ring
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if the ids are out of range or the
    /// same range is already open.
    pub fn add_bucket_range(&self, start: BucketId, end: BucketId) -> Result<RangeCompletion> {
        let size = self.inner.size;
        let (start, end) = (start.as_u64(), end.as_u64());
        if start >= size || end >= size {
            return Err(Error::invalid_argument(format!(
                "range [{start}, {end}) outside {size} bucket ids"
            )));
        }
        let span = if start == end {
            size
        } else {
            (end + size - start) % size
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            if state.ranges.iter().any(|r| r.start == start && r.end == end) {
                return Err(Error::invalid_argument(format!(
                    "range [{start}, {end}) is already open"
                )));
            }
            let serial = state.next_serial;
            state.next_serial += 1;
            state.ranges.push(KeyRange {
                serial,
                start,
                end,
                span,
                copied: 0,
                copying: false,
                in_flight: 0,
                held: None,
                completion: Some(tx),
            });
            if state.ranges.len() == 1 {
                state.next = 0;
            }
        }
        info!("Copy range [{}, {}) opened, {} buckets", start, end, span);
        self.inner.schedule();
        Ok(RangeCompletion { rx })
    }

    /// Close a drained range of ring positions
    ///
    /// # Errors
    /// As [`CopyEngine::del_bucket_range`].
    pub async fn del_key_range(&self, start: u64, end: u64, purge: bool) -> Result<()> {
        self.del_bucket_range(self.bucket_of(start), self.bucket_of(end), purge)
            .await
    }

    /// Close a drained bucket-id range, optionally purging its buckets
    ///
    /// # Errors
    /// Returns [`Error::RangeNotFound`] for an unknown range,
    /// [`Error::RangeBusy`] if it still has buckets to copy, or a device
    /// error from the purge.
    pub async fn del_bucket_range(&self, start: BucketId, end: BucketId, purge: bool) -> Result<()> {
        let size = self.inner.size;
        let (start, end) = (start.as_u64(), end.as_u64());
        let removed = {
            let mut state = self.inner.state.lock();
            let index = state
                .ranges
                .iter()
                .position(|r| r.start == start && r.end == end)
                .ok_or(Error::RangeNotFound { start, end })?;
            if !state.ranges[index].drained() {
                return Err(Error::RangeBusy { start, end });
            }
            let removed = state.ranges.remove(index);
            if state.next > index {
                state.next -= 1;
            }
            if state.next >= state.ranges.len() {
                state.next = 0;
            }
            removed
        };

        if purge {
            let bucket_log = self.inner.store.bucket_log();
            let mut purged = 0u64;
            for id in bucket_log.bucket_ids() {
                if (id.as_u64() + size - removed.start) % size < removed.span {
                    bucket_log.put_meta(id, BucketMeta::default()).await?;
                    purged += 1;
                }
            }
            info!("Copy range [{}, {}) closed, {} buckets purged", start, end, purged);
        } else {
            info!("Copy range [{}, {}) closed", start, end);
        }
        Ok(())
    }

    /// Whether the key's bucket has already been copied by an open range
    #[must_use]
    pub fn already_migrated(&self, key: &[u8]) -> bool {
        let bucket = self.inner.store.bucket_id(key).as_u64();
        let size = self.inner.size;
        self.inner
            .state
            .lock()
            .ranges
            .iter()
            .any(|r| (bucket + size - r.start) % size < r.copied)
    }

    #[must_use]
    pub fn ranges(&self) -> Vec<RangeStatus> {
        let size = self.inner.size;
        self.inner
            .state
            .lock()
            .ranges
            .iter()
            .map(|r| r.status(size))
            .collect()
    }

    /// True when no range has buckets left to copy
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.inner.state.lock().ranges.iter().all(KeyRange::drained)
    }

    #[must_use]
    pub fn stats(&self) -> &CopyStats {
        &self.inner.stats
    }
}

impl CopyInner {
    /// Start transfers up to the concurrency bound, then lock the next
    /// bucket of every idle range if the queue has room
    fn schedule(self: &Arc<Self>) {
        let mut state = self.state.lock();

        while state.transfers < self.concurrency {
            let Some(item) = state.queue.pop_front() else {
                break;
            };
            state.transfers += 1;
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.transfer(item).await });
        }

        if state.queue.len() >= self.concurrency || state.ranges.is_empty() {
            return;
        }
        let count = state.ranges.len();
        let first = state.next % count;
        for step in 0..count {
            let range = &mut state.ranges[(first + step) % count];
            if range.copying || range.copied == range.span {
                continue;
            }
            let bucket = BucketId::new((range.start + range.copied) % self.size);
            range.copying = true;
            range.copied += 1;
            let serial = range.serial;
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.copy_segment(serial, bucket).await });
        }
        state.next = (first + 1) % count;
    }

    async fn copy_segment(self: Arc<Self>, serial: u64, bucket: BucketId) {
        let segment = match self.store.bucket_log().lock(bucket).await {
            Ok(segment) => segment,
            Err(e) => fatal(&format!("cannot load bucket {bucket} for copy: {e}")),
        };
        self.stats.segments.fetch_add(1, Ordering::Relaxed);

        let items: Vec<QueuedItem> = segment
            .items()
            .map(|item| QueuedItem {
                serial,
                bucket_id: bucket,
                key: item.key.clone(),
                value_offset: item.value_offset,
                value_length: item.value_length,
            })
            .collect();
        debug!("Copying bucket {}: {} items", bucket, items.len());

        let finished = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(range) = state.ranges.iter_mut().find(|r| r.serial == serial) else {
                return;
            };
            if items.is_empty() {
                Some(Self::segment_done(range, Some(segment)))
            } else {
                range.in_flight = items.len();
                range.held = Some(segment);
                state.queue.extend(items);
                None
            }
        };
        if let Some((segment, completion)) = finished {
            self.finish(segment, completion);
        }
        self.schedule();
    }

    async fn transfer(self: Arc<Self>, queued: QueuedItem) {
        let value = match self
            .store
            .value_log()
            .read(queued.value_offset, queued.value_length)
            .await
        {
            Ok(value) => value,
            Err(e) => fatal(&format!(
                "cannot read value of a key in bucket {} for copy: {e}",
                queued.bucket_id
            )),
        };
        let item = CopyItem {
            key: queued.key,
            value,
            bucket_id: queued.bucket_id,
        };

        loop {
            match self.sink.transfer(&item).await {
                TransferOutcome::Delivered => break,
                TransferOutcome::Outdated => {
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    debug!("Copy of a key in bucket {} outdated, retrying", item.bucket_id);
                    tokio::task::yield_now().await;
                }
                TransferOutcome::Failed(reason) => fatal(&format!(
                    "copy transfer of a key in bucket {} failed: {reason}",
                    item.bucket_id
                )),
            }
        }
        self.stats.items.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes
            .fetch_add(item.value.len() as u64, Ordering::Relaxed);

        let finished = {
            let mut state = self.state.lock();
            state.transfers -= 1;
            state
                .ranges
                .iter_mut()
                .find(|r| r.serial == queued.serial)
                .and_then(|range| {
                    range.in_flight -= 1;
                    (range.in_flight == 0).then(|| Self::segment_done(range, None))
                })
        };
        if let Some((segment, completion)) = finished {
            self.finish(segment, completion);
        }
        self.schedule();
    }

    /// Mark the range's current bucket copied; hands back the segment to
    /// unlock and the completion to fire, if the range is now drained
    fn segment_done(
        range: &mut KeyRange,
        segment: Option<Segment>,
    ) -> (Option<Segment>, Option<(u64, u64, oneshot::Sender<()>)>) {
        range.copying = false;
        let segment = segment.or_else(|| range.held.take());
        let completion = if range.copied == range.span {
            range
                .completion
                .take()
                .map(|tx| (range.start, range.end, tx))
        } else {
            None
        };
        (segment, completion)
    }

    fn finish(&self, segment: Option<Segment>, completion: Option<(u64, u64, oneshot::Sender<()>)>) {
        drop(segment);
        if let Some((start, end, tx)) = completion {
            self.stats.ranges_done.fetch_add(1, Ordering::Relaxed);
            info!("Copy range [{}, {}) drained", start, end);
            let _ = tx.send(());
        }
    }
}

fn fatal(message: &str) -> ! {
    error!("Fatal migration error: {}", message);
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use leed_common::config::StoreConfig;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::time::timeout;

    #[derive(Default)]
    struct Recorder {
        delivered: Mutex<HashMap<Bytes, (Bytes, usize)>>,
        outdated_first: bool,
        seen: Mutex<HashMap<Bytes, usize>>,
    }

    #[async_trait]
    impl CopySink for Recorder {
        async fn transfer(&self, item: &CopyItem) -> TransferOutcome {
            let attempt = {
                let mut seen = self.seen.lock();
                let n = seen.entry(item.key.clone()).or_insert(0);
                *n += 1;
                *n
            };
            if self.outdated_first && attempt == 1 {
                return TransferOutcome::Outdated;
            }
            let mut delivered = self.delivered.lock();
            let entry = delivered
                .entry(item.key.clone())
                .or_insert((item.value.clone(), 0));
            entry.1 += 1;
            TransferOutcome::Delivered
        }
    }

    async fn store(log_bucket_num: u32) -> DataStore {
        let config = StoreConfig {
            num_buckets: 1 << log_bucket_num,
            log_bucket_num,
            value_log_blocks: Some(256),
            ..StoreConfig::default()
        };
        let device = Arc::new(MemDevice::new(4096, 512));
        DataStore::format(device, &config, 0).await.unwrap()
    }

    async fn fill(store: &DataStore, n: usize) {
        for i in 0..n {
            store
                .set(Bytes::from(format!("key-{i}")), Bytes::from(format!("value-{i}")))
                .await
                .unwrap()
                .commit(true)
                .await;
        }
    }

    #[tokio::test]
    async fn test_full_ring_copy_delivers_everything_once() {
        let store = store(3).await;
        fill(&store, 20).await;
        let sink = Arc::new(Recorder::default());
        let engine = CopyEngine::with_concurrency(store.clone(), sink.clone(), 4);

        let done = engine
            .add_bucket_range(BucketId::new(0), BucketId::new(0))
            .unwrap();
        timeout(Duration::from_secs(5), done.wait())
            .await
            .unwrap()
            .unwrap();

        let delivered = sink.delivered.lock();
        assert_eq!(delivered.len(), 20);
        for i in 0..20 {
            let (value, count) = &delivered[format!("key-{i}").as_bytes()];
            assert_eq!(value, &Bytes::from(format!("value-{i}")));
            assert_eq!(*count, 1);
        }
        assert!(engine.already_migrated(b"key-0"));
        assert!(engine.is_idle());
        assert_eq!(store.bucket_log().locks().active(), 0);
    }

    #[tokio::test]
    async fn test_outdated_transfer_is_retried() {
        let store = store(2).await;
        fill(&store, 6).await;
        let sink = Arc::new(Recorder {
            outdated_first: true,
            ..Recorder::default()
        });
        let engine = CopyEngine::with_concurrency(store, sink.clone(), 2);
        let done = engine
            .add_bucket_range(BucketId::new(0), BucketId::new(0))
            .unwrap();
        timeout(Duration::from_secs(5), done.wait())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(sink.delivered.lock().len(), 6);
        assert_eq!(engine.stats().retries.load(Ordering::Relaxed), 6);
    }

    #[tokio::test]
    async fn test_empty_range_completes() {
        let store = store(4).await;
        let engine = CopyEngine::with_concurrency(store, Arc::new(Recorder::default()), 2);
        let done = engine
            .add_bucket_range(BucketId::new(3), BucketId::new(7))
            .unwrap();
        timeout(Duration::from_secs(5), done.wait())
            .await
            .unwrap()
            .unwrap();

        let status = &engine.ranges()[0];
        assert!(status.done);
        assert_eq!(status.copied, 4);
        assert_eq!(status.cursor, BucketId::new(7));
    }

    #[tokio::test]
    async fn test_del_range_rules() {
        let store = store(4).await;
        fill(&store, 30).await;
        let engine = CopyEngine::with_concurrency(store.clone(), Arc::new(Recorder::default()), 2);

        assert!(matches!(
            engine
                .del_bucket_range(BucketId::new(0), BucketId::new(8), false)
                .await,
            Err(Error::RangeNotFound { .. })
        ));
        assert!(engine.add_bucket_range(BucketId::new(16), BucketId::new(0)).is_err());

        let done = engine
            .add_bucket_range(BucketId::new(0), BucketId::new(8))
            .unwrap();
        assert!(
            engine
                .add_bucket_range(BucketId::new(0), BucketId::new(8))
                .is_err()
        );
        timeout(Duration::from_secs(5), done.wait())
            .await
            .unwrap()
            .unwrap();

        engine
            .del_bucket_range(BucketId::new(0), BucketId::new(8), true)
            .await
            .unwrap();
        assert!(engine.ranges().is_empty());
        for id in store.bucket_log().bucket_ids() {
            assert!(id.as_u64() >= 8);
        }
    }

    #[tokio::test]
    async fn test_already_migrated_follows_cursor() {
        let store = store(4).await;
        let engine = CopyEngine::with_concurrency(store.clone(), Arc::new(Recorder::default()), 1);

        // Hold bucket 2 so the copy stalls there.
        let key = (0..)
            .map(|i| format!("held-{i}"))
            .find(|k| store.bucket_id(k.as_bytes()) == BucketId::new(2))
            .unwrap();
        let blocker = store.bucket_log().lock(BucketId::new(2)).await.unwrap();

        let done = engine
            .add_bucket_range(BucketId::new(0), BucketId::new(4))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Bucket 2's copy has started (cursor moved past it) but is blocked.
        assert!(engine.already_migrated(key.as_bytes()));
        assert!(!engine.ranges()[0].done);
        assert!(matches!(
            engine
                .del_bucket_range(BucketId::new(0), BucketId::new(4), false)
                .await,
            Err(Error::RangeBusy { .. })
        ));

        drop(blocker);
        timeout(Duration::from_secs(5), done.wait())
            .await
            .unwrap()
            .unwrap();
    }
}
