//! Set batching
//!
//! Small sets are collected into one buffered set. A batch flushes as soon
//! as it reaches the configured size, or once it has been idle past the
//! idle timeout; the latter is checked by a periodic poller.

use crate::store::DataStore;
use async_trait::async_trait;
use bytes::Bytes;
use leed_common::config::BatchConfig;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How a submitted set ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOutcome {
    Committed,
    Discarded,
    Failed(String),
}

/// Commit decision for a persisted batch
#[async_trait]
pub trait BatchHandler: Send + Sync {
    /// Return true to commit the batch, false to discard it
    async fn on_batch(&self, keys: &[Bytes]) -> bool;
}

/// Commits every batch
#[derive(Clone, Copy, Debug, Default)]
pub struct AutoCommit;

#[async_trait]
impl BatchHandler for AutoCommit {
    async fn on_batch(&self, _keys: &[Bytes]) -> bool {
        true
    }
}

/// Resolves once the batch holding a submitted set is finished
#[derive(Debug)]
pub struct BatchTicket {
    rx: oneshot::Receiver<BatchOutcome>,
}

impl BatchTicket {
    pub async fn wait(self) -> BatchOutcome {
        self.rx
            .await
            .unwrap_or_else(|_| BatchOutcome::Failed("batch dropped before completion".into()))
    }
}

#[derive(Debug, Default)]
pub struct BatchStats {
    pub flushes: AtomicU64,
    /// Flushes triggered by the idle poller
    pub idle_flushes: AtomicU64,
    pub items: AtomicU64,
}

struct Pending {
    entries: Vec<(Bytes, Bytes)>,
    waiters: Vec<oneshot::Sender<BatchOutcome>>,
    last_append: Instant,
}

impl Pending {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            waiters: Vec::new(),
            last_append: Instant::now(),
        }
    }
}

struct BatcherInner {
    store: DataStore,
    handler: Arc<dyn BatchHandler>,
    config: BatchConfig,
    pending: Mutex<Pending>,
    stats: BatchStats,
}

/// Per-shard set batcher
#[derive(Clone)]
pub struct SetBatcher {
    inner: Arc<BatcherInner>,
}

impl SetBatcher {
    /// Create a batcher using the store's batch configuration
    #[must_use]
    pub fn new(store: DataStore, handler: Arc<dyn BatchHandler>) -> Self {
        let config = store.config().batch.clone();
        Self::with_config(store, handler, config)
    }

    #[must_use]
    pub fn with_config(store: DataStore, handler: Arc<dyn BatchHandler>, config: BatchConfig) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                store,
                handler,
                config,
                pending: Mutex::new(Pending::new()),
                stats: BatchStats::default(),
            }),
        }
    }

    /// Queue a set; a full batch is flushed in the background.
    ///
    /// An invalid key or oversized value fails its own ticket right away and
    /// never joins the batch.
    pub fn submit(&self, key: Bytes, value: Bytes) -> BatchTicket {
        let (tx, rx) = oneshot::channel();
        if let Err(e) = self.inner.store.validate_entry(&key, &value) {
            debug!("Rejected batched set: {}", e);
            let _ = tx.send(BatchOutcome::Failed(e.to_string()));
            return BatchTicket { rx };
        }
        let full = {
            let mut pending = self.inner.pending.lock();
            pending.entries.push((key, value));
            pending.waiters.push(tx);
            pending.last_append = Instant::now();
            (pending.entries.len() >= self.inner.config.batch_size)
                .then(|| std::mem::replace(&mut *pending, Pending::new()))
        };
        if let Some(batch) = full {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.run(batch).await });
        }
        BatchTicket { rx }
    }

    /// Flush whatever is pending and wait for it; returns the batch size
    pub async fn flush(&self) -> usize {
        let batch = std::mem::replace(&mut *self.inner.pending.lock(), Pending::new());
        let len = batch.entries.len();
        if len > 0 {
            self.inner.run(batch).await;
        }
        len
    }

    /// Flush in the background if the pending batch has gone idle
    pub fn poll_idle(&self) -> bool {
        self.inner.poll_idle()
    }

    /// Run [`SetBatcher::poll_idle`] every poll interval until the batcher
    /// is dropped
    pub fn spawn_poller(&self) -> JoinHandle<()> {
        let weak: Weak<BatcherInner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.poll_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.poll_idle();
            }
        })
    }

    /// Number of sets waiting for a flush
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().entries.len()
    }

    #[must_use]
    pub fn stats(&self) -> &BatchStats {
        &self.inner.stats
    }
}

impl BatcherInner {
    fn poll_idle(self: &Arc<Self>) -> bool {
        let batch = {
            let mut pending = self.pending.lock();
            if pending.entries.is_empty() || pending.last_append.elapsed() < self.config.idle_timeout() {
                return false;
            }
            std::mem::replace(&mut *pending, Pending::new())
        };
        self.stats.idle_flushes.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.run(batch).await });
        true
    }

    async fn run(&self, batch: Pending) {
        let Pending { entries, waiters, .. } = batch;
        let keys: Vec<Bytes> = entries.iter().map(|(key, _)| key.clone()).collect();
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        self.stats.items.fetch_add(keys.len() as u64, Ordering::Relaxed);

        let outcome = match self.store.buffered_set(entries).await {
            Ok(write) => {
                let commit = self.handler.on_batch(&keys).await;
                write.commit(commit).await;
                if commit {
                    BatchOutcome::Committed
                } else {
                    BatchOutcome::Discarded
                }
            }
            Err(e) => {
                warn!("Buffered set of {} keys failed: {}", keys.len(), e);
                BatchOutcome::Failed(e.to_string())
            }
        };
        debug!("Batch of {} keys finished: {:?}", keys.len(), outcome);

        for tx in waiters {
            let _ = tx.send(outcome.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use leed_common::config::StoreConfig;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn store() -> DataStore {
        let config = StoreConfig {
            num_buckets: 16,
            log_bucket_num: 4,
            value_log_blocks: Some(256),
            ..StoreConfig::default()
        };
        let device = Arc::new(MemDevice::new(4096, 512));
        DataStore::format(device, &config, 0).await.unwrap()
    }

    fn batch_config(batch_size: usize, idle_timeout_us: u64) -> BatchConfig {
        BatchConfig {
            batch_size,
            idle_timeout_us,
            poll_interval_us: 1000,
        }
    }

    struct Reject;

    #[async_trait]
    impl BatchHandler for Reject {
        async fn on_batch(&self, _keys: &[Bytes]) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_flush_on_batch_size() {
        let store = store().await;
        let batcher = SetBatcher::with_config(store.clone(), Arc::new(AutoCommit), batch_config(3, 60_000_000));

        let t1 = batcher.submit(Bytes::from_static(b"a"), Bytes::from_static(b"1"));
        let t2 = batcher.submit(Bytes::from_static(b"b"), Bytes::from_static(b"2"));
        assert_eq!(batcher.pending_len(), 2);
        let t3 = batcher.submit(Bytes::from_static(b"c"), Bytes::from_static(b"3"));
        assert_eq!(batcher.pending_len(), 0);

        for ticket in [t1, t2, t3] {
            assert_eq!(ticket.wait().await, BatchOutcome::Committed);
        }
        assert_eq!(store.get(b"b").await.unwrap().as_ref(), b"2");
        assert_eq!(batcher.stats().flushes.load(Ordering::Relaxed), 1);
        assert_eq!(store.stats().buffered_sets.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_idle_poller_flushes() {
        let store = store().await;
        let batcher = SetBatcher::with_config(store.clone(), Arc::new(AutoCommit), batch_config(100, 1000));
        let poller = batcher.spawn_poller();

        let ticket = batcher.submit(Bytes::from_static(b"idle"), Bytes::from_static(b"v"));
        let outcome = timeout(Duration::from_secs(2), ticket.wait()).await.unwrap();
        assert_eq!(outcome, BatchOutcome::Committed);
        assert_eq!(store.get(b"idle").await.unwrap().as_ref(), b"v");
        assert!(batcher.stats().idle_flushes.load(Ordering::Relaxed) >= 1);
        poller.abort();
    }

    #[tokio::test]
    async fn test_poll_idle_skips_fresh_batch() {
        let store = store().await;
        let batcher = SetBatcher::with_config(store, Arc::new(AutoCommit), batch_config(100, 60_000_000));
        assert!(!batcher.poll_idle());
        let _ticket = batcher.submit(Bytes::from_static(b"k"), Bytes::from_static(b"v"));
        assert!(!batcher.poll_idle());
        assert_eq!(batcher.flush().await, 1);
    }

    #[tokio::test]
    async fn test_rejected_batch_is_discarded() {
        let store = store().await;
        let batcher = SetBatcher::with_config(store.clone(), Arc::new(Reject), batch_config(2, 60_000_000));
        let t1 = batcher.submit(Bytes::from_static(b"a"), Bytes::from_static(b"1"));
        let t2 = batcher.submit(Bytes::from_static(b"b"), Bytes::from_static(b"2"));
        assert_eq!(t1.wait().await, BatchOutcome::Discarded);
        assert_eq!(t2.wait().await, BatchOutcome::Discarded);
        assert!(store.get(b"a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_failed_batch_reports_reason() {
        let store = store().await;
        let batcher = SetBatcher::with_config(store, Arc::new(AutoCommit), batch_config(1, 60_000_000));
        let ticket = batcher.submit(Bytes::new(), Bytes::from_static(b"v"));
        assert!(matches!(ticket.wait().await, BatchOutcome::Failed(_)));
        assert_eq!(batcher.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_invalid_entry_does_not_fail_its_batch() {
        let store = store().await;
        let batcher = SetBatcher::with_config(store.clone(), Arc::new(AutoCommit), batch_config(3, 60_000_000));

        let t1 = batcher.submit(Bytes::from_static(b"a"), Bytes::from_static(b"1"));
        let bad = batcher.submit(Bytes::new(), Bytes::from_static(b"x"));
        let t2 = batcher.submit(Bytes::from_static(b"b"), Bytes::from_static(b"2"));
        assert_eq!(batcher.pending_len(), 2);
        let t3 = batcher.submit(Bytes::from_static(b"c"), Bytes::from_static(b"3"));

        assert!(matches!(bad.wait().await, BatchOutcome::Failed(_)));
        for ticket in [t1, t2, t3] {
            assert_eq!(ticket.wait().await, BatchOutcome::Committed);
        }
        for (key, value) in [(b"a", b"1"), (b"b", b"2"), (b"c", b"3")] {
            assert_eq!(store.get(key).await.unwrap().as_ref(), value);
        }
        assert_eq!(batcher.stats().items.load(Ordering::Relaxed), 3);
    }
}
