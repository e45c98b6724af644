//! Storage node request handler

use crate::message::{Op, Reply, ReplyStatus, Request};
use crate::ring::{CopyRangeInfo, Ring, RingCopySink, Route, VnodeRole};
use leed_common::{Config, Error, Result};
use leed_storage::{
    AutoCommit, BatchOutcome, CopyEngine, DEFAULT_BLOCK_SIZE, DataStore, FileDevice, SetBatcher,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Request counters of a node
#[derive(Debug, Default)]
pub struct NodeStats {
    pub requests: AtomicU64,
    /// Writes and reads handed to the next node
    pub forwarded: AtomicU64,
    /// Reads forwarded because the key had a write in flight
    pub dirty_reads: AtomicU64,
    pub errors: AtomicU64,
    pub copy_ranges_started: AtomicU64,
}

/// One device's store with its migration engine and set batcher
pub struct Shard {
    store: DataStore,
    copy: CopyEngine,
    batcher: SetBatcher,
    poller: JoinHandle<()>,
}

impl Shard {
    #[must_use]
    pub const fn store(&self) -> &DataStore {
        &self.store
    }

    #[must_use]
    pub const fn copy(&self) -> &CopyEngine {
        &self.copy
    }

    #[must_use]
    pub const fn batcher(&self) -> &SetBatcher {
        &self.batcher
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

/// Serves requests for every shard on this node
pub struct StorageNode {
    ring: Arc<dyn Ring>,
    shards: HashMap<u32, Shard>,
    stats: NodeStats,
}

impl StorageNode {
    #[must_use]
    pub fn new(ring: Arc<dyn Ring>) -> Self {
        Self {
            ring,
            shards: HashMap::new(),
            stats: NodeStats::default(),
        }
    }

    /// Open every configured device; device `i` serves shard `i`
    ///
    /// # Errors
    /// Returns the first device or store error.
    pub async fn open(config: &Config, ring: Arc<dyn Ring>) -> Result<Self> {
        config.validate()?;
        let mut node = Self::new(ring);
        for (index, device) in config.node.devices.iter().enumerate() {
            let file = FileDevice::open(&device.path, DEFAULT_BLOCK_SIZE, device.direct_io)?;
            let store = DataStore::open(Arc::new(file), &config.store).await?;
            let expected = u32::try_from(index)
                .map_err(|_| Error::configuration("too many devices"))?;
            if store.ds_id() != expected {
                warn!(
                    "Device {} was formatted for shard {}, serving it as shard {}",
                    device.path.display(),
                    store.ds_id(),
                    expected
                );
            }
            node.add_shard(expected, store);
        }
        info!(
            "Node '{}' serving {} shards",
            config.node.name,
            node.shards.len()
        );
        Ok(node)
    }

    /// Serve `store` as shard `ds_id`
    ///
    /// Must be called inside a tokio runtime: the shard's batch poller is
    /// spawned here.
    pub fn add_shard(&mut self, ds_id: u32, store: DataStore) {
        let sink = Arc::new(RingCopySink::new(Arc::clone(&self.ring), ds_id));
        let copy = CopyEngine::new(store.clone(), sink);
        let batcher = SetBatcher::new(store.clone(), Arc::new(AutoCommit));
        let poller = batcher.spawn_poller();
        self.shards.insert(
            ds_id,
            Shard {
                store,
                copy,
                batcher,
                poller,
            },
        );
    }

    #[must_use]
    pub fn shard(&self, ds_id: u32) -> Option<&Shard> {
        self.shards.get(&ds_id)
    }

    #[must_use]
    pub const fn stats(&self) -> &NodeStats {
        &self.stats
    }

    /// Apply one request
    pub async fn handle(&self, route: &Route, request: Request) -> Reply {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        let Some(shard) = self.shards.get(&route.ds_id) else {
            warn!("Request for unknown shard {}", route.ds_id);
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            return Reply::status(ReplyStatus::Err);
        };

        let reply = match request.op {
            Op::Set | Op::Delete => self.handle_write(shard, route, &request).await,
            Op::Get => self.handle_get(shard, route, &request).await,
            Op::BufferedSet => Self::handle_buffered_set(shard, request).await,
            Op::MetaGet => {
                let store = &shard.store;
                Reply {
                    meta: Some(store.bucket_meta(store.bucket_id(&request.key))),
                    ..Reply::ok()
                }
            }
            Op::Test => Reply::ok(),
        };
        if reply.status == ReplyStatus::Err {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
        }
        reply.with_queue(shard.store.queue_info())
    }

    async fn handle_write(&self, shard: &Shard, route: &Route, request: &Request) -> Reply {
        let store = &shard.store;
        let vnode = route.role == VnodeRole::Vnode;
        let _dirty = vnode.then(|| store.dirty().mark(&request.key));

        let local = if request.op == Op::Set {
            store.set(request.key.clone(), request.value.clone()).await
        } else {
            store.delete(&request.key).await
        };

        match local {
            Err(e) => {
                if !e.is_not_found() {
                    warn!("{} on shard {} failed: {}", request.op, route.ds_id, e);
                }
                Reply::from_error(&e)
            }
            Ok(write) => {
                let forward = vnode
                    || (route.role == VnodeRole::Tail
                        && route.has_next
                        && shard.copy.already_migrated(&request.key));
                if forward {
                    self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
                    let reply = self.ring.forward(route.ds_id, request, false).await;
                    debug!("{} forwarded from shard {}: {}", request.op, route.ds_id, reply.status);
                    write.commit(reply.is_ok()).await;
                    reply
                } else {
                    write.commit(true).await;
                    Reply::ok()
                }
            }
        }
    }

    async fn handle_get(&self, shard: &Shard, route: &Route, request: &Request) -> Reply {
        let store = &shard.store;
        if route.role == VnodeRole::Vnode && store.dirty().is_dirty(&request.key) {
            self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
            self.stats.dirty_reads.fetch_add(1, Ordering::Relaxed);
            return self.ring.forward(route.ds_id, request, false).await;
        }
        match store.get(&request.key).await {
            Ok(value) => Reply::value(value),
            Err(e) => {
                if !e.is_not_found() {
                    warn!("Get on shard {} failed: {}", route.ds_id, e);
                }
                Reply::from_error(&e)
            }
        }
    }

    async fn handle_buffered_set(shard: &Shard, request: Request) -> Reply {
        match shard.batcher.submit(request.key, request.value).wait().await {
            BatchOutcome::Committed => Reply::ok(),
            BatchOutcome::Discarded => Reply::status(ReplyStatus::Err),
            BatchOutcome::Failed(reason) => {
                debug!("Buffered set failed: {}", reason);
                Reply::status(ReplyStatus::Err)
            }
        }
    }

    /// React to a ring membership change
    ///
    /// A start event opens the range for copying and reports it to the
    /// ring once drained; a stop event closes it.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] for an unknown shard, or the copy
    /// engine's error.
    pub async fn on_copy_event(&self, is_start: bool, info: CopyRangeInfo) -> Result<()> {
        let shard = self
            .shards
            .get(&info.ds_id)
            .ok_or_else(|| Error::invalid_argument(format!("no shard {}", info.ds_id)))?;

        if !is_start {
            return shard.copy.del_key_range(info.start, info.end, info.purge).await;
        }

        let completion = shard.copy.add_key_range(info.start, info.end)?;
        self.stats
            .copy_ranges_started
            .fetch_add(1, Ordering::Relaxed);
        let ring = Arc::clone(&self.ring);
        tokio::spawn(async move {
            match completion.wait().await {
                Ok(()) => ring.stop_copy(&info).await,
                Err(e) => warn!("Copy of shard {} range ended early: {}", info.ds_id, e),
            }
        });
        Ok(())
    }
}
