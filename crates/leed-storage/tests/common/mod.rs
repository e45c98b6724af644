#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use leed_common::config::{AdmissionConfig, StoreConfig};
use leed_common::{BucketId, Fingerprint, Result};
use leed_storage::{BlockDevice, DataStore, DeviceStats, MemDevice};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

pub fn store_config(log_bucket_num: u32, num_buckets: u64) -> StoreConfig {
    StoreConfig {
        num_buckets,
        log_bucket_num,
        value_log_blocks: Some(1024),
        ..StoreConfig::default()
    }
}

pub fn mem_device(config: &StoreConfig) -> Arc<MemDevice> {
    Arc::new(MemDevice::new(4096, 2048 + config.bucket_slots()))
}

pub async fn mem_store(config: &StoreConfig) -> DataStore {
    DataStore::format(mem_device(config), config, 0).await.unwrap()
}

/// First `n` generated keys that hash to `bucket`
pub fn keys_in_bucket(log_bucket_num: u32, bucket: u64, n: usize) -> Vec<Bytes> {
    (0u64..)
        .map(|i| format!("key-{bucket}-{i}"))
        .filter(|k| Fingerprint::of(k.as_bytes()).bucket_id(log_bucket_num) == BucketId::new(bucket))
        .take(n)
        .map(Bytes::from)
        .collect()
}

pub async fn set(store: &DataStore, key: &Bytes, value: &[u8]) {
    store
        .set(key.clone(), Bytes::copy_from_slice(value))
        .await
        .unwrap()
        .commit(true)
        .await;
}

pub fn admission(capacity: u32, set_cost: u32) -> AdmissionConfig {
    AdmissionConfig {
        capacity,
        get_cost: 1,
        set_cost,
        delete_cost: set_cost,
    }
}

/// Memory device whose writes block while the gate is closed
pub struct GateDevice {
    inner: MemDevice,
    closed: AtomicBool,
    opened: Notify,
}

impl GateDevice {
    pub fn new(num_blocks: u64) -> Self {
        Self {
            inner: MemDevice::new(4096, num_blocks),
            closed: AtomicBool::new(false),
            opened: Notify::new(),
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn open(&self) {
        self.closed.store(false, Ordering::SeqCst);
        self.opened.notify_waiters();
    }
}

#[async_trait]
impl BlockDevice for GateDevice {
    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn num_blocks(&self) -> u64 {
        self.inner.num_blocks()
    }

    fn stats(&self) -> &DeviceStats {
        self.inner.stats()
    }

    async fn read(&self, block: u64, count: u64) -> Result<Bytes> {
        self.inner.read(block, count).await
    }

    async fn write(&self, block: u64, data: Bytes) -> Result<()> {
        while self.closed.load(Ordering::SeqCst) {
            let opened = self.opened.notified();
            if !self.closed.load(Ordering::SeqCst) {
                break;
            }
            opened.await;
        }
        self.inner.write(block, data).await
    }
}
