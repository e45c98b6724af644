//! End-to-end storage scenarios: overflow chains, buffered sets, range
//! migration and admission deferral.

mod common;

use async_trait::async_trait;
use bytes::Bytes;
use common::{GateDevice, admission, keys_in_bucket, mem_store, set, store_config};
use leed_common::{BucketId, ITEMS_PER_BUCKET};
use leed_storage::{CopyEngine, CopyItem, CopySink, DataStore, TransferOutcome};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::timeout;

#[tokio::test]
async fn test_overflow_chain_grows_and_packs() {
    // Every key lands in bucket 0.
    let store = mem_store(&store_config(0, 4)).await;
    let id = BucketId::new(0);
    let keys = keys_in_bucket(0, 0, ITEMS_PER_BUCKET + 1);

    for key in &keys[..ITEMS_PER_BUCKET] {
        set(&store, key, key).await;
    }
    assert_eq!(store.bucket_meta(id).chain_length, 1);
    assert_eq!(usize::from(store.bucket_meta(id).item_count), ITEMS_PER_BUCKET);

    set(&store, &keys[ITEMS_PER_BUCKET], b"overflow").await;
    assert_eq!(store.bucket_meta(id).chain_length, 2);
    assert_eq!(store.info().used_slots, 2);

    for key in &keys[..5] {
        store.delete(key).await.unwrap().commit(true).await;
    }
    let meta = store.bucket_meta(id);
    assert_eq!(meta.chain_length, 1);
    assert_eq!(meta.item_count, 4);
    assert_eq!(store.info().used_slots, 1);

    for key in &keys[5..ITEMS_PER_BUCKET] {
        assert_eq!(&store.get(key).await.unwrap(), key);
    }
    assert_eq!(
        store.get(&keys[ITEMS_PER_BUCKET]).await.unwrap().as_ref(),
        b"overflow"
    );
    for key in &keys[..5] {
        assert!(store.get(key).await.unwrap_err().is_not_found());
    }
}

#[tokio::test]
async fn test_buffered_set_locks_each_bucket_once() {
    let store = mem_store(&store_config(4, 16)).await;
    let mut keys = keys_in_bucket(4, 3, 2);
    keys.extend(keys_in_bucket(4, 7, 1));
    keys.extend(keys_in_bucket(4, 11, 1));

    let entries: Vec<(Bytes, Bytes)> = keys
        .iter()
        .map(|k| (k.clone(), Bytes::from(format!("value of {}", String::from_utf8_lossy(k)))))
        .collect();
    let pending = store.buffered_set(entries.clone()).await.unwrap();
    assert_eq!(
        pending.bucket_ids(),
        vec![BucketId::new(3), BucketId::new(7), BucketId::new(11)]
    );
    assert_eq!(store.stats().segments_locked.load(Ordering::Relaxed), 3);
    pending.commit(true).await;

    for (key, value) in &entries {
        assert_eq!(&store.get(key).await.unwrap(), value);
    }
    assert_eq!(store.bucket_meta(BucketId::new(3)).item_count, 2);
}

#[derive(Default)]
struct CountingSink {
    transfers: Mutex<HashMap<Bytes, usize>>,
}

#[async_trait]
impl CopySink for CountingSink {
    async fn transfer(&self, item: &CopyItem) -> TransferOutcome {
        *self.transfers.lock().entry(item.key.clone()).or_insert(0) += 1;
        TransferOutcome::Delivered
    }
}

#[tokio::test]
async fn test_range_copy_delivers_each_item_once() {
    let store = mem_store(&store_config(3, 8)).await;
    let mut keys = Vec::new();
    for bucket in 0..4 {
        for key in keys_in_bucket(3, bucket, 2) {
            set(&store, &key, b"v").await;
            keys.push(key);
        }
    }
    // Outside the range.
    for key in keys_in_bucket(3, 5, 2) {
        set(&store, &key, b"stay").await;
    }

    let sink = Arc::new(CountingSink::default());
    let engine = CopyEngine::with_concurrency(store.clone(), sink.clone(), 3);
    let done = engine
        .add_bucket_range(BucketId::new(0), BucketId::new(4))
        .unwrap();
    timeout(Duration::from_secs(5), done.wait())
        .await
        .unwrap()
        .unwrap();

    let transfers = sink.transfers.lock();
    assert_eq!(transfers.values().sum::<usize>(), 8);
    for key in &keys {
        assert_eq!(transfers[key], 1);
    }
    assert_eq!(engine.stats().ranges_done.load(Ordering::Relaxed), 1);
    assert_eq!(engine.stats().items.load(Ordering::Relaxed), 8);
    let status = &engine.ranges()[0];
    assert!(status.done);
    assert_eq!(status.in_flight, 0);
}

#[tokio::test]
async fn test_third_set_deferred_until_one_completes() {
    let mut config = store_config(4, 16);
    config.admission = admission(10, 5);
    let device = Arc::new(GateDevice::new(4096));
    let store = DataStore::format(device.clone(), &config, 0).await.unwrap();

    device.close();
    let spawn_set = |store: DataStore, key: &'static str| {
        tokio::spawn(async move {
            store
                .set(Bytes::from_static(key.as_bytes()), Bytes::from_static(b"v"))
                .await
                .unwrap()
                .commit(true)
                .await;
        })
    };
    let first = spawn_set(store.clone(), "first");
    let second = spawn_set(store.clone(), "second");
    tokio::time::sleep(Duration::from_millis(20)).await;
    let third = spawn_set(store.clone(), "third");
    tokio::time::sleep(Duration::from_millis(20)).await;

    let queue = store.queue();
    assert_eq!(queue.info().in_flight, 10);
    assert_eq!(queue.waiting(), 1);
    assert!(!third.is_finished());

    device.open();
    for task in [first, second, third] {
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
    assert_eq!(queue.stats().deferred.load(Ordering::Relaxed), 1);
    assert_eq!(queue.info().in_flight, 0);
    assert_eq!(store.get(b"third").await.unwrap().as_ref(), b"v");
}
