//! Keys with a write in flight on a migrating vnode
//!
//! While such a write is being forwarded, a local read could miss the new
//! value, so reads of dirty keys are forwarded instead. Marks are counted:
//! two overlapping writes of one key keep it dirty until both clean up.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Reference-counted set of dirty keys
#[derive(Debug, Default)]
pub struct DirtyKeys {
    keys: Mutex<HashMap<Bytes, usize>>,
}

impl DirtyKeys {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `key` dirty until the returned guard is dropped
    #[must_use = "the key is cleaned as soon as the guard is dropped"]
    pub fn mark(&self, key: &Bytes) -> DirtyGuard<'_> {
        *self.keys.lock().entry(key.clone()).or_insert(0) += 1;
        DirtyGuard {
            keys: self,
            key: key.clone(),
        }
    }

    /// Drop one mark; the key stays dirty while other marks remain
    fn clean(&self, key: &[u8]) {
        let mut keys = self.keys.lock();
        if let Some(count) = keys.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                keys.remove(key);
            }
        }
    }

    #[must_use]
    pub fn is_dirty(&self, key: &[u8]) -> bool {
        self.keys.lock().contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }
}

/// One mark on a dirty key
#[derive(Debug)]
pub struct DirtyGuard<'a> {
    keys: &'a DirtyKeys,
    key: Bytes,
}

impl Drop for DirtyGuard<'_> {
    fn drop(&mut self) {
        self.keys.clean(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_clean() {
        let dirty = DirtyKeys::new();
        let key = Bytes::from_static(b"k1");
        assert!(!dirty.is_dirty(b"k1"));

        let guard = dirty.mark(&key);
        assert!(dirty.is_dirty(b"k1"));
        drop(guard);
        assert!(!dirty.is_dirty(b"k1"));
        assert!(dirty.is_empty());
    }

    #[test]
    fn test_overlapping_marks() {
        let dirty = DirtyKeys::new();
        let key = Bytes::from_static(b"k1");
        let first = dirty.mark(&key);
        let second = dirty.mark(&key);
        drop(first);
        assert!(dirty.is_dirty(b"k1"));
        drop(second);
        assert!(!dirty.is_dirty(b"k1"));
        // Cleaning an unknown key is a no-op.
        dirty.clean(b"other");
        assert_eq!(dirty.len(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_write_cleans_its_mark() {
        let dirty = std::sync::Arc::new(DirtyKeys::new());
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
        let task = tokio::spawn({
            let dirty = std::sync::Arc::clone(&dirty);
            async move {
                let _mark = dirty.mark(&Bytes::from_static(b"k1"));
                let _ = entered_tx.send(());
                std::future::pending::<()>().await;
            }
        });
        entered_rx.await.unwrap();
        assert!(dirty.is_dirty(b"k1"));

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(!dirty.is_dirty(b"k1"));
    }
}
