//! Per-bucket segment locks
//!
//! Every bucket id has one FIFO queue of lock requests. Shared holders may
//! overlap; an exclusive holder is alone. A request is granted only when it
//! is compatible with the current holders and nobody is queued ahead of it,
//! so readers queue behind a waiting writer instead of starving it.
//!
//! Grants travel through oneshot channels. A waiter that gives up drops its
//! receiver and the guard inside it, which passes the lock on.

use leed_common::{BucketId, Error, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Access mode of a segment lock
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Default)]
struct LockState {
    readers: usize,
    writer: bool,
    waiters: VecDeque<(LockMode, oneshot::Sender<SegmentGuard>)>,
}

impl LockState {
    const fn compatible(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => !self.writer,
            LockMode::Exclusive => !self.writer && self.readers == 0,
        }
    }

    const fn grant(&mut self, mode: LockMode) {
        match mode {
            LockMode::Shared => self.readers += 1,
            LockMode::Exclusive => self.writer = true,
        }
    }

    const fn is_idle(&self) -> bool {
        !self.writer && self.readers == 0
    }
}

type LockTable = Arc<Mutex<HashMap<BucketId, LockState>>>;

/// Lock table covering all bucket ids of one store
#[derive(Clone, Default)]
pub struct SegmentLocks {
    table: LockTable,
}

impl SegmentLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire one bucket id, waiting in FIFO order
    ///
    /// # Errors
    /// Returns an error only if the lock table is torn down while waiting.
    pub async fn acquire(&self, id: BucketId, mode: LockMode) -> Result<SegmentGuard> {
        let rx = {
            let mut table = self.table.lock();
            let state = table.entry(id).or_default();
            if state.waiters.is_empty() && state.compatible(mode) {
                state.grant(mode);
                return Ok(self.guard(id, mode));
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back((mode, tx));
            rx
        };
        rx.await
            .map_err(|_| Error::internal(format!("segment lock table dropped while waiting on {id}")))
    }

    /// Acquire exclusive locks on a set of ids
    ///
    /// Ids are deduplicated and taken in ascending order, so concurrent
    /// multi-id lockers cannot deadlock. Guards come back in that order.
    ///
    /// # Errors
    /// See [`SegmentLocks::acquire`].
    pub async fn acquire_many(&self, ids: &[BucketId]) -> Result<Vec<SegmentGuard>> {
        let mut sorted = ids.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for id in sorted {
            guards.push(self.acquire(id, LockMode::Exclusive).await?);
        }
        Ok(guards)
    }

    /// Try to take a lock without waiting
    #[must_use]
    pub fn try_acquire(&self, id: BucketId, mode: LockMode) -> Option<SegmentGuard> {
        let mut table = self.table.lock();
        let state = table.entry(id).or_default();
        if state.waiters.is_empty() && state.compatible(mode) {
            state.grant(mode);
            Some(self.guard(id, mode))
        } else {
            if state.is_idle() && state.waiters.is_empty() {
                table.remove(&id);
            }
            None
        }
    }

    /// Number of bucket ids with holders or waiters
    #[must_use]
    pub fn active(&self) -> usize {
        self.table.lock().len()
    }

    fn guard(&self, id: BucketId, mode: LockMode) -> SegmentGuard {
        SegmentGuard {
            table: Arc::clone(&self.table),
            id,
            mode,
        }
    }
}

/// Held segment lock, released on drop
pub struct SegmentGuard {
    table: LockTable,
    id: BucketId,
    mode: LockMode,
}

impl SegmentGuard {
    #[must_use]
    pub const fn id(&self) -> BucketId {
        self.id
    }

    #[must_use]
    pub const fn mode(&self) -> LockMode {
        self.mode
    }
}

impl std::fmt::Debug for SegmentGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentGuard")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Drop for SegmentGuard {
    fn drop(&mut self) {
        let granted = release(&self.table, self.id, self.mode);
        // Sent outside the table lock: a closed receiver hands the guard
        // back and dropping it re-enters `release`.
        for (tx, guard) in granted {
            if let Err(guard) = tx.send(guard) {
                drop(guard);
            }
        }
    }
}

fn release(
    table: &LockTable,
    id: BucketId,
    mode: LockMode,
) -> Vec<(oneshot::Sender<SegmentGuard>, SegmentGuard)> {
    let mut granted = Vec::new();
    let mut map = table.lock();
    let Some(state) = map.get_mut(&id) else {
        return granted;
    };

    match mode {
        LockMode::Shared => state.readers = state.readers.saturating_sub(1),
        LockMode::Exclusive => state.writer = false,
    }

    while let Some((next_mode, _)) = state.waiters.front() {
        let next_mode = *next_mode;
        if !state.compatible(next_mode) {
            break;
        }
        let Some((_, tx)) = state.waiters.pop_front() else {
            break;
        };
        state.grant(next_mode);
        granted.push((
            tx,
            SegmentGuard {
                table: Arc::clone(table),
                id,
                mode: next_mode,
            },
        ));
    }

    if state.is_idle() && state.waiters.is_empty() {
        map.remove(&id);
    }
    granted
}
