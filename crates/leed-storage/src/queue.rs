//! Cost-based admission control
//!
//! Each shard admits operations against a fixed capacity. Every operation
//! kind carries a cost; an operation whose cost does not fit is deferred
//! into a FIFO and admitted once enough cost is released. Admission is
//! strictly FIFO: nothing is admitted while an earlier operation waits,
//! even if the newcomer would fit.
//!
//! # Example
//!
//! ```ignore
//! let permit = queue.admit(OpKind::Set).await?;
//! // ... run the operation ...
//! drop(permit); // releases the cost and admits deferred operations
//! ```

use leed_common::config::AdmissionConfig;
use leed_common::{Error, OpKind, QueueInfo, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::debug;

/// Admission counters
#[derive(Debug, Default)]
pub struct AdmissionStats {
    /// Operations admitted without waiting
    pub admitted: AtomicU64,
    /// Operations that had to wait in the FIFO
    pub deferred: AtomicU64,
    /// Permits released
    pub released: AtomicU64,
}

struct Waiter {
    cost: u32,
    tx: oneshot::Sender<AdmissionPermit>,
}

struct QueueState {
    capacity: u32,
    in_flight: u32,
    waiters: VecDeque<Waiter>,
}

struct Shared {
    state: Mutex<QueueState>,
    stats: AdmissionStats,
}

/// Per-shard admission queue
#[derive(Clone)]
pub struct AdmissionQueue {
    shared: Arc<Shared>,
    costs: AdmissionConfig,
}

impl AdmissionQueue {
    #[must_use]
    pub fn new(config: &AdmissionConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    capacity: config.capacity,
                    in_flight: 0,
                    waiters: VecDeque::new(),
                }),
                stats: AdmissionStats::default(),
            }),
            costs: config.clone(),
        }
    }

    /// Cost charged for an operation kind
    #[must_use]
    pub const fn cost(&self, kind: OpKind) -> u32 {
        self.costs.cost(kind)
    }

    /// Admit an operation, waiting behind earlier deferred ones if needed
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if the cost can never fit.
    pub async fn admit(&self, kind: OpKind) -> Result<AdmissionPermit> {
        let cost = self.cost(kind);
        let rx = {
            let mut state = self.shared.state.lock();
            if cost > state.capacity {
                return Err(Error::invalid_argument(format!(
                    "{kind} cost {cost} exceeds queue capacity {}",
                    state.capacity
                )));
            }
            if state.waiters.is_empty() && state.in_flight + cost <= state.capacity {
                state.in_flight += cost;
                self.shared.stats.admitted.fetch_add(1, Ordering::Relaxed);
                return Ok(self.permit(cost));
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { cost, tx });
            self.shared.stats.deferred.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Deferred {} (cost {}): {}/{} in flight, {} waiting",
                kind,
                cost,
                state.in_flight,
                state.capacity,
                state.waiters.len()
            );
            rx
        };
        rx.await
            .map_err(|_| Error::internal("admission queue dropped a deferred operation"))
    }

    /// Admit only if nothing waits and the cost fits right now
    #[must_use]
    pub fn try_admit(&self, kind: OpKind) -> Option<AdmissionPermit> {
        let cost = self.cost(kind);
        let mut state = self.shared.state.lock();
        if state.waiters.is_empty() && state.in_flight + cost <= state.capacity {
            state.in_flight += cost;
            self.shared.stats.admitted.fetch_add(1, Ordering::Relaxed);
            Some(self.permit(cost))
        } else {
            None
        }
    }

    /// Current load, for replica selection
    #[must_use]
    pub fn info(&self) -> QueueInfo {
        let state = self.shared.state.lock();
        QueueInfo {
            capacity: state.capacity,
            in_flight: state.in_flight,
        }
    }

    /// Number of deferred operations
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.shared.state.lock().waiters.len()
    }

    #[must_use]
    pub fn stats(&self) -> &AdmissionStats {
        &self.shared.stats
    }

    fn permit(&self, cost: u32) -> AdmissionPermit {
        AdmissionPermit {
            shared: Arc::clone(&self.shared),
            cost,
        }
    }
}

/// Charged admission; dropping it releases the cost
pub struct AdmissionPermit {
    shared: Arc<Shared>,
    cost: u32,
}

impl AdmissionPermit {
    #[must_use]
    pub const fn cost(&self) -> u32 {
        self.cost
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("cost", &self.cost)
            .finish()
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.shared.stats.released.fetch_add(1, Ordering::Relaxed);
        let admitted = release(&self.shared, self.cost);
        // Outside the state lock: a waiter that gave up hands its permit
        // back and the drop re-enters `release`.
        for (tx, permit) in admitted {
            if let Err(permit) = tx.send(permit) {
                drop(permit);
            }
        }
    }
}

fn release(shared: &Arc<Shared>, cost: u32) -> Vec<(oneshot::Sender<AdmissionPermit>, AdmissionPermit)> {
    let mut admitted = Vec::new();
    let mut state = shared.state.lock();
    state.in_flight = state.in_flight.saturating_sub(cost);

    while let Some(front) = state.waiters.front() {
        if state.in_flight + front.cost > state.capacity {
            break;
        }
        let Some(waiter) = state.waiters.pop_front() else {
            break;
        };
        state.in_flight += waiter.cost;
        admitted.push((
            waiter.tx,
            AdmissionPermit {
                shared: Arc::clone(shared),
                cost: waiter.cost,
            },
        ));
    }
    admitted
}
