//! Seam to the consistent-hash ring
//!
//! The ring decides where requests go next. A node only needs two things
//! from it: forwarding a request to the next replica (or to the new owner
//! of a migrating range) and being told when a range finished copying.

use crate::message::{Reply, ReplyStatus, Request};
use async_trait::async_trait;
use leed_storage::{CopyItem, CopySink, TransferOutcome};
use std::sync::Arc;
use tracing::debug;

/// Position of the serving vnode in its replication chain
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VnodeRole {
    /// Not the last replica; writes continue down the chain
    Vnode,
    /// Last replica
    Tail,
}

/// Routing attached to every request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Route {
    pub ds_id: u32,
    pub role: VnodeRole,
    /// A node after this one exists, e.g. a joining owner
    pub has_next: bool,
}

impl Route {
    #[must_use]
    pub const fn new(ds_id: u32, role: VnodeRole, has_next: bool) -> Self {
        Self {
            ds_id,
            role,
            has_next,
        }
    }
}

/// A range of ring positions changing owner
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopyRangeInfo {
    pub ds_id: u32,
    pub start: u64,
    pub end: u64,
    /// Drop the local buckets once the range is closed
    pub purge: bool,
}

#[async_trait]
pub trait Ring: Send + Sync {
    /// Send a request onward; `is_copy` marks a migration transfer
    async fn forward(&self, ds_id: u32, request: &Request, is_copy: bool) -> Reply;

    /// Report that a range has been fully copied
    async fn stop_copy(&self, info: &CopyRangeInfo);
}

/// Delivers migrated items as copy sets through the ring
pub struct RingCopySink {
    ring: Arc<dyn Ring>,
    ds_id: u32,
}

impl RingCopySink {
    #[must_use]
    pub fn new(ring: Arc<dyn Ring>, ds_id: u32) -> Self {
        Self { ring, ds_id }
    }
}

#[async_trait]
impl CopySink for RingCopySink {
    async fn transfer(&self, item: &CopyItem) -> TransferOutcome {
        let request = Request::set(item.key.clone(), item.value.clone());
        let reply = self.ring.forward(self.ds_id, &request, true).await;
        match reply.status {
            ReplyStatus::Ok => TransferOutcome::Delivered,
            ReplyStatus::Outdated => {
                debug!("Copy to shard {} outdated", self.ds_id);
                TransferOutcome::Outdated
            }
            status => TransferOutcome::Failed(format!("copy forward answered {status}")),
        }
    }
}
