//! LEED Storage Engine - Log-structured key-value store
//!
//! This crate implements one storage shard:
//! - Block devices (memory, regular files, raw disks with O_DIRECT)
//! - Bucket log: hash index of copy-on-write bucket page chains
//! - Value log: append-only value records
//! - Segment locks and cost-based admission control
//! - Set batching and range migration

pub mod batch;
pub mod bitmap;
pub mod bucket_log;
pub mod copy;
pub mod device;
pub mod dirty;
pub mod layout;
pub mod lock;
pub mod page;
pub mod queue;
pub mod raw_io;
pub mod segment;
pub mod store;
pub mod value_log;

// Re-exports
pub use batch::{AutoCommit, BatchHandler, BatchOutcome, BatchTicket, SetBatcher};
pub use bucket_log::{BucketLog, BucketLogInfo};
pub use copy::{CopyEngine, CopyItem, CopySink, RangeCompletion, RangeStatus, TransferOutcome};
pub use device::{BlockDevice, DEFAULT_BLOCK_SIZE, DeviceStats, FileDevice, MemDevice};
pub use dirty::{DirtyGuard, DirtyKeys};
pub use layout::{RegionLayout, Superblock};
pub use lock::{LockMode, SegmentGuard, SegmentLocks};
pub use queue::{AdmissionPermit, AdmissionQueue};
pub use segment::{Bucket, Item, Segment};
pub use store::{DataStore, PendingWrite, StoreInfo, StoreStats, VerifyReport};
pub use value_log::ValueLog;
