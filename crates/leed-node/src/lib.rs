//! LEED Node - Request handling for a storage node
//!
//! A node serves one shard per device. It applies client requests to the
//! local store, forwards writes down the replication chain through the
//! [`Ring`], and streams key ranges to new owners when membership changes.

pub mod message;
pub mod node;
pub mod ring;

pub use message::{Op, Reply, ReplyStatus, Request};
pub use node::{NodeStats, Shard, StorageNode};
pub use ring::{CopyRangeInfo, Ring, RingCopySink, Route, VnodeRole};
