//! Requests and replies exchanged with clients and peers

use bytes::Bytes;
use derive_more::Display;
use leed_common::{BucketMeta, Error, QueueInfo};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum Op {
    Get,
    Set,
    BufferedSet,
    Delete,
    /// Bucket metadata of the key's bucket
    MetaGet,
    /// No-op round trip
    Test,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub op: Op,
    pub key: Bytes,
    pub value: Bytes,
}

impl Request {
    #[must_use]
    pub fn get(key: impl Into<Bytes>) -> Self {
        Self::new(Op::Get, key.into(), Bytes::new())
    }

    #[must_use]
    pub fn set(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::new(Op::Set, key.into(), value.into())
    }

    #[must_use]
    pub fn buffered_set(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::new(Op::BufferedSet, key.into(), value.into())
    }

    #[must_use]
    pub fn delete(key: impl Into<Bytes>) -> Self {
        Self::new(Op::Delete, key.into(), Bytes::new())
    }

    #[must_use]
    pub fn meta_get(key: impl Into<Bytes>) -> Self {
        Self::new(Op::MetaGet, key.into(), Bytes::new())
    }

    #[must_use]
    pub const fn new(op: Op, key: Bytes, value: Bytes) -> Self {
        Self { op, key, value }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum ReplyStatus {
    Ok,
    NotFound,
    Err,
    /// The receiver already holds a newer version
    Outdated,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub status: ReplyStatus,
    pub value: Bytes,
    pub meta: Option<BucketMeta>,
    /// Load of the serving shard, for replica selection
    pub queue: QueueInfo,
}

impl Reply {
    #[must_use]
    pub fn ok() -> Self {
        Self::status(ReplyStatus::Ok)
    }

    #[must_use]
    pub fn value(value: Bytes) -> Self {
        Self {
            value,
            ..Self::ok()
        }
    }

    #[must_use]
    pub fn status(status: ReplyStatus) -> Self {
        Self {
            status,
            value: Bytes::new(),
            meta: None,
            queue: QueueInfo::default(),
        }
    }

    #[must_use]
    pub fn from_error(error: &Error) -> Self {
        if error.is_not_found() {
            Self::status(ReplyStatus::NotFound)
        } else {
            Self::status(ReplyStatus::Err)
        }
    }

    #[must_use]
    pub const fn with_queue(mut self, queue: QueueInfo) -> Self {
        self.queue = queue;
        self
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }
}
