//! Configuration types for LEED
//!
//! Every section deserializes from TOML with per-field defaults, so a config
//! file only needs to name what it changes.

use crate::error::{Error, Result};
use crate::types::{MAX_LOG_BUCKET_NUM, OpKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest number of entries a buffered-set batch may carry
pub const MAX_BATCH_SIZE: usize = 256;

/// Root configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node configuration
    pub node: NodeConfig,
    /// Storage engine configuration, shared by every shard of the node
    pub store: StoreConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Parse a TOML document and validate it
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] on syntax errors or invalid values.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| Error::configuration(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or does not validate.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Validate all sections
    ///
    /// # Errors
    /// Returns the first invalid setting found.
    pub fn validate(&self) -> Result<()> {
        self.store.validate()
    }
}

/// Node identity and the devices it serves, one shard per device
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name (human-readable identifier)
    pub name: String,
    /// Devices backing the node's shards, in shard id order
    pub devices: Vec<DeviceConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "leed-node".to_string(),
            devices: Vec::new(),
        }
    }
}

/// Configuration for a single device
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Path to a block device or a regular file
    pub path: PathBuf,
    /// Use direct I/O (`O_DIRECT`)
    #[serde(default)]
    pub direct_io: bool,
    /// Size to create a file-backed device with
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

/// Storage engine geometry and tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Expected number of primary buckets; the bucket region holds twice as
    /// many pages so overflow chains and copy-on-write share one pool
    pub num_buckets: u64,
    /// Bits of the key fingerprint used as the bucket id
    pub log_bucket_num: u32,
    /// Blocks reserved for the value log; derived from the device when unset
    pub value_log_blocks: Option<u64>,
    /// Blocks read per step when scanning the value log
    pub compact_buf_len: u32,
    /// Admission control
    pub admission: AdmissionConfig,
    /// Buffered-set batching
    pub batch: BatchConfig,
    /// Range migration
    pub copy: CopyConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            num_buckets: 1 << 16,
            log_bucket_num: 16,
            value_log_blocks: None,
            compact_buf_len: 512,
            admission: AdmissionConfig::default(),
            batch: BatchConfig::default(),
            copy: CopyConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Number of page slots in the bucket region
    #[must_use]
    pub const fn bucket_slots(&self) -> u64 {
        self.num_buckets * 2
    }

    /// Validate geometry and tuning values
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.num_buckets == 0 {
            return Err(Error::configuration("store.num_buckets must be > 0"));
        }
        if self.log_bucket_num > MAX_LOG_BUCKET_NUM {
            return Err(Error::configuration(format!(
                "store.log_bucket_num must be <= {MAX_LOG_BUCKET_NUM}"
            )));
        }
        if self.value_log_blocks == Some(0) {
            return Err(Error::configuration("store.value_log_blocks must be > 0"));
        }
        if self.compact_buf_len == 0 {
            return Err(Error::configuration("store.compact_buf_len must be > 0"));
        }
        self.admission.validate()?;
        self.batch.validate()?;
        self.copy.validate()
    }
}

/// Admission queue capacity and per-operation costs
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Total cost that may be in flight per shard
    pub capacity: u32,
    pub get_cost: u32,
    pub set_cost: u32,
    pub delete_cost: u32,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            get_cost: 1,
            set_cost: 2,
            delete_cost: 2,
        }
    }
}

impl AdmissionConfig {
    /// Cost charged for an operation kind
    #[must_use]
    pub const fn cost(&self, kind: OpKind) -> u32 {
        match kind {
            OpKind::Get => self.get_cost,
            OpKind::Set => self.set_cost,
            OpKind::Delete => self.delete_cost,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::configuration("admission.capacity must be > 0"));
        }
        for kind in [OpKind::Get, OpKind::Set, OpKind::Delete] {
            let cost = self.cost(kind);
            if cost == 0 || cost > self.capacity {
                return Err(Error::configuration(format!(
                    "admission cost for {kind} must be in 1..={}",
                    self.capacity
                )));
            }
        }
        Ok(())
    }
}

/// Buffered-set batching
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Entries that trigger an immediate flush
    pub batch_size: usize,
    /// A pending batch idle this long is flushed by the poller
    pub idle_timeout_us: u64,
    /// Poller period
    pub poll_interval_us: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            idle_timeout_us: 1000,
            poll_interval_us: 1000,
        }
    }
}

impl BatchConfig {
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_micros(self.idle_timeout_us)
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(Error::configuration(format!(
                "batch.batch_size must be in 1..={MAX_BATCH_SIZE}"
            )));
        }
        if self.poll_interval_us == 0 {
            return Err(Error::configuration("batch.poll_interval_us must be > 0"));
        }
        Ok(())
    }
}

/// Range migration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyConfig {
    /// Bound on queued and in-flight item transfers per shard
    pub concurrency: usize,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self { concurrency: 32 }
    }
}

impl CopyConfig {
    fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::configuration("copy.concurrency must be > 0"));
        }
        Ok(())
    }
}

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}
