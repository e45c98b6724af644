//! LEED Admin - Device administration
//!
//! Formats devices for the storage engine and inspects or verifies
//! formatted ones.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use leed_common::Config;
use leed_common::config::{LogFormat, StoreConfig};
use leed_storage::{BlockDevice, DEFAULT_BLOCK_SIZE, DataStore, FileDevice, Superblock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "leed-admin")]
#[command(about = "LEED device administration")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "LEED_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (overrides the configuration)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Format a device with the configured geometry
    Format {
        /// Block device or file; files are created if missing
        #[arg(long)]
        device: PathBuf,
        /// Size in bytes for a new file-backed device
        #[arg(long)]
        size: Option<u64>,
        /// Shard id to record in the superblock
        #[arg(long, default_value_t = 0)]
        ds_id: u32,
        /// Use O_DIRECT
        #[arg(long)]
        direct: bool,
    },
    /// Show the superblock, region layout and occupancy of a device
    Info {
        #[arg(long)]
        device: PathBuf,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Verify every bucket and value of a device
    Check {
        #[arg(long)]
        device: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(config: &Config, override_level: Option<&str>) {
    let level = override_level.unwrap_or(&config.logging.level).to_string();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());
    let registry = tracing_subscriber::registry().with(filter);
    match config.logging.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Geometry recorded in the superblock, tuning from the configuration
fn formatted_config(superblock: &Superblock, config: &StoreConfig) -> StoreConfig {
    StoreConfig {
        num_buckets: superblock.num_buckets,
        log_bucket_num: superblock.log_bucket_num,
        value_log_blocks: Some(superblock.layout.value.blocks),
        ..config.clone()
    }
}

async fn open_existing(path: &Path, config: &StoreConfig) -> Result<DataStore> {
    let device: Arc<dyn BlockDevice> = Arc::new(
        FileDevice::open(path, DEFAULT_BLOCK_SIZE, false)
            .with_context(|| format!("failed to open {}", path.display()))?,
    );
    let superblock = DataStore::probe(device.as_ref())
        .await
        .with_context(|| format!("{} is not a formatted device", path.display()))?;
    if superblock.num_buckets != config.num_buckets || superblock.log_bucket_num != config.log_bucket_num {
        warn!(
            "Configured geometry differs from the device; using num_buckets={} log_bucket_num={}",
            superblock.num_buckets, superblock.log_bucket_num
        );
    }
    Ok(DataStore::open(device, &formatted_config(&superblock, config)).await?)
}

async fn format(path: &Path, size: Option<u64>, ds_id: u32, direct: bool, config: &StoreConfig) -> Result<()> {
    let device = if path.exists() {
        FileDevice::open(path, DEFAULT_BLOCK_SIZE, direct)?
    } else {
        let Some(size) = size else {
            bail!("{} does not exist; pass --size to create it", path.display());
        };
        FileDevice::create(path, size, DEFAULT_BLOCK_SIZE, direct)?
    };
    let store = DataStore::format(Arc::new(device), config, ds_id).await?;
    let layout = store.superblock().layout;
    println!("Formatted {}", path.display());
    println!("  Store UUID:    {}", store.superblock().store_uuid);
    println!("  Shard:         {ds_id}");
    println!("  Bucket slots:  {}", layout.bucket_slots);
    println!("  Value log:     {} blocks", layout.value.blocks);
    Ok(())
}

fn print_info(path: &Path, store: &DataStore, json: bool) -> Result<()> {
    let sb = store.superblock();
    let layout = sb.layout;
    let info = store.info();
    if json {
        let value = serde_json::json!({
            "device": path.display().to_string(),
            "store_uuid": sb.store_uuid.to_string(),
            "ds_id": sb.ds_id,
            "version": sb.version,
            "created_at": sb.created_at,
            "num_buckets": sb.num_buckets,
            "log_bucket_num": sb.log_bucket_num,
            "block_size": layout.block_size,
            "total_blocks": layout.total_blocks,
            "bucket_region": { "offset": layout.bucket.offset, "slots": layout.bucket_slots },
            "value_region": { "offset": layout.value.offset, "blocks": layout.value.blocks },
            "id_region": { "offset": layout.id.offset, "blocks": layout.id.blocks },
            "usage": info,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Device {}", path.display());
    println!("==========================================");
    println!("Store UUID:      {}", sb.store_uuid);
    println!("Shard:           {}", sb.ds_id);
    println!("Format version:  {}", sb.version);
    println!("Created at:      {}", sb.created_at);
    println!("Block size:      {} bytes", layout.block_size);
    println!("Total blocks:    {}", layout.total_blocks);
    println!("Buckets:         {} (log {})", sb.num_buckets, sb.log_bucket_num);
    println!();
    println!("Regions (offset / size in blocks)");
    println!("  Bucket table:  {} / {} slots", layout.bucket.offset, layout.bucket_slots);
    println!("  Value log:     {} / {}", layout.value.offset, layout.value.blocks);
    println!("  Id log:        {} / {}", layout.id.offset, layout.id.blocks);
    println!();
    println!("Usage");
    println!("  Live buckets:  {}", info.buckets);
    println!("  Live items:    {}", info.items);
    println!("  Page slots:    {} used, {} free", info.used_slots, info.free_slots);
    println!(
        "  Value log:     {} of {} bytes",
        info.value_log_used, info.value_log_capacity
    );
    Ok(())
}

async fn check(path: &Path, store: &DataStore, json: bool) -> Result<()> {
    let report = store.verify().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Checked {}", path.display());
        println!("  Buckets:  {}", report.buckets);
        println!("  Pages:    {}", report.pages);
        println!("  Items:    {}", report.items);
        println!("  Values:   {} bytes", report.value_bytes);
        for (bucket, reason) in &report.bad_buckets {
            println!("  BAD bucket {bucket}: {reason}");
        }
        for (key, reason) in &report.bad_items {
            println!("  BAD item {key:?}: {reason}");
        }
    }
    if !report.is_clean() {
        bail!(
            "{} failed verification: {} bad buckets, {} bad items",
            path.display(),
            report.bad_buckets.len(),
            report.bad_items.len()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    init_logging(&config, args.log_level.as_deref());
    if let Some(path) = &args.config {
        info!("Config file: {}", path.display());
    }

    match args.command {
        Commands::Format {
            device,
            size,
            ds_id,
            direct,
        } => format(&device, size, ds_id, direct, &config.store).await,
        Commands::Info { device, json } => {
            let store = open_existing(&device, &config.store).await?;
            print_info(&device, &store, json)
        }
        Commands::Check { device, json } => {
            let store = open_existing(&device, &config.store).await?;
            check(&device, &store, json).await
        }
    }
}
