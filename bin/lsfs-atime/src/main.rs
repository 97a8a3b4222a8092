//! lsfs atime - Admin CLI for access-time files
//!
//! Inspects, checks and edits an atime file on disk.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use lsfs_common::{AtimeConfig, ObjectId, Timespec};
use lsfs_storage::{AtimeFile, AtimeInode, CacheStats, FileBackend, InodeAttrs, MetaBlockCache};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "lsfs-atime")]
#[command(about = "lsfs access-time file tool")]
#[command(version)]
struct Args {
    /// Configuration file
    #[arg(short, long, env = "LSFS_ATIME_CONFIG")]
    config: Option<PathBuf>,

    /// Atime file (overrides the config file)
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Block size in bytes (overrides the config file)
    #[arg(long)]
    block_size: Option<usize>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show stored blocks, or the entries of one block
    Inspect {
        /// Block number
        block: Option<u64>,
    },
    /// Check every block counter against its entries
    Verify,
    /// Print the access time of an inode
    Get { ino: u64 },
    /// Resolve an inode's access time, recording the mtime if it has none
    Fill {
        ino: u64,
        /// Modification time used as the fallback (SECS or SECS.NANOS)
        #[arg(long, value_parser = parse_timespec)]
        mtime: Timespec,
    },
    /// Set the access time of an inode that already has one
    Touch {
        ino: u64,
        /// New access time (SECS or SECS.NANOS), defaults to now
        #[arg(long, value_parser = parse_timespec)]
        time: Option<Timespec>,
    },
    /// Drop the access time of an inode
    Delete { ino: u64 },
}

/// Configuration file layout
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Config {
    atime: AtimeConfig,
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

/// Parse `SECS` or `SECS.NANOS`; a leading `-` applies to the whole value
fn parse_timespec(s: &str) -> Result<Timespec, String> {
    let (negative, magnitude) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let (sec, frac) = magnitude.split_once('.').unwrap_or((magnitude, ""));
    if sec.is_empty() || !sec.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("invalid seconds in {s:?}"));
    }
    if magnitude.contains('.')
        && (frac.is_empty() || frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()))
    {
        return Err(format!("invalid fraction in {s:?}"));
    }

    let sec: i64 = sec
        .parse()
        .map_err(|e| format!("invalid seconds in {s:?}: {e}"))?;
    let nsec: i64 = if frac.is_empty() {
        0
    } else {
        format!("{frac:0<9}")
            .parse()
            .map_err(|e| format!("invalid fraction in {s:?}: {e}"))?
    };

    Ok(if negative {
        Timespec::new(-sec, -nsec)
    } else {
        Timespec::new(sec, nsec)
    })
}

fn cache_summary(stats: &CacheStats) -> String {
    format!(
        "Cache: {} hits, {} misses ({:.1}% hit ratio), {} evictions, {} writebacks",
        stats.hits.load(Ordering::Relaxed),
        stats.misses.load(Ordering::Relaxed),
        stats.hit_ratio() * 100.0,
        stats.evictions.load(Ordering::Relaxed),
        stats.writebacks.load(Ordering::Relaxed),
    )
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("failed to parse config file {}", path.display()))
}

fn print_time(ino: u64, time: Option<Timespec>) {
    match time {
        Some(t) => println!("{ino}: {t}"),
        None => println!("{ino}: -"),
    }
}

fn run(store: &AtimeFile, cache: &CacheStats, command: Commands) -> Result<()> {
    let Some(layout) = store.layout().copied() else {
        bail!("no atime file configured");
    };

    match command {
        Commands::Inspect { block: None } => {
            println!("Atime File");
            println!("==========");
            println!("Block size: {} bytes", layout.block_size());
            println!("Entries per block: {}", layout.entries_per_block());
            println!();
            let report = store.verify()?;
            println!("{:<10} {:>8}", "BLOCK", "LIVE");
            for number in store.block_numbers()? {
                if let Some(block) = store.read_block(number)? {
                    println!("{:<10} {:>8}", number, block.live_entries);
                }
            }
            println!();
            println!("Blocks: {}", report.blocks_checked);
            println!("Live entries: {}", report.live_entries);
            println!("{}", cache_summary(cache));
        }
        Commands::Inspect { block: Some(number) } => {
            let Some(block) = store.read_block(number)? else {
                bail!("block {number} does not exist");
            };
            println!("Block {number}: {} live entries", block.live_entries);
            for (offset, entry) in block.entries.iter().enumerate() {
                if !entry.is_absent() {
                    let ino = layout.object_id(number, offset);
                    println!("  {:>12}  {entry}", ino.get());
                }
            }
        }
        Commands::Verify => {
            let report = store.verify()?;
            println!(
                "checked {} blocks, {} live entries",
                report.blocks_checked, report.live_entries
            );
            for block in &report.reclaimable {
                println!("block {block}: empty, not reclaimed");
            }
            for m in &report.mismatches {
                println!(
                    "block {}: counter {} but {} entries present",
                    m.block, m.recorded, m.present
                );
            }
            if !report.is_clean() {
                bail!("{} inconsistent block(s)", report.mismatches.len());
            }
        }
        Commands::Get { ino } => {
            print_time(ino, store.get(ObjectId::new(ino))?);
        }
        Commands::Fill { ino, mtime } => {
            let mut inode = InodeAttrs::new(ObjectId::new(ino), mtime);
            let atime = store.fill_inode(&mut inode)?;
            print_time(inode.ino().get(), Some(atime));
        }
        Commands::Touch { ino, time } => {
            let now = time.unwrap_or_else(Timespec::now);
            store.update(ObjectId::new(ino), now)?;
            print_time(ino, store.get(ObjectId::new(ino))?);
        }
        Commands::Delete { ino } => {
            store.delete(ObjectId::new(ino))?;
            println!("{ino}: deleted");
        }
    }

    let written = store.flush()?;
    debug!("flushed {} blocks", written);
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    // CLI takes precedence over the config file
    let log_level = if args.log_level == "warn" {
        config.logging.level.clone()
    } else {
        args.log_level.clone()
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut atime = config.atime;
    if let Some(file) = args.file {
        atime.path = Some(file);
    }
    if let Some(block_size) = args.block_size {
        atime.block_size = block_size;
    }
    atime.validate().context("invalid atime configuration")?;
    let Some(path) = atime.path.clone() else {
        bail!("no atime file given; use --file or set atime.path in the config file");
    };

    let backend = FileBackend::open(&path, atime.block_size)
        .with_context(|| format!("failed to open atime file {}", path.display()))?;
    let cache = Arc::new(MetaBlockCache::new(backend, atime.cache_blocks));
    let store = AtimeFile::with_metafile(cache.clone(), &atime)?;
    info!("atime file {} ready", path.display());
    run(&store, cache.stats(), args.command)
}
