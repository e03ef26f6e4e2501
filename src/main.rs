//! # syncstore - inspect the persisted indices of a project sync
//!
//! Lists the contexts in a data directory, reports the stores inside a
//! context with their committed sizes, and drops a store so the next sync
//! rebuilds it from scratch.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::filter::EnvFilter;

use syncstore::storage::{StorageConfig, StorageContext, StoreKind};

/// Inspection tool for syncstore data directories.
#[derive(Parser, Debug)]
#[command(
    name = "syncstore",
    version,
    about = "Inspect and maintain syncstore data directories"
)]
struct Args {
    /// Directory holding one `<context>.db` database per storage context.
    #[arg(long, default_value = ".syncstore")]
    data_dir: PathBuf,

    /// Page cache size in megabytes used while inspecting.
    #[arg(long, default_value_t = 16)]
    cache_size_mb: u64,

    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the persisted stores of one context, or of every context.
    Stats {
        /// Context name; all contexts in the data directory when omitted.
        #[arg(long)]
        context: Option<String>,
    },

    /// Delete a persisted store so that it is rebuilt on the next sync.
    DropStore {
        #[arg(long)]
        context: String,

        /// Store name.
        #[arg(long)]
        name: String,

        /// The store is a flat store rather than a key-value store.
        #[arg(long, default_value_t = false)]
        flat: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    initialize_tracing(&args.log_level)?;

    match &args.command {
        Command::Stats { context } => {
            let contexts = match context {
                Some(name) => vec![name.clone()],
                None => list_contexts(&args.data_dir)?,
            };
            if contexts.is_empty() {
                println!("No contexts in {}", args.data_dir.display());
            }
            for name in contexts {
                print_stats(&args, &name)?;
            }
        }
        Command::DropStore {
            context,
            name,
            flat,
        } => {
            let kind = if *flat { StoreKind::Flat } else { StoreKind::Kv };
            let ctx = open_context(&args, context)?;
            let dropped = ctx
                .drop_store(name, kind)
                .with_context(|| format!("Failed to drop {} store {}", kind, name))?;
            ctx.close()?;

            if dropped {
                println!("Dropped {} store {} from {}", kind, name, context);
            } else {
                println!("No {} store {} in {}", kind, name, context);
            }
        }
    }

    Ok(())
}

fn initialize_tracing(log_level: &str) -> anyhow::Result<()> {
    let env_filter = match log_level {
        "trace" => EnvFilter::new("trace"),
        "debug" => EnvFilter::new("debug"),
        "info" => EnvFilter::new("info"),
        "warn" => EnvFilter::new("warn"),
        "error" => EnvFilter::new("error"),
        _ => {
            eprintln!("Invalid log level: {}. Using 'warn'", log_level);
            EnvFilter::new("warn")
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    Ok(())
}

fn open_context(args: &Args, name: &str) -> anyhow::Result<StorageContext> {
    let config = StorageConfig {
        data_dir: Some(args.data_dir.clone()),
        cache_size_mb: args.cache_size_mb,
        flush_interval_ms: 0,
    };
    StorageContext::open(name, config).with_context(|| format!("Failed to open context {}", name))
}

/// Context names in `data_dir`, derived from their `<name>.db` directories.
fn list_contexts(data_dir: &Path) -> anyhow::Result<Vec<String>> {
    if !data_dir.exists() {
        return Ok(Vec::new());
    }

    let mut names = Vec::new();
    let entries = std::fs::read_dir(data_dir)
        .with_context(|| format!("Failed to read {}", data_dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        if path.extension().is_some_and(|ext| ext == "db") {
            if let Some(stem) = path.file_stem() {
                names.push(stem.to_string_lossy().into_owned());
            }
        }
    }
    names.sort();
    info!("Found {} contexts in {:?}", names.len(), data_dir);
    Ok(names)
}

fn print_stats(args: &Args, name: &str) -> anyhow::Result<()> {
    let ctx = open_context(args, name)?;
    let stats = ctx
        .stats()
        .with_context(|| format!("Failed to read stats of {}", name))?;
    ctx.close()?;

    println!("Context {} ({} bytes on disk)", stats.context, stats.size_on_disk);
    if stats.stores.is_empty() {
        println!("  (no stores)");
    }
    for store in &stats.stores {
        println!("  {:<5} {:<40} {:>10}", store.kind.to_string(), store.name, store.entries);
    }
    Ok(())
}
