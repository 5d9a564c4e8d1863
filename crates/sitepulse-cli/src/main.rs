use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sitepulse_cache::{CacheConfig, DataCache};
use sitepulse_storage::BlobCache;
use sitepulse_sync::{IngestionPipeline, SnapshotSummary, SyncConfig};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "sitepulse")]
#[command(about = "Site progress ingestion and cache")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion and print a summary.
    Sync,
    /// Keep a cache warm with periodic refresh until Ctrl-C.
    Watch,
    /// Clear the local blob cache of source payloads.
    Invalidate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|raw| EnvFilter::try_new(raw.trim()).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = sitepulse_sync::ingest_once_from_env().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Watch => watch().await?,
        Commands::Invalidate => {
            let config = SyncConfig::from_env();
            let Some(dir) = config.blob_cache_dir else {
                eprintln!("SITEPULSE_BLOB_CACHE_DIR is not set; nothing to invalidate");
                return Ok(());
            };
            let removed = BlobCache::new(dir.clone())
                .clear()
                .await
                .with_context(|| format!("clearing {}", dir.display()))?;
            println!("removed {removed} cached payloads from {}", dir.display());
        }
    }

    Ok(())
}

async fn watch() -> Result<()> {
    let pipeline = IngestionPipeline::from_config(&SyncConfig::from_env()).await?;
    let cache = DataCache::new(Arc::new(pipeline), CacheConfig::from_env());
    cache.initialize().await?;

    let snapshot = cache.get_snapshot()?;
    println!("{}", serde_json::to_string_pretty(&SnapshotSummary::from(snapshot.as_ref()))?);
    info!(auto_refresh = cache.status().auto_refresh, "watching; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    cache.stop_auto_refresh().await;
    println!("{}", serde_json::to_string_pretty(&cache.status())?);
    Ok(())
}
