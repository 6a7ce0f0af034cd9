use std::sync::Arc;

use anyhow::Result;
use banwatch_store::FileEntryStore;
use banwatch_sync::{ManifestClient, RefreshDriver, SyncConfig};
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "banwatch")]
#[command(about = "Banned server watchlist service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the watchlist page (scheduled or on-demand per BANWATCH_MODE).
    Serve,
    /// Run a single fetch + reconcile cycle and print a summary.
    Refresh,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            banwatch_web::serve_from_env().await?;
        }
        Commands::Refresh => {
            let config = SyncConfig::from_env();
            let store = Arc::new(FileEntryStore::open(&config.cache_dir).await?);
            let source = Arc::new(ManifestClient::new(&config)?);
            let driver = RefreshDriver::new(source, store);
            let snapshot = driver.run_once().await?;
            println!(
                "refresh complete: bans={} new={} cache_timestamp={}",
                snapshot.banned.len(),
                snapshot.newly_banned.len(),
                snapshot.cache_timestamp
            );
        }
    }

    Ok(())
}
