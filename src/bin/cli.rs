// ShelfSync - Offline Audiobook Sync for Mobile
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use shelfsync_core::api::{ServerClient, StaticToken};
use shelfsync_core::download::{DownloadOutcome, DownloadRequest};
use shelfsync_core::{Collaborators, OfflineSync, ServerConfig, SyncConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shelfsync-cli")]
#[command(about = "ShelfSync CLI - offline download testing tool", long_about = None)]
struct Cli {
    /// Server base URL
    #[arg(long, env = "SHELFSYNC_SERVER", default_value = "http://localhost:13378")]
    server: String,

    /// Bearer token for the server
    #[arg(long, env = "SHELFSYNC_TOKEN", default_value = "", hide_env_values = true)]
    token: String,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Download root (overrides the configuration file)
    #[arg(long)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download an item for offline use
    Download {
        /// Item id
        item_id: String,
    },
    /// List downloaded items
    List,
    /// Validate every downloaded item and remove broken ones
    Heal,
    /// Delete a downloaded item
    Delete {
        /// Item id
        item_id: String,
    },
    /// Show storage usage
    Usage,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::default(),
    };
    if let Some(root) = cli.root {
        config.download_root = root;
    }

    let client = Arc::new(
        ServerClient::new(ServerConfig::new(cli.server)).context("failed to build HTTP client")?,
    );
    let collaborators = Collaborators::from_server(client, Arc::new(StaticToken::new(cli.token)));
    let sync = OfflineSync::open(config, collaborators).await?;

    match cli.command {
        Commands::Download { item_id } => download(&sync, &item_id).await?,
        Commands::List => {
            let items = sync.manager().downloaded_items();
            if items.is_empty() {
                println!("No downloaded items");
            }
            for item in items {
                let size = sync.manager().storage_size_of(&item.id).await?;
                println!(
                    "{}  {} - {} ({:.1} MB)",
                    item.id,
                    item.title,
                    item.author,
                    size as f64 / 1_000_000.0
                );
            }
        }
        Commands::Heal => {
            let report = sync.healer().heal_once().await?;
            println!(
                "Scanned {} items: {} healthy, {} removed, {} skipped",
                report.scanned,
                report.healthy,
                report.removed.len(),
                report.skipped_active
            );
            for item_id in report.removed {
                println!("  removed {}", item_id);
            }
        }
        Commands::Delete { item_id } => {
            sync.manager().delete_item(&item_id).await?;
            println!("Deleted {}", item_id);
        }
        Commands::Usage => {
            let used = sync.manager().total_storage_used().await;
            let free = sync.storage().available_space().await?;
            println!("Root: {}", sync.config().download_root.display());
            println!("Used: {:.1} MB", used as f64 / 1_000_000.0);
            println!("Free: {:.1} MB", free as f64 / 1_000_000.0);
        }
    }

    Ok(())
}

async fn download(sync: &OfflineSync, item_id: &str) -> anyhow::Result<()> {
    let manager = sync.manager();
    let mut events = manager.subscribe();

    let handle = match manager.download_item(item_id).await? {
        DownloadRequest::Started(handle) => handle,
        DownloadRequest::AlreadyDownloaded => {
            println!("{} is already downloaded", item_id);
            return Ok(());
        }
        DownloadRequest::AlreadyActive(record) => {
            println!("{} is already downloading ({})", item_id, record.status);
            return Ok(());
        }
        DownloadRequest::Busy => bail!("{} is being checked, try again shortly", item_id),
    };

    let printer = tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "progress output fell behind");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            eprintln!("{}", event.display_string());
            if event.is_terminal() {
                break;
            }
        }
    });

    let wait = handle.wait();
    tokio::pin!(wait);
    let outcome = tokio::select! {
        outcome = &mut wait => outcome,
        _ = tokio::signal::ctrl_c() => {
            manager.cancel_download(item_id);
            wait.await
        }
    };
    let _ = printer.await;

    match outcome {
        DownloadOutcome::Completed => {
            println!("Downloaded {}", item_id);
            Ok(())
        }
        DownloadOutcome::Cancelled => bail!("download of {} was cancelled", item_id),
        DownloadOutcome::Failed { status, .. } => bail!("{}", status),
    }
}
