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


//! Download manager
//!
//! Public face of the download pipeline. Accepts download requests, keeps
//! at most one pipeline per item, runs each pipeline as its own tokio task
//! and reports progress on a broadcast channel.
//!
//! # Terminal handling
//! Every run ends in exactly one terminal event:
//! - success: the item joins the offline library, then `complete` is emitted
//! - failure or cancellation: the partial artifact is deleted, then `failed`
//!   is emitted
//!
//! The registry entry is released before the terminal event goes out, so a
//! subscriber may immediately retry a failed item.

use crate::api::models::ContentItem;
use crate::download::pipeline::{Pipeline, PipelineContext, PipelineFailure};
use crate::download::progress::{DownloadEvent, DownloadRecord, Stage, PROGRESS_COMPLETE};
use crate::download::registry::{DownloadLease, DownloadRegistry};
use crate::error::{Result, SyncError};
use crate::file::layout::validate_item_id;
use crate::file::library::OfflineLibrary;
use crate::file::storage::StorageService;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// How long `delete_item` waits before re-checking a busy item
const CLAIM_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Result of a download request
#[derive(Debug)]
pub enum DownloadRequest {
    /// A new pipeline was started
    Started(DownloadHandle),
    /// A pipeline is already running for this item; nothing was started
    AlreadyActive(DownloadRecord),
    /// The item is already downloaded and valid; nothing was touched
    AlreadyDownloaded,
    /// The healer is inspecting this item; try again shortly
    Busy,
}

impl DownloadRequest {
    pub fn is_started(&self) -> bool {
        matches!(self, DownloadRequest::Started(_))
    }

    pub fn into_handle(self) -> Option<DownloadHandle> {
        match self {
            DownloadRequest::Started(handle) => Some(handle),
            _ => None,
        }
    }
}

/// How a pipeline run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed,
    Failed { stage: Stage, status: String },
    Cancelled,
}

/// Handle to a running download
#[derive(Debug)]
pub struct DownloadHandle {
    item_id: String,
    task: JoinHandle<DownloadOutcome>,
}

impl DownloadHandle {
    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    /// Wait for the pipeline to finish, including cleanup
    pub async fn wait(self) -> DownloadOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(item_id = %self.item_id, error = %e, "download task aborted");
                DownloadOutcome::Failed {
                    stage: Stage::Failed,
                    status: "Download failed".to_string(),
                }
            }
        }
    }
}

/// Download manager
pub struct DownloadManager {
    ctx: Arc<PipelineContext>,
    registry: DownloadRegistry,
    library: Arc<OfflineLibrary>,
    events: broadcast::Sender<DownloadEvent>,
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("active", &self.registry.active_downloads())
            .field("downloaded", &self.library.len())
            .finish()
    }
}

impl DownloadManager {
    pub fn new(
        ctx: Arc<PipelineContext>,
        registry: DownloadRegistry,
        library: Arc<OfflineLibrary>,
        event_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            ctx,
            registry,
            library,
            events,
        }
    }

    fn storage(&self) -> &StorageService {
        &self.ctx.storage
    }

    /// Request a download of `item_id`
    ///
    /// Starts a pipeline only if the item is neither active nor already
    /// validly downloaded. Must be called from within a tokio runtime.
    pub async fn download_item(&self, item_id: &str) -> Result<DownloadRequest> {
        validate_item_id(item_id)?;

        let Some(lease) = self.registry.try_begin_download(item_id) else {
            return Ok(match self.registry.record(item_id) {
                Some(record) => {
                    tracing::debug!(item_id, "download already active");
                    DownloadRequest::AlreadyActive(record)
                }
                None => DownloadRequest::Busy,
            });
        };

        // Checked under the lease so the healer cannot delete in between
        if self.ctx.validator.validate(item_id).await?.is_valid() {
            if !self.library.contains(item_id) {
                if let Some(item) = self.storage().read_metadata(item_id).await? {
                    self.library.insert(item);
                }
            }
            tracing::debug!(item_id, "already downloaded");
            return Ok(DownloadRequest::AlreadyDownloaded);
        }

        tracing::info!(item_id, "starting download");
        let task = tokio::spawn(run_download(
            self.ctx.clone(),
            lease,
            self.events.clone(),
            self.library.clone(),
        ));

        Ok(DownloadRequest::Started(DownloadHandle {
            item_id: item_id.to_string(),
            task,
        }))
    }

    /// Signal cancellation of one download without waiting for it
    pub fn cancel_download(&self, item_id: &str) -> bool {
        let cancelled = self.registry.cancel(item_id);
        if cancelled {
            tracing::info!(item_id, "download cancellation requested");
        }
        cancelled
    }

    /// Signal cancellation of every active download
    pub fn cancel_all(&self) -> usize {
        let count = self.registry.cancel_all();
        if count > 0 {
            tracing::info!(count, "cancelling all downloads");
        }
        count
    }

    pub fn is_downloaded(&self, item_id: &str) -> bool {
        self.library.contains(item_id)
    }

    pub fn is_downloading(&self, item_id: &str) -> bool {
        self.registry.is_downloading(item_id)
    }

    /// Snapshot of an active download
    pub fn record(&self, item_id: &str) -> Option<DownloadRecord> {
        self.registry.record(item_id)
    }

    pub fn downloaded_items(&self) -> Vec<ContentItem> {
        self.library.items()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events.subscribe()
    }

    /// Bytes used by one item on disk
    pub async fn storage_size_of(&self, item_id: &str) -> Result<u64> {
        self.storage().item_size(item_id).await
    }

    /// Bytes used by every item on disk
    pub async fn total_storage_used(&self) -> u64 {
        self.storage().total_size().await
    }

    /// Delete an item
    ///
    /// An active download is cancelled first. The directory is removed under
    /// a repair claim once the pipeline has released the id, so a download
    /// that was already committed cannot re-publish the item afterwards.
    pub async fn delete_item(&self, item_id: &str) -> Result<()> {
        validate_item_id(item_id)?;

        loop {
            if self.registry.cancel(item_id) {
                tracing::info!(item_id, "cancelling active download before delete");
            }

            if let Some(_claim) = self.registry.try_begin_repair(item_id) {
                self.storage().delete_item(item_id).await?;
                self.library.remove(item_id);
                tracing::info!(item_id, "deleted item");
                return Ok(());
            }

            tokio::time::sleep(CLAIM_RETRY_DELAY).await;
        }
    }

    /// Cancel everything and delete every persisted item
    ///
    /// Returns the number of item directories removed.
    pub async fn delete_all(&self) -> Result<usize> {
        self.cancel_all();

        let ids = self.storage().list_item_ids().await?;
        for item_id in &ids {
            self.delete_item(item_id).await?;
        }

        self.library.clear();
        tracing::info!(removed = ids.len(), "deleted all items");
        Ok(ids.len())
    }
}

/// Run one pipeline and handle its terminal transition
async fn run_download(
    ctx: Arc<PipelineContext>,
    lease: DownloadLease,
    events: broadcast::Sender<DownloadEvent>,
    library: Arc<OfflineLibrary>,
) -> DownloadOutcome {
    let item_id = lease.item_id().to_string();
    let result = match Pipeline::new(&ctx, &lease, &events).run().await {
        // A cancel that lands after the last stage check still wins
        Ok(_) if !lease.commit() => Err(PipelineFailure::cancelled(Stage::Finalizing)),
        other => other,
    };

    let (outcome, terminal) = match result {
        Ok(item) => {
            library.insert(item);
            let terminal = lease.update(|record| {
                record.stage = Stage::Complete;
                record.advance(PROGRESS_COMPLETE);
                record.status = "Downloaded".to_string();
            });
            tracing::info!(item_id = %item_id, "download complete");
            (DownloadOutcome::Completed, terminal)
        }
        Err(failure) => {
            if failure.is_cancelled() {
                tracing::info!(item_id = %item_id, stage = %failure.stage, "download cancelled");
            } else {
                tracing::warn!(item_id = %item_id, "download failed: {}", failure);
            }

            if let Err(e) = ctx.storage.delete_item(&item_id).await {
                tracing::error!(item_id = %item_id, error = %e, "failed to remove partial download");
            }

            let status = failure.status();
            let terminal = lease.update(|record| {
                record.stage = Stage::Failed;
                record.status = status.clone();
            });
            let outcome = match failure.error {
                SyncError::Cancelled => DownloadOutcome::Cancelled,
                _ => DownloadOutcome::Failed {
                    stage: failure.stage,
                    status,
                },
            };
            (outcome, terminal)
        }
    };

    drop(lease);

    if let Some(record) = terminal {
        let _ = events.send(record.event());
    }

    outcome
}
