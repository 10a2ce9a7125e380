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


//! Download pipeline state machine
//!
//! One handler per stage, each returning the next stage or a failure:
//!
//! ```text
//! preparing -> fetchingMetadata -> downloadingCover -> downloadingAudio -> finalizing -> complete
//!      \              \                   \                   \                \
//!       +--------------+-------------------+-------------------+----------------+-> failed
//! ```
//!
//! Cancellation is checked on entry to every stage and between audio tracks,
//! and is raced against every network call, backoff sleep and pacing delay.
//! Audio tracks are fetched strictly in order, one at a time.
//!
//! The pipeline does not clean up after itself. Deleting the partial artifact
//! and emitting the terminal event is the manager's job, so that every
//! failure path goes through the same code.

use crate::api::models::{ContentItem, TrackDescriptor};
use crate::download::fetcher::{NetworkFetcher, PayloadKind};
use crate::download::progress::{
    audio_progress, DownloadEvent, Stage, PROGRESS_AUDIO_DONE, PROGRESS_COVER_DONE,
    PROGRESS_METADATA_FETCHED, PROGRESS_METADATA_PERSISTED, PROGRESS_PREPARED,
};
use crate::download::registry::DownloadLease;
use crate::download::retry::RetryPolicy;
use crate::error::SyncError;
use crate::file::storage::{AudioInfo, StorageService};
use crate::file::validation::{Validation, ValidationService};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Services and limits shared by every pipeline run
#[derive(Debug)]
pub struct PipelineContext {
    pub storage: Arc<StorageService>,
    pub validator: ValidationService,
    pub fetcher: NetworkFetcher,
    pub retry: RetryPolicy,
    pub min_free_bytes: u64,
    pub stage_pacing: Duration,
}

// ===== Failures =====

/// The part of an item a failure relates to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Storage,
    Metadata,
    Cover,
    Session,
    /// Audio track by zero-based index
    Track(usize),
    Artifact,
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::Storage => write!(f, "local storage"),
            Resource::Metadata => write!(f, "item details"),
            Resource::Cover => write!(f, "cover image"),
            Resource::Session => write!(f, "streaming session"),
            Resource::Track(index) => write!(f, "chapter {}", index + 1),
            Resource::Artifact => write!(f, "downloaded files"),
        }
    }
}

/// Why a pipeline run stopped short of `complete`
#[derive(Debug)]
pub struct PipelineFailure {
    pub stage: Stage,
    pub resource: Option<Resource>,
    pub error: SyncError,
}

impl PipelineFailure {
    fn new(stage: Stage, resource: Resource, error: SyncError) -> Self {
        Self {
            stage,
            resource: Some(resource),
            error,
        }
    }

    pub(crate) fn cancelled(stage: Stage) -> Self {
        Self {
            stage,
            resource: None,
            error: SyncError::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.error, SyncError::Cancelled)
    }

    /// User-facing status naming the failing resource
    ///
    /// Error detail stays in the logs.
    pub fn status(&self) -> String {
        match (&self.error, self.resource) {
            (SyncError::Cancelled, _) => "Download cancelled".to_string(),
            (SyncError::InsufficientStorage { .. }, _) => {
                "Not enough free storage for this download".to_string()
            }
            (SyncError::Validation(_), _) => "Downloaded files failed verification".to_string(),
            (_, Some(Resource::Storage)) => "Could not save files to local storage".to_string(),
            (_, Some(resource)) => format!("Failed to download {}", resource),
            (_, None) => "Download failed".to_string(),
        }
    }
}

impl std::fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.resource {
            Some(resource) => write!(f, "{} failed ({}): {}", self.stage, resource, self.error),
            None => write!(f, "{} failed: {}", self.stage, self.error),
        }
    }
}

type StageResult = std::result::Result<Stage, PipelineFailure>;

// ===== Pipeline =====

/// One run of the download state machine for a single item
pub struct Pipeline<'a> {
    ctx: &'a PipelineContext,
    lease: &'a DownloadLease,
    events: &'a broadcast::Sender<DownloadEvent>,
    item: Option<ContentItem>,
    tracks: Vec<TrackDescriptor>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        ctx: &'a PipelineContext,
        lease: &'a DownloadLease,
        events: &'a broadcast::Sender<DownloadEvent>,
    ) -> Self {
        Self {
            ctx,
            lease,
            events,
            item: None,
            tracks: Vec::new(),
        }
    }

    fn item_id(&self) -> &'a str {
        self.lease.item_id()
    }

    /// Drive the state machine to `complete` or a failure
    ///
    /// On success returns the item's metadata as persisted.
    pub async fn run(mut self) -> std::result::Result<ContentItem, PipelineFailure> {
        let mut stage = Stage::Preparing;

        while !stage.is_terminal() {
            self.enter(stage)?;

            stage = match stage {
                Stage::Preparing => self.prepare().await?,
                Stage::FetchingMetadata => self.fetch_metadata().await?,
                Stage::DownloadingCover => self.download_cover().await?,
                Stage::DownloadingAudio => self.download_audio().await?,
                Stage::Finalizing => self.finalize().await?,
                Stage::Complete | Stage::Failed => stage,
            };
        }

        match (stage, self.item.take()) {
            (Stage::Complete, Some(item)) => Ok(item),
            _ => Err(PipelineFailure::new(
                Stage::Finalizing,
                Resource::Artifact,
                SyncError::internal("pipeline finished without item metadata"),
            )),
        }
    }

    /// Stage entry: cancellation checkpoint and stage event
    fn enter(&self, stage: Stage) -> std::result::Result<(), PipelineFailure> {
        if self.lease.is_cancelled() {
            return Err(PipelineFailure::cancelled(stage));
        }

        tracing::debug!(item_id = %self.item_id(), stage = %stage, "entering stage");
        let status = match stage {
            Stage::Preparing => "Preparing download",
            Stage::FetchingMetadata => "Fetching details",
            Stage::DownloadingCover => "Downloading cover",
            Stage::DownloadingAudio => "Preparing audio",
            Stage::Finalizing => "Verifying download",
            Stage::Complete | Stage::Failed => "",
        };
        self.report(Some(stage), None, status);
        Ok(())
    }

    /// Update the record and broadcast its snapshot
    fn report(&self, stage: Option<Stage>, progress: Option<f64>, status: &str) {
        let snapshot = self.lease.update(|record| {
            if let Some(stage) = stage {
                record.stage = stage;
            }
            if let Some(progress) = progress {
                record.advance(progress);
            }
            record.status = status.to_string();
        });

        if let Some(record) = snapshot {
            // No subscribers is fine
            let _ = self.events.send(record.event());
        }
    }

    /// Cancellable pause between stages
    async fn pace(&self, stage: Stage) -> std::result::Result<(), PipelineFailure> {
        if self.ctx.stage_pacing.is_zero() {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = self.lease.cancel_token().cancelled() => Err(PipelineFailure::cancelled(stage)),
            _ = tokio::time::sleep(self.ctx.stage_pacing) => Ok(()),
        }
    }

    fn metadata(&self, stage: Stage) -> std::result::Result<&ContentItem, PipelineFailure> {
        self.item.as_ref().ok_or_else(|| {
            PipelineFailure::new(
                stage,
                Resource::Metadata,
                SyncError::internal("item metadata not loaded"),
            )
        })
    }

    // ===== Stage handlers =====

    async fn prepare(&mut self) -> StageResult {
        let stage = Stage::Preparing;
        let storage = &self.ctx.storage;

        storage
            .ensure_free_space(self.ctx.min_free_bytes)
            .await
            .map_err(|e| PipelineFailure::new(stage, Resource::Storage, e))?;

        // Validity was ruled out before the pipeline started, so anything
        // left here is a partial artifact from an earlier run
        let leftover = storage
            .item_exists(self.item_id())
            .await
            .map_err(|e| PipelineFailure::new(stage, Resource::Storage, e))?;
        if leftover {
            tracing::warn!(item_id = %self.item_id(), "removing leftover partial download");
            storage
                .delete_item(self.item_id())
                .await
                .map_err(|e| PipelineFailure::new(stage, Resource::Storage, e))?;
        }

        storage
            .prepare_item(self.item_id())
            .await
            .map_err(|e| PipelineFailure::new(stage, Resource::Storage, e))?;

        self.report(None, Some(PROGRESS_PREPARED), "Storage ready");
        self.pace(stage).await?;
        Ok(Stage::FetchingMetadata)
    }

    async fn fetch_metadata(&mut self) -> StageResult {
        let stage = Stage::FetchingMetadata;
        let ctx = self.ctx;
        let token = self.lease.cancel_token();
        let item_id = self.item_id();

        let item = ctx
            .retry
            .run("item details", token, move |_| {
                ctx.fetcher.fetch_item_details(item_id, token)
            })
            .await
            .map_err(|e| PipelineFailure::new(stage, Resource::Metadata, e))?;
        self.report(None, Some(PROGRESS_METADATA_FETCHED), "Saving details");

        ctx.storage
            .write_metadata(&item)
            .await
            .map_err(|e| PipelineFailure::new(stage, Resource::Storage, e))?;
        self.report(None, Some(PROGRESS_METADATA_PERSISTED), "Details saved");

        self.item = Some(item);
        self.pace(stage).await?;
        Ok(Stage::DownloadingCover)
    }

    async fn download_cover(&mut self) -> StageResult {
        let stage = Stage::DownloadingCover;
        let ctx = self.ctx;
        let token = self.lease.cancel_token();
        let url = ctx.fetcher.cover_url(self.metadata(stage)?);
        let url = url.as_str();

        let bytes = ctx
            .retry
            .run(&Resource::Cover.to_string(), token, move |_| {
                ctx.fetcher.fetch_bytes(url, PayloadKind::Cover, token)
            })
            .await
            .map_err(|e| PipelineFailure::new(stage, Resource::Cover, e))?;

        ctx.storage
            .write_cover(self.item_id(), &bytes)
            .await
            .map_err(|e| PipelineFailure::new(stage, Resource::Storage, e))?;
        self.report(None, Some(PROGRESS_COVER_DONE), "Cover downloaded");

        self.pace(stage).await?;
        Ok(Stage::DownloadingAudio)
    }

    async fn download_audio(&mut self) -> StageResult {
        let stage = Stage::DownloadingAudio;
        let ctx = self.ctx;
        let token = self.lease.cancel_token();
        let item_id = self.item_id();

        let negotiated = ctx
            .retry
            .run(&Resource::Session.to_string(), token, move |_| {
                ctx.fetcher.negotiate_streaming_session(item_id, token)
            })
            .await
            .map_err(|e| PipelineFailure::new(stage, Resource::Session, e))?;

        // Files are named by position in the session, whatever the server
        // used for its own indices
        let tracks: Vec<TrackDescriptor> = negotiated
            .into_iter()
            .enumerate()
            .map(|(index, track)| TrackDescriptor { index, ..track })
            .collect();

        let chapter_count = self.metadata(stage)?.chapters.len();
        if chapter_count != tracks.len() {
            tracing::info!(
                item_id = %item_id,
                chapters = chapter_count,
                tracks = tracks.len(),
                "track count differs from chapter count"
            );
        }

        let total = tracks.len();
        for track in &tracks {
            if token.is_cancelled() {
                return Err(PipelineFailure::cancelled(stage));
            }

            let resource = Resource::Track(track.index);
            self.report(
                None,
                None,
                &format!("Downloading chapter {} of {}", track.index + 1, total),
            );

            let bytes = ctx
                .retry
                .run(&resource.to_string(), token, move |_| {
                    ctx.fetcher
                        .fetch_bytes(&track.content_url, PayloadKind::Audio, token)
                })
                .await
                .map_err(|e| PipelineFailure::new(stage, resource, e))?;

            ctx.storage
                .write_audio_track(item_id, track, &bytes)
                .await
                .map_err(|e| PipelineFailure::new(stage, Resource::Storage, e))?;

            tracing::debug!(item_id = %item_id, track = track.index, bytes = bytes.len(), "track saved");
            self.report(
                None,
                Some(audio_progress(track.index + 1, total)),
                &format!("Downloaded chapter {} of {}", track.index + 1, total),
            );
        }

        self.tracks = tracks;
        self.pace(stage).await?;
        Ok(Stage::Finalizing)
    }

    async fn finalize(&mut self) -> StageResult {
        let stage = Stage::Finalizing;
        let ctx = self.ctx;

        ctx.storage
            .write_audio_info(self.item_id(), &AudioInfo::from_tracks(&self.tracks))
            .await
            .map_err(|e| PipelineFailure::new(stage, Resource::Storage, e))?;

        match ctx.validator.validate(self.item_id()).await {
            Ok(Validation::Valid) => {}
            Ok(Validation::Invalid(failure)) => {
                return Err(PipelineFailure::new(
                    stage,
                    Resource::Artifact,
                    SyncError::Validation(failure),
                ))
            }
            Err(e) => return Err(PipelineFailure::new(stage, Resource::Artifact, e)),
        }

        if self.lease.is_cancelled() {
            return Err(PipelineFailure::cancelled(stage));
        }

        self.report(None, Some(PROGRESS_AUDIO_DONE), "Download verified");
        Ok(Stage::Complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::traits::{ByteTransport, ItemProvider, StaticToken, TransportResponse};
    use crate::config::SyncConfig;
    use crate::download::fetcher::Collaborators;
    use crate::download::registry::DownloadRegistry;
    use crate::error::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct FakeServer {
        tracks: usize,
        transfers: AtomicUsize,
    }

    #[async_trait]
    impl ItemProvider for FakeServer {
        async fn fetch_item_details(&self, item_id: &str, _token: &str) -> Result<ContentItem> {
            Ok(ContentItem {
                id: item_id.to_string(),
                title: "Book".to_string(),
                author: "Author".to_string(),
                chapters: vec![],
                cover_path: Some("/cover".to_string()),
            })
        }

        async fn negotiate_streaming_session(
            &self,
            _item_id: &str,
            _token: &str,
        ) -> Result<Vec<TrackDescriptor>> {
            // Server indices start at 1; files must still start at 0
            Ok((1..=self.tracks)
                .map(|index| TrackDescriptor {
                    index,
                    content_url: format!("https://cdn.example.com/{}.mp3", index),
                    duration: 10.0,
                    mime_type: None,
                })
                .collect())
        }

        fn cover_url(&self, item: &ContentItem) -> String {
            format!("https://cdn.example.com/{}/cover.jpg", item.id)
        }
    }

    #[async_trait]
    impl ByteTransport for FakeServer {
        async fn get(&self, url: &str, _token: &str, _timeout: Duration) -> Result<TransportResponse> {
            self.transfers.fetch_add(1, Ordering::SeqCst);
            let size = if url.ends_with("cover.jpg") { 2048 } else { 20_000 };
            Ok(TransportResponse::ok(vec![7u8; size]))
        }
    }

    struct Harness {
        _temp_dir: TempDir,
        ctx: PipelineContext,
        server: Arc<FakeServer>,
        registry: DownloadRegistry,
        events: broadcast::Sender<DownloadEvent>,
    }

    fn harness(tracks: usize, min_free_bytes: u64) -> Harness {
        let temp_dir = TempDir::new().unwrap();
        let config = SyncConfig::builder()
            .download_root(temp_dir.path())
            .min_free_bytes(min_free_bytes)
            .stage_pacing(Duration::ZERO)
            .build();
        let server = Arc::new(FakeServer {
            tracks,
            transfers: AtomicUsize::new(0),
        });
        let collaborators = Collaborators {
            provider: server.clone(),
            transport: server.clone(),
            credentials: Arc::new(StaticToken::new("token")),
        };
        let storage = Arc::new(StorageService::new(config.download_root.clone()));
        let ctx = PipelineContext {
            validator: ValidationService::new(
                storage.clone(),
                config.min_cover_bytes,
                config.min_audio_bytes,
            ),
            storage,
            fetcher: NetworkFetcher::new(collaborators, &config),
            retry: RetryPolicy::from(&config.retry),
            min_free_bytes: config.min_free_bytes,
            stage_pacing: config.stage_pacing(),
        };
        let (events, _) = broadcast::channel(64);

        Harness {
            _temp_dir: temp_dir,
            ctx,
            server,
            registry: DownloadRegistry::new(),
            events,
        }
    }

    #[tokio::test]
    async fn test_full_run_reaches_complete() {
        let h = harness(3, 0);
        let lease = h.registry.try_begin_download("B1").unwrap();

        let item = Pipeline::new(&h.ctx, &lease, &h.events).run().await.unwrap();

        assert_eq!(item.id, "B1");
        let info = h.ctx.storage.read_audio_info("B1").await.unwrap().unwrap();
        assert_eq!(info.track_count, 3);
        assert_eq!(
            h.ctx.storage.audio_files("B1").await.unwrap().keys().copied().collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        let progress = h.registry.record("B1").unwrap().progress;
        assert!((progress - PROGRESS_AUDIO_DONE).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_prepare_rejects_low_storage_without_network() {
        let h = harness(1, u64::MAX);
        let lease = h.registry.try_begin_download("B1").unwrap();
        let mut pipeline = Pipeline::new(&h.ctx, &lease, &h.events);

        let failure = pipeline.prepare().await.unwrap_err();

        assert_eq!(failure.stage, Stage::Preparing);
        assert!(matches!(failure.error, SyncError::InsufficientStorage { .. }));
        assert_eq!(h.server.transfers.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_prepare_clears_leftover() {
        let h = harness(1, 0);
        let layout = h.ctx.storage.prepare_item("B1").await.unwrap();
        std::fs::write(layout.audio_track(0, "mp3"), b"partial").unwrap();

        let lease = h.registry.try_begin_download("B1").unwrap();
        let mut pipeline = Pipeline::new(&h.ctx, &lease, &h.events);
        assert_eq!(pipeline.prepare().await.unwrap(), Stage::FetchingMetadata);

        assert!(h.ctx.storage.audio_files("B1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cover_stage_requires_metadata() {
        let h = harness(1, 0);
        let lease = h.registry.try_begin_download("B1").unwrap();
        let mut pipeline = Pipeline::new(&h.ctx, &lease, &h.events);

        let failure = pipeline.download_cover().await.unwrap_err();
        assert_eq!(failure.stage, Stage::DownloadingCover);
        assert_eq!(failure.resource, Some(Resource::Metadata));
    }

    #[tokio::test]
    async fn test_cancelled_lease_stops_at_stage_entry() {
        let h = harness(1, 0);
        let lease = h.registry.try_begin_download("B1").unwrap();
        h.registry.cancel("B1");

        let failure = Pipeline::new(&h.ctx, &lease, &h.events).run().await.unwrap_err();

        assert!(failure.is_cancelled());
        assert_eq!(failure.stage, Stage::Preparing);
        assert_eq!(failure.status(), "Download cancelled");
        assert_eq!(h.server.transfers.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failure_status_names_resource() {
        let failure = PipelineFailure::new(
            Stage::DownloadingAudio,
            Resource::Track(3),
            SyncError::http_status(500, "<html>boom</html>"),
        );
        assert_eq!(failure.status(), "Failed to download chapter 4");

        let failure = PipelineFailure::new(
            Stage::DownloadingCover,
            Resource::Cover,
            SyncError::UndersizedResponse { received: 12, minimum: 1024 },
        );
        assert_eq!(failure.status(), "Failed to download cover image");
    }
}
