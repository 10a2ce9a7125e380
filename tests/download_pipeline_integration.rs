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


//! End-to-end tests of the download pipeline against an in-memory server

mod common;

use common::{drain, open, test_config, Failure, FakeServer, TRACK_SIZE};
use shelfsync_core::download::{DownloadEvent, DownloadOutcome, DownloadRequest, Stage};
use shelfsync_core::OfflineSync;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

async fn download(sync: &OfflineSync, item_id: &str) -> DownloadOutcome {
    sync.manager()
        .download_item(item_id)
        .await
        .unwrap()
        .into_handle()
        .expect("download should start")
        .wait()
        .await
}

/// Wait until the item's pipeline reports an audio transfer in flight
async fn wait_for_audio(events: &mut broadcast::Receiver<DownloadEvent>, item_id: &str) {
    loop {
        let event = events.recv().await.unwrap();
        if event.item_id == item_id
            && event.stage == Stage::DownloadingAudio
            && event.status.starts_with("Downloading chapter")
        {
            return;
        }
        assert!(!event.is_terminal(), "pipeline ended early: {:?}", event);
    }
}

/// Wait until the item's pipeline enters `stage`
async fn wait_for_stage(
    events: &mut broadcast::Receiver<DownloadEvent>,
    item_id: &str,
    stage: Stage,
) {
    loop {
        let event = events.recv().await.unwrap();
        if event.item_id == item_id && event.stage == stage {
            return;
        }
        assert!(!event.is_terminal(), "pipeline ended early: {:?}", event);
    }
}

fn assert_monotonic(events: &[DownloadEvent]) {
    for pair in events.windows(2) {
        assert!(
            pair[1].progress >= pair[0].progress,
            "progress went backwards: {:?} -> {:?}",
            pair[0],
            pair[1]
        );
    }
}

fn terminal_count(events: &[DownloadEvent], item_id: &str) -> usize {
    events
        .iter()
        .filter(|e| e.item_id == item_id && e.is_terminal())
        .count()
}

#[tokio::test(start_paused = true)]
async fn test_flaky_track_recovers_within_retry_budget() {
    let temp_dir = TempDir::new().unwrap();
    let server = FakeServer::new();
    server.add_item("B1", 3, 3);
    let track = FakeServer::track_url("B1", 2);
    server.fail(&track, 2, Failure::Status(503));

    let sync = open(test_config(temp_dir.path()), &server).await;
    let mut events = sync.manager().subscribe();

    let outcome = download(&sync, "B1").await;

    assert_eq!(outcome, DownloadOutcome::Completed);
    assert!(sync.manager().is_downloaded("B1"));
    assert_eq!(server.requests_for(&track), 3);

    let raw = std::fs::read_to_string(temp_dir.path().join("B1/audio_info.json")).unwrap();
    let info: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(info["trackCount"], 3);

    let events = drain(&mut events);
    assert_monotonic(&events);
    let last = events.last().unwrap();
    assert_eq!(last.stage, Stage::Complete);
    assert_eq!(last.progress, 1.0);
    assert!(events.iter().all(|e| e.stage != Stage::Failed));
}

#[tokio::test]
async fn test_track_count_differs_from_chapter_count() {
    let temp_dir = TempDir::new().unwrap();
    let server = FakeServer::new();
    server.add_item("B2", 2, 5);

    let sync = open(test_config(temp_dir.path()), &server).await;
    assert_eq!(download(&sync, "B2").await, DownloadOutcome::Completed);

    let info = sync.storage().read_audio_info("B2").await.unwrap().unwrap();
    assert_eq!(info.track_count, 5);
    let item = sync.storage().read_metadata("B2").await.unwrap().unwrap();
    assert_eq!(item.chapters.len(), 2);

    let validator = shelfsync_core::file::ValidationService::new(
        sync.storage().clone(),
        sync.config().min_cover_bytes,
        sync.config().min_audio_bytes,
    );
    assert!(validator.validate("B2").await.unwrap().is_valid());
}

#[tokio::test(start_paused = true)]
async fn test_failing_cover_gives_up_after_backoff_schedule() {
    let temp_dir = TempDir::new().unwrap();
    let server = FakeServer::new();
    server.add_item("B3", 1, 1);
    let cover = FakeServer::cover_url_for("B3");
    server.fail_always(&cover, Failure::Undersized);

    let sync = open(test_config(temp_dir.path()), &server).await;
    let start = tokio::time::Instant::now();

    let outcome = download(&sync, "B3").await;

    let elapsed = start.elapsed();
    assert_eq!(server.requests_for(&cover), 3);
    assert!(elapsed >= Duration::from_secs(7), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(8), "elapsed {:?}", elapsed);
    assert_eq!(
        outcome,
        DownloadOutcome::Failed {
            stage: Stage::DownloadingCover,
            status: "Failed to download cover image".to_string(),
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_download_leaves_nothing_behind() {
    let temp_dir = TempDir::new().unwrap();
    let server = FakeServer::new();
    server.add_item("B4", 5, 5);
    server.fail_always(&FakeServer::track_url("B4", 3), Failure::Status(500));

    let sync = open(test_config(temp_dir.path()), &server).await;
    let mut events = sync.manager().subscribe();

    let outcome = download(&sync, "B4").await;

    assert!(matches!(
        outcome,
        DownloadOutcome::Failed { stage: Stage::DownloadingAudio, ref status } if status == "Failed to download chapter 4"
    ));
    assert!(!temp_dir.path().join("B4").exists());
    assert!(!sync.manager().is_downloaded("B4"));
    assert!(!sync.manager().is_downloading("B4"));

    // Tracks after the failing one were never requested
    assert_eq!(server.requests_for(&FakeServer::track_url("B4", 4)), 0);

    let events = drain(&mut events);
    assert_eq!(terminal_count(&events, "B4"), 1);
    let last = events.last().unwrap();
    assert_eq!(last.stage, Stage::Failed);
    assert!(!last.status.contains("500"));
}

#[tokio::test]
async fn test_insufficient_storage_fails_before_network() {
    let temp_dir = TempDir::new().unwrap();
    let server = FakeServer::new();
    server.add_item("B5", 1, 1);

    let mut config = test_config(temp_dir.path());
    config.min_free_bytes = u64::MAX;
    let sync = open(config, &server).await;

    let outcome = download(&sync, "B5").await;

    assert!(matches!(
        outcome,
        DownloadOutcome::Failed { stage: Stage::Preparing, .. }
    ));
    assert_eq!(server.details_calls(), 0);
    assert!(server.requests().is_empty());
    assert!(!temp_dir.path().join("B5").exists());
}

#[tokio::test]
async fn test_completed_item_is_not_downloaded_again() {
    let temp_dir = TempDir::new().unwrap();
    let server = FakeServer::new();
    server.add_item("B6", 2, 2);

    let sync = open(test_config(temp_dir.path()), &server).await;
    assert_eq!(download(&sync, "B6").await, DownloadOutcome::Completed);

    let metadata_path = temp_dir.path().join("B6/metadata.json");
    let before = std::fs::metadata(&metadata_path).unwrap().modified().unwrap();
    let requests = server.requests().len();

    let request = sync.manager().download_item("B6").await.unwrap();

    assert!(matches!(request, DownloadRequest::AlreadyDownloaded));
    assert_eq!(server.requests().len(), requests);
    assert_eq!(server.details_calls(), 1);
    let after = std::fs::metadata(&metadata_path).unwrap().modified().unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_concurrent_requests_run_one_pipeline() {
    let temp_dir = TempDir::new().unwrap();
    let server = FakeServer::new();
    server.add_item("B7", 2, 2);
    server.hold_audio();

    let sync = open(test_config(temp_dir.path()), &server).await;
    let mut events = sync.manager().subscribe();

    let (first, second) = tokio::join!(
        sync.manager().download_item("B7"),
        sync.manager().download_item("B7")
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    let started = [&first, &second].iter().filter(|r| r.is_started()).count();
    assert_eq!(started, 1);
    assert!([&first, &second]
        .iter()
        .any(|r| matches!(r, DownloadRequest::AlreadyActive(record) if record.item_id == "B7")));

    let handle = first.into_handle().or(second.into_handle()).unwrap();
    wait_for_audio(&mut events, "B7").await;

    // A third request while the first is mid-transfer is still a no-op
    assert!(matches!(
        sync.manager().download_item("B7").await.unwrap(),
        DownloadRequest::AlreadyActive(_)
    ));

    server.release_audio();
    assert_eq!(handle.wait().await, DownloadOutcome::Completed);

    let events = drain(&mut events);
    assert_eq!(terminal_count(&events, "B7"), 1);
    assert_eq!(server.details_calls(), 1);
}

#[tokio::test]
async fn test_cancel_mid_transfer_removes_artifact() {
    let temp_dir = TempDir::new().unwrap();
    let server = FakeServer::new();
    server.add_item("B8", 3, 3);
    server.hold_audio();

    let sync = open(test_config(temp_dir.path()), &server).await;
    let mut events = sync.manager().subscribe();

    let handle = sync
        .manager()
        .download_item("B8")
        .await
        .unwrap()
        .into_handle()
        .unwrap();
    wait_for_audio(&mut events, "B8").await;
    assert!(temp_dir.path().join("B8/cover.jpg").exists());

    assert!(sync.manager().cancel_download("B8"));
    assert_eq!(handle.wait().await, DownloadOutcome::Cancelled);

    assert!(!temp_dir.path().join("B8").exists());
    assert!(!sync.manager().is_downloading("B8"));
    assert!(!sync.manager().is_downloaded("B8"));

    let events = drain(&mut events);
    let last = events.last().unwrap();
    assert_eq!(last.stage, Stage::Failed);
    assert_eq!(last.status, "Download cancelled");
    assert_eq!(terminal_count(&events, "B8"), 1);
}

#[tokio::test]
async fn test_delete_while_finalizing_is_not_undone() {
    let temp_dir = TempDir::new().unwrap();
    let server = FakeServer::new();
    server.add_item("D1", 2, 2);

    let sync = open(test_config(temp_dir.path()), &server).await;
    let mut events = sync.manager().subscribe();

    let handle = sync
        .manager()
        .download_item("D1")
        .await
        .unwrap()
        .into_handle()
        .unwrap();
    wait_for_stage(&mut events, "D1", Stage::Finalizing).await;

    sync.manager().delete_item("D1").await.unwrap();
    handle.wait().await;

    assert!(!sync.manager().is_downloaded("D1"));
    assert!(!sync.manager().is_downloading("D1"));
    assert!(!temp_dir.path().join("D1").exists());
}

#[tokio::test]
async fn test_cancel_while_finalizing_wins_over_completion() {
    let temp_dir = TempDir::new().unwrap();
    let server = FakeServer::new();
    server.add_item("D2", 2, 2);

    let sync = open(test_config(temp_dir.path()), &server).await;
    let mut events = sync.manager().subscribe();

    let handle = sync
        .manager()
        .download_item("D2")
        .await
        .unwrap()
        .into_handle()
        .unwrap();
    wait_for_stage(&mut events, "D2", Stage::Finalizing).await;

    let cancelled = sync.manager().cancel_download("D2");
    let outcome = handle.wait().await;

    // A cancel that was accepted must end in cancellation, never completion
    if cancelled {
        assert_eq!(outcome, DownloadOutcome::Cancelled);
        assert!(!sync.manager().is_downloaded("D2"));
        assert!(!temp_dir.path().join("D2").exists());
    } else {
        assert_eq!(outcome, DownloadOutcome::Completed);
        assert!(sync.manager().is_downloaded("D2"));
    }

    let events = drain(&mut events);
    assert_eq!(terminal_count(&events, "D2"), 1);
}

#[tokio::test]
async fn test_healer_skips_active_and_removes_invalid() {
    let temp_dir = TempDir::new().unwrap();
    let server = FakeServer::new();
    server.add_item("done", 1, 1);
    server.add_item("active", 2, 2);

    let sync = open(test_config(temp_dir.path()), &server).await;
    assert_eq!(download(&sync, "done").await, DownloadOutcome::Completed);

    // Truncate a track of the finished item
    let track = temp_dir.path().join("done/audio/chapter_0.mp3");
    std::fs::write(&track, &vec![0u8; TRACK_SIZE / 4]).unwrap();

    server.hold_audio();
    let mut events = sync.manager().subscribe();
    let handle = sync
        .manager()
        .download_item("active")
        .await
        .unwrap()
        .into_handle()
        .unwrap();
    wait_for_audio(&mut events, "active").await;

    let report = sync.healer().heal_once().await.unwrap();

    assert_eq!(report.skipped_active, 1);
    assert_eq!(report.removed, vec!["done".to_string()]);
    assert!(!sync.manager().is_downloaded("done"));
    assert!(!temp_dir.path().join("done").exists());
    assert!(temp_dir.path().join("active/metadata.json").exists());
    assert!(temp_dir.path().join("active/cover.jpg").exists());

    server.release_audio();
    assert_eq!(handle.wait().await, DownloadOutcome::Completed);
    assert!(sync.manager().is_downloaded("active"));
}

#[tokio::test]
async fn test_library_is_restored_on_open() {
    let temp_dir = TempDir::new().unwrap();
    let server = FakeServer::new();
    server.add_item("B9", 2, 3);

    {
        let sync = open(test_config(temp_dir.path()), &server).await;
        assert_eq!(download(&sync, "B9").await, DownloadOutcome::Completed);
    }

    // A directory without metadata is neither loaded nor deleted
    std::fs::create_dir_all(temp_dir.path().join("stray/audio")).unwrap();

    let sync = open(test_config(temp_dir.path()), &server).await;
    assert!(sync.manager().is_downloaded("B9"));
    assert!(!sync.manager().is_downloaded("stray"));
    assert!(temp_dir.path().join("stray").exists());
    assert_eq!(sync.manager().downloaded_items().len(), 1);
}

#[tokio::test]
async fn test_storage_accounting_and_deletion() {
    let temp_dir = TempDir::new().unwrap();
    let server = FakeServer::new();
    server.add_item("a", 1, 2);
    server.add_item("b", 1, 1);

    let sync = open(test_config(temp_dir.path()), &server).await;
    assert_eq!(download(&sync, "a").await, DownloadOutcome::Completed);
    assert_eq!(download(&sync, "b").await, DownloadOutcome::Completed);

    let size_a = sync.manager().storage_size_of("a").await.unwrap();
    let size_b = sync.manager().storage_size_of("b").await.unwrap();
    assert!(size_a >= 2 * TRACK_SIZE as u64);
    assert_eq!(sync.manager().total_storage_used().await, size_a + size_b);

    sync.manager().delete_item("a").await.unwrap();
    assert!(!sync.manager().is_downloaded("a"));
    assert!(!temp_dir.path().join("a").exists());

    assert_eq!(sync.manager().delete_all().await.unwrap(), 1);
    assert!(sync.manager().downloaded_items().is_empty());
    assert_eq!(sync.manager().total_storage_used().await, 0);
}

#[tokio::test]
async fn test_invalid_item_id_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let server = FakeServer::new();
    let sync = open(test_config(temp_dir.path()), &server).await;

    assert!(sync.manager().download_item("../etc").await.is_err());
    assert!(sync.manager().download_item("").await.is_err());
    assert!(sync.manager().download_item(".hidden").await.is_err());
}
