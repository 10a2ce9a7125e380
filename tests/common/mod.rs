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


//! In-memory server used by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use shelfsync_core::api::{
    ByteTransport, Chapter, ContentItem, ItemProvider, StaticToken, TrackDescriptor,
    TransportResponse,
};
use shelfsync_core::download::DownloadEvent;
use shelfsync_core::{Collaborators, OfflineSync, Result, SyncConfig, SyncError};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};

pub const COVER_SIZE: usize = 2 * 1024;
pub const TRACK_SIZE: usize = 20 * 1024;

/// How a scripted request fails
#[derive(Debug, Clone, Copy)]
pub enum Failure {
    Status(u16),
    /// 200 with a tiny error page as body
    Undersized,
}

#[derive(Default)]
struct Script {
    /// Remaining failures per URL; `None` means forever
    failures: HashMap<String, (Option<u32>, Failure)>,
}

pub struct FakeServer {
    items: Mutex<HashMap<String, (ContentItem, usize)>>,
    script: Mutex<Script>,
    requests: Mutex<Vec<String>>,
    details_calls: AtomicUsize,
    /// Audio transfers wait until this is `true`
    audio_gate: watch::Sender<bool>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        let (audio_gate, _) = watch::channel(true);
        Arc::new(Self {
            items: Mutex::new(HashMap::new()),
            script: Mutex::new(Script::default()),
            requests: Mutex::new(Vec::new()),
            details_calls: AtomicUsize::new(0),
            audio_gate,
        })
    }

    /// Publish an item with `chapters` chapters served as `tracks` audio files
    pub fn add_item(&self, id: &str, chapters: usize, tracks: usize) {
        let item = ContentItem {
            id: id.to_string(),
            title: format!("Book {}", id),
            author: "Test Author".to_string(),
            chapters: (0..chapters)
                .map(|i| Chapter {
                    title: format!("Chapter {}", i + 1),
                    start: i as f64 * 600.0,
                    end: (i + 1) as f64 * 600.0,
                    upstream_ref: None,
                })
                .collect(),
            cover_path: Some(format!("/metadata/items/{}/cover.jpg", id)),
        };
        self.items
            .lock()
            .unwrap()
            .insert(id.to_string(), (item, tracks));
    }

    pub fn track_url(id: &str, index: usize) -> String {
        format!("https://cdn.test/{}/track/{}.mp3", id, index)
    }

    pub fn cover_url_for(id: &str) -> String {
        format!("https://cdn.test/{}/cover.jpg", id)
    }

    /// Fail the next `times` requests for `url`
    pub fn fail(&self, url: &str, times: u32, failure: Failure) {
        self.script
            .lock()
            .unwrap()
            .failures
            .insert(url.to_string(), (Some(times), failure));
    }

    /// Fail every request for `url`
    pub fn fail_always(&self, url: &str, failure: Failure) {
        self.script
            .lock()
            .unwrap()
            .failures
            .insert(url.to_string(), (None, failure));
    }

    pub fn hold_audio(&self) {
        self.audio_gate.send_replace(false);
    }

    pub fn release_audio(&self) {
        self.audio_gate.send_replace(true);
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, url: &str) -> usize {
        self.requests.lock().unwrap().iter().filter(|u| *u == url).count()
    }

    pub fn details_calls(&self) -> usize {
        self.details_calls.load(Ordering::SeqCst)
    }

    fn scripted_failure(&self, url: &str) -> Option<Failure> {
        let mut script = self.script.lock().unwrap();
        let (remaining, failure) = script.failures.get_mut(url)?;
        match remaining {
            None => Some(*failure),
            Some(n) if *n == 0 => None,
            Some(n) => {
                *n -= 1;
                Some(*failure)
            }
        }
    }
}

#[async_trait]
impl ItemProvider for FakeServer {
    async fn fetch_item_details(&self, item_id: &str, _bearer_token: &str) -> Result<ContentItem> {
        self.details_calls.fetch_add(1, Ordering::SeqCst);
        self.items
            .lock()
            .unwrap()
            .get(item_id)
            .map(|(item, _)| item.clone())
            .ok_or_else(|| SyncError::http_status(404, "not found"))
    }

    async fn negotiate_streaming_session(
        &self,
        item_id: &str,
        _bearer_token: &str,
    ) -> Result<Vec<TrackDescriptor>> {
        let tracks = self
            .items
            .lock()
            .unwrap()
            .get(item_id)
            .map(|(_, tracks)| *tracks)
            .ok_or_else(|| SyncError::http_status(404, "not found"))?;

        Ok((0..tracks)
            .map(|index| TrackDescriptor {
                index,
                content_url: Self::track_url(item_id, index),
                duration: 600.0,
                mime_type: Some("audio/mpeg".to_string()),
            })
            .collect())
    }

    fn cover_url(&self, item: &ContentItem) -> String {
        Self::cover_url_for(&item.id)
    }
}

#[async_trait]
impl ByteTransport for FakeServer {
    async fn get(&self, url: &str, bearer_token: &str, _timeout: Duration) -> Result<TransportResponse> {
        assert_eq!(bearer_token, "test-token");
        self.requests.lock().unwrap().push(url.to_string());

        let is_audio = url.contains("/track/");
        if is_audio {
            let mut gate = self.audio_gate.subscribe();
            let _ = gate.wait_for(|open| *open).await;
        }

        match self.scripted_failure(url) {
            Some(Failure::Status(status)) => Ok(TransportResponse {
                status,
                body: b"error".to_vec(),
            }),
            Some(Failure::Undersized) => Ok(TransportResponse::ok(b"<html>oops</html>".to_vec())),
            None => {
                let size = if is_audio { TRACK_SIZE } else { COVER_SIZE };
                Ok(TransportResponse::ok(vec![0xAB; size]))
            }
        }
    }
}

pub fn test_config(root: &Path) -> SyncConfig {
    SyncConfig::builder()
        .download_root(root)
        .min_free_bytes(0)
        .stage_pacing(Duration::ZERO)
        .build()
}

pub async fn open(config: SyncConfig, server: &Arc<FakeServer>) -> OfflineSync {
    let collaborators = Collaborators {
        provider: server.clone(),
        transport: server.clone(),
        credentials: Arc::new(StaticToken::new("test-token")),
    };
    OfflineSync::open(config, collaborators).await.unwrap()
}

/// Everything already sent on `events`
pub fn drain(events: &mut broadcast::Receiver<DownloadEvent>) -> Vec<DownloadEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}
