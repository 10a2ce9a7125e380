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


//! Network fetcher: one attempt per call
//!
//! Wraps the collaborator traits with the pipeline's rules:
//! - bounded timeouts (short for metadata and cover, long for audio)
//! - non-2xx statuses become `Network { HttpStatus }`
//! - bodies below the minimum plausible size are rejected, since some
//!   failures come back as a tiny error page with a 200 status
//! - every call races the cancellation token
//!
//! Retrying is not done here; see [`crate::download::retry`].

use crate::api::models::{ContentItem, TrackDescriptor};
use crate::api::traits::{ByteTransport, CredentialProvider, ItemProvider};
use crate::config::SyncConfig;
use crate::error::{NetworkFailureKind, Result, SyncError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// External services the pipeline talks to
#[derive(Clone)]
pub struct Collaborators {
    pub provider: Arc<dyn ItemProvider>,
    pub transport: Arc<dyn ByteTransport>,
    pub credentials: Arc<dyn CredentialProvider>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// What a byte transfer is expected to carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Cover,
    Audio,
}

#[derive(Debug)]
pub struct NetworkFetcher {
    collaborators: Collaborators,
    metadata_timeout: Duration,
    cover_timeout: Duration,
    audio_timeout: Duration,
    min_cover_bytes: u64,
    min_audio_bytes: u64,
}

impl NetworkFetcher {
    pub fn new(collaborators: Collaborators, config: &SyncConfig) -> Self {
        Self {
            collaborators,
            metadata_timeout: config.metadata_timeout(),
            cover_timeout: config.cover_timeout(),
            audio_timeout: config.audio_timeout(),
            min_cover_bytes: config.min_cover_bytes,
            min_audio_bytes: config.min_audio_bytes,
        }
    }

    fn timeout_for(&self, kind: PayloadKind) -> Duration {
        match kind {
            PayloadKind::Cover => self.cover_timeout,
            PayloadKind::Audio => self.audio_timeout,
        }
    }

    fn minimum_for(&self, kind: PayloadKind) -> u64 {
        match kind {
            PayloadKind::Cover => self.min_cover_bytes,
            PayloadKind::Audio => self.min_audio_bytes,
        }
    }

    /// Fetch the payload at `url` in a single attempt
    pub async fn fetch_bytes(
        &self,
        url: &str,
        kind: PayloadKind,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let token = self.bearer_token(cancel).await?;
        let timeout = self.timeout_for(kind);

        let response = bounded(
            cancel,
            timeout,
            self.collaborators.transport.get(url, &token, timeout),
        )
        .await?;

        if !response.is_success() {
            return Err(SyncError::http_status(
                response.status,
                format!("GET {} returned status {}", strip_query(url), response.status),
            ));
        }

        let received = response.body.len() as u64;
        let minimum = self.minimum_for(kind);
        if received < minimum {
            return Err(SyncError::UndersizedResponse { received, minimum });
        }

        Ok(response.body)
    }

    /// Fetch the item description from the server
    pub async fn fetch_item_details(
        &self,
        item_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ContentItem> {
        let token = self.bearer_token(cancel).await?;
        let item = bounded(
            cancel,
            self.metadata_timeout,
            self.collaborators.provider.fetch_item_details(item_id, &token),
        )
        .await?;

        if item.id != item_id {
            return Err(SyncError::Decode(format!(
                "requested item {} but server described {}",
                item_id, item.id
            )));
        }
        Ok(item)
    }

    /// Negotiate a streaming session
    ///
    /// The returned track list is the authoritative track count for this
    /// download. An empty list is a `MissingSessionData` error.
    pub async fn negotiate_streaming_session(
        &self,
        item_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<TrackDescriptor>> {
        let token = self.bearer_token(cancel).await?;
        let tracks = bounded(
            cancel,
            self.metadata_timeout,
            self.collaborators
                .provider
                .negotiate_streaming_session(item_id, &token),
        )
        .await?;

        if tracks.is_empty() {
            return Err(SyncError::MissingSessionData(item_id.to_string()));
        }
        Ok(tracks)
    }

    pub fn cover_url(&self, item: &ContentItem) -> String {
        self.collaborators.provider.cover_url(item)
    }

    async fn bearer_token(&self, cancel: &CancellationToken) -> Result<String> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            token = self.collaborators.credentials.bearer_token() => token,
        }
    }
}

/// Race `fut` against cancellation and a timeout
async fn bounded<T, F>(cancel: &CancellationToken, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
        result = tokio::time::timeout(timeout, fut) => match result {
            Ok(inner) => inner,
            Err(_) => Err(SyncError::network_error(
                NetworkFailureKind::Timeout,
                format!("no response within {}s", timeout.as_secs()),
            )),
        },
    }
}

/// Signed URLs carry credentials in the query string; keep them out of logs
fn strip_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::traits::{StaticToken, TransportResponse};
    use async_trait::async_trait;

    struct FixedTransport {
        status: u16,
        size: usize,
        delay: Duration,
    }

    #[async_trait]
    impl ByteTransport for FixedTransport {
        async fn get(&self, _url: &str, token: &str, _timeout: Duration) -> Result<TransportResponse> {
            assert_eq!(token, "token");
            tokio::time::sleep(self.delay).await;
            Ok(TransportResponse {
                status: self.status,
                body: vec![0u8; self.size],
            })
        }
    }

    struct EmptySession;

    #[async_trait]
    impl ItemProvider for EmptySession {
        async fn fetch_item_details(&self, item_id: &str, _token: &str) -> Result<ContentItem> {
            Ok(ContentItem {
                id: item_id.to_string(),
                title: "T".to_string(),
                author: "A".to_string(),
                chapters: vec![],
                cover_path: None,
            })
        }

        async fn negotiate_streaming_session(
            &self,
            _item_id: &str,
            _token: &str,
        ) -> Result<Vec<TrackDescriptor>> {
            Ok(vec![])
        }

        fn cover_url(&self, item: &ContentItem) -> String {
            format!("https://example.com/{}/cover", item.id)
        }
    }

    fn fetcher(status: u16, size: usize, delay: Duration) -> NetworkFetcher {
        let collaborators = Collaborators {
            provider: Arc::new(EmptySession),
            transport: Arc::new(FixedTransport { status, size, delay }),
            credentials: Arc::new(StaticToken::new("token")),
        };
        NetworkFetcher::new(collaborators, &SyncConfig::default())
    }

    #[tokio::test]
    async fn test_fetch_bytes_success() {
        let fetcher = fetcher(200, 20_000, Duration::ZERO);
        let token = CancellationToken::new();

        let body = fetcher
            .fetch_bytes("https://example.com/a.mp3", PayloadKind::Audio, &token)
            .await
            .unwrap();
        assert_eq!(body.len(), 20_000);
    }

    #[tokio::test]
    async fn test_status_is_classified() {
        let fetcher = fetcher(503, 20_000, Duration::ZERO);
        let token = CancellationToken::new();

        let err = fetcher
            .fetch_bytes("https://example.com/a.mp3?sig=secret", PayloadKind::Audio, &token)
            .await
            .unwrap_err();
        match err {
            SyncError::Network { kind, message } => {
                assert_eq!(kind, NetworkFailureKind::HttpStatus(503));
                assert!(!message.contains("secret"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_undersized_body_is_rejected() {
        let fetcher = fetcher(200, 512, Duration::ZERO);
        let token = CancellationToken::new();

        // 512 bytes is too small for a cover and for audio
        for kind in [PayloadKind::Cover, PayloadKind::Audio] {
            assert!(matches!(
                fetcher.fetch_bytes("https://example.com/x", kind, &token).await,
                Err(SyncError::UndersizedResponse { received: 512, .. })
            ));
        }

        // 2 KiB is a plausible cover but not plausible audio
        let fetcher = self::fetcher(200, 2048, Duration::ZERO);
        assert!(fetcher
            .fetch_bytes("https://example.com/x", PayloadKind::Cover, &token)
            .await
            .is_ok());
        assert!(fetcher
            .fetch_bytes("https://example.com/x", PayloadKind::Audio, &token)
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cover_timeout() {
        let fetcher = fetcher(200, 2048, Duration::from_secs(60));
        let token = CancellationToken::new();

        assert!(matches!(
            fetcher
                .fetch_bytes("https://example.com/x", PayloadKind::Cover, &token)
                .await,
            Err(SyncError::Network { kind: NetworkFailureKind::Timeout, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_transfer() {
        let fetcher = fetcher(200, 20_000, Duration::from_secs(120));
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        assert!(matches!(
            fetcher
                .fetch_bytes("https://example.com/x", PayloadKind::Audio, &token)
                .await,
            Err(SyncError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_empty_session_is_missing_data() {
        let fetcher = fetcher(200, 0, Duration::ZERO);
        let token = CancellationToken::new();

        assert!(matches!(
            fetcher.negotiate_streaming_session("B1", &token).await,
            Err(SyncError::MissingSessionData(id)) if id == "B1"
        ));
    }
}
