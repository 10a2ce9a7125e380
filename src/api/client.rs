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


//! HTTP client for the media server
//!
//! `ServerClient` wraps `reqwest::Client` and implements both collaborator
//! traits the pipeline needs:
//! - `ItemProvider`: item details and streaming session negotiation
//! - `ByteTransport`: authenticated byte transfers for covers and audio
//!
//! # Endpoints
//! - `GET  {base}/api/items/{id}?expanded=1` - item details
//! - `POST {base}/api/items/{id}/play` - streaming session with audio tracks
//! - `GET  {base}/api/items/{id}/cover` - cover image
//!
//! Retries are not performed here. The pipeline owns the retry policy so
//! backoff and cancellation behave the same for every request.

use crate::api::models::{ContentItem, LibraryItemDto, PlaybackSessionDto, TrackDescriptor};
use crate::api::traits::{ByteTransport, ItemProvider, TransportResponse};
use crate::config::ServerConfig;
use crate::error::{NetworkFailureKind, Result, SyncError};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{Client, Response};
use serde::Serialize;
use std::time::Duration;
use url::Url;

/// MIME types offered when negotiating a session
const SUPPORTED_MIME_TYPES: &[&str] = &[
    "audio/flac",
    "audio/mpeg",
    "audio/mp4",
    "audio/ogg",
    "audio/aac",
    "audio/x-m4b",
];

/// Number of body characters kept around a parse error
const PARSE_CONTEXT_CHARS: usize = 200;

/// Upper bound on the body buffer reserved from a `Content-Length` header
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlayRequest<'a> {
    device_info: DeviceInfo<'a>,
    supported_mime_types: &'a [&'a str],
    media_player: &'a str,
    force_direct_play: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceInfo<'a> {
    client_name: &'a str,
    client_version: &'a str,
}

/// HTTP client for the media server
#[derive(Debug, Clone)]
pub struct ServerClient {
    client: Client,
    base_url: Url,
    config: ServerConfig,
}

impl ServerClient {
    /// Create a new client
    ///
    /// # Errors
    /// Returns error if the base URL does not parse or the HTTP client cannot be built
    pub fn new(config: ServerConfig) -> Result<Self> {
        let mut base_url = Url::parse(&config.base_url)
            .map_err(|e| SyncError::InvalidConfiguration(format!("invalid base URL: {}", e)))?;

        // Url::join drops the last path segment unless it ends with a slash
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent)
                .map_err(|e| SyncError::invalid_input(format!("Invalid user agent: {}", e)))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            client,
            base_url,
            config,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve a possibly relative URL against the server base
    pub fn resolve(&self, reference: &str) -> Result<String> {
        let trimmed = reference.trim_start_matches('/');
        let url = match Url::parse(reference) {
            Ok(absolute) => absolute,
            Err(_) => self
                .base_url
                .join(trimmed)
                .map_err(|e| SyncError::Decode(format!("bad URL '{}': {}", reference, e)))?,
        };
        Ok(url.to_string())
    }

    fn item_endpoint(&self, item_id: &str, suffix: &str) -> String {
        format!(
            "{}api/items/{}{}",
            self.base_url,
            urlencoding::encode(item_id),
            suffix
        )
    }

    fn auth_headers(bearer_token: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", bearer_token))
                .map_err(|e| SyncError::Credentials(format!("Invalid auth token: {}", e)))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    /// Parse a JSON response, mapping non-2xx to a network error
    async fn parse_json<T>(response: Response) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let status = response.status();
        let endpoint = response.url().path().to_string();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::http_status(
                status.as_u16(),
                format!("{} returned {}: {}", endpoint, status, truncate(&body, PARSE_CONTEXT_CHARS)),
            ));
        }

        let text = response.text().await.map_err(map_reqwest_error)?;

        serde_json::from_str::<T>(&text).map_err(|e| {
            let column = e.column();
            let start = floor_char_boundary(&text, column.saturating_sub(PARSE_CONTEXT_CHARS / 2));
            let end = floor_char_boundary(&text, (column + PARSE_CONTEXT_CHARS / 2).min(text.len()));
            SyncError::Decode(format!(
                "{}: {} at col {}. Context: ...{}...",
                endpoint,
                e,
                column,
                &text[start..end]
            ))
        })
    }
}

#[async_trait]
impl ItemProvider for ServerClient {
    async fn fetch_item_details(&self, item_id: &str, bearer_token: &str) -> Result<ContentItem> {
        let url = self.item_endpoint(item_id, "?expanded=1");
        let response = self
            .client
            .get(&url)
            .headers(Self::auth_headers(bearer_token)?)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let dto: LibraryItemDto = Self::parse_json(response).await?;
        Ok(ContentItem::from(dto))
    }

    async fn negotiate_streaming_session(
        &self,
        item_id: &str,
        bearer_token: &str,
    ) -> Result<Vec<TrackDescriptor>> {
        let url = self.item_endpoint(item_id, "/play");
        let body = PlayRequest {
            device_info: DeviceInfo {
                client_name: &self.config.client_name,
                client_version: env!("CARGO_PKG_VERSION"),
            },
            supported_mime_types: SUPPORTED_MIME_TYPES,
            media_player: "offline-download",
            force_direct_play: true,
        };

        let response = self
            .client
            .post(&url)
            .headers(Self::auth_headers(bearer_token)?)
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let session: PlaybackSessionDto = Self::parse_json(response).await?;
        tracing::debug!(
            item_id,
            session_id = session.id.as_deref().unwrap_or("-"),
            tracks = session.audio_tracks.len(),
            "negotiated streaming session"
        );

        let mut tracks = session.audio_tracks;
        tracks.sort_by_key(|track| track.index.unwrap_or(usize::MAX));

        // Server indexes may start at 1; files on disk are always 0-based
        tracks
            .into_iter()
            .enumerate()
            .map(|(position, track)| {
                Ok(TrackDescriptor {
                    index: position,
                    content_url: self.resolve(&track.content_url)?,
                    duration: track.duration,
                    mime_type: track.mime_type,
                })
            })
            .collect()
    }

    fn cover_url(&self, item: &ContentItem) -> String {
        self.item_endpoint(&item.id, "/cover")
    }
}

#[async_trait]
impl ByteTransport for ServerClient {
    async fn get(
        &self,
        url: &str,
        bearer_token: &str,
        timeout: Duration,
    ) -> Result<TransportResponse> {
        let response = self
            .client
            .get(url)
            .headers(Self::auth_headers(bearer_token)?)
            .timeout(timeout)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let mut body = Vec::with_capacity(body_capacity(response.content_length()));
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_reqwest_error)?;
            body.extend_from_slice(&chunk);
        }

        Ok(TransportResponse { status, body })
    }
}

/// Buffer size to reserve for a body; the header is server-controlled
fn body_capacity(content_length: Option<u64>) -> usize {
    content_length.unwrap_or(0).min(MAX_PREALLOCATION) as usize
}

/// Classify a reqwest failure
fn map_reqwest_error(error: reqwest::Error) -> SyncError {
    let kind = if error.is_timeout() {
        NetworkFailureKind::Timeout
    } else if let Some(status) = error.status() {
        NetworkFailureKind::HttpStatus(status.as_u16())
    } else {
        NetworkFailureKind::Transport
    };
    SyncError::network_error(kind, error.to_string())
}

fn truncate(text: &str, max_chars: usize) -> &str {
    &text[..floor_char_boundary(text, max_chars.min(text.len()))]
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}
