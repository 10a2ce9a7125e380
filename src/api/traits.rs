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


//! Collaborator interfaces consumed by the download pipeline
//!
//! The pipeline only needs three things from the outside world: item details
//! and a streaming session from the server, raw bytes from a URL, and a bearer
//! token. Keeping them behind traits lets the host swap in its own HTTP stack
//! and lets tests run the whole pipeline against in-memory fakes.

use crate::api::models::{ContentItem, TrackDescriptor};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use std::time::Duration;

/// Raw response from a byte transfer
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn ok(body: Vec<u8>) -> Self {
        Self { status: 200, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Authenticated byte transport
#[async_trait]
pub trait ByteTransport: Send + Sync {
    /// Perform one GET with a bearer token and bounded timeout
    ///
    /// Non-2xx statuses are returned as responses, not errors. Transport
    /// failures and timeouts are returned as `SyncError::Network`.
    async fn get(&self, url: &str, bearer_token: &str, timeout: Duration)
        -> Result<TransportResponse>;
}

/// Metadata and session provider
#[async_trait]
pub trait ItemProvider: Send + Sync {
    /// Fetch the full description of an item
    async fn fetch_item_details(&self, item_id: &str, bearer_token: &str) -> Result<ContentItem>;

    /// Negotiate a streaming session and return its audio tracks in order
    ///
    /// The returned count is authoritative for this download attempt.
    async fn negotiate_streaming_session(
        &self,
        item_id: &str,
        bearer_token: &str,
    ) -> Result<Vec<TrackDescriptor>>;

    /// Absolute URL of the item's cover image
    fn cover_url(&self, item: &ContentItem) -> String;
}

/// Source of bearer tokens
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<String>;
}

/// Credential provider holding a fixed token
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new<S: Into<String>>(token: S) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticToken(***)")
    }
}

#[async_trait]
impl CredentialProvider for StaticToken {
    async fn bearer_token(&self) -> Result<String> {
        if self.0.is_empty() {
            return Err(SyncError::Credentials("no token configured".to_string()));
        }
        Ok(self.0.clone())
    }
}
