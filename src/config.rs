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


//! Configuration for the download pipeline and background healer
//!
//! All limits that the pipeline enforces live here so a host application can
//! tune them from a JSON file without recompiling:
//! - Free space required before a download starts
//! - Per-payload request timeouts (short for metadata and cover, long for audio)
//! - Minimum plausible response sizes
//! - Retry schedule
//! - Healer settling delay and optional periodic rescan

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Free space required before a download may start (500 MB)
pub const DEFAULT_MIN_FREE_BYTES: u64 = 500 * 1024 * 1024;

/// Smallest cover image accepted from the server
pub const DEFAULT_MIN_COVER_BYTES: u64 = 1024;

/// Smallest audio track accepted from the server
pub const DEFAULT_MIN_AUDIO_BYTES: u64 = 10 * 1024;

/// Retry configuration
///
/// A fixed delay schedule rather than exponential growth keeps a stuck
/// download bounded to a few seconds of backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,

    /// Delay before each retry in milliseconds; the last entry repeats
    pub delays_ms: Vec<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delays_ms: vec![2_000, 5_000, 10_000],
        }
    }
}

/// Background healer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealerConfig {
    /// Delay after startup before the first scan
    pub settle_delay_ms: u64,

    /// Optional periodic rescan in seconds
    pub rescan_interval_secs: Option<u64>,
}

impl Default for HealerConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 5_000,
            rescan_interval_secs: None,
        }
    }
}

impl HealerConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn rescan_interval(&self) -> Option<Duration> {
        self.rescan_interval_secs.map(Duration::from_secs)
    }
}

/// Download pipeline configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Root directory holding one sub-directory per downloaded item
    pub download_root: PathBuf,

    /// Free bytes required before a download starts
    pub min_free_bytes: u64,

    /// Timeout for metadata and session negotiation requests
    pub metadata_timeout_secs: u64,

    /// Timeout for cover image transfers
    pub cover_timeout_secs: u64,

    /// Timeout for a single audio track transfer
    pub audio_timeout_secs: u64,

    /// Minimum plausible cover size in bytes
    pub min_cover_bytes: u64,

    /// Minimum plausible audio track size in bytes
    pub min_audio_bytes: u64,

    /// Pause inserted between stages so progress UIs can keep up
    pub stage_pacing_ms: u64,

    /// Capacity of the progress event channel
    pub event_capacity: usize,

    pub retry: RetryConfig,

    pub healer: HealerConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            download_root: default_download_root(),
            min_free_bytes: DEFAULT_MIN_FREE_BYTES,
            metadata_timeout_secs: 30,
            cover_timeout_secs: 30,
            audio_timeout_secs: 300,
            min_cover_bytes: DEFAULT_MIN_COVER_BYTES,
            min_audio_bytes: DEFAULT_MIN_AUDIO_BYTES,
            stage_pacing_ms: 250,
            event_capacity: 256,
            retry: RetryConfig::default(),
            healer: HealerConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }

    /// Load configuration from a JSON file; missing fields use defaults
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SyncError::InvalidConfiguration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&contents).map_err(|e| {
            SyncError::InvalidConfiguration(format!("cannot parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(SyncError::InvalidConfiguration(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts > 1 && self.retry.delays_ms.is_empty() {
            return Err(SyncError::InvalidConfiguration(
                "retry.delays_ms must not be empty when retries are enabled".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(SyncError::InvalidConfiguration(
                "event_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }

    pub fn cover_timeout(&self) -> Duration {
        Duration::from_secs(self.cover_timeout_secs)
    }

    pub fn audio_timeout(&self) -> Duration {
        Duration::from_secs(self.audio_timeout_secs)
    }

    pub fn stage_pacing(&self) -> Duration {
        Duration::from_millis(self.stage_pacing_ms)
    }
}

/// Builder for SyncConfig
#[derive(Debug)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn download_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.config.download_root = root.into();
        self
    }

    pub fn min_free_bytes(mut self, bytes: u64) -> Self {
        self.config.min_free_bytes = bytes;
        self
    }

    pub fn min_cover_bytes(mut self, bytes: u64) -> Self {
        self.config.min_cover_bytes = bytes;
        self
    }

    pub fn min_audio_bytes(mut self, bytes: u64) -> Self {
        self.config.min_audio_bytes = bytes;
        self
    }

    pub fn stage_pacing(mut self, pacing: Duration) -> Self {
        self.config.stage_pacing_ms = pacing.as_millis() as u64;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn healer(mut self, healer: HealerConfig) -> Self {
        self.config.healer = healer;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Remote server settings for the HTTP collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL, e.g. `https://books.example.org`
    pub base_url: String,

    pub user_agent: String,

    /// Client name reported when negotiating a streaming session
    pub client_name: String,
}

impl ServerConfig {
    pub fn new<S: Into<String>>(base_url: S) -> Self {
        Self {
            base_url: base_url.into(),
            user_agent: format!("ShelfSync/{} (shelfsync-core)", env!("CARGO_PKG_VERSION")),
            client_name: "ShelfSync".to_string(),
        }
    }
}

/// Get default download root for the platform
pub fn default_download_root() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let mut path = PathBuf::from(home);
            path.push("Library");
            path.push("Application Support");
            path.push("ShelfSync");
            path.push("Downloads");
            return path;
        }
        return PathBuf::from("./downloads");
    }

    #[cfg(target_os = "linux")]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let mut path = PathBuf::from(home);
            path.push(".local");
            path.push("share");
            path.push("shelfsync");
            path.push("downloads");
            return path;
        }
        return PathBuf::from("./downloads");
    }

    #[cfg(target_os = "windows")]
    {
        if let Some(appdata) = std::env::var_os("APPDATA") {
            let mut path = PathBuf::from(appdata);
            path.push("ShelfSync");
            path.push("Downloads");
            return path;
        }
        return PathBuf::from("./downloads");
    }

    #[cfg(target_os = "android")]
    {
        // Replaced by the host with its app-specific files directory
        PathBuf::from("/data/data/com.shelfsync/files/downloads")
    }

    #[cfg(target_os = "ios")]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let mut path = PathBuf::from(home);
            path.push("Documents");
            path.push("downloads");
            return path;
        }
        PathBuf::from("./downloads")
    }

    #[cfg(not(any(
        target_os = "macos",
        target_os = "linux",
        target_os = "windows",
        target_os = "android",
        target_os = "ios"
    )))]
    {
        PathBuf::from("./downloads")
    }
}
