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


//! Storage service: every filesystem operation of the sync core
//!
//! # Key Operations
//! - Item directory creation and deletion (with retry)
//! - Atomic writes (temp file, fsync, rename) for every artifact
//! - Recursive size accounting
//! - Free space checks
//! - Enumeration of persisted items at startup
//!
//! No other component touches the download root directly, which keeps the
//! layout in [`crate::file::layout`] the sole contract between writer and
//! validator.

use crate::api::models::{ContentItem, TrackDescriptor};
use crate::error::{Result, SyncError};
use crate::file::layout::{
    audio_extension, parse_audio_file_name, validate_item_id, ArtifactLayout,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::time::sleep;

/// Maximum retry attempts for file operations
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Delay between retry attempts
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Record of the audio actually received for an item
///
/// `track_count` is the ground truth for validation. It comes from the
/// streaming session, not from the chapter list, because servers may split
/// or group chapters into a different number of files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioInfo {
    pub track_count: usize,

    #[serde(default)]
    pub tracks: Vec<AudioTrackInfo>,

    pub downloaded_at: DateTime<Utc>,
}

/// One persisted audio file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioTrackInfo {
    pub index: usize,
    pub file_name: String,
    pub duration: f64,
}

impl AudioInfo {
    /// Build the record for a set of downloaded tracks
    pub fn from_tracks(tracks: &[TrackDescriptor]) -> Self {
        Self {
            track_count: tracks.len(),
            tracks: tracks
                .iter()
                .map(|track| AudioTrackInfo {
                    index: track.index,
                    file_name: crate::file::layout::audio_file_name(
                        track.index,
                        &audio_extension(track),
                    ),
                    duration: track.duration,
                })
                .collect(),
            downloaded_at: Utc::now(),
        }
    }
}

/// Storage service rooted at the download directory
#[derive(Debug)]
pub struct StorageService {
    root: PathBuf,
}

impl StorageService {
    /// Create a new storage service
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Get the download root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Layout of an item under this root
    pub fn layout(&self, item_id: &str) -> Result<ArtifactLayout> {
        ArtifactLayout::new(&self.root, item_id)
    }

    /// Create the download root if needed
    pub async fn ensure_root(&self) -> Result<()> {
        ensure_directory_exists(&self.root).await
    }

    /// Create an empty item directory tree
    pub async fn prepare_item(&self, item_id: &str) -> Result<ArtifactLayout> {
        let layout = self.layout(item_id)?;
        ensure_directory_exists(&layout.audio_dir()).await?;
        Ok(layout)
    }

    /// Whether the item directory exists at all
    pub async fn item_exists(&self, item_id: &str) -> Result<bool> {
        let layout = self.layout(item_id)?;
        Ok(path_exists(layout.item_dir()).await)
    }

    pub async fn write_metadata(&self, item: &ContentItem) -> Result<()> {
        let layout = self.layout(&item.id)?;
        let json = serde_json::to_vec_pretty(item)?;
        atomic_write(&layout.metadata(), &json).await
    }

    pub async fn write_cover(&self, item_id: &str, bytes: &[u8]) -> Result<()> {
        let layout = self.layout(item_id)?;
        atomic_write(&layout.cover(), bytes).await
    }

    /// Write one audio track, returning its path
    pub async fn write_audio_track(
        &self,
        item_id: &str,
        track: &TrackDescriptor,
        bytes: &[u8],
    ) -> Result<PathBuf> {
        let layout = self.layout(item_id)?;
        let path = layout.audio_track(track.index, &audio_extension(track));
        atomic_write(&path, bytes).await?;
        Ok(path)
    }

    pub async fn write_audio_info(&self, item_id: &str, info: &AudioInfo) -> Result<()> {
        let layout = self.layout(item_id)?;
        let json = serde_json::to_vec_pretty(info)?;
        atomic_write(&layout.audio_info(), &json).await
    }

    /// Read and deserialize the metadata document
    ///
    /// Returns `Ok(None)` when the file is absent.
    pub async fn read_metadata(&self, item_id: &str) -> Result<Option<ContentItem>> {
        let layout = self.layout(item_id)?;
        read_json(&layout.metadata()).await
    }

    /// Read and deserialize the audio-info record
    ///
    /// Returns `Ok(None)` when the file is absent.
    pub async fn read_audio_info(&self, item_id: &str) -> Result<Option<AudioInfo>> {
        let layout = self.layout(item_id)?;
        read_json(&layout.audio_info()).await
    }

    /// Audio files present on disk, keyed by track index
    pub async fn audio_files(&self, item_id: &str) -> Result<BTreeMap<usize, PathBuf>> {
        let layout = self.layout(item_id)?;
        let mut files = BTreeMap::new();

        let mut entries = match fs::read_dir(layout.audio_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => {
                return Err(SyncError::FileIoError(format!(
                    "Failed to read directory {}: {}",
                    layout.audio_dir().display(),
                    e
                )))
            }
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(index) = name.to_str().and_then(parse_audio_file_name) {
                files.insert(index, entry.path());
            }
        }

        Ok(files)
    }

    /// Size of a regular file, `None` if it does not exist
    pub async fn file_size(&self, path: &Path) -> Option<u64> {
        match fs::metadata(path).await {
            Ok(meta) if meta.is_file() => Some(meta.len()),
            _ => None,
        }
    }

    /// Delete an item's whole directory tree
    ///
    /// Not an error if it does not exist.
    pub async fn delete_item(&self, item_id: &str) -> Result<()> {
        let layout = self.layout(item_id)?;
        let mut attempts = 0;

        loop {
            attempts += 1;

            match remove_dir_once(layout.item_dir()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempts >= MAX_RETRY_ATTEMPTS => {
                    return Err(SyncError::FileIoError(format!(
                        "Failed to delete {} after {} attempts: {}",
                        layout.item_dir().display(),
                        MAX_RETRY_ATTEMPTS,
                        e
                    )));
                }
                Err(_) => {
                    sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    /// Delete every persisted item, returning how many were removed
    pub async fn delete_all(&self) -> Result<usize> {
        let ids = self.list_item_ids().await?;
        for id in &ids {
            self.delete_item(id).await?;
        }
        Ok(ids.len())
    }

    /// Total size of one item in bytes
    pub async fn item_size(&self, item_id: &str) -> Result<u64> {
        let layout = self.layout(item_id)?;
        Ok(directory_size(layout.item_dir()).await)
    }

    /// Total size of the download root in bytes
    pub async fn total_size(&self) -> u64 {
        directory_size(&self.root).await
    }

    /// Free bytes on the volume holding the download root
    pub async fn available_space(&self) -> Result<u64> {
        self.ensure_root().await?;
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || fs2::available_space(&root))
            .await
            .map_err(|e| SyncError::internal(format!("free space check panicked: {}", e)))?
            .map_err(|e| {
                SyncError::FileIoError(format!("Failed to query free space: {}", e))
            })
    }

    /// Whether at least `required` bytes are free
    pub async fn has_free_space(&self, required: u64) -> Result<bool> {
        Ok(self.available_space().await? >= required)
    }

    /// Check that at least `required` bytes are free
    ///
    /// Fails with `InsufficientStorage` when short, otherwise returns the
    /// available byte count.
    pub async fn ensure_free_space(&self, required: u64) -> Result<u64> {
        let available = self.available_space().await?;
        if available < required {
            return Err(SyncError::InsufficientStorage {
                required,
                available,
            });
        }
        Ok(available)
    }

    /// Ids of every item directory under the root
    ///
    /// Directories whose name is not a valid id (including hidden temp
    /// directories) are ignored. A missing root yields an empty list.
    pub async fn list_item_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();

        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => {
                return Err(SyncError::FileIoError(format!(
                    "Failed to read directory {}: {}",
                    self.root.display(),
                    e
                )))
            }
        };

        while let Some(entry) = entries.next_entry().await? {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if validate_item_id(name).is_ok() {
                    ids.push(name.to_string());
                }
            }
        }

        ids.sort();
        Ok(ids)
    }

    /// Load every item whose metadata document is readable
    ///
    /// Unreadable directories are skipped, not deleted. Cleaning them up is
    /// the healer's job.
    pub async fn load_persisted_items(&self) -> Result<Vec<ContentItem>> {
        let mut items = Vec::new();
        for id in self.list_item_ids().await? {
            match self.read_metadata(&id).await {
                Ok(Some(item)) => items.push(item),
                Ok(None) => tracing::debug!(item_id = %id, "no metadata document, skipping"),
                Err(e) => tracing::debug!(item_id = %id, error = %e, "unreadable metadata, skipping"),
            }
        }
        Ok(items)
    }
}

/// Ensure directory exists, creating parent directories as needed
async fn ensure_directory_exists(path: &Path) -> Result<()> {
    fs::create_dir_all(path).await.map_err(|e| {
        SyncError::FileIoError(format!(
            "Failed to create directory {}: {}",
            path.display(),
            e
        ))
    })
}

async fn path_exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

async fn remove_dir_once(path: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

async fn read_json<T>(path: &Path) -> Result<Option<T>>
where
    T: serde::de::DeserializeOwned,
{
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(SyncError::FileIoError(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Atomic write: write to temp file, sync, then rename
async fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        SyncError::FileIoError(format!("No parent directory for {}", path.display()))
    })?;
    ensure_directory_exists(parent).await?;

    let temp_path = parent.join(format!(
        ".{}.tmp",
        path.file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("file")
    ));

    fs::write(&temp_path, contents).await.map_err(|e| {
        SyncError::FileIoError(format!(
            "Failed to write temp file {}: {}",
            temp_path.display(),
            e
        ))
    })?;

    let file = fs::OpenOptions::new()
        .write(true)
        .open(&temp_path)
        .await
        .map_err(|e| {
            SyncError::FileIoError(format!(
                "Failed to open temp file for sync {}: {}",
                temp_path.display(),
                e
            ))
        })?;

    file.sync_all().await.map_err(|e| {
        SyncError::FileIoError(format!(
            "Failed to sync temp file {}: {}",
            temp_path.display(),
            e
        ))
    })?;

    drop(file);

    fs::rename(&temp_path, path).await.map_err(|e| {
        SyncError::FileIoError(format!(
            "Failed to rename temp file {} to {}: {}",
            temp_path.display(),
            path.display(),
            e
        ))
    })?;

    Ok(())
}

/// Sum of regular file sizes below `dir`
///
/// Unreadable entries are skipped silently; a missing directory is 0 bytes.
async fn directory_size(dir: &Path) -> u64 {
    let mut total = 0;
    accumulate_size(dir, &mut total).await;
    total
}

fn accumulate_size<'a>(
    dir: &'a Path,
    total: &'a mut u64,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
    Box::pin(async move {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(_) => return,
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };

            if file_type.is_dir() {
                accumulate_size(&entry.path(), total).await;
            } else if file_type.is_file() {
                if let Ok(meta) = entry.metadata().await {
                    *total += meta.len();
                }
            }
        }
    })
}
