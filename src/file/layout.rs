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


//! On-disk layout of a downloaded item
//!
//! ```text
//! <root>/<itemId>/metadata.json
//! <root>/<itemId>/cover.jpg
//! <root>/<itemId>/audio/chapter_<n>.<ext>
//! <root>/<itemId>/audio_info.json
//! ```
//!
//! This layout is the only contract between the writer (download pipeline)
//! and the readers (validation, startup load, healer). It must stay stable
//! across versions.

use crate::api::models::TrackDescriptor;
use crate::error::{Result, SyncError};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub const METADATA_FILE: &str = "metadata.json";
pub const COVER_FILE: &str = "cover.jpg";
pub const AUDIO_DIR: &str = "audio";
pub const AUDIO_INFO_FILE: &str = "audio_info.json";

/// Fallback when neither MIME type nor URL reveal the container
const DEFAULT_AUDIO_EXTENSION: &str = "mp3";

/// Maximum directory name length in bytes
const MAX_COMPONENT_LENGTH: usize = 255;

/// Paths of every artifact belonging to one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    item_dir: PathBuf,
}

impl ArtifactLayout {
    /// Build the layout for `item_id` under `root`
    ///
    /// The id is validated first so a hostile id cannot escape the root.
    pub fn new(root: &Path, item_id: &str) -> Result<Self> {
        validate_item_id(item_id)?;
        Ok(Self {
            item_dir: root.join(item_id),
        })
    }

    pub fn item_dir(&self) -> &Path {
        &self.item_dir
    }

    pub fn metadata(&self) -> PathBuf {
        self.item_dir.join(METADATA_FILE)
    }

    pub fn cover(&self) -> PathBuf {
        self.item_dir.join(COVER_FILE)
    }

    pub fn audio_dir(&self) -> PathBuf {
        self.item_dir.join(AUDIO_DIR)
    }

    pub fn audio_info(&self) -> PathBuf {
        self.item_dir.join(AUDIO_INFO_FILE)
    }

    /// Path of audio track `index` with the given extension
    pub fn audio_track(&self, index: usize, extension: &str) -> PathBuf {
        self.audio_dir().join(audio_file_name(index, extension))
    }
}

/// File name of an audio track: `chapter_<n>.<ext>`
pub fn audio_file_name(index: usize, extension: &str) -> String {
    format!("chapter_{}.{}", index, extension.trim_start_matches('.'))
}

/// Parse the track index out of an audio file name
pub fn parse_audio_file_name(name: &str) -> Option<usize> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"^chapter_(\d+)\.([A-Za-z0-9]+)$").expect("audio file pattern is valid")
    });

    pattern
        .captures(name)
        .and_then(|caps| caps.get(1))
        .and_then(|index| index.as_str().parse().ok())
}

/// Reject ids that cannot safely be used as a directory name
pub fn validate_item_id(item_id: &str) -> Result<()> {
    if item_id.is_empty() || item_id.trim() != item_id {
        return Err(SyncError::invalid_input(format!(
            "item id '{}' is empty or padded",
            item_id
        )));
    }
    if item_id.starts_with('.') {
        return Err(SyncError::invalid_input(format!(
            "item id '{}' must not start with a dot",
            item_id
        )));
    }
    if item_id.len() > MAX_COMPONENT_LENGTH {
        return Err(SyncError::invalid_input(format!(
            "item id is longer than {} bytes",
            MAX_COMPONENT_LENGTH
        )));
    }
    if item_id
        .chars()
        .any(|c| matches!(c, '/' | '\\' | ':' | '\0') || c.is_control())
    {
        return Err(SyncError::invalid_input(format!(
            "item id '{}' contains path characters",
            item_id.escape_debug()
        )));
    }
    Ok(())
}

/// Pick a file extension for a track
///
/// MIME type first, then the URL path, then `mp3`.
pub fn audio_extension(track: &TrackDescriptor) -> String {
    if let Some(ext) = track.mime_type.as_deref().and_then(extension_for_mime) {
        return ext.to_string();
    }

    url::Url::parse(&track.content_url)
        .ok()
        .and_then(|url| {
            Path::new(url.path())
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.to_ascii_lowercase())
        })
        .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| DEFAULT_AUDIO_EXTENSION.to_string())
}

fn extension_for_mime(mime: &str) -> Option<&'static str> {
    let essence = mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    match essence.as_str() {
        "audio/mpeg" | "audio/mp3" => Some("mp3"),
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => Some("m4a"),
        "audio/x-m4b" | "audio/m4b" => Some("m4b"),
        "audio/aac" | "audio/aacp" => Some("aac"),
        "audio/flac" | "audio/x-flac" => Some("flac"),
        "audio/ogg" | "audio/opus" => Some("ogg"),
        "audio/wav" | "audio/x-wav" => Some("wav"),
        _ => None,
    }
}
