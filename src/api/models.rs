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


//! Content item and streaming session models
//!
//! `ContentItem` and `TrackDescriptor` are the shapes the rest of the crate
//! works with. The `*Dto` types mirror the server's JSON and are converted at
//! the API boundary so that the persisted `metadata.json` format does not
//! follow server-side renames.

use serde::{Deserialize, Serialize};

/// A downloadable item: metadata, one cover, N audio tracks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentItem {
    /// Stable identifier, also the directory name on disk
    pub id: String,

    pub title: String,

    pub author: String,

    /// Chapters in playback order
    #[serde(default)]
    pub chapters: Vec<Chapter>,

    /// Server-side cover reference, if the item has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_path: Option<String>,
}

/// Chapter marker within a content item
///
/// Chapter count is informational only. The number of audio tracks comes
/// from the streaming session and may differ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    pub title: String,

    /// Start offset in seconds
    pub start: f64,

    /// End offset in seconds
    pub end: f64,

    /// Upstream session/chapter reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_ref: Option<String>,
}

impl Chapter {
    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }
}

/// One audio track returned by streaming session negotiation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackDescriptor {
    /// Zero-based position of the track
    pub index: usize,

    /// Absolute URL of the audio payload
    pub content_url: String,

    /// Duration in seconds
    pub duration: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

// ===== Wire formats =====

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LibraryItemDto {
    pub id: String,
    pub media: MediaDto,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MediaDto {
    pub metadata: MediaMetadataDto,
    #[serde(default)]
    pub chapters: Vec<ChapterDto>,
    #[serde(default)]
    pub cover_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MediaMetadataDto {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub author_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ChapterDto {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    pub start: f64,
    pub end: f64,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PlaybackSessionDto {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub audio_tracks: Vec<AudioTrackDto>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AudioTrackDto {
    #[serde(default)]
    pub index: Option<usize>,
    pub content_url: String,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub mime_type: Option<String>,
}

impl From<LibraryItemDto> for ContentItem {
    fn from(dto: LibraryItemDto) -> Self {
        let chapters = dto
            .media
            .chapters
            .into_iter()
            .enumerate()
            .map(|(i, chapter)| Chapter {
                title: chapter
                    .title
                    .unwrap_or_else(|| format!("Chapter {}", i + 1)),
                start: chapter.start,
                end: chapter.end,
                upstream_ref: chapter.id.map(|id| match id {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                }),
            })
            .collect();

        ContentItem {
            id: dto.id,
            title: dto.media.metadata.title.unwrap_or_default(),
            author: dto
                .media
                .metadata
                .author_name
                .unwrap_or_else(|| "Unknown Author".to_string()),
            chapters,
            cover_path: dto.media.cover_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_item_conversion() {
        let json = r#"{
            "id": "li_42",
            "media": {
                "metadata": { "title": "The Long Road", "authorName": "A. Writer" },
                "chapters": [
                    { "id": 0, "start": 0.0, "end": 610.5, "title": "Opening" },
                    { "id": 1, "start": 610.5, "end": 1200.0 }
                ],
                "coverPath": "/metadata/items/li_42/cover.jpg"
            }
        }"#;

        let dto: LibraryItemDto = serde_json::from_str(json).unwrap();
        let item = ContentItem::from(dto);

        assert_eq!(item.id, "li_42");
        assert_eq!(item.author, "A. Writer");
        assert_eq!(item.chapters.len(), 2);
        assert_eq!(item.chapters[1].title, "Chapter 2");
        assert_eq!(item.chapters[0].upstream_ref.as_deref(), Some("0"));
        assert!((item.chapters[0].duration() - 610.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_metadata_document_is_camel_case() {
        let item = ContentItem {
            id: "B1".to_string(),
            title: "Title".to_string(),
            author: "Author".to_string(),
            chapters: vec![],
            cover_path: Some("/covers/B1".to_string()),
        };
        let json = serde_json::to_string(&item).unwrap();
        assert!(json.contains("\"coverPath\""));
    }
}
