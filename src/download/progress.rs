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


//! Download stages, progress records and events
//!
//! # Progress Plan
//! - preparing done: 5%
//! - metadata fetched: 10%
//! - metadata persisted: 15%
//! - cover written: 20%
//! - audio tracks: 20% to 95%, split evenly over the negotiated track count
//! - finalized and validated: 100%
//!
//! Progress within one attempt never decreases. A new download of the same
//! item starts a fresh record at 0.

use serde::{Deserialize, Serialize};

pub const PROGRESS_PREPARED: f64 = 0.05;
pub const PROGRESS_METADATA_FETCHED: f64 = 0.10;
pub const PROGRESS_METADATA_PERSISTED: f64 = 0.15;
pub const PROGRESS_COVER_DONE: f64 = 0.20;
pub const PROGRESS_AUDIO_DONE: f64 = 0.95;
pub const PROGRESS_COMPLETE: f64 = 1.0;

/// Progress after `completed` of `total` audio tracks
pub fn audio_progress(completed: usize, total: usize) -> f64 {
    if total == 0 {
        return PROGRESS_COVER_DONE;
    }
    let span = PROGRESS_AUDIO_DONE - PROGRESS_COVER_DONE;
    let fraction = completed.min(total) as f64 / total as f64;
    PROGRESS_COVER_DONE + span * fraction
}

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Preparing,
    FetchingMetadata,
    DownloadingCover,
    DownloadingAudio,
    Finalizing,
    Complete,
    Failed,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Complete | Stage::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Preparing => "preparing",
            Stage::FetchingMetadata => "fetchingMetadata",
            Stage::DownloadingCover => "downloadingCover",
            Stage::DownloadingAudio => "downloadingAudio",
            Stage::Finalizing => "finalizing",
            Stage::Complete => "complete",
            Stage::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-memory state of one active download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRecord {
    pub item_id: String,
    pub stage: Stage,

    /// Fraction in `[0, 1]`
    pub progress: f64,

    /// Short human-readable status
    pub status: String,

    pub cancelled: bool,
}

impl DownloadRecord {
    pub fn new(item_id: &str) -> Self {
        Self {
            item_id: item_id.to_string(),
            stage: Stage::Preparing,
            progress: 0.0,
            status: "Preparing download".to_string(),
            cancelled: false,
        }
    }

    /// Raise progress to `progress`; lower values are ignored
    pub fn advance(&mut self, progress: f64) {
        let clamped = progress.clamp(0.0, 1.0);
        if clamped > self.progress {
            self.progress = clamped;
        }
    }

    pub fn event(&self) -> DownloadEvent {
        DownloadEvent {
            item_id: self.item_id.clone(),
            progress: self.progress,
            status: self.status.clone(),
            stage: self.stage,
        }
    }
}

/// Progress event delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadEvent {
    pub item_id: String,
    pub progress: f64,
    pub status: String,
    pub stage: Stage,
}

impl DownloadEvent {
    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Format progress as display string
    pub fn display_string(&self) -> String {
        format!(
            "{}: {:>5.1}% [{}] {}",
            self.item_id,
            self.progress * 100.0,
            self.stage,
            self.status
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_progress_spreads_evenly() {
        assert_eq!(audio_progress(0, 4), PROGRESS_COVER_DONE);
        assert!((audio_progress(2, 4) - 0.575).abs() < 1e-9);
        assert!((audio_progress(4, 4) - PROGRESS_AUDIO_DONE).abs() < 1e-9);
        assert!((audio_progress(9, 4) - PROGRESS_AUDIO_DONE).abs() < 1e-9);
    }

    #[test]
    fn test_advance_is_monotonic() {
        let mut record = DownloadRecord::new("B1");
        record.advance(0.4);
        record.advance(0.2);
        assert_eq!(record.progress, 0.4);
        record.advance(3.0);
        assert_eq!(record.progress, 1.0);
    }

    #[test]
    fn test_terminal_stages() {
        assert!(Stage::Complete.is_terminal());
        assert!(Stage::Failed.is_terminal());
        assert!(!Stage::Finalizing.is_terminal());
    }

    #[test]
    fn test_stage_serializes_camel_case() {
        assert_eq!(
            serde_json::to_string(&Stage::DownloadingAudio).unwrap(),
            "\"downloadingAudio\""
        );
    }
}
