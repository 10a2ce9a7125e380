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


//! ShelfSync core: offline download synchronization
//!
//! Mirrors remote content items (metadata, cover, audio tracks) into local
//! storage, validates what was written and removes anything incomplete.

pub mod api;
pub mod config;
pub mod download;
pub mod error;
pub mod file;
pub mod sync;

pub use config::{HealerConfig, RetryConfig, ServerConfig, SyncConfig};
pub use download::{
    Collaborators, DownloadEvent, DownloadManager, DownloadOutcome, DownloadRequest, Stage,
};
pub use error::{Result, SyncError};
pub use sync::OfflineSync;
