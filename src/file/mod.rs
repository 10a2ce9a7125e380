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


//! Local storage of downloaded items
//!
//! This module owns the download root: directory layout, atomic writes,
//! size accounting, artifact validation and the in-memory library view.

pub mod layout;
pub mod library;
pub mod storage;
pub mod validation;

// Re-export commonly used types
pub use layout::ArtifactLayout;
pub use library::OfflineLibrary;
pub use storage::{AudioInfo, AudioTrackInfo, StorageService};
pub use validation::{Validation, ValidationService};
