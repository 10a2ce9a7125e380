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


//! Remote server access
//!
//! - `models` - content items, chapters and track descriptors
//! - `traits` - collaborator interfaces the pipeline consumes
//! - `client` - reqwest implementation of those interfaces

pub mod client;
pub mod models;
pub mod traits;

// Re-export commonly used types
pub use client::ServerClient;
pub use models::{Chapter, ContentItem, TrackDescriptor};
pub use traits::{ByteTransport, CredentialProvider, ItemProvider, StaticToken, TransportResponse};
