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


//! Download pipeline
//!
//! This module fetches content items from the server into local storage.
//!
//! # Components
//! - `retry` - fixed-schedule retry policy
//! - `fetcher` - one network attempt with timeouts and size checks
//! - `registry` - which items are busy, with RAII leases
//! - `pipeline` - the per-item stage machine
//! - `manager` - public entry point, one task per download
//! - `healer` - background removal of invalid artifacts

pub mod fetcher;
pub mod healer;
pub mod manager;
pub mod pipeline;
pub mod progress;
pub mod registry;
pub mod retry;

// Re-export commonly used types
pub use fetcher::{Collaborators, NetworkFetcher, PayloadKind};
pub use healer::{BackgroundHealer, HealReport};
pub use manager::{DownloadHandle, DownloadManager, DownloadOutcome, DownloadRequest};
pub use pipeline::{PipelineContext, PipelineFailure, Resource};
pub use progress::{DownloadEvent, DownloadRecord, Stage};
pub use registry::{DownloadLease, DownloadRegistry, RepairClaim};
pub use retry::RetryPolicy;
