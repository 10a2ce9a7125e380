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


//! Artifact validation
//!
//! Decides whether a persisted item is complete. Checks run in a fixed order
//! and stop at the first failure:
//! 1. metadata document exists and deserializes
//! 2. audio-info record exists and deserializes
//! 3. audio files `0..trackCount` exist and meet the minimum audio size
//! 4. cover exists and meets the minimum cover size
//!
//! The expected number of audio files always comes from the audio-info
//! record. Chapter count is never consulted.

use crate::error::{Result, ValidationFailure};
use crate::file::layout::{AUDIO_INFO_FILE, COVER_FILE, METADATA_FILE};
use crate::file::storage::StorageService;
use std::sync::Arc;

/// Outcome of validating one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid,
    Invalid(ValidationFailure),
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid)
    }

    /// Convert into a result, mapping `Invalid` to `SyncError::Validation`
    pub fn into_result(self) -> Result<()> {
        match self {
            Validation::Valid => Ok(()),
            Validation::Invalid(failure) => Err(failure.into()),
        }
    }
}

/// Validation service
#[derive(Debug, Clone)]
pub struct ValidationService {
    storage: Arc<StorageService>,
    min_cover_bytes: u64,
    min_audio_bytes: u64,
}

impl ValidationService {
    pub fn new(storage: Arc<StorageService>, min_cover_bytes: u64, min_audio_bytes: u64) -> Self {
        Self {
            storage,
            min_cover_bytes,
            min_audio_bytes,
        }
    }

    /// Validate the artifact of `item_id`
    ///
    /// Only an invalid id is an error; every artifact problem is reported
    /// as [`Validation::Invalid`].
    pub async fn validate(&self, item_id: &str) -> Result<Validation> {
        let layout = self.storage.layout(item_id)?;

        match self.storage.read_metadata(item_id).await {
            Ok(Some(_)) => {}
            Ok(None) => return Ok(missing(METADATA_FILE)),
            Err(e) => return Ok(corrupt(METADATA_FILE, e)),
        }

        let info = match self.storage.read_audio_info(item_id).await {
            Ok(Some(info)) => info,
            Ok(None) => return Ok(Validation::Invalid(ValidationFailure::MissingAudioInfo)),
            Err(e) => return Ok(corrupt(AUDIO_INFO_FILE, e)),
        };

        if info.track_count == 0 {
            return Ok(Validation::Invalid(ValidationFailure::CorruptDocument {
                artifact: AUDIO_INFO_FILE.to_string(),
                reason: "track count is zero".to_string(),
            }));
        }

        let files = self.storage.audio_files(item_id).await?;
        for index in 0..info.track_count {
            let artifact = format!("audio track {}", index);
            let Some(path) = files.get(&index) else {
                return Ok(Validation::Invalid(ValidationFailure::MissingFile { artifact }));
            };
            if let Some(invalid) = self.check_size(path, artifact, self.min_audio_bytes).await {
                return Ok(invalid);
            }
        }

        if let Some(invalid) = self
            .check_size(&layout.cover(), COVER_FILE.to_string(), self.min_cover_bytes)
            .await
        {
            return Ok(invalid);
        }

        Ok(Validation::Valid)
    }

    async fn check_size(
        &self,
        path: &std::path::Path,
        artifact: String,
        minimum: u64,
    ) -> Option<Validation> {
        match self.storage.file_size(path).await {
            None => Some(Validation::Invalid(ValidationFailure::MissingFile { artifact })),
            Some(actual) if actual < minimum => {
                Some(Validation::Invalid(ValidationFailure::FileTooSmall {
                    artifact,
                    actual,
                    minimum,
                }))
            }
            Some(_) => None,
        }
    }
}

fn missing(artifact: &str) -> Validation {
    Validation::Invalid(ValidationFailure::MissingFile {
        artifact: artifact.to_string(),
    })
}

fn corrupt(artifact: &str, error: crate::error::SyncError) -> Validation {
    Validation::Invalid(ValidationFailure::CorruptDocument {
        artifact: artifact.to_string(),
        reason: error.to_string(),
    })
}
