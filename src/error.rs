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


//! Error types for the download synchronization core
//!
//! # Error Categories
//!
//! ### Storage
//! - Not enough free space before a download starts → `InsufficientStorage`
//! - Filesystem failures → `FileIoError`, `IoError`
//!
//! ### Network (surfaced by the network fetcher)
//! - Connection failures and timeouts → `Network { kind, .. }`
//! - Non-2xx responses → `Network { kind: HttpStatus(code), .. }`
//! - Small "successful" error bodies → `UndersizedResponse`
//! - Unparseable payloads → `Decode`
//! - Streaming session without tracks → `MissingSessionData`
//!
//! ### Integrity
//! - Incomplete or corrupted artifact on disk → `Validation(ValidationFailure)`
//!
//! ### Control
//! - Caller-issued cancellation → `Cancelled`

use thiserror::Error;

/// Result type alias using our SyncError type
pub type Result<T> = std::result::Result<T, SyncError>;

/// How a network operation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkFailureKind {
    /// Connection, DNS or stream failure
    Transport,
    /// Request exceeded its bounded timeout
    Timeout,
    /// Server answered with a non-2xx status
    HttpStatus(u16),
}

impl std::fmt::Display for NetworkFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkFailureKind::Transport => write!(f, "transport failure"),
            NetworkFailureKind::Timeout => write!(f, "timed out"),
            NetworkFailureKind::HttpStatus(code) => write!(f, "HTTP {}", code),
        }
    }
}

/// Why a persisted artifact is not usable
///
/// The display text names the exact file that failed so the healer log and
/// support diagnostics can point at it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
    /// A required file does not exist
    #[error("missing {artifact}")]
    MissingFile { artifact: String },

    /// A file exists but is below the minimum plausible size
    #[error("{artifact} is too small ({actual} bytes, expected at least {minimum})")]
    FileTooSmall {
        artifact: String,
        actual: u64,
        minimum: u64,
    },

    /// The audio-info record is absent, so the track count is unknown
    #[error("missing audio info record")]
    MissingAudioInfo,

    /// A JSON document exists but cannot be deserialized
    #[error("unreadable {artifact}: {reason}")]
    CorruptDocument { artifact: String, reason: String },
}

/// Main error type for the sync core
#[derive(Error, Debug)]
pub enum SyncError {
    // ===== Storage Errors =====

    /// Not enough free space to start a download
    #[error("Insufficient storage (need {required} bytes free, have {available} bytes)")]
    InsufficientStorage { required: u64, available: u64 },

    /// Generic file I/O error with path context
    #[error("File I/O error: {0}")]
    FileIoError(String),

    // ===== Network Errors =====

    /// Transport, timeout or HTTP status failure
    #[error("Network error ({kind}): {message}")]
    Network {
        kind: NetworkFailureKind,
        message: String,
    },

    /// Response body below the minimum plausible size for its payload
    #[error("Response too small: {received} bytes (minimum {minimum})")]
    UndersizedResponse { received: u64, minimum: u64 },

    /// Response could not be decoded
    #[error("Failed to decode response: {0}")]
    Decode(String),

    /// The streaming session did not describe any audio tracks
    #[error("No audio tracks available for item {0}")]
    MissingSessionData(String),

    // ===== Integrity Errors =====

    /// Persisted artifact failed validation
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationFailure),

    // ===== General Errors =====

    /// Operation was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Credential collaborator could not provide a token
    #[error("Credentials unavailable: {0}")]
    Credentials(String),

    /// Generic input validation error
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration is invalid or incomplete
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Internal error that should not normally occur
    #[error("Internal error: {0}")]
    InternalError(String),

    // ===== External Library Errors =====

    /// HTTP client error from reqwest
    #[error("HTTP client error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// Helper methods for creating common errors
impl SyncError {
    /// Create a Network error
    pub fn network_error<S: Into<String>>(kind: NetworkFailureKind, message: S) -> Self {
        SyncError::Network {
            kind,
            message: message.into(),
        }
    }

    /// Create a Network error for a non-2xx status
    pub fn http_status<S: Into<String>>(status: u16, message: S) -> Self {
        Self::network_error(NetworkFailureKind::HttpStatus(status), message)
    }

    /// Create an InvalidInput error with a message
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        SyncError::InvalidInput(message.into())
    }

    /// Create an InternalError with a message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        SyncError::InternalError(message.into())
    }

    /// Check if error came from the network fetcher
    pub fn is_network_error(&self) -> bool {
        matches!(
            self,
            SyncError::Network { .. }
                | SyncError::UndersizedResponse { .. }
                | SyncError::Decode(_)
                | SyncError::MissingSessionData(_)
                | SyncError::ReqwestError(_)
        )
    }

    /// Check if error is retryable
    ///
    /// Every failure the network fetcher can surface is retried. Storage
    /// shortage, validation failures and cancellation never are.
    pub fn is_retryable(&self) -> bool {
        self.is_network_error()
    }

    /// Check if error is related to file/disk operations
    pub fn is_file_error(&self) -> bool {
        matches!(
            self,
            SyncError::FileIoError(_)
                | SyncError::IoError(_)
                | SyncError::InsufficientStorage { .. }
        )
    }

    /// Get user-friendly error message suitable for display
    pub fn user_message(&self) -> String {
        match self {
            SyncError::InsufficientStorage { required, available } => format!(
                "Not enough storage. Need {} MB free, only {} MB available.",
                required / 1_000_000,
                available / 1_000_000
            ),
            SyncError::Network {
                kind: NetworkFailureKind::Timeout,
                ..
            } => "The server took too long to respond.".to_string(),
            SyncError::Network { .. } | SyncError::ReqwestError(_) => {
                "Network connection problem.".to_string()
            }
            SyncError::UndersizedResponse { .. } | SyncError::Decode(_) => {
                "The server sent an unexpected response.".to_string()
            }
            SyncError::MissingSessionData(_) => "No audio is available for this item.".to_string(),
            SyncError::Validation(_) => "The downloaded files are incomplete.".to_string(),
            SyncError::Cancelled => "Download cancelled.".to_string(),
            SyncError::Credentials(_) => "Please sign in again.".to_string(),
            _ => self.to_string(),
        }
    }
}
