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


//! Retry policy for network operations
//!
//! # Retry Strategy
//! - 3 attempts total (1 initial + 2 retries)
//! - Fixed delay schedule: 2s, 5s, 10s (the last entry repeats)
//! - Retry on: transport errors, timeouts, any HTTP status, undersized or
//!   undecodable responses, empty streaming sessions
//! - No retry on: cancellation, storage or validation failures
//!
//! Backoff sleeps race the cancellation token, so a cancelled download
//! never waits out its current delay.

use crate::config::RetryConfig;
use crate::error::{Result, SyncError};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delays: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delays: Vec<Duration>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delays,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide whether the attempt at `attempt_index` (zero-based) may be
    /// followed by another one
    pub fn should_retry(&self, attempt_index: u32, error: &SyncError) -> bool {
        if matches!(error, SyncError::Cancelled) {
            return false;
        }
        if attempt_index + 1 >= self.max_attempts {
            return false;
        }
        error.is_retryable()
    }

    /// Delay to wait after the failed attempt at `attempt_index`
    pub fn delay_for(&self, attempt_index: u32) -> Duration {
        self.delays
            .get(attempt_index as usize)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// Run `op` under this policy
    ///
    /// `op` receives the zero-based attempt index. Returns the first success,
    /// the first non-retryable error, or the last error once attempts run out.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(SyncError::Cancelled),
                result = op(attempt) => result,
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !self.should_retry(attempt, &error) {
                if !matches!(error, SyncError::Cancelled) {
                    tracing::warn!(
                        resource = label,
                        attempt = attempt + 1,
                        error = %error,
                        "giving up"
                    );
                }
                return Err(error);
            }

            let delay = self.delay_for(attempt);
            tracing::warn!(
                resource = label,
                attempt = attempt + 1,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "attempt failed, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            config
                .delays_ms
                .iter()
                .copied()
                .map(Duration::from_millis)
                .collect(),
        )
    }
}
