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


//! Download registry
//!
//! The single source of truth for "which item ids are busy". An id is busy
//! while a download pipeline runs for it or while the healer holds a repair
//! claim on it. Both kinds of entry are taken atomically and released by an
//! RAII guard, so every terminal path (success, failure, cancellation,
//! panic) frees the id.
//!
//! Because the healer deletes only while holding a [`RepairClaim`], a
//! download for the same id cannot start between the healer's check and its
//! delete.

use crate::download::progress::DownloadRecord;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
enum Entry {
    Download {
        cancel: CancellationToken,
        record: DownloadRecord,
        committed: bool,
    },
    Repair,
}

#[derive(Debug, Clone, Default)]
pub struct DownloadRegistry {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl DownloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `item_id` for a download
    ///
    /// Returns `None` if a download or repair already holds the id.
    pub fn try_begin_download(&self, item_id: &str) -> Option<DownloadLease> {
        let mut entries = self.lock();
        if entries.contains_key(item_id) {
            return None;
        }

        let cancel = CancellationToken::new();
        entries.insert(
            item_id.to_string(),
            Entry::Download {
                cancel: cancel.clone(),
                record: DownloadRecord::new(item_id),
                committed: false,
            },
        );

        Some(DownloadLease {
            registry: self.clone(),
            item_id: item_id.to_string(),
            cancel,
        })
    }

    /// Claim `item_id` for repair
    ///
    /// Returns `None` if the id is busy.
    pub fn try_begin_repair(&self, item_id: &str) -> Option<RepairClaim> {
        let mut entries = self.lock();
        if entries.contains_key(item_id) {
            return None;
        }
        entries.insert(item_id.to_string(), Entry::Repair);

        Some(RepairClaim {
            registry: self.clone(),
            item_id: item_id.to_string(),
        })
    }

    /// Whether a download pipeline is running for `item_id`
    pub fn is_downloading(&self, item_id: &str) -> bool {
        matches!(self.lock().get(item_id), Some(Entry::Download { .. }))
    }

    /// Whether `item_id` is claimed by a download or a repair
    pub fn is_busy(&self, item_id: &str) -> bool {
        self.lock().contains_key(item_id)
    }

    /// Snapshot of the record of an active download
    pub fn record(&self, item_id: &str) -> Option<DownloadRecord> {
        match self.lock().get(item_id) {
            Some(Entry::Download { record, .. }) => Some(record.clone()),
            _ => None,
        }
    }

    /// Mutate the record of an active download, returning the new snapshot
    pub fn update_record<F>(&self, item_id: &str, update: F) -> Option<DownloadRecord>
    where
        F: FnOnce(&mut DownloadRecord),
    {
        match self.lock().get_mut(item_id) {
            Some(Entry::Download { record, .. }) => {
                update(record);
                Some(record.clone())
            }
            _ => None,
        }
    }

    /// Signal cancellation of one download
    ///
    /// Does not wait for the pipeline to wind down. Returns whether a
    /// cancellable download was active; a committed download is past the
    /// point where it can be cancelled.
    pub fn cancel(&self, item_id: &str) -> bool {
        match self.lock().get_mut(item_id) {
            Some(Entry::Download {
                cancel,
                record,
                committed: false,
            }) => {
                record.cancelled = true;
                cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Signal cancellation of every active download, returning the count
    pub fn cancel_all(&self) -> usize {
        let mut count = 0;
        for entry in self.lock().values_mut() {
            if let Entry::Download {
                cancel,
                record,
                committed: false,
            } = entry
            {
                record.cancelled = true;
                cancel.cancel();
                count += 1;
            }
        }
        count
    }

    /// Ids with an active download, sorted
    pub fn active_downloads(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .lock()
            .iter()
            .filter(|(_, entry)| matches!(entry, Entry::Download { .. }))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Mark a download committed unless it was already cancelled
    fn commit(&self, item_id: &str) -> bool {
        match self.lock().get_mut(item_id) {
            Some(Entry::Download {
                cancel, committed, ..
            }) => {
                if cancel.is_cancelled() {
                    return false;
                }
                *committed = true;
                true
            }
            _ => false,
        }
    }

    fn release(&self, item_id: &str) {
        self.lock().remove(item_id);
    }
}

/// Exclusive claim on an item for the lifetime of one download pipeline
#[derive(Debug)]
pub struct DownloadLease {
    registry: DownloadRegistry,
    item_id: String,
    cancel: CancellationToken,
}

impl DownloadLease {
    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Mutate this download's record, returning the new snapshot
    pub fn update<F>(&self, update: F) -> Option<DownloadRecord>
    where
        F: FnOnce(&mut DownloadRecord),
    {
        self.registry.update_record(&self.item_id, update)
    }

    /// Pass the point of no return
    ///
    /// Returns false if the download was cancelled first. Once committed,
    /// `cancel` and `cancel_all` no longer reach this download, so a
    /// successful result can be published without a cancel slipping in.
    pub fn commit(&self) -> bool {
        self.registry.commit(&self.item_id)
    }
}

impl Drop for DownloadLease {
    fn drop(&mut self) {
        self.registry.release(&self.item_id);
    }
}

/// Exclusive claim on an item while the healer inspects or deletes it
#[derive(Debug)]
pub struct RepairClaim {
    registry: DownloadRegistry,
    item_id: String,
}

impl RepairClaim {
    pub fn item_id(&self) -> &str {
        &self.item_id
    }
}

impl Drop for RepairClaim {
    fn drop(&mut self) {
        self.registry.release(&self.item_id);
    }
}
