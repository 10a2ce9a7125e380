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


//! Background healer
//!
//! Removes persisted items that fail validation: leftovers of crashes,
//! force-quits and downloads that died mid-cleanup. Repair is always
//! delete-and-redownload; partial media files are never patched in place.
//!
//! # Schedule
//! - once after a settling delay at startup
//! - again on every offline to online transition
//! - optionally on a fixed interval
//!
//! Each item is inspected under a [`RepairClaim`](crate::download::registry::RepairClaim),
//! so an item with an active download is skipped and no download can start
//! while the healer deletes.

use crate::config::HealerConfig;
use crate::download::registry::DownloadRegistry;
use crate::error::Result;
use crate::file::library::OfflineLibrary;
use crate::file::storage::StorageService;
use crate::file::validation::{Validation, ValidationService};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Summary of one scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealReport {
    /// Item directories found on disk
    pub scanned: usize,
    /// Items skipped because a download or repair held them
    pub skipped_active: usize,
    pub healthy: usize,
    /// Ids of items deleted for failing validation
    pub removed: Vec<String>,
    /// Library entries dropped because their directory was gone
    pub pruned: usize,
}

#[derive(Debug)]
pub struct BackgroundHealer {
    storage: Arc<StorageService>,
    validator: ValidationService,
    registry: DownloadRegistry,
    library: Arc<OfflineLibrary>,
    config: HealerConfig,
}

impl BackgroundHealer {
    pub fn new(
        storage: Arc<StorageService>,
        validator: ValidationService,
        registry: DownloadRegistry,
        library: Arc<OfflineLibrary>,
        config: HealerConfig,
    ) -> Self {
        Self {
            storage,
            validator,
            registry,
            library,
            config,
        }
    }

    /// Scan every persisted item once
    pub async fn heal_once(&self) -> Result<HealReport> {
        let mut report = HealReport::default();

        for item_id in self.storage.list_item_ids().await? {
            report.scanned += 1;

            let Some(_claim) = self.registry.try_begin_repair(&item_id) else {
                tracing::debug!(item_id = %item_id, "skipping active item");
                report.skipped_active += 1;
                continue;
            };

            match self.validator.validate(&item_id).await {
                Ok(Validation::Valid) => {
                    report.healthy += 1;
                    if !self.library.contains(&item_id) {
                        if let Ok(Some(item)) = self.storage.read_metadata(&item_id).await {
                            self.library.insert(item);
                        }
                    }
                }
                Ok(Validation::Invalid(reason)) => {
                    tracing::info!(item_id = %item_id, reason = %reason, "removing invalid download");
                    match self.storage.delete_item(&item_id).await {
                        Ok(()) => {
                            self.library.remove(&item_id);
                            report.removed.push(item_id);
                        }
                        Err(e) => {
                            tracing::warn!(item_id = %item_id, error = %e, "failed to remove invalid download");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(item_id = %item_id, error = %e, "validation error");
                }
            }
        }

        for item_id in self.library.ids() {
            if self.registry.is_busy(&item_id) {
                continue;
            }
            if !self.storage.item_exists(&item_id).await? && self.library.remove(&item_id) {
                tracing::info!(item_id = %item_id, "dropping library entry with no files");
                report.pruned += 1;
            }
        }

        Ok(report)
    }

    async fn scan(&self, reason: &str) {
        match self.heal_once().await {
            Ok(report) => tracing::info!(
                reason,
                scanned = report.scanned,
                skipped = report.skipped_active,
                healthy = report.healthy,
                removed = report.removed.len(),
                pruned = report.pruned,
                "heal scan finished"
            ),
            Err(e) => tracing::warn!(reason, error = %e, "heal scan failed"),
        }
    }

    /// Run until `shutdown` fires
    ///
    /// `connectivity` carries `true` while the device is online. Scans run
    /// on offline to online transitions only.
    pub async fn run(&self, mut connectivity: watch::Receiver<bool>, shutdown: CancellationToken) {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(self.config.settle_delay()) => {}
        }

        self.scan("startup").await;

        let mut online = *connectivity.borrow_and_update();
        let mut watching = true;
        let mut rescan = self.config.rescan_interval().map(|period| {
            let mut ticks = time::interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticks
        });

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                changed = connectivity.changed(), if watching => {
                    if changed.is_err() {
                        tracing::debug!("connectivity source closed");
                        watching = false;
                        continue;
                    }
                    let now_online = *connectivity.borrow_and_update();
                    if now_online && !online {
                        self.scan("connectivity restored").await;
                    }
                    online = now_online;
                }
                _ = next_tick(&mut rescan) => {
                    self.scan("interval").await;
                }
            }
        }

        tracing::debug!("healer stopped");
    }

    /// Run on a new tokio task
    pub fn spawn(
        self: Arc<Self>,
        connectivity: watch::Receiver<bool>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(connectivity, shutdown).await })
    }
}

/// Next rescan tick, or never when no interval is configured
async fn next_tick(rescan: &mut Option<Interval>) {
    match rescan {
        Some(ticks) => {
            ticks.tick().await;
        }
        None => std::future::pending().await,
    }
}
