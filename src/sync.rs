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


//! Composition root
//!
//! Builds every service of the sync core explicitly and wires them
//! together. There is no global state: the host owns one [`OfflineSync`]
//! and everything hangs off it.

use crate::api::client::ServerClient;
use crate::api::traits::CredentialProvider;
use crate::config::SyncConfig;
use crate::download::fetcher::{Collaborators, NetworkFetcher};
use crate::download::healer::BackgroundHealer;
use crate::download::manager::DownloadManager;
use crate::download::pipeline::PipelineContext;
use crate::download::registry::DownloadRegistry;
use crate::download::retry::RetryPolicy;
use crate::error::Result;
use crate::file::library::OfflineLibrary;
use crate::file::storage::StorageService;
use crate::file::validation::ValidationService;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

impl Collaborators {
    /// Use one HTTP client for both metadata and bytes
    pub fn from_server(client: Arc<ServerClient>, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            provider: client.clone(),
            transport: client,
            credentials,
        }
    }
}

/// The assembled offline sync core
#[derive(Debug)]
pub struct OfflineSync {
    config: SyncConfig,
    storage: Arc<StorageService>,
    library: Arc<OfflineLibrary>,
    registry: DownloadRegistry,
    manager: DownloadManager,
    healer: Arc<BackgroundHealer>,
}

impl OfflineSync {
    /// Build the services and load already-downloaded items from disk
    pub async fn open(config: SyncConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let storage = Arc::new(StorageService::new(config.download_root.clone()));
        storage.ensure_root().await?;

        let library = Arc::new(OfflineLibrary::new());
        let items = storage.load_persisted_items().await?;
        tracing::info!(
            root = %config.download_root.display(),
            items = items.len(),
            "loaded offline library"
        );
        library.load(items);

        let validator = ValidationService::new(
            storage.clone(),
            config.min_cover_bytes,
            config.min_audio_bytes,
        );
        let registry = DownloadRegistry::new();

        let ctx = Arc::new(PipelineContext {
            storage: storage.clone(),
            validator: validator.clone(),
            fetcher: NetworkFetcher::new(collaborators, &config),
            retry: RetryPolicy::from(&config.retry),
            min_free_bytes: config.min_free_bytes,
            stage_pacing: config.stage_pacing(),
        });

        let manager = DownloadManager::new(
            ctx,
            registry.clone(),
            library.clone(),
            config.event_capacity,
        );

        let healer = Arc::new(BackgroundHealer::new(
            storage.clone(),
            validator,
            registry.clone(),
            library.clone(),
            config.healer.clone(),
        ));

        Ok(Self {
            config,
            storage,
            library,
            registry,
            manager,
            healer,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn manager(&self) -> &DownloadManager {
        &self.manager
    }

    pub fn healer(&self) -> &Arc<BackgroundHealer> {
        &self.healer
    }

    pub fn library(&self) -> &Arc<OfflineLibrary> {
        &self.library
    }

    pub fn storage(&self) -> &Arc<StorageService> {
        &self.storage
    }

    pub fn registry(&self) -> &DownloadRegistry {
        &self.registry
    }

    /// Start the background healer on its own task
    pub fn start_healer(
        &self,
        connectivity: watch::Receiver<bool>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        self.healer.clone().spawn(connectivity, shutdown)
    }
}
