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


//! In-memory view of downloaded items
//!
//! Holds the metadata of every item that finished downloading and passed
//! validation. Loaded from storage at startup, then kept current by the
//! download manager and the healer.

use crate::api::models::ContentItem;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Default)]
pub struct OfflineLibrary {
    items: RwLock<HashMap<String, ContentItem>>,
}

impl OfflineLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents with items loaded from disk
    pub fn load(&self, items: Vec<ContentItem>) {
        let mut map = self.items.write().unwrap_or_else(PoisonError::into_inner);
        map.clear();
        map.extend(items.into_iter().map(|item| (item.id.clone(), item)));
    }

    pub fn contains(&self, item_id: &str) -> bool {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(item_id)
    }

    pub fn get(&self, item_id: &str) -> Option<ContentItem> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(item_id)
            .cloned()
    }

    pub fn insert(&self, item: ContentItem) {
        self.items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(item.id.clone(), item);
    }

    /// Remove an item, returning whether it was present
    pub fn remove(&self, item_id: &str) -> bool {
        self.items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(item_id)
            .is_some()
    }

    pub fn clear(&self) {
        self.items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// All items, sorted by title
    pub fn items(&self) -> Vec<ContentItem> {
        let mut items: Vec<_> = self
            .items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        items.sort_by(|a, b| a.title.cmp(&b.title).then_with(|| a.id.cmp(&b.id)));
        items
    }

    pub fn ids(&self) -> Vec<String> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
