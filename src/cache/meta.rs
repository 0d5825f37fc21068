// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Namespace-metadata cache.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error, info};

use crate::metrics;
use crate::model::{AppNamespace, SCAN_BATCH};
use crate::store::{MetaStore, StoreResult};

fn app_name_key(app_id: &str, name: &str) -> String {
    format!("{app_id}+{name}")
}

/// Mirrors the app-namespace table under three lookup shapes: by
/// (appId, name), by public name, and by row id.
///
/// New rows arrive via an ascending-id tail scan. Updates and deletes leave
/// no trace the tail scan can see, so a periodic full rebuild re-fetches
/// every cached id and diffs by `modified_at`, dropping rows the store no
/// longer returns.
pub struct NamespaceMetaCache {
    store: Arc<dyn MetaStore>,
    by_app_and_name: DashMap<String, AppNamespace>,
    public_by_name: DashMap<String, AppNamespace>,
    by_id: DashMap<i64, AppNamespace>,
    cursor: AtomicI64,
}

impl NamespaceMetaCache {
    pub fn new(store: Arc<dyn MetaStore>) -> Self {
        Self {
            store,
            by_app_and_name: DashMap::new(),
            public_by_name: DashMap::new(),
            by_id: DashMap::new(),
            cursor: AtomicI64::new(0),
        }
    }

    /// Blocking full load; call before serving traffic.
    pub async fn load(&self) -> StoreResult<()> {
        self.scan_new().await?;
        info!(entries = self.by_id.len(), "namespace meta cache loaded");
        Ok(())
    }

    /// Pick up rows appended since the last scan.
    pub async fn tail_scan(&self) {
        if let Err(e) = self.scan_new().await {
            error!(error = %e, "namespace meta tail scan failed");
        }
    }

    /// Re-fetch every cached id, absorb updates, drop deleted rows.
    pub async fn rebuild(&self) {
        if let Err(e) = self.try_rebuild().await {
            error!(error = %e, "namespace meta rebuild failed");
        }
    }

    pub fn find_by_app_and_name(&self, app_id: &str, name: &str) -> Option<AppNamespace> {
        self.by_app_and_name
            .get(&app_name_key(app_id, name))
            .map(|r| r.value().clone())
    }

    /// The owning registration of a public namespace, if one exists.
    pub fn find_public(&self, name: &str) -> Option<AppNamespace> {
        self.public_by_name.get(name).map(|r| r.value().clone())
    }

    async fn scan_new(&self) -> StoreResult<()> {
        loop {
            let cursor = self.cursor.load(Ordering::SeqCst);
            let batch = self.store.app_namespaces_after(cursor, SCAN_BATCH).await?;
            if batch.is_empty() {
                break;
            }
            let short = batch.len() < SCAN_BATCH;
            let last_id = batch.last().map(|ns| ns.id).unwrap_or(cursor);
            for ns in batch {
                self.index(ns);
            }
            self.cursor.fetch_max(last_id, Ordering::SeqCst);
            if short {
                break;
            }
        }
        metrics::meta_cache_size(self.by_id.len());
        Ok(())
    }

    async fn try_rebuild(&self) -> StoreResult<()> {
        let mut ids: Vec<i64> = self.by_id.iter().map(|r| *r.key()).collect();
        ids.sort_unstable();

        for chunk in ids.chunks(SCAN_BATCH) {
            let fetched = self.store.app_namespaces_by_ids(chunk).await?;
            let fetched_ids: std::collections::HashSet<i64> = fetched.iter().map(|ns| ns.id).collect();

            for ns in fetched {
                let changed = self
                    .by_id
                    .get(&ns.id)
                    .map(|cached| cached.modified_at != ns.modified_at)
                    .unwrap_or(true);
                if changed {
                    debug!(id = ns.id, app_id = %ns.app_id, name = %ns.name, "app namespace updated");
                    self.index(ns);
                }
            }
            for id in chunk {
                if !fetched_ids.contains(id) {
                    self.evict(*id);
                }
            }
        }
        metrics::meta_cache_size(self.by_id.len());
        Ok(())
    }

    /// Install a row under all indices, unlinking any stale keys the
    /// previous version occupied.
    fn index(&self, ns: AppNamespace) {
        if let Some(old) = self.by_id.insert(ns.id, ns.clone()) {
            let old_key = app_name_key(&old.app_id, &old.name);
            if old_key != app_name_key(&ns.app_id, &ns.name) {
                self.by_app_and_name.remove_if(&old_key, |_, v| v.id == old.id);
            }
            if old.is_public && (!ns.is_public || old.name != ns.name) {
                self.public_by_name.remove_if(&old.name, |_, v| v.id == old.id);
            }
        }
        self.by_app_and_name.insert(app_name_key(&ns.app_id, &ns.name), ns.clone());
        if ns.is_public {
            self.public_by_name.insert(ns.name.clone(), ns);
        }
    }

    fn evict(&self, id: i64) {
        if let Some((_, old)) = self.by_id.remove(&id) {
            debug!(id, app_id = %old.app_id, name = %old.name, "app namespace deleted");
            self.by_app_and_name
                .remove_if(&app_name_key(&old.app_id, &old.name), |_, v| v.id == id);
            self.public_by_name.remove_if(&old.name, |_, v| v.id == id);
        }
    }
}
