// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Release resolution.
//!
//! [`ConfigResolver`] answers "what configuration should this client see"
//! from two read-through caches over the release table:
//!
//! - by watch key: the latest active release of a release line, stamped with
//!   the notification id it was loaded under;
//! - by release id: pinned lookups for gray-matched clients.
//!
//! Entries expire after an idle window (a janitor sweep, not per-read
//! bookkeeping) and are invalidated eagerly by bus events. A client whose
//! long poll already told it about a newer notification id than the cached
//! stamp forces a refresh instead of reading the stale entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, error, warn};

use crate::bus::MessageListener;
use crate::cache::{MessageCache, NamespaceMetaCache};
use crate::gray::GrayRuleCache;
use crate::metrics;
use crate::model::{
    assemble_key, merge_configuration, split_key, Release, ReleaseMessage, CLUSTER_DEFAULT,
    KEY_SEPARATOR, NAMESPACE_APPLICATION, NOTIFICATION_ID_PLACEHOLDER,
};
use crate::store::{ReleaseStore, StoreResult};

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A client's view of a config-fetch request.
#[derive(Debug, Clone)]
pub struct ConfigRequest {
    pub app_id: String,
    pub cluster: String,
    pub namespace: String,
    pub data_center: Option<String>,
    pub client_ip: String,
    /// Release key the client currently holds; drives not-modified checks.
    pub release_key: String,
    /// Notification ids the client learned from its long poll, by watch key.
    pub messages: HashMap<String, i64>,
}

/// Outcome of a config fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    NotFound,
    NotModified,
    Config(ConfigPayload),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPayload {
    pub app_id: String,
    pub cluster: String,
    pub namespace: String,
    pub release_key: String,
    pub configurations: HashMap<String, String>,
}

/// Negative results are cached too: a namespace with no release yet would
/// otherwise hit the store on every poll.
struct KeyEntry {
    notification_id: i64,
    release: Option<Release>,
    last_access: AtomicI64,
}

struct IdEntry {
    release: Option<Release>,
    last_access: AtomicI64,
}

pub struct ConfigResolver {
    releases: Arc<dyn ReleaseStore>,
    messages: Arc<MessageCache>,
    meta: Arc<NamespaceMetaCache>,
    gray: Arc<GrayRuleCache>,
    by_key: DashMap<String, Arc<KeyEntry>>,
    by_id: DashMap<i64, Arc<IdEntry>>,
}

impl ConfigResolver {
    pub fn new(
        releases: Arc<dyn ReleaseStore>,
        messages: Arc<MessageCache>,
        meta: Arc<NamespaceMetaCache>,
        gray: Arc<GrayRuleCache>,
    ) -> Self {
        Self {
            releases,
            messages,
            meta,
            gray,
            by_key: DashMap::new(),
            by_id: DashMap::new(),
        }
    }

    /// Full client-facing resolution: own release plus, for a public
    /// namespace the app does not own, the owning app's release. The app's
    /// own values win on merge.
    pub async fn resolve_config(&self, request: &ConfigRequest) -> StoreResult<ResolveOutcome> {
        let own = self
            .resolve(
                &request.app_id,
                &request.app_id,
                &request.cluster,
                request.data_center.as_deref(),
                &request.namespace,
                &request.client_ip,
                &request.messages,
            )
            .await?;

        let public = if self.namespace_owned_by(&request.app_id, &request.namespace) {
            None
        } else {
            match self.meta.find_public(&request.namespace) {
                Some(owner) if owner.app_id != request.app_id => {
                    self.resolve(
                        &request.app_id,
                        &owner.app_id,
                        &request.cluster,
                        request.data_center.as_deref(),
                        &request.namespace,
                        &request.client_ip,
                        &request.messages,
                    )
                    .await?
                }
                _ => None,
            }
        };

        if own.is_none() && public.is_none() {
            metrics::config_served("not_found");
            return Ok(ResolveOutcome::NotFound);
        }

        let merged_key: String = [own.as_ref(), public.as_ref()]
            .iter()
            .flatten()
            .map(|r| r.release_key.as_str())
            .collect::<Vec<_>>()
            .join(&KEY_SEPARATOR.to_string());
        if merged_key == request.release_key {
            metrics::config_served("not_modified");
            return Ok(ResolveOutcome::NotModified);
        }

        let mut configurations = public.as_ref().map(|r| r.configuration_map()).unwrap_or_default();
        if let Some(own) = &own {
            configurations = merge_configuration(&configurations, &own.configuration_map());
        }

        metrics::config_served("ok");
        Ok(ResolveOutcome::Config(ConfigPayload {
            app_id: request.app_id.clone(),
            cluster: request.cluster.clone(),
            namespace: request.namespace.clone(),
            release_key: merged_key,
            configurations,
        }))
    }

    /// Resolve one release line for a client: cluster precedence is the
    /// requested cluster, then the data center, then `default`; within each
    /// candidate a gray pin beats the latest active release.
    #[allow(clippy::too_many_arguments)]
    pub async fn resolve(
        &self,
        client_app_id: &str,
        config_app_id: &str,
        cluster: &str,
        data_center: Option<&str>,
        namespace: &str,
        client_ip: &str,
        client_messages: &HashMap<String, i64>,
    ) -> StoreResult<Option<Release>> {
        let mut candidates: Vec<&str> = Vec::with_capacity(3);
        if cluster != CLUSTER_DEFAULT {
            candidates.push(cluster);
        }
        if let Some(dc) = data_center {
            if !candidates.contains(&dc) {
                candidates.push(dc);
            }
        }
        if !candidates.contains(&CLUSTER_DEFAULT) {
            candidates.push(CLUSTER_DEFAULT);
        }

        for candidate in candidates {
            if let Some(release_id) =
                self.gray
                    .find_release_id(client_app_id, client_ip, config_app_id, candidate, namespace)
            {
                if let Some(release) = self.release_by_id(release_id).await? {
                    debug!(release_id, client_app_id, client_ip, "serving gray-pinned release");
                    return Ok(Some(release));
                }
                warn!(release_id, "gray rule points at a missing or abandoned release");
            }
            if let Some(release) = self
                .latest_release(config_app_id, candidate, namespace, client_messages)
                .await?
            {
                return Ok(Some(release));
            }
        }
        Ok(None)
    }

    /// Latest active release for one release line, through the key cache.
    pub async fn latest_release(
        &self,
        app_id: &str,
        cluster: &str,
        namespace: &str,
        client_messages: &HashMap<String, i64>,
    ) -> StoreResult<Option<Release>> {
        let key = assemble_key(app_id, cluster, namespace);

        if let Some(entry) = self.by_key.get(&key).map(|r| Arc::clone(r.value())) {
            let client_id = client_messages.get(&key).copied().unwrap_or(NOTIFICATION_ID_PLACEHOLDER);
            if client_id <= entry.notification_id {
                metrics::release_cache("key", "hit");
                entry.last_access.store(now_millis(), Ordering::Relaxed);
                return Ok(entry.release.clone());
            }
            // The client has seen a notification we have not absorbed yet.
            debug!(key = %key, client_id, cached = entry.notification_id,
                "client ahead of release cache, refreshing");
            self.by_key.remove(&key);
        }

        metrics::release_cache("key", "miss");
        let entry = self.load_key(&key, app_id, cluster, namespace).await?;
        Ok(entry.release.clone())
    }

    /// A specific release by id, active rows only, through the id cache.
    pub async fn release_by_id(&self, release_id: i64) -> StoreResult<Option<Release>> {
        if let Some(entry) = self.by_id.get(&release_id).map(|r| Arc::clone(r.value())) {
            metrics::release_cache("id", "hit");
            entry.last_access.store(now_millis(), Ordering::Relaxed);
            return Ok(entry.release.clone());
        }
        metrics::release_cache("id", "miss");
        let release = self.releases.find_active_release(release_id).await?;
        let entry = Arc::new(IdEntry {
            release: release.clone(),
            last_access: AtomicI64::new(now_millis()),
        });
        self.by_id.insert(release_id, entry);
        Ok(release)
    }

    /// Drop entries idle longer than `idle`.
    pub fn sweep(&self, idle: Duration) {
        let deadline = now_millis() - idle.as_millis() as i64;
        self.by_key.retain(|_, entry| entry.last_access.load(Ordering::Relaxed) >= deadline);
        self.by_id.retain(|_, entry| entry.last_access.load(Ordering::Relaxed) >= deadline);
        metrics::release_cache_size(self.by_key.len() + self.by_id.len());
    }

    async fn load_key(
        &self,
        key: &str,
        app_id: &str,
        cluster: &str,
        namespace: &str,
    ) -> StoreResult<Arc<KeyEntry>> {
        let notification_id = self
            .messages
            .latest(key)
            .map(|m| m.id)
            .unwrap_or(NOTIFICATION_ID_PLACEHOLDER);
        let release = self.releases.latest_active_release(app_id, cluster, namespace).await?;
        let entry = Arc::new(KeyEntry {
            notification_id,
            release,
            last_access: AtomicI64::new(now_millis()),
        });
        self.by_key.insert(key.to_string(), Arc::clone(&entry));
        Ok(entry)
    }

    fn namespace_owned_by(&self, app_id: &str, namespace: &str) -> bool {
        namespace == NAMESPACE_APPLICATION
            || self.meta.find_by_app_and_name(app_id, namespace).is_some()
    }
}

#[async_trait]
impl MessageListener for ConfigResolver {
    /// Invalidate the key entry and warm it once, so the first poll after a
    /// publish never pays the load.
    async fn on_message(&self, message: &ReleaseMessage) {
        let Some((app_id, cluster, namespace)) = split_key(&message.key) else {
            return;
        };
        self.by_key.remove(&message.key);
        if let Err(e) = self.load_key(&message.key, app_id, cluster, namespace).await {
            error!(key = %message.key, error = %e, "release cache warm failed");
        }
    }
}
