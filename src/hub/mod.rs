// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Long-poll notification hub.
//!
//! Clients poll with the namespaces they watch and the newest notification
//! id they have seen per namespace. If the message cache already knows a
//! newer id the hub answers immediately; otherwise the request parks under
//! every watch key it resolves to, until a bus event for one of those exact
//! keys wakes it or the poll times out.
//!
//! Registration is symmetric: a guard unregisters the waiter on every exit
//! path, including client disconnects, so the registry never leaks parked
//! entries.

mod waiter;
pub mod watch_keys;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bus::MessageListener;
use crate::cache::{MessageCache, NamespaceMetaCache};
use crate::error::{Error, Result};
use crate::metrics;
use crate::model::{split_key, ReleaseMessage, NOTIFICATION_ID_PLACEHOLDER};
use waiter::Waiter;

/// One watched namespace as submitted by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientNotification {
    pub namespace_name: String,
    pub notification_id: i64,
}

/// One changed namespace reported back to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub namespace_name: String,
    pub notification_id: i64,
    /// Per-watch-key ids backing this notification; forwarded by the client
    /// on its next config fetch to detect stale release caches.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub messages: HashMap<String, i64>,
}

#[derive(Debug, Clone)]
pub struct PollRequest {
    pub app_id: String,
    pub cluster: String,
    pub data_center: Option<String>,
    pub notifications: Vec<ClientNotification>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing changed within the poll window.
    NotModified,
    Notifications(Vec<Notification>),
}

pub struct NotificationHub {
    messages: Arc<MessageCache>,
    meta: Arc<NamespaceMetaCache>,
    registry: DashMap<String, Vec<Arc<Waiter>>>,
    next_waiter_id: AtomicU64,
    timeout: Duration,
    batch: usize,
    batch_interval: Duration,
}

impl NotificationHub {
    pub fn new(
        messages: Arc<MessageCache>,
        meta: Arc<NamespaceMetaCache>,
        timeout: Duration,
        batch: usize,
        batch_interval: Duration,
    ) -> Self {
        Self {
            messages,
            meta,
            registry: DashMap::new(),
            next_waiter_id: AtomicU64::new(0),
            timeout,
            batch,
            batch_interval,
        }
    }

    /// Handle one long poll to completion.
    pub async fn poll(self: &Arc<Self>, request: PollRequest) -> Result<PollOutcome> {
        if request.notifications.is_empty() {
            return Err(Error::bad_request("no namespaces submitted"));
        }
        if request.notifications.iter().any(|n| n.namespace_name.is_empty()) {
            return Err(Error::bad_request("empty namespace name"));
        }

        let watched = watch_keys::assemble_all(
            &self.meta,
            &request.app_id,
            &request.cluster,
            request.data_center.as_deref(),
            request.notifications.iter().map(|n| n.namespace_name.as_str()),
        );

        let mut namespace_by_key = HashMap::new();
        for (namespace, keys) in &watched {
            for key in keys {
                namespace_by_key.insert(key.clone(), namespace.clone());
            }
        }
        let keys: Vec<String> = namespace_by_key.keys().cloned().collect();

        let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        let (waiter, rx) = Waiter::new(id, namespace_by_key);
        let waiter = Arc::new(waiter);
        let _guard = self.register(&keys, Arc::clone(&waiter));

        // Check after registering, so a message landing between the check
        // and the park cannot be missed.
        let changed = self.changed_notifications(&watched, &request.notifications);
        if !changed.is_empty() {
            metrics::long_poll("immediate");
            return Ok(PollOutcome::Notifications(changed));
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(notifications)) => {
                metrics::long_poll("woken");
                Ok(PollOutcome::Notifications(notifications))
            }
            // Timeout, or the waiter was dropped without completion.
            _ => {
                metrics::long_poll("timeout");
                Ok(PollOutcome::NotModified)
            }
        }
    }

    pub fn parked_waiters(&self) -> usize {
        self.registry.iter().map(|bucket| bucket.len()).sum()
    }

    fn changed_notifications(
        &self,
        watched: &HashMap<String, BTreeSet<String>>,
        submitted: &[ClientNotification],
    ) -> Vec<Notification> {
        let mut changed = Vec::new();
        for client in submitted {
            let Some(keys) = watched.get(&client.namespace_name) else { continue };
            let latest = self.messages.latest_ids_for(keys.iter().map(String::as_str));
            let newest = latest.values().copied().max().unwrap_or(NOTIFICATION_ID_PLACEHOLDER);
            if newest > client.notification_id {
                changed.push(Notification {
                    namespace_name: client.namespace_name.clone(),
                    notification_id: newest,
                    messages: latest
                        .into_iter()
                        .filter(|(_, id)| *id != NOTIFICATION_ID_PLACEHOLDER)
                        .collect(),
                });
            }
        }
        changed
    }

    fn register(self: &Arc<Self>, keys: &[String], waiter: Arc<Waiter>) -> Registration {
        for key in keys {
            self.registry.entry(key.clone()).or_default().push(Arc::clone(&waiter));
        }
        metrics::parked_waiters(self.parked_waiters());
        Registration { hub: Arc::clone(self), keys: keys.to_vec(), waiter_id: waiter.id }
    }

    fn unregister(&self, keys: &[String], waiter_id: u64) {
        for key in keys {
            if let Some(mut bucket) = self.registry.get_mut(key) {
                bucket.retain(|w| w.id != waiter_id);
                if bucket.is_empty() {
                    drop(bucket);
                    self.registry.remove_if(key, |_, b| b.is_empty());
                }
            }
        }
        metrics::parked_waiters(self.parked_waiters());
    }
}

/// Unregisters a parked waiter on every poll exit path.
struct Registration {
    hub: Arc<NotificationHub>,
    keys: Vec<String>,
    waiter_id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.hub.unregister(&self.keys, self.waiter_id);
    }
}

fn wake(waiter: &Waiter, key: &str, notification_id: i64) {
    let Some(namespace) = waiter.namespace_by_key.get(key) else { return };
    let notification = Notification {
        namespace_name: namespace.clone(),
        notification_id,
        messages: HashMap::from([(key.to_string(), notification_id)]),
    };
    waiter.complete(vec![notification]);
}

#[async_trait]
impl MessageListener for NotificationHub {
    /// Wake every waiter parked under the message's exact key. Large
    /// fan-outs move to a background task and wake in paced batches so a
    /// hot namespace cannot stall the scan loop.
    async fn on_message(&self, message: &ReleaseMessage) {
        if split_key(&message.key).is_none() {
            warn!(key = %message.key, "dropping malformed message key");
            return;
        }
        let waiters: Vec<Arc<Waiter>> = match self.registry.get(&message.key) {
            Some(bucket) => bucket.clone(),
            None => return,
        };
        debug!(key = %message.key, count = waiters.len(), "waking long polls");

        if waiters.len() > self.batch {
            let batch = self.batch;
            let interval = self.batch_interval;
            let message = message.clone();
            tokio::spawn(async move {
                for (i, waiter) in waiters.iter().enumerate() {
                    if i > 0 && i % batch == 0 {
                        tokio::time::sleep(interval).await;
                    }
                    wake(waiter, &message.key, message.id);
                }
            });
        } else {
            for waiter in &waiters {
                wake(waiter, &message.key, message.id);
            }
        }
    }
}
