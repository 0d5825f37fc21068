// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Latest-message-per-key cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, error, info};

use crate::bus::MessageListener;
use crate::metrics;
use crate::model::{ReleaseMessage, NOTIFICATION_ID_PLACEHOLDER, SCAN_BATCH};
use crate::store::{MessageStore, StoreResult};

/// Mirrors the newest message id per watch key.
///
/// Answers "what is the latest notification id for this key" without
/// touching the store. Filled by a blocking full load at startup, then kept
/// current by its own tail scan until the first live bus event arrives;
/// from then on the bus covers it and the tail scan turns itself off.
pub struct MessageCache {
    store: Arc<dyn MessageStore>,
    latest: DashMap<String, ReleaseMessage>,
    /// Largest message id merged so far.
    cursor: AtomicI64,
    tail_scan_enabled: AtomicBool,
}

impl MessageCache {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            store,
            latest: DashMap::new(),
            cursor: AtomicI64::new(0),
            tail_scan_enabled: AtomicBool::new(true),
        }
    }

    /// Blocking full load; call before serving traffic.
    pub async fn load(&self) -> StoreResult<()> {
        self.load_after(0).await?;
        info!(entries = self.latest.len(), cursor = self.cursor(), "message cache loaded");
        Ok(())
    }

    /// Catch-up pass from the cursor; a no-op once the bus has taken over.
    pub async fn tail_scan(&self) {
        if !self.tail_scan_enabled.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.load_after(self.cursor()).await {
            error!(error = %e, "message cache tail scan failed");
        }
    }

    /// Newest message for a key, if any was ever published.
    pub fn latest(&self, key: &str) -> Option<ReleaseMessage> {
        self.latest.get(key).map(|r| r.value().clone())
    }

    /// Newest known id per key; absent keys report the placeholder.
    pub fn latest_ids_for<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> HashMap<String, i64> {
        keys.into_iter()
            .map(|key| {
                let id = self
                    .latest
                    .get(key)
                    .map(|r| r.id)
                    .unwrap_or(NOTIFICATION_ID_PLACEHOLDER);
                (key.to_string(), id)
            })
            .collect()
    }

    pub fn cursor(&self) -> i64 {
        self.cursor.load(Ordering::SeqCst)
    }

    async fn load_after(&self, from: i64) -> StoreResult<()> {
        let mut cursor = from;
        loop {
            let batch = self.store.messages_after(cursor, SCAN_BATCH).await?;
            if batch.is_empty() {
                break;
            }
            let short = batch.len() < SCAN_BATCH;
            cursor = batch.last().map(|m| m.id).unwrap_or(cursor);
            for message in batch {
                self.merge(message);
            }
            self.cursor.fetch_max(cursor, Ordering::SeqCst);
            if short {
                break;
            }
        }
        metrics::message_cache_size(self.latest.len());
        Ok(())
    }

    /// Highest id wins; stale and duplicate messages are no-ops.
    fn merge(&self, message: ReleaseMessage) {
        let mut entry = self.latest.entry(message.key.clone()).or_insert_with(|| message.clone());
        if entry.id < message.id {
            *entry = message;
        }
    }
}

#[async_trait]
impl MessageListener for MessageCache {
    async fn on_message(&self, message: &ReleaseMessage) {
        // First live event: the bus scanner now covers new rows, so the
        // redundant tail scan can stop.
        if self.tail_scan_enabled.swap(false, Ordering::SeqCst) {
            debug!("message cache switching from tail scan to bus events");
        }

        let gap = message.id - self.cursor();
        if gap == 1 {
            self.merge(message.clone());
            self.cursor.fetch_max(message.id, Ordering::SeqCst);
        } else if gap > 1 {
            // Rows were skipped (another writer committed between this
            // message's insert and our observation). Re-scan the range.
            debug!(gap, id = message.id, "message id gap detected, rescanning");
            if let Err(e) = self.load_after(self.cursor()).await {
                error!(error = %e, "gap rescan failed");
            }
        }
        // gap <= 0: already merged, duplicate delivery.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn full_load_keeps_highest_id_per_key() {
        let store = Arc::new(MemoryStore::new());
        store.insert_message("a+default+ns").await.unwrap();
        store.insert_message("b+default+ns").await.unwrap();
        let newest = store.insert_message("a+default+ns").await.unwrap();

        let cache = MessageCache::new(store);
        cache.load().await.unwrap();

        assert_eq!(cache.latest("a+default+ns").unwrap().id, newest.id);
        assert_eq!(cache.latest("b+default+ns").unwrap().id, 2);
        assert_eq!(cache.cursor(), 3);
    }

    #[tokio::test]
    async fn absent_keys_report_placeholder_id() {
        let store = Arc::new(MemoryStore::new());
        store.insert_message("a+default+ns").await.unwrap();
        let cache = MessageCache::new(store);
        cache.load().await.unwrap();

        let ids = cache.latest_ids_for(["a+default+ns", "missing+default+ns"]);
        assert_eq!(ids["a+default+ns"], 1);
        assert_eq!(ids["missing+default+ns"], NOTIFICATION_ID_PLACEHOLDER);
    }

    #[tokio::test]
    async fn live_event_disables_tail_scan_and_merges() {
        let store = Arc::new(MemoryStore::new());
        let cache = MessageCache::new(store.clone());
        cache.load().await.unwrap();

        let m = store.insert_message("a+default+ns").await.unwrap();
        cache.on_message(&m).await;

        assert!(!cache.tail_scan_enabled.load(Ordering::SeqCst));
        assert_eq!(cache.latest("a+default+ns").unwrap().id, m.id);
        assert_eq!(cache.cursor(), m.id);
    }

    #[tokio::test]
    async fn gap_triggers_rescan_that_fills_skipped_rows() {
        let store = Arc::new(MemoryStore::new());
        let cache = MessageCache::new(store.clone());
        cache.load().await.unwrap();

        store.insert_message("a+default+ns").await.unwrap();
        store.insert_message("b+default+ns").await.unwrap();
        let third = store.insert_message("c+default+ns").await.unwrap();

        // Deliver only the last message; the gap rescan must pick up the
        // two rows the bus never delivered.
        cache.on_message(&third).await;
        assert!(cache.latest("a+default+ns").is_some());
        assert!(cache.latest("b+default+ns").is_some());
        assert_eq!(cache.latest("c+default+ns").unwrap().id, third.id);
        assert_eq!(cache.cursor(), 3);
    }

    #[tokio::test]
    async fn stale_delivery_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let m1 = store.insert_message("a+default+ns").await.unwrap();
        store.insert_message("a+default+ns").await.unwrap();

        let cache = MessageCache::new(store);
        cache.load().await.unwrap();
        cache.on_message(&m1).await;
        assert_eq!(cache.latest("a+default+ns").unwrap().id, 2);
        assert_eq!(cache.cursor(), 2);
    }
}
