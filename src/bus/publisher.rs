// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Message emission and best-effort cleanup of superseded rows.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::metrics;
use crate::model::{assemble_key, ReleaseMessage, CLEAN_BATCH};
use crate::store::{MessageStore, StoreResult};

/// Depth of the cleanup queue. Overflow drops the cleanup request, never
/// the message itself; older rows are reaped by a later publish of the
/// same key.
const CLEANUP_QUEUE_DEPTH: usize = 100;

/// Appends messages to the bus and prunes superseded rows for the same key.
///
/// Only the newest row per key matters to consumers (caches keep the
/// highest id per key), so after each publish the older rows are garbage.
/// Cleanup runs on a dedicated worker so a slow store never blocks the
/// publishing path.
pub struct MessagePublisher {
    store: Arc<dyn MessageStore>,
    cleanup_tx: mpsc::Sender<ReleaseMessage>,
    worker: JoinHandle<()>,
}

impl MessagePublisher {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        let (cleanup_tx, cleanup_rx) = mpsc::channel(CLEANUP_QUEUE_DEPTH);
        let worker = tokio::spawn(cleanup_loop(Arc::clone(&store), cleanup_rx));
        Self { store, cleanup_tx, worker }
    }

    /// Append one message for `appId+cluster+namespace` and queue cleanup of
    /// older rows with the same key.
    pub async fn publish(&self, app_id: &str, cluster: &str, namespace: &str) -> StoreResult<ReleaseMessage> {
        let key = assemble_key(app_id, cluster, namespace);
        let message = self.store.insert_message(&key).await?;
        debug!(id = message.id, key = %message.key, "published release message");
        metrics::message_published();

        if self.cleanup_tx.try_send(message.clone()).is_err() {
            metrics::cleanup_dropped();
            warn!(id = message.id, "cleanup queue full, skipping cleanup for this message");
        }
        Ok(message)
    }

    pub fn shutdown(&self) {
        self.worker.abort();
    }
}

async fn cleanup_loop(store: Arc<dyn MessageStore>, mut rx: mpsc::Receiver<ReleaseMessage>) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = clean_older(store.as_ref(), &message).await {
            warn!(id = message.id, error = %e, "message cleanup failed");
        }
    }
}

async fn clean_older(store: &dyn MessageStore, message: &ReleaseMessage) -> StoreResult<()> {
    // The row may already have been reaped by another node's worker.
    if store.find_message(message.id).await?.is_none() {
        return Ok(());
    }
    loop {
        let removed = store
            .delete_older_messages(&message.key, message.id, CLEAN_BATCH)
            .await?;
        metrics::messages_cleaned(removed);
        if removed < CLEAN_BATCH {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn publish_inserts_row_with_assembled_key() {
        let store = Arc::new(MemoryStore::new());
        let publisher = MessagePublisher::new(store.clone());
        let m = publisher.publish("app1", "default", "application").await.unwrap();
        assert_eq!(m.key, "app1+default+application");
        assert_eq!(store.find_message(m.id).await.unwrap().unwrap(), m);
        publisher.shutdown();
    }

    #[tokio::test]
    async fn cleanup_reaps_older_rows_for_same_key_only() {
        let store = Arc::new(MemoryStore::new());
        let publisher = MessagePublisher::new(store.clone());
        publisher.publish("app1", "default", "application").await.unwrap();
        publisher.publish("app2", "default", "application").await.unwrap();
        let last = publisher.publish("app1", "default", "application").await.unwrap();

        // Wait for the worker to drain the queue.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let remaining = store.messages_after(0, 100).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().any(|m| m.id == last.id));
        assert!(remaining.iter().any(|m| m.key == "app2+default+application"));
        publisher.shutdown();
    }
}
