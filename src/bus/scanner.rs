// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cursor-driven tail scan of the message table.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error};

use crate::bus::MessageListener;
use crate::metrics;
use crate::model::SCAN_BATCH;
use crate::store::{MessageStore, StoreResult};

/// Tails the message table and fans new rows out to listeners in id order.
///
/// The cursor starts at the current max id, so only rows appended after
/// startup are delivered here; caches do their own full load first. One
/// scan round drains everything currently ahead of the cursor (batches of
/// [`SCAN_BATCH`], a short batch ends the round).
pub struct MessageScanner {
    store: Arc<dyn MessageStore>,
    listeners: RwLock<Vec<Arc<dyn MessageListener>>>,
    cursor: AtomicI64,
}

impl MessageScanner {
    /// Positions the cursor at the table's current max id.
    pub async fn new(store: Arc<dyn MessageStore>) -> StoreResult<Self> {
        let cursor = store.max_message_id().await?;
        debug!(cursor, "message scanner initialized");
        Ok(Self {
            store,
            listeners: RwLock::new(Vec::new()),
            cursor: AtomicI64::new(cursor),
        })
    }

    /// Registration is append-only; delivery order follows registration
    /// order, so register caches before waiter-facing listeners.
    pub fn add_listener(&self, listener: Arc<dyn MessageListener>) {
        self.listeners.write().push(listener);
    }

    pub fn cursor(&self) -> i64 {
        self.cursor.load(Ordering::SeqCst)
    }

    /// One scan round. A store error aborts the round with the cursor
    /// unadvanced; the next tick retries from the same position.
    pub async fn scan(&self) {
        loop {
            let cursor = self.cursor.load(Ordering::SeqCst);
            let batch = match self.store.messages_after(cursor, SCAN_BATCH).await {
                Ok(batch) => batch,
                Err(e) => {
                    error!(cursor, error = %e, "message scan failed");
                    return;
                }
            };
            if batch.is_empty() {
                return;
            }
            metrics::messages_scanned(batch.len());
            let short = batch.len() < SCAN_BATCH;
            let last_id = batch.last().map(|m| m.id).unwrap_or(cursor);

            let listeners: Vec<_> = self.listeners.read().clone();
            for message in &batch {
                for listener in &listeners {
                    // Deliver on a child task so one panicking listener
                    // cannot take down the others or the scan loop.
                    let listener = Arc::clone(listener);
                    let message = message.clone();
                    let id = message.id;
                    let delivery =
                        tokio::spawn(async move { listener.on_message(&message).await });
                    if let Err(e) = delivery.await {
                        error!(id, error = %e, "message listener panicked");
                    }
                }
            }
            self.cursor.store(last_id, Ordering::SeqCst);

            if short {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReleaseMessage;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct Recorder {
        seen: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl MessageListener for Recorder {
        async fn on_message(&self, message: &ReleaseMessage) {
            self.seen.lock().push(message.id);
        }
    }

    #[tokio::test]
    async fn scanner_skips_preexisting_rows() {
        let store = Arc::new(MemoryStore::new());
        store.insert_message("app+default+ns").await.unwrap();
        store.insert_message("app+default+ns").await.unwrap();

        let scanner = MessageScanner::new(store.clone()).await.unwrap();
        let recorder = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        scanner.add_listener(recorder.clone());

        scanner.scan().await;
        assert!(recorder.seen.lock().is_empty());

        store.insert_message("app+default+ns").await.unwrap();
        scanner.scan().await;
        assert_eq!(*recorder.seen.lock(), vec![3]);
    }

    #[tokio::test]
    async fn scan_delivers_in_id_order_and_advances_cursor() {
        let store = Arc::new(MemoryStore::new());
        let scanner = MessageScanner::new(store.clone()).await.unwrap();
        let recorder = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        scanner.add_listener(recorder.clone());

        for _ in 0..4 {
            store.insert_message("app+default+ns").await.unwrap();
        }
        scanner.scan().await;
        assert_eq!(*recorder.seen.lock(), vec![1, 2, 3, 4]);
        assert_eq!(scanner.cursor(), 4);

        // Re-scan with nothing new delivers nothing.
        scanner.scan().await;
        assert_eq!(recorder.seen.lock().len(), 4);
    }

    struct Grenade;

    #[async_trait]
    impl MessageListener for Grenade {
        async fn on_message(&self, _message: &ReleaseMessage) {
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn panicking_listener_does_not_starve_the_others() {
        let store = Arc::new(MemoryStore::new());
        let scanner = MessageScanner::new(store.clone()).await.unwrap();
        let recorder = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        scanner.add_listener(Arc::new(Grenade));
        scanner.add_listener(recorder.clone());

        store.insert_message("app+default+ns").await.unwrap();
        store.insert_message("app+default+ns").await.unwrap();
        scanner.scan().await;

        assert_eq!(*recorder.seen.lock(), vec![1, 2]);
        assert_eq!(scanner.cursor(), 2);
    }
}
