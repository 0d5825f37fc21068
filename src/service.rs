// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Service coordinator: wiring, lifecycle, and periodic work.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::bus::{MessagePublisher, MessageScanner};
use crate::cache::{MessageCache, NamespaceMetaCache};
use crate::config::ServiceConfig;
use crate::engine::ReleaseEngine;
use crate::gray::GrayRuleCache;
use crate::hub::NotificationHub;
use crate::resolver::ConfigResolver;
use crate::store::{MessageStore, MetaStore, ReleaseStore, RuleStore, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Created,
    Loading,
    Ready,
    ShuttingDown,
}

/// The assembled relay node.
///
/// Owns every component plus the background tasks that keep the caches
/// converged. Listener registration order matters: caches absorb a message
/// before the hub wakes anyone who will immediately read those caches.
pub struct ConfigRelay {
    config: ServiceConfig,
    pub publisher: Arc<MessagePublisher>,
    pub scanner: Arc<MessageScanner>,
    pub messages: Arc<MessageCache>,
    pub meta: Arc<NamespaceMetaCache>,
    pub gray: Arc<GrayRuleCache>,
    pub resolver: Arc<ConfigResolver>,
    pub hub: Arc<NotificationHub>,
    pub engine: Arc<ReleaseEngine>,
    state_tx: watch::Sender<ServiceState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConfigRelay {
    pub async fn new<S>(store: Arc<S>, config: ServiceConfig) -> StoreResult<Self>
    where
        S: MessageStore + ReleaseStore + RuleStore + MetaStore + 'static,
    {
        let message_store: Arc<dyn MessageStore> = store.clone();
        let release_store: Arc<dyn ReleaseStore> = store.clone();
        let rule_store: Arc<dyn RuleStore> = store.clone();
        let meta_store: Arc<dyn MetaStore> = store;

        let publisher = Arc::new(MessagePublisher::new(Arc::clone(&message_store)));
        let scanner = Arc::new(MessageScanner::new(Arc::clone(&message_store)).await?);
        let messages = Arc::new(MessageCache::new(Arc::clone(&message_store)));
        let meta = Arc::new(NamespaceMetaCache::new(Arc::clone(&meta_store)));
        let gray = Arc::new(GrayRuleCache::new(Arc::clone(&rule_store)));
        let resolver = Arc::new(ConfigResolver::new(
            Arc::clone(&release_store),
            Arc::clone(&messages),
            Arc::clone(&meta),
            Arc::clone(&gray),
        ));
        let hub = Arc::new(NotificationHub::new(
            Arc::clone(&messages),
            Arc::clone(&meta),
            config.long_poll_timeout(),
            config.notification_batch,
            Duration::from_millis(config.notification_batch_interval_ms),
        ));
        let engine = Arc::new(ReleaseEngine::new(
            release_store,
            rule_store,
            meta_store,
            Arc::clone(&publisher),
        ));

        let (state_tx, _) = watch::channel(ServiceState::Created);
        Ok(Self {
            config,
            publisher,
            scanner,
            messages,
            meta,
            gray,
            resolver,
            hub,
            engine,
            state_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Blocking cache loads, listener registration, then background tasks.
    pub async fn start(&self) -> StoreResult<()> {
        self.state_tx.send_replace(ServiceState::Loading);

        self.messages.load().await?;
        self.meta.load().await?;
        self.gray.load().await?;

        // Caches first, hub last: a woken client must never outrun the
        // caches it is about to read.
        self.scanner.add_listener(self.messages.clone());
        self.scanner.add_listener(self.resolver.clone());
        self.scanner.add_listener(self.gray.clone());
        self.scanner.add_listener(self.hub.clone());

        let mut tasks = self.tasks.lock();
        tasks.push(spawn_every(
            Duration::from_millis(self.config.message_scan_interval_ms),
            self.scanner.clone(),
            |scanner| async move { scanner.scan().await },
        ));
        tasks.push(spawn_every(
            Duration::from_millis(self.config.message_cache_scan_interval_ms),
            self.messages.clone(),
            |cache| async move { cache.tail_scan().await },
        ));
        tasks.push(spawn_every(
            Duration::from_millis(self.config.meta_scan_interval_ms),
            self.meta.clone(),
            |meta| async move { meta.tail_scan().await },
        ));
        tasks.push(spawn_every(
            Duration::from_millis(self.config.meta_rebuild_interval_ms),
            self.meta.clone(),
            |meta| async move { meta.rebuild().await },
        ));
        tasks.push(spawn_every(
            Duration::from_millis(self.config.rule_scan_interval_ms),
            self.gray.clone(),
            |gray| async move { gray.rescan().await },
        ));
        let idle = self.config.release_cache_idle();
        tasks.push(spawn_every(
            Duration::from_millis(self.config.release_cache_sweep_interval_ms),
            self.resolver.clone(),
            move |resolver| async move { resolver.sweep(idle) },
        ));
        drop(tasks);

        self.state_tx.send_replace(ServiceState::Ready);
        info!("config relay ready");
        Ok(())
    }

    pub fn state(&self) -> watch::Receiver<ServiceState> {
        self.state_tx.subscribe()
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn shutdown(&self) {
        self.state_tx.send_replace(ServiceState::ShuttingDown);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.publisher.shutdown();
        info!("config relay shut down");
    }
}

impl Drop for ConfigRelay {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

fn spawn_every<T, F, Fut>(period: Duration, target: Arc<T>, work: F) -> JoinHandle<()>
where
    T: Send + Sync + 'static,
    F: Fn(Arc<T>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // The immediate first tick would duplicate the startup loads.
        interval.tick().await;
        loop {
            interval.tick().await;
            // Each tick runs on a child task: a panic ends the tick, not
            // the schedule.
            if let Err(e) = tokio::spawn(work(Arc::clone(&target))).await {
                error!(error = %e, "periodic task tick panicked");
            }
        }
    })
}
