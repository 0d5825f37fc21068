// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Gray-release rule cache.
//!
//! Holds every live gray rule under two indices:
//!
//! - forward: `configAppId+configCluster+namespace` -> rule entries, one per
//!   branch, for release pinning during resolution;
//! - reverse: `clientAppId+namespace+clientIp` -> rule ids, a cheap
//!   existence probe for "is this client grayed anywhere".
//!
//! Rule rows are append-only (an update inserts a new row and soft-deletes
//! the old one), so the row id orders versions and the merge never needs to
//! compare contents. A global load version stamps entries on each full
//! rescan; inactive entries that miss a stamp for more than one full cycle
//! are evicted. The one-cycle grace keeps a just-merged branch matching
//! while its final release message is still in flight.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use crate::bus::MessageListener;
use crate::metrics;
use crate::model::{
    assemble_key, split_key, BranchStatus, GrayReleaseRule, ReleaseMessage, RuleItem, ALL_IP,
    SCAN_BATCH,
};
use crate::store::{RuleStore, StoreResult};

fn reverse_key(client_app_id: &str, namespace: &str, client_ip: &str) -> String {
    format!("{client_app_id}+{namespace}+{client_ip}")
}

/// One cached rule row, immutable except for its load-version stamp.
struct RuleEntry {
    rule_id: i64,
    branch_name: String,
    namespace: String,
    release_id: i64,
    status: BranchStatus,
    items: BTreeSet<RuleItem>,
    load_version: AtomicI64,
}

impl RuleEntry {
    fn matches(&self, client_app_id: &str, client_ip: &str) -> bool {
        self.status == BranchStatus::Active
            && self.items.iter().any(|item| item.matches(client_app_id, client_ip))
    }
}

pub struct GrayRuleCache {
    store: Arc<dyn RuleStore>,
    forward: DashMap<String, Vec<Arc<RuleEntry>>>,
    reverse: DashMap<String, HashSet<i64>>,
    load_version: AtomicI64,
}

impl GrayRuleCache {
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        Self {
            store,
            forward: DashMap::new(),
            reverse: DashMap::new(),
            load_version: AtomicI64::new(0),
        }
    }

    /// Blocking full load; call before serving traffic.
    pub async fn load(&self) -> StoreResult<()> {
        self.try_rescan().await?;
        info!(buckets = self.forward.len(), "gray rule cache loaded");
        Ok(())
    }

    /// Periodic full rescan. Bumps the load version first so entries the
    /// scan does not touch age toward eviction.
    pub async fn rescan(&self) {
        if let Err(e) = self.try_rescan().await {
            error!(error = %e, "gray rule rescan failed");
        }
    }

    /// Release id pinned for this client under (configAppId, cluster,
    /// namespace), if any active rule matches. First match wins.
    pub fn find_release_id(
        &self,
        client_app_id: &str,
        client_ip: &str,
        config_app_id: &str,
        cluster: &str,
        namespace: &str,
    ) -> Option<i64> {
        let key = assemble_key(config_app_id, cluster, namespace);
        let bucket = self.forward.get(&key)?;
        bucket
            .iter()
            .find(|entry| entry.matches(client_app_id, client_ip))
            .map(|entry| entry.release_id)
    }

    /// Whether any rule (active or in its eviction grace) names this client
    /// for this namespace, directly or via the ip wildcard.
    pub fn has_rules_for(&self, client_app_id: &str, client_ip: &str, namespace: &str) -> bool {
        self.reverse.contains_key(&reverse_key(client_app_id, namespace, client_ip))
            || self.reverse.contains_key(&reverse_key(client_app_id, namespace, ALL_IP))
    }

    async fn try_rescan(&self) -> StoreResult<()> {
        let version = self.load_version.fetch_add(1, Ordering::SeqCst) + 1;
        let mut cursor = 0;
        loop {
            let batch = self.store.rules_after(cursor, SCAN_BATCH).await?;
            if batch.is_empty() {
                break;
            }
            let short = batch.len() < SCAN_BATCH;
            cursor = batch.last().map(|r| r.id).unwrap_or(cursor);
            for rule in &batch {
                self.merge(rule, version);
            }
            if short {
                break;
            }
        }
        metrics::gray_rule_buckets(self.forward.len());
        Ok(())
    }

    /// Fold one rule row into the cache.
    ///
    /// The id comparison replaces synchronization: a row only ever
    /// supersedes rows with smaller ids, so replaying rows in any order and
    /// any number of times converges to the same state.
    fn merge(&self, rule: &GrayReleaseRule, version: i64) {
        // A branch that never released pins nothing; skip until it does.
        if rule.release_id == 0 {
            return;
        }
        let key = assemble_key(&rule.app_id, &rule.cluster, &rule.namespace);
        let mut bucket = self.forward.entry(key.clone()).or_default();

        let old_pos = bucket.iter().position(|e| e.branch_name == rule.branch_name);
        match old_pos {
            None => {
                // A terminal row for a branch we never cached carries no
                // matchable state; only active rows get installed fresh.
                if rule.branch_status == BranchStatus::Active {
                    let entry = self.build_entry(rule, version);
                    self.add_reverse(&entry);
                    bucket.push(entry);
                    debug!(rule_id = rule.id, branch = %rule.branch_name, "gray rule installed");
                }
            }
            Some(pos) if rule.id > bucket[pos].rule_id => {
                let entry = self.build_entry(rule, version);
                self.add_reverse(&entry);
                let old = std::mem::replace(&mut bucket[pos], entry);
                self.remove_reverse(&old);
            }
            Some(pos) => {
                let old = &bucket[pos];
                if old.status == BranchStatus::Active {
                    old.load_version.store(version, Ordering::SeqCst);
                } else if version - old.load_version.load(Ordering::SeqCst) > 1 {
                    // Inactive and unrefreshed for a full cycle: gone.
                    let old = bucket.remove(pos);
                    self.remove_reverse(&old);
                    debug!(rule_id = old.rule_id, branch = %old.branch_name, "stale gray rule evicted");
                }
            }
        }
        if bucket.is_empty() {
            drop(bucket);
            self.forward.remove_if(&key, |_, v| v.is_empty());
        }
    }

    fn build_entry(&self, rule: &GrayReleaseRule, version: i64) -> Arc<RuleEntry> {
        Arc::new(RuleEntry {
            rule_id: rule.id,
            branch_name: rule.branch_name.clone(),
            namespace: rule.namespace.clone(),
            release_id: rule.release_id,
            status: rule.branch_status,
            items: rule.rule_items(),
            load_version: AtomicI64::new(version),
        })
    }

    /// Only active rules are reachable by clients, so only they get reverse
    /// entries.
    fn add_reverse(&self, entry: &RuleEntry) {
        if entry.status != BranchStatus::Active {
            return;
        }
        for item in &entry.items {
            for ip in &item.client_ip_list {
                self.reverse
                    .entry(reverse_key(&item.client_app_id, &entry.namespace, ip))
                    .or_default()
                    .insert(entry.rule_id);
            }
        }
    }

    fn remove_reverse(&self, entry: &RuleEntry) {
        for item in &entry.items {
            for ip in &item.client_ip_list {
                let key = reverse_key(&item.client_app_id, &entry.namespace, ip);
                if let Some(mut ids) = self.reverse.get_mut(&key) {
                    ids.remove(&entry.rule_id);
                    if ids.is_empty() {
                        drop(ids);
                        self.reverse.remove_if(&key, |_, v| v.is_empty());
                    }
                }
            }
        }
    }
}

#[async_trait]
impl MessageListener for GrayRuleCache {
    /// Bus events name the changed namespace; re-fetch its whole rule
    /// bucket so installs, updates and terminal rows are all absorbed.
    async fn on_message(&self, message: &ReleaseMessage) {
        let Some((app_id, cluster, namespace)) = split_key(&message.key) else {
            warn!(key = %message.key, "dropping malformed message key");
            return;
        };
        match self.store.rules_for(app_id, cluster, namespace).await {
            Ok(rules) => {
                let version = self.load_version.load(Ordering::SeqCst);
                for rule in &rules {
                    self.merge(rule, version);
                }
            }
            Err(e) => error!(key = %message.key, error = %e, "gray rule refresh failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::serialize_rule_items;
    use crate::store::{MemoryStore, MessageStore};

    fn items(app: &str, ips: &[&str]) -> String {
        serialize_rule_items(&[RuleItem::new(app, ips.iter().copied())].into())
    }

    async fn insert(
        store: &MemoryStore,
        branch: &str,
        rules: &str,
        release_id: i64,
        status: BranchStatus,
    ) -> GrayReleaseRule {
        store
            .insert_rule("owner", "default", "application", branch, rules, release_id, status)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn active_rule_pins_matching_clients() {
        let store = Arc::new(MemoryStore::new());
        insert(&store, "b1", &items("client", &["10.0.0.1"]), 42, BranchStatus::Active).await;

        let cache = GrayRuleCache::new(store);
        cache.load().await.unwrap();

        assert_eq!(
            cache.find_release_id("client", "10.0.0.1", "owner", "default", "application"),
            Some(42)
        );
        assert_eq!(
            cache.find_release_id("client", "10.0.0.2", "owner", "default", "application"),
            None
        );
        assert_eq!(
            cache.find_release_id("other", "10.0.0.1", "owner", "default", "application"),
            None
        );
        assert!(cache.has_rules_for("client", "10.0.0.1", "application"));
        assert!(!cache.has_rules_for("client", "10.0.0.2", "application"));
    }

    #[tokio::test]
    async fn wildcard_ip_matches_everyone_in_the_app() {
        let store = Arc::new(MemoryStore::new());
        insert(&store, "b1", &items("client", &[ALL_IP]), 7, BranchStatus::Active).await;

        let cache = GrayRuleCache::new(store);
        cache.load().await.unwrap();

        assert_eq!(
            cache.find_release_id("client", "1.2.3.4", "owner", "default", "application"),
            Some(7)
        );
        assert!(cache.has_rules_for("client", "5.6.7.8", "application"));
    }

    #[tokio::test]
    async fn unreleased_branch_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        insert(&store, "b1", &items("client", &["10.0.0.1"]), 0, BranchStatus::Active).await;

        let cache = GrayRuleCache::new(store);
        cache.load().await.unwrap();
        assert_eq!(
            cache.find_release_id("client", "10.0.0.1", "owner", "default", "application"),
            None
        );
    }

    #[tokio::test]
    async fn newer_row_supersedes_and_reindexes() {
        let store = Arc::new(MemoryStore::new());
        let old = insert(&store, "b1", &items("client", &["10.0.0.1"]), 5, BranchStatus::Active).await;

        let cache = GrayRuleCache::new(store.clone());
        cache.load().await.unwrap();

        store.delete_rule(old.id).await.unwrap();
        insert(&store, "b1", &items("client", &["10.0.0.9"]), 6, BranchStatus::Active).await;
        let message = store.insert_message("owner+default+application").await.unwrap();
        cache.on_message(&message).await;

        assert_eq!(
            cache.find_release_id("client", "10.0.0.9", "owner", "default", "application"),
            Some(6)
        );
        assert_eq!(
            cache.find_release_id("client", "10.0.0.1", "owner", "default", "application"),
            None
        );
        assert!(!cache.has_rules_for("client", "10.0.0.1", "application"));
        assert!(cache.has_rules_for("client", "10.0.0.9", "application"));
    }

    #[tokio::test]
    async fn merged_branch_survives_one_cycle_then_evicts() {
        let store = Arc::new(MemoryStore::new());
        let active = insert(&store, "b1", &items("client", &["10.0.0.1"]), 5, BranchStatus::Active).await;

        let cache = GrayRuleCache::new(store.clone());
        cache.load().await.unwrap();

        store.delete_rule(active.id).await.unwrap();
        insert(&store, "b1", &items("client", &["10.0.0.1"]), 5, BranchStatus::Merged).await;
        let message = store.insert_message("owner+default+application").await.unwrap();
        cache.on_message(&message).await;

        // Terminal row installed; no longer matches for pinning but the
        // reverse entry holds through the grace window.
        assert_eq!(
            cache.find_release_id("client", "10.0.0.1", "owner", "default", "application"),
            None
        );

        cache.rescan().await;
        assert!(cache.forward.get("owner+default+application").is_some());
        cache.rescan().await;
        cache.rescan().await;
        assert!(cache.forward.get("owner+default+application").is_none());
    }

    #[tokio::test]
    async fn terminal_row_for_unknown_branch_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        insert(&store, "b1", &items("client", &["10.0.0.1"]), 5, BranchStatus::Deleted).await;

        let cache = GrayRuleCache::new(store);
        cache.load().await.unwrap();
        assert!(cache.forward.is_empty());
        assert!(cache.reverse.is_empty());
    }

    #[tokio::test]
    async fn replay_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        insert(&store, "b1", &items("client", &["10.0.0.1"]), 5, BranchStatus::Active).await;

        let cache = GrayRuleCache::new(store.clone());
        cache.load().await.unwrap();
        let message = store.insert_message("owner+default+application").await.unwrap();
        cache.on_message(&message).await;
        cache.on_message(&message).await;

        let bucket = cache.forward.get("owner+default+application").unwrap();
        assert_eq!(bucket.len(), 1);
        assert_eq!(cache.reverse.get("client+application+10.0.0.1").unwrap().len(), 1);
    }
}
