// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory store implementation.
//!
//! Backs the service in tests and single-node demo deployments. Ordered
//! tables are `BTreeMap`s keyed by autoincrement id so the ascending scans
//! the bus and caches rely on are cheap range queries. Soft-deleted rows
//! stay in the table and are filtered at the query layer, matching how a
//! SQL-backed implementation would behave.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::model::{
    AppNamespace, BranchStatus, Cluster, GrayReleaseRule, Namespace, NamespaceLock, Release,
    ReleaseMessage,
};
use super::traits::{MessageStore, MetaStore, ReleaseStore, RuleStore, StoreError, StoreResult};

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone)]
struct RuleRow {
    rule: GrayReleaseRule,
    deleted: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    next_message_id: AtomicI64,
    messages: RwLock<BTreeMap<i64, ReleaseMessage>>,

    next_release_id: AtomicI64,
    releases: RwLock<BTreeMap<i64, Release>>,

    next_rule_id: AtomicI64,
    rules: RwLock<BTreeMap<i64, RuleRow>>,

    next_app_namespace_id: AtomicI64,
    app_namespaces: RwLock<BTreeMap<i64, AppNamespace>>,

    next_cluster_id: AtomicI64,
    clusters: RwLock<BTreeMap<i64, Cluster>>,

    next_namespace_id: AtomicI64,
    namespaces: RwLock<BTreeMap<i64, Namespace>>,

    items: DashMap<i64, HashMap<String, String>>,
    locks: DashMap<i64, NamespaceLock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a complete app: default cluster, a namespace under it, and its
    /// app-namespace registration. Convenience for tests and demos.
    pub async fn seed_namespace(
        &self,
        app_id: &str,
        cluster: &str,
        namespace: &str,
        is_public: bool,
    ) -> StoreResult<Namespace> {
        if self.find_cluster(app_id, cluster).await?.is_none() {
            self.insert_cluster(app_id, cluster, 0).await?;
        }
        self.insert_app_namespace(app_id, namespace, is_public).await?;
        self.insert_namespace(app_id, cluster, namespace).await
    }

    fn next(counter: &AtomicI64) -> i64 {
        counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert_message(&self, key: &str) -> StoreResult<ReleaseMessage> {
        let id = Self::next(&self.next_message_id);
        let message = ReleaseMessage { id, key: key.to_string() };
        self.messages.write().insert(id, message.clone());
        Ok(message)
    }

    async fn find_message(&self, id: i64) -> StoreResult<Option<ReleaseMessage>> {
        Ok(self.messages.read().get(&id).cloned())
    }

    async fn messages_after(&self, cursor: i64, limit: usize) -> StoreResult<Vec<ReleaseMessage>> {
        Ok(self
            .messages
            .read()
            .range(cursor + 1..)
            .take(limit)
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn max_message_id(&self) -> StoreResult<i64> {
        Ok(self.messages.read().keys().next_back().copied().unwrap_or(0))
    }

    async fn delete_older_messages(&self, key: &str, before_id: i64, limit: usize) -> StoreResult<usize> {
        let mut messages = self.messages.write();
        let victims: Vec<i64> = messages
            .range(..before_id)
            .filter(|(_, m)| m.key == key)
            .take(limit)
            .map(|(id, _)| *id)
            .collect();
        for id in &victims {
            messages.remove(id);
        }
        Ok(victims.len())
    }
}

#[async_trait]
impl ReleaseStore for MemoryStore {
    async fn insert_release(
        &self,
        app_id: &str,
        cluster: &str,
        namespace: &str,
        release_key: &str,
        configurations: &str,
    ) -> StoreResult<Release> {
        let id = Self::next(&self.next_release_id);
        let release = Release {
            id,
            app_id: app_id.to_string(),
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
            release_key: release_key.to_string(),
            configurations: configurations.to_string(),
            is_abandoned: false,
            created_at: now_millis(),
        };
        self.releases.write().insert(id, release.clone());
        Ok(release)
    }

    async fn find_release(&self, id: i64) -> StoreResult<Option<Release>> {
        Ok(self.releases.read().get(&id).cloned())
    }

    async fn find_active_release(&self, id: i64) -> StoreResult<Option<Release>> {
        Ok(self
            .releases
            .read()
            .get(&id)
            .filter(|r| !r.is_abandoned)
            .cloned())
    }

    async fn latest_active_release(
        &self,
        app_id: &str,
        cluster: &str,
        namespace: &str,
    ) -> StoreResult<Option<Release>> {
        Ok(self
            .latest_active_releases(app_id, cluster, namespace, 1)
            .await?
            .into_iter()
            .next())
    }

    async fn latest_active_releases(
        &self,
        app_id: &str,
        cluster: &str,
        namespace: &str,
        limit: usize,
    ) -> StoreResult<Vec<Release>> {
        Ok(self
            .releases
            .read()
            .values()
            .rev()
            .filter(|r| {
                !r.is_abandoned
                    && r.app_id == app_id
                    && r.cluster == cluster
                    && r.namespace == namespace
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn abandon_release(&self, id: i64) -> StoreResult<()> {
        match self.releases.write().get_mut(&id) {
            Some(release) => {
                release.is_abandoned = true;
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn insert_rule(
        &self,
        app_id: &str,
        cluster: &str,
        namespace: &str,
        branch_name: &str,
        rules: &str,
        release_id: i64,
        branch_status: BranchStatus,
    ) -> StoreResult<GrayReleaseRule> {
        let id = Self::next(&self.next_rule_id);
        let rule = GrayReleaseRule {
            id,
            app_id: app_id.to_string(),
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
            branch_name: branch_name.to_string(),
            rules: rules.to_string(),
            release_id,
            branch_status,
        };
        self.rules.write().insert(id, RuleRow { rule: rule.clone(), deleted: false });
        Ok(rule)
    }

    async fn delete_rule(&self, id: i64) -> StoreResult<()> {
        match self.rules.write().get_mut(&id) {
            Some(row) => {
                row.deleted = true;
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn latest_rule(
        &self,
        app_id: &str,
        cluster: &str,
        namespace: &str,
        branch_name: &str,
    ) -> StoreResult<Option<GrayReleaseRule>> {
        Ok(self
            .rules
            .read()
            .values()
            .rev()
            .filter(|row| !row.deleted)
            .map(|row| &row.rule)
            .find(|r| {
                r.app_id == app_id
                    && r.cluster == cluster
                    && r.namespace == namespace
                    && r.branch_name == branch_name
            })
            .cloned())
    }

    async fn rules_for(
        &self,
        app_id: &str,
        cluster: &str,
        namespace: &str,
    ) -> StoreResult<Vec<GrayReleaseRule>> {
        Ok(self
            .rules
            .read()
            .values()
            .filter(|row| !row.deleted)
            .map(|row| &row.rule)
            .filter(|r| r.app_id == app_id && r.cluster == cluster && r.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn rules_after(&self, cursor: i64, limit: usize) -> StoreResult<Vec<GrayReleaseRule>> {
        Ok(self
            .rules
            .read()
            .range(cursor + 1..)
            .filter(|(_, row)| !row.deleted)
            .take(limit)
            .map(|(_, row)| row.rule.clone())
            .collect())
    }
}

#[async_trait]
impl MetaStore for MemoryStore {
    async fn insert_app_namespace(&self, app_id: &str, name: &str, is_public: bool) -> StoreResult<AppNamespace> {
        let id = Self::next(&self.next_app_namespace_id);
        let ns = AppNamespace {
            id,
            app_id: app_id.to_string(),
            name: name.to_string(),
            is_public,
            modified_at: now_millis(),
        };
        self.app_namespaces.write().insert(id, ns.clone());
        Ok(ns)
    }

    async fn update_app_namespace(&self, mut ns: AppNamespace) -> StoreResult<()> {
        let mut table = self.app_namespaces.write();
        let Some(old) = table.get(&ns.id) else {
            return Err(StoreError::NotFound);
        };
        // Strictly advance the stamp: a rewrite landing in the same
        // millisecond as the previous write must still look modified to
        // timestamp-diffing readers.
        ns.modified_at = now_millis().max(old.modified_at + 1);
        table.insert(ns.id, ns);
        Ok(())
    }

    async fn delete_app_namespace(&self, id: i64) -> StoreResult<()> {
        self.app_namespaces.write().remove(&id).map(|_| ()).ok_or(StoreError::NotFound)
    }

    async fn app_namespaces_after(&self, cursor: i64, limit: usize) -> StoreResult<Vec<AppNamespace>> {
        Ok(self
            .app_namespaces
            .read()
            .range(cursor + 1..)
            .take(limit)
            .map(|(_, ns)| ns.clone())
            .collect())
    }

    async fn app_namespaces_by_ids(&self, ids: &[i64]) -> StoreResult<Vec<AppNamespace>> {
        let table = self.app_namespaces.read();
        Ok(ids.iter().filter_map(|id| table.get(id).cloned()).collect())
    }

    async fn insert_cluster(&self, app_id: &str, name: &str, parent_cluster_id: i64) -> StoreResult<Cluster> {
        let id = Self::next(&self.next_cluster_id);
        let cluster = Cluster {
            id,
            app_id: app_id.to_string(),
            name: name.to_string(),
            parent_cluster_id,
        };
        self.clusters.write().insert(id, cluster.clone());
        Ok(cluster)
    }

    async fn find_cluster(&self, app_id: &str, name: &str) -> StoreResult<Option<Cluster>> {
        Ok(self
            .clusters
            .read()
            .values()
            .find(|c| c.app_id == app_id && c.name == name)
            .cloned())
    }

    async fn find_cluster_by_id(&self, id: i64) -> StoreResult<Option<Cluster>> {
        Ok(self.clusters.read().get(&id).cloned())
    }

    async fn child_clusters_of(&self, app_id: &str, parent_cluster_id: i64) -> StoreResult<Vec<Cluster>> {
        Ok(self
            .clusters
            .read()
            .values()
            .filter(|c| c.app_id == app_id && c.parent_cluster_id == parent_cluster_id)
            .cloned()
            .collect())
    }

    async fn delete_cluster(&self, id: i64) -> StoreResult<()> {
        self.clusters.write().remove(&id).map(|_| ()).ok_or(StoreError::NotFound)
    }

    async fn insert_namespace(&self, app_id: &str, cluster: &str, name: &str) -> StoreResult<Namespace> {
        let id = Self::next(&self.next_namespace_id);
        let ns = Namespace {
            id,
            app_id: app_id.to_string(),
            cluster: cluster.to_string(),
            name: name.to_string(),
        };
        self.namespaces.write().insert(id, ns.clone());
        Ok(ns)
    }

    async fn find_namespace(&self, app_id: &str, cluster: &str, name: &str) -> StoreResult<Option<Namespace>> {
        Ok(self
            .namespaces
            .read()
            .values()
            .find(|n| n.app_id == app_id && n.cluster == cluster && n.name == name)
            .cloned())
    }

    async fn delete_namespace(&self, id: i64) -> StoreResult<()> {
        self.items.remove(&id);
        self.locks.remove(&id);
        self.namespaces.write().remove(&id).map(|_| ()).ok_or(StoreError::NotFound)
    }

    async fn namespace_items(&self, namespace_id: i64) -> StoreResult<HashMap<String, String>> {
        Ok(self.items.get(&namespace_id).map(|r| r.value().clone()).unwrap_or_default())
    }

    async fn set_namespace_items(&self, namespace_id: i64, items: HashMap<String, String>) -> StoreResult<()> {
        self.items.insert(namespace_id, items);
        Ok(())
    }

    async fn acquire_lock(&self, namespace_id: i64, owner: &str) -> StoreResult<()> {
        match self.locks.entry(namespace_id) {
            dashmap::Entry::Occupied(e) if e.get().owner != owner => Err(StoreError::Backend(
                format!("namespace {namespace_id} already locked by {}", e.get().owner),
            )),
            dashmap::Entry::Occupied(_) => Ok(()),
            dashmap::Entry::Vacant(e) => {
                e.insert(NamespaceLock { namespace_id, owner: owner.to_string() });
                Ok(())
            }
        }
    }

    async fn find_lock(&self, namespace_id: i64) -> StoreResult<Option<NamespaceLock>> {
        Ok(self.locks.get(&namespace_id).map(|r| r.value().clone()))
    }

    async fn release_lock(&self, namespace_id: i64) -> StoreResult<()> {
        self.locks.remove(&namespace_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn message_ids_are_monotonic_and_scans_are_ordered() {
        let store = MemoryStore::new();
        for i in 0..5 {
            let m = store.insert_message(&format!("app+default+ns{i}")).await.unwrap();
            assert_eq!(m.id, i + 1);
        }
        let batch = store.messages_after(2, 10).await.unwrap();
        let ids: Vec<i64> = batch.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert_eq!(store.max_message_id().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn delete_older_messages_keeps_newest_and_other_keys() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            store.insert_message("app+default+ns").await.unwrap();
        }
        let other = store.insert_message("app+default+other").await.unwrap();
        let removed = store.delete_older_messages("app+default+ns", 3, 100).await.unwrap();
        assert_eq!(removed, 2);
        let remaining = store.messages_after(0, 10).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().any(|m| m.id == other.id));
    }

    #[tokio::test]
    async fn app_namespace_update_always_advances_the_stamp() {
        let store = MemoryStore::new();
        let ns = store.insert_app_namespace("infra", "shared.db", true).await.unwrap();

        // Same-millisecond rewrite: the stamp must still move forward.
        let mut flipped = ns.clone();
        flipped.is_public = false;
        store.update_app_namespace(flipped).await.unwrap();

        let rows = store.app_namespaces_by_ids(&[ns.id]).await.unwrap();
        assert!(!rows[0].is_public);
        assert!(rows[0].modified_at > ns.modified_at);
    }

    #[tokio::test]
    async fn abandoned_releases_are_filtered_from_active_queries() {
        let store = MemoryStore::new();
        let r1 = store.insert_release("app", "default", "ns", "k1", "{}").await.unwrap();
        let r2 = store.insert_release("app", "default", "ns", "k2", "{}").await.unwrap();
        assert_eq!(
            store.latest_active_release("app", "default", "ns").await.unwrap().unwrap().id,
            r2.id
        );
        store.abandon_release(r2.id).await.unwrap();
        assert_eq!(
            store.latest_active_release("app", "default", "ns").await.unwrap().unwrap().id,
            r1.id
        );
        assert!(store.find_active_release(r2.id).await.unwrap().is_none());
        assert!(store.find_release(r2.id).await.unwrap().unwrap().is_abandoned);
    }

    #[tokio::test]
    async fn soft_deleted_rules_are_invisible() {
        let store = MemoryStore::new();
        let r = store
            .insert_rule("app", "default", "ns", "branch-1", "[]", 0, BranchStatus::Active)
            .await
            .unwrap();
        assert!(store.latest_rule("app", "default", "ns", "branch-1").await.unwrap().is_some());
        store.delete_rule(r.id).await.unwrap();
        assert!(store.latest_rule("app", "default", "ns", "branch-1").await.unwrap().is_none());
        assert!(store.rules_after(0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lock_is_optimistic_not_blocking() {
        let store = MemoryStore::new();
        store.acquire_lock(1, "alice").await.unwrap();
        store.acquire_lock(1, "alice").await.unwrap();
        assert!(store.acquire_lock(1, "bob").await.is_err());
        assert_eq!(store.find_lock(1).await.unwrap().unwrap().owner, "alice");
        store.release_lock(1).await.unwrap();
        store.acquire_lock(1, "bob").await.unwrap();
    }
}
