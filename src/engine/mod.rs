// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Release lifecycle state machine.
//!
//! All mutating operations live here: publishing a namespace, creating and
//! releasing gray branches, updating gray rules, merging a branch back to
//! master, rolling back, and deleting a branch. Every public operation
//! validates before it writes and emits exactly one bus message at the end,
//! keyed by the master cluster, so downstream caches converge off a single
//! event regardless of how many rows the operation touched.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, instrument};

use crate::bus::MessagePublisher;
use crate::error::{Error, Result};
use crate::metrics;
use crate::model::{
    merge_configuration, serialize_rule_items, BranchStatus, Cluster, GrayReleaseRule, Namespace,
    Release, RuleItem,
};
use crate::store::{MetaStore, ReleaseStore, RuleStore};

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Timestamped unique key, also used for generated branch cluster names.
fn unique_key() -> String {
    let ts = chrono::Utc::now().format("%Y%m%d%H%M%S");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{ts}-{}", &suffix[..12])
}

#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub app_id: String,
    pub cluster: String,
    pub namespace: String,
    pub operator: String,
    /// Skips the four-eyes lock check.
    pub is_emergency: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOperation {
    Normal,
    GrayRelease,
    ApplyGrayRules,
    AutoGrayRelease,
    MergeToMaster,
    Rollback,
    AbandonGrayRelease,
}

/// Audit record, one per release-affecting step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseHistory {
    pub app_id: String,
    pub cluster: String,
    pub namespace: String,
    pub branch_name: String,
    pub release_id: i64,
    /// 0 when the operation had no predecessor release.
    pub previous_release_id: i64,
    pub operation: ReleaseOperation,
    pub operator: String,
    pub created_at: i64,
}

pub struct ReleaseEngine {
    releases: Arc<dyn ReleaseStore>,
    rules: Arc<dyn RuleStore>,
    meta: Arc<dyn MetaStore>,
    publisher: Arc<MessagePublisher>,
    history: RwLock<Vec<ReleaseHistory>>,
}

impl ReleaseEngine {
    pub fn new(
        releases: Arc<dyn ReleaseStore>,
        rules: Arc<dyn RuleStore>,
        meta: Arc<dyn MetaStore>,
        publisher: Arc<MessagePublisher>,
    ) -> Self {
        Self {
            releases,
            rules,
            meta,
            publisher,
            history: RwLock::new(Vec::new()),
        }
    }

    /// Publish the current items of a namespace as a new release.
    ///
    /// Publishing a branch (child cluster) merges the master's latest
    /// release under the branch items and re-pins the branch's gray rule.
    /// Publishing a master with a live branch recomputes and, when the
    /// result differs, auto-publishes the branch so grayed clients keep
    /// their delta on top of the new master.
    #[instrument(skip(self, request), fields(app_id = %request.app_id, cluster = %request.cluster, namespace = %request.namespace))]
    pub async fn publish(&self, request: &PublishRequest) -> Result<Release> {
        let cluster_row = self
            .meta
            .find_cluster(&request.app_id, &request.cluster)
            .await?
            .ok_or_else(|| Error::not_found(format!("cluster {}", request.cluster)))?;

        let (release, message_cluster) = if cluster_row.parent_cluster_id != 0 {
            let parent = self
                .meta
                .find_cluster_by_id(cluster_row.parent_cluster_id)
                .await?
                .ok_or_else(|| Error::not_found("parent cluster"))?;
            let release = self
                .branch_publish(&request.app_id, &parent.name, &request.cluster, request)
                .await?;
            (release, parent.name)
        } else {
            let release = self.master_publish(&cluster_row, request, true).await?;
            (release, cluster_row.name.clone())
        };

        self.publisher
            .publish(&request.app_id, &message_cluster, &request.namespace)
            .await?;
        metrics::release_published();
        Ok(release)
    }

    /// Create a gray branch: a child cluster with a generated unique name
    /// carrying a same-named namespace. One branch per namespace.
    pub async fn create_branch(
        &self,
        app_id: &str,
        parent_cluster: &str,
        namespace: &str,
        operator: &str,
    ) -> Result<Cluster> {
        let parent = self
            .meta
            .find_cluster(app_id, parent_cluster)
            .await?
            .ok_or_else(|| Error::not_found(format!("cluster {parent_cluster}")))?;
        if parent.parent_cluster_id != 0 {
            return Err(Error::bad_request("can not branch off a branch"));
        }
        self.meta
            .find_namespace(app_id, parent_cluster, namespace)
            .await?
            .ok_or_else(|| Error::not_found(format!("namespace {namespace}")))?;
        if self.find_child_branch(app_id, parent.id, namespace).await?.is_some() {
            return Err(Error::bad_request(format!("namespace {namespace} already has a branch")));
        }

        let child = self.meta.insert_cluster(app_id, &unique_key(), parent.id).await?;
        self.meta.insert_namespace(app_id, &child.name, namespace).await?;
        info!(app_id, parent_cluster, namespace, branch = %child.name, operator, "branch created");
        Ok(child)
    }

    /// Replace the gray rules of a branch. The new rule row carries the
    /// branch's current pinned release id forward.
    pub async fn update_branch_rules(
        &self,
        app_id: &str,
        parent_cluster: &str,
        namespace: &str,
        branch_name: &str,
        items: &BTreeSet<RuleItem>,
        operator: &str,
    ) -> Result<GrayReleaseRule> {
        self.meta
            .find_namespace(app_id, branch_name, namespace)
            .await?
            .ok_or_else(|| Error::not_found(format!("branch {branch_name}")))?;

        let old = self.rules.latest_rule(app_id, parent_cluster, namespace, branch_name).await?;
        let release_id = old.as_ref().map(|r| r.release_id).unwrap_or(0);
        let rule = self
            .rules
            .insert_rule(
                app_id,
                parent_cluster,
                namespace,
                branch_name,
                &serialize_rule_items(items),
                release_id,
                BranchStatus::Active,
            )
            .await?;
        if let Some(old) = old {
            self.rules.delete_rule(old.id).await?;
        }

        self.record(ReleaseHistory {
            app_id: app_id.to_string(),
            cluster: parent_cluster.to_string(),
            namespace: namespace.to_string(),
            branch_name: branch_name.to_string(),
            release_id,
            previous_release_id: 0,
            operation: ReleaseOperation::ApplyGrayRules,
            operator: operator.to_string(),
            created_at: now_millis(),
        });
        self.publisher.publish(app_id, parent_cluster, namespace).await?;
        Ok(rule)
    }

    /// Current gray rule of a branch, if any.
    pub async fn branch_rules(
        &self,
        app_id: &str,
        parent_cluster: &str,
        namespace: &str,
        branch_name: &str,
    ) -> Result<Option<GrayReleaseRule>> {
        Ok(self.rules.latest_rule(app_id, parent_cluster, namespace, branch_name).await?)
    }

    /// Fold the branch's items into master and publish master. Optionally
    /// retires the branch with status `Merged`.
    pub async fn merge_branch(
        &self,
        app_id: &str,
        parent_cluster: &str,
        namespace: &str,
        branch_name: &str,
        delete_branch: bool,
        operator: &str,
        is_emergency: bool,
    ) -> Result<Release> {
        let master_cluster = self
            .meta
            .find_cluster(app_id, parent_cluster)
            .await?
            .ok_or_else(|| Error::not_found(format!("cluster {parent_cluster}")))?;
        let master_ns = self
            .meta
            .find_namespace(app_id, parent_cluster, namespace)
            .await?
            .ok_or_else(|| Error::not_found(format!("namespace {namespace}")))?;
        let child_ns = self
            .meta
            .find_namespace(app_id, branch_name, namespace)
            .await?
            .ok_or_else(|| Error::not_found(format!("branch {branch_name}")))?;

        // Validate the lock before touching master items.
        self.check_lock(master_ns.id, operator, is_emergency).await?;

        let branch_items = self.meta.namespace_items(child_ns.id).await?;
        let master_items = self.meta.namespace_items(master_ns.id).await?;
        let merged = merge_configuration(&master_items, &branch_items);
        self.meta.set_namespace_items(master_ns.id, merged).await?;

        let request = PublishRequest {
            app_id: app_id.to_string(),
            cluster: parent_cluster.to_string(),
            namespace: namespace.to_string(),
            operator: operator.to_string(),
            is_emergency,
        };
        let release = self.master_publish(&master_cluster, &request, false).await?;

        if delete_branch {
            self.retire_branch(app_id, parent_cluster, namespace, branch_name, BranchStatus::Merged)
                .await?;
        }
        self.record(ReleaseHistory {
            app_id: app_id.to_string(),
            cluster: parent_cluster.to_string(),
            namespace: namespace.to_string(),
            branch_name: branch_name.to_string(),
            release_id: release.id,
            previous_release_id: 0,
            operation: ReleaseOperation::MergeToMaster,
            operator: operator.to_string(),
            created_at: now_millis(),
        });

        self.publisher.publish(app_id, parent_cluster, namespace).await?;
        metrics::release_published();
        Ok(release)
    }

    /// Abandon a release so the previous active one takes effect again.
    /// A live branch is republished against the restored baseline.
    pub async fn rollback(&self, release_id: i64, operator: &str) -> Result<()> {
        let release = self
            .releases
            .find_release(release_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("release {release_id}")))?;
        if release.is_abandoned {
            return Err(Error::bad_request("release is already abandoned"));
        }
        let latest_two = self
            .releases
            .latest_active_releases(&release.app_id, &release.cluster, &release.namespace, 2)
            .await?;
        if latest_two.len() < 2 {
            return Err(Error::bad_request("can not rollback the only active release"));
        }

        self.releases.abandon_release(release.id).await?;
        let restored = &latest_two[1];
        self.record(ReleaseHistory {
            app_id: release.app_id.clone(),
            cluster: release.cluster.clone(),
            namespace: release.namespace.clone(),
            branch_name: release.cluster.clone(),
            release_id: restored.id,
            previous_release_id: release.id,
            operation: ReleaseOperation::Rollback,
            operator: operator.to_string(),
            created_at: now_millis(),
        });

        // Grayed clients must see the restored master under their delta,
        // even if the recomputed config happens to match the branch's
        // current release.
        if let Some(cluster_row) = self.meta.find_cluster(&release.app_id, &release.cluster).await? {
            if let Some((child_cluster, _)) = self
                .find_child_branch(&release.app_id, cluster_row.id, &release.namespace)
                .await?
            {
                self.republish_branch(
                    &release.app_id,
                    &release.cluster,
                    &child_cluster.name,
                    &release.namespace,
                    restored,
                    &release.configuration_map(),
                    true,
                    operator,
                )
                .await?;
            }
        }

        self.publisher
            .publish(&release.app_id, &release.cluster, &release.namespace)
            .await?;
        info!(release_id, operator, "release rolled back");
        Ok(())
    }

    /// Drop a branch: terminal rule row, then the child namespace and
    /// cluster go away.
    pub async fn delete_branch(
        &self,
        app_id: &str,
        parent_cluster: &str,
        namespace: &str,
        branch_name: &str,
        operator: &str,
    ) -> Result<()> {
        self.meta
            .find_cluster(app_id, branch_name)
            .await?
            .ok_or_else(|| Error::not_found(format!("branch {branch_name}")))?;
        self.retire_branch(app_id, parent_cluster, namespace, branch_name, BranchStatus::Deleted)
            .await?;
        self.record(ReleaseHistory {
            app_id: app_id.to_string(),
            cluster: parent_cluster.to_string(),
            namespace: namespace.to_string(),
            branch_name: branch_name.to_string(),
            release_id: 0,
            previous_release_id: 0,
            operation: ReleaseOperation::AbandonGrayRelease,
            operator: operator.to_string(),
            created_at: now_millis(),
        });
        self.publisher.publish(app_id, parent_cluster, namespace).await?;
        info!(app_id, branch = branch_name, operator, "branch deleted");
        Ok(())
    }

    /// Audit trail for one release line, newest first.
    pub fn history_for(&self, app_id: &str, cluster: &str, namespace: &str) -> Vec<ReleaseHistory> {
        self.history
            .read()
            .iter()
            .rev()
            .filter(|h| h.app_id == app_id && h.cluster == cluster && h.namespace == namespace)
            .cloned()
            .collect()
    }

    // -- internals ------------------------------------------------------

    /// The editor of a namespace's items may not also publish them; an
    /// emergency publish overrides.
    async fn check_lock(&self, namespace_id: i64, operator: &str, is_emergency: bool) -> Result<()> {
        if is_emergency {
            return Ok(());
        }
        if let Some(lock) = self.meta.find_lock(namespace_id).await? {
            if lock.owner == operator {
                return Err(Error::bad_request(format!(
                    "{operator} edited the namespace items and can not publish them"
                )));
            }
        }
        Ok(())
    }

    async fn master_publish(
        &self,
        cluster_row: &Cluster,
        request: &PublishRequest,
        check_lock: bool,
    ) -> Result<Release> {
        let ns = self
            .meta
            .find_namespace(&request.app_id, &request.cluster, &request.namespace)
            .await?
            .ok_or_else(|| Error::not_found(format!("namespace {}", request.namespace)))?;
        if check_lock {
            self.check_lock(ns.id, &request.operator, request.is_emergency).await?;
        }

        let old_master = self
            .releases
            .latest_active_release(&request.app_id, &request.cluster, &request.namespace)
            .await?;
        let items = self.meta.namespace_items(ns.id).await?;
        let configurations = serde_json::to_string(&items)
            .map_err(|e| Error::bad_request(format!("unserializable items: {e}")))?;
        let release = self
            .releases
            .insert_release(
                &request.app_id,
                &request.cluster,
                &request.namespace,
                &unique_key(),
                &configurations,
            )
            .await?;
        // A fresh release supersedes whatever edit was in flight.
        self.meta.release_lock(ns.id).await?;

        self.record(ReleaseHistory {
            app_id: request.app_id.clone(),
            cluster: request.cluster.clone(),
            namespace: request.namespace.clone(),
            branch_name: request.cluster.clone(),
            release_id: release.id,
            previous_release_id: old_master.as_ref().map(|r| r.id).unwrap_or(0),
            operation: ReleaseOperation::Normal,
            operator: request.operator.clone(),
            created_at: now_millis(),
        });

        if let Some((child_cluster, _)) = self
            .find_child_branch(&request.app_id, cluster_row.id, &request.namespace)
            .await?
        {
            let old_config = old_master.as_ref().map(|r| r.configuration_map()).unwrap_or_default();
            self.republish_branch(
                &request.app_id,
                &request.cluster,
                &child_cluster.name,
                &request.namespace,
                &release,
                &old_config,
                false,
                &request.operator,
            )
            .await?;
        }
        Ok(release)
    }

    async fn branch_publish(
        &self,
        app_id: &str,
        parent_cluster: &str,
        branch_name: &str,
        request: &PublishRequest,
    ) -> Result<Release> {
        let child_ns = self
            .meta
            .find_namespace(app_id, branch_name, &request.namespace)
            .await?
            .ok_or_else(|| Error::not_found(format!("namespace {}", request.namespace)))?;
        self.check_lock(child_ns.id, &request.operator, request.is_emergency).await?;

        let parent_config = self
            .releases
            .latest_active_release(app_id, parent_cluster, &request.namespace)
            .await?
            .map(|r| r.configuration_map())
            .unwrap_or_default();
        let branch_items = self.meta.namespace_items(child_ns.id).await?;
        let configurations = merge_configuration(&parent_config, &branch_items);

        let release = self
            .create_branch_release(
                app_id,
                parent_cluster,
                branch_name,
                &request.namespace,
                &configurations,
                ReleaseOperation::GrayRelease,
                &request.operator,
            )
            .await?;
        self.meta.release_lock(child_ns.id).await?;
        Ok(release)
    }

    /// Recompute a branch against a new master. The branch's delta is every
    /// entry of its latest release that the old master did not carry with
    /// the same value; the new branch config is that delta on top of the
    /// new master. Skipped when nothing would change, unless `force`.
    #[allow(clippy::too_many_arguments)]
    async fn republish_branch(
        &self,
        app_id: &str,
        parent_cluster: &str,
        branch_name: &str,
        namespace: &str,
        new_master: &Release,
        old_master_config: &HashMap<String, String>,
        force: bool,
        operator: &str,
    ) -> Result<Option<Release>> {
        let child_config = self
            .releases
            .latest_active_release(app_id, branch_name, namespace)
            .await?
            .map(|r| r.configuration_map())
            .unwrap_or_default();

        let delta: HashMap<String, String> = child_config
            .iter()
            .filter(|(k, v)| old_master_config.get(*k) != Some(v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let new_child_config = merge_configuration(&new_master.configuration_map(), &delta);

        if !force && new_child_config == child_config {
            return Ok(None);
        }
        let release = self
            .create_branch_release(
                app_id,
                parent_cluster,
                branch_name,
                namespace,
                &new_child_config,
                ReleaseOperation::AutoGrayRelease,
                operator,
            )
            .await?;
        Ok(Some(release))
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_branch_release(
        &self,
        app_id: &str,
        parent_cluster: &str,
        branch_name: &str,
        namespace: &str,
        configurations: &HashMap<String, String>,
        operation: ReleaseOperation,
        operator: &str,
    ) -> Result<Release> {
        let previous = self
            .releases
            .latest_active_release(app_id, branch_name, namespace)
            .await?;
        let serialized = serde_json::to_string(configurations)
            .map_err(|e| Error::bad_request(format!("unserializable items: {e}")))?;
        let release = self
            .releases
            .insert_release(app_id, branch_name, namespace, &unique_key(), &serialized)
            .await?;
        self.pin_rule(app_id, parent_cluster, namespace, branch_name, release.id).await?;

        self.record(ReleaseHistory {
            app_id: app_id.to_string(),
            cluster: parent_cluster.to_string(),
            namespace: namespace.to_string(),
            branch_name: branch_name.to_string(),
            release_id: release.id,
            previous_release_id: previous.map(|r| r.id).unwrap_or(0),
            operation,
            operator: operator.to_string(),
            created_at: now_millis(),
        });
        Ok(release)
    }

    /// Re-point the branch's gray rule at a new release: insert a fresh row
    /// carrying the rule items, soft-delete the old one.
    async fn pin_rule(
        &self,
        app_id: &str,
        parent_cluster: &str,
        namespace: &str,
        branch_name: &str,
        release_id: i64,
    ) -> Result<()> {
        let old = self.rules.latest_rule(app_id, parent_cluster, namespace, branch_name).await?;
        let items = old.as_ref().map(|r| r.rules.clone()).unwrap_or_else(|| "[]".to_string());
        self.rules
            .insert_rule(
                app_id,
                parent_cluster,
                namespace,
                branch_name,
                &items,
                release_id,
                BranchStatus::Active,
            )
            .await?;
        if let Some(old) = old {
            self.rules.delete_rule(old.id).await?;
        }
        Ok(())
    }

    /// Terminal rule row plus removal of the child namespace and cluster.
    async fn retire_branch(
        &self,
        app_id: &str,
        parent_cluster: &str,
        namespace: &str,
        branch_name: &str,
        status: BranchStatus,
    ) -> Result<()> {
        let old = self.rules.latest_rule(app_id, parent_cluster, namespace, branch_name).await?;
        let release_id = old.as_ref().map(|r| r.release_id).unwrap_or(0);
        self.rules
            .insert_rule(app_id, parent_cluster, namespace, branch_name, "[]", release_id, status)
            .await?;
        if let Some(old) = old {
            self.rules.delete_rule(old.id).await?;
        }

        if let Some(child_ns) = self.meta.find_namespace(app_id, branch_name, namespace).await? {
            self.meta.delete_namespace(child_ns.id).await?;
        }
        if let Some(child_cluster) = self.meta.find_cluster(app_id, branch_name).await? {
            self.meta.delete_cluster(child_cluster.id).await?;
        }
        Ok(())
    }

    async fn find_child_branch(
        &self,
        app_id: &str,
        parent_cluster_id: i64,
        namespace: &str,
    ) -> Result<Option<(Cluster, Namespace)>> {
        for child in self.meta.child_clusters_of(app_id, parent_cluster_id).await? {
            if let Some(ns) = self.meta.find_namespace(app_id, &child.name, namespace).await? {
                return Ok(Some((child, ns)));
            }
        }
        Ok(None)
    }

    fn record(&self, entry: ReleaseHistory) {
        self.history.write().push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{parse_rule_items, RuleItem, CLUSTER_DEFAULT, NAMESPACE_APPLICATION};
    use crate::store::{MemoryStore, MessageStore};

    struct Fixture {
        store: Arc<MemoryStore>,
        engine: ReleaseEngine,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(MessagePublisher::new(store.clone()));
        let engine = ReleaseEngine::new(store.clone(), store.clone(), store.clone(), publisher);
        Fixture { store, engine }
    }

    async fn seed_app(f: &Fixture, app_id: &str) -> i64 {
        let ns = f
            .store
            .seed_namespace(app_id, CLUSTER_DEFAULT, NAMESPACE_APPLICATION, false)
            .await
            .unwrap();
        ns.id
    }

    async fn set_items(f: &Fixture, namespace_id: i64, items: &[(&str, &str)]) {
        let map = items.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        f.store.set_namespace_items(namespace_id, map).await.unwrap();
    }

    fn publish_request(app_id: &str, cluster: &str, operator: &str) -> PublishRequest {
        PublishRequest {
            app_id: app_id.into(),
            cluster: cluster.into(),
            namespace: NAMESPACE_APPLICATION.into(),
            operator: operator.into(),
            is_emergency: false,
        }
    }

    #[tokio::test]
    async fn publish_snapshots_items_and_emits_one_message() {
        let f = fixture().await;
        let ns_id = seed_app(&f, "app1").await;
        set_items(&f, ns_id, &[("timeout", "30")]).await;

        let release = f.engine.publish(&publish_request("app1", "default", "alice")).await.unwrap();
        assert_eq!(release.configuration_map()["timeout"], "30");

        let messages = f.store.messages_after(0, 10).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].key, "app1+default+application");

        let history = f.engine.history_for("app1", "default", "application");
        assert_eq!(history[0].operation, ReleaseOperation::Normal);
        assert_eq!(history[0].release_id, release.id);
    }

    #[tokio::test]
    async fn publish_unknown_namespace_is_not_found() {
        let f = fixture().await;
        f.store.insert_cluster("app1", "default", 0).await.unwrap();
        let err = f.engine.publish(&publish_request("app1", "default", "alice")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn item_editor_can_not_publish_unless_emergency() {
        let f = fixture().await;
        let ns_id = seed_app(&f, "app1").await;
        f.store.acquire_lock(ns_id, "alice").await.unwrap();

        let err = f.engine.publish(&publish_request("app1", "default", "alice")).await.unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));

        // Someone else may publish.
        f.engine.publish(&publish_request("app1", "default", "bob")).await.unwrap();

        // The publish released the lock; alice may edit-and-publish again
        // only via the emergency override.
        f.store.acquire_lock(ns_id, "alice").await.unwrap();
        let mut request = publish_request("app1", "default", "alice");
        request.is_emergency = true;
        f.engine.publish(&request).await.unwrap();
    }

    #[tokio::test]
    async fn publish_releases_the_edit_lock() {
        let f = fixture().await;
        let ns_id = seed_app(&f, "app1").await;
        f.store.acquire_lock(ns_id, "alice").await.unwrap();
        f.engine.publish(&publish_request("app1", "default", "bob")).await.unwrap();
        assert!(f.store.find_lock(ns_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn branch_lifecycle_create_publish_pin() {
        let f = fixture().await;
        let master_ns = seed_app(&f, "app1").await;
        set_items(&f, master_ns, &[("a", "1"), ("b", "2")]).await;
        f.engine.publish(&publish_request("app1", "default", "alice")).await.unwrap();

        let branch = f.engine.create_branch("app1", "default", "application", "alice").await.unwrap();
        assert_ne!(branch.name, "default");

        // Duplicate branch and branch-of-branch are rejected.
        let err = f.engine.create_branch("app1", "default", "application", "alice").await.unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
        let err = f.engine.create_branch("app1", &branch.name, "application", "alice").await.unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));

        let child_ns = f
            .store
            .find_namespace("app1", &branch.name, "application")
            .await
            .unwrap()
            .unwrap();
        set_items(&f, child_ns.id, &[("b", "99")]).await;

        let release = f
            .engine
            .publish(&publish_request("app1", &branch.name, "alice"))
            .await
            .unwrap();
        let config = release.configuration_map();
        assert_eq!(config["a"], "1");
        assert_eq!(config["b"], "99");

        // The branch release message is keyed by the parent cluster.
        let messages = f.store.messages_after(0, 10).await.unwrap();
        assert!(messages.iter().all(|m| m.key == "app1+default+application"));

        // The gray rule pins the branch release.
        let rule = f
            .engine
            .branch_rules("app1", "default", "application", &branch.name)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rule.release_id, release.id);
    }

    #[tokio::test]
    async fn update_branch_rules_carries_pinned_release() {
        let f = fixture().await;
        let master_ns = seed_app(&f, "app1").await;
        set_items(&f, master_ns, &[("a", "1")]).await;
        f.engine.publish(&publish_request("app1", "default", "alice")).await.unwrap();
        let branch = f.engine.create_branch("app1", "default", "application", "alice").await.unwrap();
        let release = f
            .engine
            .publish(&publish_request("app1", &branch.name, "alice"))
            .await
            .unwrap();

        let items: BTreeSet<RuleItem> = [RuleItem::new("client", ["10.0.0.1"])].into();
        let rule = f
            .engine
            .update_branch_rules("app1", "default", "application", &branch.name, &items, "alice")
            .await
            .unwrap();
        assert_eq!(rule.release_id, release.id);
        assert_eq!(parse_rule_items(rule.id, &rule.rules), items);
    }

    #[tokio::test]
    async fn master_publish_republishes_branch_preserving_delta() {
        let f = fixture().await;
        let master_ns = seed_app(&f, "app1").await;
        set_items(&f, master_ns, &[("a", "1"), ("b", "2")]).await;
        f.engine.publish(&publish_request("app1", "default", "alice")).await.unwrap();

        let branch = f.engine.create_branch("app1", "default", "application", "alice").await.unwrap();
        let child_ns = f
            .store
            .find_namespace("app1", &branch.name, "application")
            .await
            .unwrap()
            .unwrap();
        set_items(&f, child_ns.id, &[("b", "99")]).await;
        f.engine.publish(&publish_request("app1", &branch.name, "alice")).await.unwrap();

        // New master value for "a"; the branch keeps its "b" override.
        set_items(&f, master_ns, &[("a", "7"), ("b", "2")]).await;
        f.engine.publish(&publish_request("app1", "default", "alice")).await.unwrap();

        let branch_release = f
            .store
            .latest_active_release("app1", &branch.name, "application")
            .await
            .unwrap()
            .unwrap();
        let config = branch_release.configuration_map();
        assert_eq!(config["a"], "7");
        assert_eq!(config["b"], "99");

        let rule = f
            .engine
            .branch_rules("app1", "default", "application", &branch.name)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rule.release_id, branch_release.id);
    }

    #[tokio::test]
    async fn master_publish_skips_branch_republish_when_unchanged() {
        let f = fixture().await;
        let master_ns = seed_app(&f, "app1").await;
        set_items(&f, master_ns, &[("a", "1")]).await;
        f.engine.publish(&publish_request("app1", "default", "alice")).await.unwrap();

        let branch = f.engine.create_branch("app1", "default", "application", "alice").await.unwrap();
        f.engine.publish(&publish_request("app1", &branch.name, "alice")).await.unwrap();
        let before = f
            .store
            .latest_active_release("app1", &branch.name, "application")
            .await
            .unwrap()
            .unwrap();

        // Identical master items: branch config would not change.
        f.engine.publish(&publish_request("app1", "default", "alice")).await.unwrap();
        let after = f
            .store
            .latest_active_release("app1", &branch.name, "application")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(before.id, after.id);
    }

    #[tokio::test]
    async fn merge_branch_folds_items_and_can_retire_the_branch() {
        let f = fixture().await;
        let master_ns = seed_app(&f, "app1").await;
        set_items(&f, master_ns, &[("a", "1"), ("b", "2")]).await;
        f.engine.publish(&publish_request("app1", "default", "alice")).await.unwrap();

        let branch = f.engine.create_branch("app1", "default", "application", "alice").await.unwrap();
        let child_ns = f
            .store
            .find_namespace("app1", &branch.name, "application")
            .await
            .unwrap()
            .unwrap();
        set_items(&f, child_ns.id, &[("b", "99")]).await;
        f.engine.publish(&publish_request("app1", &branch.name, "alice")).await.unwrap();

        let before_count = f.store.messages_after(0, 100).await.unwrap().len();
        let release = f
            .engine
            .merge_branch("app1", "default", "application", &branch.name, true, "alice", false)
            .await
            .unwrap();
        let config = release.configuration_map();
        assert_eq!(config["a"], "1");
        assert_eq!(config["b"], "99");

        // One message for the whole merge, keyed by master.
        let messages = f.store.messages_after(0, 100).await.unwrap();
        assert_eq!(messages.len(), before_count + 1);
        assert_eq!(messages.last().unwrap().key, "app1+default+application");

        // Branch rows are gone; the terminal rule carries Merged.
        assert!(f.store.find_cluster("app1", &branch.name).await.unwrap().is_none());
        assert!(f
            .store
            .find_namespace("app1", &branch.name, "application")
            .await
            .unwrap()
            .is_none());
        let rule = f
            .engine
            .branch_rules("app1", "default", "application", &branch.name)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rule.branch_status, BranchStatus::Merged);
    }

    #[tokio::test]
    async fn rollback_validations() {
        let f = fixture().await;
        let ns_id = seed_app(&f, "app1").await;
        set_items(&f, ns_id, &[("a", "1")]).await;

        assert!(matches!(f.engine.rollback(999, "alice").await, Err(Error::NotFound(_))));

        let only = f.engine.publish(&publish_request("app1", "default", "alice")).await.unwrap();
        assert!(matches!(f.engine.rollback(only.id, "alice").await, Err(Error::BadRequest(_))));

        let second = f.engine.publish(&publish_request("app1", "default", "alice")).await.unwrap();
        f.engine.rollback(second.id, "alice").await.unwrap();
        assert!(matches!(f.engine.rollback(second.id, "alice").await, Err(Error::BadRequest(_))));

        let effective = f
            .store
            .latest_active_release("app1", "default", "application")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(effective.id, only.id);
    }

    #[tokio::test]
    async fn rollback_republishes_branch_against_restored_master() {
        let f = fixture().await;
        let master_ns = seed_app(&f, "app1").await;
        set_items(&f, master_ns, &[("a", "1")]).await;
        f.engine.publish(&publish_request("app1", "default", "alice")).await.unwrap();

        let branch = f.engine.create_branch("app1", "default", "application", "alice").await.unwrap();
        let child_ns = f
            .store
            .find_namespace("app1", &branch.name, "application")
            .await
            .unwrap()
            .unwrap();
        set_items(&f, child_ns.id, &[("b", "99")]).await;
        f.engine.publish(&publish_request("app1", &branch.name, "alice")).await.unwrap();

        set_items(&f, master_ns, &[("a", "2")]).await;
        let bad = f.engine.publish(&publish_request("app1", "default", "alice")).await.unwrap();

        f.engine.rollback(bad.id, "alice").await.unwrap();

        let branch_release = f
            .store
            .latest_active_release("app1", &branch.name, "application")
            .await
            .unwrap()
            .unwrap();
        let config = branch_release.configuration_map();
        assert_eq!(config["a"], "1");
        assert_eq!(config["b"], "99");
    }

    #[tokio::test]
    async fn delete_branch_leaves_terminal_rule_and_drops_rows() {
        let f = fixture().await;
        let master_ns = seed_app(&f, "app1").await;
        set_items(&f, master_ns, &[("a", "1")]).await;
        f.engine.publish(&publish_request("app1", "default", "alice")).await.unwrap();
        let branch = f.engine.create_branch("app1", "default", "application", "alice").await.unwrap();
        let release = f
            .engine
            .publish(&publish_request("app1", &branch.name, "alice"))
            .await
            .unwrap();

        f.engine
            .delete_branch("app1", "default", "application", &branch.name, "alice")
            .await
            .unwrap();

        let rule = f
            .engine
            .branch_rules("app1", "default", "application", &branch.name)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rule.branch_status, BranchStatus::Deleted);
        assert_eq!(rule.release_id, release.id);
        assert_eq!(rule.rules, "[]");
        assert!(f.store.find_cluster("app1", &branch.name).await.unwrap().is_none());

        // Deleting again: the branch cluster is gone.
        let err = f
            .engine
            .delete_branch("app1", "default", "application", &branch.name, "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
