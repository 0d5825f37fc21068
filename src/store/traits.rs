// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store boundary traits.
//!
//! The relational store is an external collaborator: a set of durable,
//! ordered tables with autoincrement ids and indexable columns. These traits
//! are everything the service assumes about it. Soft-deleted rows (abandoned
//! releases, superseded rule rows, deleted clusters) are filtered at this
//! layer; callers never see them unless they ask explicitly.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::model::{
    AppNamespace, Cluster, GrayReleaseRule, Namespace, NamespaceLock, Release, ReleaseMessage,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("row not found")]
    NotFound,
    #[error("store backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The release-message table: the backing log of the message bus.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert a new message row; the store assigns the next monotonic id.
    async fn insert_message(&self, key: &str) -> StoreResult<ReleaseMessage>;

    async fn find_message(&self, id: i64) -> StoreResult<Option<ReleaseMessage>>;

    /// Fetch up to `limit` rows with `id > cursor`, ascending by id.
    async fn messages_after(&self, cursor: i64, limit: usize) -> StoreResult<Vec<ReleaseMessage>>;

    /// Current largest message id, or 0 when the table is empty.
    async fn max_message_id(&self) -> StoreResult<i64>;

    /// Delete up to `limit` rows sharing `key` with id < `before_id`,
    /// returning how many were removed.
    async fn delete_older_messages(&self, key: &str, before_id: i64, limit: usize) -> StoreResult<usize>;
}

/// The release table. Releases are append-only; rollback soft-deletes.
#[async_trait]
pub trait ReleaseStore: Send + Sync {
    async fn insert_release(
        &self,
        app_id: &str,
        cluster: &str,
        namespace: &str,
        release_key: &str,
        configurations: &str,
    ) -> StoreResult<Release>;

    /// Find by id, abandoned or not.
    async fn find_release(&self, id: i64) -> StoreResult<Option<Release>>;

    /// Find by id, active (non-abandoned) rows only.
    async fn find_active_release(&self, id: i64) -> StoreResult<Option<Release>>;

    /// Latest active release for a release line, by descending id.
    async fn latest_active_release(
        &self,
        app_id: &str,
        cluster: &str,
        namespace: &str,
    ) -> StoreResult<Option<Release>>;

    /// Up to `limit` latest active releases for a release line, newest first.
    async fn latest_active_releases(
        &self,
        app_id: &str,
        cluster: &str,
        namespace: &str,
        limit: usize,
    ) -> StoreResult<Vec<Release>>;

    /// Soft-delete: set the abandoned flag.
    async fn abandon_release(&self, id: i64) -> StoreResult<()>;
}

/// The gray-release-rule table. Rows are append-only; the id is the version.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn insert_rule(
        &self,
        app_id: &str,
        cluster: &str,
        namespace: &str,
        branch_name: &str,
        rules: &str,
        release_id: i64,
        branch_status: crate::model::BranchStatus,
    ) -> StoreResult<GrayReleaseRule>;

    /// Soft-delete a superseded rule row.
    async fn delete_rule(&self, id: i64) -> StoreResult<()>;

    /// Latest live row for one branch, by descending id.
    async fn latest_rule(
        &self,
        app_id: &str,
        cluster: &str,
        namespace: &str,
        branch_name: &str,
    ) -> StoreResult<Option<GrayReleaseRule>>;

    /// All live rows for a (app, cluster, namespace) bucket, any branch.
    async fn rules_for(
        &self,
        app_id: &str,
        cluster: &str,
        namespace: &str,
    ) -> StoreResult<Vec<GrayReleaseRule>>;

    /// Fetch up to `limit` live rows with `id > cursor`, ascending by id.
    async fn rules_after(&self, cursor: i64, limit: usize) -> StoreResult<Vec<GrayReleaseRule>>;
}

/// Namespace metadata, clusters, items and edit locks.
///
/// The operator portal writes through this boundary; the service mostly
/// reads, except for the branch lifecycle which creates and deletes child
/// clusters/namespaces.
#[async_trait]
pub trait MetaStore: Send + Sync {
    // -- app namespaces -------------------------------------------------
    async fn insert_app_namespace(&self, app_id: &str, name: &str, is_public: bool) -> StoreResult<AppNamespace>;
    async fn update_app_namespace(&self, ns: AppNamespace) -> StoreResult<()>;
    async fn delete_app_namespace(&self, id: i64) -> StoreResult<()>;
    /// Fetch up to `limit` rows with `id > cursor`, ascending by id.
    async fn app_namespaces_after(&self, cursor: i64, limit: usize) -> StoreResult<Vec<AppNamespace>>;
    /// Fetch current rows for the given ids; missing ids are omitted.
    async fn app_namespaces_by_ids(&self, ids: &[i64]) -> StoreResult<Vec<AppNamespace>>;

    // -- clusters -------------------------------------------------------
    async fn insert_cluster(&self, app_id: &str, name: &str, parent_cluster_id: i64) -> StoreResult<Cluster>;
    async fn find_cluster(&self, app_id: &str, name: &str) -> StoreResult<Option<Cluster>>;
    async fn find_cluster_by_id(&self, id: i64) -> StoreResult<Option<Cluster>>;
    async fn child_clusters_of(&self, app_id: &str, parent_cluster_id: i64) -> StoreResult<Vec<Cluster>>;
    async fn delete_cluster(&self, id: i64) -> StoreResult<()>;

    // -- namespaces -----------------------------------------------------
    async fn insert_namespace(&self, app_id: &str, cluster: &str, name: &str) -> StoreResult<Namespace>;
    async fn find_namespace(&self, app_id: &str, cluster: &str, name: &str) -> StoreResult<Option<Namespace>>;
    async fn delete_namespace(&self, id: i64) -> StoreResult<()>;

    // -- namespace items ------------------------------------------------
    async fn namespace_items(&self, namespace_id: i64) -> StoreResult<HashMap<String, String>>;
    async fn set_namespace_items(&self, namespace_id: i64, items: HashMap<String, String>) -> StoreResult<()>;

    // -- edit locks -----------------------------------------------------
    /// Row-based optimistic lock: fails when a different owner holds it.
    async fn acquire_lock(&self, namespace_id: i64, owner: &str) -> StoreResult<()>;
    async fn find_lock(&self, namespace_id: i64) -> StoreResult<Option<NamespaceLock>>;
    async fn release_lock(&self, namespace_id: i64) -> StoreResult<()>;
}
