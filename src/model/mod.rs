// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Core entities and key helpers.
//!
//! Everything that crosses the store boundary lives here: release messages,
//! releases, gray-release rules, namespace metadata, and the watch-key
//! format that ties them together.
//!
//! # Watch keys
//!
//! A watch key is `appId+cluster+namespace` joined on [`KEY_SEPARATOR`].
//! It is simultaneously the payload of a [`ReleaseMessage`], the key of the
//! message cache, and the registration key of the long-poll hub. Every
//! consumer drops keys that do not split into exactly three non-empty parts.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

/// Separator for composite `appId+cluster+namespace` keys.
pub const KEY_SEPARATOR: char = '+';

/// Name of the cluster every app falls back to.
pub const CLUSTER_DEFAULT: &str = "default";

/// The namespace every app owns implicitly.
pub const NAMESPACE_APPLICATION: &str = "application";

/// Wildcard entry in a rule item's ip list: matches any client ip.
pub const ALL_IP: &str = "*";

/// Notification id reported when no message has ever been seen for a key.
pub const NOTIFICATION_ID_PLACEHOLDER: i64 = -1;

/// Rows fetched per ascending id scan.
pub const SCAN_BATCH: usize = 500;

/// Rows deleted per message-cleanup round.
pub const CLEAN_BATCH: usize = 100;

/// Assemble a watch key from its three parts.
pub fn assemble_key(app_id: &str, cluster: &str, namespace: &str) -> String {
    format!("{app_id}{KEY_SEPARATOR}{cluster}{KEY_SEPARATOR}{namespace}")
}

/// Split a watch key into `(appId, cluster, namespace)`.
///
/// Returns `None` unless the key has exactly three non-empty parts; callers
/// are expected to log and drop such messages rather than fail.
pub fn split_key(key: &str) -> Option<(&str, &str, &str)> {
    let mut parts = key.split(KEY_SEPARATOR).filter(|p| !p.is_empty());
    let app_id = parts.next()?;
    let cluster = parts.next()?;
    let namespace = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    // Reject keys with empty segments that the filter silently dropped,
    // e.g. "a++b+c" would otherwise pass as three parts.
    if key.split(KEY_SEPARATOR).count() != 3 {
        return None;
    }
    Some((app_id, cluster, namespace))
}

/// An ordered, replayable "namespace changed" event.
///
/// Ids are assigned by the store, strictly increasing and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseMessage {
    pub id: i64,
    /// Watch key: `appId+cluster+namespace`.
    pub key: String,
}

/// An immutable snapshot of a namespace's configuration.
///
/// Never mutated after creation except for the `is_abandoned` soft-delete
/// flag (rollback).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub id: i64,
    pub app_id: String,
    pub cluster: String,
    pub namespace: String,
    /// Opaque unique key, compared by clients for not-modified checks.
    pub release_key: String,
    /// JSON object of string -> string.
    pub configurations: String,
    pub is_abandoned: bool,
    /// Unix epoch millis.
    pub created_at: i64,
}

impl Release {
    /// Parse the serialized configuration map.
    ///
    /// A malformed blob yields an empty map rather than an error: a single
    /// corrupt row must not take down resolution for the whole namespace.
    pub fn configuration_map(&self) -> HashMap<String, String> {
        match serde_json::from_str(&self.configurations) {
            Ok(map) => map,
            Err(e) => {
                tracing::error!(release_id = self.id, error = %e,
                    "malformed release configurations, treating as empty");
                HashMap::new()
            }
        }
    }
}

/// Lifecycle of a gray-release branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BranchStatus {
    Deleted,
    Active,
    Merged,
}

/// A single matcher: one client app id plus a set of ips (or [`ALL_IP`]).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleItem {
    pub client_app_id: String,
    pub client_ip_list: BTreeSet<String>,
}

impl RuleItem {
    pub fn new(client_app_id: impl Into<String>, ips: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            client_app_id: client_app_id.into(),
            client_ip_list: ips.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether this item matches the given client.
    pub fn matches(&self, client_app_id: &str, client_ip: &str) -> bool {
        self.client_app_id.eq_ignore_ascii_case(client_app_id)
            && (self.client_ip_list.contains(ALL_IP) || self.client_ip_list.contains(client_ip))
    }
}

/// Parse a serialized rule item array.
///
/// Malformed JSON maps to an empty set (logged); data corruption in one row
/// must never fail a whole cache load.
pub fn parse_rule_items(rule_id: i64, raw: &str) -> BTreeSet<RuleItem> {
    match serde_json::from_str(raw) {
        Ok(items) => items,
        Err(e) => {
            tracing::error!(rule_id, error = %e, "malformed gray rule items, treating as empty");
            BTreeSet::new()
        }
    }
}

/// Serialize rule items to their wire/storage form.
pub fn serialize_rule_items(items: &BTreeSet<RuleItem>) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

/// One row of the append-only gray-release rule table.
///
/// "Updating" a rule means inserting a new row and soft-deleting the old
/// one, so the row id doubles as the rule's version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrayReleaseRule {
    pub id: i64,
    pub app_id: String,
    /// Parent (master) cluster the rule hangs off.
    pub cluster: String,
    pub namespace: String,
    /// Child cluster name of the branch this rule belongs to.
    pub branch_name: String,
    /// JSON array of [`RuleItem`].
    pub rules: String,
    /// Release the matched clients are pinned to; 0 = branch never released.
    pub release_id: i64,
    pub branch_status: BranchStatus,
}

impl GrayReleaseRule {
    pub fn rule_items(&self) -> BTreeSet<RuleItem> {
        parse_rule_items(self.id, &self.rules)
    }
}

/// Per-app namespace registration; public namespaces are visible cross-app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppNamespace {
    pub id: i64,
    pub app_id: String,
    pub name: String,
    pub is_public: bool,
    /// Unix epoch millis of the last modification; drives the periodic
    /// full-rebuild diff in the meta cache.
    pub modified_at: i64,
}

/// A deployment grouping; a gray branch is a child cluster (parent pointer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub id: i64,
    pub app_id: String,
    pub name: String,
    /// 0 for top-level clusters.
    pub parent_cluster_id: i64,
}

/// A named bundle of key/value items under (app, cluster).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    pub id: i64,
    pub app_id: String,
    pub cluster: String,
    pub name: String,
}

/// Row-based optimistic edit lock; contention rejects, never blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceLock {
    pub namespace_id: i64,
    pub owner: String,
}

/// Merge two configuration maps; `cover` wins on key conflicts.
pub fn merge_configuration(
    base: &HashMap<String, String>,
    cover: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut result = base.clone();
    for (k, v) in cover {
        result.insert(k.clone(), v.clone());
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_roundtrip() {
        let key = assemble_key("app1", "default", "application");
        assert_eq!(key, "app1+default+application");
        assert_eq!(split_key(&key), Some(("app1", "default", "application")));
    }

    #[test]
    fn split_rejects_malformed_keys() {
        assert_eq!(split_key(""), None);
        assert_eq!(split_key("app1"), None);
        assert_eq!(split_key("app1+default"), None);
        assert_eq!(split_key("app1+default+ns+extra"), None);
        assert_eq!(split_key("app1++ns"), None);
    }

    #[test]
    fn rule_item_matches_exact_ip() {
        let item = RuleItem::new("X", ["10.0.0.1"]);
        assert!(item.matches("X", "10.0.0.1"));
        assert!(!item.matches("X", "10.0.0.2"));
        assert!(!item.matches("Y", "10.0.0.1"));
    }

    #[test]
    fn rule_item_wildcard_matches_any_ip() {
        let item = RuleItem::new("X", [ALL_IP]);
        assert!(item.matches("X", "10.0.0.1"));
        assert!(item.matches("X", "192.168.1.1"));
        assert!(!item.matches("Y", "10.0.0.1"));
    }

    #[test]
    fn rule_items_serde_uses_camel_case() {
        let items: BTreeSet<RuleItem> = [RuleItem::new("X", ["10.0.0.1", "*"])].into();
        let json = serialize_rule_items(&items);
        assert!(json.contains("clientAppId"));
        assert!(json.contains("clientIpList"));
        assert_eq!(parse_rule_items(1, &json), items);
    }

    #[test]
    fn malformed_rule_items_parse_to_empty() {
        assert!(parse_rule_items(1, "{not json").is_empty());
        assert!(parse_rule_items(1, "{\"clientAppId\":\"X\"}").is_empty());
    }

    #[test]
    fn malformed_release_configurations_parse_to_empty() {
        let release = Release {
            id: 1,
            app_id: "a".into(),
            cluster: "default".into(),
            namespace: "application".into(),
            release_key: "k".into(),
            configurations: "not-json".into(),
            is_abandoned: false,
            created_at: 0,
        };
        assert!(release.configuration_map().is_empty());
    }

    #[test]
    fn merge_configuration_cover_wins() {
        let base: HashMap<_, _> = [("a", "1"), ("b", "2")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let cover: HashMap<_, _> = [("b", "3"), ("c", "4")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let merged = merge_configuration(&base, &cover);
        assert_eq!(merged["a"], "1");
        assert_eq!(merged["b"], "3");
        assert_eq!(merged["c"], "4");
    }
}
