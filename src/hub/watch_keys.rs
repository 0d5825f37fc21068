// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Watch-key assembly for long polls.

use std::collections::{BTreeSet, HashMap};

use crate::cache::NamespaceMetaCache;
use crate::model::{assemble_key, CLUSTER_DEFAULT, NAMESPACE_APPLICATION};

/// Cluster names a client effectively watches, most specific first: the
/// requested cluster, the data center, then `default`, deduplicated.
pub fn cluster_candidates<'a>(cluster: &'a str, data_center: Option<&'a str>) -> Vec<&'a str> {
    let mut candidates = Vec::with_capacity(3);
    if cluster != CLUSTER_DEFAULT {
        candidates.push(cluster);
    }
    if let Some(dc) = data_center {
        if !candidates.contains(&dc) {
            candidates.push(dc);
        }
    }
    if !candidates.contains(&CLUSTER_DEFAULT) {
        candidates.push(CLUSTER_DEFAULT);
    }
    candidates
}

/// All watch keys per requested namespace.
///
/// A client watches its own app's keys for every namespace, and for a
/// public namespace it does not own, the owning app's keys as well: a
/// publish by the owner must wake watchers in every consuming app.
pub fn assemble_all<'a>(
    meta: &NamespaceMetaCache,
    app_id: &str,
    cluster: &str,
    data_center: Option<&str>,
    namespaces: impl IntoIterator<Item = &'a str>,
) -> HashMap<String, BTreeSet<String>> {
    let candidates = cluster_candidates(cluster, data_center);
    let mut result = HashMap::new();

    for namespace in namespaces {
        let mut keys: BTreeSet<String> = candidates
            .iter()
            .map(|c| assemble_key(app_id, c, namespace))
            .collect();

        let owned = namespace == NAMESPACE_APPLICATION
            || meta.find_by_app_and_name(app_id, namespace).is_some();
        if !owned {
            if let Some(owner) = meta.find_public(namespace) {
                if owner.app_id != app_id {
                    keys.extend(candidates.iter().map(|c| assemble_key(&owner.app_id, c, namespace)));
                }
            }
        }
        result.insert(namespace.to_string(), keys);
    }
    result
}
