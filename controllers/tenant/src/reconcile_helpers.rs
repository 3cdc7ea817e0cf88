//! Helper functions for common reconciliation patterns
//!
//! Owner references, label maps, finalizers and conflict-retrying writes
//! shared by all reconcilers.

use crate::error::ControllerError;
use cluster_client::{ClusterClient, ClusterResource, ObjectKey};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Attempts for a read-modify-write before the conflict is surfaced
const CONFLICT_RETRIES: usize = 5;

/// Controller owner reference pointing at `owner`
pub fn owner_reference<K: Resource<DynamicType = ()>>(owner: &K) -> Result<OwnerReference, ControllerError> {
    owner.controller_owner_ref(&()).ok_or_else(|| ControllerError::InvalidResource {
        object: owner.meta().name.clone().unwrap_or_default(),
        reason: "owner has no uid yet".to_string(),
    })
}

fn same_target(a: &OwnerReference, b: &OwnerReference) -> bool {
    a.api_version == b.api_version && a.kind == b.kind && a.name == b.name
}

/// Whether `meta` already carries `owner` (same apiVersion, kind, name and uid)
pub fn has_owner_ref(meta: &ObjectMeta, owner: &OwnerReference) -> bool {
    meta.owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|r| same_target(r, owner) && r.uid == owner.uid)
}

/// Put `owner` on `meta`, replacing a stale reference to the same target
pub fn set_owner_ref(meta: &mut ObjectMeta, owner: &OwnerReference) {
    let refs = meta.owner_references.get_or_insert_with(Vec::new);
    refs.retain(|r| !same_target(r, owner));
    refs.push(owner.clone());
}

/// Name of another controller owning `meta`, if any
pub fn controlled_by_other(meta: &ObjectMeta, owner: &OwnerReference) -> Option<String> {
    meta.owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|r| r.controller == Some(true) && !same_target(r, owner))
        .map(|r| format!("{} {}", r.kind, r.name))
}

/// Whether any `target` label is missing or different in `origin`
pub fn labels_changed(origin: Option<&BTreeMap<String, String>>, target: &BTreeMap<String, String>) -> bool {
    let Some(origin) = origin else {
        return !target.is_empty();
    };
    target.iter().any(|(k, v)| origin.get(k) != Some(v))
}

/// Overlay `target` onto the labels of `meta`
pub fn merge_labels(meta: &mut ObjectMeta, target: &BTreeMap<String, String>) {
    let labels = meta.labels.get_or_insert_with(BTreeMap::new);
    for (k, v) in target {
        labels.insert(k.clone(), v.clone());
    }
}

/// Remove `keys` from the labels of `meta`; returns whether anything changed
pub fn delete_labels(meta: &mut ObjectMeta, keys: &[&str]) -> bool {
    let Some(labels) = meta.labels.as_mut() else {
        return false;
    };
    let before = labels.len();
    labels.retain(|k, _| !keys.contains(&k.as_str()));
    labels.len() != before
}

/// Order-insensitive comparison of two string lists
pub fn string_sets_equal(a: &[String], b: &[String]) -> bool {
    let a: BTreeSet<&String> = a.iter().collect();
    let b: BTreeSet<&String> = b.iter().collect();
    a == b
}

pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|f| f == finalizer)
}

/// Add every missing finalizer; returns whether anything changed
pub fn add_finalizers(meta: &mut ObjectMeta, finalizers: &[&str]) -> bool {
    let current = meta.finalizers.get_or_insert_with(Vec::new);
    let mut changed = false;
    for finalizer in finalizers {
        if !current.iter().any(|f| f == finalizer) {
            current.push((*finalizer).to_string());
            changed = true;
        }
    }
    changed
}

pub fn remove_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    let Some(current) = meta.finalizers.as_mut() else {
        return false;
    };
    let before = current.len();
    current.retain(|f| f != finalizer);
    current.len() != before
}

pub fn is_deleting(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some()
}

/// Which part of the object a mutation writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget {
    Object,
    Status,
}

/// Read-modify-write with a fresh read after every version conflict.
///
/// `mutate` returns `false` when the object already has the wanted shape, in
/// which case nothing is written. Returns `None` when the object is gone.
pub async fn update_with_retry<C, K, F>(
    client: &C,
    key: &ObjectKey,
    target: WriteTarget,
    mut mutate: F,
) -> Result<Option<K>, ControllerError>
where
    C: ClusterClient,
    K: ClusterResource,
    F: FnMut(&mut K) -> bool + Send,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let Some(mut obj) = client.get::<K>(key).await? else {
            return Ok(None);
        };
        if !mutate(&mut obj) {
            return Ok(Some(obj));
        }
        let written = match target {
            WriteTarget::Object => client.replace(&obj).await,
            WriteTarget::Status => client.replace_status(&obj).await,
        };
        match written {
            Ok(obj) => return Ok(Some(obj)),
            Err(e) if e.is_conflict() && attempt < CONFLICT_RETRIES => {
                debug!(key = %key, attempt, "Write conflict, re-reading");
            }
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
#[path = "reconcile_helpers_test.rs"]
mod tests;
