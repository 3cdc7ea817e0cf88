//! Event routers.
//!
//! A router maps a change on a watched object to the keys of the objects
//! that have to be reconciled because of it. Routers are pure; [`Route`]
//! feeds their output into a work queue.

use crate::plugin_status::PluginStatus;
use crate::quantity;
use crate::runner::{EventHandler, ObjectEvent, Store, WorkQueue};
use cluster_client::{ClusterResource, ObjectKey};
use crds::{Environment, LABEL_TENANT, TenantNetworkPolicy};
use k8s_openapi::api::core::v1::{Node, ResourceQuota, ResourceQuotaStatus};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::ResourceExt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::trace;

/// Maps an object change to reconcile requests
pub trait EventRouter<K>: Send + Sync {
    fn route(&self, event: &ObjectEvent<K>) -> Vec<ObjectKey>;
}

/// Enqueue everything `router` returns
pub struct Route<R> {
    name: &'static str,
    router: R,
    queue: WorkQueue,
}

impl<R> Route<R> {
    pub fn new(name: &'static str, router: R, queue: WorkQueue) -> Arc<Self> {
        Arc::new(Self { name, router, queue })
    }
}

impl<K, R: EventRouter<K>> EventHandler<K> for Route<R> {
    fn handle(&self, event: &ObjectEvent<K>) {
        for key in self.router.route(event) {
            trace!(route = self.name, key = %key, "Enqueue");
            self.queue.add(key);
        }
    }
}

fn current<K>(event: &ObjectEvent<K>) -> &K {
    match event {
        ObjectEvent::Created(obj) | ObjectEvent::Deleted(obj) => obj,
        ObjectEvent::Updated { new, .. } => new,
    }
}

/// Key of the cluster-scoped object named after `obj`'s tenant label
fn tenant_label_key<K: ResourceExt>(obj: &K) -> Option<ObjectKey> {
    obj.labels()
        .get(LABEL_TENANT)
        .filter(|t| !t.is_empty())
        .map(ObjectKey::cluster)
}

fn tenant_spec_key(env: &Environment) -> Option<ObjectKey> {
    (!env.spec.tenant.is_empty()).then(|| ObjectKey::cluster(&env.spec.tenant))
}

/// Old and new tenant of an environment, deduplicated
fn both_tenants(old: &Environment, new: &Environment) -> Vec<ObjectKey> {
    let mut keys: Vec<ObjectKey> = tenant_spec_key(old).into_iter().chain(tenant_spec_key(new)).collect();
    keys.dedup();
    keys
}

/// Every change of an object reconciles that object
#[derive(Debug, Default)]
pub struct SelfRouter;

impl<K: ClusterResource> EventRouter<K> for SelfRouter {
    fn route(&self, event: &ObjectEvent<K>) -> Vec<ObjectKey> {
        vec![ObjectKey::from_resource(current(event))]
    }
}

/// Environment changes re-enqueue the Tenant named in `spec.tenant`, on
/// update both the old and the new one.
#[derive(Debug, Default)]
pub struct EnvironmentToTenant;

impl EventRouter<Environment> for EnvironmentToTenant {
    fn route(&self, event: &ObjectEvent<Environment>) -> Vec<ObjectKey> {
        match event {
            ObjectEvent::Created(env) | ObjectEvent::Deleted(env) => tenant_spec_key(env).into_iter().collect(),
            ObjectEvent::Updated { old, new } => both_tenants(old, new),
        }
    }
}

/// Environment changes that alter the governed namespace set re-enqueue
/// the tenant's TenantNetworkPolicy
#[derive(Debug, Default)]
pub struct EnvironmentToNetworkPolicy;

impl EventRouter<Environment> for EnvironmentToNetworkPolicy {
    fn route(&self, event: &ObjectEvent<Environment>) -> Vec<ObjectKey> {
        match event {
            ObjectEvent::Created(env) | ObjectEvent::Deleted(env) => tenant_spec_key(env).into_iter().collect(),
            ObjectEvent::Updated { old, new } => {
                let moved = old.spec.tenant != new.spec.tenant
                    || old.spec.namespace != new.spec.namespace
                    || old.spec.project != new.spec.project
                    || old.metadata.deletion_timestamp.is_none() != new.metadata.deletion_timestamp.is_none();
                if moved { both_tenants(old, new) } else { Vec::new() }
            }
        }
    }
}

/// Nodes joining or leaving re-enqueue every TenantNetworkPolicy
pub struct NodeToNetworkPolicies {
    policies: Arc<Store<TenantNetworkPolicy>>,
}

impl NodeToNetworkPolicies {
    pub fn new(policies: Arc<Store<TenantNetworkPolicy>>) -> Self {
        Self { policies }
    }
}

impl EventRouter<Node> for NodeToNetworkPolicies {
    fn route(&self, event: &ObjectEvent<Node>) -> Vec<ObjectKey> {
        match event {
            ObjectEvent::Created(_) | ObjectEvent::Deleted(_) => self.policies.keys(),
            ObjectEvent::Updated { .. } => Vec::new(),
        }
    }
}

/// Changes to a generated NetworkPolicy re-enqueue the TenantNetworkPolicy
/// of its tenant label, so drift and deletions are repaired. Updates that
/// leave spec and labels alone are ignored.
#[derive(Debug, Default)]
pub struct NetworkPolicyToTenantPolicy;

impl EventRouter<NetworkPolicy> for NetworkPolicyToTenantPolicy {
    fn route(&self, event: &ObjectEvent<NetworkPolicy>) -> Vec<ObjectKey> {
        match event {
            ObjectEvent::Created(np) | ObjectEvent::Deleted(np) => tenant_label_key(np.as_ref()).into_iter().collect(),
            ObjectEvent::Updated { old, new } => {
                if old.spec == new.spec && old.labels() == new.labels() {
                    return Vec::new();
                }
                let mut keys: Vec<ObjectKey> = tenant_label_key(old.as_ref())
                    .into_iter()
                    .chain(tenant_label_key(new.as_ref()))
                    .collect();
                keys.dedup();
                keys
            }
        }
    }
}

/// Feeds CRD changes into the component flags. A component appearing or
/// going away re-enqueues every TenantNetworkPolicy, whose ingress rules
/// depend on it.
pub struct ComponentChangeToNetworkPolicies {
    plugins: Arc<PluginStatus>,
    policies: Arc<Store<TenantNetworkPolicy>>,
    queue: WorkQueue,
}

impl ComponentChangeToNetworkPolicies {
    pub fn new(plugins: Arc<PluginStatus>, policies: Arc<Store<TenantNetworkPolicy>>, queue: WorkQueue) -> Arc<Self> {
        Arc::new(Self {
            plugins,
            policies,
            queue,
        })
    }
}

impl EventHandler<CustomResourceDefinition> for ComponentChangeToNetworkPolicies {
    fn handle(&self, event: &ObjectEvent<CustomResourceDefinition>) {
        if !self.plugins.apply(event) {
            return;
        }
        for key in self.policies.keys() {
            trace!(route = "crd-networkpolicy", key = %key, "Enqueue");
            self.queue.add(key);
        }
    }
}

fn quota_status_changed(old: Option<&ResourceQuotaStatus>, new: Option<&ResourceQuotaStatus>) -> bool {
    let hard = |s: Option<&ResourceQuotaStatus>| quantity::from_native(s.and_then(|s| s.hard.as_ref()));
    let used = |s: Option<&ResourceQuotaStatus>| quantity::from_native(s.and_then(|s| s.used.as_ref()));
    !quantity::semantic_eq(&hard(old), &hard(new)) || !quantity::semantic_eq(&used(old), &used(new))
}

/// Namespace quota changes re-enqueue the TenantResourceQuota named by the
/// tenant label. Updates only count when `status` changed.
#[derive(Debug, Default)]
pub struct ResourceQuotaToTenantQuota;

impl EventRouter<ResourceQuota> for ResourceQuotaToTenantQuota {
    fn route(&self, event: &ObjectEvent<ResourceQuota>) -> Vec<ObjectKey> {
        match event {
            ObjectEvent::Created(rq) | ObjectEvent::Deleted(rq) => tenant_label_key(rq.as_ref()).into_iter().collect(),
            ObjectEvent::Updated { old, new } => {
                if !quota_status_changed(old.status.as_ref(), new.status.as_ref()) {
                    return Vec::new();
                }
                // A relabeled quota leaves the old tenant's sum as well
                let mut keys: Vec<ObjectKey> = tenant_label_key(old.as_ref())
                    .into_iter()
                    .chain(tenant_label_key(new.as_ref()))
                    .collect();
                keys.dedup();
                keys
            }
        }
    }
}

/// Creation, deletion or a status change of a tenant-owned object
/// re-enqueues its Tenant
#[derive(Debug)]
pub struct TenantChildToTenant<K> {
    _kind: PhantomData<fn(K)>,
}

impl<K> Default for TenantChildToTenant<K> {
    fn default() -> Self {
        Self { _kind: PhantomData }
    }
}

fn status_of<K: ClusterResource>(obj: &K) -> Option<serde_json::Value> {
    serde_json::to_value(obj).ok().and_then(|mut v| v.get_mut("status").map(serde_json::Value::take))
}

impl<K: ClusterResource> EventRouter<K> for TenantChildToTenant<K> {
    fn route(&self, event: &ObjectEvent<K>) -> Vec<ObjectKey> {
        match event {
            ObjectEvent::Created(obj) | ObjectEvent::Deleted(obj) => tenant_label_key(obj.as_ref()).into_iter().collect(),
            ObjectEvent::Updated { old, new } => {
                if status_of(old.as_ref()) == status_of(new.as_ref()) {
                    Vec::new()
                } else {
                    tenant_label_key(new.as_ref()).into_iter().collect()
                }
            }
        }
    }
}
