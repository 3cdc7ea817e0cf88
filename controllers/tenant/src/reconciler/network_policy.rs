//! TenantNetworkPolicy reconciliation.
//!
//! Isolation is expressed as native NetworkPolicies, one per scope and
//! environment namespace:
//!
//! - `kuber-tenant-<tenant>` when the tenant is isolated
//! - `kuber-project-<project>` for every listed project
//! - `kuber-env-<environment>` for every listed environment
//!
//! Each selects all pods of its namespace and admits ingress only from
//! namespaces carrying the same scope labels, plus the gateway and mesh
//! namespaces when those components are installed. Every generated policy is
//! labeled with the tenant; tenant-labeled policies outside the desired set
//! are deleted.

use super::Context;
use crate::error::ControllerError;
use crate::events::{actions, reasons};
use crate::plugin_status::Component;
use crate::reconcile_helpers::{
    WriteTarget, add_finalizers, has_finalizer, has_owner_ref, is_deleting, labels_changed,
    merge_labels, owner_reference, set_owner_ref, update_with_retry,
};
use crate::runner::{Action, Reconcile};
use async_trait::async_trait;
use cluster_client::{ClusterClient, LabelSelector, ObjectKey, ignore_not_found};
use crds::{
    Environment, FINALIZER_NETWORK_POLICY, LABEL_ENVIRONMENT, LABEL_PROJECT, LABEL_TENANT,
    TenantNetworkPolicy,
};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};

/// Namespace of the tenant ingress gateways
pub const GATEWAY_NAMESPACE: &str = "kuber-gateway";
/// Namespace of the service mesh control plane
pub const MESH_NAMESPACE: &str = "istio-system";

const NAMESPACE_NAME_LABEL: &str = "kubernetes.io/metadata.name";

/// Namespaces admitted in addition to the scope itself
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewayPeers {
    pub ingress: bool,
    pub mesh: bool,
}

/// One step towards the desired set of NetworkPolicies
#[derive(Debug, Clone)]
pub enum NpAction {
    Create(NetworkPolicy),
    /// Existing object with the desired spec, labels and owner applied
    Update(NetworkPolicy),
    Delete(ObjectKey),
}

impl NpAction {
    pub fn key(&self) -> ObjectKey {
        match self {
            NpAction::Create(np) | NpAction::Update(np) => ObjectKey::from_resource(np),
            NpAction::Delete(key) => key.clone(),
        }
    }
}

/// Tenant a policy object belongs to: its tenant label, else `spec.tenant`
fn tenant_of(tnp: &TenantNetworkPolicy) -> Result<String, ControllerError> {
    tnp.labels()
        .get(LABEL_TENANT)
        .filter(|t| !t.is_empty())
        .cloned()
        .or_else(|| (!tnp.spec.tenant.is_empty()).then(|| tnp.spec.tenant.clone()))
        .ok_or_else(|| ControllerError::MissingLabel {
            object: tnp.name_any(),
            label: LABEL_TENANT.to_string(),
        })
}

fn build_policy(
    name: String,
    namespace: &str,
    scope: BTreeMap<String, String>,
    peers: GatewayPeers,
    owner: &OwnerReference,
) -> Result<NetworkPolicy, ControllerError> {
    let mut from = vec![json!({ "namespaceSelector": { "matchLabels": &scope } })];
    if peers.ingress {
        from.push(json!({ "namespaceSelector": { "matchLabels": { NAMESPACE_NAME_LABEL: GATEWAY_NAMESPACE } } }));
    }
    if peers.mesh {
        from.push(json!({ "namespaceSelector": { "matchLabels": { NAMESPACE_NAME_LABEL: MESH_NAMESPACE } } }));
    }
    let policy = json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "NetworkPolicy",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": scope,
            "ownerReferences": [owner],
        },
        "spec": {
            "podSelector": {},
            "policyTypes": ["Ingress"],
            "ingress": [{ "from": from }],
        },
    });
    Ok(serde_json::from_value(policy)?)
}

/// NetworkPolicies implied by `tnp` for the tenant's live environments
pub fn desired_policies(
    tnp: &TenantNetworkPolicy,
    tenant: &str,
    environments: &[Environment],
    peers: GatewayPeers,
    owner: &OwnerReference,
) -> Result<BTreeMap<ObjectKey, NetworkPolicy>, ControllerError> {
    let mut desired = BTreeMap::new();
    for env in environments {
        let namespace = env.spec.namespace.as_str();
        if namespace.is_empty() || is_deleting(&env.metadata) {
            continue;
        }
        let env_name = env.name_any();
        let project = env.spec.project.as_str();
        let mut scope = BTreeMap::from([(LABEL_TENANT.to_string(), tenant.to_string())]);

        if tnp.spec.tenant_isolated {
            let np = build_policy(format!("kuber-tenant-{}", tenant), namespace, scope.clone(), peers, owner)?;
            desired.insert(ObjectKey::from_resource(&np), np);
        }

        scope.insert(LABEL_PROJECT.to_string(), project.to_string());
        if tnp.spec.project_network_policies.iter().any(|p| p.name == project) {
            let np = build_policy(format!("kuber-project-{}", project), namespace, scope.clone(), peers, owner)?;
            desired.insert(ObjectKey::from_resource(&np), np);
        }

        scope.insert(LABEL_ENVIRONMENT.to_string(), env_name.clone());
        let env_listed = tnp
            .spec
            .environment_network_policies
            .iter()
            .any(|e| e.name == env_name && (e.project.is_empty() || e.project == project));
        if env_listed {
            let np = build_policy(format!("kuber-env-{}", env_name), namespace, scope, peers, owner)?;
            desired.insert(ObjectKey::from_resource(&np), np);
        }
    }
    Ok(desired)
}

fn spec_differs(a: &NetworkPolicy, b: &NetworkPolicy) -> bool {
    serde_json::to_value(&a.spec).ok() != serde_json::to_value(&b.spec).ok()
}

/// Actions turning `existing` into `desired`, in key order: creates and
/// updates first, then deletes.
pub fn plan_network_policies(
    desired: &BTreeMap<ObjectKey, NetworkPolicy>,
    existing: &[NetworkPolicy],
) -> Vec<NpAction> {
    let existing: BTreeMap<ObjectKey, &NetworkPolicy> =
        existing.iter().map(|np| (ObjectKey::from_resource(np), np)).collect();

    let mut plan = Vec::new();
    for (key, want) in desired {
        let Some(have) = existing.get(key) else {
            plan.push(NpAction::Create(want.clone()));
            continue;
        };
        let labels = want.metadata.labels.clone().unwrap_or_default();
        let owner_missing = want
            .metadata
            .owner_references
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|owner| !has_owner_ref(&have.metadata, owner));
        if spec_differs(want, have) || labels_changed(have.metadata.labels.as_ref(), &labels) || owner_missing {
            let mut updated = (*have).clone();
            updated.spec = want.spec.clone();
            merge_labels(&mut updated.metadata, &labels);
            for owner in want.metadata.owner_references.as_deref().unwrap_or_default() {
                set_owner_ref(&mut updated.metadata, owner);
            }
            plan.push(NpAction::Update(updated));
        }
    }
    plan.extend(
        existing
            .keys()
            .filter(|key| !desired.contains_key(*key))
            .map(|key| NpAction::Delete(key.clone())),
    );
    plan
}

/// Reconciles TenantNetworkPolicy objects
#[derive(Debug)]
pub struct TenantNetworkPolicyReconciler<C> {
    ctx: Context<C>,
}

impl<C: ClusterClient + 'static> TenantNetworkPolicyReconciler<C> {
    pub fn new(ctx: Context<C>) -> Self {
        Self { ctx }
    }

    async fn gateway_peers(&self) -> GatewayPeers {
        GatewayPeers {
            ingress: self.ctx.plugins.component_enabled(Component::Nginx).await,
            mesh: self.ctx.plugins.component_enabled(Component::Istio).await,
        }
    }

    async fn reconcile_active(&self, tnp: TenantNetworkPolicy) -> Result<Action, ControllerError> {
        let tenant = tenant_of(&tnp)?;
        let owner = owner_reference(&tnp)?;
        let peers = self.gateway_peers().await;

        let selector = LabelSelector::label(LABEL_TENANT, &tenant);
        let environments: Vec<Environment> = self.ctx.client.list(None, &selector).await?;
        let existing: Vec<NetworkPolicy> = self.ctx.client.list(None, &selector).await?;
        let desired = desired_policies(&tnp, &tenant, &environments, peers, &owner)?;

        let plan = plan_network_policies(&desired, &existing);
        if plan.is_empty() {
            debug!(tenant = %tenant, policies = desired.len(), "Network policies up to date");
        }
        let mut first_error = None;
        for action in plan {
            if let Err(e) = self.apply(&tnp, action).await {
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        if !has_finalizer(&tnp.metadata, FINALIZER_NETWORK_POLICY) {
            let key = ObjectKey::from_resource(&tnp);
            update_with_retry(&self.ctx.client, &key, WriteTarget::Object, |t: &mut TenantNetworkPolicy| {
                !is_deleting(&t.metadata) && add_finalizers(&mut t.metadata, &[FINALIZER_NETWORK_POLICY])
            })
            .await?;
        }
        Ok(Action::AwaitChange)
    }

    async fn apply(&self, tnp: &TenantNetworkPolicy, action: NpAction) -> Result<(), ControllerError> {
        let key = action.key();
        let (result, reason, failure, verb) = match action {
            NpAction::Create(np) => (
                self.ctx.client.create(&np).await.map(|_| ()),
                reasons::CREATED,
                reasons::FAILED_CREATE,
                "create",
            ),
            NpAction::Update(np) => (
                self.ctx.client.replace(&np).await.map(|_| ()),
                reasons::UPDATED,
                reasons::FAILED_UPDATE,
                "update",
            ),
            NpAction::Delete(key) => (
                ignore_not_found(self.ctx.client.delete::<NetworkPolicy>(&key).await).map(|_| ()),
                reasons::DELETED,
                reasons::FAILED_DELETE,
                "delete",
            ),
        };
        match result {
            // The policy cache lagged behind an earlier create; its watch
            // event re-enqueues this policy
            Err(e) if e.is_already_exists() => {
                debug!(policy = %key, "NetworkPolicy already exists");
                Ok(())
            }
            Ok(()) => {
                info!(policy = %key, "NetworkPolicy {}d", verb);
                self.ctx
                    .normal(tnp, reason, actions::RECONCILE, format!("NetworkPolicy {} {}d", key, verb))
                    .await;
                Ok(())
            }
            Err(e) => {
                warn!(policy = %key, error = %e, "Failed to {} NetworkPolicy", verb);
                self.ctx
                    .warning(
                        tnp,
                        failure,
                        actions::RECONCILE,
                        format!("Failed to {} NetworkPolicy {}: {}", verb, key, e),
                    )
                    .await;
                Err(e.into())
            }
        }
    }

    async fn cleanup(&self, tnp: TenantNetworkPolicy) -> Result<Action, ControllerError> {
        let tenant = tenant_of(&tnp)?;
        let policies: Vec<NetworkPolicy> = self
            .ctx
            .client
            .list(None, &LabelSelector::label(LABEL_TENANT, &tenant))
            .await?;
        for np in &policies {
            let key = ObjectKey::from_resource(np);
            if let Err(e) = ignore_not_found(self.ctx.client.delete::<NetworkPolicy>(&key).await) {
                self.ctx
                    .warning(
                        &tnp,
                        reasons::FAILED_DELETE,
                        actions::CLEANUP,
                        format!("Failed to delete NetworkPolicy {}: {}", key, e),
                    )
                    .await;
                return Err(e.into());
            }
        }
        if !policies.is_empty() {
            self.ctx
                .normal(
                    &tnp,
                    reasons::DELETED,
                    actions::CLEANUP,
                    format!("Deleted {} NetworkPolicies of tenant {}", policies.len(), tenant),
                )
                .await;
        }

        let key = ObjectKey::from_resource(&tnp);
        update_with_retry(&self.ctx.client, &key, WriteTarget::Object, |t: &mut TenantNetworkPolicy| {
            let released = t.metadata.owner_references.take().is_some();
            let finalized = t.metadata.finalizers.take().is_some_and(|f| !f.is_empty());
            released || finalized
        })
        .await?;
        info!(tenant = %tenant, "TenantNetworkPolicy cleanup finished");
        Ok(Action::AwaitChange)
    }
}

#[async_trait]
impl<C: ClusterClient + 'static> Reconcile for TenantNetworkPolicyReconciler<C> {
    fn kind(&self) -> &'static str {
        "TenantNetworkPolicy"
    }

    #[instrument(skip(self), fields(policy = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ControllerError> {
        let Some(tnp) = self.ctx.client.get::<TenantNetworkPolicy>(key).await? else {
            debug!("TenantNetworkPolicy no longer exists");
            return Ok(Action::AwaitChange);
        };
        if is_deleting(&tnp.metadata) {
            self.cleanup(tnp).await
        } else {
            self.reconcile_active(tnp).await
        }
    }
}

#[cfg(test)]
#[path = "network_policy_test.rs"]
mod tests;
