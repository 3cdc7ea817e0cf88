//! Tenant reconciliation.
//!
//! An active Tenant gets its four cleanup finalizers, a TenantResourceQuota
//! and a TenantNetworkPolicy of the same name, and a status listing the
//! environments and namespaces labeled with it.
//!
//! Deletion runs in a fixed order, one finalizer per step, and persists
//! after every step so a restart resumes where it stopped:
//! environments, resource quota, network policy, gateways.

use super::Context;
use crate::error::ControllerError;
use crate::events::{actions, reasons};
use crate::reconcile_helpers::{
    WriteTarget, add_finalizers, has_finalizer, has_owner_ref, is_deleting, labels_changed,
    merge_labels, owner_reference, remove_finalizer, set_owner_ref, string_sets_equal,
    update_with_retry,
};
use crate::runner::{Action, Reconcile};
use async_trait::async_trait;
use chrono::Utc;
use cluster_client::{ClusterClient, ClusterResource, LabelSelector, ObjectKey};
use crds::{
    DeletePolicy, Environment, FINALIZER_ENVIRONMENT, FINALIZER_GATEWAY, FINALIZER_NETWORK_POLICY,
    FINALIZER_RESOURCE_QUOTA, LABEL_TENANT, TENANT_FINALIZERS, Tenant, TenantGateway,
    TenantNetworkPolicy, TenantNetworkPolicySpec, TenantResourceQuota, TenantResourceQuotaSpec,
    default_tenant_quota,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Re-check interval while child environments finish their own cleanup
const ENVIRONMENT_CLEANUP_POLL: Duration = Duration::from_secs(5);

fn tenant_labels(tenant: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(LABEL_TENANT.to_string(), tenant.to_string())])
}

/// The TenantResourceQuota a new tenant starts with
pub fn default_resource_quota(tenant: &str, owner: &OwnerReference) -> TenantResourceQuota {
    let mut quota = TenantResourceQuota::new(
        tenant,
        TenantResourceQuotaSpec {
            hard: default_tenant_quota(),
        },
    );
    quota.metadata.labels = Some(tenant_labels(tenant));
    quota.metadata.owner_references = Some(vec![owner.clone()]);
    quota
}

/// The TenantNetworkPolicy a new tenant starts with: isolation off
pub fn default_network_policy(tenant: &str, owner: &OwnerReference) -> TenantNetworkPolicy {
    let mut policy = TenantNetworkPolicy::new(
        tenant,
        TenantNetworkPolicySpec {
            tenant: tenant.to_string(),
            tenant_isolated: false,
            ..Default::default()
        },
    );
    policy.metadata.labels = Some(tenant_labels(tenant));
    policy.metadata.owner_references = Some(vec![owner.clone()]);
    policy
}

/// Reconciles Tenant objects
#[derive(Debug)]
pub struct TenantReconciler<C> {
    ctx: Context<C>,
}

impl<C: ClusterClient + 'static> TenantReconciler<C> {
    pub fn new(ctx: Context<C>) -> Self {
        Self { ctx }
    }

    async fn reconcile_active(&self, tenant: Tenant) -> Result<Action, ControllerError> {
        let name = tenant.name_any();
        let Some(tenant) = self.ensure_finalizers(tenant).await? else {
            return Ok(Action::AwaitChange);
        };
        if is_deleting(&tenant.metadata) {
            return self.cleanup(tenant).await;
        }
        let owner = owner_reference(&tenant)?;

        self.ensure_owned(&tenant, &owner, default_resource_quota(&name, &owner))
            .await?;
        self.ensure_owned(&tenant, &owner, default_network_policy(&name, &owner))
            .await?;
        self.sync_status(&tenant).await?;
        Ok(Action::AwaitChange)
    }

    /// Add every missing cleanup finalizer in a single write
    async fn ensure_finalizers(&self, tenant: Tenant) -> Result<Option<Tenant>, ControllerError> {
        if TENANT_FINALIZERS
            .iter()
            .all(|f| has_finalizer(&tenant.metadata, f))
        {
            return Ok(Some(tenant));
        }
        let key = ObjectKey::from_resource(&tenant);
        update_with_retry(&self.ctx.client, &key, WriteTarget::Object, |t: &mut Tenant| {
            !is_deleting(&t.metadata) && add_finalizers(&mut t.metadata, &TENANT_FINALIZERS)
        })
        .await
    }

    /// Create `desired` when missing; otherwise repair its owner reference
    /// and tenant label. Spec fields of an existing child are left alone.
    async fn ensure_owned<K>(&self, tenant: &Tenant, owner: &OwnerReference, desired: K) -> Result<(), ControllerError>
    where
        K: ClusterResource,
    {
        let kind = K::kind(&()).into_owned();
        let key = ObjectKey::from_resource(&desired);
        let labels = tenant_labels(&tenant.name_any());

        let Some(existing) = self.ctx.client.get::<K>(&key).await? else {
            return match self.ctx.client.create(&desired).await {
                Ok(_) => {
                    info!(kind = %kind, key = %key, "Created tenant sub-resource");
                    self.ctx
                        .normal(tenant, reasons::CREATED, actions::RECONCILE, format!("Created {} {}", kind, key))
                        .await;
                    Ok(())
                }
                Err(e) => {
                    self.ctx
                        .warning(
                            tenant,
                            reasons::FAILED_CREATE_SUB_RESOURCE,
                            actions::RECONCILE,
                            format!("Failed to create {} {}: {}", kind, key, e),
                        )
                        .await;
                    Err(e.into())
                }
            };
        };

        let drifted = |obj: &K| {
            !has_owner_ref(obj.meta(), owner) || labels_changed(obj.meta().labels.as_ref(), &labels)
        };
        if is_deleting(existing.meta()) || !drifted(&existing) {
            return Ok(());
        }

        let updated = update_with_retry(&self.ctx.client, &key, WriteTarget::Object, |obj: &mut K| {
            if !drifted(obj) {
                return false;
            }
            set_owner_ref(obj.meta_mut(), owner);
            merge_labels(obj.meta_mut(), &labels);
            true
        })
        .await;
        match updated {
            Ok(_) => {
                self.ctx
                    .normal(tenant, reasons::UPDATED, actions::RECONCILE, format!("Updated {} {}", kind, key))
                    .await;
                Ok(())
            }
            Err(e) => {
                self.ctx
                    .warning(
                        tenant,
                        reasons::FAILED_UPDATE,
                        actions::RECONCILE,
                        format!("Failed to update {} {}: {}", kind, key, e),
                    )
                    .await;
                Err(e)
            }
        }
    }

    /// Recompute the environment and namespace lists; write only on change
    async fn sync_status(&self, tenant: &Tenant) -> Result<(), ControllerError> {
        let name = tenant.name_any();
        let environments: Vec<Environment> = self
            .ctx
            .client
            .list(None, &LabelSelector::label(LABEL_TENANT, &name))
            .await?;
        let env_names: Vec<String> = environments.iter().map(ResourceExt::name_any).collect();
        let namespaces: Vec<String> = environments
            .iter()
            .map(|e| e.spec.namespace.clone())
            .filter(|ns| !ns.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let unchanged = |t: &Tenant| {
            let current = t.status.clone().unwrap_or_default();
            string_sets_equal(&current.environments, &env_names)
                && string_sets_equal(&current.namespaces, &namespaces)
        };
        if unchanged(tenant) {
            return Ok(());
        }

        let key = ObjectKey::from_resource(tenant);
        update_with_retry(&self.ctx.client, &key, WriteTarget::Status, |t: &mut Tenant| {
            if unchanged(t) {
                return false;
            }
            let status = t.status.get_or_insert_with(Default::default);
            status.environments = env_names.clone();
            status.namespaces = namespaces.clone();
            status.last_update_time = Some(Utc::now());
            true
        })
        .await?;
        debug!(tenant = %name, environments = env_names.len(), "Tenant status updated");
        Ok(())
    }

    async fn cleanup(&self, tenant: Tenant) -> Result<Action, ControllerError> {
        let name = tenant.name_any();
        let key = ObjectKey::from_resource(&tenant);
        let selector = LabelSelector::label(LABEL_TENANT, &name);
        let mut tenant = tenant;

        if has_finalizer(&tenant.metadata, FINALIZER_ENVIRONMENT) {
            let environments: Vec<Environment> = self.ctx.client.list(None, &selector).await?;
            if !environments.is_empty() {
                // An environment with an unknown delete policy never releases
                // its finalizer; waiting on it would poll forever
                if let Some(stuck) = environments
                    .iter()
                    .find(|e| is_deleting(&e.metadata) && matches!(e.spec.delete_policy, DeletePolicy::Other(_)))
                {
                    return Err(ControllerError::InvalidResource {
                        object: name.clone(),
                        reason: format!(
                            "environment {} cannot be cleaned up: unknown deletePolicy \"{}\"",
                            stuck.name_any(),
                            stuck.spec.delete_policy
                        ),
                    });
                }
                for env in environments.iter().filter(|e| !is_deleting(&e.metadata)) {
                    self.delete_child::<Environment>(&tenant, &ObjectKey::from_resource(env))
                        .await?;
                }
                debug!(tenant = %name, remaining = environments.len(), "Waiting for environments to clean up");
                return Ok(Action::RequeueAfter(ENVIRONMENT_CLEANUP_POLL));
            }
            let Some(t) = self.drop_finalizer(&key, FINALIZER_ENVIRONMENT).await? else {
                return Ok(Action::AwaitChange);
            };
            tenant = t;
        }

        if has_finalizer(&tenant.metadata, FINALIZER_RESOURCE_QUOTA) {
            self.release_and_delete::<TenantResourceQuota>(&tenant, &key).await?;
            let Some(t) = self.drop_finalizer(&key, FINALIZER_RESOURCE_QUOTA).await? else {
                return Ok(Action::AwaitChange);
            };
            tenant = t;
        }

        if has_finalizer(&tenant.metadata, FINALIZER_NETWORK_POLICY) {
            self.release_and_delete::<TenantNetworkPolicy>(&tenant, &key).await?;
            let Some(t) = self.drop_finalizer(&key, FINALIZER_NETWORK_POLICY).await? else {
                return Ok(Action::AwaitChange);
            };
            tenant = t;
        }

        if has_finalizer(&tenant.metadata, FINALIZER_GATEWAY) {
            let gateways: Vec<TenantGateway> = self.ctx.client.list(None, &selector).await?;
            for gateway in &gateways {
                self.delete_child::<TenantGateway>(&tenant, &ObjectKey::from_resource(gateway))
                    .await?;
            }
            self.drop_finalizer(&key, FINALIZER_GATEWAY).await?;
        }

        info!(tenant = %name, "Tenant cleanup finished");
        Ok(Action::AwaitChange)
    }

    async fn drop_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<Option<Tenant>, ControllerError> {
        update_with_retry(&self.ctx.client, key, WriteTarget::Object, |t: &mut Tenant| {
            remove_finalizer(&mut t.metadata, finalizer)
        })
        .await
    }

    async fn delete_child<K: ClusterResource>(&self, tenant: &Tenant, key: &ObjectKey) -> Result<(), ControllerError> {
        let kind = K::kind(&());
        match self.ctx.client.delete::<K>(key).await {
            Ok(()) => {
                self.ctx
                    .normal(tenant, reasons::DELETED, actions::CLEANUP, format!("Deleted {} {}", kind, key))
                    .await;
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
                self.ctx
                    .warning(
                        tenant,
                        reasons::FAILED_DELETE,
                        actions::CLEANUP,
                        format!("Failed to delete {} {}: {}", kind, key, e),
                    )
                    .await;
                Err(e.into())
            }
        }
    }

    /// Clear owner references, then request deletion. The child's own
    /// finalizers (if any) are retired by its reconciler.
    async fn release_and_delete<K: ClusterResource>(&self, tenant: &Tenant, key: &ObjectKey) -> Result<(), ControllerError> {
        let released = update_with_retry(&self.ctx.client, key, WriteTarget::Object, |obj: &mut K| {
            obj.meta_mut().owner_references.take().is_some()
        })
        .await;
        match released {
            Ok(None) => Ok(()),
            Ok(Some(_)) => self.delete_child::<K>(tenant, key).await,
            Err(e) => {
                self.ctx
                    .warning(
                        tenant,
                        reasons::FAILED_DELETE,
                        actions::CLEANUP,
                        format!("Failed to release {} {}: {}", K::kind(&()), key, e),
                    )
                    .await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl<C: ClusterClient + 'static> Reconcile for TenantReconciler<C> {
    fn kind(&self) -> &'static str {
        "Tenant"
    }

    #[instrument(skip(self), fields(tenant = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ControllerError> {
        let Some(tenant) = self.ctx.client.get::<Tenant>(key).await? else {
            debug!("Tenant no longer exists");
            return Ok(Action::AwaitChange);
        };
        if is_deleting(&tenant.metadata) {
            self.cleanup(tenant).await
        } else {
            self.reconcile_active(tenant).await
        }
    }
}

#[cfg(test)]
#[path = "tenant_test.rs"]
mod tests;
