//! Environment reconciliation.
//!
//! An Environment binds one namespace to a tenant and project. While active
//! the namespace carries the tenant/project/environment labels and a
//! controller reference to the Environment, and gets a native ResourceQuota
//! and a `default` LimitRange when the Environment declares them. On
//! deletion the `deletePolicy` decides whether the namespace is stripped of
//! those labels or deleted.

use super::Context;
use crate::error::ControllerError;
use crate::events::{actions, reasons};
use crate::quantity::{self, from_native, to_native};
use crate::reconcile_helpers::{
    WriteTarget, add_finalizers, controlled_by_other, delete_labels, has_finalizer, has_owner_ref,
    is_deleting, labels_changed, merge_labels, owner_reference, remove_finalizer, set_owner_ref,
    update_with_retry,
};
use crate::runner::{Action, Reconcile};
use async_trait::async_trait;
use cluster_client::{ClusterClient, ClusterResource, ObjectKey, ignore_not_found};
use crds::{
    DEFAULT_LIMIT_RANGE_NAME, DeletePolicy, Environment, FINALIZER_NAMESPACE, LABEL_ENVIRONMENT,
    LABEL_PROJECT, LABEL_TENANT, LimitRangeItem, ResourceList, SCOPE_LABELS,
};
use k8s_openapi::api::core::v1::{
    LimitRange, LimitRangeItem as NativeLimitRangeItem, LimitRangeSpec, Namespace, ResourceQuota,
    ResourceQuotaSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity as NativeQuantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Re-check interval while the target namespace is still terminating
const NAMESPACE_TERMINATING_POLL: Duration = Duration::from_secs(5);

/// Labels marking a namespace as belonging to `env`
pub fn scope_labels(env: &Environment) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_TENANT.to_string(), env.spec.tenant.clone()),
        (LABEL_PROJECT.to_string(), env.spec.project.clone()),
        (LABEL_ENVIRONMENT.to_string(), env.name_any()),
    ])
}

fn native_limit(item: &LimitRangeItem) -> NativeLimitRangeItem {
    let list = |l: &Option<ResourceList>| l.as_ref().map(to_native);
    NativeLimitRangeItem {
        type_: item.type_.clone(),
        max: list(&item.max),
        min: list(&item.min),
        default: list(&item.default),
        default_request: list(&item.default_request),
        max_limit_request_ratio: list(&item.max_limit_request_ratio),
    }
}

/// Item-by-item comparison by quantity value
fn limits_match(current: &[NativeLimitRangeItem], desired: &[LimitRangeItem]) -> bool {
    let same = |native: &Option<BTreeMap<String, NativeQuantity>>, wanted: &Option<ResourceList>| {
        quantity::semantic_eq(&from_native(native.as_ref()), wanted.as_ref().unwrap_or(&ResourceList::new()))
    };
    current.len() == desired.len()
        && current.iter().zip(desired).all(|(c, d)| {
            c.type_ == d.type_
                && same(&c.max, &d.max)
                && same(&c.min, &d.min)
                && same(&c.default, &d.default)
                && same(&c.default_request, &d.default_request)
                && same(&c.max_limit_request_ratio, &d.max_limit_request_ratio)
        })
}

/// Labels linking `env` to its tenant and project
pub fn ownership_labels(env: &Environment) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_TENANT.to_string(), env.spec.tenant.clone()),
        (LABEL_PROJECT.to_string(), env.spec.project.clone()),
    ])
}

/// Reconciles Environment objects
#[derive(Debug)]
pub struct EnvironmentReconciler<C> {
    ctx: Context<C>,
}

impl<C: ClusterClient + 'static> EnvironmentReconciler<C> {
    pub fn new(ctx: Context<C>) -> Self {
        Self { ctx }
    }

    async fn reconcile_active(&self, env: Environment) -> Result<Action, ControllerError> {
        if env.spec.namespace.is_empty() {
            return Err(ControllerError::InvalidResource {
                object: env.name_any(),
                reason: "spec.namespace is empty".to_string(),
            });
        }

        let Some(env) = self.ensure_metadata(env).await? else {
            return Ok(Action::AwaitChange);
        };
        if is_deleting(&env.metadata) {
            return self.cleanup(env).await;
        }

        let owner = owner_reference(&env)?;
        let labels = scope_labels(&env);
        if !self.ensure_namespace(&env, &owner, &labels).await? {
            debug!(namespace = %env.spec.namespace, "Namespace is terminating, waiting");
            return Ok(Action::RequeueAfter(NAMESPACE_TERMINATING_POLL));
        }
        if let Some(hard) = &env.spec.resource_quota {
            self.ensure_resource_quota(&env, hard, &labels).await?;
        }
        if !env.spec.limit_range.is_empty() {
            self.ensure_limit_range(&env, &env.spec.limit_range, &labels).await?;
        }
        Ok(Action::AwaitChange)
    }

    /// Add the namespace finalizer and mirror `spec.tenant` / `spec.project`
    /// into the labels tenants select their environments by.
    async fn ensure_metadata(&self, env: Environment) -> Result<Option<Environment>, ControllerError> {
        let labels = ownership_labels(&env);
        let settled = |e: &Environment| {
            has_finalizer(&e.metadata, FINALIZER_NAMESPACE) && !labels_changed(e.metadata.labels.as_ref(), &labels)
        };
        if settled(&env) {
            return Ok(Some(env));
        }
        let key = ObjectKey::from_resource(&env);
        update_with_retry(&self.ctx.client, &key, WriteTarget::Object, |e: &mut Environment| {
            if is_deleting(&e.metadata) || settled(e) {
                return false;
            }
            add_finalizers(&mut e.metadata, &[FINALIZER_NAMESPACE]);
            merge_labels(&mut e.metadata, &labels);
            true
        })
        .await
    }

    /// Returns `false` while the namespace is being deleted
    async fn ensure_namespace(
        &self,
        env: &Environment,
        owner: &OwnerReference,
        labels: &BTreeMap<String, String>,
    ) -> Result<bool, ControllerError> {
        let name = &env.spec.namespace;
        let key = ObjectKey::cluster(name);

        let Some(existing) = self.ctx.client.get::<Namespace>(&key).await? else {
            let namespace = Namespace {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    labels: Some(labels.clone()),
                    owner_references: Some(vec![owner.clone()]),
                    ..Default::default()
                },
                ..Default::default()
            };
            return match self.ctx.client.create(&namespace).await {
                Ok(_) => {
                    info!(namespace = %name, "Created environment namespace");
                    self.ctx
                        .normal(env, reasons::CREATED, actions::RECONCILE, format!("Created namespace {}", name))
                        .await;
                    Ok(true)
                }
                Err(e) => {
                    self.ctx
                        .warning(
                            env,
                            reasons::FAILED_CREATE,
                            actions::RECONCILE,
                            format!("Failed to create namespace {}: {}", name, e),
                        )
                        .await;
                    Err(e.into())
                }
            };
        };

        if is_deleting(&existing.metadata) {
            return Ok(false);
        }
        if let Some(other) = controlled_by_other(&existing.metadata, owner) {
            let reason = format!("namespace {} is already controlled by {}", name, other);
            self.ctx
                .warning(env, reasons::FAILED_UPDATE, actions::RECONCILE, reason.clone())
                .await;
            return Err(ControllerError::InvalidResource {
                object: env.name_any(),
                reason,
            });
        }

        let drifted = |ns: &Namespace| {
            !has_owner_ref(&ns.metadata, owner) || labels_changed(ns.metadata.labels.as_ref(), labels)
        };
        if !drifted(&existing) {
            return Ok(true);
        }
        let updated = update_with_retry(&self.ctx.client, &key, WriteTarget::Object, |ns: &mut Namespace| {
            if !drifted(ns) {
                return false;
            }
            merge_labels(&mut ns.metadata, labels);
            set_owner_ref(&mut ns.metadata, owner);
            true
        })
        .await;
        self.report_update(env, &format!("namespace {}", name), updated)
            .await?;
        Ok(true)
    }

    async fn ensure_resource_quota(
        &self,
        env: &Environment,
        hard: &ResourceList,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), ControllerError> {
        // Reject malformed quantities before the API server does
        quantity::parse_list(hard)?;

        let name = env.spec.quota_name();
        let key = ObjectKey::namespaced(&env.spec.namespace, name);
        let what = format!("resourcequota {}", key);

        let Some(existing) = self.ctx.client.get::<ResourceQuota>(&key).await? else {
            let quota = ResourceQuota {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(env.spec.namespace.clone()),
                    labels: Some(labels.clone()),
                    ..Default::default()
                },
                spec: Some(ResourceQuotaSpec {
                    hard: Some(to_native(hard)),
                    ..Default::default()
                }),
                status: None,
            };
            return match self.ctx.client.create(&quota).await {
                Ok(_) => {
                    self.ctx
                        .normal(env, reasons::CREATED, actions::RECONCILE, format!("Created {}", what))
                        .await;
                    Ok(())
                }
                Err(e) => {
                    self.ctx
                        .warning(env, reasons::FAILED_CREATE, actions::RECONCILE, format!("Failed to create {}: {}", what, e))
                        .await;
                    Err(e.into())
                }
            };
        };

        let drifted = |rq: &ResourceQuota| {
            let current = quantity::from_native(rq.spec.as_ref().and_then(|s| s.hard.as_ref()));
            !quantity::semantic_eq(&current, hard) || labels_changed(rq.metadata.labels.as_ref(), labels)
        };
        if !drifted(&existing) {
            return Ok(());
        }
        let updated = update_with_retry(&self.ctx.client, &key, WriteTarget::Object, |rq: &mut ResourceQuota| {
            if !drifted(rq) {
                return false;
            }
            rq.spec.get_or_insert_with(Default::default).hard = Some(to_native(hard));
            merge_labels(&mut rq.metadata, labels);
            true
        })
        .await;
        self.report_update(env, &what, updated).await
    }

    async fn ensure_limit_range(
        &self,
        env: &Environment,
        items: &[LimitRangeItem],
        labels: &BTreeMap<String, String>,
    ) -> Result<(), ControllerError> {
        for list in items.iter().flat_map(LimitRangeItem::resource_lists) {
            quantity::parse_list(list)?;
        }

        let key = ObjectKey::namespaced(&env.spec.namespace, DEFAULT_LIMIT_RANGE_NAME);
        let what = format!("limitrange {}", key);
        let desired = || LimitRangeSpec {
            limits: items.iter().map(native_limit).collect(),
        };

        let Some(existing) = self.ctx.client.get::<LimitRange>(&key).await? else {
            let limit_range = LimitRange {
                metadata: ObjectMeta {
                    name: Some(DEFAULT_LIMIT_RANGE_NAME.to_string()),
                    namespace: Some(env.spec.namespace.clone()),
                    labels: Some(labels.clone()),
                    ..Default::default()
                },
                spec: Some(desired()),
            };
            return match self.ctx.client.create(&limit_range).await {
                Ok(_) => {
                    self.ctx
                        .normal(env, reasons::CREATED, actions::RECONCILE, format!("Created {}", what))
                        .await;
                    Ok(())
                }
                Err(e) => {
                    self.ctx
                        .warning(env, reasons::FAILED_CREATE, actions::RECONCILE, format!("Failed to create {}: {}", what, e))
                        .await;
                    Err(e.into())
                }
            };
        };

        let drifted = |lr: &LimitRange| {
            let current = lr.spec.as_ref().map(|s| s.limits.as_slice()).unwrap_or_default();
            !limits_match(current, items) || labels_changed(lr.metadata.labels.as_ref(), labels)
        };
        if !drifted(&existing) {
            return Ok(());
        }
        let updated = update_with_retry(&self.ctx.client, &key, WriteTarget::Object, |lr: &mut LimitRange| {
            if !drifted(lr) {
                return false;
            }
            lr.spec = Some(desired());
            merge_labels(&mut lr.metadata, labels);
            true
        })
        .await;
        self.report_update(env, &what, updated).await
    }

    async fn report_update<T>(
        &self,
        env: &Environment,
        what: &str,
        result: Result<T, ControllerError>,
    ) -> Result<(), ControllerError> {
        match result {
            Ok(_) => {
                self.ctx
                    .normal(env, reasons::UPDATED, actions::RECONCILE, format!("Updated {}", what))
                    .await;
                Ok(())
            }
            Err(e) => {
                self.ctx
                    .warning(env, reasons::FAILED_UPDATE, actions::RECONCILE, format!("Failed to update {}: {}", what, e))
                    .await;
                Err(e)
            }
        }
    }

    async fn cleanup(&self, env: Environment) -> Result<Action, ControllerError> {
        if !has_finalizer(&env.metadata, FINALIZER_NAMESPACE) {
            return Ok(Action::AwaitChange);
        }
        let namespace = env.spec.namespace.clone();
        let result = match &env.spec.delete_policy {
            DeletePolicy::DeleteLabels => self.release_namespace(&env).await,
            DeletePolicy::DeleteNamespace => self.delete_namespace(&namespace).await,
            DeletePolicy::Other(policy) => {
                self.ctx
                    .warning(
                        &env,
                        reasons::UNKNOWN_ERROR,
                        actions::CLEANUP,
                        format!("Unknown deletePolicy {:?}", policy),
                    )
                    .await;
                return Err(ControllerError::InvalidResource {
                    object: env.name_any(),
                    reason: format!("unknown deletePolicy {:?}", policy),
                });
            }
        };

        match result {
            Ok(()) => {
                self.ctx
                    .normal(
                        &env,
                        reasons::DELETED,
                        actions::CLEANUP,
                        format!("Cleaned up namespace {} ({})", namespace, env.spec.delete_policy),
                    )
                    .await;
            }
            Err(e) => {
                self.ctx
                    .warning(
                        &env,
                        reasons::FAILED_DELETE,
                        actions::CLEANUP,
                        format!("Failed to clean up namespace {}: {}", namespace, e),
                    )
                    .await;
                return Err(e);
            }
        }

        let key = ObjectKey::from_resource(&env);
        update_with_retry(&self.ctx.client, &key, WriteTarget::Object, |e: &mut Environment| {
            remove_finalizer(&mut e.metadata, FINALIZER_NAMESPACE)
        })
        .await?;
        info!(environment = %env.name_any(), "Environment cleanup finished");
        Ok(Action::AwaitChange)
    }

    /// Delete the object at `key` if this environment created it
    async fn delete_managed<K: ClusterResource>(&self, env: &Environment, key: &ObjectKey) -> Result<(), ControllerError> {
        let managed = self
            .ctx
            .client
            .get::<K>(key)
            .await?
            .is_some_and(|obj| obj.labels().get(LABEL_ENVIRONMENT) == Some(&env.name_any()));
        if managed {
            ignore_not_found(self.ctx.client.delete::<K>(key).await)?;
        }
        Ok(())
    }

    /// Keep the namespace but detach it from the tenant: strip the scope
    /// labels and owner references and remove the managed quota and
    /// LimitRange.
    async fn release_namespace(&self, env: &Environment) -> Result<(), ControllerError> {
        if env.spec.namespace.is_empty() {
            return Ok(());
        }
        let namespace = &env.spec.namespace;
        self.delete_managed::<ResourceQuota>(env, &ObjectKey::namespaced(namespace, env.spec.quota_name()))
            .await?;
        self.delete_managed::<LimitRange>(env, &ObjectKey::namespaced(namespace, DEFAULT_LIMIT_RANGE_NAME))
            .await?;

        update_with_retry(
            &self.ctx.client,
            &ObjectKey::cluster(&env.spec.namespace),
            WriteTarget::Object,
            |ns: &mut Namespace| {
                let stripped = delete_labels(&mut ns.metadata, &SCOPE_LABELS);
                let released = ns.metadata.owner_references.take().is_some();
                stripped || released
            },
        )
        .await?;
        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<(), ControllerError> {
        if namespace.is_empty() {
            return Ok(());
        }
        ignore_not_found(self.ctx.client.delete::<Namespace>(&ObjectKey::cluster(namespace)).await)?;
        Ok(())
    }
}

#[async_trait]
impl<C: ClusterClient + 'static> Reconcile for EnvironmentReconciler<C> {
    fn kind(&self) -> &'static str {
        "Environment"
    }

    #[instrument(skip(self), fields(environment = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ControllerError> {
        let Some(env) = self.ctx.client.get::<Environment>(key).await? else {
            debug!("Environment no longer exists");
            return Ok(Action::AwaitChange);
        };
        if is_deleting(&env.metadata) {
            self.cleanup(env).await
        } else {
            self.reconcile_active(env).await
        }
    }
}

#[cfg(test)]
#[path = "environment_test.rs"]
mod tests;
