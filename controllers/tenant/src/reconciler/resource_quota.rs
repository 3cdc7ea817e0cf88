//! TenantResourceQuota aggregation.
//!
//! The status of a TenantResourceQuota is the resource-name-wise sum of
//! every namespace ResourceQuota labeled with its tenant. Status writes
//! trigger a watch event on the object itself, so status is only written
//! when the computed sums differ from what is stored.

use super::Context;
use crate::error::ControllerError;
use crate::quantity::{self, Quantity};
use crate::reconcile_helpers::{WriteTarget, update_with_retry};
use crate::runner::{Action, Reconcile};
use async_trait::async_trait;
use chrono::Utc;
use cluster_client::{ClusterClient, LabelSelector, ObjectKey};
use crds::{LABEL_TENANT, ResourceList, TenantResourceQuota, TenantResourceQuotaStatus};
use k8s_openapi::api::core::v1::ResourceQuota;
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

const REQUESTS_STORAGE: &str = "requests.storage";
const LIMITS_STORAGE: &str = "limits.storage";

/// Aggregated `used` and `hard` of a tenant's namespace quotas
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaTotals {
    pub used: ResourceList,
    pub hard: ResourceList,
}

/// Sum `status.used` and `status.hard` of `quotas`.
///
/// Both sums start with a zero for every resource named in `seed`, so a
/// tenant without namespaces still reports `0` rather than nothing.
pub fn aggregate(seed: &ResourceList, quotas: &[ResourceQuota]) -> Result<QuotaTotals, ControllerError> {
    let zeros: BTreeMap<String, Quantity> = seed.keys().map(|k| (k.clone(), Quantity::zero())).collect();
    let mut used = zeros.clone();
    let mut hard = zeros;

    for quota in quotas {
        let Some(status) = &quota.status else {
            continue;
        };
        quantity::add_into(&mut used, &quantity::from_native(status.used.as_ref()))?;
        quantity::add_into(&mut hard, &quantity::from_native(status.hard.as_ref()))?;
    }

    Ok(QuotaTotals {
        used: mirror_storage(quantity::format_list(&used)),
        hard: mirror_storage(quantity::format_list(&hard)),
    })
}

/// Quota objects count storage under `requests.storage`; tenants read it as
/// `limits.storage` as well.
fn mirror_storage(mut list: ResourceList) -> ResourceList {
    if let Some(storage) = list.get(REQUESTS_STORAGE).cloned() {
        list.insert(LIMITS_STORAGE.to_string(), storage);
    }
    list
}

fn status_matches(status: Option<&TenantResourceQuotaStatus>, totals: &QuotaTotals) -> bool {
    let Some(status) = status else {
        return false;
    };
    quantity::semantic_eq(&status.used, &totals.used)
        && quantity::semantic_eq(&status.allocated, &totals.hard)
        && quantity::semantic_eq(&status.hard, &totals.hard)
}

/// Reconciles TenantResourceQuota status
#[derive(Debug)]
pub struct TenantResourceQuotaReconciler<C> {
    ctx: Context<C>,
}

impl<C: ClusterClient + 'static> TenantResourceQuotaReconciler<C> {
    pub fn new(ctx: Context<C>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl<C: ClusterClient + 'static> Reconcile for TenantResourceQuotaReconciler<C> {
    fn kind(&self) -> &'static str {
        "TenantResourceQuota"
    }

    #[instrument(skip(self), fields(quota = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ControllerError> {
        let Some(trq) = self.ctx.client.get::<TenantResourceQuota>(key).await? else {
            debug!("TenantResourceQuota no longer exists");
            return Ok(Action::AwaitChange);
        };
        let tenant = trq.name_any();

        let quotas: Vec<ResourceQuota> = self
            .ctx
            .client
            .list(None, &LabelSelector::label(LABEL_TENANT, &tenant))
            .await?;
        let totals = aggregate(&trq.spec.hard, &quotas)?;

        if status_matches(trq.status.as_ref(), &totals) {
            debug!(namespaces = quotas.len(), "Quota totals unchanged");
            return Ok(Action::AwaitChange);
        }

        update_with_retry(&self.ctx.client, key, WriteTarget::Status, |q: &mut TenantResourceQuota| {
            if status_matches(q.status.as_ref(), &totals) {
                return false;
            }
            q.status = Some(TenantResourceQuotaStatus {
                hard: totals.hard.clone(),
                allocated: totals.hard.clone(),
                used: totals.used.clone(),
                last_update_time: Some(Utc::now()),
            });
            true
        })
        .await?;
        info!(tenant = %tenant, namespaces = quotas.len(), "Tenant quota totals updated");
        Ok(Action::AwaitChange)
    }
}

#[cfg(test)]
#[path = "resource_quota_test.rs"]
mod tests;
