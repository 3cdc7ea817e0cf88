//! TenantResourceQuota CRD
//!
//! One per tenant (same name). `status` is computed by the controller by
//! summing every namespace `ResourceQuota` labeled with the tenant.

use crate::ResourceList;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "go.kuber.io",
    version = "v1beta1",
    kind = "TenantResourceQuota",
    status = "TenantResourceQuotaStatus",
    shortname = "tquota"
)]
#[serde(rename_all = "camelCase")]
pub struct TenantResourceQuotaSpec {
    /// Operator-declared ceiling
    #[serde(default)]
    pub hard: ResourceList,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TenantResourceQuotaStatus {
    /// Sum of `status.hard` of the tenant's namespace quotas
    #[serde(default)]
    pub hard: ResourceList,

    /// Copy of `hard`: what has been handed out to namespaces
    #[serde(default)]
    pub allocated: ResourceList,

    /// Sum of `status.used` of the tenant's namespace quotas
    #[serde(default)]
    pub used: ResourceList,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<chrono::DateTime<chrono::Utc>>,
}

/// Quota a tenant starts with: nothing may be consumed until an operator
/// raises the ceiling.
pub fn default_tenant_quota() -> ResourceList {
    [
        ("limits.cpu", "0"),
        ("limits.memory", "0Gi"),
        ("requests.storage", "0Gi"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}
