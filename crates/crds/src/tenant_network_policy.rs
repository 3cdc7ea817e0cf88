//! TenantNetworkPolicy CRD
//!
//! Isolation intent for a tenant at tenant, project and environment scope.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "go.kuber.io",
    version = "v1beta1",
    kind = "TenantNetworkPolicy",
    status = "TenantNetworkPolicyStatus",
    shortname = "tnetpol"
)]
#[serde(rename_all = "camelCase")]
pub struct TenantNetworkPolicySpec {
    /// Tenant this policy belongs to
    #[serde(default)]
    pub tenant: String,

    /// Deny traffic from outside the tenant into any of its namespaces
    #[serde(default)]
    pub tenant_isolated: bool,

    /// Projects isolated from the rest of the tenant
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub project_network_policies: Vec<ProjectNetworkPolicy>,

    /// Environments isolated from everything else
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment_network_policies: Vec<EnvironmentNetworkPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectNetworkPolicy {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentNetworkPolicy {
    #[serde(default)]
    pub project: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TenantNetworkPolicyStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<chrono::DateTime<chrono::Utc>>,
}
