//! Environment CRD
//!
//! Binds one namespace to a tenant and project.

use crate::ResourceList;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "go.kuber.io",
    version = "v1beta1",
    kind = "Environment",
    status = "EnvironmentStatus",
    shortname = "env",
    printcolumn = r#"{"name":"Tenant","type":"string","jsonPath":".spec.tenant"}"#,
    printcolumn = r#"{"name":"Project","type":"string","jsonPath":".spec.project"}"#,
    printcolumn = r#"{"name":"Namespace","type":"string","jsonPath":".spec.namespace"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSpec {
    /// Owning tenant name
    pub tenant: String,

    /// Owning project name
    pub project: String,

    /// Target namespace
    pub namespace: String,

    /// What happens to the namespace when the environment is deleted
    #[serde(default)]
    #[schemars(with = "String")]
    pub delete_policy: DeletePolicy,

    /// Hard limits of the namespace's `ResourceQuota`, if one should be managed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_quota: Option<ResourceList>,

    /// Name of the managed `ResourceQuota` (defaults to `default`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_quota_name: Option<String>,

    /// Items of the namespace's `default` LimitRange; none is managed when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub limit_range: Vec<LimitRangeItem>,
}

/// One `core/v1` LimitRange item, quantities in textual form
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LimitRangeItem {
    /// `Container`, `Pod` or `PersistentVolumeClaim`
    #[serde(rename = "type")]
    pub type_: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<ResourceList>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<ResourceList>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ResourceList>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_request: Option<ResourceList>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_limit_request_ratio: Option<ResourceList>,
}

impl LimitRangeItem {
    /// Every quantity list the item sets
    pub fn resource_lists(&self) -> impl Iterator<Item = &ResourceList> {
        [
            &self.max,
            &self.min,
            &self.default,
            &self.default_request,
            &self.max_limit_request_ratio,
        ]
        .into_iter()
        .flatten()
    }
}

impl EnvironmentSpec {
    /// Name of the namespace `ResourceQuota` this environment manages.
    pub fn quota_name(&self) -> &str {
        self.resource_quota_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_RESOURCE_QUOTA_NAME)
    }
}

/// Name used for the namespace quota when `resourceQuotaName` is unset.
pub const DEFAULT_RESOURCE_QUOTA_NAME: &str = "default";

/// Name of the LimitRange an environment manages in its namespace.
pub const DEFAULT_LIMIT_RANGE_NAME: &str = "default";

/// Namespace cleanup policy.
///
/// Unrecognised values are kept verbatim in `Other` so that the controller
/// can report them instead of failing to deserialize the whole object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(from = "String", into = "String")]
pub enum DeletePolicy {
    /// Delete the namespace itself
    DeleteNamespace,
    /// Keep the namespace, strip tenancy labels and owner references
    #[default]
    DeleteLabels,
    /// Anything else found on the wire
    Other(String),
}

impl From<String> for DeletePolicy {
    fn from(value: String) -> Self {
        match value.as_str() {
            "deleteNamespace" => DeletePolicy::DeleteNamespace,
            "deleteLabels" | "" => DeletePolicy::DeleteLabels,
            _ => DeletePolicy::Other(value),
        }
    }
}

impl From<DeletePolicy> for String {
    fn from(value: DeletePolicy) -> Self {
        value.to_string()
    }
}

impl fmt::Display for DeletePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeletePolicy::DeleteNamespace => f.write_str("deleteNamespace"),
            DeletePolicy::DeleteLabels => f.write_str("deleteLabels"),
            DeletePolicy::Other(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<chrono::DateTime<chrono::Utc>>,
}
