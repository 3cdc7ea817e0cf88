//! Tenant CRD
//!
//! Root aggregate of the tenancy model. Owns the tenant's quota, network
//! policy, gateways and (by label) its environments.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "go.kuber.io",
    version = "v1beta1",
    kind = "Tenant",
    status = "TenantStatus",
    shortname = "ten",
    printcolumn = r#"{"name":"Admin","type":"string","jsonPath":".spec.admin"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TenantSpec {
    /// Display name. Identity is always `metadata.name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_name: Option<String>,

    /// Principals with admin rights on the tenant
    #[serde(default)]
    pub admin: Vec<String>,

    /// Principals with member rights on the tenant
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TenantStatus {
    /// Names of the environments labeled with this tenant
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environments: Vec<String>,

    /// Namespaces of those environments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,

    /// Last time the lists above changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<chrono::DateTime<chrono::Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Resource;

    #[test]
    fn test_tenant_from_yaml() {
        let yaml = r#"
apiVersion: go.kuber.io/v1beta1
kind: Tenant
metadata:
  name: acme
spec:
  tenantName: ACME Corp
  admin: [alice]
"#;
        let tenant: Tenant = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(tenant.spec.admin, vec!["alice".to_string()]);
        assert!(tenant.spec.members.is_empty());
        assert!(tenant.status.is_none());
    }

    #[test]
    fn test_tenant_is_cluster_scoped() {
        assert_eq!(Tenant::group(&()), "go.kuber.io");
        assert_eq!(Tenant::api_version(&()), crate::API_VERSION);
        let crd = <Tenant as kube::CustomResourceExt>::crd();
        assert_eq!(crd.spec.scope, "Cluster");
    }
}
