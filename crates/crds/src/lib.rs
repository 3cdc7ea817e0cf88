//! Kuber CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the tenancy controller.
//! All kinds live in the `go.kuber.io/v1beta1` API group and are cluster-scoped.

pub mod constants;
pub mod environment;
pub mod tenant;
pub mod tenant_gateway;
pub mod tenant_network_policy;
pub mod tenant_resource_quota;

pub use constants::*;
pub use environment::*;
pub use tenant::*;
pub use tenant_gateway::*;
pub use tenant_network_policy::*;
pub use tenant_resource_quota::*;

use std::collections::BTreeMap;

/// Resource name to quantity string (`cpu: "500m"`, `limits.memory: "2Gi"`).
///
/// Wire-compatible with `core/v1` `ResourceList`; quantities stay in their
/// textual form here and are parsed by whoever needs to do arithmetic.
pub type ResourceList = BTreeMap<String, String>;
