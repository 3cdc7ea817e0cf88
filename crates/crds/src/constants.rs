//! API group, label keys and finalizer tokens shared by every kind.

/// API group of all tenancy CRDs.
pub const GROUP: &str = "go.kuber.io";

/// API version of all tenancy CRDs.
pub const VERSION: &str = "v1beta1";

/// `apiVersion` string as it appears on objects and owner references.
pub const API_VERSION: &str = "go.kuber.io/v1beta1";

pub const LABEL_TENANT: &str = "go.kuber.io/tenant";
pub const LABEL_PROJECT: &str = "go.kuber.io/project";
pub const LABEL_ENVIRONMENT: &str = "go.kuber.io/environment";
pub const LABEL_APPLICATION: &str = "go.kuber.io/application";
pub const LABEL_ZONE: &str = "go.kuber.io/zone";
pub const LABEL_PLUGINS: &str = "go.kuber.io/plugins";

/// Namespace the platform's own components run in.
pub const NAMESPACE_SYSTEM: &str = "kuber";

// Finalizer tokens, one per cleanup concern.
pub const FINALIZER_NAMESPACE: &str = "finalizer.go.kuber.io/namespace";
pub const FINALIZER_RESOURCE_QUOTA: &str = "finalizer.go.kuber.io/resourcequota";
pub const FINALIZER_GATEWAY: &str = "finalizer.go.kuber.io/gateway";
pub const FINALIZER_NETWORK_POLICY: &str = "finalizer.go.kuber.io/netWorkPolicy";
pub const FINALIZER_ENVIRONMENT: &str = "finalizer.go.kuber.io/environment";

/// Finalizers a `Tenant` carries while it is alive, in cleanup order.
pub const TENANT_FINALIZERS: [&str; 4] = [
    FINALIZER_ENVIRONMENT,
    FINALIZER_RESOURCE_QUOTA,
    FINALIZER_NETWORK_POLICY,
    FINALIZER_GATEWAY,
];

/// Labels that tie a namespace to its tenant, project and environment.
pub const SCOPE_LABELS: [&str; 3] = [LABEL_TENANT, LABEL_PROJECT, LABEL_ENVIRONMENT];
