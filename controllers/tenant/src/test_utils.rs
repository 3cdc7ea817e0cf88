//! Test utilities for unit testing reconcilers
//!
//! Fixture constructors plus a [`TestContext`] wiring the mock API server,
//! a recording event publisher and a readiness gate.

use crate::events::RecordingEventPublisher;
use crate::plugin_status::PluginStatus;
use crate::reconciler::Context;
use cluster_client::MockClusterClient;
use crds::*;
use k8s_openapi::api::core::v1::{Namespace, ResourceQuota, ResourceQuotaSpec, ResourceQuotaStatus};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;

pub fn string_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn quantities(pairs: &[(&str, &str)]) -> BTreeMap<String, Quantity> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
        .collect()
}

fn cluster_meta(name: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        labels: (!labels.is_empty()).then_some(labels),
        ..Default::default()
    }
}

/// Helper to create test Tenant CRD
pub fn create_test_tenant(name: &str) -> Tenant {
    Tenant {
        metadata: cluster_meta(name, BTreeMap::new()),
        spec: TenantSpec {
            tenant_name: Some(name.to_uppercase()),
            admin: vec!["admin".to_string()],
            members: Vec::new(),
        },
        status: None,
    }
}

/// Helper to create test Environment CRD labeled with its tenant
pub fn create_test_environment(name: &str, tenant: &str, project: &str, namespace: &str) -> Environment {
    Environment {
        metadata: cluster_meta(name, string_map(&[(LABEL_TENANT, tenant), (LABEL_PROJECT, project)])),
        spec: EnvironmentSpec {
            tenant: tenant.to_string(),
            project: project.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        },
        status: None,
    }
}

pub fn create_test_namespace(name: &str, labels: &[(&str, &str)]) -> Namespace {
    Namespace {
        metadata: cluster_meta(name, string_map(labels)),
        ..Default::default()
    }
}

/// Native quota labeled with `tenant` (unlabeled when `tenant` is empty)
pub fn create_test_resource_quota(
    namespace: &str,
    name: &str,
    tenant: &str,
    hard: &[(&str, &str)],
    used: &[(&str, &str)],
) -> ResourceQuota {
    let labels = if tenant.is_empty() {
        BTreeMap::new()
    } else {
        string_map(&[(LABEL_TENANT, tenant)])
    };
    ResourceQuota {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            ..cluster_meta(name, labels)
        },
        spec: Some(ResourceQuotaSpec {
            hard: Some(quantities(hard)),
            ..Default::default()
        }),
        status: Some(ResourceQuotaStatus {
            hard: Some(quantities(hard)),
            used: Some(quantities(used)),
        }),
    }
}

pub fn create_test_tenant_resource_quota(name: &str, hard: &[(&str, &str)]) -> TenantResourceQuota {
    TenantResourceQuota {
        metadata: cluster_meta(name, string_map(&[(LABEL_TENANT, name)])),
        spec: TenantResourceQuotaSpec { hard: string_map(hard) },
        status: None,
    }
}

pub fn create_test_tenant_network_policy(name: &str, isolated: bool) -> TenantNetworkPolicy {
    TenantNetworkPolicy {
        metadata: cluster_meta(name, string_map(&[(LABEL_TENANT, name)])),
        spec: TenantNetworkPolicySpec {
            tenant: name.to_string(),
            tenant_isolated: isolated,
            ..Default::default()
        },
        status: None,
    }
}

pub fn create_test_gateway(name: &str, tenant: &str) -> TenantGateway {
    TenantGateway {
        metadata: cluster_meta(name, string_map(&[(LABEL_TENANT, tenant)])),
        spec: TenantGatewaySpec {
            service_type: "NodePort".to_string(),
            replicas: Some(1),
            ingress_class: tenant.to_string(),
            ..Default::default()
        },
        status: None,
    }
}

/// Mock API server, captured events and an already opened readiness gate
pub struct TestContext {
    pub client: MockClusterClient,
    pub events: Arc<RecordingEventPublisher>,
    pub plugins: Arc<PluginStatus>,
}

impl TestContext {
    pub async fn new() -> Self {
        let client = MockClusterClient::new();
        let plugins = Arc::new(PluginStatus::new());
        plugins.init(&client).await.unwrap();
        Self {
            client,
            events: Arc::new(RecordingEventPublisher::default()),
            plugins,
        }
    }

    /// Same, with the readiness gate still closed
    pub fn without_readiness() -> Self {
        Self {
            client: MockClusterClient::new(),
            events: Arc::new(RecordingEventPublisher::default()),
            plugins: Arc::new(PluginStatus::new()),
        }
    }

    pub fn context(&self) -> Context<MockClusterClient> {
        Context::new(self.client.clone(), self.events.clone(), self.plugins.clone())
    }
}
