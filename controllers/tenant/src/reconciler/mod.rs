//! Typed reconcilers.
//!
//! - `tenant`: Tenant lifecycle, child quota and network policy, status
//! - `environment`: target namespace, labels, native quota, cleanup
//! - `resource_quota`: TenantResourceQuota aggregation
//! - `network_policy`: native NetworkPolicies implementing tenant isolation

pub mod environment;
pub mod network_policy;
pub mod resource_quota;
pub mod tenant;

pub use environment::EnvironmentReconciler;
pub use network_policy::TenantNetworkPolicyReconciler;
pub use resource_quota::TenantResourceQuotaReconciler;
pub use tenant::TenantReconciler;

use crate::events::EventPublisher;
use crate::plugin_status::PluginStatus;
use kube::Resource;
use kube::runtime::events::EventType;
use std::sync::Arc;

/// Dependencies shared by every reconciler
pub struct Context<C> {
    pub client: C,
    pub events: Arc<dyn EventPublisher>,
    pub plugins: Arc<PluginStatus>,
}

impl<C: Clone> Clone for Context<C> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            events: self.events.clone(),
            plugins: self.plugins.clone(),
        }
    }
}

impl<C> std::fmt::Debug for Context<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").finish_non_exhaustive()
    }
}

impl<C> Context<C> {
    pub fn new(client: C, events: Arc<dyn EventPublisher>, plugins: Arc<PluginStatus>) -> Self {
        Self { client, events, plugins }
    }

    pub(crate) async fn normal<K>(&self, obj: &K, reason: &str, action: &str, note: String)
    where
        K: Resource<DynamicType = ()>,
    {
        self.events
            .publish(&obj.object_ref(&()), EventType::Normal, reason, action, Some(note))
            .await;
    }

    pub(crate) async fn warning<K>(&self, obj: &K, reason: &str, action: &str, note: String)
    where
        K: Resource<DynamicType = ()>,
    {
        self.events
            .publish(&obj.object_ref(&()), EventType::Warning, reason, action, Some(note))
            .await;
    }
}
