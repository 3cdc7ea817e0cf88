//! ClusterClient trait for mocking
//!
//! Reconcilers are generic over this trait; production wires in
//! [`crate::KubeClusterClient`], unit tests the in-memory mock.

use crate::error::ClusterError;
use crate::key::ObjectKey;
use crate::selector::LabelSelector;
use kube::Resource;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;

/// Any typed Kubernetes object the client can move over the wire
pub trait ClusterResource:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> ClusterResource for K where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Trait for Kubernetes API operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch one object; `Ok(None)` when it does not exist
    async fn get<K: ClusterResource>(&self, key: &ObjectKey) -> Result<Option<K>, ClusterError>;

    /// List objects, across all namespaces when `namespace` is `None`
    async fn list<K: ClusterResource>(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<K>, ClusterError>;

    async fn create<K: ClusterResource>(&self, obj: &K) -> Result<K, ClusterError>;

    /// Replace the whole object. Fails with `Conflict` when
    /// `metadata.resourceVersion` is stale. Status is not touched.
    async fn replace<K: ClusterResource>(&self, obj: &K) -> Result<K, ClusterError>;

    /// Replace through the status subresource. Only status is written.
    async fn replace_status<K: ClusterResource>(&self, obj: &K) -> Result<K, ClusterError>;

    /// JSON merge patch (RFC 7386)
    async fn patch_merge<K: ClusterResource>(
        &self,
        key: &ObjectKey,
        patch: &serde_json::Value,
    ) -> Result<K, ClusterError>;

    /// Request deletion. Objects with finalizers are only marked.
    async fn delete<K: ClusterResource>(&self, key: &ObjectKey) -> Result<(), ClusterError>;
}
