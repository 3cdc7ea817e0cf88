//! kube-backed ClusterClient

use crate::cluster_trait::{ClusterClient, ClusterResource};
use crate::error::ClusterError;
use crate::key::ObjectKey;
use crate::selector::LabelSelector;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ObjectList, Request};
use kube::{Client, ResourceExt};
use tracing::debug;

/// Production [`ClusterClient`] talking to the API server.
///
/// Requests are built from each kind's URL path so one implementation serves
/// cluster-scoped and namespaced kinds alike.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Underlying kube client, for watches and the event recorder
    pub fn inner(&self) -> &Client {
        &self.client
    }

    fn request<K: ClusterResource>(namespace: Option<&str>) -> Request {
        Request::new(K::url_path(&(), namespace))
    }

    fn name_of<K: ClusterResource>(obj: &K) -> Result<String, ClusterError> {
        obj.meta()
            .name
            .clone()
            .ok_or_else(|| ClusterError::InvalidRequest(format!("{} without a name", K::kind(&()))))
    }
}

#[async_trait::async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get<K: ClusterResource>(&self, key: &ObjectKey) -> Result<Option<K>, ClusterError> {
        let req = Self::request::<K>(key.namespace.as_deref())
            .get(&key.name, &Default::default())
            .map_err(kube::Error::BuildRequest)?;
        match self.client.request::<K>(req).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list<K: ClusterResource>(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<K>, ClusterError> {
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector.to_query());
        }
        let req = Self::request::<K>(namespace)
            .list(&params)
            .map_err(kube::Error::BuildRequest)?;
        let list = self.client.request::<ObjectList<K>>(req).await?;
        debug!(kind = %K::kind(&()), count = list.items.len(), "Listed objects");
        Ok(list.items)
    }

    async fn create<K: ClusterResource>(&self, obj: &K) -> Result<K, ClusterError> {
        let data = serde_json::to_vec(obj)?;
        let req = Self::request::<K>(obj.namespace().as_deref())
            .create(&PostParams::default(), data)
            .map_err(kube::Error::BuildRequest)?;
        Ok(self.client.request::<K>(req).await?)
    }

    async fn replace<K: ClusterResource>(&self, obj: &K) -> Result<K, ClusterError> {
        let name = Self::name_of(obj)?;
        let data = serde_json::to_vec(obj)?;
        let req = Self::request::<K>(obj.namespace().as_deref())
            .replace(&name, &PostParams::default(), data)
            .map_err(kube::Error::BuildRequest)?;
        Ok(self.client.request::<K>(req).await?)
    }

    async fn replace_status<K: ClusterResource>(&self, obj: &K) -> Result<K, ClusterError> {
        let name = Self::name_of(obj)?;
        let data = serde_json::to_vec(obj)?;
        let req = Self::request::<K>(obj.namespace().as_deref())
            .replace_subresource("status", &name, &PostParams::default(), data)
            .map_err(kube::Error::BuildRequest)?;
        Ok(self.client.request::<K>(req).await?)
    }

    async fn patch_merge<K: ClusterResource>(
        &self,
        key: &ObjectKey,
        patch: &serde_json::Value,
    ) -> Result<K, ClusterError> {
        let req = Self::request::<K>(key.namespace.as_deref())
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .map_err(kube::Error::BuildRequest)?;
        Ok(self.client.request::<K>(req).await?)
    }

    async fn delete<K: ClusterResource>(&self, key: &ObjectKey) -> Result<(), ClusterError> {
        let req = Self::request::<K>(key.namespace.as_deref())
            .delete(&key.name, &DeleteParams::background())
            .map_err(kube::Error::BuildRequest)?;
        // Body is either the marked object or a Status; neither is needed.
        self.client.request_text(req).await?;
        Ok(())
    }
}
