//! Informer-backed reads.
//!
//! [`CachedClient`] answers lists that select on an indexed label from the
//! informer caches and sends everything else to the wrapped client. Cached
//! answers trail the API server by the watch delay; writes still go to the
//! server with the usual resourceVersion checks, so a stale read at worst
//! costs a conflict and a retry.

use crate::runner::Store;
use cluster_client::{ClusterClient, ClusterError, ClusterResource, LabelSelector, ObjectKey};
use kube::ResourceExt;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::trace;

/// [`ClusterClient`] reading label lookups from informer stores
pub struct CachedClient<C> {
    inner: C,
    stores: Arc<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    synced: Vec<watch::Receiver<bool>>,
}

impl<C: Clone> Clone for CachedClient<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            stores: self.stores.clone(),
            synced: self.synced.clone(),
        }
    }
}

impl<C> CachedClient<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            stores: Arc::new(HashMap::new()),
            synced: Vec::new(),
        }
    }

    /// Serve label lookups for `K` from `store`
    pub fn with_store<K: ClusterResource>(mut self, store: Arc<Store<K>>) -> Self {
        self.synced.push(store.subscribe_synced());
        Arc::make_mut(&mut self.stores).insert(TypeId::of::<K>(), store);
        self
    }

    /// Wait until every registered store has applied its first list
    pub async fn wait_synced(&self) {
        for rx in &self.synced {
            let mut rx = rx.clone();
            // Stores outlive the client, so the channel cannot close here
            let _ = rx.wait_for(|synced| *synced).await;
        }
    }

    fn store<K: ClusterResource>(&self) -> Option<&Store<K>> {
        self.stores.get(&TypeId::of::<K>())?.downcast_ref::<Store<K>>()
    }

    /// Cached answer for a list, or `None` when the store cannot give one
    fn cached_list<K: ClusterResource>(&self, namespace: Option<&str>, selector: &LabelSelector) -> Option<Vec<K>> {
        let store = self.store::<K>()?;
        let value = selector.value_of(store.index_label()?)?;
        if !store.is_synced() {
            return None;
        }
        let objects: Vec<K> = store
            .by_label(value)
            .into_iter()
            .filter(|obj| namespace.is_none_or(|ns| obj.namespace().as_deref() == Some(ns)))
            .filter(|obj| selector.matches(obj.labels()))
            .map(|obj| K::clone(&obj))
            .collect();
        trace!(kind = %K::kind(&()), selector = %selector.to_query(), count = objects.len(), "List served from cache");
        Some(objects)
    }
}

#[async_trait::async_trait]
impl<C: ClusterClient> ClusterClient for CachedClient<C> {
    async fn get<K: ClusterResource>(&self, key: &ObjectKey) -> Result<Option<K>, ClusterError> {
        self.inner.get(key).await
    }

    async fn list<K: ClusterResource>(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<K>, ClusterError> {
        if let Some(objects) = self.cached_list(namespace, selector) {
            return Ok(objects);
        }
        self.inner.list(namespace, selector).await
    }

    async fn create<K: ClusterResource>(&self, obj: &K) -> Result<K, ClusterError> {
        self.inner.create(obj).await
    }

    async fn replace<K: ClusterResource>(&self, obj: &K) -> Result<K, ClusterError> {
        self.inner.replace(obj).await
    }

    async fn replace_status<K: ClusterResource>(&self, obj: &K) -> Result<K, ClusterError> {
        self.inner.replace_status(obj).await
    }

    async fn patch_merge<K: ClusterResource>(
        &self,
        key: &ObjectKey,
        patch: &serde_json::Value,
    ) -> Result<K, ClusterError> {
        self.inner.patch_merge(key, patch).await
    }

    async fn delete<K: ClusterResource>(&self, key: &ObjectKey) -> Result<(), ClusterError> {
        self.inner.delete::<K>(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::Informer;
    use crate::test_utils::*;
    use cluster_client::{MockClusterClient, MockFailure, Verb};
    use crds::{Environment, LABEL_PROJECT, LABEL_TENANT};
    use k8s_openapi::api::core::v1::ResourceQuota;
    use kube_runtime::watcher;
    use std::time::Duration;

    fn synced_environments(envs: Vec<Environment>) -> Informer<Environment> {
        let mut informer = Informer::<Environment>::new("environments").index_label(LABEL_TENANT);
        informer.apply(watcher::Event::Init);
        for env in envs {
            informer.apply(watcher::Event::InitApply(env));
        }
        informer.apply(watcher::Event::InitDone);
        informer
    }

    fn names(envs: &[Environment]) -> Vec<String> {
        envs.iter().map(|e| e.name_any()).collect()
    }

    #[tokio::test]
    async fn test_tenant_lookup_is_served_from_store() {
        let informer = synced_environments(vec![
            create_test_environment("dev", "acme", "web", "acme-dev"),
            create_test_environment("prod", "acme", "api", "acme-prod"),
            create_test_environment("qa", "globex", "web", "globex-qa"),
        ]);
        let mock = MockClusterClient::new();
        mock.fail_next::<Environment>(Verb::List, MockFailure::Unavailable("down".into()));
        let client = CachedClient::new(mock).with_store(informer.store());

        let acme: Vec<Environment> = client.list(None, &LabelSelector::label(LABEL_TENANT, "acme")).await.unwrap();
        assert_eq!(names(&acme), vec!["dev", "prod"]);

        let web: Vec<Environment> = client
            .list(None, &LabelSelector::label(LABEL_TENANT, "acme").and(LABEL_PROJECT, "web"))
            .await
            .unwrap();
        assert_eq!(names(&web), vec!["dev"]);
    }

    #[tokio::test]
    async fn test_other_lookups_reach_the_server() {
        let informer = synced_environments(vec![create_test_environment("dev", "acme", "web", "acme-dev")]);
        let mock = MockClusterClient::new();
        mock.insert(&create_test_environment("dev", "acme", "web", "acme-dev"));
        mock.insert(&create_test_environment("qa", "globex", "web", "globex-qa"));
        let client = CachedClient::new(mock.clone()).with_store(informer.store());

        // Not indexed on the project label
        let web: Vec<Environment> = client.list(None, &LabelSelector::label(LABEL_PROJECT, "web")).await.unwrap();
        assert_eq!(names(&web), vec!["dev", "qa"]);

        // No store registered for quotas
        mock.fail_next::<ResourceQuota>(Verb::List, MockFailure::Unavailable("down".into()));
        let err = client
            .list::<ResourceQuota>(None, &LabelSelector::label(LABEL_TENANT, "acme"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_unsynced_store_falls_back_to_server() {
        let mut informer = Informer::<Environment>::new("environments").index_label(LABEL_TENANT);
        informer.apply(watcher::Event::Apply(create_test_environment("dev", "acme", "web", "acme-dev")));
        let mock = MockClusterClient::new();
        let client = CachedClient::new(mock).with_store(informer.store());

        let acme: Vec<Environment> = client.list(None, &LabelSelector::label(LABEL_TENANT, "acme")).await.unwrap();
        assert!(acme.is_empty(), "server view wins until the first list completes");
    }

    #[tokio::test]
    async fn test_namespaced_lookup_filters_by_namespace() {
        let mut informer = Informer::<ResourceQuota>::new("resourcequotas").index_label(LABEL_TENANT);
        informer.apply(watcher::Event::Init);
        informer.apply(watcher::Event::InitApply(create_test_resource_quota(
            "acme-dev", "default", "acme", &[("pods", "1")], &[],
        )));
        informer.apply(watcher::Event::InitApply(create_test_resource_quota(
            "acme-prod", "default", "acme", &[("pods", "2")], &[],
        )));
        informer.apply(watcher::Event::InitDone);
        let client = CachedClient::new(MockClusterClient::new()).with_store(informer.store());

        let quotas: Vec<ResourceQuota> = client
            .list(Some("acme-prod"), &LabelSelector::label(LABEL_TENANT, "acme"))
            .await
            .unwrap();
        assert_eq!(quotas.len(), 1);
        assert_eq!(quotas[0].namespace().as_deref(), Some("acme-prod"));
    }

    #[tokio::test]
    async fn test_wait_synced_blocks_until_every_store_listed() {
        let mut environments = Informer::<Environment>::new("environments").index_label(LABEL_TENANT);
        let mut quotas = Informer::<ResourceQuota>::new("resourcequotas").index_label(LABEL_TENANT);
        quotas.apply(watcher::Event::Init);
        quotas.apply(watcher::Event::InitDone);
        let client = CachedClient::new(MockClusterClient::new())
            .with_store(quotas.store())
            .with_store(environments.store());

        let waiter = {
            let client = client.clone();
            tokio::spawn(async move { client.wait_synced().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        environments.apply(watcher::Event::Init);
        environments.apply(watcher::Event::InitDone);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }
}
