//! Main controller implementation.
//!
//! Wires the informers, event routers and typed reconcilers together:
//!
//! - informers for every watched kind start first, on every replica;
//!   tenant label lookups are served from their caches once synced
//! - with leader election enabled, reconcile workers only start once this
//!   replica holds the lease
//! - the plugin readiness gate is initialised right after that, and a
//!   failure to do so is fatal
//!
//! Losing the lease stops the workers and ends [`Controller::run`] with an
//! error so that the process restarts as a follower.

use crate::cache::CachedClient;
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::events::{EventPublisher, KubeEventPublisher};
use crate::leader::{LeaderElector, LeaderGuard};
use crate::plugin_status::PluginStatus;
use crate::reconciler::{
    Context, EnvironmentReconciler, TenantNetworkPolicyReconciler, TenantReconciler,
    TenantResourceQuotaReconciler,
};
use crate::routers::{
    ComponentChangeToNetworkPolicies, EnvironmentToNetworkPolicy, EnvironmentToTenant, NetworkPolicyToTenantPolicy,
    NodeToNetworkPolicies, ResourceQuotaToTenantQuota, Route, SelfRouter, TenantChildToTenant,
};
use crate::runner::{Informer, Reconcile, Runner, WorkQueue};
use cluster_client::{ClusterResource, KubeClusterClient};
use crds::{Environment, LABEL_TENANT, Tenant, TenantNetworkPolicy, TenantResourceQuota};
use k8s_openapi::api::core::v1::{Node, ResourceQuota};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{Api, Client};
use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Name reported on emitted Kubernetes events
pub const CONTROLLER_NAME: &str = "kuber-tenant-controller";

type TaskResult = Result<Result<(), ControllerError>, JoinError>;

type Informers = JoinSet<Result<(), ControllerError>>;

fn flatten(task: &str, result: TaskResult) -> Result<(), ControllerError> {
    match result {
        Ok(inner) => inner,
        Err(e) => Err(ControllerError::Watch(format!("{} task panicked: {}", task, e))),
    }
}

/// Resolves when `guard` reports lost leadership; never without a guard
async fn leadership_lost<C: cluster_client::ClusterClient + 'static>(guard: &mut Option<LeaderGuard<C>>) {
    match guard {
        Some(guard) => guard.lost().await,
        None => std::future::pending().await,
    }
}

/// One work queue per typed reconciler
#[derive(Default)]
struct Queues {
    tenants: WorkQueue,
    environments: WorkQueue,
    quotas: WorkQueue,
    policies: WorkQueue,
}

impl Queues {
    fn shutdown(&self) {
        for queue in [&self.tenants, &self.environments, &self.quotas, &self.policies] {
            queue.shutdown();
        }
    }
}

/// Main controller for tenancy resources.
pub struct Controller {
    client: Client,
    config: ControllerConfig,
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        let client = Client::try_default().await?;
        Ok(Self { client, config })
    }

    fn spawn_informer<K: ClusterResource>(
        &self,
        informers: &mut Informers,
        informer: Informer<K>,
        cancel: &CancellationToken,
    ) {
        let api: Api<K> = Api::all(self.client.clone());
        informers.spawn(informer.run(api, cancel.clone()));
    }

    /// Start every informer. The returned client reads tenant label
    /// lookups from their caches.
    fn start_informers(
        &self,
        cluster: &KubeClusterClient,
        queues: &Queues,
        plugins: &Arc<PluginStatus>,
        cancel: &CancellationToken,
    ) -> (Informers, CachedClient<KubeClusterClient>) {
        let mut tenants = Informer::<Tenant>::new("tenants");
        tenants.add_handler(Route::new("tenant", SelfRouter, queues.tenants.clone()));

        let mut environments = Informer::<Environment>::new("environments").index_label(LABEL_TENANT);
        environments.add_handler(Route::new("environment", SelfRouter, queues.environments.clone()));
        environments.add_handler(Route::new("environment-tenant", EnvironmentToTenant, queues.tenants.clone()));
        environments.add_handler(Route::new(
            "environment-networkpolicy",
            EnvironmentToNetworkPolicy,
            queues.policies.clone(),
        ));

        let mut quotas = Informer::<TenantResourceQuota>::new("tenantresourcequotas");
        quotas.add_handler(Route::new("tenantresourcequota", SelfRouter, queues.quotas.clone()));
        quotas.add_handler(Route::new(
            "tenantresourcequota-tenant",
            TenantChildToTenant::<TenantResourceQuota>::default(),
            queues.tenants.clone(),
        ));

        let mut policies = Informer::<TenantNetworkPolicy>::new("tenantnetworkpolicies");
        policies.add_handler(Route::new("tenantnetworkpolicy", SelfRouter, queues.policies.clone()));
        policies.add_handler(Route::new(
            "tenantnetworkpolicy-tenant",
            TenantChildToTenant::<TenantNetworkPolicy>::default(),
            queues.tenants.clone(),
        ));
        let policy_store = policies.store();

        let mut resource_quotas = Informer::<ResourceQuota>::new("resourcequotas").index_label(LABEL_TENANT);
        resource_quotas.add_handler(Route::new(
            "resourcequota-tenantresourcequota",
            ResourceQuotaToTenantQuota,
            queues.quotas.clone(),
        ));

        let mut network_policies = Informer::<NetworkPolicy>::new("networkpolicies").index_label(LABEL_TENANT);
        network_policies.add_handler(Route::new(
            "networkpolicy-tenantnetworkpolicy",
            NetworkPolicyToTenantPolicy,
            queues.policies.clone(),
        ));

        let mut nodes = Informer::<Node>::new("nodes");
        nodes.add_handler(Route::new(
            "node-networkpolicy",
            NodeToNetworkPolicies::new(policy_store.clone()),
            queues.policies.clone(),
        ));

        let mut definitions = Informer::<CustomResourceDefinition>::new("customresourcedefinitions");
        definitions.add_handler(ComponentChangeToNetworkPolicies::new(
            plugins.clone(),
            policy_store,
            queues.policies.clone(),
        ));

        let cache = CachedClient::new(cluster.clone())
            .with_store(environments.store())
            .with_store(resource_quotas.store())
            .with_store(network_policies.store());

        let mut set = JoinSet::new();
        self.spawn_informer(&mut set, tenants, cancel);
        self.spawn_informer(&mut set, environments, cancel);
        self.spawn_informer(&mut set, quotas, cancel);
        self.spawn_informer(&mut set, policies, cancel);
        self.spawn_informer(&mut set, resource_quotas, cancel);
        self.spawn_informer(&mut set, network_policies, cancel);
        self.spawn_informer(&mut set, nodes, cancel);
        self.spawn_informer(&mut set, definitions, cancel);
        (set, cache)
    }

    fn spawn_runner<R: Reconcile>(
        &self,
        runners: &mut JoinSet<Result<(), ControllerError>>,
        reconciler: R,
        queue: &WorkQueue,
        cancel: &CancellationToken,
    ) {
        let runner = Runner::new(reconciler, queue.clone(), &self.config);
        runners.spawn(runner.run(cancel.clone()));
    }

    /// Runs the controller until `shutdown` fires or a fatal error occurs.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ControllerError> {
        info!("Tenant controller starting");
        let cluster = KubeClusterClient::new(self.client.clone());
        let plugins = Arc::new(PluginStatus::new());
        let queues = Queues::default();

        let informer_cancel = shutdown.child_token();
        let (mut informers, cache) = self.start_informers(&cluster, &queues, &plugins, &informer_cancel);

        let elector = self
            .config
            .leader_election
            .clone()
            .map(|le| Arc::new(LeaderElector::new(cluster.clone(), le)));
        let mut guard = match elector {
            Some(elector) => {
                let acquired = tokio::select! {
                    acquired = elector.acquire(&shutdown) => acquired,
                    Some(result) = informers.join_next() => Err(flatten("informer", result).err().unwrap_or_else(|| {
                        ControllerError::Watch("informer stopped before leadership was acquired".to_string())
                    })),
                };
                match acquired {
                    Ok(guard) => Some(guard),
                    Err(_) if shutdown.is_cancelled() => {
                        info!("Shutdown requested before leadership was acquired");
                        informer_cancel.cancel();
                        while informers.join_next().await.is_some() {}
                        return Ok(());
                    }
                    Err(e) => {
                        informer_cancel.cancel();
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        if let Err(e) = plugins.init(&cluster).await {
            informer_cancel.cancel();
            return Err(e);
        }

        tokio::select! {
            _ = cache.wait_synced() => info!("Informer caches synced"),
            Some(result) = informers.join_next() => {
                informer_cancel.cancel();
                return Err(flatten("informer", result).err().unwrap_or_else(|| {
                    ControllerError::Watch("informer stopped before its cache synced".to_string())
                }));
            }
            _ = shutdown.cancelled() => {
                info!("Shutdown requested before caches synced");
                informer_cancel.cancel();
                while informers.join_next().await.is_some() {}
                return Ok(());
            }
        }

        let identity = self.config.leader_election.as_ref().map(|le| le.identity.clone());
        let events: Arc<dyn EventPublisher> =
            Arc::new(KubeEventPublisher::new(self.client.clone(), CONTROLLER_NAME, identity));
        let ctx = Context::new(cache, events, plugins.clone());

        let work_cancel = shutdown.child_token();
        let mut runners = JoinSet::new();
        self.spawn_runner(&mut runners, TenantReconciler::new(ctx.clone()), &queues.tenants, &work_cancel);
        self.spawn_runner(&mut runners, EnvironmentReconciler::new(ctx.clone()), &queues.environments, &work_cancel);
        self.spawn_runner(&mut runners, TenantResourceQuotaReconciler::new(ctx.clone()), &queues.quotas, &work_cancel);
        self.spawn_runner(&mut runners, TenantNetworkPolicyReconciler::new(ctx), &queues.policies, &work_cancel);
        info!("Tenant controller running");

        let outcome = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown requested");
                Ok(())
            }
            _ = leadership_lost(&mut guard) => {
                error!("Leadership lost, stopping reconcilers");
                Err(ControllerError::LeaderElection("lease lost".to_string()))
            }
            Some(result) = informers.join_next() => {
                let err = flatten("informer", result)
                    .err()
                    .unwrap_or_else(|| ControllerError::Watch("informer stopped unexpectedly".to_string()));
                error!(error = %err, "Informer failed");
                Err(err)
            }
            Some(result) = runners.join_next() => {
                let err = flatten("runner", result)
                    .err()
                    .unwrap_or_else(|| ControllerError::Watch("reconcile workers stopped unexpectedly".to_string()));
                error!(error = %err, "Reconcile workers failed");
                Err(err)
            }
        };

        work_cancel.cancel();
        queues.shutdown();
        while let Some(result) = runners.join_next().await {
            if let Err(e) = flatten("runner", result) {
                warn!(error = %e, "Reconcile workers ended with an error");
            }
        }
        informer_cancel.cancel();
        while informers.join_next().await.is_some() {}

        if let Some(guard) = guard.take() {
            if let Err(e) = guard.release().await {
                warn!(error = %e, "Failed to release lease");
            }
        }
        info!("Tenant controller stopped");
        outcome
    }
}
