//! Leader election using Kubernetes Leases
//!
//! Only the replica holding the `coordination.k8s.io/v1` Lease runs
//! reconcile workers. Informers run everywhere so a new leader starts with
//! warm caches.
//!
//! # Atomicity
//!
//! Every write carries the resourceVersion that was read. If the lease
//! changed in between, the write fails with 409 Conflict and the attempt
//! counts as "not acquired", so two replicas can never both believe they
//! hold the lease.

use crate::config::LeaderElectionConfig;
use crate::error::ControllerError;
use chrono::{DateTime, SecondsFormat, Utc};
use cluster_client::{ClusterClient, ClusterError, ObjectKey};
use k8s_openapi::api::coordination::v1::Lease;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

fn micro_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// The lease fields the election reads
#[derive(Debug, Default)]
struct LeaseRecord {
    holder: Option<String>,
    acquire_time: Option<String>,
    renew_time: Option<DateTime<Utc>>,
    duration_secs: Option<i64>,
    transitions: i64,
    resource_version: Option<String>,
}

impl LeaseRecord {
    fn read(lease: &Lease) -> Result<Self, ControllerError> {
        let value = serde_json::to_value(lease)?;
        let spec = &value["spec"];
        Ok(Self {
            holder: spec["holderIdentity"].as_str().map(str::to_string),
            acquire_time: spec["acquireTime"].as_str().map(str::to_string),
            renew_time: spec["renewTime"]
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc)),
            duration_secs: spec["leaseDurationSeconds"].as_i64(),
            transitions: spec["leaseTransitions"].as_i64().unwrap_or(0),
            resource_version: lease.metadata.resource_version.clone(),
        })
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match (self.holder.as_deref(), self.renew_time, self.duration_secs) {
            (None | Some(""), _, _) => true,
            (_, Some(renewed), Some(secs)) => now > renewed + chrono::Duration::seconds(secs),
            _ => true,
        }
    }
}

/// Leader elector over one Lease
#[derive(Debug)]
pub struct LeaderElector<C> {
    client: C,
    config: LeaderElectionConfig,
}

impl<C: ClusterClient + 'static> LeaderElector<C> {
    pub fn new(client: C, config: LeaderElectionConfig) -> Self {
        Self { client, config }
    }

    fn key(&self) -> ObjectKey {
        ObjectKey::namespaced(&self.config.namespace, &self.config.lease_name)
    }

    /// Block until leadership is acquired or `cancel` fires.
    pub async fn acquire(self: Arc<Self>, cancel: &CancellationToken) -> Result<LeaderGuard<C>, ControllerError> {
        info!(
            identity = %self.config.identity,
            lease = %self.key(),
            "Waiting for leadership"
        );
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.config.identity, "Leadership acquired");
                    return Ok(self.guard(cancel.child_token()));
                }
                Ok(false) => debug!(identity = %self.config.identity, "Lease held by another replica"),
                Err(e) => warn!(identity = %self.config.identity, error = %e, "Failed to acquire lease, retrying"),
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(ControllerError::LeaderElection("shutdown before leadership was acquired".to_string()));
                }
                _ = tokio::time::sleep(self.config.retry_interval) => {}
            }
        }
    }

    fn guard(self: &Arc<Self>, cancel: CancellationToken) -> LeaderGuard<C> {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_cancel = cancel.clone();
        let renewal_task = tokio::spawn(async move { elector.renewal_loop(lost_tx, renewal_cancel).await });
        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            cancel,
            lost_rx: Some(lost_rx),
        }
    }

    /// One compare-and-swap round: create, renew or take over the lease.
    /// `Ok(false)` means another replica holds it or won the race.
    pub(crate) async fn try_acquire_or_renew(&self) -> Result<bool, ControllerError> {
        let now = Utc::now();
        let Some(existing) = self.client.get::<Lease>(&self.key()).await? else {
            return self.write(self.client.create(&self.lease(now, None, 0, None)?).await, "Created lease");
        };

        let record = LeaseRecord::read(&existing)?;
        if record.holder.as_deref() == Some(self.config.identity.as_str()) {
            let lease = self.lease(
                now,
                record.acquire_time.clone(),
                record.transitions,
                record.resource_version.clone(),
            )?;
            return self.write(self.client.replace(&lease).await, "Lease renewed");
        }
        if !record.is_expired(now) {
            return Ok(false);
        }
        let lease = self.lease(now, None, record.transitions + 1, record.resource_version.clone())?;
        self.write(self.client.replace(&lease).await, "Took over expired lease")
    }

    fn write(&self, result: Result<Lease, ClusterError>, what: &str) -> Result<bool, ControllerError> {
        match result {
            Ok(_) => {
                debug!(identity = %self.config.identity, "{}", what);
                Ok(true)
            }
            Err(e) if e.is_conflict() || e.is_already_exists() => {
                debug!(identity = %self.config.identity, "Lost lease race");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn lease(
        &self,
        now: DateTime<Utc>,
        acquire_time: Option<String>,
        transitions: i64,
        resource_version: Option<String>,
    ) -> Result<Lease, ControllerError> {
        let mut metadata = json!({
            "name": self.config.lease_name,
            "namespace": self.config.namespace,
        });
        if let Some(rv) = resource_version {
            metadata["resourceVersion"] = Value::String(rv);
        }
        Ok(serde_json::from_value(json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": metadata,
            "spec": {
                "holderIdentity": self.config.identity,
                "leaseDurationSeconds": self.config.lease_duration.as_secs(),
                "acquireTime": acquire_time.unwrap_or_else(|| micro_time(now)),
                "renewTime": micro_time(now),
                "leaseTransitions": transitions,
            }
        }))?)
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>, cancel: CancellationToken) {
        let mut last_renewed = Instant::now();
        let mut wait = self.config.renew_interval;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    last_renewed = Instant::now();
                    wait = self.config.renew_interval;
                }
                Ok(false) => break,
                Err(e) if last_renewed.elapsed() < self.config.lease_duration => {
                    warn!(identity = %self.config.identity, error = %e, "Lease renewal failed, retrying");
                    wait = self.config.retry_interval;
                }
                Err(e) => {
                    warn!(identity = %self.config.identity, error = %e, "Lease expired while renewal kept failing");
                    break;
                }
            }
        }
        warn!(identity = %self.config.identity, "Leadership lost");
        let _ = lost_tx.send(());
    }

    /// Clear the holder so a standby can take over without waiting for
    /// the lease to expire.
    pub(crate) async fn release(&self) -> Result<(), ControllerError> {
        let Some(lease) = self.client.get::<Lease>(&self.key()).await? else {
            return Ok(());
        };
        let record = LeaseRecord::read(&lease)?;
        if record.holder.as_deref() != Some(self.config.identity.as_str()) {
            debug!(identity = %self.config.identity, "Not the lease holder, nothing to release");
            return Ok(());
        }
        let past = Utc::now() - chrono::Duration::seconds(60);
        let patch = json!({
            "metadata": { "resourceVersion": record.resource_version },
            "spec": { "holderIdentity": null, "renewTime": micro_time(past) }
        });
        self.client.patch_merge::<Lease>(&self.key(), &patch).await?;
        info!(identity = %self.config.identity, "Lease released");
        Ok(())
    }
}

/// Held while this replica leads. Renewal runs in the background until the
/// guard is released or dropped.
#[derive(Debug)]
pub struct LeaderGuard<C> {
    elector: Arc<LeaderElector<C>>,
    renewal_task: JoinHandle<()>,
    cancel: CancellationToken,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl<C: ClusterClient + 'static> LeaderGuard<C> {
    /// Resolves once leadership is lost
    pub async fn lost(&mut self) {
        match self.lost_rx.take() {
            Some(rx) => {
                let _ = rx.await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    /// Stop renewing and hand the lease back
    pub async fn release(self) -> Result<(), ControllerError> {
        self.cancel.cancel();
        self.elector.release().await
    }
}

impl<C> Drop for LeaderGuard<C> {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.renewal_task.abort();
    }
}
