//! Generic reconcile runner.
//!
//! Informers feed object keys into a [`WorkQueue`]; a pool of workers pops
//! keys and hands them to a typed [`Reconcile`] implementation. Failed keys
//! are re-queued with per-key exponential backoff. Errors that retrying
//! cannot fix are dropped after `max_permanent_retries` attempts.

pub mod informer;
pub mod queue;

pub use informer::{EventHandler, Informer, ObjectEvent, Store};
pub use queue::WorkQueue;

use crate::backoff::BackoffStates;
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use async_trait::async_trait;
use cluster_client::ObjectKey;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What the runner does with a key after a successful reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing further until a new event arrives
    AwaitChange,
    /// Reconcile again after the delay
    RequeueAfter(Duration),
}

/// One typed reconciler
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    /// Kind name used in logs
    fn kind(&self) -> &'static str;

    /// Converge the object identified by `key`. A key whose object no
    /// longer exists must succeed as a no-op.
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ControllerError>;
}

/// Worker pool driving one reconciler from one queue
pub struct Runner<R> {
    reconciler: Arc<R>,
    queue: WorkQueue,
    backoff: Arc<BackoffStates>,
    workers: usize,
    max_permanent_retries: u32,
}

impl<R> Clone for Runner<R> {
    fn clone(&self) -> Self {
        Self {
            reconciler: self.reconciler.clone(),
            queue: self.queue.clone(),
            backoff: self.backoff.clone(),
            workers: self.workers,
            max_permanent_retries: self.max_permanent_retries,
        }
    }
}

impl<R: Reconcile> Runner<R> {
    pub fn new(reconciler: R, queue: WorkQueue, config: &ControllerConfig) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            queue,
            backoff: Arc::new(BackoffStates::new(config.backoff_base, config.backoff_max)),
            workers: config.workers,
            max_permanent_retries: config.max_permanent_retries,
        }
    }

    /// Run the workers until `cancel` fires, then drain them.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ControllerError> {
        let kind = self.reconciler.kind();
        info!(kind, workers = self.workers, "Starting reconcile workers");

        let mut handles = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            let runner = self.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move { runner.work(cancel).await }));
        }

        cancel.cancelled().await;
        self.queue.shutdown();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(kind, error = %e, "Reconcile worker panicked");
            }
        }
        info!(kind, "Reconcile workers stopped");
        Ok(())
    }

    async fn work(&self, cancel: CancellationToken) {
        loop {
            let key = tokio::select! {
                _ = cancel.cancelled() => return,
                key = self.queue.get() => match key {
                    Some(key) => key,
                    None => return,
                },
            };
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.queue.done(&key);
                    return;
                }
                _ = self.process(&key) => {}
            }
            self.queue.done(&key);
        }
    }

    /// Reconcile one key and schedule its follow-up
    pub(crate) async fn process(&self, key: &ObjectKey) {
        let kind = self.reconciler.kind();
        match self.reconciler.reconcile(key).await {
            Ok(Action::AwaitChange) => {
                debug!(kind, key = %key, "Reconciled");
                self.backoff.reset(key);
            }
            Ok(Action::RequeueAfter(delay)) => {
                debug!(kind, key = %key, ?delay, "Reconciled, requeue scheduled");
                self.backoff.reset(key);
                self.queue.add_after(key.clone(), delay);
            }
            Err(e) => {
                let (delay, failures) = self.backoff.record_failure(key);
                if !e.is_transient() && failures > self.max_permanent_retries {
                    error!(kind, key = %key, failures, error = %e, "Dropping request after repeated failures");
                    self.backoff.reset(key);
                    return;
                }
                warn!(kind, key = %key, failures, ?delay, error = %e, "Reconcile failed, retrying");
                self.queue.add_after(key.clone(), delay);
            }
        }
    }
}
