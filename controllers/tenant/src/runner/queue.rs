//! Deduplicating work queue of object identities.
//!
//! A key is held at most once in the queue. While a worker processes a
//! key, further adds for it are parked in `dirty` and the key is queued
//! again only once [`WorkQueue::done`] is called, so one object is never
//! reconciled by two workers at the same time.

use cluster_client::ObjectKey;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<ObjectKey>,
    /// Keys waiting to be processed (queued or parked behind a worker)
    dirty: HashSet<ObjectKey>,
    processing: HashSet<ObjectKey>,
    shutting_down: bool,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<QueueState>,
    notify: Notify,
}

/// Cloneable handle to a shared queue
#[derive(Debug, Clone, Default)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue `key` unless it is already pending
    pub fn add(&self, key: ObjectKey) {
        let mut state = self.lock();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Enqueue `key` once `delay` has passed
    pub fn add_after(&self, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    ///
    /// The caller owns the key until it calls [`WorkQueue::done`].
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    // Wake another worker if more keys are waiting
                    if !state.queue.is_empty() {
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Release `key`. A key added while it was processing is queued again.
    pub fn done(&self, key: &ObjectKey) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stop handing out keys and wake every waiting worker
    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    /// Number of keys ready to be handed out
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::cluster(name)
    }

    #[tokio::test]
    async fn test_duplicate_adds_collapse() {
        let queue = WorkQueue::new();
        queue.add(key("acme"));
        queue.add(key("acme"));
        queue.add(key("globex"));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await, Some(key("acme")));
        assert_eq!(queue.get().await, Some(key("globex")));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_add_while_processing_is_deferred() {
        let queue = WorkQueue::new();
        queue.add(key("acme"));
        let got = queue.get().await;
        assert_eq!(got, Some(key("acme")));

        // Two events while the first reconcile runs merge into one re-run
        queue.add(key("acme"));
        queue.add(key("acme"));
        assert!(queue.is_empty(), "key must not be handed out twice concurrently");

        queue.done(&key("acme"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some(key("acme")));
        queue.done(&key("acme"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_get_waits_for_add() {
        let queue = WorkQueue::new();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.add(key("acme"));

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("worker woken")
            .expect("task joined");
        assert_eq!(got, Some(key("acme")));
    }

    #[tokio::test]
    async fn test_add_after_delays() {
        let queue = WorkQueue::new();
        queue.add_after(key("acme"), Duration::from_millis(30));
        assert!(queue.is_empty());

        let got = tokio::time::timeout(Duration::from_secs(1), queue.get())
            .await
            .expect("delayed key arrives");
        assert_eq!(got, Some(key("acme")));
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters() {
        let queue = WorkQueue::new();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.shutdown();

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter released")
            .expect("task joined");
        assert_eq!(got, None);

        queue.add(key("acme"));
        assert!(queue.is_empty());
    }
}
