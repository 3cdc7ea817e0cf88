//! Watch-backed object caches.
//!
//! An [`Informer`] keeps a local copy of every object of one kind and turns
//! the raw watch stream into created/updated/deleted notifications with the
//! previous object attached, which the event routers need to tell real
//! changes from no-op updates. Informers run on every replica regardless of
//! leadership.

use crate::error::ControllerError;
use cluster_client::{ClusterResource, ObjectKey};
use futures::{StreamExt, pin_mut};
use kube::{Api, ResourceExt};
use kube_runtime::{WatchStreamExt, watcher};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A change observed on a watched object
#[derive(Debug, Clone)]
pub enum ObjectEvent<K> {
    Created(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(Arc<K>),
}

/// Receives every change an informer observes
pub trait EventHandler<K>: Send + Sync {
    fn handle(&self, event: &ObjectEvent<K>);
}

/// Read-only view of an informer's cache, shared with routers and the
/// cached client
#[derive(Debug)]
pub struct Store<K> {
    state: RwLock<StoreState<K>>,
    /// Label whose values are indexed
    index_label: Option<&'static str>,
    synced: watch::Sender<bool>,
}

#[derive(Debug)]
struct StoreState<K> {
    objects: HashMap<ObjectKey, Arc<K>>,
    by_label: HashMap<String, BTreeSet<ObjectKey>>,
}

impl<K> Default for Store<K> {
    fn default() -> Self {
        Self::new(None)
    }
}

impl<K> Store<K> {
    fn new(index_label: Option<&'static str>) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            state: RwLock::new(StoreState {
                objects: HashMap::new(),
                by_label: HashMap::new(),
            }),
            index_label,
            synced,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState<K>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState<K>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self.read().objects.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.read().objects.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn index_label(&self) -> Option<&'static str> {
        self.index_label
    }

    /// Objects whose indexed label equals `value`, ordered by key. Empty
    /// when the store has no index.
    pub fn by_label(&self, value: &str) -> Vec<Arc<K>> {
        let state = self.read();
        state
            .by_label
            .get(value)
            .into_iter()
            .flatten()
            .filter_map(|key| state.objects.get(key).cloned())
            .collect()
    }

    /// Whether the first full list has been applied
    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    pub fn subscribe_synced(&self) -> watch::Receiver<bool> {
        self.synced.subscribe()
    }

    fn mark_synced(&self) {
        self.synced.send_if_modified(|synced| !std::mem::replace(synced, true));
    }
}

impl<K: ClusterResource> Store<K> {
    fn indexed_value(&self, obj: &K) -> Option<String> {
        let label = self.index_label?;
        obj.labels().get(label).cloned()
    }

    fn insert(&self, key: ObjectKey, obj: Arc<K>) -> Option<Arc<K>> {
        let value = self.indexed_value(&obj);
        let mut state = self.write();
        let old = state.objects.insert(key.clone(), obj);
        if let Some(old_value) = old.as_deref().and_then(|o| self.indexed_value(o)) {
            unindex(&mut state.by_label, &old_value, &key);
        }
        if let Some(value) = value {
            state.by_label.entry(value).or_default().insert(key);
        }
        old
    }

    fn remove(&self, key: &ObjectKey) -> Option<Arc<K>> {
        let mut state = self.write();
        let old = state.objects.remove(key);
        if let Some(old_value) = old.as_deref().and_then(|o| self.indexed_value(o)) {
            unindex(&mut state.by_label, &old_value, key);
        }
        old
    }
}

fn unindex(index: &mut HashMap<String, BTreeSet<ObjectKey>>, value: &str, key: &ObjectKey) {
    if let Some(keys) = index.get_mut(value) {
        keys.remove(key);
        if keys.is_empty() {
            index.remove(value);
        }
    }
}

/// Cache plus fan-out of one watched kind
pub struct Informer<K> {
    name: &'static str,
    store: Arc<Store<K>>,
    handlers: Vec<Arc<dyn EventHandler<K>>>,
    /// Keys seen during an in-progress relist
    relisted: Option<HashSet<ObjectKey>>,
}

impl<K: ClusterResource> Informer<K> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            store: Arc::new(Store::default()),
            handlers: Vec::new(),
            relisted: None,
        }
    }

    /// Index the cache on the values of `label`
    pub fn index_label(mut self, label: &'static str) -> Self {
        self.store = Arc::new(Store::new(Some(label)));
        self
    }

    pub fn store(&self) -> Arc<Store<K>> {
        self.store.clone()
    }

    pub fn add_handler(&mut self, handler: Arc<dyn EventHandler<K>>) {
        self.handlers.push(handler);
    }

    /// Fold one watch event into the cache and notify handlers
    pub fn apply(&mut self, event: watcher::Event<K>) {
        match event {
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
            }
            watcher::Event::InitApply(obj) => {
                let key = ObjectKey::from_resource(&obj);
                if let Some(seen) = self.relisted.as_mut() {
                    seen.insert(key);
                }
                self.upsert(obj);
            }
            watcher::Event::InitDone => {
                // Anything cached but absent from the relist was deleted
                // while the watch was down
                if let Some(seen) = self.relisted.take() {
                    for key in self.store.keys() {
                        if seen.contains(&key) {
                            continue;
                        }
                        if let Some(old) = self.store.remove(&key) {
                            self.dispatch(&ObjectEvent::Deleted(old));
                        }
                    }
                }
                self.store.mark_synced();
                debug!(informer = self.name, objects = self.store.len(), "Cache synced");
            }
            watcher::Event::Apply(obj) => self.upsert(obj),
            watcher::Event::Delete(obj) => {
                let key = ObjectKey::from_resource(&obj);
                let removed = self.store.remove(&key).unwrap_or_else(|| Arc::new(obj));
                self.dispatch(&ObjectEvent::Deleted(removed));
            }
        }
    }

    fn upsert(&mut self, obj: K) {
        let key = ObjectKey::from_resource(&obj);
        let new = Arc::new(obj);
        match self.store.insert(key, new.clone()) {
            None => self.dispatch(&ObjectEvent::Created(new)),
            Some(old) => {
                // A relist replays unchanged objects
                if old.resource_version().is_some() && old.resource_version() == new.resource_version()
                {
                    return;
                }
                self.dispatch(&ObjectEvent::Updated { old, new });
            }
        }
    }

    fn dispatch(&self, event: &ObjectEvent<K>) {
        for handler in &self.handlers {
            handler.handle(event);
        }
    }

    /// Watch `api` until `cancel` fires. Watch errors are retried with
    /// the watcher's default backoff.
    pub async fn run(mut self, api: Api<K>, cancel: CancellationToken) -> Result<(), ControllerError> {
        info!(informer = self.name, "Starting informer");
        let stream = watcher(api, watcher::Config::default()).default_backoff();
        pin_mut!(stream);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(informer = self.name, "Informer stopped");
                    return Ok(());
                }
                next = stream.next() => match next {
                    Some(Ok(event)) => self.apply(event),
                    Some(Err(e)) => warn!(informer = self.name, error = %e, "Watch error, retrying"),
                    None => {
                        return Err(ControllerError::Watch(format!(
                            "{} watch stream ended",
                            self.name
                        )));
                    }
                },
            }
        }
    }
}
