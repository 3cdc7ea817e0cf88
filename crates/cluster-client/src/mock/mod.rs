//! Mock ClusterClient for unit testing
//!
//! An in-memory stand-in for the API server. Objects are stored as JSON keyed
//! by kind and identity, so any typed resource can be used. Emulated server
//! behaviour:
//! - every write bumps `metadata.resourceVersion`; a replace carrying a stale
//!   version fails with `Conflict`
//! - `replace` keeps the stored status, `replace_status` only writes status
//! - deleting an object with finalizers only sets `deletionTimestamp`; the
//!   object disappears once its last finalizer is removed
//! - label-selector listing, merge patch
//!
//! Every successful write is journaled so tests can assert on exactly which
//! writes a reconcile issued.

mod merge;

use crate::cluster_trait::{ClusterClient, ClusterResource};
use crate::error::ClusterError;
use crate::key::ObjectKey;
use crate::selector::LabelSelector;
use merge::{has_finalizers, is_deleting, merge_patch, resource_version, set_metadata_field};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Kind of write recorded in the journal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    List,
    Create,
    Replace,
    ReplaceStatus,
    Patch,
    Delete,
}

/// One successful write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub verb: Verb,
    pub kind: String,
    pub key: ObjectKey,
}

/// Failure to inject into the next matching call
#[derive(Debug, Clone)]
pub enum MockFailure {
    NotFound,
    Conflict,
    AlreadyExists,
    Unavailable(String),
    Rejected(String),
}

impl MockFailure {
    fn into_error(self, what: &str) -> ClusterError {
        match self {
            MockFailure::NotFound => ClusterError::NotFound(what.to_string()),
            MockFailure::Conflict => ClusterError::Conflict(what.to_string()),
            MockFailure::AlreadyExists => ClusterError::AlreadyExists(what.to_string()),
            MockFailure::Unavailable(msg) => ClusterError::Unavailable(msg),
            MockFailure::Rejected(msg) => ClusterError::Rejected(msg),
        }
    }
}

type StoreKey = (String, ObjectKey);

#[derive(Default)]
struct State {
    objects: HashMap<StoreKey, Value>,
    writes: Vec<WriteRecord>,
    failures: VecDeque<(Verb, String, MockFailure)>,
    next_version: u64,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn take_failure(&mut self, verb: Verb, kind: &str) -> Option<MockFailure> {
        let idx = self
            .failures
            .iter()
            .position(|(v, k, _)| *v == verb && k == kind)?;
        self.failures.remove(idx).map(|(_, _, f)| f)
    }

    fn record(&mut self, verb: Verb, kind: &str, key: &ObjectKey) {
        self.writes.push(WriteRecord {
            verb,
            kind: kind.to_string(),
            key: key.clone(),
        });
    }
}

/// Mock ClusterClient for testing
#[derive(Clone, Default)]
pub struct MockClusterClient {
    state: Arc<Mutex<State>>,
}

fn kind_of<K: ClusterResource>() -> String {
    K::kind(&()).into_owned()
}

fn decode<K: ClusterResource>(value: &Value) -> Result<K, ClusterError> {
    Ok(serde_json::from_value(value.clone())?)
}

fn labels_of(value: &Value) -> BTreeMap<String, String> {
    value
        .get("metadata")
        .and_then(|m| m.get("labels"))
        .and_then(|l| serde_json::from_value(l.clone()).ok())
        .unwrap_or_default()
}

fn key_of<K: ClusterResource>(obj: &K) -> Result<ObjectKey, ClusterError> {
    let name = obj
        .meta()
        .name
        .clone()
        .ok_or_else(|| ClusterError::InvalidRequest(format!("{} without a name", kind_of::<K>())))?;
    Ok(ObjectKey {
        namespace: obj.meta().namespace.clone(),
        name,
    })
}

impl MockClusterClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed an object (for test setup). Status is kept, no write is journaled.
    pub fn insert<K: ClusterResource>(&self, obj: &K) -> K {
        let mut state = self.lock();
        let mut value = serde_json::to_value(obj).unwrap_or(Value::Null);
        let version = state.bump();
        set_metadata_field(&mut value, "resourceVersion", Value::String(version.clone()));
        if value["metadata"]["uid"].is_null() {
            set_metadata_field(&mut value, "uid", Value::String(format!("uid-{}", version)));
        }
        let key = ObjectKey::from_resource(obj);
        state.objects.insert((kind_of::<K>(), key), value.clone());
        serde_json::from_value(value).unwrap_or_else(|_| obj.clone())
    }

    /// Current stored copy of an object
    pub fn object<K: ClusterResource>(&self, key: &ObjectKey) -> Option<K> {
        let state = self.lock();
        state
            .objects
            .get(&(kind_of::<K>(), key.clone()))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// All stored objects of a kind
    pub fn objects<K: ClusterResource>(&self) -> Vec<K> {
        let kind = kind_of::<K>();
        let state = self.lock();
        let mut found: Vec<(ObjectKey, K)> = state
            .objects
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .filter_map(|((_, key), v)| serde_json::from_value(v.clone()).ok().map(|o| (key.clone(), o)))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found.into_iter().map(|(_, o)| o).collect()
    }

    /// Journal of successful writes since the last [`Self::clear_writes`]
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    /// Make the next `verb` call on kind `K` fail with `failure`
    pub fn fail_next<K: ClusterResource>(&self, verb: Verb, failure: MockFailure) {
        self.lock()
            .failures
            .push_back((verb, kind_of::<K>(), failure));
    }

    /// Store `value`, or drop it when it is being deleted and has no
    /// finalizers left.
    fn store_or_collect(state: &mut State, store_key: StoreKey, value: Value) {
        if is_deleting(&value) && !has_finalizers(&value) {
            state.objects.remove(&store_key);
        } else {
            state.objects.insert(store_key, value);
        }
    }

    fn check_version(stored: &Value, incoming: &Value, what: &str) -> Result<(), ClusterError> {
        match resource_version(incoming) {
            Some(v) if Some(v) != resource_version(stored) => Err(ClusterError::Conflict(format!(
                "{} has been modified; please apply your changes to the latest version",
                what
            ))),
            _ => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl ClusterClient for MockClusterClient {
    async fn get<K: ClusterResource>(&self, key: &ObjectKey) -> Result<Option<K>, ClusterError> {
        let kind = kind_of::<K>();
        let mut state = self.lock();
        if let Some(f) = state.take_failure(Verb::Get, &kind) {
            return match f {
                MockFailure::NotFound => Ok(None),
                other => Err(other.into_error(&key.to_string())),
            };
        }
        state
            .objects
            .get(&(kind, key.clone()))
            .map(decode::<K>)
            .transpose()
    }

    async fn list<K: ClusterResource>(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<K>, ClusterError> {
        let kind = kind_of::<K>();
        let mut state = self.lock();
        if let Some(f) = state.take_failure(Verb::List, &kind) {
            return Err(f.into_error(&kind));
        }
        let mut matching: Vec<(&ObjectKey, &Value)> = state
            .objects
            .iter()
            .filter(|((k, key), _)| {
                *k == kind && namespace.is_none_or(|ns| key.namespace.as_deref() == Some(ns))
            })
            .filter(|(_, v)| selector.matches(&labels_of(v)))
            .map(|((_, key), v)| (key, v))
            .collect();
        matching.sort_by(|a, b| a.0.cmp(b.0));
        matching.into_iter().map(|(_, v)| decode::<K>(v)).collect()
    }

    async fn create<K: ClusterResource>(&self, obj: &K) -> Result<K, ClusterError> {
        let kind = kind_of::<K>();
        let key = key_of(obj)?;
        let mut state = self.lock();
        if let Some(f) = state.take_failure(Verb::Create, &kind) {
            return Err(f.into_error(&key.to_string()));
        }
        let store_key = (kind.clone(), key.clone());
        if state.objects.contains_key(&store_key) {
            return Err(ClusterError::AlreadyExists(format!(
                "{} \"{}\" already exists",
                kind, key
            )));
        }
        let mut value = serde_json::to_value(obj)?;
        let version = state.bump();
        set_metadata_field(&mut value, "resourceVersion", Value::String(version.clone()));
        set_metadata_field(&mut value, "uid", Value::String(format!("uid-{}", version)));
        state.objects.insert(store_key, value.clone());
        state.record(Verb::Create, &kind, &key);
        decode(&value)
    }

    async fn replace<K: ClusterResource>(&self, obj: &K) -> Result<K, ClusterError> {
        let kind = kind_of::<K>();
        let key = key_of(obj)?;
        let mut state = self.lock();
        if let Some(f) = state.take_failure(Verb::Replace, &kind) {
            return Err(f.into_error(&key.to_string()));
        }
        let store_key = (kind.clone(), key.clone());
        let stored = state
            .objects
            .get(&store_key)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("{} \"{}\" not found", kind, key)))?;
        let mut value = serde_json::to_value(obj)?;
        Self::check_version(&stored, &value, &key.to_string())?;

        // Server-owned fields survive a full replace
        match stored.get("status") {
            Some(status) => value["status"] = status.clone(),
            None => {
                if let Value::Object(map) = &mut value {
                    map.remove("status");
                }
            }
        }
        for field in ["uid", "deletionTimestamp", "creationTimestamp"] {
            if let Some(v) = stored["metadata"].get(field) {
                set_metadata_field(&mut value, field, v.clone());
            }
        }
        let version = state.bump();
        set_metadata_field(&mut value, "resourceVersion", Value::String(version));
        Self::store_or_collect(&mut state, store_key, value.clone());
        state.record(Verb::Replace, &kind, &key);
        decode(&value)
    }

    async fn replace_status<K: ClusterResource>(&self, obj: &K) -> Result<K, ClusterError> {
        let kind = kind_of::<K>();
        let key = key_of(obj)?;
        let mut state = self.lock();
        if let Some(f) = state.take_failure(Verb::ReplaceStatus, &kind) {
            return Err(f.into_error(&key.to_string()));
        }
        let store_key = (kind.clone(), key.clone());
        let mut stored = state
            .objects
            .get(&store_key)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("{} \"{}\" not found", kind, key)))?;
        let incoming = serde_json::to_value(obj)?;
        Self::check_version(&stored, &incoming, &key.to_string())?;

        stored["status"] = incoming.get("status").cloned().unwrap_or(Value::Null);
        let version = state.bump();
        set_metadata_field(&mut stored, "resourceVersion", Value::String(version));
        state.objects.insert(store_key, stored.clone());
        state.record(Verb::ReplaceStatus, &kind, &key);
        decode(&stored)
    }

    async fn patch_merge<K: ClusterResource>(
        &self,
        key: &ObjectKey,
        patch: &serde_json::Value,
    ) -> Result<K, ClusterError> {
        let kind = kind_of::<K>();
        let mut state = self.lock();
        if let Some(f) = state.take_failure(Verb::Patch, &kind) {
            return Err(f.into_error(&key.to_string()));
        }
        let store_key = (kind.clone(), key.clone());
        let mut stored = state
            .objects
            .get(&store_key)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("{} \"{}\" not found", kind, key)))?;
        // A resourceVersion in the patch acts as a precondition
        Self::check_version(&stored, patch, &key.to_string())?;

        merge_patch(&mut stored, patch);
        let version = state.bump();
        set_metadata_field(&mut stored, "resourceVersion", Value::String(version));
        Self::store_or_collect(&mut state, store_key, stored.clone());
        state.record(Verb::Patch, &kind, key);
        decode(&stored)
    }

    async fn delete<K: ClusterResource>(&self, key: &ObjectKey) -> Result<(), ClusterError> {
        let kind = kind_of::<K>();
        let mut state = self.lock();
        if let Some(f) = state.take_failure(Verb::Delete, &kind) {
            return Err(f.into_error(&key.to_string()));
        }
        let store_key = (kind.clone(), key.clone());
        let Some(mut stored) = state.objects.get(&store_key).cloned() else {
            return Err(ClusterError::NotFound(format!("{} \"{}\" not found", kind, key)));
        };
        if has_finalizers(&stored) {
            if !is_deleting(&stored) {
                let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
                set_metadata_field(&mut stored, "deletionTimestamp", Value::String(now));
                let version = state.bump();
                set_metadata_field(&mut stored, "resourceVersion", Value::String(version));
                state.objects.insert(store_key, stored);
            }
        } else {
            state.objects.remove(&store_key);
        }
        state.record(Verb::Delete, &kind, key);
        Ok(())
    }
}
