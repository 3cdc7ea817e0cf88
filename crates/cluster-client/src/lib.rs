//! Kubernetes API client abstraction
//!
//! The tenancy reconcilers talk to the API server exclusively through the
//! [`ClusterClient`] trait: get / list / create / replace / replace_status /
//! patch / delete, with `metadata.resourceVersion` as the optimistic
//! concurrency token. A write carrying a stale version fails with
//! [`ClusterError::Conflict`] and must be retried after a fresh read.
//!
//! [`KubeClusterClient`] is the production implementation on top of
//! [`kube::Client`]. With the `test-util` feature an in-memory
//! `MockClusterClient` emulates enough of the API server (versions,
//! finalizer-gated deletion, label selectors, merge patch) for unit tests.

pub mod client;
pub mod error;
pub mod key;
pub mod selector;
#[path = "trait.rs"]
pub mod cluster_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::KubeClusterClient;
pub use cluster_trait::{ClusterClient, ClusterResource};
pub use error::{ClusterError, ignore_not_found};
pub use key::ObjectKey;
pub use selector::LabelSelector;
#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockClusterClient, MockFailure, Verb};
