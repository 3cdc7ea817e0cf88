//! Optional component discovery.
//!
//! The gate lists installed CRDs once this replica leads, derives which
//! optional components are present and then opens. Callers that depend on a
//! component wait for the gate instead of failing while discovery has not
//! run yet. CRD watch events keep the flags current afterwards without
//! closing the gate again.

use crate::error::ControllerError;
use crate::runner::ObjectEvent;
use cluster_client::{ClusterClient, LabelSelector};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::ResourceExt;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{PoisonError, RwLock};
use tokio::sync::watch;
use tracing::{debug, info};

/// Optional cluster components the reconcilers adapt to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Component {
    /// Tenant ingress controller operator
    Nginx,
    /// Service mesh
    Istio,
}

impl Component {
    /// Component providing the CRD group, if any
    pub fn for_group(group: &str) -> Option<Self> {
        match group {
            "networking.kuber.io" => Some(Component::Nginx),
            "install.istio.io" | "networking.istio.io" => Some(Component::Istio),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Component::Nginx => "nginx",
            Component::Istio => "istio",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Installed CRD names per component
#[derive(Debug, Default)]
struct Installed {
    nginx: BTreeSet<String>,
    istio: BTreeSet<String>,
}

impl Installed {
    fn has_any(&self, component: Component) -> bool {
        match component {
            Component::Nginx => !self.nginx.is_empty(),
            Component::Istio => !self.istio.is_empty(),
        }
    }

    fn crds(&mut self, component: Component) -> &mut BTreeSet<String> {
        match component {
            Component::Nginx => &mut self.nginx,
            Component::Istio => &mut self.istio,
        }
    }
}

/// Readiness gate plus component flags. Constructed once and shared.
#[derive(Debug)]
pub struct PluginStatus {
    installed: RwLock<Installed>,
    ready: watch::Sender<bool>,
}

impl Default for PluginStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginStatus {
    pub fn new() -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            installed: RwLock::new(Installed::default()),
            ready,
        }
    }

    /// List installed CRDs, record the components they belong to and open
    /// the gate.
    pub async fn init<C: ClusterClient>(&self, client: &C) -> Result<(), ControllerError> {
        let crds: Vec<CustomResourceDefinition> = client
            .list(None, &LabelSelector::everything())
            .await
            .map_err(|e| ControllerError::Readiness(format!("listing CustomResourceDefinitions: {}", e)))?;
        for crd in &crds {
            self.observe(crd, true);
        }
        self.ready.send_replace(true);
        info!(
            nginx = self.enabled_now(Component::Nginx),
            istio = self.enabled_now(Component::Istio),
            "Plugin status initialised"
        );
        Ok(())
    }

    #[cfg(test)]
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until [`PluginStatus::init`] has completed
    pub async fn wait_ready(&self) {
        let mut rx = self.ready.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Whether `component` is installed, waiting for the gate first
    pub async fn component_enabled(&self, component: Component) -> bool {
        self.wait_ready().await;
        self.enabled_now(component)
    }

    fn enabled_now(&self, component: Component) -> bool {
        self.installed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .has_any(component)
    }

    /// Record a CRD appearing (`present`) or going away. Returns whether
    /// the component's enabled flag flipped.
    pub fn observe(&self, crd: &CustomResourceDefinition, present: bool) -> bool {
        let Some(component) = Component::for_group(&crd.spec.group) else {
            return false;
        };
        let name = crd.name_any();
        let mut installed = self.installed.write().unwrap_or_else(PoisonError::into_inner);
        let was_enabled = installed.has_any(component);
        let crds = installed.crds(component);
        let changed = if present {
            crds.insert(name.clone())
        } else {
            crds.remove(&name)
        };
        if changed {
            debug!(%component, crd = %name, present, "Plugin CRD changed");
        }
        let flipped = was_enabled != installed.has_any(component);
        if flipped {
            info!(%component, enabled = !was_enabled, "Plugin component changed");
        }
        flipped
    }

    /// Apply a CRD watch event, see [`PluginStatus::observe`]
    pub fn apply(&self, event: &ObjectEvent<CustomResourceDefinition>) -> bool {
        match event {
            ObjectEvent::Created(crd) => self.observe(crd, true),
            ObjectEvent::Updated { new, .. } => self.observe(new, new.metadata.deletion_timestamp.is_none()),
            ObjectEvent::Deleted(crd) => self.observe(crd, false),
        }
    }
}
