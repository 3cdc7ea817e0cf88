//! Kuber Tenant Controller
//!
//! Multi-tenancy controller for the `go.kuber.io` CRDs:
//! - Tenant: finalizers, default quota and network policy, status
//! - Environment: target namespace, labels, namespace quota, cleanup
//! - TenantResourceQuota: aggregated usage of the tenant's namespace quotas
//! - TenantNetworkPolicy: native NetworkPolicies implementing isolation
//!
//! Configuration is read from environment variables, see [`config`].

mod backoff;
mod cache;
mod config;
mod controller;
mod error;
mod events;
mod leader;
mod plugin_status;
mod quantity;
mod reconcile_helpers;
mod reconciler;
mod routers;
mod runner;
#[cfg(test)]
mod test_utils;

use crate::config::ControllerConfig;
use anyhow::Context as _;
use controller::Controller;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install the rustls crypto provider"))?;

    info!("Starting Kuber Tenant Controller");

    let config = ControllerConfig::from_env().context("loading configuration")?;
    info!("Configuration:");
    info!("  Workers per reconciler: {}", config.workers);
    match &config.leader_election {
        Some(le) => info!(
            "  Leader election: lease {}/{} as {}",
            le.namespace, le.lease_name, le.identity
        ),
        None => info!("  Leader election: disabled"),
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal.cancel();
    });

    let controller = Controller::new(config).await.context("connecting to the cluster")?;
    if let Err(e) = controller.run(shutdown).await {
        error!(error = %e, "Controller exited with an error");
        return Err(e.into());
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => info!("Captured Ctrl+C"),
        _ = terminate => info!("Captured SIGTERM"),
    }
}
