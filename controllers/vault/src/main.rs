//! Vault Controller
//!
//! Runs highly available Vault clusters declared as `VaultService`
//! resources: issues their TLS material, keeps the node count at the
//! declared size, reports which nodes are sealed, active or standby, and
//! rolls out new Vault versions one node at a time.

mod backoff;
mod config;
mod controller;
mod error;
mod issuer;
mod naming;
mod observer;
mod pki;
mod probes;
mod reconciler;
mod scaling;
mod scheduler;
mod store;
mod upgrade;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::Config;
use crate::error::ControllerError;
use controller::Controller;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // kube and reqwest both speak rustls; pin the ring provider for the process
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        debug!("rustls crypto provider already installed");
    }

    info!("Starting Vault Controller");

    let config = Config::from_env()?;
    info!("Configuration:");
    info!("  Namespace: {}", config.namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Cluster domain: {}", config.cluster_domain);
    info!("  Resync interval: {:?}", config.resync_interval);
    info!("  Probe timeout: {:?}", config.probe_timeout);
    info!("  Stall threshold: {} passes", config.stall_threshold);

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
