//! Main controller implementation.
//!
//! Wires the kube-backed stores, the pod scheduler and the Vault health
//! client into a reconciler, then runs the VaultService watcher next to the
//! probe server.

use crate::config::Config;
use crate::error::ControllerError;
use crate::naming::VAULT_CLIENT_PORT;
use crate::probes::{self, Metrics, ProbeState};
use crate::reconciler::Reconciler;
use crate::scheduler::KubePodScheduler;
use crate::store::{KubeClusterStore, KubeSecretStore};
use crate::watcher::Watcher;
use crds::VaultService;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;
use vault_client::VaultClient;

/// Main controller for Vault clusters.
pub struct Controller {
    vault_service_watcher: JoinHandle<Result<(), ControllerError>>,
    probe_server: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance and starts its background tasks.
    pub async fn new(config: Config) -> Result<Self, ControllerError> {
        info!("Initializing Vault Controller");

        let kube_client = Client::try_default().await.map_err(ControllerError::Kube)?;

        let client_port = u16::try_from(VAULT_CLIENT_PORT)
            .map_err(|_| ControllerError::InvalidConfig(format!("invalid Vault port {}", VAULT_CLIENT_PORT)))?;
        let vault_client = VaultClient::new(client_port, config.probe_timeout);

        let (vault_service_api, pod_api): (Api<VaultService>, Api<Pod>) = match config.namespace.as_deref() {
            Some(ns) => (
                Api::namespaced(kube_client.clone(), ns),
                Api::namespaced(kube_client.clone(), ns),
            ),
            None => (Api::all(kube_client.clone()), Api::all(kube_client.clone())),
        };

        let metrics = Arc::new(Metrics::new()?);
        let probe_state = ProbeState::new(metrics.clone());
        let probes_addr = config.probes_addr;

        let reconciler = Arc::new(Reconciler::new(
            Arc::new(KubeClusterStore::new(kube_client.clone())),
            Arc::new(KubePodScheduler::new(kube_client.clone())),
            Arc::new(KubeSecretStore::new(kube_client)),
            Arc::new(vault_client),
            config,
            metrics,
        ));

        let watcher = Watcher::new(reconciler, vault_service_api, pod_api);
        let vault_service_watcher = tokio::spawn(async move { watcher.watch_vault_services().await });

        let probe_server = {
            let state = probe_state.clone();
            tokio::spawn(async move { probes::serve(probes_addr, state).await })
        };
        probe_state.set_ready();

        Ok(Self {
            vault_service_watcher,
            probe_server,
        })
    }

    /// Runs the controller until a background task exits.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Vault Controller running");

        tokio::select! {
            result = &mut self.vault_service_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("VaultService watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("VaultService watcher error: {}", e)))?;
            }
            result = &mut self.probe_server => {
                result.map_err(|e| ControllerError::Watch(format!("Probe server panicked: {}", e)))??;
            }
        }

        Ok(())
    }
}
