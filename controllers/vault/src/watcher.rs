//! Kubernetes resource watchers.
//!
//! Drives the reconciler from `kube_runtime::Controller`: VaultService
//! events and events on the pods it owns both trigger a pass for the owning
//! VaultService.

use crate::error::ControllerError;
use crate::naming::{APP_NAME, LABEL_APP};
use crate::reconciler::{Outcome, Reconciler};
use crds::VaultService;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, ResourceExt};
use kube_runtime::{Controller, watcher, controller::{Action, Config as ControllerConfig}};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

async fn reconcile(obj: Arc<VaultService>, ctx: Arc<Reconciler>) -> Result<Action, ControllerError> {
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    debug!("Reconciling VaultService {}/{}", namespace, name);

    match ctx.reconcile(&namespace, &name).await {
        Ok(Outcome::Done) => Ok(Action::await_change()),
        Ok(Outcome::Requeue(after)) => Ok(Action::requeue(after)),
        Err(e) => {
            error!("Reconciliation failed for VaultService {}/{}: {}", namespace, name, e);
            Err(e)
        }
    }
}

/// Retryable failures back off per resource; anything else waits for the
/// next resync or a spec change.
fn error_policy(obj: Arc<VaultService>, error: &ControllerError, ctx: Arc<Reconciler>) -> Action {
    let key = format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any());
    if error.is_retryable() {
        let (backoff, error_count) = ctx.backoff_for(&key);
        warn!(
            "Retrying VaultService {} in {:?} after {} consecutive errors: {}",
            key, backoff, error_count, error
        );
        Action::requeue(backoff)
    } else {
        Action::requeue(ctx.config().resync_interval)
    }
}

/// Watches VaultServices and their pods.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    vault_service_api: Api<VaultService>,
    pod_api: Api<Pod>,
}

impl Watcher {
    pub fn new(reconciler: Arc<Reconciler>, vault_service_api: Api<VaultService>, pod_api: Api<Pod>) -> Self {
        Self {
            reconciler,
            vault_service_api,
            pod_api,
        }
    }

    /// Runs until the watch stream ends.
    pub async fn watch_vault_services(&self) -> Result<(), ControllerError> {
        info!("Starting VaultService watcher");

        // Debounce batches bursts of pod and status events into one pass
        let controller_config = ControllerConfig::default()
            .debounce(std::time::Duration::from_secs(1))
            .concurrency(self.reconciler.config().concurrency);
        let pods = watcher::Config::default().labels(&format!("{}={}", LABEL_APP, APP_NAME));

        Controller::new(self.vault_service_api.clone(), watcher::Config::default())
            .owns(self.pod_api.clone(), pods)
            .with_config(controller_config)
            .run(reconcile, error_policy, self.reconciler.clone())
            .for_each(|res| async move {
                match res {
                    Ok((obj, _)) => debug!("Reconciled VaultService {}", obj.name),
                    Err(e) => error!("Controller error for VaultService: {}", e),
                }
            })
            .await;

        Err(ControllerError::Watch("VaultService watch stream ended".to_string()))
    }
}
