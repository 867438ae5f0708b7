//! Reconciliation loop for VaultService resources.
//!
//! One pass loads the resource, provisions TLS, probes the nodes, converges
//! membership, advances a rolling upgrade by at most one replacement, and
//! publishes status guarded by the resource version it started from. A
//! status conflict restarts the pass from a fresh read; nothing carries over
//! between passes except what is stored in the resource itself.

use crate::backoff::FibonacciBackoff;
use crate::config::Config;
use crate::error::ControllerError;
use crate::issuer::TlsIssuer;
use crate::naming::{ClusterRef, VAULT_CLIENT_PORT};
use crate::observer::{Observation, Observer, ProbedNode};
use crate::probes::Metrics;
use crate::scaling::{self, NodeAction};
use crate::scheduler::{NodeScheduler, NodeTemplate};
use crate::store::{ClusterStore, SecretStore, FINALIZER};
use crate::upgrade::{self, UpgradePlan, UpgradeState, UpgradeTarget};
use chrono::{SecondsFormat, Utc};
use crds::{
    Condition, VaultService, VaultServiceStatus, CONDITION_CONSISTENCY_WARNING,
    CONDITION_RECONCILE_FAILED, CONDITION_STALLED_UPGRADE, CONDITION_UPGRADING,
};
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use vault_client::VaultClientTrait;

/// Attempts per pass when the status write loses a race
const MAX_PASS_ATTEMPTS: u32 = 3;

/// Requeue delay while membership or version is still converging
const CONVERGING_REQUEUE: Duration = Duration::from_secs(5);

/// Backoff state for a resource
#[derive(Debug, Clone)]
struct BackoffState {
    backoff: FibonacciBackoff,
    error_count: u32,
}

impl BackoffState {
    fn new() -> Self {
        Self {
            backoff: FibonacciBackoff::new(2, 60), // 2 seconds min, 1 minute max
            error_count: 0,
        }
    }

    fn increment_error(&mut self) {
        self.error_count += 1;
    }

    fn reset(&mut self) {
        self.error_count = 0;
        self.backoff.reset();
    }
}

/// What the caller should do after a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The resource is gone or finished deleting
    Done,
    /// Reconcile again after this delay
    Requeue(Duration),
}

/// Reconciles VaultService resources.
pub struct Reconciler {
    clusters: Arc<dyn ClusterStore>,
    scheduler: Arc<dyn NodeScheduler>,
    issuer: TlsIssuer,
    observer: Observer,
    config: Config,
    metrics: Arc<Metrics>,
    /// Error count tracking per resource (namespace/name -> BackoffState)
    backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

impl Reconciler {
    pub fn new(
        clusters: Arc<dyn ClusterStore>,
        scheduler: Arc<dyn NodeScheduler>,
        secrets: Arc<dyn SecretStore>,
        vault: Arc<dyn VaultClientTrait>,
        config: Config,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            clusters,
            scheduler,
            issuer: TlsIssuer::new(secrets, config.cluster_domain.clone()),
            observer: Observer::new(vault),
            config,
            metrics,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs one reconciliation pass for `namespace/name`.
    ///
    /// A status write conflict restarts the pass from a fresh read, up to
    /// `MAX_PASS_ATTEMPTS` times; after that the conflict is returned.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Outcome, ControllerError> {
        let started = Instant::now();
        let key = format!("{}/{}", namespace, name);

        let mut attempt = 1;
        let result = loop {
            match self.pass(namespace, name).await {
                Err(ControllerError::Conflict(msg)) if attempt < MAX_PASS_ATTEMPTS => {
                    debug!("Conflict on attempt {} for {}: {}; restarting pass", attempt, key, msg);
                    attempt += 1;
                }
                result => break result,
            }
        };

        match &result {
            Ok(_) => {
                self.metrics.observe_reconcile("success", started.elapsed());
                self.reset_backoff(&key);
            }
            Err(e) => {
                self.metrics.observe_reconcile(e.reason(), started.elapsed());
                self.increment_error(&key);
            }
        }
        result
    }

    async fn pass(&self, namespace: &str, name: &str) -> Result<Outcome, ControllerError> {
        let Some(mut vs) = self.clusters.get(namespace, name).await? else {
            debug!("VaultService {}/{} no longer exists", namespace, name);
            return Ok(Outcome::Done);
        };
        let cluster = ClusterRef::from_resource(&vs)?;

        if vs.metadata.deletion_timestamp.is_some() {
            return self.finalize(&cluster, &vs).await;
        }

        if !vs.finalizers().iter().any(|f| f == FINALIZER) {
            self.clusters.add_finalizer(&vs).await?;
            // The finalizer patch moved the resource version on
            vs = match self.clusters.get(namespace, name).await? {
                Some(vs) => vs,
                None => return Ok(Outcome::Done),
            };
        }

        if let Err(reason) = vs.spec.validate() {
            warn!("VaultService {} has an invalid spec: {}", cluster.key(), reason);
            let err = ControllerError::InvalidConfig(reason);
            self.record_failure(&vs, &err).await;
            return Err(err);
        }

        match self.converge(&vs, &cluster).await {
            Err(e) if !matches!(e, ControllerError::Conflict(_)) => {
                warn!("Reconciliation of {} failed: {}", cluster.key(), e);
                self.record_failure(&vs, &e).await;
                Err(e)
            }
            other => other,
        }
    }

    /// Revokes TLS material and releases the finalizer of a deleted cluster.
    /// Nodes go with the resource through their owner references.
    async fn finalize(&self, cluster: &ClusterRef, vs: &VaultService) -> Result<Outcome, ControllerError> {
        if vs.finalizers().iter().any(|f| f == FINALIZER) {
            info!("VaultService {} is being deleted; revoking its TLS material", cluster.key());
            self.issuer.revoke(cluster).await?;
            self.clusters.remove_finalizer(vs).await?;
        }
        Ok(Outcome::Done)
    }

    async fn converge(&self, vs: &VaultService, cluster: &ClusterRef) -> Result<Outcome, ControllerError> {
        let spec = &vs.spec;
        let desired = usize::try_from(spec.nodes)
            .map_err(|_| ControllerError::InvalidConfig(format!("spec.nodes out of range: {}", spec.nodes)))?;

        let tls = self.issuer.ensure_tls(cluster, &spec.tls_policy()).await?;
        let members = self.scheduler.list_nodes(cluster).await?;
        let observation = self.observer.observe(&members, &tls.client_ca_pem).await;

        let template = |ordinal: u32| NodeTemplate {
            ordinal,
            version: spec.version.clone(),
            image: spec.image_for(&spec.version),
            server_tls_secret: tls.server_secret.clone(),
            etcd_client_secret: tls.etcd_client_secret.clone(),
        };

        let actions = scaling::reconcile_size(desired, &observation);
        for action in &actions {
            match action {
                NodeAction::Create { ordinal } => self.create_node(cluster, &template(*ordinal)).await?,
                NodeAction::Remove { name } => self.delete_node(cluster, name).await?,
            }
        }
        let removals = actions.iter().filter(|a| matches!(a, NodeAction::Remove { .. })).count();
        if observation.len() > desired + removals {
            warn!(
                "Cluster {} stays at {} nodes: the last unsealed node is never removed",
                cluster.key(),
                observation.len() - removals
            );
        }

        let previous = vs.status.clone().unwrap_or_default();
        let plan = upgrade::plan_upgrade(
            &UpgradeTarget {
                version: &spec.version,
                nodes: desired,
                current_version: &previous.current_version,
                progress: previous.upgrade.as_ref(),
                stall_threshold: self.config.stall_threshold,
            },
            &observation,
        );
        if plan.stalled {
            warn!("Upgrade of {} stalled: {}", cluster.key(), plan.message);
        }
        if let Some(replacement) = &plan.replace {
            info!("Upgrading {}: {}", cluster.key(), plan.message);
            self.delete_node(cluster, &replacement.name).await?;
            self.create_node(cluster, &template(replacement.ordinal)).await?;
        } else if plan.is_upgrading() {
            info!("Upgrade of {} is {}: {}", cluster.key(), plan.state, plan.message);
        }

        let status = build_status(vs, &previous, &observation, &plan, &now());
        if status == previous {
            debug!("Status of {} unchanged", cluster.key());
        } else {
            self.clusters.write_status(vs, &status).await?;
            debug!("Wrote status of {}", cluster.key());
        }

        let converging = !actions.is_empty()
            || plan.is_upgrading()
            || observation.len() != desired
            || !observation.sealed().is_empty()
            || !observation.unreachable().is_empty();
        let requeue = if converging {
            CONVERGING_REQUEUE.min(self.config.resync_interval)
        } else {
            self.config.resync_interval
        };
        Ok(Outcome::Requeue(requeue))
    }

    async fn create_node(&self, cluster: &ClusterRef, template: &NodeTemplate) -> Result<(), ControllerError> {
        match self.scheduler.create_node(cluster, template).await {
            Err(ControllerError::AlreadyExists(_)) => {
                debug!("Node {} already exists", cluster.node_name(template.ordinal));
                Ok(())
            }
            other => other,
        }
    }

    async fn delete_node(&self, cluster: &ClusterRef, name: &str) -> Result<(), ControllerError> {
        match self.scheduler.delete_node(cluster, name).await {
            Err(ControllerError::NotFound(_)) => {
                debug!("Node {}/{} already gone", cluster.namespace, name);
                Ok(())
            }
            other => other,
        }
    }

    /// Best effort: a failure to record the failure is only logged.
    async fn record_failure(&self, vs: &VaultService, err: &ControllerError) {
        let previous = vs.status.clone().unwrap_or_default();
        let mut status = previous.clone();
        status.conditions.retain(|c| c.r#type != CONDITION_RECONCILE_FAILED);
        let condition = Condition::active(CONDITION_RECONCILE_FAILED, err.reason(), err.to_string());
        status.conditions.push(carry_transition_time(condition, &previous, &now()));

        if status == previous {
            return;
        }
        if let Err(e) = self.clusters.write_status(vs, &status).await {
            warn!(
                "Failed to record failure on VaultService {}/{}: {}",
                vs.namespace().unwrap_or_default(),
                vs.name_any(),
                e
            );
        }
    }

    /// Get the Fibonacci backoff for a resource based on its error count
    ///
    /// Returns (backoff, error_count)
    pub fn backoff_for(&self, resource_key: &str) -> (Duration, u32) {
        match self.backoff_states.lock() {
            Ok(mut states) => {
                let state = states
                    .entry(resource_key.to_string())
                    .or_insert_with(BackoffState::new);
                (state.backoff.next_backoff(), state.error_count)
            }
            Err(e) => {
                warn!("Failed to lock backoff_states: {}, using default backoff", e);
                (CONVERGING_REQUEUE, 0)
            }
        }
    }

    fn increment_error(&self, resource_key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            states
                .entry(resource_key.to_string())
                .or_insert_with(BackoffState::new)
                .increment_error();
        }
    }

    fn reset_backoff(&self, resource_key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            if let Some(state) = states.get_mut(resource_key) {
                state.reset();
            }
        }
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Keeps the previous transition time when the condition's status did not
/// change, so an unchanged pass produces an identical status.
fn carry_transition_time(mut condition: Condition, previous: &VaultServiceStatus, now: &str) -> Condition {
    condition.last_transition_time = previous
        .condition(&condition.r#type)
        .filter(|p| p.status == condition.status)
        .and_then(|p| p.last_transition_time.clone())
        .or_else(|| Some(now.to_string()));
    condition
}

fn names(nodes: Vec<&ProbedNode>) -> Vec<String> {
    nodes.into_iter().map(|n| n.name.clone()).collect()
}

/// Status for one pass, derived from the observation taken before any
/// action of that pass.
pub(crate) fn build_status(
    vs: &VaultService,
    previous: &VaultServiceStatus,
    observation: &Observation,
    plan: &UpgradePlan,
    now: &str,
) -> VaultServiceStatus {
    let active = observation.active();

    // The cluster's version is the one its leader runs; without a leader the
    // recorded version stands
    let current_version = match plan.state {
        UpgradeState::Stable | UpgradeState::Complete if active.is_some() => vs.spec.version.clone(),
        UpgradeState::Stable | UpgradeState::Complete => previous.current_version.clone(),
        _ if previous.current_version.is_empty() => {
            active.map(|n| n.version.clone()).unwrap_or_default()
        }
        _ => previous.current_version.clone(),
    };

    let mut conditions = Vec::new();
    if observation.has_split_brain() {
        conditions.push(Condition::active(
            CONDITION_CONSISTENCY_WARNING,
            "MultipleActiveNodes",
            format!("nodes {} all report active", names(observation.actives()).join(", ")),
        ));
    }
    if plan.is_upgrading() {
        conditions.push(Condition::active(
            CONDITION_UPGRADING,
            &plan.state.to_string(),
            plan.message.clone(),
        ));
        let stalled_message = if plan.stalled {
            Some(plan.message.clone())
        } else {
            previous
                .condition(CONDITION_STALLED_UPGRADE)
                .map(|c| c.message.clone().unwrap_or_default())
        };
        if let Some(message) = stalled_message {
            conditions.push(Condition::active(
                CONDITION_STALLED_UPGRADE,
                "ReplacementStalled",
                message,
            ));
        }
    }
    let conditions = conditions
        .into_iter()
        .map(|c| carry_transition_time(c, previous, now))
        .collect();

    VaultServiceStatus {
        initialized: observation.initialized,
        sealed_nodes: names(observation.sealed()),
        active_node: active.map(|n| n.name.clone()),
        standby_nodes: names(observation.standby()),
        available_nodes: names(observation.available()),
        current_version,
        service_name: vs.name_any(),
        client_port: VAULT_CLIENT_PORT,
        upgrade: plan.progress.clone(),
        conditions,
    }
}

#[cfg(test)]
#[path = "reconciler_test.rs"]
mod reconciler_test;
