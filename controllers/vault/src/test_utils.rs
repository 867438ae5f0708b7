//! Test utilities for unit testing the reconciler
//!
//! In-memory stand-ins for the resource store, the secret store, and a
//! simulated Vault cluster that plays both the scheduler and the probe
//! target.

use crate::error::ControllerError;
use crate::naming::ClusterRef;
use crate::scheduler::{NodeInfo, NodeScheduler, NodeTemplate};
use crate::store::{ClusterStore, NewSecret, SecretData, SecretStore, FINALIZER};
use crds::{VaultService, VaultServiceSpec, VaultServiceStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use vault_client::{HealthResponse, VaultClientTrait, VaultError};

/// Helper to create a test VaultService
pub fn create_test_vault_service(name: &str, namespace: &str, nodes: i32, version: &str) -> VaultService {
    let mut vs = VaultService::new(
        name,
        VaultServiceSpec {
            nodes,
            version: version.to_string(),
            ..Default::default()
        },
    );
    vs.metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        uid: Some(format!("uid-{}", name)),
        ..Default::default()
    };
    vs
}

/// Secrets kept in memory, keyed by (namespace, name)
#[derive(Default)]
pub struct FakeSecretStore {
    secrets: Mutex<HashMap<(String, String), NewSecret>>,
    creates: AtomicUsize,
    /// Names whose create reports AlreadyExists while nothing is stored
    lost_races: Mutex<HashSet<String>>,
}

impl FakeSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a secret without counting it as a create
    pub fn insert(&self, namespace: &str, name: &str, data: SecretData) {
        self.secrets.lock().unwrap().insert(
            (namespace.to_string(), name.to_string()),
            NewSecret {
                name: name.to_string(),
                data,
                labels: BTreeMap::new(),
                owner: None,
            },
        );
    }

    pub fn stored(&self, namespace: &str, name: &str) -> Option<NewSecret> {
        self.secrets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.secrets.lock().unwrap().keys().map(|(_, n)| n.clone()).collect();
        names.sort();
        names
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Next create of `name` loses a race against a writer that deletes
    /// the secret again before it can be read
    pub fn lose_create_race(&self, name: &str) {
        self.lost_races.lock().unwrap().insert(name.to_string());
    }
}

#[async_trait::async_trait]
impl SecretStore for FakeSecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<SecretData>, ControllerError> {
        Ok(self.stored(namespace, name).map(|s| s.data))
    }

    async fn create(&self, namespace: &str, secret: NewSecret) -> Result<(), ControllerError> {
        if self.lost_races.lock().unwrap().remove(&secret.name) {
            return Err(ControllerError::AlreadyExists(format!("secret {}/{}", namespace, secret.name)));
        }
        let mut secrets = self.secrets.lock().unwrap();
        let key = (namespace.to_string(), secret.name.clone());
        if secrets.contains_key(&key) {
            return Err(ControllerError::AlreadyExists(format!("secret {}/{}", namespace, secret.name)));
        }
        self.creates.fetch_add(1, Ordering::SeqCst);
        secrets.insert(key, secret);
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ControllerError> {
        self.secrets
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| ControllerError::NotFound(format!("secret {}/{}", namespace, name)))
    }
}

/// VaultServices kept in memory with a resource version per object
#[derive(Default)]
pub struct FakeClusterStore {
    clusters: Mutex<HashMap<(String, String), VaultService>>,
    next_version: AtomicUsize,
    injected_conflicts: AtomicUsize,
    status_writes: AtomicUsize,
}

impl FakeClusterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self, vs: &mut VaultService) {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        vs.metadata.resource_version = Some(version.to_string());
    }

    pub fn insert(&self, mut vs: VaultService) {
        self.bump(&mut vs);
        let key = (vs.namespace().unwrap_or_default(), vs.name_any());
        self.clusters.lock().unwrap().insert(key, vs);
    }

    /// Applies a user edit to the spec, bumping the resource version
    pub fn update_spec(&self, namespace: &str, name: &str, edit: impl FnOnce(&mut VaultServiceSpec)) {
        let mut clusters = self.clusters.lock().unwrap();
        if let Some(vs) = clusters.get_mut(&(namespace.to_string(), name.to_string())) {
            edit(&mut vs.spec);
            let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
            vs.metadata.resource_version = Some(version.to_string());
        }
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        self.clusters
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Sets a deletion timestamp; the object goes away once its finalizers do
    pub fn mark_deleted(&self, namespace: &str, name: &str) {
        let mut clusters = self.clusters.lock().unwrap();
        if let Some(vs) = clusters.get_mut(&(namespace.to_string(), name.to_string())) {
            vs.metadata.deletion_timestamp = serde_json::from_value(serde_json::json!("2026-10-19T00:00:00Z")).ok();
            let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
            vs.metadata.resource_version = Some(version.to_string());
        }
    }

    pub fn exists(&self, namespace: &str, name: &str) -> bool {
        self.clusters
            .lock()
            .unwrap()
            .contains_key(&(namespace.to_string(), name.to_string()))
    }

    pub fn finalizers(&self, namespace: &str, name: &str) -> Vec<String> {
        self.clusters
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .and_then(|vs| vs.metadata.finalizers.clone())
            .unwrap_or_default()
    }

    pub fn status(&self, namespace: &str, name: &str) -> VaultServiceStatus {
        self.clusters
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .and_then(|vs| vs.status.clone())
            .unwrap_or_default()
    }

    /// The next `n` status writes fail with a conflict, as if another
    /// writer raced each of them
    pub fn inject_conflicts(&self, n: usize) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ClusterStore for FakeClusterStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<VaultService>, ControllerError> {
        Ok(self
            .clusters
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn write_status(&self, cluster: &VaultService, status: &VaultServiceStatus) -> Result<(), ControllerError> {
        let key = (cluster.namespace().unwrap_or_default(), cluster.name_any());
        let mut clusters = self.clusters.lock().unwrap();
        let stored = clusters
            .get_mut(&key)
            .ok_or_else(|| ControllerError::NotFound(format!("VaultService {}/{}", key.0, key.1)))?;

        let pending = self.injected_conflicts.load(Ordering::SeqCst);
        if pending > 0 {
            self.injected_conflicts.store(pending - 1, Ordering::SeqCst);
            let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
            stored.metadata.resource_version = Some(version.to_string());
            return Err(ControllerError::Conflict(format!("VaultService {}/{}", key.0, key.1)));
        }
        if stored.metadata.resource_version != cluster.metadata.resource_version {
            return Err(ControllerError::Conflict(format!("VaultService {}/{}", key.0, key.1)));
        }

        stored.status = Some(status.clone());
        let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        stored.metadata.resource_version = Some(version.to_string());
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn add_finalizer(&self, cluster: &VaultService) -> Result<(), ControllerError> {
        let key = (cluster.namespace().unwrap_or_default(), cluster.name_any());
        let mut clusters = self.clusters.lock().unwrap();
        let stored = clusters
            .get_mut(&key)
            .ok_or_else(|| ControllerError::NotFound(format!("VaultService {}/{}", key.0, key.1)))?;
        if stored.metadata.resource_version != cluster.metadata.resource_version {
            return Err(ControllerError::Conflict(format!("VaultService {}/{}", key.0, key.1)));
        }
        stored
            .metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(FINALIZER.to_string());
        let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        stored.metadata.resource_version = Some(version.to_string());
        Ok(())
    }

    async fn remove_finalizer(&self, cluster: &VaultService) -> Result<(), ControllerError> {
        let key = (cluster.namespace().unwrap_or_default(), cluster.name_any());
        let mut clusters = self.clusters.lock().unwrap();
        let Some(stored) = clusters.get_mut(&key) else {
            return Ok(());
        };
        if let Some(finalizers) = stored.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != FINALIZER);
        }
        let released = stored.metadata.finalizers.as_ref().is_none_or(|f| f.is_empty());
        if released && stored.metadata.deletion_timestamp.is_some() {
            clusters.remove(&key);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct SimNode {
    ordinal: u32,
    address: String,
    version: String,
    sealed: bool,
    active: bool,
}

#[derive(Default)]
struct SimState {
    nodes: BTreeMap<String, SimNode>,
    next_ip: u32,
    initialized: bool,
    unreachable: HashSet<String>,
    creates: usize,
    deletes: usize,
    drop_creates: bool,
}

/// A simulated Vault cluster.
///
/// New nodes start sealed. Unsealing a node makes it active when no active
/// node exists, standby otherwise. Deleting the active node promotes the
/// lowest-named standby, like Vault's HA failover.
#[derive(Default)]
pub struct SimCluster {
    state: Mutex<SimState>,
}

impl SimCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// `vault operator init` against any node
    pub fn initialize(&self) {
        self.state.lock().unwrap().initialized = true;
    }

    pub fn unseal(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        let has_active = state.nodes.values().any(|n| n.active);
        if let Some(node) = state.nodes.get_mut(name).filter(|n| n.sealed) {
            node.sealed = false;
            node.active = !has_active;
        }
    }

    /// Unseals every sealed node in name order
    pub fn unseal_all(&self) {
        for name in self.sealed_names() {
            self.unseal(&name);
        }
    }

    pub fn set_unreachable(&self, name: &str, unreachable: bool) {
        let mut state = self.state.lock().unwrap();
        if unreachable {
            state.unreachable.insert(name.to_string());
        } else {
            state.unreachable.remove(name);
        }
    }

    /// Forces a node active regardless of the others, to simulate split brain
    pub fn force_active(&self, name: &str) {
        if let Some(node) = self.state.lock().unwrap().nodes.get_mut(name) {
            node.sealed = false;
            node.active = true;
        }
    }

    /// While set, node creates succeed but the node never shows up, like a
    /// pod that is accepted and then lost
    pub fn set_drop_creates(&self, drop: bool) {
        self.state.lock().unwrap().drop_creates = drop;
    }

    pub fn sealed_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .nodes
            .iter()
            .filter(|(_, n)| n.sealed)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.state.lock().unwrap().nodes.keys().cloned().collect()
    }

    pub fn version_of(&self, name: &str) -> Option<String> {
        self.state.lock().unwrap().nodes.get(name).map(|n| n.version.clone())
    }

    pub fn create_count(&self) -> usize {
        self.state.lock().unwrap().creates
    }

    pub fn delete_count(&self) -> usize {
        self.state.lock().unwrap().deletes
    }

    pub fn unsealed_count(&self) -> usize {
        self.state.lock().unwrap().nodes.values().filter(|n| !n.sealed).count()
    }
}

#[async_trait::async_trait]
impl NodeScheduler for SimCluster {
    async fn list_nodes(&self, cluster: &ClusterRef) -> Result<Vec<NodeInfo>, ControllerError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .nodes
            .iter()
            .filter(|(name, _)| cluster.parse_ordinal(name).is_some())
            .map(|(name, node)| NodeInfo {
                name: name.clone(),
                ordinal: node.ordinal,
                address: Some(node.address.clone()),
                version: node.version.clone(),
            })
            .collect())
    }

    async fn create_node(&self, cluster: &ClusterRef, template: &NodeTemplate) -> Result<(), ControllerError> {
        let mut state = self.state.lock().unwrap();
        let name = cluster.node_name(template.ordinal);
        if state.nodes.contains_key(&name) {
            return Err(ControllerError::AlreadyExists(format!("node {}", name)));
        }
        if state.drop_creates {
            return Ok(());
        }
        state.next_ip += 1;
        let address = format!("10-0-0-{}.{}.pod", state.next_ip, cluster.namespace);
        state.creates += 1;
        state.unreachable.remove(&name);
        state.nodes.insert(
            name,
            SimNode {
                ordinal: template.ordinal,
                address,
                version: template.version.clone(),
                sealed: true,
                active: false,
            },
        );
        Ok(())
    }

    async fn delete_node(&self, _cluster: &ClusterRef, name: &str) -> Result<(), ControllerError> {
        let mut state = self.state.lock().unwrap();
        let removed = state
            .nodes
            .remove(name)
            .ok_or_else(|| ControllerError::NotFound(format!("node {}", name)))?;
        state.deletes += 1;
        if removed.active {
            let standby = state
                .nodes
                .iter()
                .find(|(n, node)| !node.sealed && !state.unreachable.contains(*n))
                .map(|(n, _)| n.clone());
            if let Some(standby) = standby {
                if let Some(node) = state.nodes.get_mut(&standby) {
                    node.active = true;
                }
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl VaultClientTrait for SimCluster {
    async fn health(&self, address: &str, _ca_pem: &[u8]) -> Result<HealthResponse, VaultError> {
        let state = self.state.lock().unwrap();
        let unreachable = || VaultError::Api {
            status: 503,
            body: format!("no route to {}", address),
        };
        let (name, node) = state
            .nodes
            .iter()
            .find(|(_, n)| n.address == address)
            .ok_or_else(unreachable)?;
        if state.unreachable.contains(name) {
            return Err(unreachable());
        }
        Ok(HealthResponse {
            initialized: state.initialized,
            sealed: node.sealed,
            standby: !node.active,
            version: node.version.clone(),
            ..Default::default()
        })
    }
}
