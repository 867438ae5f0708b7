//! Cluster state observer.
//!
//! Probes every member's health endpoint and classifies it. Roles are
//! re-derived on every pass; nothing here is cached between passes.

use crate::scheduler::NodeInfo;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, warn};
use vault_client::{NodeRole, VaultClientTrait};

/// Role of a member as observed in this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Sealed,
    Active,
    Standby,
    /// Probe failed or the node has no address yet
    Unreachable,
}

impl NodeState {
    pub fn is_unsealed(&self) -> bool {
        matches!(self, NodeState::Active | NodeState::Standby)
    }
}

/// One member after probing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbedNode {
    pub name: String,
    pub ordinal: u32,
    pub state: NodeState,
    /// Effective version: what the node reports when unsealed, otherwise
    /// the version it was created with
    pub version: String,
}

/// Result of probing all members of one cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
    /// Every member, ordered by ordinal
    pub nodes: Vec<ProbedNode>,
    /// True once any reachable node reports an initialized Vault
    pub initialized: bool,
}

impl Observation {
    fn with_state(&self, state: NodeState) -> impl Iterator<Item = &ProbedNode> {
        self.nodes.iter().filter(move |n| n.state == state)
    }

    pub fn sealed(&self) -> Vec<&ProbedNode> {
        self.with_state(NodeState::Sealed).collect()
    }

    pub fn standby(&self) -> Vec<&ProbedNode> {
        self.with_state(NodeState::Standby).collect()
    }

    /// Every node claiming leadership; more than one means split brain.
    pub fn actives(&self) -> Vec<&ProbedNode> {
        self.with_state(NodeState::Active).collect()
    }

    pub fn unreachable(&self) -> Vec<&ProbedNode> {
        self.with_state(NodeState::Unreachable).collect()
    }

    pub fn unsealed(&self) -> Vec<&ProbedNode> {
        self.nodes.iter().filter(|n| n.state.is_unsealed()).collect()
    }

    /// The reported leader: the lowest-ordinal active node.
    pub fn active(&self) -> Option<&ProbedNode> {
        self.with_state(NodeState::Active).next()
    }

    pub fn has_split_brain(&self) -> bool {
        self.actives().len() > 1
    }

    /// Nodes that answered their probe.
    pub fn available(&self) -> Vec<&ProbedNode> {
        self.nodes
            .iter()
            .filter(|n| n.state != NodeState::Unreachable)
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&ProbedNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}

/// Whether image tag `declared` ships Vault `reported`.
///
/// Image tags carry a build suffix (`0.9.1-0`) that Vault does not report
/// (`0.9.1`).
pub fn version_matches(declared: &str, reported: &str) -> bool {
    declared == reported
        || declared
            .strip_prefix(reported)
            .is_some_and(|rest| rest.starts_with('-'))
}

/// Probes members and classifies their roles.
pub struct Observer {
    vault: Arc<dyn VaultClientTrait>,
}

impl Observer {
    pub fn new(vault: Arc<dyn VaultClientTrait>) -> Self {
        Self { vault }
    }

    async fn probe(&self, member: &NodeInfo, ca_pem: &[u8]) -> (ProbedNode, bool) {
        let unreachable = |member: &NodeInfo| ProbedNode {
            name: member.name.clone(),
            ordinal: member.ordinal,
            state: NodeState::Unreachable,
            version: member.version.clone(),
        };

        let Some(address) = member.address.as_deref() else {
            debug!("Node {} has no address yet", member.name);
            return (unreachable(member), false);
        };

        match self.vault.health(address, ca_pem).await {
            Ok(health) => {
                let state = match health.role() {
                    NodeRole::Sealed => NodeState::Sealed,
                    NodeRole::Active => NodeState::Active,
                    NodeRole::Standby => NodeState::Standby,
                };
                let version = if state.is_unsealed()
                    && !health.version.is_empty()
                    && !version_matches(&member.version, &health.version)
                {
                    health.version.clone()
                } else {
                    member.version.clone()
                };
                let node = ProbedNode {
                    name: member.name.clone(),
                    ordinal: member.ordinal,
                    state,
                    version,
                };
                (node, health.initialized)
            }
            Err(e) => {
                debug!("Probe of {} ({}) failed: {}", member.name, address, e);
                (unreachable(member), false)
            }
        }
    }

    /// Probes every member concurrently.
    pub async fn observe(&self, members: &[NodeInfo], ca_pem: &[u8]) -> Observation {
        let results = join_all(members.iter().map(|m| self.probe(m, ca_pem))).await;

        let initialized = results.iter().any(|(_, init)| *init);
        let mut nodes: Vec<ProbedNode> = results.into_iter().map(|(node, _)| node).collect();
        nodes.sort_by_key(|n| n.ordinal);

        let observation = Observation { nodes, initialized };
        if observation.has_split_brain() {
            let names: Vec<_> = observation.actives().iter().map(|n| n.name.as_str()).collect();
            warn!("More than one active Vault node: {}", names.join(", "));
        }
        debug!(
            "Observed {} nodes: {} sealed, {} standby, {} active, {} unreachable",
            observation.len(),
            observation.sealed().len(),
            observation.standby().len(),
            observation.actives().len(),
            observation.unreachable().len()
        );
        observation
    }
}
