//! VaultService status
//!
//! Observed cluster state, written once per reconciliation pass.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type set when more than one node claims to be active.
pub const CONDITION_CONSISTENCY_WARNING: &str = "ConsistencyWarning";
/// Condition type set when a node replacement stops making progress.
pub const CONDITION_STALLED_UPGRADE: &str = "StalledUpgrade";
/// Condition type describing a rolling upgrade in flight.
pub const CONDITION_UPGRADING: &str = "Upgrading";
/// Condition type set when a reconciliation pass failed.
pub const CONDITION_RECONCILE_FAILED: &str = "ReconcileFailed";

/// Status of a VaultService.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VaultServiceStatus {
    /// True once any reachable node reports an initialized Vault
    #[serde(default)]
    pub initialized: bool,

    /// Nodes that are sealed and cannot serve requests
    #[serde(default)]
    pub sealed_nodes: Vec<String>,

    /// The node currently serving as leader. When several nodes claim
    /// leadership this is the lowest ordinal; the others appear only in
    /// `availableNodes` and the ConsistencyWarning condition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_node: Option<String>,

    /// Unsealed nodes ready to take over
    #[serde(default)]
    pub standby_nodes: Vec<String>,

    /// Every node that answered its health probe in the last pass, extra
    /// active nodes included
    #[serde(default)]
    pub available_nodes: Vec<String>,

    /// Vault version of the cluster, taken from the active node; kept from
    /// the previous pass while no node is active
    #[serde(default)]
    pub current_version: String,

    /// Service clients use to reach the cluster. Named after the cluster;
    /// the Service itself is created by the deployment, not by the operator.
    #[serde(default)]
    pub service_name: String,

    /// Port Vault listens on for client traffic
    #[serde(default)]
    pub client_port: i32,

    /// Replacement in flight during a rolling upgrade
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<UpgradeProgress>,

    /// Latest observations
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Minimal record needed to recognise a stalled node replacement.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeProgress {
    /// Node that was torn down and is expected back at `targetVersion`
    pub node: String,

    /// Version the replacement runs
    pub target_version: String,

    /// Passes spent waiting for the replacement to reappear
    #[serde(default)]
    pub pending_passes: u32,
}

/// Condition represents a condition of a resource
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    /// Last transition time (RFC3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    /// Machine readable reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Condition {
    /// A condition with status "True".
    #[must_use]
    pub fn active(r#type: &str, reason: &str, message: impl Into<String>) -> Self {
        Self {
            r#type: r#type.to_string(),
            status: "True".to_string(),
            last_transition_time: None,
            reason: Some(reason.to_string()),
            message: Some(message.into()),
        }
    }
}

impl VaultServiceStatus {
    /// Looks up a condition by type.
    #[must_use]
    pub fn condition(&self, r#type: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.r#type == r#type)
    }

    /// Every node named in one of the three role sets.
    #[must_use]
    pub fn members(&self) -> Vec<&str> {
        self.sealed_nodes
            .iter()
            .chain(self.active_node.iter())
            .chain(self.standby_nodes.iter())
            .map(String::as_str)
            .collect()
    }
}
