//! Vault API models

use serde::{Deserialize, Serialize};

/// Response body of `GET /v1/sys/health`.
///
/// Vault reports the same body regardless of the status code; the
/// operator asks for 200 in every state so the body is always parsed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct HealthResponse {
    /// Whether `vault operator init` has been run
    #[serde(default)]
    pub initialized: bool,
    /// Whether the node is sealed
    #[serde(default)]
    pub sealed: bool,
    /// Whether the node is an unsealed standby
    #[serde(default)]
    pub standby: bool,
    /// Vault server version
    #[serde(default)]
    pub version: String,
    /// Cluster name, only present once unsealed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    /// Cluster id, only present once unsealed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    /// Server time as a unix timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_time_utc: Option<i64>,
}

/// Runtime role of a node as seen through its health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    /// Sealed (or not yet initialized); cannot serve
    Sealed,
    /// Unsealed leader
    Active,
    /// Unsealed, following the leader
    Standby,
}

impl HealthResponse {
    /// Classifies the node. An uninitialized node is always sealed.
    #[must_use]
    pub fn role(&self) -> NodeRole {
        if self.sealed || !self.initialized {
            NodeRole::Sealed
        } else if self.standby {
            NodeRole::Standby
        } else {
            NodeRole::Active
        }
    }

    /// Convenience constructor for a sealed node.
    #[must_use]
    pub fn sealed(initialized: bool, version: &str) -> Self {
        Self {
            initialized,
            sealed: true,
            standby: true,
            version: version.to_string(),
            ..Default::default()
        }
    }

    /// Convenience constructor for an unsealed node.
    #[must_use]
    pub fn unsealed(standby: bool, version: &str) -> Self {
        Self {
            initialized: true,
            sealed: false,
            standby,
            version: version.to_string(),
            ..Default::default()
        }
    }
}
