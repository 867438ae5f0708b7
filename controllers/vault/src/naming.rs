//! Names, labels and addresses derived from a VaultService.

use crate::error::ControllerError;
use crds::VaultService;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

/// Port Vault serves clients on
pub const VAULT_CLIENT_PORT: i32 = 8200;
/// Port Vault nodes use to talk to each other
pub const VAULT_CLUSTER_PORT: i32 = 8201;

pub const LABEL_APP: &str = "app";
pub const LABEL_CLUSTER: &str = "vault_cluster";
pub const LABEL_VERSION: &str = "vault_version";
pub const APP_NAME: &str = "vault";

/// Identity of one VaultService, carried through a reconciliation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterRef {
    pub name: String,
    pub namespace: String,
    /// Controller owner reference stamped on everything the operator creates
    pub owner: Option<OwnerReference>,
}

impl ClusterRef {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            owner: None,
        }
    }

    pub fn from_resource(vs: &VaultService) -> Result<Self, ControllerError> {
        let namespace = vs.namespace().ok_or_else(|| {
            ControllerError::InvalidConfig(format!("VaultService {} has no namespace", vs.name_any()))
        })?;
        Ok(Self {
            name: vs.name_any(),
            namespace,
            owner: vs.controller_owner_ref(&()),
        })
    }

    /// `namespace/name`, used as the key for logs and backoff state.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn ca_secret_name(&self) -> String {
        format!("{}-tls-ca", self.name)
    }

    /// Name of the etcd cluster backing this Vault cluster.
    pub fn etcd_name(&self) -> String {
        format!("{}-etcd", self.name)
    }

    pub fn node_name(&self, ordinal: u32) -> String {
        format!("{}-{}", self.name, ordinal)
    }

    /// Ordinal of a node name belonging to this cluster.
    pub fn parse_ordinal(&self, node_name: &str) -> Option<u32> {
        node_name
            .strip_prefix(&self.name)
            .and_then(|rest| rest.strip_prefix('-'))
            .and_then(|n| n.parse().ok())
    }

    /// Label selector matching every node of this cluster.
    pub fn selector(&self) -> String {
        format!("{}={},{}={}", LABEL_APP, APP_NAME, LABEL_CLUSTER, self.name)
    }

    pub fn node_labels(&self, version: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_APP.to_string(), APP_NAME.to_string()),
            (LABEL_CLUSTER.to_string(), self.name.clone()),
            (LABEL_VERSION.to_string(), version.to_string()),
        ])
    }

    /// Labels stamped on operator-owned secrets.
    pub fn secret_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_APP.to_string(), APP_NAME.to_string()),
            (LABEL_CLUSTER.to_string(), self.name.clone()),
        ])
    }
}

/// DNS address of a pod from its IP: `10.0.0.7` in `vault` becomes
/// `10-0-0-7.vault.pod`, matching the server certificate's `*.<ns>.pod` SAN.
pub fn pod_address(ip: &str, namespace: &str) -> String {
    format!("{}.{}.pod", ip.replace(['.', ':'], "-"), namespace)
}
