//! VaultService CRD
//!
//! Declares a Vault cluster: how many nodes, which Vault release,
//! and where its TLS material comes from.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::status::VaultServiceStatus;

/// Default Vault release deployed when `version` is omitted.
pub const DEFAULT_VAULT_VERSION: &str = "0.9.1-0";

/// Default image repository for Vault nodes.
pub const DEFAULT_BASE_IMAGE: &str = "quay.io/coreos/vault";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "vault.microscaler.io",
    version = "v1alpha1",
    kind = "VaultService",
    namespaced,
    status = "VaultServiceStatus",
    shortname = "vault",
    printcolumn = r#"{"name":"Nodes","type":"integer","jsonPath":".spec.nodes"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.currentVersion"}"#,
    printcolumn = r#"{"name":"Active","type":"string","jsonPath":".status.activeNode"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VaultServiceSpec {
    /// Number of Vault nodes (must be at least 1)
    #[serde(default = "default_nodes")]
    #[schemars(range(min = 1))]
    pub nodes: i32,

    /// Vault release tag, e.g. "0.9.1-0"
    #[serde(default = "default_version")]
    pub version: String,

    /// Image repository; nodes run `<baseImage>:<version>`
    #[serde(default = "default_base_image")]
    pub base_image: String,

    /// TLS policy. Omitted means the operator generates and owns the CA.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSpec>,
}

fn default_nodes() -> i32 {
    1
}

fn default_version() -> String {
    DEFAULT_VAULT_VERSION.to_string()
}

fn default_base_image() -> String {
    DEFAULT_BASE_IMAGE.to_string()
}

impl Default for VaultServiceSpec {
    fn default() -> Self {
        Self {
            nodes: default_nodes(),
            version: default_version(),
            base_image: default_base_image(),
            tls: None,
        }
    }
}

/// TLS section of the spec as it is stored in the resource.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TlsSpec {
    /// User supplied Vault TLS secrets. When absent the operator self-manages TLS.
    #[serde(default, rename = "static", skip_serializing_if = "Option::is_none")]
    pub static_tls: Option<StaticTls>,
}

/// Names of pre-existing secrets holding the Vault server and client TLS assets.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StaticTls {
    /// Secret with `server.key`, `server.crt` (and optionally `server-ca.crt`)
    pub server_secret: String,

    /// Secret with `ca.crt`, used by clients to verify Vault nodes
    pub client_secret: String,
}

/// Where the Vault TLS material comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsPolicy {
    /// The operator generates a CA and the Vault server/client bundles.
    SelfManaged,
    /// The user provides the Vault secrets; CA generation is skipped.
    External {
        server_secret: String,
        client_secret: String,
    },
}

impl VaultServiceSpec {
    /// Resolves the stored TLS section into a policy.
    #[must_use]
    pub fn tls_policy(&self) -> TlsPolicy {
        match self.tls.as_ref().and_then(|t| t.static_tls.as_ref()) {
            Some(s) => TlsPolicy::External {
                server_secret: s.server_secret.clone(),
                client_secret: s.client_secret.clone(),
            },
            None => TlsPolicy::SelfManaged,
        }
    }

    /// Full image reference for a node running `version`.
    #[must_use]
    pub fn image_for(&self, version: &str) -> String {
        format!("{}:{}", self.base_image, version)
    }

    /// Checks invariants the schema cannot express on its own.
    ///
    /// Returns a human readable reason when the spec is unusable.
    pub fn validate(&self) -> Result<(), String> {
        if self.nodes < 1 {
            return Err(format!("spec.nodes must be at least 1, got {}", self.nodes));
        }
        if self.version.trim().is_empty() {
            return Err("spec.version must not be empty".to_string());
        }
        if let TlsPolicy::External { server_secret, client_secret } = self.tls_policy() {
            if server_secret.is_empty() || client_secret.is_empty() {
                return Err("spec.tls.static requires serverSecret and clientSecret".to_string());
            }
        }
        Ok(())
    }
}
