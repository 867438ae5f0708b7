//! Resource store collaborators.
//!
//! `SecretStore` and `ClusterStore` are the only ways the reconciler reads or
//! writes Kubernetes objects; the kube-backed implementations live here and
//! in-memory fakes live in `test_utils`.

use crate::error::ControllerError;
use crds::{VaultService, VaultServiceStatus};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::ByteString;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Finalizer holding a VaultService until its TLS secrets are revoked
pub const FINALIZER: &str = "vault.microscaler.io/tls-cleanup";

/// Key/value payload of a secret
pub type SecretData = BTreeMap<String, Vec<u8>>;

/// A secret to be created by the operator.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSecret {
    pub name: String,
    pub data: SecretData,
    pub labels: BTreeMap<String, String>,
    pub owner: Option<OwnerReference>,
}

/// Get/create/delete access to secrets.
#[async_trait::async_trait]
pub trait SecretStore: Send + Sync {
    /// Returns `None` when the secret does not exist.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<SecretData>, ControllerError>;

    /// Fails with `AlreadyExists` if a secret with that name exists.
    async fn create(&self, namespace: &str, secret: NewSecret) -> Result<(), ControllerError>;

    /// Fails with `NotFound` if the secret does not exist.
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ControllerError>;
}

/// Read access to VaultServices and guarded status writes.
#[async_trait::async_trait]
pub trait ClusterStore: Send + Sync {
    /// Returns `None` when the resource has been deleted.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<VaultService>, ControllerError>;

    /// Replaces the status of `cluster`, failing with `Conflict` unless the
    /// stored resource version still equals `cluster`'s.
    async fn write_status(
        &self,
        cluster: &VaultService,
        status: &VaultServiceStatus,
    ) -> Result<(), ControllerError>;

    /// Adds [`FINALIZER`], guarded by `cluster`'s resource version.
    async fn add_finalizer(&self, cluster: &VaultService) -> Result<(), ControllerError>;

    /// Drops [`FINALIZER`]; a no-op when the resource is already gone.
    async fn remove_finalizer(&self, cluster: &VaultService) -> Result<(), ControllerError>;
}

/// Secrets backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<SecretData>, ControllerError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api
            .get_opt(name)
            .await
            .map_err(|e| ControllerError::from_kube(format!("get secret {}/{}", namespace, name), e))?;

        Ok(secret.map(|s| {
            s.data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, v.0))
                .collect()
        }))
    }

    async fn create(&self, namespace: &str, secret: NewSecret) -> Result<(), ControllerError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let name = secret.name.clone();
        let object = Secret {
            metadata: ObjectMeta {
                name: Some(secret.name),
                namespace: Some(namespace.to_string()),
                labels: Some(secret.labels),
                owner_references: secret.owner.map(|o| vec![o]),
                ..Default::default()
            },
            data: Some(
                secret
                    .data
                    .into_iter()
                    .map(|(k, v)| (k, ByteString(v)))
                    .collect(),
            ),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        };

        api.create(&PostParams::default(), &object)
            .await
            .map_err(|e| ControllerError::from_kube(format!("create secret {}/{}", namespace, name), e))?;
        debug!("Created secret {}/{}", namespace, name);
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ControllerError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|e| ControllerError::from_kube(format!("delete secret {}/{}", namespace, name), e))?;
        Ok(())
    }
}

/// VaultServices backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeClusterStore {
    client: Client,
}

impl KubeClusterStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn patch_finalizers(&self, cluster: &VaultService, finalizers: Vec<String>) -> Result<(), ControllerError> {
        let namespace = cluster.namespace().unwrap_or_default();
        let name = cluster.name_any();
        let api: Api<VaultService> = Api::namespaced(self.client.clone(), &namespace);
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": cluster.resource_version(),
                "finalizers": finalizers,
            }
        });
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| ControllerError::from_kube(format!("patch finalizers of VaultService {}/{}", namespace, name), e))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ClusterStore for KubeClusterStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<VaultService>, ControllerError> {
        let api: Api<VaultService> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| ControllerError::from_kube(format!("get VaultService {}/{}", namespace, name), e))
    }

    async fn write_status(
        &self,
        cluster: &VaultService,
        status: &VaultServiceStatus,
    ) -> Result<(), ControllerError> {
        let namespace = cluster.namespace().unwrap_or_default();
        let name = cluster.name_any();
        let api: Api<VaultService> = Api::namespaced(self.client.clone(), &namespace);

        let mut status_value = serde_json::to_value(status).map_err(|e| ControllerError::TransientInfra {
            context: format!("serialize status of VaultService {}/{}", namespace, name),
            message: e.to_string(),
        })?;
        // Absent optional fields would be left untouched by a merge patch
        if let Some(fields) = status_value.as_object_mut() {
            for key in ["activeNode", "upgrade"] {
                fields.entry(key).or_insert(serde_json::Value::Null);
            }
        }

        // resourceVersion in a merge patch is a precondition: a stale
        // version is rejected with 409
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": cluster.resource_version() },
            "status": status_value,
        });

        api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| {
                ControllerError::from_kube(format!("write status of VaultService {}/{}", namespace, name), e)
            })?;
        Ok(())
    }

    async fn add_finalizer(&self, cluster: &VaultService) -> Result<(), ControllerError> {
        let mut finalizers = cluster.finalizers().to_vec();
        if finalizers.iter().any(|f| f == FINALIZER) {
            return Ok(());
        }
        finalizers.push(FINALIZER.to_string());
        self.patch_finalizers(cluster, finalizers).await?;
        info!("Added finalizer to VaultService {}/{}", cluster.namespace().unwrap_or_default(), cluster.name_any());
        Ok(())
    }

    async fn remove_finalizer(&self, cluster: &VaultService) -> Result<(), ControllerError> {
        let finalizers: Vec<String> = cluster
            .finalizers()
            .iter()
            .filter(|f| *f != FINALIZER)
            .cloned()
            .collect();
        match self.patch_finalizers(cluster, finalizers).await {
            Err(ControllerError::NotFound(_)) => Ok(()),
            other => other,
        }
    }
}
