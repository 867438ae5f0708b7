//! Node scheduling collaborator.
//!
//! A node is one Vault pod named `<cluster>-<ordinal>`. The scheduler lists,
//! creates and deletes them; it never decides which ones.

use crate::error::ControllerError;
use crate::naming::{self, ClusterRef, LABEL_VERSION, VAULT_CLIENT_PORT, VAULT_CLUSTER_PORT};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EnvVar, EnvVarSource, ObjectFieldSelector, Pod,
    PodSpec, SecretVolumeSource, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info};

const VAULT_TLS_DIR: &str = "/run/vault/tls";
const ETCD_TLS_DIR: &str = "/run/vault/etcd-tls";
const ETCD_CLIENT_PORT: u16 = 2379;

/// A live member as reported by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub ordinal: u32,
    /// Probe address; `None` until the pod has an IP
    pub address: Option<String>,
    /// Version the node was created with
    pub version: String,
}

/// Everything needed to start one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTemplate {
    pub ordinal: u32,
    pub version: String,
    pub image: String,
    /// Secret holding `server.key` / `server.crt` for the Vault listener
    pub server_tls_secret: String,
    /// Secret holding the etcd client identity
    pub etcd_client_secret: String,
}

/// Creates, lists and deletes Vault nodes.
#[async_trait::async_trait]
pub trait NodeScheduler: Send + Sync {
    /// Current members, excluding nodes that are shutting down.
    async fn list_nodes(&self, cluster: &ClusterRef) -> Result<Vec<NodeInfo>, ControllerError>;

    /// Starts a node. Fails with `AlreadyExists` if the name is taken.
    async fn create_node(&self, cluster: &ClusterRef, template: &NodeTemplate) -> Result<(), ControllerError>;

    /// Stops a node. Fails with `NotFound` if it is already gone.
    async fn delete_node(&self, cluster: &ClusterRef, name: &str) -> Result<(), ControllerError>;
}

/// Vault nodes as pods.
#[derive(Clone)]
pub struct KubePodScheduler {
    client: Client,
}

impl KubePodScheduler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Vault server configuration: TLS listener plus HA etcd storage.
fn vault_config(cluster: &ClusterRef) -> String {
    let etcd = cluster.etcd_name();
    serde_json::json!({
        "listener": {
            "tcp": {
                "address": format!("0.0.0.0:{}", VAULT_CLIENT_PORT),
                "cluster_address": format!("0.0.0.0:{}", VAULT_CLUSTER_PORT),
                "tls_cert_file": format!("{}/server.crt", VAULT_TLS_DIR),
                "tls_key_file": format!("{}/server.key", VAULT_TLS_DIR),
            }
        },
        "storage": {
            "etcd": {
                "address": format!("https://{}-client:{}", etcd, ETCD_CLIENT_PORT),
                "etcd_api": "v3",
                "ha_enabled": "true",
                "tls_ca_file": format!("{}/etcd-client-ca.crt", ETCD_TLS_DIR),
                "tls_cert_file": format!("{}/etcd-client.crt", ETCD_TLS_DIR),
                "tls_key_file": format!("{}/etcd-client.key", ETCD_TLS_DIR),
            }
        }
    })
    .to_string()
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Pod for one node of `cluster`.
pub fn build_pod(cluster: &ClusterRef, template: &NodeTemplate) -> Pod {
    let pod_ip = EnvVar {
        name: "POD_IP".to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: "status.podIP".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    let container = Container {
        name: "vault".to_string(),
        image: Some(template.image.clone()),
        args: Some(vec!["server".to_string()]),
        env: Some(vec![
            pod_ip,
            env("VAULT_LOCAL_CONFIG", vault_config(cluster)),
            env("VAULT_API_ADDR", format!("https://$(POD_IP):{}", VAULT_CLIENT_PORT)),
            env("VAULT_CLUSTER_ADDR", format!("https://$(POD_IP):{}", VAULT_CLUSTER_PORT)),
        ]),
        ports: Some(vec![
            ContainerPort {
                name: Some("vault-client".to_string()),
                container_port: VAULT_CLIENT_PORT,
                ..Default::default()
            },
            ContainerPort {
                name: Some("vault-cluster".to_string()),
                container_port: VAULT_CLUSTER_PORT,
                ..Default::default()
            },
        ]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "vault-tls".to_string(),
                mount_path: VAULT_TLS_DIR.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "etcd-tls".to_string(),
                mount_path: ETCD_TLS_DIR.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        security_context: Some(SecurityContext {
            capabilities: Some(Capabilities {
                add: Some(vec!["IPC_LOCK".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    let secret_volume = |name: &str, secret: &str| Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(cluster.node_name(template.ordinal)),
            namespace: Some(cluster.namespace.clone()),
            labels: Some(cluster.node_labels(&template.version)),
            owner_references: cluster.owner.clone().map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            volumes: Some(vec![
                secret_volume("vault-tls", &template.server_tls_secret),
                secret_volume("etcd-tls", &template.etcd_client_secret),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait::async_trait]
impl NodeScheduler for KubePodScheduler {
    async fn list_nodes(&self, cluster: &ClusterRef) -> Result<Vec<NodeInfo>, ControllerError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &cluster.namespace);
        let pods = api
            .list(&ListParams::default().labels(&cluster.selector()))
            .await
            .map_err(|e| ControllerError::from_kube(format!("list nodes of {}", cluster.key()), e))?;

        let mut nodes: Vec<NodeInfo> = pods
            .items
            .into_iter()
            .filter(|pod| pod.metadata.deletion_timestamp.is_none())
            .filter_map(|pod| {
                let name = pod.name_any();
                let ordinal = cluster.parse_ordinal(&name)?;
                let version = pod.labels().get(LABEL_VERSION).cloned().unwrap_or_default();
                let address = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.pod_ip.as_deref())
                    .map(|ip| naming::pod_address(ip, &cluster.namespace));
                Some(NodeInfo {
                    name,
                    ordinal,
                    address,
                    version,
                })
            })
            .collect();
        nodes.sort_by_key(|n| n.ordinal);

        debug!("Cluster {} has {} live nodes", cluster.key(), nodes.len());
        Ok(nodes)
    }

    async fn create_node(&self, cluster: &ClusterRef, template: &NodeTemplate) -> Result<(), ControllerError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &cluster.namespace);
        let pod = build_pod(cluster, template);
        let name = cluster.node_name(template.ordinal);

        api.create(&PostParams::default(), &pod)
            .await
            .map_err(|e| ControllerError::from_kube(format!("create node {}/{}", cluster.namespace, name), e))?;
        info!("Created Vault node {}/{} at version {}", cluster.namespace, name, template.version);
        Ok(())
    }

    async fn delete_node(&self, cluster: &ClusterRef, name: &str) -> Result<(), ControllerError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &cluster.namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|e| ControllerError::from_kube(format!("delete node {}/{}", cluster.namespace, name), e))?;
        info!("Deleted Vault node {}/{}", cluster.namespace, name);
        Ok(())
    }
}
