//! Certificate Authority and TLS secret issuer.
//!
//! Every cluster gets one CA, persisted in `<cluster>-tls-ca`, and up to five
//! credential bundles signed by it. Bundles are immutable once stored: an
//! existing secret is reported as satisfied and never rewritten.

use crate::error::ControllerError;
use crate::naming::ClusterRef;
use crate::pki::{self, CaKeyPair};
use crate::store::{NewSecret, SecretData, SecretStore};
use crds::TlsPolicy;
use std::sync::Arc;
use tracing::{debug, info, warn};

const CA_KEY: &str = "ca.key";
const CA_CERT: &str = "ca.crt";

/// Which identity a bundle carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BundleRole {
    VaultServer,
    /// CA certificate only, handed to Vault clients
    VaultClient,
    EtcdClient,
    EtcdServer,
    EtcdPeer,
}

/// Data keys of a signed bundle: key, certificate, CA certificate.
struct BundleKeys {
    key: &'static str,
    cert: &'static str,
    ca: &'static str,
}

impl BundleRole {
    pub const ALL: [BundleRole; 5] = [
        BundleRole::VaultServer,
        BundleRole::VaultClient,
        BundleRole::EtcdClient,
        BundleRole::EtcdServer,
        BundleRole::EtcdPeer,
    ];

    pub fn secret_name(&self, cluster: &ClusterRef) -> String {
        match self {
            BundleRole::VaultServer => format!("{}-default-vault-server-tls", cluster.name),
            BundleRole::VaultClient => format!("{}-default-vault-client-tls", cluster.name),
            BundleRole::EtcdClient => format!("{}-client-tls", cluster.etcd_name()),
            BundleRole::EtcdServer => format!("{}-server-tls", cluster.etcd_name()),
            BundleRole::EtcdPeer => format!("{}-peer-tls", cluster.etcd_name()),
        }
    }

    pub fn common_name(&self) -> &'static str {
        match self {
            BundleRole::VaultServer => "vault server",
            BundleRole::VaultClient => "vault client",
            BundleRole::EtcdClient => "etcd client",
            BundleRole::EtcdServer => "etcd server",
            BundleRole::EtcdPeer => "etcd peer",
        }
    }

    fn keys(&self) -> Option<BundleKeys> {
        match self {
            BundleRole::VaultServer | BundleRole::EtcdServer => Some(BundleKeys {
                key: "server.key",
                cert: "server.crt",
                ca: "server-ca.crt",
            }),
            BundleRole::EtcdClient => Some(BundleKeys {
                key: "etcd-client.key",
                cert: "etcd-client.crt",
                ca: "etcd-client-ca.crt",
            }),
            BundleRole::EtcdPeer => Some(BundleKeys {
                key: "peer.key",
                cert: "peer.crt",
                ca: "peer-ca.crt",
            }),
            BundleRole::VaultClient => None,
        }
    }

    /// Subject alternative names for this role.
    pub fn sans(&self, cluster: &ClusterRef, cluster_domain: &str) -> Vec<String> {
        let ns = &cluster.namespace;
        let etcd = cluster.etcd_name();
        match self {
            BundleRole::VaultServer => vec![
                "localhost".to_string(),
                format!("*.{}.pod", ns),
                format!("{}.{}.svc", cluster.name, ns),
            ],
            BundleRole::EtcdServer => vec![
                "localhost".to_string(),
                format!("*.{}.{}.svc", etcd, ns),
                format!("{}-client", etcd),
                format!("{}-client.{}", etcd, ns),
                format!("{}-client.{}.svc", etcd, ns),
                format!("*.{}.{}.svc.{}", etcd, ns, cluster_domain),
                format!("{}-client.{}.svc.{}", etcd, ns, cluster_domain),
            ],
            BundleRole::EtcdPeer => vec![
                format!("*.{}.{}.svc", etcd, ns),
                format!("*.{}.{}.svc.{}", etcd, ns, cluster_domain),
            ],
            BundleRole::EtcdClient | BundleRole::VaultClient => Vec::new(),
        }
    }
}

/// Outcome of an idempotent ensure operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Ensured<T> {
    /// Freshly created by this call
    Created(T),
    /// Already present; left untouched
    Existing(T),
}

impl<T> Ensured<T> {
    pub fn into_inner(self) -> T {
        match self {
            Ensured::Created(t) | Ensured::Existing(t) => t,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, Ensured::Created(_))
    }
}

/// A stored credential bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialBundle {
    pub role: BundleRole,
    pub secret_name: String,
    pub data: SecretData,
}

/// TLS facts the rest of the pass needs.
#[derive(Debug, Clone, PartialEq)]
pub struct TlsMaterial {
    /// CA certificate used to verify Vault nodes when probing them
    pub client_ca_pem: Vec<u8>,
    /// Secret mounted as the Vault listener identity
    pub server_secret: String,
    /// Secret mounted as the etcd client identity
    pub etcd_client_secret: String,
}

/// Issues and revokes a cluster's TLS material.
pub struct TlsIssuer {
    secrets: Arc<dyn SecretStore>,
    cluster_domain: String,
}

impl TlsIssuer {
    pub fn new(secrets: Arc<dyn SecretStore>, cluster_domain: impl Into<String>) -> Self {
        Self {
            secrets,
            cluster_domain: cluster_domain.into(),
        }
    }

    fn ca_from_data(cluster: &ClusterRef, data: &SecretData) -> Result<CaKeyPair, ControllerError> {
        let field = |key: &str| -> Result<String, ControllerError> {
            let bytes = data.get(key).ok_or_else(|| {
                ControllerError::InvalidConfig(format!(
                    "secret {} is missing {}",
                    cluster.ca_secret_name(),
                    key
                ))
            })?;
            String::from_utf8(bytes.clone()).map_err(|_| {
                ControllerError::InvalidConfig(format!(
                    "secret {} field {} is not valid UTF-8",
                    cluster.ca_secret_name(),
                    key
                ))
            })
        };
        Ok(CaKeyPair::from_pem(&field(CA_CERT)?, &field(CA_KEY)?)?)
    }

    /// Returns the cluster CA, generating and persisting it on first use.
    pub async fn ensure_ca(&self, cluster: &ClusterRef) -> Result<CaKeyPair, ControllerError> {
        let name = cluster.ca_secret_name();
        if let Some(data) = self.secrets.get(&cluster.namespace, &name).await? {
            debug!("Using existing CA {}/{}", cluster.namespace, name);
            return Self::ca_from_data(cluster, &data);
        }

        let ca = CaKeyPair::generate()?;
        let secret = NewSecret {
            name: name.clone(),
            data: SecretData::from([
                (CA_KEY.to_string(), ca.key_pem().as_bytes().to_vec()),
                (CA_CERT.to_string(), ca.cert_pem().as_bytes().to_vec()),
            ]),
            labels: cluster.secret_labels(),
            owner: cluster.owner.clone(),
        };

        match self.secrets.create(&cluster.namespace, secret).await {
            Ok(()) => {
                info!("Created CA {}/{}", cluster.namespace, name);
                Ok(ca)
            }
            Err(ControllerError::AlreadyExists(_)) => {
                // Lost a create race: the stored CA wins
                let data = self.secrets.get(&cluster.namespace, &name).await?.ok_or_else(|| {
                    ControllerError::Conflict(format!("CA {}/{} vanished after create race", cluster.namespace, name))
                })?;
                Self::ca_from_data(cluster, &data)
            }
            Err(e) => Err(e),
        }
    }

    /// Ensures the bundle for `role` exists, signing a fresh one with `ca`
    /// if it does not. An existing secret is never compared or rewritten.
    pub async fn ensure_bundle(
        &self,
        role: BundleRole,
        cluster: &ClusterRef,
        ca: &CaKeyPair,
        sans: &[String],
    ) -> Result<Ensured<CredentialBundle>, ControllerError> {
        let secret_name = role.secret_name(cluster);
        if let Some(data) = self.secrets.get(&cluster.namespace, &secret_name).await? {
            return Ok(Ensured::Existing(CredentialBundle { role, secret_name, data }));
        }

        let ca_pem = ca.cert_pem().as_bytes().to_vec();
        let data = match role.keys() {
            Some(keys) => {
                let leaf = ca.sign_leaf(role.common_name(), sans)?;
                SecretData::from([
                    (keys.key.to_string(), leaf.key_pem.into_bytes()),
                    (keys.cert.to_string(), leaf.cert_pem.into_bytes()),
                    (keys.ca.to_string(), ca_pem),
                ])
            }
            None => SecretData::from([(CA_CERT.to_string(), ca_pem)]),
        };

        let secret = NewSecret {
            name: secret_name.clone(),
            data: data.clone(),
            labels: cluster.secret_labels(),
            owner: cluster.owner.clone(),
        };
        match self.secrets.create(&cluster.namespace, secret).await {
            Ok(()) => {
                info!("Created {} bundle {}/{}", role.common_name(), cluster.namespace, secret_name);
                Ok(Ensured::Created(CredentialBundle { role, secret_name, data }))
            }
            Err(ControllerError::AlreadyExists(_)) => {
                let data = self.secrets.get(&cluster.namespace, &secret_name).await?.ok_or_else(|| {
                    ControllerError::Conflict(format!(
                        "secret {}/{} vanished after create race",
                        cluster.namespace, secret_name
                    ))
                })?;
                Ok(Ensured::Existing(CredentialBundle { role, secret_name, data }))
            }
            Err(e) => Err(e),
        }
    }

    /// Provisions every bundle `policy` requires.
    ///
    /// etcd identities are always self-managed. Under an external policy the
    /// Vault server secret must already exist and the client secret's
    /// `ca.crt` is used for probing.
    pub async fn ensure_tls(&self, cluster: &ClusterRef, policy: &TlsPolicy) -> Result<TlsMaterial, ControllerError> {
        let ca = self.ensure_ca(cluster).await?;

        for role in [BundleRole::EtcdClient, BundleRole::EtcdServer, BundleRole::EtcdPeer] {
            let sans = role.sans(cluster, &self.cluster_domain);
            self.ensure_bundle(role, cluster, &ca, &sans).await?;
        }
        let etcd_client_secret = BundleRole::EtcdClient.secret_name(cluster);

        match policy {
            TlsPolicy::SelfManaged => {
                let sans = BundleRole::VaultServer.sans(cluster, &self.cluster_domain);
                let server = self
                    .ensure_bundle(BundleRole::VaultServer, cluster, &ca, &sans)
                    .await?
                    .into_inner();
                let client = self
                    .ensure_bundle(BundleRole::VaultClient, cluster, &ca, &[])
                    .await?
                    .into_inner();
                let client_ca_pem = client.data.get(CA_CERT).cloned().ok_or_else(|| {
                    ControllerError::InvalidConfig(format!("secret {} is missing {}", client.secret_name, CA_CERT))
                })?;
                Ok(TlsMaterial {
                    client_ca_pem,
                    server_secret: server.secret_name,
                    etcd_client_secret,
                })
            }
            TlsPolicy::External {
                server_secret,
                client_secret,
            } => {
                if self.secrets.get(&cluster.namespace, server_secret).await?.is_none() {
                    return Err(ControllerError::NotFound(format!(
                        "Vault server TLS secret {}/{}",
                        cluster.namespace, server_secret
                    )));
                }
                let client = self
                    .secrets
                    .get(&cluster.namespace, client_secret)
                    .await?
                    .ok_or_else(|| {
                        ControllerError::NotFound(format!(
                            "Vault client TLS secret {}/{}",
                            cluster.namespace, client_secret
                        ))
                    })?;
                let client_ca_pem = client.get(CA_CERT).cloned().ok_or_else(|| {
                    ControllerError::InvalidConfig(format!("secret {} is missing {}", client_secret, CA_CERT))
                })?;
                Ok(TlsMaterial {
                    client_ca_pem,
                    server_secret: server_secret.clone(),
                    etcd_client_secret,
                })
            }
        }
    }

    /// Deletes every operator-owned bundle and the CA. Missing secrets are
    /// not an error; user-supplied external secrets are never touched.
    pub async fn revoke(&self, cluster: &ClusterRef) -> Result<(), ControllerError> {
        let names = BundleRole::ALL
            .iter()
            .map(|role| role.secret_name(cluster))
            .chain(std::iter::once(cluster.ca_secret_name()));

        for name in names {
            match self.secrets.delete(&cluster.namespace, &name).await {
                Ok(()) => info!("Deleted TLS secret {}/{}", cluster.namespace, name),
                Err(ControllerError::NotFound(_)) => {
                    debug!("TLS secret {}/{} already gone", cluster.namespace, name)
                }
                Err(e) => {
                    warn!("Failed to delete TLS secret {}/{}: {}", cluster.namespace, name, e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

/// Verifies a stored bundle against the CA it carries.
pub fn verify_bundle(bundle: &CredentialBundle) -> Result<(), ControllerError> {
    let Some(keys) = bundle.role.keys() else {
        return Ok(());
    };
    let text = |key: &str| {
        bundle
            .data
            .get(key)
            .and_then(|b| std::str::from_utf8(b).ok())
            .ok_or_else(|| ControllerError::InvalidConfig(format!("{} is missing {}", bundle.secret_name, key)))
    };
    pki::verify_self_signed(text(keys.ca)?)?;
    pki::verify_signed_by(text(keys.cert)?, text(keys.ca)?)?;
    Ok(())
}

#[cfg(test)]
#[path = "issuer_test.rs"]
mod issuer_test;
