//! Vault API client
//!
//! Probes individual Vault nodes over TLS. Clients are cached per CA bundle
//! so a pass over N nodes builds at most one TLS configuration.

use crate::error::VaultError;
use crate::models::HealthResponse;
use crate::vault_trait::VaultClientTrait;
use reqwest::{Certificate, Client};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Query string that makes Vault answer 200 in every state, so the body
/// can always be parsed and classified by the caller.
const HEALTH_QUERY: &str = "standbyok=true&perfstandbyok=true&sealedcode=200&uninitcode=200";

/// Distinct CA bundles kept before the cache is flushed
const DEFAULT_CACHE_CAPACITY: usize = 32;

/// Vault API client
pub struct VaultClient {
    port: u16,
    timeout: Duration,
    cache_capacity: usize,
    clients: Mutex<HashMap<Vec<u8>, Client>>,
}

impl std::fmt::Debug for VaultClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultClient")
            .field("port", &self.port)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl VaultClient {
    /// Create a new Vault client
    ///
    /// # Arguments
    /// * `port` - Vault client port on every node (8200 by default)
    /// * `timeout` - Per-probe request timeout
    #[must_use]
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self {
            port,
            timeout,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Bounds the number of cached per-CA clients. When a new CA would
    /// exceed it, every cached client is dropped and rebuilt on demand, so
    /// CAs of deleted clusters do not accumulate.
    #[must_use]
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity.max(1);
        self
    }

    fn cached_clients(&self) -> usize {
        self.clients.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// URL of the health endpoint on `address`.
    #[must_use]
    pub fn health_url(&self, address: &str) -> String {
        format!("https://{}:{}/v1/sys/health?{}", address, self.port, HEALTH_QUERY)
    }

    /// Returns a client trusting only `ca_pem`, building it on first use.
    fn client_for(&self, ca_pem: &[u8]) -> Result<Client, VaultError> {
        if let Ok(clients) = self.clients.lock() {
            if let Some(client) = clients.get(ca_pem) {
                return Ok(client.clone());
            }
        }

        let roots = Certificate::from_pem_bundle(ca_pem)
            .map_err(|e| VaultError::InvalidCa(e.to_string()))?;
        if roots.is_empty() {
            return Err(VaultError::InvalidCa("no certificate in CA bundle".to_string()));
        }
        let mut builder = Client::builder()
            .timeout(self.timeout)
            .tls_built_in_root_certs(false);
        for root in roots {
            builder = builder.add_root_certificate(root);
        }
        let client = builder.build()?;

        if let Ok(mut clients) = self.clients.lock() {
            if clients.len() >= self.cache_capacity {
                debug!("Flushing {} cached Vault clients", clients.len());
                clients.clear();
            }
            clients.insert(ca_pem.to_vec(), client.clone());
        }
        Ok(client)
    }
}

#[async_trait::async_trait]
impl VaultClientTrait for VaultClient {
    async fn health(&self, address: &str, ca_pem: &[u8]) -> Result<HealthResponse, VaultError> {
        let client = self.client_for(ca_pem)?;
        let url = self.health_url(address);
        debug!("Probing Vault node: {}", url);

        let response = client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(VaultError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let health: HealthResponse = serde_json::from_str(&body)?;
        debug!(
            "Vault node {} health: initialized={}, sealed={}, standby={}, version={}",
            address, health.initialized, health.sealed, health.standby, health.version
        );
        Ok(health)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_url_requests_200_in_every_state() {
        let client = VaultClient::new(8200, Duration::from_secs(1));
        let url = client.health_url("10-0-0-7.vault.pod");
        assert!(url.starts_with("https://10-0-0-7.vault.pod:8200/v1/sys/health?"));
        assert!(url.contains("sealedcode=200"));
        assert!(url.contains("uninitcode=200"));
        assert!(url.contains("standbyok=true"));
    }

    const CA_1: &str = include_str!("../tests/fixtures/ca-1.pem");
    const CA_2: &str = include_str!("../tests/fixtures/ca-2.pem");

    #[tokio::test]
    async fn test_client_cache_is_reused_per_ca() {
        let client = VaultClient::new(8200, Duration::from_secs(1));
        client.client_for(CA_1.as_bytes()).unwrap();
        client.client_for(CA_1.as_bytes()).unwrap();
        client.client_for(CA_2.as_bytes()).unwrap();
        assert_eq!(client.cached_clients(), 2);
    }

    #[tokio::test]
    async fn test_client_cache_is_bounded() {
        let client = VaultClient::new(8200, Duration::from_secs(1)).with_cache_capacity(1);
        client.client_for(CA_1.as_bytes()).unwrap();
        client.client_for(CA_2.as_bytes()).unwrap();
        assert_eq!(client.cached_clients(), 1);

        // The flushed CA is rebuilt when needed again
        client.client_for(CA_1.as_bytes()).unwrap();
        assert_eq!(client.cached_clients(), 1);
    }

    #[tokio::test]
    async fn test_invalid_ca_is_rejected_before_any_request() {
        let client = VaultClient::new(8200, Duration::from_secs(1));
        let result = client.health("127.0.0.1", b"not a certificate").await;
        assert!(matches!(result, Err(VaultError::InvalidCa(_))));
    }
}
