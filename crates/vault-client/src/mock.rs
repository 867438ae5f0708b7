//! Mock VaultClient for unit testing
//!
//! Serves canned health responses keyed by node address, so callers can be
//! tested without running Vault.

use crate::error::VaultError;
use crate::models::HealthResponse;
use crate::vault_trait::VaultClientTrait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Mock VaultClient for testing
///
/// Addresses without a configured response behave as unreachable.
#[derive(Clone, Default)]
pub struct MockVaultClient {
    responses: Arc<Mutex<HashMap<String, HealthResponse>>>,
    calls: Arc<Mutex<HashMap<String, usize>>>,
}

impl MockVaultClient {
    /// Create a new mock client with no reachable nodes
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the health response served for `address` (for test setup)
    pub fn set_health(&self, address: impl Into<String>, health: HealthResponse) {
        self.responses.lock().unwrap().insert(address.into(), health);
    }

    /// Makes `address` fail its probe
    pub fn set_unreachable(&self, address: &str) {
        self.responses.lock().unwrap().remove(address);
    }

    /// Number of probes sent to `address`
    pub fn call_count(&self, address: &str) -> usize {
        self.calls.lock().unwrap().get(address).copied().unwrap_or(0)
    }

    /// Total number of probes sent
    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait::async_trait]
impl VaultClientTrait for MockVaultClient {
    async fn health(&self, address: &str, _ca_pem: &[u8]) -> Result<HealthResponse, VaultError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_insert(0) += 1;

        self.responses
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .ok_or_else(|| VaultError::Api {
                status: 503,
                body: format!("no route to {}", address),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NodeRole;

    #[tokio::test]
    async fn test_mock_serves_configured_health() {
        let mock = MockVaultClient::new();
        mock.set_health("a", HealthResponse::unsealed(false, "0.9.1"));

        let health = mock.health("a", b"").await.unwrap();
        assert_eq!(health.role(), NodeRole::Active);
        assert_eq!(mock.call_count("a"), 1);
    }

    #[tokio::test]
    async fn test_mock_unknown_address_is_unreachable() {
        let mock = MockVaultClient::new();
        mock.set_health("a", HealthResponse::sealed(true, "0.9.1"));
        mock.set_unreachable("a");

        assert!(mock.health("a", b"").await.is_err());
        assert!(mock.health("b", b"").await.is_err());
        assert_eq!(mock.total_calls(), 2);
    }
}
