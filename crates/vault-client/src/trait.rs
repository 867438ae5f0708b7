//! VaultClient trait for mocking
//!
//! The controller only depends on this trait, so unit tests can swap in
//! `MockVaultClient` or a simulated cluster.

use crate::error::VaultError;
use crate::models::HealthResponse;

/// Trait for Vault node probing
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait VaultClientTrait: Send + Sync {
    /// Queries `/v1/sys/health` on a single node.
    ///
    /// `address` is the node's DNS name (or IP) without scheme or port.
    /// `ca_pem` is the PEM-encoded CA used to verify the node's certificate.
    async fn health(&self, address: &str, ca_pem: &[u8]) -> Result<HealthResponse, VaultError>;
}
