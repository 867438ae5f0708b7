//! Vault health probe client
//!
//! A small client for the one Vault endpoint the operator relies on:
//! `GET /v1/sys/health`. Every node is probed directly over TLS, trusting
//! only the cluster CA.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use vault_client::{VaultClient, VaultClientTrait};
//!
//! # async fn example(ca_pem: &[u8]) -> Result<(), Box<dyn std::error::Error>> {
//! let client = VaultClient::new(8200, Duration::from_secs(5));
//! let health = client.health("10-0-0-7.vault.pod", ca_pem).await?;
//! println!("role: {:?}, version: {}", health.role(), health.version);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod vault_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::VaultClient;
pub use error::VaultError;
pub use models::*;
pub use vault_trait::VaultClientTrait;
#[cfg(feature = "test-util")]
pub use mock::MockVaultClient;
