//! Vault client errors

use thiserror::Error;

/// Errors that can occur when probing a Vault node
#[derive(Debug, Error)]
pub enum VaultError {
    /// HTTP request/response error (connect, timeout, TLS handshake)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The supplied CA bundle could not be used as a trust root
    #[error("Invalid CA certificate: {0}")]
    InvalidCa(String),

    /// Vault answered with an unexpected status code
    #[error("Vault API error: {status} - {body}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Response body, as text
        body: String,
    },

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
