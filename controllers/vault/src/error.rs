//! Controller-specific error types.
//!
//! Store failures are classified by what the reconciler must do about
//! them: not-found and already-exists are usually absorbed by the caller,
//! conflicts restart the pass, transient failures are retried with backoff.

use crate::pki::PkiError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the Vault Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Object was created concurrently
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic-concurrency precondition failed
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Store or network failure worth retrying
    #[error("Transient failure during {context}: {message}")]
    TransientInfra { context: String, message: String },

    /// Key generation, signing or certificate parsing failed
    #[error("Crypto error: {0}")]
    Crypto(#[from] PkiError),

    /// Invalid configuration or spec
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Kubernetes API error without further classification
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Metrics registration or encoding failed
    #[error("Metrics error: {0}")]
    Metrics(String),
}

impl ControllerError {
    /// Classifies a kube API failure for `context` (e.g. "get secret ns/name").
    pub fn from_kube(context: impl Into<String>, err: KubeError) -> Self {
        let context = context.into();
        match err {
            KubeError::Api(ae) if ae.code == 404 => ControllerError::NotFound(context),
            KubeError::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                ControllerError::AlreadyExists(context)
            }
            KubeError::Api(ae) if ae.code == 409 => ControllerError::Conflict(context),
            other => ControllerError::TransientInfra {
                context,
                message: other.to_string(),
            },
        }
    }

    /// Whether the error should be retried on a short backoff rather than
    /// waiting for the next resync.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ControllerError::Conflict(_)
                | ControllerError::TransientInfra { .. }
                | ControllerError::Kube(_)
        )
    }

    /// Stable, short reason used in status conditions and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            ControllerError::NotFound(_) => "NotFound",
            ControllerError::AlreadyExists(_) => "AlreadyExists",
            ControllerError::Conflict(_) => "Conflict",
            ControllerError::TransientInfra { .. } => "TransientInfra",
            ControllerError::Crypto(_) => "CryptoError",
            ControllerError::InvalidConfig(_) => "InvalidConfig",
            ControllerError::Kube(_) => "KubeError",
            ControllerError::Watch(_) => "WatchError",
            ControllerError::Metrics(_) => "MetricsError",
        }
    }
}
