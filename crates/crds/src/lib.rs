//! Vault Operator CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the Vault operator.

pub mod vault_service;
pub mod status;

pub use vault_service::*;
pub use status::*;
