//! Controller configuration, read once from environment variables.

use crate::error::ControllerError;
use std::net::SocketAddr;
use std::time::Duration;

/// Runtime configuration for the Vault Controller.
#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace to watch; `None` watches all namespaces
    pub namespace: Option<String>,
    /// DNS suffix used in etcd SANs
    pub cluster_domain: String,
    /// Requeue interval for healthy clusters
    pub resync_interval: Duration,
    /// Per-node health probe timeout
    pub probe_timeout: Duration,
    /// Max concurrent reconciliations
    pub concurrency: u16,
    /// Passes to wait for a replaced node before flagging the upgrade as stalled
    pub stall_threshold: u32,
    /// Listen address for /healthz, /readyz and /metrics
    pub probes_addr: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: None,
            cluster_domain: "cluster.local".to_string(),
            resync_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            concurrency: 3,
            stall_threshold: 10,
            probes_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, falling back to defaults for
    /// unset variables.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let namespace = lookup("WATCH_NAMESPACE").filter(|ns| !ns.is_empty());
        let cluster_domain = lookup("CLUSTER_DOMAIN")
            .filter(|d| !d.is_empty())
            .unwrap_or(defaults.cluster_domain);

        let resync_interval = match lookup("RESYNC_INTERVAL_SECS") {
            Some(v) => Duration::from_secs(parse_positive("RESYNC_INTERVAL_SECS", &v)?),
            None => defaults.resync_interval,
        };
        let probe_timeout = match lookup("PROBE_TIMEOUT_SECS") {
            Some(v) => Duration::from_secs(parse_positive("PROBE_TIMEOUT_SECS", &v)?),
            None => defaults.probe_timeout,
        };
        let concurrency = match lookup("RECONCILE_CONCURRENCY") {
            Some(v) => u16::try_from(parse_positive("RECONCILE_CONCURRENCY", &v)?).map_err(|_| {
                ControllerError::InvalidConfig(format!("RECONCILE_CONCURRENCY out of range: {}", v))
            })?,
            None => defaults.concurrency,
        };
        let stall_threshold = match lookup("STALL_THRESHOLD") {
            Some(v) => u32::try_from(parse_positive("STALL_THRESHOLD", &v)?).map_err(|_| {
                ControllerError::InvalidConfig(format!("STALL_THRESHOLD out of range: {}", v))
            })?,
            None => defaults.stall_threshold,
        };
        let probes_addr = match lookup("PROBES_ADDR") {
            Some(v) => v.parse().map_err(|e| {
                ControllerError::InvalidConfig(format!("PROBES_ADDR '{}' is not a socket address: {}", v, e))
            })?,
            None => defaults.probes_addr,
        };

        Ok(Self {
            namespace,
            cluster_domain,
            resync_interval,
            probe_timeout,
            concurrency,
            stall_threshold,
            probes_addr,
        })
    }
}

fn parse_positive(key: &str, value: &str) -> Result<u64, ControllerError> {
    match value.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ControllerError::InvalidConfig(format!(
            "{} must be a positive integer, got '{}'",
            key, value
        ))),
    }
}
