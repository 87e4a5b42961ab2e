//! Raw daemon configuration schema (as parsed from TOML)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raw configuration as parsed from TOML
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RawDaemonConfig {
    #[serde(default)]
    pub broker: RawBrokerConfig,

    #[serde(default)]
    pub enforcer: RawEnforcerConfig,
}

/// Broker settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RawBrokerConfig {
    /// Listen address (default: 0.0.0.0:5877)
    pub listen: Option<String>,

    /// Directory of *.pol files
    pub policy_dir: Option<PathBuf>,

    /// Lease store backend: "memory" or "sqlite"
    pub store: Option<String>,

    /// SQLite database path
    pub database: Option<PathBuf>,

    /// Log lease transactions
    pub txlog: Option<bool>,

    /// Transaction log checkpoint schedule, such as "100ops"
    pub checkpoint: Option<String>,

    /// Interval between purges, such as "1m". "0s" disables periodic purges.
    pub purge_interval: Option<String>,

    /// Graceful shutdown timeout
    pub shutdown_timeout: Option<String>,
}

/// Enforcement service settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RawEnforcerConfig {
    /// Broker addresses, tried in order
    #[serde(default)]
    pub servers: Vec<String>,

    /// Observe processes with reduced rights
    pub passive: Option<bool>,

    /// Host name reported to the broker
    pub hostname: Option<String>,

    /// Interval between policy fetches
    pub policy_interval: Option<String>,

    /// Interval between process scans
    pub enforce_interval: Option<String>,

    /// Policy cache file
    pub policy_cache: Option<PathBuf>,
}
