//! Validated daemon configuration
//!
//! Every field is optional so that command-line flags can fill the gaps.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use warden_util::parse_duration;

use crate::schema::{RawBrokerConfig, RawDaemonConfig, RawEnforcerConfig};

/// Lease store backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StoreKind {
    #[default]
    Memory,
    Sqlite,
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(StoreKind::Memory),
            "sqlite" => Ok(StoreKind::Sqlite),
            other => Err(format!("unknown lease store \"{}\" (expected memory or sqlite)", other)),
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::Memory => f.write_str("memory"),
            StoreKind::Sqlite => f.write_str("sqlite"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerConfig {
    pub listen: Option<String>,
    pub policy_dir: Option<PathBuf>,
    pub store: Option<StoreKind>,
    pub database: Option<PathBuf>,
    pub txlog: Option<bool>,
    pub checkpoint: Option<String>,
    pub purge_interval: Option<Duration>,
    pub shutdown_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnforcerConfig {
    pub servers: Vec<String>,
    pub passive: Option<bool>,
    pub hostname: Option<String>,
    pub policy_interval: Option<Duration>,
    pub enforce_interval: Option<Duration>,
    pub policy_cache: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonConfig {
    pub broker: BrokerConfig,
    pub enforcer: EnforcerConfig,
}

// Only called after validation, so parse failures cannot occur here
fn duration(value: Option<String>) -> Option<Duration> {
    value.and_then(|v| parse_duration(&v).ok())
}

impl DaemonConfig {
    /// Convert from raw config (after validation)
    pub fn from_raw(raw: RawDaemonConfig) -> Self {
        Self {
            broker: BrokerConfig::from_raw(raw.broker),
            enforcer: EnforcerConfig::from_raw(raw.enforcer),
        }
    }
}

impl BrokerConfig {
    fn from_raw(raw: RawBrokerConfig) -> Self {
        Self {
            listen: raw.listen,
            policy_dir: raw.policy_dir,
            store: raw.store.and_then(|s| s.parse().ok()),
            database: raw.database,
            txlog: raw.txlog,
            checkpoint: raw.checkpoint,
            purge_interval: duration(raw.purge_interval),
            shutdown_timeout: duration(raw.shutdown_timeout),
        }
    }
}

impl EnforcerConfig {
    fn from_raw(raw: RawEnforcerConfig) -> Self {
        Self {
            servers: raw.servers,
            passive: raw.passive,
            hostname: raw.hostname,
            policy_interval: duration(raw.policy_interval),
            enforce_interval: duration(raw.enforce_interval),
            policy_cache: raw.policy_cache,
        }
    }
}
