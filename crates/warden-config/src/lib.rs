//! Policies and configuration for warden
//!
//! This crate provides:
//! - Resource policies, criteria matching and policy set aggregation
//! - Content hashes and diffs of policy sets
//! - Policy sources (directory of `*.pol` files, in-memory caching)
//! - The on-disk policy cache used by the enforcement service
//! - Daemon TOML configuration with validation

mod cache;
mod daemon;
mod hash;
mod policy;
mod schema;
mod source;
mod validation;

pub use cache::*;
pub use daemon::*;
pub use hash::{HASH_LEN, PolicyHash};
pub use policy::*;
pub use schema::*;
pub use source::*;
pub use validation::*;

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("unable to access policy directory \"{}\": {source}", path.display())]
    PolicyDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unable to read policy file \"{}\": {source}", path.display())]
    PolicyFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("decoding error while parsing policy file \"{}\": {source}", path.display())]
    PolicyDecode {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Failed to encode policies: {0}")]
    EncodeError(serde_json::Error),

    #[error("Validation failed: {errors:?}")]
    ValidationFailed { errors: Vec<ValidationError> },

    #[error("{0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Load and validate daemon configuration from a TOML file
pub fn load_daemon_config(path: impl AsRef<Path>) -> ConfigResult<DaemonConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_daemon_config(&content)
}

/// Parse and validate daemon configuration from a TOML string
pub fn parse_daemon_config(content: &str) -> ConfigResult<DaemonConfig> {
    let raw: RawDaemonConfig = toml::from_str(content)?;

    let errors = validate_daemon_config(&raw);
    if !errors.is_empty() {
        return Err(ConfigError::ValidationFailed { errors });
    }

    Ok(DaemonConfig::from_raw(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parse_empty_config() {
        let config = parse_daemon_config("").unwrap();
        assert_eq!(config, DaemonConfig::default());
    }

    #[test]
    fn parse_full_config() {
        let config = r#"
            [broker]
            listen = "127.0.0.1:5877"
            policy_dir = "/etc/warden/policies"
            store = "sqlite"
            database = "/var/lib/warden/leases.db"
            txlog = true
            checkpoint = "100ops"
            purge_interval = "1m"
            shutdown_timeout = "5s"

            [enforcer]
            servers = ["broker-a", "http://broker-b:8080"]
            passive = true
            policy_interval = "5s"
            enforce_interval = "1s"
        "#;

        let config = parse_daemon_config(config).unwrap();
        assert_eq!(config.broker.store, Some(StoreKind::Sqlite));
        assert_eq!(config.broker.purge_interval, Some(Duration::from_secs(60)));
        assert_eq!(config.broker.txlog, Some(true));
        assert_eq!(config.enforcer.servers.len(), 2);
        assert_eq!(config.enforcer.enforce_interval, Some(Duration::from_secs(1)));
        assert!(config.enforcer.hostname.is_none());
    }

    #[test]
    fn invalid_duration_fails_validation() {
        let config = r#"
            [enforcer]
            policy_interval = "-5s"
        "#;
        assert!(matches!(
            parse_daemon_config(config),
            Err(ConfigError::ValidationFailed { .. })
        ));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            parse_daemon_config("[broker]\nlisten_port = 1"),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("wardend.toml");
        std::fs::write(&path, "[broker]\nstore = \"memory\"\n").unwrap();
        let config = load_daemon_config(&path).unwrap();
        assert_eq!(config.broker.store, Some(StoreKind::Memory));
    }
}
