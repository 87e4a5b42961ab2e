//! Default paths for warden components
//!
//! Paths are user-writable by default (no root required):
//! - Data: `$XDG_DATA_HOME/warden` or `~/.local/share/warden`
//! - Policy cache: `<data>/policies.json`
//! - Lease database: `<data>/leases.db`

use std::path::PathBuf;

/// Environment variable for overriding the data directory
pub const WARDEN_DATA_DIR_ENV: &str = "WARDEN_DATA_DIR";

/// Default TCP port of the broker
pub const DEFAULT_PORT: u16 = 5877;

/// Application subdirectory name
const APP_DIR: &str = "warden";

const POLICY_CACHE_FILENAME: &str = "policies.json";
const DATABASE_FILENAME: &str = "leases.db";

/// Get the default data directory.
///
/// Order of precedence:
/// 1. `$WARDEN_DATA_DIR` environment variable (if set)
/// 2. `$XDG_DATA_HOME/warden` (if XDG_DATA_HOME is set)
/// 3. `~/.local/share/warden` (fallback)
pub fn default_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var(WARDEN_DATA_DIR_ENV) {
        return PathBuf::from(path);
    }

    data_dir_without_env()
}

/// Get the data directory without checking WARDEN_DATA_DIR env var.
pub fn data_dir_without_env() -> PathBuf {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(data_home).join(APP_DIR);
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home)
            .join(".local")
            .join("share")
            .join(APP_DIR);
    }

    // Last resort
    PathBuf::from("/tmp").join(APP_DIR).join("data")
}

/// Default location of the enforcer's on-disk policy cache
pub fn default_policy_cache_path() -> PathBuf {
    default_data_dir().join(POLICY_CACHE_FILENAME)
}

/// Default location of the broker's SQLite lease database
pub fn default_database_path() -> PathBuf {
    default_data_dir().join(DATABASE_FILENAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_dir_contains_warden() {
        let path = data_dir_without_env();
        assert!(path.to_string_lossy().contains("warden"));
    }

    #[test]
    fn file_paths_live_in_data_dir() {
        let cache = default_policy_cache_path();
        let db = default_database_path();
        assert_eq!(cache.parent(), db.parent());
        assert!(cache.ends_with("policies.json"));
        assert!(db.ends_with("leases.db"));
    }
}
