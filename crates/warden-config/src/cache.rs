//! On-disk cache of the last accepted policy set

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::{ConfigError, ConfigResult, PolicySet};

/// A JSON file holding a policy set
#[derive(Debug, Clone)]
pub struct PolicyCache {
    path: PathBuf,
}

impl PolicyCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the cached set. Returns `None` if the cache file does not exist.
    pub fn load(&self) -> ConfigResult<Option<PolicySet>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ConfigError::ReadError(e)),
        };

        let set = serde_json::from_str(&content).map_err(|source| ConfigError::PolicyDecode {
            path: self.path.clone(),
            source,
        })?;
        Ok(Some(set))
    }

    /// Replace the cached set. The file is written next to its final
    /// location and renamed into place.
    pub fn store(&self, set: &PolicySet) -> ConfigResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let data = serde_json::to_vec_pretty(set).map_err(ConfigError::EncodeError)?;

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;

        tracing::debug!(path = %self.path.display(), count = set.len(), "Wrote policy cache");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Comparison, Criterion, Policy};
    use std::time::Duration;
    use tempfile::TempDir;
    use warden_api::Strategy;

    #[test]
    fn missing_cache_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let cache = PolicyCache::new(dir.path().join("policies.json"));
        assert!(cache.load().unwrap().is_none());
    }

    #[test]
    fn store_then_load() {
        let dir = TempDir::new().unwrap();
        let cache = PolicyCache::new(dir.path().join("nested").join("policies.json"));

        let set = PolicySet::from(vec![Policy::new(
            "app",
            Strategy::Consumer,
            2,
            Duration::from_secs(90),
            vec![Criterion::new("program.name", Comparison::Exact, "app")],
        )]);
        cache.store(&set).unwrap();

        assert_eq!(cache.load().unwrap(), Some(set));
        assert!(!dir.path().join("nested").join("policies.json.tmp").exists());
    }

    #[test]
    fn corrupt_cache_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("policies.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(PolicyCache::new(&path).load().is_err());
    }
}
