//! Policy sources

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::{ConfigError, ConfigResult, DEFAULT_DURATION, Policy, PolicySet};

/// Something that can produce the current set of policies
pub trait PolicySource: Send + Sync {
    /// Display name used in startup logs
    fn name(&self) -> String;

    /// Return the complete set of policies
    fn policies(&self) -> ConfigResult<PolicySet>;
}

/// A fixed set of policies
impl PolicySource for PolicySet {
    fn name(&self) -> String {
        "Static".to_string()
    }

    fn policies(&self) -> ConfigResult<PolicySet> {
        Ok(self.clone())
    }
}

/// Reads policies from `*.pol` files in a directory
///
/// Each file holds one JSON-encoded policy. Files are read in name order.
/// Policies without a duration get `DEFAULT_DURATION`.
#[derive(Debug, Clone)]
pub struct DirectoryPolicies {
    path: PathBuf,
}

impl DirectoryPolicies {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn is_policy_file(path: &Path) -> bool {
    path.is_file() && path.extension().is_some_and(|ext| ext == "pol")
}

/// Load a single policy file
pub fn load_policy_file(path: &Path) -> ConfigResult<Policy> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::PolicyFile {
        path: path.to_path_buf(),
        source,
    })?;

    let mut policy: Policy =
        serde_json::from_str(&content).map_err(|source| ConfigError::PolicyDecode {
            path: path.to_path_buf(),
            source,
        })?;

    if policy.duration.is_zero() {
        policy.duration = DEFAULT_DURATION;
    }
    Ok(policy)
}

impl PolicySource for DirectoryPolicies {
    fn name(&self) -> String {
        format!("Filesystem ({})", self.path.display())
    }

    fn policies(&self) -> ConfigResult<PolicySet> {
        let entries = std::fs::read_dir(&self.path).map_err(|source| ConfigError::PolicyDirectory {
            path: self.path.clone(),
            source,
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| ConfigError::PolicyDirectory {
                path: self.path.clone(),
                source,
            })?;
            let path = entry.path();
            if is_policy_file(&path) {
                files.push(path);
            }
        }
        files.sort();

        let mut set = PolicySet::new();
        for file in files {
            set.push(load_policy_file(&file)?);
        }
        tracing::debug!(path = %self.path.display(), count = set.len(), "Loaded policy directory");
        Ok(set)
    }
}

/// Remembers the first successful load of another source
pub struct CachedPolicies<S> {
    source: S,
    cached: RwLock<Option<PolicySet>>,
}

impl<S: PolicySource> CachedPolicies<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            cached: RwLock::new(None),
        }
    }
}

impl<S: PolicySource> PolicySource for CachedPolicies<S> {
    fn name(&self) -> String {
        format!("{} (with in-memory caching)", self.source.name())
    }

    fn policies(&self) -> ConfigResult<PolicySet> {
        if let Some(set) = self.cached.read().unwrap().as_ref() {
            return Ok(set.clone());
        }

        let mut cached = self.cached.write().unwrap();
        if let Some(set) = cached.as_ref() {
            return Ok(set.clone());
        }
        let set = self.source.policies()?;
        *cached = Some(set.clone());
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) {
        std::fs::write(dir.path().join(name), content).unwrap();
    }

    #[test]
    fn loads_pol_files_in_name_order() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "b.pol",
            r#"{"resource":"second","criteria":[{"key":"k","comparison":"exact","value":"v"}],"limit":1,"duration":"1m"}"#,
        );
        write(
            &dir,
            "a.pol",
            r#"{"resource":"first","criteria":[{"key":"k","comparison":"exact","value":"v"}],"limit":2}"#,
        );
        write(&dir, "notes.txt", "not a policy");

        let set = DirectoryPolicies::new(dir.path()).policies().unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.as_slice()[0].resource, "first");
        assert_eq!(set.as_slice()[0].duration, DEFAULT_DURATION);
        assert_eq!(set.as_slice()[1].duration, Duration::from_secs(60));
    }

    #[test]
    fn bad_file_aborts_load_and_names_file() {
        let dir = TempDir::new().unwrap();
        write(&dir, "broken.pol", r#"{"strategy":"sometimes"}"#);

        let err = DirectoryPolicies::new(dir.path()).policies().unwrap_err();
        assert!(matches!(err, ConfigError::PolicyDecode { .. }));
        assert!(err.to_string().contains("broken.pol"));
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = TempDir::new().unwrap();
        let source = DirectoryPolicies::new(dir.path().join("absent"));
        assert!(matches!(
            source.policies(),
            Err(ConfigError::PolicyDirectory { .. })
        ));
    }

    struct Counting {
        calls: AtomicUsize,
        fail_first: bool,
    }

    impl PolicySource for Counting {
        fn name(&self) -> String {
            "Counting".into()
        }

        fn policies(&self) -> ConfigResult<PolicySet> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                return Err(ConfigError::Invalid("unavailable".into()));
            }
            Ok(PolicySet::from(vec![Policy::default()]))
        }
    }

    #[test]
    fn cache_remembers_first_success() {
        let cached = CachedPolicies::new(Counting {
            calls: AtomicUsize::new(0),
            fail_first: true,
        });
        assert_eq!(cached.name(), "Counting (with in-memory caching)");

        assert!(cached.policies().is_err());
        assert_eq!(cached.policies().unwrap().len(), 1);
        assert_eq!(cached.policies().unwrap().len(), 1);
        assert_eq!(cached.source.calls.load(Ordering::SeqCst), 2);
    }
}
