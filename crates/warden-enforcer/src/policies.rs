//! Policy manager

use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use warden_client::{Client, ClientResult};
use warden_config::{PolicyCache, PolicySet};

use crate::{EnforcerError, EnforcerResult};

/// How long a single policy retrieval may take
pub const POLICY_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Something that can retrieve the broker's current policies
#[async_trait]
pub trait PolicyFetcher: Send + Sync {
    async fn fetch(&self) -> ClientResult<PolicySet>;
}

#[async_trait]
impl PolicyFetcher for Client {
    async fn fetch(&self) -> ClientResult<PolicySet> {
        self.policies().await
    }
}

/// Keeps a copy of the current policy set
pub struct PolicyManager {
    fetcher: Arc<dyn PolicyFetcher>,
    cache: Option<PolicyCache>,
    timeout: Duration,
    policies: RwLock<PolicySet>,
}

impl PolicyManager {
    pub fn new(fetcher: Arc<dyn PolicyFetcher>, cache: Option<PolicyCache>) -> Self {
        Self {
            fetcher,
            cache,
            timeout: POLICY_FETCH_TIMEOUT,
            policies: RwLock::new(PolicySet::new()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The most recently accepted policy set
    pub fn policies(&self) -> PolicySet {
        self.policies.read().unwrap().clone()
    }

    /// Adopt the cached policy set, if there is one. Returns true if a set
    /// was loaded.
    pub fn load_cache(&self) -> bool {
        let Some(cache) = &self.cache else {
            return false;
        };
        match cache.load() {
            Ok(Some(set)) => {
                info!(path = %cache.path().display(), count = set.len(), "Loaded cached policies");
                *self.policies.write().unwrap() = set;
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(path = %cache.path().display(), error = %e, "Unable to read policy cache");
                false
            }
        }
    }

    /// Retrieve the current policies. Returns true if they differ from the
    /// previous set. A failed retrieval leaves the previous set in place.
    pub async fn update(&self) -> EnforcerResult<bool> {
        let updated = match tokio::time::timeout(self.timeout, self.fetcher.fetch()).await {
            Ok(Ok(set)) => set,
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to retrieve policies");
                return Err(e.into());
            }
            Err(_) => {
                warn!(timeout = ?self.timeout, "Failed to retrieve policies: timed out");
                return Err(EnforcerError::Timeout(self.timeout));
            }
        };

        let previous = std::mem::replace(&mut *self.policies.write().unwrap(), updated.clone());

        let (additions, removals) = previous.diff(&updated);
        if additions.is_empty() && removals.is_empty() {
            debug!(count = updated.len(), "Policies unchanged");
            return Ok(false);
        }

        for policy in &additions {
            info!("POL: ADD {} {}", policy.hash(), policy);
        }
        for policy in &removals {
            info!("POL: REM {} {}", policy.hash(), policy);
        }

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.store(&updated) {
                warn!(path = %cache.path().display(), error = %e, "Unable to write policy cache");
            }
        }
        Ok(true)
    }
}
