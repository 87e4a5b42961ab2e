//! Expiring memory of recently seen keys

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Remembers keys for a fixed period after they are recorded
///
/// Used by the enforcer to avoid retrying (and re-logging) processes it
/// recently failed to open.
#[derive(Debug)]
pub struct RecentSet<K> {
    /// How long a key is remembered
    ttl: Duration,
    /// When each key was recorded
    entries: HashMap<K, Instant>,
}

impl<K: Eq + Hash + Clone> RecentSet<K> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Record a key. Recording an existing key restarts its period.
    pub fn insert(&mut self, key: K) {
        self.insert_at(key, Instant::now());
    }

    pub fn insert_at(&mut self, key: K, at: Instant) {
        self.entries.insert(key, at);
    }

    /// Returns true if the key was recorded less than `ttl` ago
    pub fn contains(&self, key: &K) -> bool {
        self.contains_at(key, Instant::now())
    }

    pub fn contains_at(&self, key: &K, at: Instant) -> bool {
        self.entries
            .get(key)
            .is_some_and(|recorded| at.saturating_duration_since(*recorded) < self.ttl)
    }

    pub fn remove(&mut self, key: &K) {
        self.entries.remove(key);
    }

    /// Forget every key whose period has ended
    pub fn cleanup(&mut self) {
        self.cleanup_at(Instant::now());
    }

    pub fn cleanup_at(&mut self, at: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, recorded| at.saturating_duration_since(*recorded) < ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
