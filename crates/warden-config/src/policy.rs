//! Resource policies and policy sets
//!
//! A policy names a resource and the rules for leasing it. It applies to a
//! lease request when every one of its criteria matches the request's
//! properties. When several policies apply, `PolicySet` aggregates their
//! effects.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;
use warden_api::{Properties, Refresh, Strategy, merge_properties};
use warden_util::{duration_str, format_duration};

use crate::hash::{HashWriter, PolicyHash};

/// Limit reported by an empty policy set
pub const DEFAULT_LIMIT: u32 = u32::MAX;

/// Duration reported by an empty policy set, and used for policy files that
/// do not specify one
pub const DEFAULT_DURATION: Duration = Duration::from_secs(15 * 60);

/// How a criterion compares a property value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    Exact,
    #[serde(rename = "ignorecase")]
    IgnoreCase,
    Regex,
}

impl Comparison {
    pub fn as_str(self) -> &'static str {
        match self {
            Comparison::Exact => "exact",
            Comparison::IgnoreCase => "ignorecase",
            Comparison::Regex => "regex",
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compile a criterion pattern. Patterns are always case-insensitive; a
/// `(?i)` flag is prepended unless the pattern already starts with one.
pub fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    if pattern.starts_with("(?i") {
        Regex::new(pattern)
    } else {
        Regex::new(&format!("(?i){}", pattern))
    }
}

fn compile_logged(pattern: &str) -> Option<Regex> {
    compile_pattern(pattern)
        .map_err(|err| tracing::debug!(pattern = %pattern, error = %err, "Invalid criterion pattern"))
        .ok()
}

/// A criterion pattern compiled on first use, along with its source
#[derive(Debug, Clone, Default)]
struct CompiledPattern(OnceLock<(String, Option<Regex>)>);

impl PartialEq for CompiledPattern {
    fn eq(&self, _: &Self) -> bool {
        true
    }
}

impl Eq for CompiledPattern {}

/// A single condition on a lease property
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criterion {
    pub key: String,
    pub comparison: Comparison,
    pub value: String,
    #[serde(skip)]
    compiled: CompiledPattern,
}

impl Criterion {
    pub fn new(key: impl Into<String>, comparison: Comparison, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            comparison,
            value: value.into(),
            compiled: CompiledPattern::default(),
        }
    }

    /// Test a property value against this criterion
    pub fn matches_value(&self, value: &str) -> bool {
        match self.comparison {
            Comparison::Exact => self.value == value,
            Comparison::IgnoreCase => self.value.to_lowercase() == value.to_lowercase(),
            Comparison::Regex => {
                let (source, re) = self
                    .compiled
                    .0
                    .get_or_init(|| (self.value.clone(), compile_logged(&self.value)));
                if *source == self.value {
                    re.as_ref().is_some_and(|re| re.is_match(value))
                } else {
                    // The pattern was edited after first use
                    compile_logged(&self.value).is_some_and(|re| re.is_match(value))
                }
            }
        }
    }

    /// Test a property map against this criterion. A missing property
    /// compares as an empty string.
    pub fn matches(&self, props: &Properties) -> bool {
        let value = props.get(&self.key).map(String::as_str).unwrap_or("");
        self.matches_value(value)
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.key, self.comparison, self.value)
    }
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

/// Matching conditions and leasing rules for a resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// The resource pool leases are counted against
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource: String,
    /// All of these must match for the policy to apply
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub criteria: Vec<Criterion>,
    #[serde(default, skip_serializing_if = "Strategy::is_unspecified")]
    pub strategy: Strategy,
    /// Maximum concurrent consumption. Zero allows none.
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub limit: u32,
    #[serde(default, with = "duration_str")]
    pub duration: Duration,
    #[serde(default, with = "duration_str")]
    pub decay: Duration,
    #[serde(default, skip_serializing_if = "Refresh::is_zero")]
    pub refresh: Refresh,
    /// Merged into the properties of issued leases
    #[serde(default, skip_serializing_if = "Properties::is_empty")]
    pub properties: Properties,
}

impl Policy {
    pub fn new(
        resource: impl Into<String>,
        strategy: Strategy,
        limit: u32,
        duration: Duration,
        criteria: Vec<Criterion>,
    ) -> Self {
        Self {
            resource: resource.into(),
            criteria,
            strategy,
            limit,
            duration,
            ..Default::default()
        }
    }

    /// Returns true if every criterion matches. A policy without criteria
    /// never matches.
    pub fn matches(&self, props: &Properties) -> bool {
        !self.criteria.is_empty() && self.criteria.iter().all(|c| c.matches(props))
    }

    /// Content hash of the policy. Property order does not affect the hash.
    pub fn hash(&self) -> PolicyHash {
        let mut w = HashWriter::new();
        w.write_str(&self.resource);
        w.write_len(self.criteria.len());
        for c in &self.criteria {
            w.write_str(&c.key);
            w.write_str(c.comparison.as_str());
            w.write_str(&c.value);
        }
        w.write_str(self.strategy.as_str());
        w.write_u64(u64::from(self.limit));
        w.write_duration(self.duration);
        w.write_duration(self.decay);
        w.write_duration(self.refresh.active);
        w.write_duration(self.refresh.queued);
        // Properties is a BTreeMap, so iteration is already sorted by key
        w.write_len(self.properties.len());
        for (key, value) in &self.properties {
            w.write_str(key);
            w.write_str(value);
        }
        w.finish()
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.resource.is_empty() {
            parts.push(format!("Resource: {:?}", self.resource));
        }
        if !self.criteria.is_empty() {
            let criteria: Vec<String> = self.criteria.iter().map(|c| c.to_string()).collect();
            parts.push(format!("Criteria: {:?}", criteria.join(", ")));
        }
        if !self.strategy.is_unspecified() {
            parts.push(format!("Strategy: {}", self.strategy));
        }
        if self.limit != 0 {
            parts.push(format!("Limit: {}", self.limit));
        }
        if !self.duration.is_zero() {
            parts.push(format!("Duration: {}", format_duration(self.duration)));
        }
        if !self.decay.is_zero() {
            parts.push(format!("Decay: {}", format_duration(self.decay)));
        }
        if !self.refresh.active.is_zero() {
            parts.push(format!("Active Refresh: {}", format_duration(self.refresh.active)));
        }
        if !self.refresh.queued.is_zero() {
            parts.push(format!("Queued Refresh: {}", format_duration(self.refresh.queued)));
        }
        if !self.properties.is_empty() {
            parts.push(format!("Properties: {:?}", self.properties));
        }
        f.write_str(&parts.join(" "))
    }
}

/// The aggregated effect of a set of matching policies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Effect {
    pub resource: String,
    pub strategy: Strategy,
    pub limit: u32,
    pub duration: Duration,
    pub decay: Duration,
    pub refresh: Refresh,
    pub properties: Properties,
}

/// An ordered collection of policies
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicySet(Vec<Policy>);

impl PolicySet {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Policy> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Policy] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<Policy> {
        self.0
    }

    pub fn push(&mut self, policy: Policy) {
        self.0.push(policy);
    }

    /// The policies that apply to the given properties, in set order
    pub fn matching(&self, props: &Properties) -> PolicySet {
        self.0.iter().filter(|p| p.matches(props)).cloned().collect()
    }

    /// First non-empty resource, or an empty string
    pub fn resource(&self) -> &str {
        self.0
            .iter()
            .map(|p| p.resource.as_str())
            .find(|r| !r.is_empty())
            .unwrap_or("")
    }

    /// First specified strategy, or `Instance`
    pub fn strategy(&self) -> Strategy {
        self.0
            .iter()
            .map(|p| p.strategy)
            .find(|s| !s.is_unspecified())
            .unwrap_or(Strategy::Instance)
    }

    /// Minimum limit, or `DEFAULT_LIMIT` for an empty set
    pub fn limit(&self) -> u32 {
        self.0.iter().map(|p| p.limit).min().unwrap_or(DEFAULT_LIMIT)
    }

    /// Minimum duration, or `DEFAULT_DURATION` for an empty set
    pub fn duration(&self) -> Duration {
        self.0.iter().map(|p| p.duration).min().unwrap_or(DEFAULT_DURATION)
    }

    /// Maximum decay, or zero for an empty set
    pub fn decay(&self) -> Duration {
        self.0.iter().map(|p| p.decay).max().unwrap_or(Duration::ZERO)
    }

    /// First non-zero refresh interval for each status
    pub fn refresh(&self) -> Refresh {
        let mut refresh = Refresh::default();
        for p in &self.0 {
            if refresh.active.is_zero() {
                refresh.active = p.refresh.active;
            }
            if refresh.queued.is_zero() {
                refresh.queued = p.refresh.queued;
            }
            if !refresh.active.is_zero() && !refresh.queued.is_zero() {
                break;
            }
        }
        refresh
    }

    /// Union of policy properties. Later policies win.
    pub fn properties(&self) -> Properties {
        merge_properties(self.0.iter().map(|p| &p.properties))
    }

    pub fn effect(&self) -> Effect {
        Effect {
            resource: self.resource().to_string(),
            strategy: self.strategy(),
            limit: self.limit(),
            duration: self.duration(),
            decay: self.decay(),
            refresh: self.refresh(),
            properties: self.properties(),
        }
    }

    /// Distinct non-empty resources named by the set, in set order
    pub fn resources(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.0
            .iter()
            .filter(|p| !p.resource.is_empty() && seen.insert(p.resource.as_str()))
            .map(|p| p.resource.clone())
            .collect()
    }

    /// Compare against `next`, returning the policies only present in
    /// `next` (additions) and those only present in `self` (removals).
    pub fn diff(&self, next: &PolicySet) -> (PolicySet, PolicySet) {
        let old: HashSet<PolicyHash> = self.0.iter().map(Policy::hash).collect();
        let new: HashSet<PolicyHash> = next.0.iter().map(Policy::hash).collect();

        let additions = next.0.iter().filter(|p| !old.contains(&p.hash())).cloned().collect();
        let removals = self.0.iter().filter(|p| !new.contains(&p.hash())).cloned().collect();
        (additions, removals)
    }
}

impl From<Vec<Policy>> for PolicySet {
    fn from(policies: Vec<Policy>) -> Self {
        Self(policies)
    }
}

impl FromIterator<Policy> for PolicySet {
    fn from_iter<I: IntoIterator<Item = Policy>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for PolicySet {
    type Item = Policy;
    type IntoIter = std::vec::IntoIter<Policy>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a PolicySet {
    type Item = &'a Policy;
    type IntoIter = std::slice::Iter<'a, Policy>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn app_policy(limit: u32) -> Policy {
        Policy::new(
            "app",
            Strategy::Unspecified,
            limit,
            Duration::from_secs(60),
            vec![Criterion::new("program.name", Comparison::IgnoreCase, "app.exe")],
        )
    }

    #[test]
    fn comparisons() {
        let exact = Criterion::new("k", Comparison::Exact, "Value");
        assert!(exact.matches_value("Value"));
        assert!(!exact.matches_value("value"));

        let ignore = Criterion::new("k", Comparison::IgnoreCase, "Value");
        assert!(ignore.matches_value("VALUE"));

        let re = Criterion::new("k", Comparison::Regex, "^app.*\\.exe$");
        assert!(re.matches_value("APPLICATION.EXE"));
        assert!(!re.matches_value("other.exe"));

        let bad = Criterion::new("k", Comparison::Regex, "(");
        assert!(!bad.matches_value("("));
    }

    #[test]
    fn patterns_compile_once_and_follow_edits() {
        let mut re = Criterion::new("k", Comparison::Regex, "^app");
        assert!(re.matches_value("App.exe"));
        assert!(re.compiled.0.get().is_some_and(|(source, re)| source == "^app" && re.is_some()));
        assert!(re.matches_value("application"));

        re.value = "^editor".into();
        assert!(re.matches_value("Editor.exe"));
        assert!(!re.matches_value("App.exe"));

        let decoded: Criterion = serde_json::from_str(r#"{"key":"k","comparison":"regex","value":"x$"}"#).unwrap();
        assert!(decoded.matches_value("BOX"));
        assert_eq!(decoded, Criterion::new("k", Comparison::Regex, "x$"));
    }

    #[test]
    fn comparison_json_names() {
        let c: Criterion =
            serde_json::from_str(r#"{"key":"k","comparison":"ignorecase","value":"v"}"#).unwrap();
        assert_eq!(c.comparison, Comparison::IgnoreCase);
        assert!(serde_json::from_str::<Comparison>("\"fuzzy\"").is_err());
    }

    #[test]
    fn missing_property_compares_as_empty() {
        let c = Criterion::new("missing", Comparison::Exact, "");
        assert!(c.matches(&Properties::new()));
    }

    #[test]
    fn policy_without_criteria_never_matches() {
        let p = Policy {
            resource: "app".into(),
            limit: 1,
            ..Default::default()
        };
        assert!(!p.matches(&props(&[("program.name", "app.exe")])));
    }

    #[test]
    fn all_criteria_must_match() {
        let mut p = app_policy(1);
        p.criteria.push(Criterion::new("user.name", Comparison::Exact, "alice"));

        assert!(p.matches(&props(&[("program.name", "App.exe"), ("user.name", "alice")])));
        assert!(!p.matches(&props(&[("program.name", "App.exe"), ("user.name", "bob")])));
    }

    #[test]
    fn aggregation() {
        let mut a = app_policy(5);
        a.strategy = Strategy::Unspecified;
        a.decay = Duration::from_secs(10);
        a.refresh.queued = Duration::from_secs(7);
        a.properties.insert("k".into(), "first".into());

        let mut b = app_policy(3);
        b.resource = "other".into();
        b.strategy = Strategy::Consumer;
        b.duration = Duration::from_secs(30);
        b.decay = Duration::from_secs(40);
        b.refresh.active = Duration::from_secs(5);
        b.refresh.queued = Duration::from_secs(9);
        b.properties.insert("k".into(), "second".into());

        let set = PolicySet::from(vec![a, b]);
        let effect = set.effect();
        assert_eq!(effect.resource, "app");
        assert_eq!(effect.strategy, Strategy::Consumer);
        assert_eq!(effect.limit, 3);
        assert_eq!(effect.duration, Duration::from_secs(30));
        assert_eq!(effect.decay, Duration::from_secs(40));
        assert_eq!(effect.refresh.active, Duration::from_secs(5));
        assert_eq!(effect.refresh.queued, Duration::from_secs(7));
        assert_eq!(effect.properties["k"], "second");
    }

    #[test]
    fn empty_set_defaults() {
        let set = PolicySet::new();
        assert_eq!(set.limit(), DEFAULT_LIMIT);
        assert_eq!(set.duration(), DEFAULT_DURATION);
        assert_eq!(set.decay(), Duration::ZERO);
        assert_eq!(set.strategy(), Strategy::Instance);
        assert_eq!(set.resource(), "");
    }

    #[test]
    fn hash_ignores_property_insertion_order() {
        let mut a = app_policy(1);
        a.properties.insert("x".into(), "1".into());
        a.properties.insert("y".into(), "2".into());
        let mut b = app_policy(1);
        b.properties.insert("y".into(), "2".into());
        b.properties.insert("x".into(), "1".into());
        assert_eq!(a.hash(), b.hash());

        b.limit = 2;
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn diff_by_hash() {
        let keep = app_policy(1);
        let old_only = app_policy(2);
        let new_only = app_policy(3);

        let old = PolicySet::from(vec![keep.clone(), old_only.clone()]);
        let new = PolicySet::from(vec![keep, new_only.clone()]);

        let (added, removed) = old.diff(&new);
        assert_eq!(added.as_slice(), &[new_only]);
        assert_eq!(removed.as_slice(), &[old_only]);
    }

    #[test]
    fn display_omits_zero_fields() {
        let p = app_policy(1);
        assert_eq!(
            p.to_string(),
            r#"Resource: "app" Criteria: "program.name ignorecase app.exe" Limit: 1 Duration: 1m0s"#
        );
    }

    #[test]
    fn policy_json_round_trip() {
        let json = r#"{
            "resource": "app",
            "criteria": [{"key": "program.name", "comparison": "regex", "value": "app"}],
            "strategy": "consumer",
            "limit": 2,
            "duration": "5m",
            "decay": "30s",
            "refresh": {"active": "1m"}
        }"#;
        let p: Policy = serde_json::from_str(json).unwrap();
        assert_eq!(p.strategy, Strategy::Consumer);
        assert_eq!(p.duration, Duration::from_secs(300));
        assert_eq!(p.refresh.active, Duration::from_secs(60));

        let encoded = serde_json::to_string(&p).unwrap();
        let back: Policy = serde_json::from_str(&encoded).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn resources_are_distinct() {
        let mut other = app_policy(1);
        other.resource = "other".into();
        let set = PolicySet::from(vec![app_policy(1), other, app_policy(2)]);
        assert_eq!(set.resources(), ["app", "other"]);
    }
}
