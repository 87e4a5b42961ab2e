//! Process filtering from policy criteria

use regex::Regex;
use tracing::debug;
use warden_config::{Comparison, Criterion, PolicySet, compile_pattern};
use warden_host_api::{HostResult, PROP_PROGRAM_NAME, ProcessHost, ProcessInfo};

enum Matcher {
    Exact(String),
    IgnoreCase(String),
    Regex(Regex),
}

impl Matcher {
    fn new(criterion: &Criterion) -> Result<Self, String> {
        match criterion.comparison {
            Comparison::Exact => Ok(Matcher::Exact(criterion.value.clone())),
            Comparison::IgnoreCase => Ok(Matcher::IgnoreCase(criterion.value.to_lowercase())),
            Comparison::Regex if criterion.value.is_empty() => Err("empty regular expression".into()),
            Comparison::Regex => compile_pattern(&criterion.value)
                .map(Matcher::Regex)
                .map_err(|e| e.to_string()),
        }
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            Matcher::Exact(value) => name == value,
            Matcher::IgnoreCase(value) => name.to_lowercase() == *value,
            Matcher::Regex(re) => re.is_match(name),
        }
    }
}

/// Matches program names against the `program.name` criteria of a policy
/// set.
///
/// A name passes if it satisfies every `program.name` criterion of at least
/// one policy. Policies without such criteria, or with criteria that cannot
/// be compiled, contribute nothing.
pub struct ProcessFilter {
    policies: Vec<Vec<Matcher>>,
}

impl ProcessFilter {
    pub fn new(policies: &PolicySet) -> Self {
        let mut filters = Vec::new();
        'policies: for policy in policies {
            let mut matchers = Vec::new();
            for criterion in policy.criteria.iter().filter(|c| c.key == PROP_PROGRAM_NAME) {
                match Matcher::new(criterion) {
                    Ok(m) => matchers.push(m),
                    Err(e) => {
                        debug!(resource = %policy.resource, error = %e, "Skipping policy with unusable criteria");
                        continue 'policies;
                    }
                }
            }
            if !matchers.is_empty() {
                filters.push(matchers);
            }
        }
        Self { policies: filters }
    }

    /// Returns true if no policy constrains program names
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn matches(&self, name: &str) -> bool {
        self.policies.iter().any(|m| m.iter().all(|m| m.matches(name)))
    }
}

/// List the local processes that one or more policies might apply to
pub async fn scan(host: &dyn ProcessHost, policies: &PolicySet) -> HostResult<Vec<ProcessInfo>> {
    let filter = ProcessFilter::new(policies);
    if filter.is_empty() {
        return Ok(Vec::new());
    }
    host.scan(&|name: &str| filter.matches(name)).await
}
