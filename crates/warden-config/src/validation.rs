//! Policy and configuration validation

use thiserror::Error;
use warden_api::MINIMUM_REFRESH;
use warden_util::{format_duration, parse_duration};

use crate::policy::{Comparison, Policy, PolicySet, compile_pattern};
use crate::schema::RawDaemonConfig;
use crate::StoreKind;

/// Validation error
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Policy {index} ({resource:?}): {message}")]
    PolicyError {
        index: usize,
        resource: String,
        message: String,
    },

    #[error("Invalid duration for {field} '{value}': {message}")]
    InvalidDuration {
        field: &'static str,
        value: String,
        message: String,
    },

    #[error("Invalid lease store: {0}")]
    InvalidStore(String),

    #[error("Global config error: {0}")]
    GlobalError(String),
}

/// Validate every policy in a set
pub fn validate_policies(set: &PolicySet) -> Vec<ValidationError> {
    set.iter()
        .enumerate()
        .flat_map(|(index, policy)| validate_policy(index, policy))
        .collect()
}

/// Validate a single policy
pub fn validate_policy(index: usize, policy: &Policy) -> Vec<ValidationError> {
    let mut messages = Vec::new();

    if policy.criteria.is_empty() {
        messages.push("policy has no criteria and will never match".to_string());
    }

    for criterion in &policy.criteria {
        if criterion.key.is_empty() {
            messages.push("criterion has an empty key".to_string());
        }
        if criterion.comparison == Comparison::Regex {
            if let Err(e) = compile_pattern(&criterion.value) {
                messages.push(format!("invalid pattern {:?}: {}", criterion.value, e));
            }
        }
    }

    if policy.duration < MINIMUM_REFRESH {
        messages.push(format!(
            "duration {} is shorter than the minimum of {}",
            format_duration(policy.duration),
            format_duration(MINIMUM_REFRESH)
        ));
    }

    for (name, value) in [
        ("active refresh", policy.refresh.active),
        ("queued refresh", policy.refresh.queued),
    ] {
        if !value.is_zero() && value >= policy.duration {
            messages.push(format!(
                "{} {} is not shorter than the duration {} and will be ignored",
                name,
                format_duration(value),
                format_duration(policy.duration)
            ));
        }
    }

    messages
        .into_iter()
        .map(|message| ValidationError::PolicyError {
            index,
            resource: policy.resource.clone(),
            message,
        })
        .collect()
}

/// Validate a raw daemon configuration
pub fn validate_daemon_config(config: &RawDaemonConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    let durations = [
        ("broker.purge_interval", &config.broker.purge_interval),
        ("broker.shutdown_timeout", &config.broker.shutdown_timeout),
        ("enforcer.policy_interval", &config.enforcer.policy_interval),
        ("enforcer.enforce_interval", &config.enforcer.enforce_interval),
    ];
    for (field, value) in durations {
        if let Some(value) = value {
            if let Err(e) = parse_duration(value) {
                errors.push(ValidationError::InvalidDuration {
                    field,
                    value: value.clone(),
                    message: e.to_string(),
                });
            }
        }
    }

    if let Some(store) = &config.broker.store {
        if let Err(e) = store.parse::<StoreKind>() {
            errors.push(ValidationError::InvalidStore(e));
        }
    }

    if config.enforcer.servers.iter().any(|s| s.trim().is_empty()) {
        errors.push(ValidationError::GlobalError(
            "enforcer.servers contains an empty address".into(),
        ));
    }

    errors
}
