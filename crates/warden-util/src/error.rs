//! Error types for warden

use thiserror::Error;

/// Core error type shared by warden components
#[derive(Debug, Error)]
pub enum WardenError {
    #[error("Invalid duration \"{input}\": {reason}")]
    InvalidDuration { input: String, reason: String },
}

impl WardenError {
    pub fn duration(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDuration {
            input: input.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, WardenError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_duration;

    #[test]
    fn duration_errors_name_the_input() {
        let err = parse_duration("5 parsecs").unwrap_err();
        assert!(matches!(err, WardenError::InvalidDuration { ref input, .. } if input == "5 parsecs"));
        assert!(err.to_string().starts_with("Invalid duration \"5 parsecs\": "));
    }
}
