//! Request errors

use thiserror::Error;

/// Errors raised while interpreting a lease request
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("consumer not specified or determinable")]
    MissingConsumer,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
