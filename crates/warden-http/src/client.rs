//! HTTP client for one broker endpoint

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::fmt;
use std::time::Duration;
use tracing::debug;
use warden_api::{AcquireResponse, HealthResponse, LeaseRequest, LeasesResponse, ReleaseResponse};
use warden_config::PolicySet;
use warden_util::DEFAULT_PORT;

use crate::{HttpError, HttpResult, PoliciesResponse};

/// Default timeout for broker requests
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A broker reachable at a base URL
#[derive(Clone)]
pub struct Endpoint {
    base: String,
    http: reqwest::Client,
}

impl Endpoint {
    /// Create an endpoint for a URL or a bare `host[:port]`
    pub fn new(addr: &str) -> HttpResult<Self> {
        Self::with_timeout(addr, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(addr: &str, timeout: Duration) -> HttpResult<Self> {
        let base = normalize_url(addr)?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { base, http })
    }

    /// Base URL without a trailing slash
    pub fn url(&self) -> &str {
        &self.base
    }

    fn path(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Probe `/health` with a per-request timeout
    pub async fn health(&self, timeout: Duration) -> HttpResult<HealthResponse> {
        let response = self.http.get(self.path("/health")).timeout(timeout).send().await?;
        decode(response).await
    }

    pub async fn policies(&self) -> HttpResult<PolicySet> {
        let response = self.http.get(self.path("/policies")).send().await?;
        let body: PoliciesResponse = decode(response).await?;
        Ok(body.policies)
    }

    /// Acquire or renew a lease. Returns `None` when no policy applies.
    pub async fn acquire(&self, request: &LeaseRequest) -> HttpResult<Option<AcquireResponse>> {
        let response = self
            .http
            .post(self.path("/acquire"))
            .form(&request.to_form())
            .send()
            .await?;

        if response.status() == StatusCode::NO_CONTENT {
            debug!(endpoint = %self.base, "Lease not required");
            return Ok(None);
        }
        decode(response).await.map(Some)
    }

    pub async fn release(&self, request: &LeaseRequest) -> HttpResult<ReleaseResponse> {
        let response = self
            .http
            .post(self.path("/release"))
            .form(&request.to_form())
            .send()
            .await?;
        decode(response).await
    }

    pub async fn leases(&self, request: &LeaseRequest) -> HttpResult<LeasesResponse> {
        let response = self
            .http
            .get(self.path("/leases"))
            .query(&request.to_form())
            .send()
            .await?;
        decode(response).await
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint").field("url", &self.base).finish()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base)
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> HttpResult<T> {
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(HttpError::Status {
            status: status.as_u16(),
            message: message.trim().to_string(),
        });
    }
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Turn a URL or `host[:port]` into a base URL. Bare hosts get `http://`
/// and the default port.
pub fn normalize_url(addr: &str) -> HttpResult<String> {
    let addr = addr.trim().trim_end_matches('/');
    if addr.is_empty() {
        return Err(HttpError::InvalidUrl(addr.to_string()));
    }
    if addr.contains("://") {
        return Ok(addr.to_string());
    }
    if has_port(addr) {
        Ok(format!("http://{}", addr))
    } else {
        Ok(format!("http://{}:{}", addr, DEFAULT_PORT))
    }
}

fn has_port(addr: &str) -> bool {
    match addr.rsplit_once(':') {
        // Bracketed IPv6 literal with or without a port
        Some((host, port)) if addr.starts_with('[') => host.ends_with(']') && port.parse::<u16>().is_ok(),
        Some((host, port)) => !host.contains(':') && port.parse::<u16>().is_ok(),
        None => false,
    }
}
