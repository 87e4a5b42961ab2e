//! Broker client with endpoint caching

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use warden_api::{AcquireResponse, LeaseRequest, LeasesResponse, ReleaseResponse};
use warden_config::PolicySet;
use warden_http::{Endpoint, HttpResult};

use crate::{ClientResult, LeaseService, Resolver, StaticResolver};

/// A client for whichever broker its resolver finds healthy
///
/// The selected endpoint is reused until a request to it fails to reach
/// the broker.
pub struct Client {
    resolver: Arc<dyn Resolver>,
    endpoint: Mutex<Option<Endpoint>>,
}

impl Client {
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        Self {
            resolver,
            endpoint: Mutex::new(None),
        }
    }

    /// A client for a fixed list of servers
    pub fn with_servers<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Arc::new(StaticResolver::new(servers)))
    }

    /// The cached endpoint, or a freshly selected one
    pub async fn endpoint(&self) -> ClientResult<Endpoint> {
        let mut cached = self.endpoint.lock().await;
        if let Some(endpoint) = cached.as_ref() {
            return Ok(endpoint.clone());
        }

        let endpoint = self.resolver.resolve().await?.select().await?;
        info!(endpoint = %endpoint, "Selected broker endpoint");
        *cached = Some(endpoint.clone());
        Ok(endpoint)
    }

    async fn call<T, F, Fut>(&self, f: F) -> ClientResult<T>
    where
        F: FnOnce(Endpoint) -> Fut,
        Fut: std::future::Future<Output = HttpResult<T>>,
    {
        let endpoint = self.endpoint().await?;
        let url = endpoint.url().to_string();
        match f(endpoint).await {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_transport() {
                    warn!(endpoint = %url, error = %e, "Broker unreachable; dropping endpoint");
                    let mut cached = self.endpoint.lock().await;
                    if cached.as_ref().is_some_and(|c| c.url() == url) {
                        *cached = None;
                    }
                }
                Err(e.into())
            }
        }
    }

    pub async fn policies(&self) -> ClientResult<PolicySet> {
        self.call(|e| async move { e.policies().await }).await
    }

    pub async fn leases(&self, request: &LeaseRequest) -> ClientResult<LeasesResponse> {
        self.call(|e| async move { e.leases(request).await }).await
    }
}

#[async_trait]
impl LeaseService for Client {
    async fn acquire(&self, request: &LeaseRequest) -> ClientResult<Option<AcquireResponse>> {
        self.call(|e| async move { e.acquire(request).await }).await
    }

    async fn release(&self, request: &LeaseRequest) -> ClientResult<ReleaseResponse> {
        self.call(|e| async move { e.release(request).await }).await
    }
}
