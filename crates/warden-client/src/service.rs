//! The lease service capability

use async_trait::async_trait;
use std::sync::Arc;
use warden_api::{AcquireResponse, LeaseRequest, ReleaseResponse};
use warden_http::Endpoint;

use crate::ClientResult;

/// Acquire and release leases from a broker
#[async_trait]
pub trait LeaseService: Send + Sync {
    /// Acquire or renew a lease. `None` means no lease is required.
    async fn acquire(&self, request: &LeaseRequest) -> ClientResult<Option<AcquireResponse>>;

    async fn release(&self, request: &LeaseRequest) -> ClientResult<ReleaseResponse>;
}

#[async_trait]
impl LeaseService for Endpoint {
    async fn acquire(&self, request: &LeaseRequest) -> ClientResult<Option<AcquireResponse>> {
        Ok(Endpoint::acquire(self, request).await?)
    }

    async fn release(&self, request: &LeaseRequest) -> ClientResult<ReleaseResponse> {
        Ok(Endpoint::release(self, request).await?)
    }
}

#[async_trait]
impl<S: LeaseService + ?Sized> LeaseService for Arc<S> {
    async fn acquire(&self, request: &LeaseRequest) -> ClientResult<Option<AcquireResponse>> {
        (**self).acquire(request).await
    }

    async fn release(&self, request: &LeaseRequest) -> ClientResult<ReleaseResponse> {
        (**self).release(request).await
    }
}
