//! Endpoint selection

use std::time::Duration;
use tracing::debug;
use warden_http::Endpoint;

use crate::{ClientError, ClientResult};

/// How long a health probe waits for an answer in the first round
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_millis(200);

const SELECTION_ROUNDS: u32 = 2;

/// An ordered set of candidate endpoints
#[derive(Debug, Clone, Default)]
pub struct EndpointSet(Vec<Endpoint>);

impl EndpointSet {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self(endpoints)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Endpoint> {
        self.0.iter()
    }

    /// Return the first endpoint that reports itself healthy.
    ///
    /// Endpoints are probed in order for two rounds. The probe timeout
    /// doubles in the second round.
    pub async fn select(&self) -> ClientResult<Endpoint> {
        self.select_with_timeout(DEFAULT_HEALTH_TIMEOUT).await
    }

    pub async fn select_with_timeout(&self, timeout: Duration) -> ClientResult<Endpoint> {
        if self.0.is_empty() {
            return Err(ClientError::NoEndpoints);
        }

        let mut failed = Vec::new();
        let mut timeout = timeout;
        for round in 0..SELECTION_ROUNDS {
            for endpoint in &self.0 {
                match endpoint.health(timeout).await {
                    Ok(health) if health.ok => return Ok(endpoint.clone()),
                    Ok(_) => debug!(endpoint = %endpoint, round, "Endpoint reports unhealthy"),
                    Err(e) => {
                        debug!(endpoint = %endpoint, round, error = %e, "Health probe failed");
                        failed.push(e);
                    }
                }
            }
            timeout *= 2;
        }

        match failed.first() {
            Some(first) => Err(ClientError::SelectionFailed {
                failures: failed.len(),
                endpoints: self.0.len(),
                first: first.to_string(),
            }),
            None => Err(ClientError::NoEndpoints),
        }
    }
}

impl From<Vec<Endpoint>> for EndpointSet {
    fn from(endpoints: Vec<Endpoint>) -> Self {
        Self(endpoints)
    }
}

impl FromIterator<Endpoint> for EndpointSet {
    fn from_iter<I: IntoIterator<Item = Endpoint>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn empty_set_has_no_endpoints() {
        let err = EndpointSet::default().select().await.unwrap_err();
        assert!(matches!(err, ClientError::NoEndpoints));
    }

    #[tokio::test]
    async fn selects_first_healthy_endpoint() {
        let dead = dead_endpoint().await;
        let sick = health_server(false).await;
        let healthy = health_server(true).await;

        let set = EndpointSet::new(vec![dead, sick, healthy.clone()]);
        let selected = set.select().await.unwrap();
        assert_eq!(selected.url(), healthy.url());
    }

    #[tokio::test]
    async fn all_failures_are_aggregated() {
        let set = EndpointSet::new(vec![dead_endpoint().await, dead_endpoint().await]);

        match set.select().await.unwrap_err() {
            ClientError::SelectionFailed { failures, endpoints, .. } => {
                assert_eq!(failures, 4);
                assert_eq!(endpoints, 2);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
