//! Endpoint resolvers

use async_trait::async_trait;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::{ResolveError, TokioResolver};
use std::cmp::Reverse;
use tracing::debug;
use warden_http::Endpoint;
use warden_util::DEFAULT_PORT;

use crate::{ClientError, ClientResult, EndpointSet};

/// Service name used to locate brokers
pub const SERVICE_NAME: &str = "resourceful";

/// Produces the candidate endpoints for a client
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self) -> ClientResult<EndpointSet>;
}

/// A fixed list of broker URLs or `host[:port]` addresses
#[derive(Debug, Clone)]
pub struct StaticResolver {
    servers: Vec<String>,
}

impl StaticResolver {
    pub fn new<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self) -> ClientResult<EndpointSet> {
        let endpoints = self
            .servers
            .iter()
            .map(|s| Endpoint::new(s))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(EndpointSet::new(endpoints))
    }
}

/// Resolves host names to broker endpoints through the system resolver
#[derive(Debug, Clone)]
pub struct HostListResolver {
    hosts: Vec<String>,
    port: u16,
}

impl HostListResolver {
    pub fn new(hosts: Vec<String>, port: u16) -> Self {
        Self { hosts, port }
    }

    /// The conventional broker host of a domain, `resourceful.<domain>`
    pub fn for_domain(domain: &str) -> Self {
        let domain = domain.trim_end_matches('.');
        Self::new(vec![format!("{}.{}", SERVICE_NAME, domain)], DEFAULT_PORT)
    }
}

#[async_trait]
impl Resolver for HostListResolver {
    async fn resolve(&self) -> ClientResult<EndpointSet> {
        let mut endpoints = Vec::new();
        let mut last_err = None;

        for host in &self.hosts {
            let host = host.trim_end_matches('.');
            match tokio::net::lookup_host((host, self.port)).await {
                Ok(addrs) => {
                    for addr in addrs {
                        debug!(host, addr = %addr, "Resolved broker address");
                        endpoints.push(Endpoint::new(&addr.to_string())?);
                    }
                }
                Err(e) => last_err = Some(format!("{}: {}", host, e)),
            }
        }

        if endpoints.is_empty() {
            return Err(ClientError::Resolve(
                last_err.unwrap_or_else(|| "unable to detect host domain".to_string()),
            ));
        }
        Ok(EndpointSet::new(endpoints))
    }
}

/// One target of a broker SRV record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvTarget {
    pub priority: u16,
    pub weight: u16,
    pub host: String,
    pub port: u16,
}

/// Order SRV targets by ascending priority, then descending weight
pub fn srv_endpoints(mut targets: Vec<SrvTarget>) -> ClientResult<EndpointSet> {
    targets.sort_by_key(|t| (t.priority, Reverse(t.weight)));
    let endpoints = targets
        .iter()
        .map(|t| Endpoint::new(&format!("{}:{}", t.host, t.port)))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(EndpointSet::new(endpoints))
}

/// Locates brokers through the `_resourceful._tcp.<domain>` SRV record.
/// Without a usable record, `resourceful.<domain>` is tried on the
/// default port.
#[derive(Debug, Clone)]
pub struct SrvResolver {
    domain: String,
    fallback: HostListResolver,
}

impl SrvResolver {
    pub fn for_domain(domain: &str) -> Self {
        let domain = domain.trim_end_matches('.').to_string();
        Self {
            fallback: HostListResolver::for_domain(&domain),
            domain,
        }
    }

    pub fn record_name(&self) -> String {
        format!("_{}._tcp.{}.", SERVICE_NAME, self.domain)
    }

    async fn lookup(&self) -> Result<Vec<SrvTarget>, ResolveError> {
        let resolver = match TokioResolver::builder_tokio() {
            Ok(builder) => builder.build(),
            Err(e) => {
                debug!(error = %e, "Unable to read system resolver configuration");
                TokioResolver::builder_with_config(ResolverConfig::default(), TokioConnectionProvider::default())
                    .build()
            }
        };

        let lookup = resolver.srv_lookup(self.record_name()).await?;
        Ok(lookup
            .iter()
            .map(|srv| SrvTarget {
                priority: srv.priority(),
                weight: srv.weight(),
                host: srv.target().to_utf8().trim_end_matches('.').to_string(),
                port: srv.port(),
            })
            .collect())
    }
}

#[async_trait]
impl Resolver for SrvResolver {
    async fn resolve(&self) -> ClientResult<EndpointSet> {
        let record = self.record_name();
        match self.lookup().await {
            Ok(targets) if !targets.is_empty() => {
                let endpoints = srv_endpoints(targets)?;
                debug!(record = %record, count = endpoints.len(), "Resolved broker SRV record");
                return Ok(endpoints);
            }
            Ok(_) => debug!(record = %record, "Broker SRV record has no targets"),
            Err(e) => debug!(record = %record, error = %e, "Broker SRV lookup failed"),
        }
        self.fallback.resolve().await
    }
}
