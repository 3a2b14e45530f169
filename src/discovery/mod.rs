//! Service-record based endpoint discovery with fixed-interval retries.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use hickory_resolver::{Resolver, TokioResolver};
use tracing::{debug, error};

use crate::export::{MetricsSink, ProcessCounter};

/// One resolved service record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub target: String,
    pub port: u16,
}

/// A concrete probe destination produced by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<SrvRecord> for Endpoint {
    fn from(record: SrvRecord) -> Self {
        Self {
            host: record.target,
            port: record.port,
        }
    }
}

/// Logical service to resolve: `_service._protocol.name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvQuery {
    pub service: String,
    pub protocol: String,
    pub name: String,
}

impl SrvQuery {
    pub fn new(
        service: impl Into<String>,
        protocol: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            protocol: protocol.into(),
            name: name.into(),
        }
    }

    /// The DNS name queried for SRV records.
    pub fn record_name(&self) -> String {
        format!("_{}._{}.{}", self.service, self.protocol, self.name)
    }
}

/// Service-record resolver.
pub trait SrvResolver: Send + Sync {
    /// Resolve `query` into records, in the order the resolver returned them.
    fn lookup_srv(
        &self,
        query: &SrvQuery,
    ) -> impl Future<Output = Result<Vec<SrvRecord>>> + Send;
}

/// SRV resolver backed by the system DNS configuration.
pub struct DnsResolver {
    resolver: TokioResolver,
}

impl DnsResolver {
    /// Build a resolver from `/etc/resolv.conf` (or the platform equivalent).
    pub fn from_system_conf() -> Result<Self> {
        let resolver = Resolver::builder_tokio()
            .context("reading system resolver configuration")?
            .build();

        Ok(Self { resolver })
    }
}

impl SrvResolver for DnsResolver {
    async fn lookup_srv(&self, query: &SrvQuery) -> Result<Vec<SrvRecord>> {
        let name = query.record_name();
        let lookup = self
            .resolver
            .srv_lookup(name.as_str())
            .await
            .with_context(|| format!("looking up SRV records for {name}"))?;

        Ok(lookup
            .iter()
            .map(|srv| SrvRecord {
                target: srv.target().to_utf8(),
                port: srv.port(),
            })
            .collect())
    }
}

/// How many consecutive lookup failures to tolerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxRetries {
    Unlimited,
    Limited(u64),
}

impl MaxRetries {
    /// Map the configured value: `-1` is unlimited, anything else non-negative
    /// is a bound.
    pub fn from_config(value: i64) -> Result<Self> {
        match value {
            -1 => Ok(Self::Unlimited),
            n if n >= 0 => Ok(Self::Limited(n as u64)),
            n => bail!("max_retries must be -1 or non-negative, got {n}"),
        }
    }

    fn exhausted(self, failures: u64) -> bool {
        match self {
            Self::Unlimited => false,
            Self::Limited(max) => failures > max,
        }
    }
}

/// Retry behavior for discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_retries: MaxRetries,
}

/// Terminal discovery failure.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("SRV discovery for {record} timed out after {retries} retries: {last_error}")]
    RetriesExhausted {
        record: String,
        retries: u64,
        last_error: String,
    },
}

/// Resolves a logical service into endpoints, retrying failed lookups.
pub struct EndpointDiscovery<R> {
    resolver: R,
    query: SrvQuery,
    policy: RetryPolicy,
    sink: Arc<dyn MetricsSink>,
}

impl<R: SrvResolver> EndpointDiscovery<R> {
    pub fn new(
        resolver: R,
        query: SrvQuery,
        policy: RetryPolicy,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            resolver,
            query,
            policy,
            sink,
        }
    }

    pub fn query(&self) -> &SrvQuery {
        &self.query
    }

    /// Resolve until a lookup succeeds or the retry budget runs out.
    ///
    /// A successful lookup is returned as-is, even when it holds no records.
    pub async fn discover(&self) -> Result<Vec<Endpoint>, DiscoveryError> {
        let mut failures: u64 = 0;

        loop {
            let err = match self.resolver.lookup_srv(&self.query).await {
                Ok(records) => {
                    let endpoints: Vec<Endpoint> =
                        records.into_iter().map(Endpoint::from).collect();
                    debug!(
                        count = endpoints.len(),
                        endpoints = ?endpoints.iter().map(ToString::to_string).collect::<Vec<_>>(),
                        "discovered endpoints",
                    );
                    return Ok(endpoints);
                }
                Err(e) => e,
            };

            failures += 1;
            self.sink.increment(ProcessCounter::FailedDiscoveries);
            debug!(failures, "failed SRV discovery attempts");

            if self.policy.max_retries.exhausted(failures) {
                return Err(DiscoveryError::RetriesExhausted {
                    record: self.query.record_name(),
                    retries: failures - 1,
                    last_error: format!("{err:#}"),
                });
            }

            error!(
                error = %format!("{err:#}"),
                attempt = failures,
                retry_in = ?self.policy.interval,
                "cannot find SRV record, retrying",
            );
            tokio::time::sleep(self.policy.interval).await;
        }
    }
}
