//! Endpoint resolution for outbound delivery.
//!
//! Maps a recipient domain to its delivery endpoints (MX hosts), sorted by
//! preference. Lookups go through the [`Resolve`] trait so the DNS backend
//! can be swapped out; [`DnsResolver`] is the hickory-backed implementation
//! and caches positive MX answers for their TTL.
//!
//! # Caching Strategy
//!
//! - **DNS TTL by default**: Uses the TTL from the MX answer
//! - **Bounded TTLs**: Clamped to `[min_cache_ttl_secs, max_cache_ttl_secs]`
//! - **Optional override**: `cache_ttl_secs` replaces the DNS TTL for all entries
//! - **Lock-free**: `DashMap` provides concurrent access without mutex contention

use std::{
    fmt::{self, Display},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use hickory_resolver::{
    TokioResolver,
    config::{ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use volley_common::{Domain, tracing};

use crate::types::RoutingConfig;

/// Errors that can occur while resolving a domain's endpoints.
///
/// All of them are terminal for the affected domain within one run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// The domain does not exist (NXDOMAIN).
    #[error("Domain does not exist: {0}")]
    DomainNotFound(String),

    /// The domain exists but advertises no MX records.
    #[error("No MX records found for domain: {0}")]
    NoEndpointRecords(String),

    /// The lookup did not finish within the configured wait.
    #[error("DNS query timed out for domain: {0}")]
    ResolutionTimeout(String),

    /// Any other resolver failure (SERVFAIL, network, bad configuration).
    #[error("DNS lookup failed for {domain}: {reason}")]
    LookupFailed { domain: String, reason: String },
}

/// Configuration for the DNS resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Upper bound on a single lookup, in seconds (default: 10)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// SMTP port used for endpoints learned from DNS (default: 25)
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,

    /// Cache TTL override in seconds
    ///
    /// If set, replaces the DNS record TTL for all cached entries.
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,

    /// Minimum cache TTL in seconds (default: 60)
    #[serde(default = "default_min_cache_ttl_secs")]
    pub min_cache_ttl_secs: u64,

    /// Maximum cache TTL in seconds (default: 3600)
    #[serde(default = "default_max_cache_ttl_secs")]
    pub max_cache_ttl_secs: u64,
}

const fn default_timeout_secs() -> u64 {
    10
}

const fn default_smtp_port() -> u16 {
    25
}

const fn default_min_cache_ttl_secs() -> u64 {
    60
}

const fn default_max_cache_ttl_secs() -> u64 {
    3600
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            smtp_port: default_smtp_port(),
            cache_ttl_secs: None,
            min_cache_ttl_secs: default_min_cache_ttl_secs(),
            max_cache_ttl_secs: default_max_cache_ttl_secs(),
        }
    }
}

impl DnsConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// A host able to accept SMTP delivery for a domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryEndpoint {
    /// Hostname (or IP literal), without the trailing root dot
    pub hostname: String,
    /// MX preference, lower is tried first. 0 for overrides and implicit MX.
    pub priority: u16,
    pub port: u16,
}

impl DeliveryEndpoint {
    #[must_use]
    pub fn new(hostname: impl AsRef<str>, priority: u16, port: u16) -> Self {
        Self {
            hostname: hostname.as_ref().trim_end_matches('.').to_ascii_lowercase(),
            priority,
            port,
        }
    }

    /// Parse a `host`, `host:port` or `[v6]:port` route override.
    #[must_use]
    pub fn from_route(route: &str, default_port: u16) -> Self {
        let route = route.trim();

        if let Some(rest) = route.strip_prefix('[')
            && let Some((host, tail)) = rest.split_once(']')
        {
            let port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return Self::new(host, 0, port);
        }

        match route.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                port.parse()
                    .map_or_else(|_| Self::new(route, 0, default_port), |port| {
                        Self::new(host, 0, port)
                    })
            }
            _ => Self::new(route, 0, default_port),
        }
    }
}

impl Display for DeliveryEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hostname.contains(':') {
            write!(f, "[{}]:{}", self.hostname, self.port)
        } else {
            write!(f, "{}:{}", self.hostname, self.port)
        }
    }
}

/// The DNS questions the dispatcher and validator need answered.
#[async_trait]
pub trait Resolve: Send + Sync {
    /// MX hosts for `domain`, in answer order (not yet sorted).
    ///
    /// # Errors
    ///
    /// `DomainNotFound` for NXDOMAIN, `NoEndpointRecords` when no MX exists,
    /// `ResolutionTimeout` or `LookupFailed` otherwise.
    async fn mail_exchangers(&self, domain: &Domain) -> Result<Vec<DeliveryEndpoint>, ResolveError>;

    /// Whether `domain` has any A/AAAA records.
    ///
    /// # Errors
    ///
    /// `DomainNotFound` for NXDOMAIN, `ResolutionTimeout` or `LookupFailed`
    /// when the question could not be answered.
    async fn has_address_records(&self, domain: &Domain) -> Result<bool, ResolveError>;
}

/// Cached MX answer with expiration time.
#[derive(Debug, Clone)]
struct CachedResult {
    endpoints: Arc<Vec<DeliveryEndpoint>>,
    expires_at: Instant,
}

/// hickory-backed [`Resolve`] implementation with a concurrent MX cache.
#[derive(Debug)]
pub struct DnsResolver {
    resolver: TokioResolver,
    cache: DashMap<Domain, CachedResult>,
    config: DnsConfig,
}

impl DnsResolver {
    /// Creates a resolver from the system DNS configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the system DNS configuration cannot be loaded.
    pub fn with_dns_config(dns_config: DnsConfig) -> Result<Self, ResolveError> {
        let resolver = TokioResolver::builder(TokioConnectionProvider::default())
            .map_err(|e| ResolveError::LookupFailed {
                domain: String::new(),
                reason: format!("unable to load system resolver configuration: {e}"),
            })?
            .with_options(Self::options(&dns_config))
            .build();

        Ok(Self {
            resolver,
            cache: DashMap::new(),
            config: dns_config,
        })
    }

    /// Creates a resolver that queries the given name servers.
    #[must_use]
    pub fn with_resolver_config(resolver_config: ResolverConfig, dns_config: DnsConfig) -> Self {
        let resolver =
            TokioResolver::builder_with_config(resolver_config, TokioConnectionProvider::default())
                .with_options(Self::options(&dns_config))
                .build();

        Self {
            resolver,
            cache: DashMap::new(),
            config: dns_config,
        }
    }

    fn options(dns_config: &DnsConfig) -> ResolverOpts {
        let mut opts = ResolverOpts::default();
        opts.timeout = dns_config.timeout();
        opts.attempts = 1;
        opts
    }

    fn lookup_failed(domain: &Domain, err: &hickory_resolver::ResolveError) -> ResolveError {
        if err.is_nx_domain() {
            ResolveError::DomainNotFound(domain.to_string())
        } else {
            ResolveError::LookupFailed {
                domain: domain.to_string(),
                reason: err.to_string(),
            }
        }
    }

    async fn mail_exchangers_uncached(
        &self,
        domain: &Domain,
    ) -> Result<(Vec<DeliveryEndpoint>, u32), ResolveError> {
        let lookup = tokio::time::timeout(
            self.config.timeout(),
            self.resolver.mx_lookup(domain.as_str()),
        )
        .await
        .map_err(|_| ResolveError::ResolutionTimeout(domain.to_string()))?;

        match lookup {
            Ok(mx_lookup) => {
                let min_ttl = mx_lookup
                    .as_lookup()
                    .records()
                    .iter()
                    .map(hickory_resolver::proto::rr::Record::ttl)
                    .min()
                    .unwrap_or(300);

                let endpoints: Vec<DeliveryEndpoint> = mx_lookup
                    .iter()
                    .map(|mx| {
                        let host = mx.exchange().to_utf8();
                        tracing::debug!("Found MX record: {host} (priority: {})", mx.preference());
                        DeliveryEndpoint::new(host, mx.preference(), self.config.smtp_port)
                    })
                    .collect();

                if endpoints.is_empty() {
                    return Err(ResolveError::NoEndpointRecords(domain.to_string()));
                }

                Ok((endpoints, min_ttl))
            }
            Err(err) if err.is_nx_domain() => {
                Err(ResolveError::DomainNotFound(domain.to_string()))
            }
            Err(err) if err.is_no_records_found() => {
                Err(ResolveError::NoEndpointRecords(domain.to_string()))
            }
            Err(err) => {
                tracing::warn!("MX lookup failed for {domain}: {err}");
                Err(Self::lookup_failed(domain, &err))
            }
        }
    }
}

#[async_trait]
impl Resolve for DnsResolver {
    async fn mail_exchangers(&self, domain: &Domain) -> Result<Vec<DeliveryEndpoint>, ResolveError> {
        if let Some(cached) = self.cache.get(domain)
            && cached.expires_at > Instant::now()
        {
            tracing::debug!("Cache hit for {domain}, {} MX(s)", cached.endpoints.len());
            return Ok(cached.endpoints.as_ref().clone());
        }

        let (endpoints, dns_ttl) = self.mail_exchangers_uncached(domain).await?;

        let cache_ttl = self.config.cache_ttl_secs.unwrap_or_else(|| {
            u64::from(dns_ttl).clamp(
                self.config.min_cache_ttl_secs,
                self.config.max_cache_ttl_secs,
            )
        });

        self.cache.insert(
            domain.clone(),
            CachedResult {
                endpoints: Arc::new(endpoints.clone()),
                expires_at: Instant::now() + Duration::from_secs(cache_ttl),
            },
        );

        tracing::debug!(
            "Cached MX answer for {domain}, DNS TTL: {dns_ttl}s, cache TTL: {cache_ttl}s, {} MX(s)",
            endpoints.len()
        );
        Ok(endpoints)
    }

    async fn has_address_records(&self, domain: &Domain) -> Result<bool, ResolveError> {
        let lookup = tokio::time::timeout(
            self.config.timeout(),
            self.resolver.lookup_ip(domain.as_str()),
        )
        .await
        .map_err(|_| ResolveError::ResolutionTimeout(domain.to_string()))?;

        match lookup {
            Ok(ips) => Ok(ips.iter().next().is_some()),
            Err(err) if err.is_nx_domain() => {
                Err(ResolveError::DomainNotFound(domain.to_string()))
            }
            Err(err) if err.is_no_records_found() => Ok(false),
            Err(err) => Err(Self::lookup_failed(domain, &err)),
        }
    }
}

/// Turns a domain into an ordered, non-empty list of endpoints.
///
/// Route overrides win over DNS; DNS answers are sorted by ascending
/// priority with ties kept in answer order.
#[derive(Clone)]
pub struct EndpointResolver {
    lookup: Arc<dyn Resolve>,
    routing: Arc<RoutingConfig>,
    port: u16,
}

impl fmt::Debug for EndpointResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointResolver")
            .field("routing", &self.routing)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl EndpointResolver {
    #[must_use]
    pub fn new(lookup: Arc<dyn Resolve>, routing: RoutingConfig, port: u16) -> Self {
        Self {
            lookup,
            routing: Arc::new(routing),
            port,
        }
    }

    /// The raw lookup backend, for callers with stricter policies than routing.
    #[must_use]
    pub fn lookup(&self) -> &Arc<dyn Resolve> {
        &self.lookup
    }

    /// Resolve the delivery endpoints for `domain`.
    ///
    /// # Errors
    ///
    /// Returns the [`ResolveError`] that ended the lookup.
    pub async fn resolve(&self, domain: &Domain) -> Result<Vec<DeliveryEndpoint>, ResolveError> {
        if let Some(route) = self.routing.route_for(domain.as_str()) {
            let endpoint = DeliveryEndpoint::from_route(route, self.port);
            tracing::debug!("Using route override {endpoint} for {domain}");
            return Ok(vec![endpoint]);
        }

        let mut endpoints = match self.lookup.mail_exchangers(domain).await {
            Ok(endpoints) if !endpoints.is_empty() => endpoints,
            Ok(_) | Err(ResolveError::NoEndpointRecords(_)) if self.routing.implicit_mx => {
                if self.lookup.has_address_records(domain).await? {
                    tracing::debug!("No MX for {domain}, using implicit MX");
                    return Ok(vec![DeliveryEndpoint::new(domain.as_str(), 0, self.port)]);
                }
                return Err(ResolveError::NoEndpointRecords(domain.to_string()));
            }
            Ok(_) => return Err(ResolveError::NoEndpointRecords(domain.to_string())),
            Err(err) => return Err(err),
        };

        // Stable, so equal preferences keep their answer order.
        endpoints.sort_by_key(|e| e.priority);
        Ok(endpoints)
    }
}
