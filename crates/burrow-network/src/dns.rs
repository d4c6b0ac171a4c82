//! Endpoint DNS resolution
//!
//! Resolves the tunnel peer's hostname on the host network. Every call
//! performs a fresh lookup: the peer may move between reconnect attempts,
//! so nothing is cached.

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use rand::seq::SliceRandom;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// DNS resolution errors
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("resolution of {0:?} failed: {1}")]
    ResolutionFailed(String, String),

    #[error("no IPv4 addresses returned for {0:?}")]
    NoAddresses(String),

    #[error("lookup of {0:?} timed out")]
    Timeout(String),

    #[error("resolver error: {0}")]
    ResolverError(String),
}

/// Something that can turn a hostname into IPv4 addresses.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn lookup_ipv4(&self, host: &str) -> Result<Vec<Ipv4Addr>, DnsError>;
}

/// DNS resolver configuration
#[derive(Debug, Clone)]
pub struct DnsConfig {
    /// Whether to use the host's resolv.conf or a public resolver
    pub use_system_dns: bool,
    /// Timeout for a single lookup
    pub timeout: Duration,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            use_system_dns: true,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Host-network resolver backed by hickory.
pub struct DnsResolver {
    resolver: TokioAsyncResolver,
    config: DnsConfig,
}

impl DnsResolver {
    /// Create a new DNS resolver
    pub fn new(config: DnsConfig) -> Result<Self, DnsError> {
        let resolver = if config.use_system_dns {
            TokioAsyncResolver::tokio_from_system_conf()
                .map_err(|e| DnsError::ResolverError(e.to_string()))?
        } else {
            TokioAsyncResolver::tokio(ResolverConfig::cloudflare(), ResolverOpts::default())
        };

        info!(
            "DNS resolver initialized (system: {}, timeout: {:?})",
            config.use_system_dns, config.timeout
        );

        Ok(Self { resolver, config })
    }

    /// Create with default configuration
    pub fn with_defaults() -> Result<Self, DnsError> {
        Self::new(DnsConfig::default())
    }
}

#[async_trait]
impl HostResolver for DnsResolver {
    async fn lookup_ipv4(&self, host: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return match ip {
                IpAddr::V4(v4) => Ok(vec![v4]),
                IpAddr::V6(_) => Err(DnsError::NoAddresses(host.to_string())),
            };
        }

        debug!("DNS lookup for: {}", host);
        let lookup = tokio::time::timeout(self.config.timeout, self.resolver.lookup_ip(host))
            .await
            .map_err(|_| DnsError::Timeout(host.to_string()))?
            .map_err(|e| DnsError::ResolutionFailed(host.to_string(), e.to_string()))?;

        let addresses: Vec<Ipv4Addr> = lookup
            .iter()
            .filter_map(|ip| match ip {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .collect();

        if addresses.is_empty() {
            return Err(DnsError::NoAddresses(host.to_string()));
        }
        Ok(addresses)
    }
}

/// Pick one address uniformly at random.
///
/// Spreads reconnects across multiple A records.
pub fn pick_address(addresses: &[Ipv4Addr]) -> Option<Ipv4Addr> {
    addresses.choose(&mut rand::thread_rng()).copied()
}
