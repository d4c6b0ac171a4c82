//! Peer Configuration
//!
//! User supplied settings for the single WireGuard peer and the local
//! proxy listener. Values are kept as the user wrote them; the accessors
//! below parse and default them on demand so `init()` can fail with the
//! offending value.

use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Deserializer};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Interface MTU when none is configured
pub const DEFAULT_MTU: u16 = 1500;

/// Resolver used inside the tunnel when none is configured
pub const DEFAULT_DNS: IpAddr = IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1));

/// Default HTTP proxy listen address
pub const DEFAULT_PROXY_ADDRESS: &str = "127.0.0.1:8080";

/// Bound on resolving the peer endpoint hostname
pub const HOST_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// WireGuard peer configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PeerConfig {
    /// `host:port` of the remote peer
    pub endpoint: String,
    /// Addresses of the local tunnel interface
    pub local_addresses: Vec<String>,
    /// Resolvers reachable inside the tunnel
    pub dns_addresses: Vec<String>,
    /// Peer public key (base64)
    pub public_key: String,
    /// Local private key (base64)
    pub private_key: String,
    /// CIDRs routed through the peer
    pub allowed_ips: Vec<String>,
    /// URL fetched through the tunnel after bring-up
    pub check_url: Option<String>,
    #[serde(deserialize_with = "deserialize_duration")]
    pub check_timeout: Duration,
    /// Zero exits on the first failure
    #[serde(deserialize_with = "deserialize_duration")]
    pub retry_delay: Duration,
    pub mtu: Option<u16>,
    /// HTTP proxy listen address (`ip:port`)
    pub proxy_address: String,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            local_addresses: Vec::new(),
            dns_addresses: Vec::new(),
            public_key: String::new(),
            private_key: String::new(),
            allowed_ips: Vec::new(),
            check_url: None,
            check_timeout: Duration::from_secs(30),
            retry_delay: Duration::ZERO,
            mtu: None,
            proxy_address: DEFAULT_PROXY_ADDRESS.to_string(),
        }
    }
}

impl PeerConfig {
    /// Parse a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.display().to_string(), e))?;
        Self::from_toml_str(&text)
    }

    /// Run every synchronous check `init()` would run, without touching
    /// the network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.check_keys()?;
        self.endpoint_parts()?;
        self.local_ips()?;
        self.dns_ips()?;
        self.allowed_ip_list()?;
        self.proxy_listen_addr()?;
        if let Some(url) = self.check_url.as_deref().filter(|u| !u.is_empty()) {
            let parsed = url::Url::parse(url).map_err(|_| ConfigError::BadCheckUrl(url.to_string()))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ConfigError::BadCheckUrl(url.to_string()));
            }
        }
        Ok(())
    }

    pub fn check_keys(&self) -> Result<(), ConfigError> {
        if self.public_key.is_empty() {
            return Err(ConfigError::MissingPublicKey);
        }
        if self.private_key.is_empty() {
            return Err(ConfigError::MissingPrivateKey);
        }
        Ok(())
    }

    /// Endpoint host and port; the host may be a name or an IP literal.
    pub fn endpoint_parts(&self) -> Result<(String, u16), ConfigError> {
        burrow_network::split_host_port(&self.endpoint)
            .map(|(host, port)| (host.to_string(), port))
            .map_err(|_| ConfigError::BadEndpoint(self.endpoint.clone()))
    }

    /// Local interface addresses, blanks dropped. Accepts `ip` or `ip/prefix`.
    pub fn local_ips(&self) -> Result<Vec<IpAddr>, ConfigError> {
        let ips = parse_ips(&self.local_addresses, ConfigError::BadLocalAddress)?;
        if ips.is_empty() {
            return Err(ConfigError::NoLocalAddress);
        }
        Ok(ips)
    }

    /// DNS servers, defaulting to [`DEFAULT_DNS`].
    pub fn dns_ips(&self) -> Result<Vec<IpAddr>, ConfigError> {
        let ips = parse_ips(&self.dns_addresses, ConfigError::BadDnsAddress)?;
        if ips.is_empty() {
            return Ok(vec![DEFAULT_DNS]);
        }
        Ok(ips)
    }

    /// Allowed-IPs, defaulting to `0.0.0.0/0`. Order is preserved.
    pub fn allowed_ip_list(&self) -> Result<Vec<IpNet>, ConfigError> {
        let mut nets = Vec::new();
        for raw in self.allowed_ips.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            let net = raw
                .parse::<IpNet>()
                .map_err(|_| ConfigError::BadAllowedIp(raw.to_string()))?;
            nets.push(net);
        }
        if nets.is_empty() {
            nets.push(IpNet::V4(Ipv4Net::default()));
        }
        Ok(nets)
    }

    pub fn proxy_listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.proxy_address
            .parse()
            .map_err(|_| ConfigError::BadProxyAddress(self.proxy_address.clone()))
    }

    pub fn mtu(&self) -> u16 {
        self.mtu.filter(|m| *m > 0).unwrap_or(DEFAULT_MTU)
    }

    /// Health check target, when both URL and timeout are set.
    pub fn verification(&self) -> Option<(&str, Duration)> {
        let url = self.check_url.as_deref().filter(|u| !u.is_empty())?;
        (!self.check_timeout.is_zero()).then_some((url, self.check_timeout))
    }
}

fn parse_ips(
    raw: &[String],
    err: fn(String) -> ConfigError,
) -> Result<Vec<IpAddr>, ConfigError> {
    raw.iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpAddr>()
                .or_else(|_| s.parse::<IpNet>().map(|net| net.addr()))
                .map_err(|_| err(s.to_string()))
        })
        .collect()
}

/// Parse `500ms`, `30s`, `5m`, `1h`; a bare number is seconds.
pub fn parse_duration(text: &str) -> Result<Duration, ConfigError> {
    let text = text.trim();
    let bad = || ConfigError::BadDuration(text.to_string());

    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let value: u64 = digits.parse().map_err(|_| bad())?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => Ok(Duration::from_secs(value)),
        "m" => value.checked_mul(60).map(Duration::from_secs).ok_or_else(bad),
        "h" => value.checked_mul(3600).map(Duration::from_secs).ok_or_else(bad),
        _ => Err(bad()),
    }
}

fn deserialize_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("must provide a WireGuard public key")]
    MissingPublicKey,

    #[error("must provide a WireGuard private key")]
    MissingPrivateKey,

    #[error("bad endpoint {0:?}: expected host:port")]
    BadEndpoint(String),

    #[error("must specify at least one local peer address")]
    NoLocalAddress,

    #[error("bad local address {0:?}")]
    BadLocalAddress(String),

    #[error("bad DNS address {0:?}")]
    BadDnsAddress(String),

    #[error("bad allowed IP {0:?}")]
    BadAllowedIp(String),

    #[error("bad proxy address {0:?}")]
    BadProxyAddress(String),

    #[error("bad check URL {0:?}")]
    BadCheckUrl(String),

    #[error("bad duration {0:?}")]
    BadDuration(String),

    #[error("cannot read {0}: {1}")]
    Read(String, std::io::Error),

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> PeerConfig {
        PeerConfig {
            endpoint: "vpn.example.com:51820".into(),
            local_addresses: vec!["10.64.0.2".into()],
            public_key: "AAAA".into(),
            private_key: "BBBB".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = valid();
        assert!(config.validate().is_ok());
        assert_eq!(config.mtu(), 1500);
        assert_eq!(config.dns_ips().unwrap(), vec![DEFAULT_DNS]);
        assert_eq!(config.allowed_ip_list().unwrap()[0].to_string(), "0.0.0.0/0");
        assert_eq!(config.proxy_listen_addr().unwrap().to_string(), "127.0.0.1:8080");
        assert_eq!(config.retry_delay, Duration::ZERO);
    }

    #[test]
    fn test_missing_keys() {
        let config = PeerConfig { public_key: String::new(), ..valid() };
        assert!(matches!(config.validate(), Err(ConfigError::MissingPublicKey)));

        let config = PeerConfig { private_key: String::new(), ..valid() };
        assert!(matches!(config.validate(), Err(ConfigError::MissingPrivateKey)));
    }

    #[test]
    fn test_blank_local_addresses_rejected() {
        let config = PeerConfig {
            local_addresses: vec!["".into(), "  ".into()],
            ..valid()
        };
        assert!(matches!(config.local_ips(), Err(ConfigError::NoLocalAddress)));
    }

    #[test]
    fn test_local_address_forms() {
        let config = PeerConfig {
            local_addresses: vec!["10.64.0.2/32".into(), "".into(), "fd00::2".into()],
            ..valid()
        };
        let ips = config.local_ips().unwrap();
        assert_eq!(ips, vec!["10.64.0.2".parse::<IpAddr>().unwrap(), "fd00::2".parse().unwrap()]);

        let config = PeerConfig {
            local_addresses: vec!["10.64.0.300".into()],
            ..valid()
        };
        assert!(matches!(config.local_ips(), Err(ConfigError::BadLocalAddress(a)) if a == "10.64.0.300"));
    }

    #[test]
    fn test_bad_dns_and_proxy() {
        let config = PeerConfig { dns_addresses: vec!["dns.google".into()], ..valid() };
        assert!(matches!(config.validate(), Err(ConfigError::BadDnsAddress(_))));

        let config = PeerConfig { proxy_address: "localhost:8080".into(), ..valid() };
        assert!(matches!(config.validate(), Err(ConfigError::BadProxyAddress(_))));
    }

    #[test]
    fn test_endpoint_parts() {
        assert_eq!(valid().endpoint_parts().unwrap(), ("vpn.example.com".to_string(), 51820));

        let config = PeerConfig { endpoint: "vpn.example.com".into(), ..valid() };
        assert!(matches!(config.endpoint_parts(), Err(ConfigError::BadEndpoint(_))));
    }

    #[test]
    fn test_verification_needs_url_and_timeout() {
        let config = valid();
        assert!(config.verification().is_none());

        let config = PeerConfig {
            check_url: Some("https://example.com/".into()),
            ..valid()
        };
        assert_eq!(config.verification(), Some(("https://example.com/", Duration::from_secs(30))));

        let config = PeerConfig {
            check_timeout: Duration::ZERO,
            ..config
        };
        assert!(config.verification().is_none());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("").is_err());
        assert!(matches!(
            parse_duration("5124095576030432h"),
            Err(ConfigError::BadDuration(_))
        ));
        assert!(parse_duration("307445734561825861m").is_err());
    }

    #[test]
    fn test_from_toml() {
        let config = PeerConfig::from_toml_str(
            r#"
            endpoint = "203.0.113.5:51820"
            local_addresses = ["10.64.0.2"]
            public_key = "cHVi"
            private_key = "cHJpdg=="
            allowed_ips = ["10.0.0.0/8", "192.168.1.0/24"]
            retry_delay = "5s"
            check_timeout = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.retry_delay, Duration::from_secs(5));
        assert_eq!(config.check_timeout, Duration::from_secs(10));
        assert_eq!(config.allowed_ip_list().unwrap().len(), 2);
        assert_eq!(config.proxy_address, DEFAULT_PROXY_ADDRESS);
    }

    #[test]
    fn test_unknown_toml_field_rejected() {
        let result = PeerConfig::from_toml_str("endpint = \"x:1\"");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
