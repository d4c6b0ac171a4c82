//! Peer session lifecycle
//!
//! A [`PeerSession`] owns at most one live tunnel to a single peer.
//!
//! ```text
//! Unconfigured → Validating → Connecting → Configuring → Verifying → Active
//!                     └────────────┴─────────────┴──→ Failed
//! ```
//!
//! Any failure while building the tunnel releases whatever was already
//! created, so a failed `init()` leaves nothing running.

use crate::config::{ConfigError, HOST_LOOKUP_TIMEOUT, PeerConfig};
use crate::keys::{KeyError, to_wire_format};
use crate::tunnel::{DeviceLogLevel, TunnelDevice, TunnelError, TunnelFactory};
use burrow_network::{
    DnsError, HostResolver, HttpClient, HttpClientConfig, HttpError, NetStack, pick_address,
};
use hyper::StatusCode;
use ipnet::IpNet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No tunnel; `init()` not called or the session was reset
    Unconfigured,
    /// Checking keys and addresses, resolving the endpoint
    Validating,
    /// Creating the interface and its network stack
    Connecting,
    /// Applying the wire configuration and bringing the device up
    Configuring,
    /// Fetching the check URL through the tunnel
    Verifying,
    /// Tunnel is up
    Active,
    /// Last `init()` failed before the tunnel came up
    Failed,
}

impl SessionState {
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Active)
    }
}

struct TunnelSession<D> {
    device: D,
    stack: Arc<dyn NetStack>,
    endpoint: SocketAddr,
    config_lines: Vec<String>,
}

/// Lifecycle of one WireGuard peer.
pub struct PeerSession<F: TunnelFactory> {
    config: PeerConfig,
    factory: F,
    resolver: Arc<dyn HostResolver>,
    log_level: DeviceLogLevel,
    state: SessionState,
    tunnel: Option<TunnelSession<F::Device>>,
}

impl<F: TunnelFactory> PeerSession<F> {
    pub fn new(
        config: PeerConfig,
        factory: F,
        resolver: Arc<dyn HostResolver>,
        log_level: DeviceLogLevel,
    ) -> Self {
        Self {
            config,
            factory,
            resolver,
            log_level,
            state: SessionState::Unconfigured,
            tunnel: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// Dial handle of the live tunnel.
    pub fn stack(&self) -> Option<Arc<dyn NetStack>> {
        self.tunnel.as_ref().map(|t| t.stack.clone())
    }

    /// Resolved peer endpoint of the live tunnel.
    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.tunnel.as_ref().map(|t| t.endpoint)
    }

    /// Wire configuration applied to the live device, one entry per line.
    pub fn config_lines(&self) -> Option<&[String]> {
        self.tunnel.as_ref().map(|t| t.config_lines.as_slice())
    }

    /// Bring the tunnel up and return its dial handle. A no-op while the
    /// session is active.
    ///
    /// A failed connection check is returned as an error, but the tunnel
    /// stays up and the session stays [`SessionState::Active`].
    pub async fn init(&mut self) -> Result<Arc<dyn NetStack>, SessionError> {
        if self.state.is_active() {
            if let Some(stack) = self.stack() {
                return Ok(stack);
            }
        }
        if self.tunnel.is_some() {
            self.reset();
        }

        self.state = SessionState::Validating;
        let tunnel = match self.establish().await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                self.state = SessionState::Failed;
                warn!("Peer session failed: {}", e);
                return Err(e);
            }
        };
        let stack = tunnel.stack.clone();
        info!("Tunnel to {} is up", tunnel.endpoint);
        self.tunnel = Some(tunnel);

        if let Some((url, timeout)) = self.config.verification() {
            self.state = SessionState::Verifying;
            let checked = verify(stack.clone(), url, timeout).await;
            self.state = SessionState::Active;
            if let Err(e) = checked {
                warn!("Tunnel is up but {}", e);
                return Err(e);
            }
        }

        self.state = SessionState::Active;
        info!("Peer session active");
        Ok(stack)
    }

    async fn establish(&mut self) -> Result<TunnelSession<F::Device>, SessionError> {
        let config = &self.config;
        config.check_keys()?;
        let private_key = to_wire_format(&config.private_key)?;
        let public_key = to_wire_format(&config.public_key)?;

        let (host, port) = config.endpoint_parts()?;
        let endpoint = SocketAddr::new(IpAddr::V4(self.resolve_endpoint(&host).await?), port);

        let allowed = config.allowed_ip_list()?;
        let local = config.local_ips()?;
        let dns = config.dns_ips()?;

        self.state = SessionState::Connecting;
        let (interface, stack) = self.factory.create(&local, &dns, config.mtu())?;
        let mut device = self.factory.create_device(interface, self.log_level)?;

        self.state = SessionState::Configuring;
        let config_lines = wire_config(&private_key, &public_key, &allowed, endpoint);
        for line in &config_lines[2..] {
            debug!("Device config: {}", line);
        }
        if let Err(e) = device.ipc_set(&config_lines.join("\n")).and_then(|()| device.up()) {
            device.close();
            return Err(e.into());
        }

        Ok(TunnelSession {
            device,
            stack,
            endpoint,
            config_lines,
        })
    }

    async fn resolve_endpoint(&self, host: &str) -> Result<Ipv4Addr, SessionError> {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Ok(ip);
        }
        let addrs = tokio::time::timeout(HOST_LOOKUP_TIMEOUT, self.resolver.lookup_ipv4(host))
            .await
            .map_err(|_| DnsError::Timeout(host.to_string()))??;
        let ip = pick_address(&addrs).ok_or_else(|| DnsError::NoAddresses(host.to_string()))?;
        debug!("Endpoint {} resolved to {} ({} candidates)", host, ip, addrs.len());
        Ok(ip)
    }

    /// Release the tunnel and return to [`SessionState::Unconfigured`].
    /// Safe on a partial or already released session.
    pub fn reset(&mut self) {
        if let Some(mut tunnel) = self.tunnel.take() {
            tunnel.device.close();
            info!("Tunnel to {} released", tunnel.endpoint);
        }
        self.state = SessionState::Unconfigured;
    }
}

impl<F: TunnelFactory> Drop for PeerSession<F> {
    fn drop(&mut self) {
        self.reset();
    }
}

/// The four ordered lines of the device configuration.
fn wire_config(private_key: &str, public_key: &str, allowed: &[IpNet], endpoint: SocketAddr) -> Vec<String> {
    let allowed = allowed
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");
    vec![
        format!("private_key={private_key}"),
        format!("public_key={public_key}"),
        format!("allowed_ip={allowed}"),
        format!("endpoint={endpoint}"),
    ]
}

async fn verify(stack: Arc<dyn NetStack>, url: &str, timeout: Duration) -> Result<(), SessionError> {
    let config = HttpClientConfig {
        timeout,
        ..Default::default()
    };
    let status = HttpClient::new(config, stack)
        .get_status(url)
        .await
        .map_err(SessionError::CheckFailed)?;

    if status.as_u16() >= 400 {
        return Err(SessionError::CheckStatus(status));
    }
    info!("Connection check passed: {}", status);
    Ok(())
}

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot decode key: {0}")]
    Key(#[from] KeyError),

    #[error("cannot resolve endpoint: {0}")]
    Resolve(#[from] DnsError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("connection check failed: {0}")]
    CheckFailed(HttpError),

    #[error("connection check failed: HTTP {0}")]
    CheckStatus(StatusCode),
}

impl SessionError {
    /// The tunnel came up but the connection check did not pass.
    pub fn is_verification(&self) -> bool {
        matches!(self, SessionError::CheckFailed(_) | SessionError::CheckStatus(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeFactory, LoopbackStack, StaticResolver, http_upstream};
    use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

    const PEER_IP: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 5);

    fn peer_config() -> PeerConfig {
        PeerConfig {
            endpoint: "vpn.example.net:51820".to_string(),
            local_addresses: vec!["10.64.0.2/32".to_string(), " ".to_string()],
            public_key: BASE64.encode([1u8; 32]),
            private_key: BASE64.encode([2u8; 32]),
            ..Default::default()
        }
    }

    fn session(config: PeerConfig, factory: &FakeFactory) -> PeerSession<FakeFactory> {
        let resolver = StaticResolver::default().with("vpn.example.net", &[PEER_IP]);
        PeerSession::new(config, factory.clone(), Arc::new(resolver), DeviceLogLevel::Silent)
    }

    #[tokio::test]
    async fn test_init_applies_wire_config() {
        let factory = FakeFactory::new();
        let mut session = session(peer_config(), &factory);

        session.init().await.unwrap();
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.endpoint(), Some("203.0.113.5:51820".parse().unwrap()));

        let expected = vec![
            format!("private_key={}", "02".repeat(32)),
            format!("public_key={}", "01".repeat(32)),
            "allowed_ip=0.0.0.0/0".to_string(),
            "endpoint=203.0.113.5:51820".to_string(),
        ];
        assert_eq!(session.config_lines().unwrap(), expected.as_slice());

        let log = factory.log();
        assert_eq!(log.configs, vec![expected.join("\n")]);
        assert_eq!(log.ups, 1);
        let (local, dns, mtu) = &log.created_with[0];
        assert_eq!(local, &vec!["10.64.0.2".parse::<IpAddr>().unwrap()]);
        assert_eq!(dns, &vec!["1.1.1.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(*mtu, 1500);
        assert_eq!(log.log_levels, vec![DeviceLogLevel::Silent]);
    }

    #[tokio::test]
    async fn test_allowed_ips_joined_in_order() {
        let factory = FakeFactory::new();
        let config = PeerConfig {
            allowed_ips: vec!["10.0.0.0/8".to_string(), "192.168.1.0/24".to_string()],
            ..peer_config()
        };
        let mut session = session(config, &factory);
        session.init().await.unwrap();

        assert_eq!(
            session.config_lines().unwrap()[2],
            "allowed_ip=10.0.0.0/8,192.168.1.0/24"
        );
    }

    #[tokio::test]
    async fn test_no_local_address_builds_nothing() {
        let factory = FakeFactory::new();
        let config = PeerConfig {
            local_addresses: vec!["".to_string(), "  ".to_string()],
            ..peer_config()
        };
        let mut session = session(config, &factory);

        let err = session.init().await.err().unwrap();
        assert!(matches!(err, SessionError::Config(ConfigError::NoLocalAddress)));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(factory.log().creates.is_empty());
    }

    #[tokio::test]
    async fn test_bad_key_is_typed_error() {
        let factory = FakeFactory::new();
        let config = PeerConfig {
            private_key: "not base64!".to_string(),
            ..peer_config()
        };
        let mut session = session(config, &factory);

        let err = session.init().await.err().unwrap();
        assert!(matches!(err, SessionError::Key(KeyError::InvalidBase64)));
        assert!(factory.log().creates.is_empty());
    }

    #[tokio::test]
    async fn test_unresolvable_endpoint() {
        let factory = FakeFactory::new();
        let config = PeerConfig {
            endpoint: "nowhere.invalid:51820".to_string(),
            ..peer_config()
        };
        let mut session = session(config, &factory);

        let err = session.init().await.err().unwrap();
        assert!(matches!(err, SessionError::Resolve(_)));
        assert!(factory.log().creates.is_empty());
    }

    #[tokio::test]
    async fn test_ip_endpoint_skips_resolver() {
        let factory = FakeFactory::new();
        let config = PeerConfig {
            endpoint: "198.51.100.7:443".to_string(),
            ..peer_config()
        };
        let mut session = session(config, &factory);
        session.init().await.unwrap();
        assert_eq!(session.config_lines().unwrap()[3], "endpoint=198.51.100.7:443");
    }

    #[tokio::test]
    async fn test_configure_failure_releases_device() {
        let factory = FakeFactory::new().failing_ipc();
        let mut session = session(peer_config(), &factory);

        let err = session.init().await.err().unwrap();
        assert!(matches!(err, SessionError::Tunnel(TunnelError::Configure(_))));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(session.stack().is_none());
        assert_eq!(factory.log().closes, 1);
    }

    #[tokio::test]
    async fn test_up_failure_releases_device() {
        let factory = FakeFactory::new().failing_up();
        let mut session = session(peer_config(), &factory);

        assert!(session.init().await.is_err());
        assert_eq!(factory.log().closes, 1);
        assert_eq!(factory.log().ups, 0);
    }

    #[tokio::test]
    async fn test_init_is_idempotent_and_reset_releases_once() {
        let factory = FakeFactory::new();
        let mut session = session(peer_config(), &factory);

        let first = session.init().await.unwrap();
        let second = session.init().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(factory.log().creates.len(), 1);

        session.reset();
        session.reset();
        assert_eq!(session.state(), SessionState::Unconfigured);
        assert!(session.stack().is_none());
        assert_eq!(factory.log().closes, 1);

        session.init().await.unwrap();
        drop(session);
        assert_eq!(factory.log().creates.len(), 2);
        assert_eq!(factory.log().closes, 2);
    }

    #[tokio::test]
    async fn test_failed_check_leaves_tunnel_up() {
        let (upstream, _server) =
            http_upstream("HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n").await;
        let factory = FakeFactory::new().with_stack(LoopbackStack::new());
        let config = PeerConfig {
            check_url: Some(format!("http://{upstream}/generate_204")),
            ..peer_config()
        };
        let mut session = session(config, &factory);

        let err = session.init().await.err().unwrap();
        assert!(matches!(err, SessionError::CheckStatus(StatusCode::INTERNAL_SERVER_ERROR)));
        assert!(err.is_verification());
        assert_eq!(session.state(), SessionState::Active);
        assert!(session.stack().is_some());
        assert_eq!(factory.log().closes, 0);
    }

    #[tokio::test]
    async fn test_check_dials_through_tunnel_stack() {
        let (upstream, server) =
            http_upstream("HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n").await;
        let stack = LoopbackStack::new();
        let factory = FakeFactory::new().with_stack(stack.clone());
        let config = PeerConfig {
            check_url: Some(format!("http://{upstream}/generate_204")),
            ..peer_config()
        };
        let mut session = session(config, &factory);

        session.init().await.unwrap();
        assert_eq!(stack.dialed(), vec![upstream.to_string()]);
        assert!(server.await.unwrap().starts_with("GET /generate_204 HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn test_check_ignores_large_body() {
        let body = "x".repeat(2 * 1024 * 1024);
        let reply = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{body}", body.len());
        let (upstream, _server) = http_upstream(reply).await;
        let factory = FakeFactory::new().with_stack(LoopbackStack::new());
        let config = PeerConfig {
            check_url: Some(format!("http://{upstream}/")),
            ..peer_config()
        };
        let mut session = session(config, &factory);

        session.init().await.unwrap();
        assert_eq!(session.state(), SessionState::Active);
    }
}
