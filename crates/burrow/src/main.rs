//! burrow: userspace WireGuard peer behind a local HTTP proxy
//!
//! Peer settings come from an optional TOML file, overridden by flags and
//! `BURROW_*` environment variables. The reconnect supervisor then runs
//! until it gives up or Ctrl-C arrives.

use anyhow::{Context, Result};
use burrow_network::DnsResolver;
use burrow_vpn::{
    DeviceLogLevel, PeerConfig, PeerSession, ProxyConfig, ReconnectSupervisor, WireGuardFactory,
    parse_duration,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "burrow", version, about = "Userspace WireGuard peer exposed as an HTTP proxy")]
struct Cli {
    /// TOML file with peer settings
    #[arg(short = 'c', long, env = "BURROW_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP proxy listen address [default: 127.0.0.1:8080]
    #[arg(long = "http-proxy", env = "BURROW_PROXY_HTTP_ADDRESS")]
    http_proxy: Option<String>,

    /// Log filter: error, warn, info, debug, trace, or RUST_LOG syntax
    #[arg(short = 'L', long, env = "BURROW_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Peer public key (base64)
    #[arg(short = 'k', long, env = "BURROW_PUBLIC_KEY")]
    public_key: Option<String>,

    /// Local private key (base64)
    #[arg(short = 'K', long, env = "BURROW_PRIVATE_KEY", hide_env_values = true)]
    private_key: Option<String>,

    /// Local tunnel address, repeatable
    #[arg(short = 'a', long = "address", env = "BURROW_ADDRESS", value_delimiter = ',')]
    addresses: Vec<String>,

    /// Peer endpoint as host:port
    #[arg(short = 'e', long, env = "BURROW_ENDPOINT")]
    endpoint: Option<String>,

    /// DNS server reachable through the tunnel, repeatable [default: 1.1.1.1]
    #[arg(short = 'D', long = "dns-server", env = "BURROW_DNS_SERVER", value_delimiter = ',')]
    dns_servers: Vec<String>,

    /// CIDR routed through the peer, repeatable [default: 0.0.0.0/0]
    #[arg(long = "allowed-ip", env = "BURROW_ALLOWED_IP", value_delimiter = ',')]
    allowed_ips: Vec<String>,

    /// URL fetched through the tunnel to check it works
    #[arg(short = 'U', long, env = "BURROW_CHECK_URL")]
    check_url: Option<String>,

    /// Timeout for the check URL [default: 30s]
    #[arg(short = 'T', long = "check-url-timeout", env = "BURROW_CHECK_URL_TIMEOUT", value_parser = parse_duration)]
    check_timeout: Option<Duration>,

    /// Delay between reconnect attempts; 0s exits on the first failure [default: 0s]
    #[arg(short = 'r', long, env = "BURROW_RETRY_DELAY", value_parser = parse_duration)]
    retry_delay: Option<Duration>,

    /// Tunnel MTU [default: 1500]
    #[arg(long, env = "BURROW_MTU")]
    mtu: Option<u16>,
}

impl Cli {
    fn peer_config(&self) -> Result<PeerConfig> {
        let mut config = match &self.config {
            Some(path) => PeerConfig::from_file(path)?,
            None => PeerConfig::default(),
        };
        self.apply(&mut config);
        Ok(config)
    }

    /// Flags win over file values.
    fn apply(&self, config: &mut PeerConfig) {
        if let Some(addr) = &self.http_proxy {
            config.proxy_address = addr.clone();
        }
        if let Some(key) = &self.public_key {
            config.public_key = key.clone();
        }
        if let Some(key) = &self.private_key {
            config.private_key = key.clone();
        }
        if !self.addresses.is_empty() {
            config.local_addresses = self.addresses.clone();
        }
        if let Some(endpoint) = &self.endpoint {
            config.endpoint = endpoint.clone();
        }
        if !self.dns_servers.is_empty() {
            config.dns_addresses = self.dns_servers.clone();
        }
        if !self.allowed_ips.is_empty() {
            config.allowed_ips = self.allowed_ips.clone();
        }
        if let Some(url) = &self.check_url {
            config.check_url = Some(url.clone());
        }
        if let Some(timeout) = self.check_timeout {
            config.check_timeout = timeout;
        }
        if let Some(delay) = self.retry_delay {
            config.retry_delay = delay;
        }
        if let Some(mtu) = self.mtu {
            config.mtu = Some(mtu);
        }
    }
}

fn init_logging(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(filter).with_context(|| format!("bad log level {filter:?}"))?;
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let config = cli.peer_config()?;
    config.validate().context("invalid configuration")?;

    let proxy = ProxyConfig {
        listen_addr: config.proxy_listen_addr()?,
        ..Default::default()
    };
    let resolver = DnsResolver::with_defaults().context("cannot create DNS resolver")?;
    let retry_delay = config.retry_delay;
    let session = PeerSession::new(
        config,
        WireGuardFactory,
        Arc::new(resolver),
        DeviceLogLevel::from_filter(&cli.log_level),
    );
    let mut supervisor = ReconnectSupervisor::new(session, proxy, retry_delay);

    info!("burrow {} starting", env!("CARGO_PKG_VERSION"));
    tokio::select! {
        result = supervisor.run() => result.context("tunnel stopped")?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
    }

    info!("burrow shutting down");
    Ok(())
}
