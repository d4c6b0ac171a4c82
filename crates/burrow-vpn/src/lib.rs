//! burrow VPN - Userspace WireGuard with an HTTP Proxy
//!
//! Runs a WireGuard peer entirely in userspace (no TUN device, no root)
//! and exposes it to local applications as an HTTP forward proxy.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        burrow process                          │
//! │                                                                │
//! │  ┌──────────────┐   dial   ┌──────────────┐  packets  ┌───────┐ │
//! │  │ HTTP proxy   │─────────▶│ smoltcp      │──────────▶│ bor-  │ │
//! │  │ (127.0.0.1)  │          │ userspace    │◀──────────│ ingtun│ │
//! │  └──────────────┘          │ stack        │           └───┬───┘ │
//! │         ▲                  └──────────────┘               │     │
//! │  ReconnectSupervisor ── PeerSession ── TunnelFactory      │     │
//! └───────────────────────────────────────────────────────────│─────┘
//!                                                             ▼ UDP
//!                                                  ┌──────────────────┐
//!                                                  │  WireGuard peer  │
//!                                                  └──────────────────┘
//! ```
//!
//! - [`PeerSession`]: validate, build, configure and check one tunnel
//! - [`ReconnectSupervisor`]: serve the proxy, rebuild at a fixed interval
//! - [`ForwardProxy`]: plain HTTP relay and `CONNECT` tunnels
//! - [`WireGuardFactory`]: boringtun device over a smoltcp stack

mod config;
mod device;
mod keys;
mod manager;
mod netstack;
mod proxy;
mod session;
mod tunnel;

#[cfg(test)]
mod testing;

pub use config::{
    ConfigError, DEFAULT_DNS, DEFAULT_MTU, DEFAULT_PROXY_ADDRESS,
    HOST_LOOKUP_TIMEOUT, PeerConfig, parse_duration,
};
pub use device::WireGuardDevice;
pub use keys::{KEY_LEN, KeyError, from_wire_format, to_wire_format};
pub use manager::{ReconnectSupervisor, VpnError};
pub use netstack::{TunInterface, UserspaceStack};
pub use proxy::{ForwardProxy, ProxyConfig, ProxyError};
pub use session::{PeerSession, SessionError, SessionState};
pub use tunnel::{DeviceLogLevel, TunnelDevice, TunnelError, TunnelFactory, WireGuardFactory};
