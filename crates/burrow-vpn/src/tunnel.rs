//! Tunnel construction
//!
//! [`TunnelFactory`] is the boundary between the peer lifecycle and the
//! machinery that actually moves packets. A factory yields an interface
//! plus a [`NetStack`] for dialing over it, then binds a cryptographic
//! [`TunnelDevice`] to the interface.
//!
//! [`WireGuardFactory`] is the production implementation: a smoltcp
//! stack fed by a boringtun device over a UDP socket.

use crate::device::WireGuardDevice;
use crate::netstack::{self, TunInterface};
use burrow_network::NetStack;
use std::net::IpAddr;
use std::sync::Arc;

/// Verbosity of the cryptographic device's own logging.
///
/// Passed explicitly to each device instead of living in a global.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceLogLevel {
    /// Log nothing
    Silent,
    /// Log send and receive failures
    #[default]
    Error,
    /// Also log dropped packets and configuration details
    Verbose,
}

impl DeviceLogLevel {
    /// Map a log filter such as `info` or `burrow=debug` to a device level.
    pub fn from_filter(filter: &str) -> Self {
        let filter = filter.to_ascii_lowercase();
        if filter.contains("trace") || filter.contains("debug") {
            DeviceLogLevel::Verbose
        } else if filter == "off" || filter == "silent" {
            DeviceLogLevel::Silent
        } else {
            DeviceLogLevel::Error
        }
    }

    pub fn is_verbose(&self) -> bool {
        matches!(self, DeviceLogLevel::Verbose)
    }

    pub fn logs_errors(&self) -> bool {
        !matches!(self, DeviceLogLevel::Silent)
    }
}

/// A cryptographic tunnel device bound to an interface.
pub trait TunnelDevice: Send {
    /// Apply a newline separated `key=value` configuration. Either the
    /// whole text is applied or nothing is.
    fn ipc_set(&mut self, config: &str) -> Result<(), TunnelError>;

    /// Bring the link up.
    fn up(&mut self) -> Result<(), TunnelError>;

    /// Release the device and, with it, the interface and stack.
    /// Safe to call more than once.
    fn close(&mut self);
}

/// Builds the interface/stack pair and the device bound to it.
pub trait TunnelFactory: Send + Sync {
    type Interface: Send;
    type Device: TunnelDevice;

    fn create(
        &self,
        local: &[IpAddr],
        dns: &[IpAddr],
        mtu: u16,
    ) -> Result<(Self::Interface, Arc<dyn NetStack>), TunnelError>;

    fn create_device(
        &self,
        interface: Self::Interface,
        log_level: DeviceLogLevel,
    ) -> Result<Self::Device, TunnelError>;
}

/// Userspace WireGuard: boringtun for the protocol, smoltcp for TCP/IP.
#[derive(Debug, Clone, Default)]
pub struct WireGuardFactory;

impl TunnelFactory for WireGuardFactory {
    type Interface = TunInterface;
    type Device = WireGuardDevice;

    fn create(
        &self,
        local: &[IpAddr],
        dns: &[IpAddr],
        mtu: u16,
    ) -> Result<(TunInterface, Arc<dyn NetStack>), TunnelError> {
        if local.is_empty() {
            return Err(TunnelError::Interface("no local addresses".to_string()));
        }
        let (interface, stack) = netstack::spawn(local, dns, mtu)?;
        Ok((interface, Arc::new(stack)))
    }

    fn create_device(
        &self,
        interface: TunInterface,
        log_level: DeviceLogLevel,
    ) -> Result<WireGuardDevice, TunnelError> {
        if interface.is_closed() {
            return Err(TunnelError::Device("network stack already stopped".to_string()));
        }
        Ok(WireGuardDevice::new(interface, log_level))
    }
}

/// Tunnel errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TunnelError {
    #[error("cannot generate tunnel interface: {0}")]
    Interface(String),

    #[error("failed to create device: {0}")]
    Device(String),

    #[error("cannot configure WireGuard: {0}")]
    Configure(String),

    #[error("cannot start WireGuard: {0}")]
    Up(String),
}
