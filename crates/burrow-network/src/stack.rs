//! Network stack capability
//!
//! The seam between the proxy/health-check code and whatever actually
//! carries the bytes.

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream returned by [`NetStack::dial`].
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Outbound connectivity through some network.
///
/// Implementations must be safe to share between tasks; callers hold
/// it as `Arc<dyn NetStack>` and dial concurrently.
#[async_trait]
pub trait NetStack: Send + Sync {
    /// Open a TCP stream to `addr` (`host:port`, `[v6]:port`).
    ///
    /// Hostnames are resolved by the stack itself.
    async fn dial(&self, addr: &str) -> io::Result<BoxedStream>;

    /// Completes once the stack can no longer carry traffic.
    async fn closed(&self) {
        std::future::pending::<()>().await
    }
}

/// Split `host:port` or `[v6]:port` into its parts.
pub fn split_host_port(addr: &str) -> io::Result<(&str, u16)> {
    let invalid = || io::Error::new(io::ErrorKind::InvalidInput, format!("bad address {addr:?}"));

    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    let host = match host.strip_prefix('[') {
        Some(rest) => rest.strip_suffix(']').ok_or_else(invalid)?,
        None if host.contains(':') => return Err(invalid()),
        None => host,
    };
    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host, port))
}

/// Inverse of [`split_host_port`]; brackets IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
