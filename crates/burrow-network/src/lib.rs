//! burrow network layer
//!
//! Networking that does not care which network it runs on.
//!
//! Everything here dials through a [`NetStack`]: the tunnel's userspace
//! TCP/IP stack in production, a loopback stack in tests.
//!
//! - [`NetStack`]: outbound TCP dialing (hostnames resolved by the stack)
//! - [`DnsResolver`]: host-side IPv4 lookups for the peer endpoint
//! - [`HttpClient`]: HTTP/1.1 (+ rustls) requests dialed through a stack

mod client;
mod dns;
mod stack;

pub use client::{HttpClient, HttpClientConfig, HttpError, Response, open_http1};
pub use dns::{DnsConfig, DnsError, DnsResolver, HostResolver, pick_address};
pub use stack::{AsyncStream, BoxedStream, NetStack, join_host_port, split_host_port};
