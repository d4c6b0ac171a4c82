//! Reconnect supervisor
//!
//! Drives a [`PeerSession`] and the [`ForwardProxy`] serving over it:
//!
//! ```text
//! loop {
//!     init session ─▶ serve proxy until it stops
//!     retry_delay == 0 ? return outcome : reset, sleep retry_delay
//! }
//! ```
//!
//! Retries run at a fixed interval with no cap, so a long-lived client
//! keeps coming back after the peer or the network goes away.

use crate::proxy::{ForwardProxy, ProxyConfig, ProxyError};
use crate::session::{PeerSession, SessionError};
use crate::tunnel::TunnelFactory;
use std::time::Duration;
use tracing::{info, warn};

/// Supervisor errors
#[derive(Debug, thiserror::Error)]
pub enum VpnError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("proxy stopped: {0}")]
    Proxy(#[from] ProxyError),
}

pub struct ReconnectSupervisor<F: TunnelFactory> {
    session: PeerSession<F>,
    proxy: ProxyConfig,
    retry_delay: Duration,
    attempts: u64,
}

impl<F: TunnelFactory> ReconnectSupervisor<F> {
    pub fn new(session: PeerSession<F>, proxy: ProxyConfig, retry_delay: Duration) -> Self {
        Self {
            session,
            proxy,
            retry_delay,
            attempts: 0,
        }
    }

    /// Number of attempts started so far.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn session(&self) -> &PeerSession<F> {
        &self.session
    }

    /// Run until an attempt ends and retries are disabled. With a
    /// non-zero retry delay this never returns.
    pub async fn run(&mut self) -> Result<(), VpnError> {
        loop {
            self.attempts += 1;
            let outcome = self.attempt().await;

            if self.retry_delay.is_zero() {
                return outcome;
            }

            self.session.reset();
            match &outcome {
                Err(e) => warn!(
                    "Attempt {} failed: {}; retrying in {:?}",
                    self.attempts, e, self.retry_delay
                ),
                Ok(()) => info!("Proxy stopped; reconnecting in {:?}", self.retry_delay),
            }
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    async fn attempt(&mut self) -> Result<(), VpnError> {
        let stack = self.session.init().await?;

        let proxy = ForwardProxy::new(self.proxy.clone(), stack);
        info!("Serving HTTP proxy at {}", proxy.proxy_url());
        proxy.run().await?;
        Ok(())
    }
}
