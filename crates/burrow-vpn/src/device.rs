//! WireGuard device
//!
//! Binds a boringtun [`Tunn`] to a [`TunInterface`]. Packets the stack
//! emits are encrypted and sent to the peer over a connected UDP socket;
//! datagrams from the peer are decrypted and handed back to the stack
//! when their inner source falls inside the allowed IP ranges.
//!
//! Configuration uses the line based `key=value` format produced by the
//! session:
//!
//! ```text
//! private_key=<64 hex chars>
//! public_key=<64 hex chars>
//! allowed_ip=0.0.0.0/0,::/0
//! endpoint=203.0.113.5:51820
//! ```

use crate::keys::{KEY_LEN, from_wire_format};
use crate::netstack::TunInterface;
use crate::tunnel::{DeviceLogLevel, TunnelDevice, TunnelError};
use boringtun::noise::{Tunn, TunnResult};
use boringtun::x25519::{PublicKey, StaticSecret};
use ipnet::IpNet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const MAX_PACKET: usize = 65535;
const TIMER_TICK: Duration = Duration::from_millis(100);

#[derive(Clone)]
struct PeerSettings {
    private_key: [u8; KEY_LEN],
    public_key: [u8; KEY_LEN],
    allowed_ips: Vec<IpNet>,
    endpoint: SocketAddr,
}

fn configure_error(message: impl Into<String>) -> TunnelError {
    TunnelError::Configure(message.into())
}

fn parse_settings(text: &str) -> Result<PeerSettings, TunnelError> {
    let mut private_key = None;
    let mut public_key = None;
    let mut allowed_ips = Vec::new();
    let mut endpoint = None;

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| configure_error(format!("malformed line {line:?}")))?;
        match key {
            "private_key" => private_key = Some(parse_key(key, value)?),
            "public_key" => public_key = Some(parse_key(key, value)?),
            "allowed_ip" => {
                for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    let net = item
                        .parse::<IpNet>()
                        .or_else(|_| item.parse::<IpAddr>().map(IpNet::from))
                        .map_err(|_| configure_error(format!("bad allowed_ip {item:?}")))?;
                    allowed_ips.push(net);
                }
            }
            "endpoint" => {
                let addr = value
                    .parse::<SocketAddr>()
                    .map_err(|_| configure_error(format!("bad endpoint {value:?}")))?;
                endpoint = Some(addr);
            }
            other => return Err(configure_error(format!("unknown key {other:?}"))),
        }
    }

    Ok(PeerSettings {
        private_key: private_key.ok_or_else(|| configure_error("missing private_key"))?,
        public_key: public_key.ok_or_else(|| configure_error("missing public_key"))?,
        allowed_ips,
        endpoint: endpoint.ok_or_else(|| configure_error("missing endpoint"))?,
    })
}

fn parse_key(name: &str, value: &str) -> Result<[u8; KEY_LEN], TunnelError> {
    from_wire_format(value).map_err(|e| configure_error(format!("{name}: {e}")))
}

/// Userspace WireGuard device over a [`TunInterface`].
pub struct WireGuardDevice {
    /// Owned until `up` hands it to the pump
    interface: Option<TunInterface>,
    settings: Option<PeerSettings>,
    log_level: DeviceLogLevel,
    pump: Option<JoinHandle<()>>,
}

impl WireGuardDevice {
    pub(crate) fn new(interface: TunInterface, log_level: DeviceLogLevel) -> Self {
        Self {
            interface: Some(interface),
            settings: None,
            log_level,
            pump: None,
        }
    }

    /// Whether the packet pump is running.
    pub fn is_up(&self) -> bool {
        self.pump.as_ref().is_some_and(|pump| !pump.is_finished())
    }
}

impl TunnelDevice for WireGuardDevice {
    fn ipc_set(&mut self, config: &str) -> Result<(), TunnelError> {
        let settings = parse_settings(config).inspect_err(|e| {
            if self.log_level.logs_errors() {
                warn!("Rejected device configuration: {}", e);
            }
        })?;

        if self.log_level.is_verbose() {
            debug!(
                "Device configured for peer {} ({} allowed ranges)",
                settings.endpoint,
                settings.allowed_ips.len()
            );
        }
        self.settings = Some(settings);
        Ok(())
    }

    fn up(&mut self) -> Result<(), TunnelError> {
        if self.pump.is_some() {
            return Ok(());
        }
        let settings = self
            .settings
            .clone()
            .ok_or_else(|| TunnelError::Up("device has no configuration".to_string()))?;
        if self.interface.as_ref().is_none_or(TunInterface::is_closed) {
            return Err(TunnelError::Up("network stack stopped".to_string()));
        }
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|e| TunnelError::Up(e.to_string()))?;
        let tunn = Tunn::new(
            StaticSecret::from(settings.private_key),
            PublicKey::from(settings.public_key),
            None,
            None,
            rand::random::<u32>() >> 8,
            None,
        )
        .map_err(|e| TunnelError::Up(format!("WireGuard session: {e}")))?;

        let socket = {
            let _guard = runtime.enter();
            connect_udp(settings.endpoint)
                .map_err(|e| TunnelError::Up(format!("UDP socket to {}: {e}", settings.endpoint)))?
        };
        let interface = self
            .interface
            .take()
            .ok_or_else(|| TunnelError::Up("interface already released".to_string()))?;

        let pump = Pump {
            tunn,
            socket,
            interface,
            allowed_ips: settings.allowed_ips,
            log_level: self.log_level,
        };
        self.pump = Some(runtime.spawn(pump.run()));
        info!("WireGuard device up, peer {}", settings.endpoint);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
            debug!("WireGuard device closed");
        }
        self.interface = None;
        self.settings = None;
    }
}

impl Drop for WireGuardDevice {
    fn drop(&mut self) {
        self.close();
    }
}

fn connect_udp(endpoint: SocketAddr) -> std::io::Result<UdpSocket> {
    let bind: SocketAddr = if endpoint.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = std::net::UdpSocket::bind(bind)?;
    socket.connect(endpoint)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket)
}

struct Pump {
    tunn: Tunn,
    socket: UdpSocket,
    interface: TunInterface,
    allowed_ips: Vec<IpNet>,
    log_level: DeviceLogLevel,
}

impl Pump {
    async fn run(mut self) {
        let mut send_buf = vec![0u8; MAX_PACKET];
        let mut recv_buf = vec![0u8; MAX_PACKET];
        let mut plain_buf = vec![0u8; MAX_PACKET];

        let initiation = self.tunn.format_handshake_initiation(&mut send_buf, false);
        send_to_peer(&self.socket, initiation, self.log_level).await;

        let mut timers = tokio::time::interval(TIMER_TICK);
        timers.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                packet = self.interface.from_stack.recv() => {
                    let Some(packet) = packet else { break };
                    let result = self.tunn.encapsulate(&packet, &mut send_buf);
                    send_to_peer(&self.socket, result, self.log_level).await;
                }
                received = self.socket.recv(&mut recv_buf) => match received {
                    Ok(n) => self.receive(&recv_buf[..n], &mut plain_buf).await,
                    Err(e) => {
                        if self.log_level.logs_errors() {
                            warn!("UDP receive from peer failed: {}", e);
                        }
                    }
                },
                _ = timers.tick() => {
                    let result = self.tunn.update_timers(&mut send_buf);
                    send_to_peer(&self.socket, result, self.log_level).await;
                }
            }
        }

        debug!("WireGuard pump stopped");
    }

    async fn receive(&mut self, datagram: &[u8], plain: &mut [u8]) {
        let mut input = datagram;
        loop {
            match self.tunn.decapsulate(None, input, plain) {
                TunnResult::WriteToNetwork(packet) => {
                    send_packet(&self.socket, packet, self.log_level).await;
                    // drain queued packets after a handshake completes
                    input = &[];
                    continue;
                }
                TunnResult::WriteToTunnelV4(packet, src) => self.deliver(packet, IpAddr::V4(src)),
                TunnResult::WriteToTunnelV6(packet, src) => self.deliver(packet, IpAddr::V6(src)),
                TunnResult::Err(e) => {
                    if self.log_level.is_verbose() {
                        debug!("Dropped datagram from peer: {:?}", e);
                    }
                }
                TunnResult::Done => {}
            }
            break;
        }
    }

    fn deliver(&self, packet: &[u8], src: IpAddr) {
        if !self.allowed_ips.iter().any(|net| net.contains(&src)) {
            if self.log_level.is_verbose() {
                debug!("Dropped packet from {} outside allowed IPs", src);
            }
            return;
        }
        match self.interface.to_stack.try_send(packet.to_vec()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if self.log_level.is_verbose() {
                    debug!("Stack queue full, dropped packet from {}", src);
                }
            }
            // stack gone, from_stack ends the loop
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

async fn send_to_peer(socket: &UdpSocket, result: TunnResult<'_>, log_level: DeviceLogLevel) {
    match result {
        TunnResult::WriteToNetwork(packet) => send_packet(socket, packet, log_level).await,
        TunnResult::Err(e) => {
            if log_level.is_verbose() {
                debug!("WireGuard: {:?}", e);
            }
        }
        _ => {}
    }
}

async fn send_packet(socket: &UdpSocket, packet: &[u8], log_level: DeviceLogLevel) {
    if let Err(e) = socket.send(packet).await {
        if log_level.logs_errors() {
            warn!("UDP send to peer failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netstack;

    fn wire_config(endpoint: &str, allowed: &str) -> String {
        let private = StaticSecret::from([7u8; 32]);
        let public = PublicKey::from(&StaticSecret::from([9u8; 32]));
        format!(
            "private_key={}\npublic_key={}\nallowed_ip={}\nendpoint={}\n",
            hex::encode(private.to_bytes()),
            hex::encode(public.as_bytes()),
            allowed,
            endpoint
        )
    }

    fn interface() -> TunInterface {
        let local = ["10.64.0.2".parse().unwrap()];
        netstack::spawn(&local, &[], 1420).unwrap().0
    }

    #[test]
    fn test_parse_settings() {
        let settings =
            parse_settings(&wire_config("203.0.113.5:51820", "0.0.0.0/0, 10.0.0.1")).unwrap();
        assert_eq!(settings.private_key, [7u8; 32]);
        assert_eq!(settings.endpoint, "203.0.113.5:51820".parse().unwrap());
        assert_eq!(
            settings.allowed_ips,
            vec!["0.0.0.0/0".parse::<IpNet>().unwrap(), "10.0.0.1/32".parse().unwrap()]
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        let good = wire_config("203.0.113.5:51820", "0.0.0.0/0");

        let unknown = format!("{good}persistent_keepalive_interval=25\n");
        assert!(matches!(parse_settings(&unknown), Err(TunnelError::Configure(_))));

        let bad_hex = good.replacen("private_key=", "private_key=zz", 1);
        assert!(matches!(parse_settings(&bad_hex), Err(TunnelError::Configure(_))));

        assert!(parse_settings("endpoint").is_err());
        assert!(parse_settings("endpoint=203.0.113.5:51820").is_err());
    }

    #[tokio::test]
    async fn test_failed_ipc_set_keeps_previous_settings() {
        let mut device = WireGuardDevice::new(interface(), DeviceLogLevel::Silent);
        device
            .ipc_set(&wire_config("203.0.113.5:51820", "0.0.0.0/0"))
            .unwrap();

        let err = device
            .ipc_set(&wire_config("198.51.100.1:51820", "bogus"))
            .unwrap_err();
        assert!(matches!(err, TunnelError::Configure(_)));
        let kept = device.settings.as_ref().unwrap();
        assert_eq!(kept.endpoint, "203.0.113.5:51820".parse().unwrap());
    }

    #[tokio::test]
    async fn test_up_requires_configuration() {
        let mut device = WireGuardDevice::new(interface(), DeviceLogLevel::Silent);
        assert!(matches!(device.up(), Err(TunnelError::Up(_))));
        assert!(!device.is_up());
    }

    #[tokio::test]
    async fn test_up_sends_handshake_initiation() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let endpoint = peer.local_addr().unwrap().to_string();

        let mut device = WireGuardDevice::new(interface(), DeviceLogLevel::Silent);
        device.ipc_set(&wire_config(&endpoint, "0.0.0.0/0")).unwrap();
        device.up().unwrap();
        assert!(device.is_up());

        let mut buf = [0u8; 512];
        let n = tokio::time::timeout(Duration::from_secs(5), peer.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        // handshake initiation: type 1, fixed 148 bytes
        assert_eq!(n, 148);
        assert_eq!(&buf[..4], &[1, 0, 0, 0]);

        device.close();
        device.close();
        assert!(!device.is_up());
        assert!(device.up().is_err());
    }
}
