//! Userspace TCP/IP stack
//!
//! A smoltcp interface driven by its own task. Plain IP packets enter and
//! leave through a [`TunInterface`], a pair of bounded queues whose other
//! end belongs to the WireGuard device. Callers reach the stack through
//! [`UserspaceStack`], which implements [`NetStack`]:
//!
//! ```text
//!  dial() ──Command──▶ dataplane task ◀──packets──▶ TunInterface ◀──▶ device
//!    ▲                     │ smoltcp sockets
//!    └── DuplexStream ◀── bridge task (Bytes channels)
//! ```
//!
//! Hostnames are resolved inside the tunnel: DNS queries go out as UDP
//! datagrams from the local tunnel address to the configured servers.

use async_trait::async_trait;
use burrow_network::{BoxedStream, NetStack, split_host_port};
use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use rand::Rng;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::socket::{tcp, udp};
use smoltcp::time::{Duration as SmolDuration, Instant as SmolInstant};
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpEndpoint, IpListenEndpoint};
use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tracing::{debug, info};

use crate::tunnel::TunnelError;

const PACKET_QUEUE: usize = 1024;
const COMMAND_QUEUE: usize = 256;
const STREAM_QUEUE: usize = 64;
const STREAM_CHUNK: usize = 16 * 1024;
const TCP_BUFFER: usize = 256 * 1024;
const TCP_TIMEOUT_SECS: u64 = 60;
const DNS_PACKET: usize = 2048;
const DNS_TIMEOUT: Duration = Duration::from_secs(5);
const IDLE_TICK: Duration = Duration::from_millis(100);
const PORT_FIRST: u16 = 40000;
const PORT_LAST: u16 = 65000;

/// Packet side of the stack, consumed by the device.
pub struct TunInterface {
    /// Decrypted packets headed into the stack
    pub(crate) to_stack: mpsc::Sender<Vec<u8>>,
    /// Packets the stack wants encrypted and sent
    pub(crate) from_stack: mpsc::Receiver<Vec<u8>>,
    mtu: u16,
}

impl TunInterface {
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// True once the stack task has exited.
    pub fn is_closed(&self) -> bool {
        self.to_stack.is_closed()
    }
}

/// Dialing handle for the stack task.
pub struct UserspaceStack {
    commands: mpsc::Sender<Command>,
    wake: Arc<Notify>,
    stopped: watch::Receiver<bool>,
    dns_servers: Vec<IpAddr>,
    has_ipv6: bool,
}

enum Command {
    Connect(ConnectRequest),
    Query(QueryRequest),
}

struct ConnectRequest {
    remote: SocketAddr,
    to_remote: mpsc::Receiver<Bytes>,
    to_client: mpsc::Sender<Bytes>,
    reply: oneshot::Sender<io::Result<()>>,
}

struct QueryRequest {
    server: IpAddr,
    payload: Vec<u8>,
    reply: oneshot::Sender<io::Result<Vec<u8>>>,
}

/// Start a stack for `local` addresses on the current runtime.
pub(crate) fn spawn(
    local: &[IpAddr],
    dns: &[IpAddr],
    mtu: u16,
) -> Result<(TunInterface, UserspaceStack), TunnelError> {
    let runtime = tokio::runtime::Handle::try_current()
        .map_err(|e| TunnelError::Interface(e.to_string()))?;

    let local_v4 = local.iter().find_map(|ip| match ip {
        IpAddr::V4(v4) => Some(*v4),
        IpAddr::V6(_) => None,
    });
    let local_v6 = local.iter().find_map(|ip| match ip {
        IpAddr::V6(v6) => Some(*v6),
        IpAddr::V4(_) => None,
    });

    let mut device = VirtualDevice::new(mtu);
    let mut iface = Interface::new(Config::new(HardwareAddress::Ip), &mut device, SmolInstant::now());
    iface.update_ip_addrs(|addrs| {
        for ip in local {
            let prefix = if ip.is_ipv4() { 32 } else { 128 };
            let _ = addrs.push(IpCidr::new(IpAddress::from(*ip), prefix));
        }
    });
    if local_v4.is_some() {
        let _ = iface.routes_mut().add_default_ipv4_route(Ipv4Addr::new(0, 0, 0, 1));
    }
    if local_v6.is_some() {
        let _ = iface
            .routes_mut()
            .add_default_ipv6_route(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1));
    }

    let (to_stack, inbound) = mpsc::channel(PACKET_QUEUE);
    let (outbound, from_stack) = mpsc::channel(PACKET_QUEUE);
    let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let (stopped_tx, stopped) = watch::channel(false);
    let wake = Arc::new(Notify::new());

    let dataplane = Dataplane {
        iface,
        device,
        sockets: SocketSet::new(vec![]),
        conns: Vec::new(),
        queries: Vec::new(),
        ports: PortAllocator::new(),
        local_v4,
        local_v6,
    };
    runtime.spawn(dataplane.run(inbound, outbound, command_rx, wake.clone(), stopped_tx));

    info!("Userspace stack started ({:?}, mtu {})", local, mtu);

    let interface = TunInterface {
        to_stack,
        from_stack,
        mtu,
    };
    let stack = UserspaceStack {
        commands,
        wake,
        stopped,
        dns_servers: dns.to_vec(),
        has_ipv6: local_v6.is_some(),
    };
    Ok((interface, stack))
}

#[async_trait]
impl NetStack for UserspaceStack {
    async fn dial(&self, addr: &str) -> io::Result<BoxedStream> {
        let (host, port) = split_host_port(addr)?;
        let ip = match host.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => self.resolve(host).await?,
        };
        let remote = SocketAddr::new(ip, port);

        let (to_remote_tx, to_remote_rx) = mpsc::channel(STREAM_QUEUE);
        let (to_client_tx, to_client_rx) = mpsc::channel(STREAM_QUEUE);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(Command::Connect(ConnectRequest {
            remote,
            to_remote: to_remote_rx,
            to_client: to_client_tx,
            reply: reply_tx,
        }))
        .await?;
        reply_rx.await.map_err(|_| stack_stopped())??;
        debug!("Connected to {} ({}) through tunnel", addr, remote);

        let (client, bridge) = tokio::io::duplex(STREAM_CHUNK * 4);
        tokio::spawn(bridge_stream(bridge, to_remote_tx, to_client_rx, self.wake.clone()));
        Ok(Box::new(client))
    }

    async fn closed(&self) {
        let mut stopped = self.stopped.clone();
        let _ = stopped.wait_for(|stopped| *stopped).await;
    }
}

impl UserspaceStack {
    async fn submit(&self, command: Command) -> io::Result<()> {
        self.commands.send(command).await.map_err(|_| stack_stopped())
    }

    /// A records first, then AAAA when the interface can reach IPv6.
    async fn resolve(&self, host: &str) -> io::Result<IpAddr> {
        let mut kinds = vec![RecordType::A];
        if self.has_ipv6 {
            kinds.push(RecordType::AAAA);
        }

        let mut last_error = None;
        for kind in kinds {
            for server in self.dns_servers.iter().copied() {
                match self.query(server, host, kind).await {
                    Ok(addrs) => {
                        if let Some(ip) = addrs.first() {
                            debug!("Resolved {} -> {} via {}", host, ip, server);
                            return Ok(*ip);
                        }
                    }
                    Err(e) => {
                        debug!("{} query for {} via {} failed: {}", kind, host, server, e);
                        last_error = Some(e);
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no addresses found for {host}"))
        }))
    }

    async fn query(&self, server: IpAddr, host: &str, kind: RecordType) -> io::Result<Vec<IpAddr>> {
        let id: u16 = rand::random();
        let payload = encode_query(host, kind, id)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(Command::Query(QueryRequest {
            server,
            payload,
            reply: reply_tx,
        }))
        .await?;

        let response = tokio::time::timeout(DNS_TIMEOUT + Duration::from_secs(1), reply_rx)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "DNS query timed out"))?
            .map_err(|_| stack_stopped())??;
        decode_answer(&response, id)
    }
}

fn stack_stopped() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "tunnel network stack stopped")
}

fn encode_query(host: &str, kind: RecordType, id: u16) -> io::Result<Vec<u8>> {
    let name = Name::from_ascii(host)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    message.add_query(Query::query(name, kind));
    message.to_vec().map_err(|e| io::Error::other(e.to_string()))
}

fn decode_answer(packet: &[u8], id: u16) -> io::Result<Vec<IpAddr>> {
    let message = Message::from_vec(packet)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    if message.id() != id {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "DNS response id mismatch"));
    }
    match message.response_code() {
        ResponseCode::NoError => {}
        ResponseCode::NXDomain => return Ok(Vec::new()),
        code => return Err(io::Error::other(format!("DNS query failed: {code}"))),
    }

    Ok(message
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect())
}

/// Copies between the caller's half of a duplex pipe and the dataplane's
/// channels. Dropping `to_remote` is how a client half-close reaches the
/// TCP socket.
async fn bridge_stream(
    stream: DuplexStream,
    to_remote: mpsc::Sender<Bytes>,
    mut to_client: mpsc::Receiver<Bytes>,
    wake: Arc<Notify>,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);

    let upload_wake = wake.clone();
    let upload = async move {
        let mut buf = vec![0u8; STREAM_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if to_remote.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        break;
                    }
                    upload_wake.notify_one();
                }
            }
        }
        drop(to_remote);
        upload_wake.notify_one();
    };

    let download = async move {
        while let Some(chunk) = to_client.recv().await {
            // room freed in the channel
            wake.notify_one();
            if writer.write_all(&chunk).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    };

    tokio::join!(upload, download);
}

struct Dataplane {
    iface: Interface,
    device: VirtualDevice,
    sockets: SocketSet<'static>,
    conns: Vec<Conn>,
    queries: Vec<PendingQuery>,
    ports: PortAllocator,
    local_v4: Option<Ipv4Addr>,
    local_v6: Option<Ipv6Addr>,
}

struct Conn {
    handle: SocketHandle,
    /// Present until the TCP handshake resolves
    reply: Option<oneshot::Sender<io::Result<()>>>,
    to_remote: mpsc::Receiver<Bytes>,
    /// Dropped once the remote side has finished sending
    to_client: Option<mpsc::Sender<Bytes>>,
    /// Client bytes the socket has not accepted yet
    pending: Option<Bytes>,
    write_closed: bool,
}

struct PendingQuery {
    handle: SocketHandle,
    reply: Option<oneshot::Sender<io::Result<Vec<u8>>>>,
    deadline: Instant,
}

impl Dataplane {
    async fn run(
        mut self,
        mut inbound: mpsc::Receiver<Vec<u8>>,
        outbound: mpsc::Sender<Vec<u8>>,
        mut commands: mpsc::Receiver<Command>,
        wake: Arc<Notify>,
        stopped: watch::Sender<bool>,
    ) {
        'serve: loop {
            while let Ok(packet) = inbound.try_recv() {
                self.device.rx.push_back(packet);
            }
            while let Ok(command) = commands.try_recv() {
                self.apply(command);
            }

            let now = SmolInstant::now();
            let _ = self.iface.poll(now, &mut self.device, &mut self.sockets);
            self.service();
            let _ = self.iface.poll(now, &mut self.device, &mut self.sockets);

            while let Some(packet) = self.device.tx.pop_front() {
                if outbound.send(packet).await.is_err() {
                    break 'serve;
                }
            }

            let delay = self
                .iface
                .poll_delay(SmolInstant::now(), &self.sockets)
                .map(|d| Duration::from_micros(d.total_micros()))
                .unwrap_or(IDLE_TICK)
                .min(IDLE_TICK);

            tokio::select! {
                packet = inbound.recv() => match packet {
                    Some(packet) => self.device.rx.push_back(packet),
                    None => break,
                },
                command = commands.recv() => match command {
                    Some(command) => self.apply(command),
                    None => break,
                },
                _ = wake.notified() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }

        // pending dials and queries see their reply channel drop
        self.conns.clear();
        self.queries.clear();
        let _ = stopped.send(true);
        info!("Userspace stack stopped");
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Connect(request) => self.connect(request),
            Command::Query(request) => self.query(request),
        }
    }

    fn local_for(&self, remote: IpAddr) -> io::Result<IpAddress> {
        let local = match remote {
            IpAddr::V4(_) => self.local_v4.map(IpAddress::Ipv4),
            IpAddr::V6(_) => self.local_v6.map(IpAddress::Ipv6),
        };
        local.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no local tunnel address can reach {remote}"),
            )
        })
    }

    fn connect(&mut self, request: ConnectRequest) {
        let local = match self.local_for(request.remote.ip()) {
            Ok(local) => local,
            Err(e) => {
                let _ = request.reply.send(Err(e));
                return;
            }
        };

        let mut socket = tcp::Socket::new(
            tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER]),
            tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER]),
        );
        socket.set_nagle_enabled(false);
        socket.set_ack_delay(None);
        socket.set_timeout(Some(SmolDuration::from_secs(TCP_TIMEOUT_SECS)));

        let remote = IpEndpoint::new(IpAddress::from(request.remote.ip()), request.remote.port());
        let local = IpListenEndpoint {
            addr: Some(local),
            port: self.ports.next(),
        };
        if let Err(e) = socket.connect(self.iface.context(), remote, local) {
            let _ = request
                .reply
                .send(Err(io::Error::other(format!("connect {}: {e:?}", request.remote))));
            return;
        }

        let handle = self.sockets.add(socket);
        self.conns.push(Conn {
            handle,
            reply: Some(request.reply),
            to_remote: request.to_remote,
            to_client: Some(request.to_client),
            pending: None,
            write_closed: false,
        });
    }

    fn query(&mut self, request: QueryRequest) {
        let local = match self.local_for(request.server) {
            Ok(local) => local,
            Err(e) => {
                let _ = request.reply.send(Err(e));
                return;
            }
        };

        let mut socket = udp::Socket::new(
            udp::PacketBuffer::new(vec![udp::PacketMetadata::EMPTY; 1], vec![0u8; DNS_PACKET]),
            udp::PacketBuffer::new(vec![udp::PacketMetadata::EMPTY; 1], vec![0u8; DNS_PACKET]),
        );
        let bind = IpListenEndpoint {
            addr: Some(local),
            port: self.ports.next(),
        };
        if let Err(e) = socket.bind(bind) {
            let _ = request.reply.send(Err(io::Error::other(format!("DNS bind: {e:?}"))));
            return;
        }
        let server = IpEndpoint::new(IpAddress::from(request.server), 53);
        if let Err(e) = socket.send_slice(&request.payload, server) {
            let _ = request.reply.send(Err(io::Error::other(format!("DNS send: {e:?}"))));
            return;
        }

        let handle = self.sockets.add(socket);
        self.queries.push(PendingQuery {
            handle,
            reply: Some(request.reply),
            deadline: Instant::now() + DNS_TIMEOUT,
        });
    }

    fn service(&mut self) {
        let sockets = &mut self.sockets;

        self.conns.retain_mut(|conn| {
            let keep = service_conn(conn, sockets.get_mut::<tcp::Socket>(conn.handle));
            if !keep {
                sockets.remove(conn.handle);
            }
            keep
        });

        let now = Instant::now();
        self.queries.retain_mut(|query| {
            let outcome = {
                let socket = sockets.get_mut::<udp::Socket>(query.handle);
                if socket.can_recv() {
                    Some(
                        socket
                            .recv()
                            .map(|(packet, _)| packet.to_vec())
                            .map_err(|e| io::Error::other(format!("DNS receive: {e:?}"))),
                    )
                } else if now >= query.deadline {
                    Some(Err(io::Error::new(io::ErrorKind::TimedOut, "DNS query timed out")))
                } else if query.reply.as_ref().is_none_or(|reply| reply.is_closed()) {
                    Some(Err(io::Error::other("DNS query abandoned")))
                } else {
                    None
                }
            };

            match outcome {
                Some(result) => {
                    if let Some(reply) = query.reply.take() {
                        let _ = reply.send(result);
                    }
                    sockets.remove(query.handle);
                    false
                }
                None => true,
            }
        });
    }
}

/// Move bytes between one TCP socket and its bridge channels.
/// Returns false once the connection can be dropped.
fn service_conn(conn: &mut Conn, socket: &mut tcp::Socket<'_>) -> bool {
    if let Some(reply) = conn.reply.take() {
        if socket.may_send() {
            let _ = reply.send(Ok(()));
        } else if !socket.is_open() {
            let _ = reply.send(Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
            return false;
        } else if reply.is_closed() {
            // dialer gave up
            socket.abort();
            return false;
        } else {
            conn.reply = Some(reply);
            return true;
        }
    }

    // remote -> client, only while the bridge has room
    while socket.can_recv() {
        let Some(to_client) = conn.to_client.as_ref() else {
            break;
        };
        let permit = match to_client.try_reserve() {
            Ok(permit) => permit,
            Err(TrySendError::Full(())) => break,
            Err(TrySendError::Closed(())) => {
                socket.abort();
                return false;
            }
        };
        match socket.recv(|buf| {
            let n = buf.len().min(STREAM_CHUNK);
            (n, Bytes::copy_from_slice(&buf[..n]))
        }) {
            Ok(chunk) if !chunk.is_empty() => permit.send(chunk),
            _ => break,
        }
    }
    if conn.to_client.is_some() && !socket.may_recv() && !socket.can_recv() {
        conn.to_client = None;
    }

    // client -> remote
    loop {
        if conn.pending.is_none() {
            match conn.to_remote.try_recv() {
                Ok(chunk) => conn.pending = Some(chunk),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if !conn.write_closed {
                        socket.close();
                        conn.write_closed = true;
                    }
                    break;
                }
            }
        }
        if !socket.can_send() {
            break;
        }
        let Some(chunk) = conn.pending.take() else {
            break;
        };
        match socket.send_slice(&chunk) {
            Ok(sent) if sent < chunk.len() => {
                conn.pending = Some(chunk.slice(sent..));
                break;
            }
            Ok(_) => {}
            Err(_) => {
                socket.abort();
                return false;
            }
        }
    }

    socket.is_open()
}

struct PortAllocator {
    next: u16,
}

impl PortAllocator {
    fn new() -> Self {
        Self {
            next: rand::thread_rng().gen_range(PORT_FIRST..=PORT_LAST),
        }
    }

    fn next(&mut self) -> u16 {
        let port = self.next;
        self.next = if port >= PORT_LAST { PORT_FIRST } else { port + 1 };
        port
    }
}

/// smoltcp device backed by two packet queues.
struct VirtualDevice {
    rx: VecDeque<Vec<u8>>,
    tx: VecDeque<Vec<u8>>,
    mtu: usize,
}

impl VirtualDevice {
    fn new(mtu: u16) -> Self {
        Self {
            rx: VecDeque::new(),
            tx: VecDeque::new(),
            mtu: mtu as usize,
        }
    }
}

struct VirtualRxToken(Vec<u8>);

impl RxToken for VirtualRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.0)
    }
}

struct VirtualTxToken<'a>(&'a mut VecDeque<Vec<u8>>);

impl<'a> TxToken for VirtualTxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut packet = vec![0u8; len];
        let result = f(&mut packet);
        self.0.push_back(packet);
        result
    }
}

impl Device for VirtualDevice {
    type RxToken<'a> = VirtualRxToken;
    type TxToken<'a> = VirtualTxToken<'a>;

    fn receive(&mut self, _timestamp: SmolInstant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let packet = self.rx.pop_front()?;
        Some((VirtualRxToken(packet), VirtualTxToken(&mut self.tx)))
    }

    fn transmit(&mut self, _timestamp: SmolInstant) -> Option<Self::TxToken<'_>> {
        Some(VirtualTxToken(&mut self.tx))
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps
    }
}
