//! Doubles for the tunnel boundary, shared by the unit tests.

use crate::tunnel::{DeviceLogLevel, TunnelDevice, TunnelError, TunnelFactory};
use async_trait::async_trait;
use burrow_network::{BoxedStream, DnsError, HostResolver, NetStack};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Resolver answering from a fixed table.
#[derive(Default)]
pub struct StaticResolver {
    answers: HashMap<String, Vec<Ipv4Addr>>,
}

impl StaticResolver {
    pub fn with(mut self, host: &str, addrs: &[Ipv4Addr]) -> Self {
        self.answers.insert(host.to_string(), addrs.to_vec());
        self
    }
}

#[async_trait]
impl HostResolver for StaticResolver {
    async fn lookup_ipv4(&self, host: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        match self.answers.get(host) {
            Some(addrs) if !addrs.is_empty() => Ok(addrs.clone()),
            Some(_) => Err(DnsError::NoAddresses(host.to_string())),
            None => Err(DnsError::ResolutionFailed(host.to_string(), "unknown host".to_string())),
        }
    }
}

/// Stack that dials the host network, for driving the proxy and the
/// health check against loopback servers.
pub struct LoopbackStack {
    dialed: Mutex<Vec<String>>,
    closed: watch::Sender<bool>,
}

impl LoopbackStack {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            dialed: Mutex::new(Vec::new()),
            closed: watch::channel(false).0,
        })
    }

    pub fn dialed(&self) -> Vec<String> {
        self.dialed.lock().unwrap().clone()
    }

    pub fn close(&self) {
        self.closed.send_replace(true);
    }
}

#[async_trait]
impl NetStack for LoopbackStack {
    async fn dial(&self, addr: &str) -> io::Result<BoxedStream> {
        self.dialed.lock().unwrap().push(addr.to_string());
        Ok(Box::new(TcpStream::connect(addr).await?))
    }

    async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

/// Everything the fake factory and its devices were asked to do.
#[derive(Default)]
pub struct FakeLog {
    pub creates: Vec<Instant>,
    pub created_with: Vec<(Vec<IpAddr>, Vec<IpAddr>, u16)>,
    pub log_levels: Vec<DeviceLogLevel>,
    pub configs: Vec<String>,
    pub ups: usize,
    pub closes: usize,
    create_failures: usize,
}

#[derive(Clone, Default)]
pub struct FakeFactory {
    log: Arc<Mutex<FakeLog>>,
    fail_ipc: bool,
    fail_up: bool,
    stack: Option<Arc<LoopbackStack>>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` calls to `create`.
    pub fn failing_creates(self, count: usize) -> Self {
        self.log.lock().unwrap().create_failures = count;
        self
    }

    pub fn failing_ipc(mut self) -> Self {
        self.fail_ipc = true;
        self
    }

    pub fn failing_up(mut self) -> Self {
        self.fail_up = true;
        self
    }

    pub fn with_stack(mut self, stack: Arc<LoopbackStack>) -> Self {
        self.stack = Some(stack);
        self
    }

    pub fn log(&self) -> MutexGuard<'_, FakeLog> {
        self.log.lock().unwrap()
    }
}

impl TunnelFactory for FakeFactory {
    type Interface = ();
    type Device = FakeDevice;

    fn create(
        &self,
        local: &[IpAddr],
        dns: &[IpAddr],
        mtu: u16,
    ) -> Result<((), Arc<dyn NetStack>), TunnelError> {
        let mut log = self.log.lock().unwrap();
        log.creates.push(Instant::now());
        log.created_with.push((local.to_vec(), dns.to_vec(), mtu));
        if log.create_failures > 0 {
            log.create_failures -= 1;
            return Err(TunnelError::Interface("simulated failure".to_string()));
        }
        let stack: Arc<dyn NetStack> = match &self.stack {
            Some(stack) => stack.clone(),
            None => LoopbackStack::new(),
        };
        Ok(((), stack))
    }

    fn create_device(&self, _interface: (), log_level: DeviceLogLevel) -> Result<FakeDevice, TunnelError> {
        self.log.lock().unwrap().log_levels.push(log_level);
        Ok(FakeDevice {
            log: self.log.clone(),
            fail_ipc: self.fail_ipc,
            fail_up: self.fail_up,
            closed: false,
        })
    }
}

pub struct FakeDevice {
    log: Arc<Mutex<FakeLog>>,
    fail_ipc: bool,
    fail_up: bool,
    closed: bool,
}

impl TunnelDevice for FakeDevice {
    fn ipc_set(&mut self, config: &str) -> Result<(), TunnelError> {
        self.log.lock().unwrap().configs.push(config.to_string());
        if self.fail_ipc {
            return Err(TunnelError::Configure("simulated failure".to_string()));
        }
        Ok(())
    }

    fn up(&mut self) -> Result<(), TunnelError> {
        if self.fail_up {
            return Err(TunnelError::Up("simulated failure".to_string()));
        }
        self.log.lock().unwrap().ups += 1;
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.log.lock().unwrap().closes += 1;
        }
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.close();
    }
}

/// Answer one connection with a canned response; the task yields the
/// request head it saw.
pub async fn http_upstream(
    response: impl AsRef<[u8]> + Send + 'static,
) -> (SocketAddr, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let head = read_until(&mut sock, b"\r\n\r\n").await;
        // the client may hang up before a long body is written
        let _ = sock.write_all(response.as_ref()).await;
        let _ = sock.shutdown().await;
        String::from_utf8(head).unwrap()
    });
    (addr, task)
}

/// Echo every byte back on each accepted connection.
pub async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut sock, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = sock.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// An address nothing listens on.
pub async fn closed_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Read until `pattern` shows up or the peer closes.
pub async fn read_until(sock: &mut TcpStream, pattern: &[u8]) -> Vec<u8> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    while !data.windows(pattern.len()).any(|w| w == pattern) {
        let n = sock.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
    }
    data
}
