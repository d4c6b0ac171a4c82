//! HTTP Forward Proxy
//!
//! A local HTTP proxy whose upstream connections are all dialed through
//! the tunnel's [`NetStack`].
//!
//! ```text
//! Client → HTTP proxy (127.0.0.1:8080) → NetStack::dial → WireGuard → Internet
//! ```
//!
//! - `CONNECT host:port` becomes an opaque byte tunnel.
//! - Absolute-form requests (`GET http://host/path`) are relayed with
//!   hop-by-hop headers removed and the client appended to
//!   `X-Forwarded-For`.
//!
//! The first request head on a connection is parsed by hand so a
//! `CONNECT` reply can be written byte for byte on the raw socket. Other
//! connections are handed to a hyper HTTP/1 server with the consumed
//! bytes replayed in front.

use burrow_network::{BoxedStream, NetStack, open_http1};
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::header::{CONNECTION, CONTENT_TYPE, HOST, HeaderMap, HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Largest request head accepted on a new connection
const MAX_HEAD: usize = 64 * 1024;
const MAX_HEADERS: usize = 128;

/// Pause after a failed accept
const ACCEPT_RETRY: Duration = Duration::from_millis(50);

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const RAW_BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const RAW_HEAD_TOO_LARGE: &[u8] =
    b"HTTP/1.1 431 Request Header Fields Too Large\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const RAW_SERVICE_UNAVAILABLE: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Removed from requests and responses before relaying
const HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Listen address (usually 127.0.0.1)
    pub listen_addr: SocketAddr,
    /// Accepted connections still sending their first request head.
    /// Accepting pauses at this limit; established tunnels do not count.
    pub max_pending: usize,
    /// Dial timeout for CONNECT tunnels
    pub connect_timeout: Duration,
    /// Dial plus response head timeout for relayed requests
    pub timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_pending: 256,
            connect_timeout: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
        }
    }
}

/// What every connection task needs
struct Upstream {
    stack: Arc<dyn NetStack>,
    connect_timeout: Duration,
    timeout: Duration,
}

impl Upstream {
    async fn dial_tunnel(&self, target: &str) -> io::Result<BoxedStream> {
        tokio::time::timeout(self.connect_timeout, self.stack.dial(target))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))?
    }
}

/// HTTP forward proxy over a tunnel stack
pub struct ForwardProxy {
    config: ProxyConfig,
    upstream: Arc<Upstream>,
    semaphore: Arc<Semaphore>,
}

impl ForwardProxy {
    pub fn new(config: ProxyConfig, stack: Arc<dyn NetStack>) -> Self {
        let upstream = Arc::new(Upstream {
            stack,
            connect_timeout: config.connect_timeout,
            timeout: config.timeout,
        });
        let semaphore = Arc::new(Semaphore::new(config.max_pending));
        Self {
            config,
            upstream,
            semaphore,
        }
    }

    /// Proxy URL for client configuration
    pub fn proxy_url(&self) -> String {
        format!("http://{}", self.config.listen_addr)
    }

    /// Bind the listen address and serve until the stack closes.
    pub async fn run(&self) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(self.config.listen_addr)
            .await
            .map_err(ProxyError::Bind)?;
        info!(
            "HTTP proxy listening on {} (max {} pending connections)",
            listener.local_addr().unwrap_or(self.config.listen_addr),
            self.config.max_pending
        );
        self.serve(listener).await
    }

    /// Accept loop on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ProxyError> {
        let mut stack_closed = self.upstream.stack.closed();

        loop {
            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    // the semaphore is never closed
                    Err(_) => return Ok(()),
                },
                _ = &mut stack_closed => return Err(ProxyError::StackClosed),
            };

            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = &mut stack_closed => return Err(ProxyError::StackClosed),
            };

            match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let upstream = self.upstream.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, upstream, permit).await {
                            debug!("Proxy connection from {} ended: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Accept error: {}", e);
                    tokio::time::sleep(ACCEPT_RETRY).await;
                }
            }
        }
    }
}

struct RequestHead {
    method: String,
    target: String,
    len: usize,
}

/// `Ok(None)` while the head is incomplete.
fn parse_head(buf: &[u8]) -> Result<Option<RequestHead>, ProxyError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => Ok(Some(RequestHead {
            method: req.method.unwrap_or_default().to_string(),
            target: req.path.unwrap_or_default().to_string(),
            len,
        })),
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(ProxyError::BadRequest(e.to_string())),
    }
}

async fn handle_connection(
    mut client: TcpStream,
    peer: SocketAddr,
    upstream: Arc<Upstream>,
    permit: OwnedSemaphorePermit,
) -> Result<(), ProxyError> {
    let mut buffered = Vec::with_capacity(4096);
    let head = loop {
        if client.read_buf(&mut buffered).await? == 0 {
            return Ok(());
        }
        match parse_head(&buffered) {
            Ok(Some(head)) => break head,
            Ok(None) if buffered.len() >= MAX_HEAD => {
                client.write_all(RAW_HEAD_TOO_LARGE).await?;
                return Err(ProxyError::HeadTooLarge);
            }
            Ok(None) => {}
            Err(e) => {
                client.write_all(RAW_BAD_REQUEST).await?;
                return Err(e);
            }
        }
    };
    drop(permit);

    if head.method == "CONNECT" {
        let early = buffered.split_off(head.len);
        return connect_raw(client, peer, &head.target, early, &upstream).await;
    }

    let io = Rewind::new(Bytes::from(buffered), client);
    let service = service_fn(move |req| {
        let upstream = upstream.clone();
        async move { Ok::<_, Infallible>(route(req, peer, &upstream).await) }
    });
    hyper::server::conn::http1::Builder::new()
        .keep_alive(true)
        .auto_date_header(false)
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades()
        .await?;
    Ok(())
}

/// `CONNECT` on a fresh connection. Bytes the client pipelined after the
/// head are sent upstream ahead of the spliced stream.
async fn connect_raw(
    mut client: TcpStream,
    peer: SocketAddr,
    target: &str,
    early: Vec<u8>,
    upstream: &Upstream,
) -> Result<(), ProxyError> {
    let mut tunnel = match upstream.dial_tunnel(target).await {
        Ok(tunnel) => tunnel,
        Err(e) => {
            warn!("CONNECT {} from {} failed: {}", target, peer, e);
            client.write_all(RAW_SERVICE_UNAVAILABLE).await?;
            return Ok(());
        }
    };

    client.write_all(CONNECT_ESTABLISHED).await?;
    if !early.is_empty() {
        tunnel.write_all(&early).await?;
    }
    debug!("CONNECT {} established for {}", target, peer);

    splice(client, tunnel).await;
    Ok(())
}

/// Copy both ways until the upstream side finishes. The client to
/// upstream direction runs on its own task and is torn down with it.
async fn splice<C, U>(client: C, upstream: U)
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let upload = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut client_read, &mut upstream_write).await;
        let _ = upstream_write.shutdown().await;
    });

    let _ = tokio::io::copy(&mut upstream_read, &mut client_write).await;
    let _ = client_write.shutdown().await;
    upload.abort();
}

async fn route(req: Request<Incoming>, peer: SocketAddr, upstream: &Upstream) -> Response<ProxyBody> {
    if req.method() == Method::CONNECT {
        connect_upgrade(req, peer, upstream).await
    } else {
        forward(req, peer, upstream).await
    }
}

/// `CONNECT` arriving after earlier requests on a keep-alive connection.
async fn connect_upgrade(req: Request<Incoming>, peer: SocketAddr, upstream: &Upstream) -> Response<ProxyBody> {
    let Some(target) = req.uri().authority().map(|a| a.to_string()) else {
        return status_response(StatusCode::BAD_REQUEST, "CONNECT target must be host:port");
    };
    let tunnel = match upstream.dial_tunnel(&target).await {
        Ok(tunnel) => tunnel,
        Err(e) => {
            warn!("CONNECT {} from {} failed: {}", target, peer, e);
            return status_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string());
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => splice(TokioIo::new(upgraded), tunnel).await,
            Err(e) => warn!("CONNECT {} upgrade for {} failed: {}", target, peer, e),
        }
    });

    let mut response = Response::new(empty());
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection Established"));
    response
}

/// Relay an absolute-form request through the tunnel.
async fn forward(mut req: Request<Incoming>, peer: SocketAddr, upstream: &Upstream) -> Response<ProxyBody> {
    let uri = req.uri().clone();
    if !matches!(uri.scheme_str(), Some("http" | "https")) {
        let scheme = uri.scheme_str().unwrap_or_default();
        return status_response(
            StatusCode::BAD_REQUEST,
            &format!("unsupported protocol scheme {scheme:?}"),
        );
    }
    let Some(authority) = uri.authority().cloned() else {
        return status_response(StatusCode::BAD_REQUEST, "missing host in request URI");
    };

    let method = req.method().clone();
    strip_hop_headers(req.headers_mut());
    append_forwarded_for(req.headers_mut(), peer.ip());
    if !req.headers().contains_key(HOST) {
        if let Ok(host) = HeaderValue::from_str(authority.as_str()) {
            req.headers_mut().insert(HOST, host);
        }
    }
    *req.uri_mut() = origin_form(&uri);

    let exchange = async {
        let mut sender = open_http1::<Incoming>(upstream.stack.as_ref(), &uri)
            .await
            .map_err(|e| e.to_string())?;
        sender.send_request(req).await.map_err(|e| e.to_string())
    };

    match tokio::time::timeout(upstream.timeout, exchange).await {
        Ok(Ok(mut response)) => {
            debug!("{} {} -> {} for {}", method, uri, response.status(), peer);
            strip_hop_headers(response.headers_mut());
            response.map(|body| body.boxed_unsync())
        }
        Ok(Err(e)) => {
            warn!("{} {} failed: {}", method, uri, e);
            status_response(StatusCode::BAD_GATEWAY, &e)
        }
        Err(_) => {
            warn!("{} {} timed out", method, uri);
            status_response(StatusCode::BAD_GATEWAY, "upstream timed out")
        }
    }
}

/// Drop hop-by-hop headers, including any the `Connection` header names.
fn strip_hop_headers(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_HEADERS {
        headers.remove(name);
    }
}

/// Prior values are kept byte for byte, joined with `, `.
fn append_forwarded_for(headers: &mut HeaderMap, client: IpAddr) {
    let mut value = Vec::new();
    for prior in headers.get_all(&X_FORWARDED_FOR) {
        value.extend_from_slice(prior.as_bytes());
        value.extend_from_slice(b", ");
    }
    value.extend_from_slice(client.to_string().as_bytes());
    if let Ok(value) = HeaderValue::from_bytes(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// `http://host/path?q` becomes `/path?q`.
fn origin_form(uri: &Uri) -> Uri {
    let target = match uri.query() {
        Some(query) => format!("{}?{}", uri.path(), query),
        None => uri.path().to_string(),
    };
    target.parse().unwrap_or_else(|_| Uri::from_static("/"))
}

fn empty() -> ProxyBody {
    Empty::new().map_err(|never| match never {}).boxed_unsync()
}

fn status_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(format!("{message}\n")))
        .map_err(|never| match never {})
        .boxed_unsync();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

/// Replays bytes already read from `inner` before reading from it again.
struct Rewind<T> {
    prefix: Option<Bytes>,
    inner: T,
}

impl<T> Rewind<T> {
    fn new(prefix: Bytes, inner: T) -> Self {
        Self {
            prefix: (!prefix.is_empty()).then_some(prefix),
            inner,
        }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Rewind<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(mut prefix) = self.prefix.take() {
            let n = prefix.len().min(buf.remaining());
            buf.put_slice(&prefix[..n]);
            let rest = prefix.split_off(n);
            if !rest.is_empty() {
                self.prefix = Some(rest);
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Rewind<T> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Proxy errors
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("failed to bind proxy listener: {0}")]
    Bind(io::Error),

    #[error("tunnel network stack closed")]
    StackClosed,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("request head too large")]
    HeadTooLarge,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
}
