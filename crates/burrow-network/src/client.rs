//! HTTP Client over a NetStack
//!
//! Uses hyper's HTTP/1.1 client connections on top of streams dialed
//! through a [`NetStack`], with rustls for `https` URLs. Used for the
//! post-connect health check; the proxy reuses [`open_http1`] for its
//! plain-request path.

use crate::stack::{BoxedStream, NetStack, join_host_port};
use http_body_util::{BodyExt, Empty, Limited};
use hyper::body::{Body, Bytes, Incoming};
use hyper::client::conn::http1::SendRequest;
use hyper::header::{HOST, HeaderMap, USER_AGENT};
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

/// HTTP client errors
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("unsupported protocol scheme {0:?}")]
    UnsupportedScheme(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request timeout")]
    Timeout,

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("body read error: {0}")]
    Body(String),
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Bound on the whole request: dial, TLS, head and body
    pub timeout: Duration,
    /// User-Agent string
    pub user_agent: String,
    /// Maximum response body size
    pub max_body_size: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: format!("burrow/{}", env!("CARGO_PKG_VERSION")),
            max_body_size: 1024 * 1024,
        }
    }
}

/// HTTP response wrapper
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Time from dial to last body byte
    pub elapsed: Duration,
}

impl Response {
    /// Check if response was successful (2xx)
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Get body as string
    pub fn text(&self) -> Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.body.to_vec())
    }
}

/// HTTP client that dials through a network stack
pub struct HttpClient {
    config: HttpClientConfig,
    stack: Arc<dyn NetStack>,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig, stack: Arc<dyn NetStack>) -> Self {
        debug!("HTTP client initialized (timeout: {:?})", config.timeout);
        Self { config, stack }
    }

    /// Perform a GET request
    pub async fn get(&self, url: &str) -> Result<Response, HttpError> {
        let uri = parse_url(url)?;

        tokio::time::timeout(self.config.timeout, self.fetch(uri))
            .await
            .map_err(|_| HttpError::Timeout)?
    }

    /// Perform a GET request and return once the response head arrives.
    ///
    /// The body is never read; the connection is dropped with it.
    pub async fn get_status(&self, url: &str) -> Result<StatusCode, HttpError> {
        let uri = parse_url(url)?;

        let start = Instant::now();
        let response = tokio::time::timeout(self.config.timeout, self.send_get(&uri))
            .await
            .map_err(|_| HttpError::Timeout)??;

        let status = response.status();
        info!("GET {} -> {} ({:?})", uri, status, start.elapsed());
        Ok(status)
    }

    async fn fetch(&self, uri: Uri) -> Result<Response, HttpError> {
        let start = Instant::now();
        let response = self.send_get(&uri).await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = Limited::new(response.into_body(), self.config.max_body_size)
            .collect()
            .await
            .map_err(|e| HttpError::Body(e.to_string()))?
            .to_bytes();

        let elapsed = start.elapsed();
        info!("GET {} -> {} ({} bytes, {:?})", uri, status, body.len(), elapsed);

        Ok(Response {
            status,
            headers,
            body,
            elapsed,
        })
    }

    async fn send_get(&self, uri: &Uri) -> Result<hyper::Response<Incoming>, HttpError> {
        let authority = uri
            .authority()
            .ok_or_else(|| HttpError::InvalidUrl("no host in URL".to_string()))?
            .to_string();

        let mut sender = open_http1::<Empty<Bytes>>(self.stack.as_ref(), uri).await?;

        let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .header(HOST, authority)
            .header(USER_AGENT, &self.config.user_agent)
            .body(Empty::new())
            .map_err(|e| HttpError::Http(e.to_string()))?;

        sender
            .send_request(request)
            .await
            .map_err(|e| HttpError::Http(e.to_string()))
    }
}

fn parse_url(url: &str) -> Result<Uri, HttpError> {
    url.parse()
        .map_err(|e: hyper::http::uri::InvalidUri| HttpError::InvalidUrl(e.to_string()))
}

/// Dial `uri`'s authority through `stack` and perform the HTTP/1.1
/// handshake, wrapping the stream in TLS for `https`.
///
/// The connection driver runs on its own task and ends when the
/// returned sender and any response bodies are dropped.
pub async fn open_http1<B>(stack: &dyn NetStack, uri: &Uri) -> Result<SendRequest<B>, HttpError>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let https = match uri.scheme_str() {
        Some("http") => false,
        Some("https") => true,
        other => return Err(HttpError::UnsupportedScheme(other.unwrap_or_default().to_string())),
    };
    let host = uri
        .host()
        .ok_or_else(|| HttpError::InvalidUrl("no host in URL".to_string()))?
        .trim_start_matches('[')
        .trim_end_matches(']');
    let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });

    let stream = stack
        .dial(&join_host_port(host, port))
        .await
        .map_err(|e| HttpError::ConnectionFailed(e.to_string()))?;

    let stream: BoxedStream = if https {
        Box::new(tls_handshake(host, stream).await?)
    } else {
        stream
    };

    let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| HttpError::Http(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Upstream connection error: {}", e);
        }
    });

    Ok(sender)
}

async fn tls_handshake(
    host: &str,
    stream: BoxedStream,
) -> Result<tokio_rustls::client::TlsStream<BoxedStream>, HttpError> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let tls_config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(tls_config));
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|_| HttpError::Tls(format!("invalid server name {host:?}")))?;

    connector
        .connect(server_name, stream)
        .await
        .map_err(|e| HttpError::Tls(e.to_string()))
}
