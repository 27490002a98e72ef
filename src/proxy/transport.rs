//! Upstream transport
//!
//! Two pooled hyper clients, one for plain HTTP and one for TLS, each bounded
//! by its own semaphore. Hostnames are resolved through a guard that refuses
//! private and loopback addresses, so a public name pointing inside the
//! network is rejected the same way an IP literal is.

use std::error::Error as StdError;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::header::HeaderMap;
use hyper::{Method, Request, Response, Uri};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::dns::{GaiResolver, Name};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;
use tokio::sync::Semaphore;
use tower::Service;
use tracing::{debug, instrument};

use crate::codec::is_blocked_ip;
use crate::config::PoolConfig;
use crate::error::GatewayError;

pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Body type shared by upstream responses and gateway responses
pub type GatewayBody = BoxBody<Bytes, BoxError>;

/// Wrap buffered bytes as a [`GatewayBody`]
pub fn full(content: impl Into<Bytes>) -> GatewayBody {
    Full::new(content.into()).map_err(|never| match never {}).boxed()
}

/// One call to an upstream
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    /// Absolute upstream URL
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamRequest {
    pub fn host(&self) -> Option<String> {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
    }
}

/// Transport failure category, used for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Dns,
    ConnectionRefused,
    ConnectionReset,
    Timeout,
    BrokenPipe,
    Protocol,
    /// The name resolved only to addresses the gateway must not reach
    Blocked,
    Tls,
    Other,
}

impl TransportErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportErrorKind::Dns
                | TransportErrorKind::ConnectionRefused
                | TransportErrorKind::ConnectionReset
                | TransportErrorKind::Timeout
                | TransportErrorKind::BrokenPipe
                | TransportErrorKind::Protocol
        )
    }
}

#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify any error by walking its source chain
    pub fn from_error(err: &(dyn StdError + 'static)) -> Self {
        Self::new(classify(err), error_chain(err))
    }

    /// Map to the error the client sees
    pub fn into_gateway_error(self, host: &str) -> GatewayError {
        match self.kind {
            TransportErrorKind::Dns => GatewayError::TargetNotFound(host.to_string()),
            TransportErrorKind::ConnectionRefused
            | TransportErrorKind::ConnectionReset
            | TransportErrorKind::BrokenPipe => {
                GatewayError::TargetConnectionRefused(format!("{}: {}", host, self.message))
            }
            TransportErrorKind::Timeout => GatewayError::RequestTimeout,
            TransportErrorKind::Blocked => GatewayError::AccessDenied(format!(
                "target host {} resolves to a blocked address",
                host
            )),
            TransportErrorKind::Protocol | TransportErrorKind::Tls | TransportErrorKind::Other => {
                GatewayError::UpstreamGatewayError {
                    status: 502,
                    message: self.message,
                }
            }
        }
    }
}

fn classify(err: &(dyn StdError + 'static)) -> TransportErrorKind {
    let mut source: Option<&(dyn StdError + 'static)> = Some(err);
    let mut fallback = TransportErrorKind::Other;

    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<io::Error>() {
            match io.kind() {
                io::ErrorKind::ConnectionRefused => return TransportErrorKind::ConnectionRefused,
                io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                    return TransportErrorKind::ConnectionReset
                }
                io::ErrorKind::BrokenPipe => return TransportErrorKind::BrokenPipe,
                io::ErrorKind::TimedOut => return TransportErrorKind::Timeout,
                io::ErrorKind::PermissionDenied => return TransportErrorKind::Blocked,
                io::ErrorKind::UnexpectedEof => fallback = TransportErrorKind::Protocol,
                _ => {}
            }
        }
        if let Some(h) = e.downcast_ref::<hyper::Error>() {
            if h.is_parse() || h.is_incomplete_message() || h.is_closed() {
                fallback = TransportErrorKind::Protocol;
            }
            if h.is_timeout() {
                return TransportErrorKind::Timeout;
            }
        }

        let text = e.to_string().to_ascii_lowercase();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return TransportErrorKind::Dns;
        }
        if text.contains("certificate") || text.contains("tls") || text.contains("handshake") {
            fallback = TransportErrorKind::Tls;
        }
        source = e.source();
    }
    fallback
}

fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(e) = source {
        let text = e.to_string();
        if !parts.contains(&text) {
            parts.push(text);
        }
        source = e.source();
    }
    parts.join(": ")
}

/// Sends one upstream request; implemented by the pooled client and by test doubles
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: UpstreamRequest) -> Result<Response<GatewayBody>, TransportError>;
}

/// DNS resolver that drops blocked addresses
#[derive(Clone)]
pub struct GuardedResolver {
    inner: GaiResolver,
}

impl GuardedResolver {
    pub fn new() -> Self {
        Self {
            inner: GaiResolver::new(),
        }
    }
}

impl Default for GuardedResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<Name> for GuardedResolver {
    type Response = std::vec::IntoIter<SocketAddr>;
    type Error = io::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, name: Name) -> Self::Future {
        let host = name.as_str().to_string();
        let resolving = self.inner.call(name);
        Box::pin(async move {
            let addrs: Vec<SocketAddr> = resolving.await?.collect();
            let allowed = filter_blocked(addrs);
            if allowed.is_empty() {
                debug!(host = %host, "Refusing host that resolves to blocked addresses");
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("{} resolves to a blocked address", host),
                ));
            }
            Ok(allowed.into_iter())
        })
    }
}

fn filter_blocked(addrs: Vec<SocketAddr>) -> Vec<SocketAddr> {
    addrs
        .into_iter()
        .filter(|addr| !is_blocked_ip(&addr.ip()))
        .collect()
}

type PlainClient = Client<HttpConnector<GuardedResolver>, Full<Bytes>>;
type TlsClient = Client<HttpsConnector<HttpConnector<GuardedResolver>>, Full<Bytes>>;

/// Pooled hyper transport
pub struct HyperTransport {
    plain: PlainClient,
    tls: TlsClient,
    plain_permits: Arc<Semaphore>,
    tls_permits: Arc<Semaphore>,
    request_timeout: Duration,
}

impl HyperTransport {
    pub fn new(config: &PoolConfig) -> Self {
        let mut http = HttpConnector::new_with_resolver(GuardedResolver::new());
        http.set_connect_timeout(Some(Duration::from_secs(config.connect_timeout)));
        http.set_keepalive(Some(Duration::from_secs(config.idle_timeout)));
        http.set_nodelay(true);

        let plain = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(config.idle_timeout))
            .pool_max_idle_per_host(config.max_idle_per_host)
            .build(http.clone());

        let mut tls_http = http;
        tls_http.enforce_http(false);
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_only()
            .enable_http1()
            .wrap_connector(tls_http);
        let tls = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(config.idle_timeout))
            .pool_max_idle_per_host(config.max_idle_per_host)
            .build(https);

        Self {
            plain,
            tls,
            plain_permits: Arc::new(Semaphore::new(config.max_concurrent)),
            tls_permits: Arc::new(Semaphore::new(config.max_concurrent)),
            request_timeout: Duration::from_secs(config.request_timeout),
        }
    }

    fn build_request(request: UpstreamRequest) -> Result<(bool, Request<Full<Bytes>>), TransportError> {
        let uri: Uri = request
            .url
            .parse()
            .map_err(|e| TransportError::new(TransportErrorKind::Other, format!("invalid upstream uri: {}", e)))?;
        let is_tls = uri.scheme_str() == Some("https");

        let mut req = Request::builder()
            .method(request.method)
            .uri(uri)
            .body(Full::new(request.body))
            .map_err(|e| TransportError::new(TransportErrorKind::Other, e.to_string()))?;
        *req.headers_mut() = request.headers;
        Ok((is_tls, req))
    }
}

#[async_trait]
impl Transport for HyperTransport {
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn send(&self, request: UpstreamRequest) -> Result<Response<GatewayBody>, TransportError> {
        let (is_tls, req) = Self::build_request(request)?;

        let permits = if is_tls { &self.tls_permits } else { &self.plain_permits };
        // Held until the response head arrives; the body is not counted.
        let _permit = permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| TransportError::new(TransportErrorKind::Other, e.to_string()))?;

        let pending = if is_tls {
            self.tls.request(req)
        } else {
            self.plain.request(req)
        };

        let response = match tokio::time::timeout(self.request_timeout, pending).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                let err = TransportError::from_error(&e);
                debug!(kind = ?err.kind, error = %err.message, "Upstream request failed");
                return Err(err);
            }
            Err(_) => {
                return Err(TransportError::new(
                    TransportErrorKind::Timeout,
                    format!("no response within {:?}", self.request_timeout),
                ))
            }
        };

        Ok(response.map(|body| body.map_err(|e| Box::new(e) as BoxError).boxed()))
    }
}
