//! Gateway front-end using hyper
//!
//! Accepts client connections and hands each request to the [`GatewayHandler`].

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::error::{GatewayError, Result};
use crate::proxy::context::GatewayContext;
use crate::proxy::handler::GatewayHandler;
use crate::proxy::middleware::RateLimiter;

/// How often idle rate limiter entries and expired cookies are swept
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Gateway server
pub struct GatewayServer {
    addr: String,
    handler: Arc<GatewayHandler>,
    rate_limiter: RateLimiter,
}

impl GatewayServer {
    pub fn new(ctx: Arc<GatewayContext>) -> Self {
        let addr = format!("{}:{}", ctx.config.host, ctx.config.port);
        let rate_limiter = RateLimiter::from_config(&ctx.config);
        Self {
            addr,
            handler: Arc::new(GatewayHandler::new(ctx)),
            rate_limiter,
        }
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Bind and serve until `shutdown` flips to true
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = self
            .addr
            .parse()
            .map_err(|e| GatewayError::InvalidConfig(format!("gateway address {}: {}", self.addr, e)))?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener
    #[instrument(skip(self, listener, shutdown))]
    pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Gateway listening on {}", listener.local_addr()?);

        let limiter = self.rate_limiter.clone();
        let cookies = self.handler.context().cookies.clone();
        let mut maintenance_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if limiter.is_enabled() {
                            limiter.cleanup();
                        }
                        cookies.jar().prune();
                    }
                    _ = maintenance_shutdown.changed() => {
                        if *maintenance_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let handler = self.handler.clone();
                            let rate_limiter = self.rate_limiter.clone();

                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(
                                    stream,
                                    client_addr,
                                    handler,
                                    rate_limiter,
                                ).await {
                                    debug!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle a single connection
    async fn handle_connection(
        stream: tokio::net::TcpStream,
        client_addr: SocketAddr,
        handler: Arc<GatewayHandler>,
        rate_limiter: RateLimiter,
    ) -> Result<()> {
        let io = TokioIo::new(stream);
        let client_ip = client_addr.ip().to_string();

        let service = service_fn(move |req: Request<Incoming>| {
            let handler = handler.clone();
            let rate_limiter = rate_limiter.clone();
            let client_ip = client_ip.clone();

            async move {
                if let Err(e) = rate_limiter.check(&client_ip) {
                    let request_id = uuid::Uuid::new_v4().to_string();
                    return Ok::<_, Infallible>(
                        e.to_http_response(&request_id)
                            .map(|body| body.map_err(|never| match never {}).boxed()),
                    );
                }

                Ok(handler.handle(req, client_ip).await)
            }
        });

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(io, service)
            .await
            .map_err(|e| GatewayError::UnknownInternal(format!("connection failed: {}", e)))?;

        Ok(())
    }
}
