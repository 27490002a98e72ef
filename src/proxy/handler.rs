//! Gateway request handler
//!
//! Translates an inbound request into a [`ProxyRequest`], runs it through the
//! pipeline and the connection manager, and turns the result back into a
//! client response. Large and media bodies are piped straight through.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::header::{HeaderMap, HeaderValue, HOST, LOCATION, REFERER};
use hyper::http::request::Parts;
use hyper::{Request, Response, StatusCode};
use tracing::{debug, error, instrument, warn};
use url::Url;

use crate::codec::validate;
use crate::error::{GatewayError, Result};
use crate::models::{AddressingMode, ProxyRequest, ProxyResponse, Upstream};
use crate::pipeline::target_url;
use crate::proxy::context::GatewayContext;
use crate::proxy::transport::{full, BoxError, GatewayBody, UpstreamRequest};

/// Where an inbound request should go
#[derive(Debug)]
enum Route {
    Upstream {
        upstream: Upstream,
        mode: AddressingMode,
        url_no_site: String,
    },
    /// Send the client to the gateway URL of a recovered target
    Redirect(String),
}

/// Handles gateway requests
#[derive(Clone)]
pub struct GatewayHandler {
    ctx: Arc<GatewayContext>,
}

impl GatewayHandler {
    pub fn new(ctx: Arc<GatewayContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<GatewayContext> {
        &self.ctx
    }

    /// Handle one inbound request; failures become JSON error responses
    #[instrument(skip(self, req, client_ip), fields(method = %req.method(), uri = %req.uri(), client_ip = %client_ip))]
    pub async fn handle<B>(&self, req: Request<B>, client_ip: String) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<BoxError>,
    {
        let request_id = uuid::Uuid::new_v4().to_string();
        match self.process(req, client_ip, &request_id).await {
            Ok(response) => response,
            Err(e) => {
                if e.is_server_error() {
                    error!(request_id = %request_id, error = %e, "Request failed");
                } else {
                    warn!(request_id = %request_id, error = %e, "Request rejected");
                }
                e.to_http_response(&request_id)
                    .map(|body| body.map_err(|never| match never {}).boxed())
            }
        }
    }

    async fn process<B>(
        &self,
        req: Request<B>,
        client_ip: String,
        request_id: &str,
    ) -> Result<Response<GatewayBody>>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<BoxError>,
    {
        let ctx = &self.ctx;
        let (parts, body) = req.into_parts();
        let host = request_host(&parts)?;
        let site = self.proxy_site(&parts.headers, &host);

        let (upstream, mode, url_no_site) = match self.route(&parts, &site, &host)? {
            Route::Upstream {
                upstream,
                mode,
                url_no_site,
            } => (upstream, mode, url_no_site),
            Route::Redirect(location) => {
                debug!(location = %location, "Recovered target from referer");
                return redirect(&location);
            }
        };

        let body = body
            .collect()
            .await
            .map_err(|e| {
                let e: BoxError = e.into();
                GatewayError::UnknownInternal(format!("failed to read request body: {}", e))
            })?
            .to_bytes();

        let mut request = ProxyRequest::new(site, host, parts.method.clone(), &url_no_site);
        request.path = parts.uri.path().to_string();
        request.query = parts.uri.query().map(str::to_string);
        request.headers = parts.headers;
        request.body = (!body.is_empty()).then_some(body);
        request.mode = mode;
        request.client_ip = client_ip;
        request.request_id = request_id.to_string();

        ctx.pipeline.run_request(&upstream, &mut request)?;

        let url = target_url(&upstream, &request);
        let fetched = ctx
            .manager
            .fetch(UpstreamRequest {
                method: request.method.clone(),
                url: url.clone(),
                headers: request.headers.clone(),
                body: request.body.clone().unwrap_or_default(),
            })
            .await?;

        if !fetched.solver_cookies.is_empty() {
            let set_cookies: Vec<String> = fetched
                .solver_cookies
                .iter()
                .map(|(name, value)| format!("{}={}; Path=/", name, value))
                .collect();
            ctx.cookies.record_from_upstream(&set_cookies, &url);
        }

        let (head, upstream_body) = fetched.response.into_parts();
        let mut response =
            ProxyResponse::new(head.status, head.headers, Bytes::new()).with_request(request);
        response.challenge_used = fetched.challenge_used;

        if ctx.streaming.should_stream(&url, &response.headers) {
            response.streamed = true;
            ctx.metrics().record_streamed();
            ctx.pipeline.run_response(&upstream, &mut response)?;
            debug!(status = %response.status, "Streaming upstream body");
            return Ok(emit(response, upstream_body));
        }

        response.content = upstream_body
            .collect()
            .await
            .map_err(|e| GatewayError::UpstreamGatewayError {
                status: 502,
                message: format!("failed to read upstream body: {}", e),
            })?
            .to_bytes();
        ctx.pipeline.run_response(&upstream, &mut response)?;

        debug!(
            status = %response.status,
            bytes = response.content.len(),
            rewritten = response.content_rewritten,
            category = ?response.category,
            "Request completed"
        );
        let content = response.content.clone();
        Ok(emit(response, full(content)))
    }

    /// Gateway origin as the client sees it
    fn proxy_site(&self, headers: &HeaderMap, host: &str) -> String {
        if let Some(origin) = &self.ctx.config.public_origin {
            return origin.clone();
        }
        let forwarded_https = headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().eq_ignore_ascii_case("https"))
            .unwrap_or(false);
        let scheme = if forwarded_https { "https" } else { "http" };
        format!("{}://{}", scheme, host)
    }

    fn route(&self, parts: &Parts, site: &str, host: &str) -> Result<Route> {
        let ctx = &self.ctx;
        let path = parts.uri.path();
        let query = parts.uri.query();

        if ctx.codec.is_global_path(path) {
            let target = ctx.codec.resolve(path, query)?;
            let upstream = Upstream::from_url(&target)?;
            let url_no_site = match target.query() {
                Some(q) => format!("{}?{}", target.path(), q),
                None => target.path().to_string(),
            };
            return Ok(Route::Upstream {
                upstream,
                mode: AddressingMode::Global,
                url_no_site,
            });
        }

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        // A root-relative request made by a globally proxied page.
        if let Some(page) = self.referer_target(&parts.headers, host) {
            let target = page.join(path_and_query)?;
            let target = validate(target.as_str())?;
            return Ok(Route::Redirect(ctx.codec.proxied_url(site, target.as_str())));
        }

        if let Some(upstream) = &ctx.config.upstream {
            let home = &ctx.config.home_path;
            let url_no_site = if path == "/" && home != "/" {
                match query {
                    Some(q) => format!("{}?{}", home, q),
                    None => home.clone(),
                }
            } else {
                path_and_query.to_string()
            };
            return Ok(Route::Upstream {
                upstream: upstream.clone(),
                mode: AddressingMode::Fixed,
                url_no_site,
            });
        }

        Err(GatewayError::InvalidTargetUrl(format!(
            "no upstream configured for {}",
            path
        )))
    }

    /// Target of a gateway page that referred this request, if it was global
    fn referer_target(&self, headers: &HeaderMap, host: &str) -> Option<Url> {
        let referer = Url::parse(headers.get(REFERER)?.to_str().ok()?).ok()?;
        let referer_host = match referer.port() {
            Some(port) => format!("{}:{}", referer.host_str()?, port),
            None => referer.host_str()?.to_string(),
        };
        if !referer_host.eq_ignore_ascii_case(host) {
            return None;
        }
        self.ctx.codec.resolve(referer.path(), None).ok()
    }
}

fn request_host(parts: &Parts) -> Result<String> {
    parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
        .filter(|h| !h.is_empty())
        .ok_or_else(|| GatewayError::InvalidTargetUrl("request has no Host".to_string()))
}

fn redirect(location: &str) -> Result<Response<GatewayBody>> {
    let mut response = Response::new(full(Bytes::new()));
    *response.status_mut() = StatusCode::TEMPORARY_REDIRECT;
    response.headers_mut().insert(
        LOCATION,
        HeaderValue::from_str(location)
            .map_err(|e| GatewayError::UnknownInternal(format!("invalid redirect: {}", e)))?,
    );
    Ok(response)
}

fn emit(response: ProxyResponse, body: GatewayBody) -> Response<GatewayBody> {
    let mut out = Response::new(body);
    *out.status_mut() = response.status;
    *out.headers_mut() = response.headers;
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::UrlCodec;
    use crate::config::GatewayConfig;
    use crate::proxy::context::test_support::{config, gateway_config};
    use crate::proxy::transport::test_support::{MockTransport, Reply};
    use crate::proxy::transport::TransportErrorKind;
    use http_body_util::Full;
    use hyper::header::{COOKIE, SET_COOKIE};

    fn handler(gateway: GatewayConfig, transport: Arc<MockTransport>) -> GatewayHandler {
        let ctx = GatewayContext::new(&config(gateway), transport, None).unwrap();
        GatewayHandler::new(Arc::new(ctx))
    }

    fn public(mut gateway: GatewayConfig) -> GatewayConfig {
        gateway.public_origin = Some("https://proxy.local".to_string());
        gateway
    }

    fn get(uri: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .uri(uri)
            .header(HOST, "proxy.local")
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    async fn body_text(response: Response<GatewayBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn codec() -> UrlCodec {
        UrlCodec::new("proxy")
    }

    #[tokio::test]
    async fn test_fixed_mode_rewrites_links() {
        let transport = Arc::new(MockTransport::new(vec![Reply::html(
            200,
            r#"<a href="https://example.com/a">x</a>"#,
        )]));
        let handler = handler(public(gateway_config()), transport.clone());

        let response = handler.handle(get("/"), "203.0.113.9".into()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let expected = r#"<a href="https://proxy.local/a">x</a>"#;
        assert_eq!(
            response.headers()["content-length"],
            expected.len().to_string().as_str()
        );
        assert_eq!(body_text(response).await, expected);

        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].url, "https://example.com/");
        assert_eq!(calls[0].headers[HOST], "example.com");
    }

    #[tokio::test]
    async fn test_denied_path_never_reaches_upstream() {
        let mut gateway = gateway_config();
        gateway.deny_patterns = vec!["^/admin".to_string()];
        let transport = Arc::new(MockTransport::default());
        let handler = handler(gateway, transport.clone());

        let response = handler.handle(get("/admin/panel"), "203.0.113.9".into()).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["error"], "access_denied");
        assert!(body["request_id"].is_string());
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_global_mode() {
        let transport = Arc::new(MockTransport::new(vec![Reply::html(
            200,
            r#"<img src="/logo.png">"#,
        )]));
        let handler = handler(public(gateway_config()), transport.clone());

        let uri = codec().encode_path("https://other.org/page?x=1");
        let response = handler.handle(get(&uri), "203.0.113.9".into()).await;
        assert_eq!(response.status(), StatusCode::OK);

        let expected = codec().proxied_url("https://proxy.local", "https://other.org/logo.png");
        assert_eq!(body_text(response).await, format!(r#"<img src="{}">"#, expected));
        assert_eq!(transport.calls()[0].url, "https://other.org/page?x=1");
        assert_eq!(transport.calls()[0].headers[HOST], "other.org");
    }

    #[tokio::test]
    async fn test_private_target_is_refused() {
        let transport = Arc::new(MockTransport::default());
        let handler = handler(gateway_config(), transport.clone());

        for target in ["http://127.0.0.1/", "http://localhost:8080/", "http://[::1]/"] {
            let response = handler
                .handle(get(&codec().encode_path(target)), "203.0.113.9".into())
                .await;
            assert_eq!(response.status(), StatusCode::FORBIDDEN, "{}", target);
        }
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_undecodable_target() {
        let transport = Arc::new(MockTransport::default());
        let handler = handler(gateway_config(), transport.clone());

        let response = handler.handle(get("/proxy/!!!"), "203.0.113.9".into()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_referer_recovery_redirects() {
        let mut gateway = public(gateway_config());
        gateway.upstream = None;
        let transport = Arc::new(MockTransport::default());
        let handler = handler(gateway, transport.clone());

        let referer = codec().proxied_url("https://proxy.local", "https://other.org/app/page");
        let req = Request::builder()
            .uri("/static/app.js?v=2")
            .header(HOST, "proxy.local")
            .header(REFERER, referer)
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = handler.handle(req, "203.0.113.9".into()).await;

        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            response.headers()[LOCATION],
            codec()
                .proxied_url("https://proxy.local", "https://other.org/static/app.js?v=2")
                .as_str()
        );
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_no_upstream_configured() {
        let mut gateway = gateway_config();
        gateway.upstream = None;
        let handler = handler(gateway, Arc::new(MockTransport::default()));

        let response = handler.handle(get("/anything"), "203.0.113.9".into()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_home_path() {
        let mut gateway = gateway_config();
        gateway.home_path = "/index.html".to_string();
        let transport = Arc::new(MockTransport::default());
        let handler = handler(gateway, transport.clone());

        handler.handle(get("/?lang=en"), "203.0.113.9".into()).await;
        handler.handle(get("/about"), "203.0.113.9".into()).await;
        let calls = transport.calls();
        assert_eq!(calls[0].url, "https://example.com/index.html?lang=en");
        assert_eq!(calls[1].url, "https://example.com/about");
    }

    #[tokio::test]
    async fn test_streamed_body_passes_through() {
        let payload = "https://example.com/ stays as-is";
        let transport = Arc::new(MockTransport::new(vec![Reply::ok(payload)]));
        let handler = handler(public(gateway_config()), transport.clone());

        let response = handler.handle(get("/media/clip.mp4"), "203.0.113.9".into()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, payload);
        assert_eq!(handler.context().metrics().snapshot().streamed_responses, 1);
    }

    #[tokio::test]
    async fn test_cookie_round_trip() {
        let transport = Arc::new(MockTransport::new(vec![
            Reply::Respond(
                StatusCode::OK,
                vec![("set-cookie", "sid=42; Path=/; Domain=example.com".to_string())],
                Bytes::new(),
            ),
            Reply::ok(""),
        ]));
        let handler = handler(public(gateway_config()), transport.clone());

        let response = handler.handle(get("/login"), "203.0.113.9".into()).await;
        let set_cookie = response.headers()[SET_COOKIE].to_str().unwrap().to_string();
        assert!(set_cookie.contains("sid=42"));
        assert!(set_cookie.contains("Domain=proxy.local"));

        handler.handle(get("/account"), "203.0.113.9".into()).await;
        assert_eq!(transport.calls()[1].headers[COOKIE], "sid=42");
    }

    #[tokio::test]
    async fn test_upstream_failure_is_json_error() {
        let transport = Arc::new(MockTransport::new(vec![
            Reply::Fail(TransportErrorKind::ConnectionRefused),
            Reply::Fail(TransportErrorKind::ConnectionRefused),
        ]));
        let handler = handler(gateway_config(), transport.clone());

        let response = handler.handle(get("/"), "203.0.113.9".into()).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()["content-type"], "application/json");
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_forwarded_proto_sets_proxy_scheme() {
        let transport = Arc::new(MockTransport::new(vec![Reply::html(
            200,
            r#"<a href="https://example.com/a">x</a>"#,
        )]));
        let handler = handler(gateway_config(), transport.clone());

        let req = Request::builder()
            .uri("/")
            .header(HOST, "gw.test:8443")
            .header("x-forwarded-proto", "https")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = handler.handle(req, "203.0.113.9".into()).await;
        assert_eq!(body_text(response).await, r#"<a href="https://gw.test:8443/a">x</a>"#);
        assert!(!transport.calls()[0].headers.contains_key("x-forwarded-proto"));
    }
}
