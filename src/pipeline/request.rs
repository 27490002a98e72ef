use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, CONNECTION, CONTENT_LENGTH, COOKIE, HOST,
    ORIGIN, REFERER,
};
use regex::Regex;
use tracing::{debug, trace};
use url::Url;

use super::{target_url, RequestStage, StageResult};
use crate::codec::UrlCodec;
use crate::cookies::CookieTranslator;
use crate::error::GatewayError;
use crate::models::{ProxyRequest, Upstream};

/// Headers that only describe one connection
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Headers that would reveal the client behind the gateway
const FORWARDING: &[&str] = &[
    "forwarded",
    "via",
    "x-real-ip",
    "cf-connecting-ip",
    "true-client-ip",
];

const ACCEPTED_ENCODINGS: &str = "gzip, deflate, br";

pub(crate) fn is_hop_by_hop_header(name: &str) -> bool {
    HOP_BY_HOP.contains(&name)
}

/// Remove hop-by-hop headers, including those named by `Connection`
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    for name in listed {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Rejects requests whose upstream path matches a deny pattern
pub struct DenyListStage {
    patterns: Vec<Regex>,
}

impl DenyListStage {
    pub fn new(patterns: Vec<Regex>) -> Self {
        Self { patterns }
    }
}

impl RequestStage for DenyListStage {
    fn name(&self) -> &'static str {
        "deny_list"
    }

    fn apply(&self, _upstream: &Upstream, request: &mut ProxyRequest) -> StageResult {
        if let Some(re) = self
            .patterns
            .iter()
            .find(|re| re.is_match(&request.url_no_site))
        {
            debug!(path = %request.url_no_site, pattern = %re.as_str(), "Request denied");
            return Err(GatewayError::AccessDenied(request.upstream_path().to_string()).into());
        }
        Ok(())
    }
}

/// Points Host, Origin and Referer at the upstream and drops headers that
/// belong to the client connection
pub struct TargetHeadersStage {
    codec: UrlCodec,
}

impl TargetHeadersStage {
    pub fn new(codec: UrlCodec) -> Self {
        Self { codec }
    }

    /// Upstream URL a gateway referer stands for
    fn upstream_referer(&self, upstream: &Upstream, request: &ProxyRequest, referer: &str) -> Option<String> {
        let url = Url::parse(referer).ok()?;
        let host = match url.port() {
            Some(port) => format!("{}:{}", url.host_str()?, port),
            None => url.host_str()?.to_string(),
        };
        if !host.eq_ignore_ascii_case(&request.host) {
            return None;
        }

        if self.codec.is_global_path(url.path()) {
            return self
                .codec
                .resolve(url.path(), url.query())
                .ok()
                .map(String::from);
        }
        let path = match url.query() {
            Some(q) => format!("{}?{}", url.path(), q),
            None => url.path().to_string(),
        };
        Some(upstream.join(&path))
    }
}

impl RequestStage for TargetHeadersStage {
    fn name(&self) -> &'static str {
        "target_headers"
    }

    fn apply(&self, upstream: &Upstream, request: &mut ProxyRequest) -> StageResult {
        strip_hop_by_hop(&mut request.headers);
        for name in FORWARDING {
            request.headers.remove(*name);
        }
        let forwarded: Vec<HeaderName> = request
            .headers
            .keys()
            .filter(|name| name.as_str().starts_with("x-forwarded-"))
            .cloned()
            .collect();
        for name in forwarded {
            request.headers.remove(name);
        }
        request.headers.remove(CONTENT_LENGTH);

        request.headers.insert(
            HOST,
            HeaderValue::from_str(&upstream.host).context("upstream host is not a valid header")?,
        );
        if request.headers.contains_key(ORIGIN) {
            request.headers.insert(
                ORIGIN,
                HeaderValue::from_str(&upstream.site).context("upstream origin is not a valid header")?,
            );
        }

        let referer = request
            .headers
            .get(REFERER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let Some(referer) = referer {
            match self.upstream_referer(upstream, request, &referer) {
                Some(mapped) => {
                    trace!(from = %referer, to = %mapped, "Mapped referer");
                    request.headers.insert(
                        REFERER,
                        HeaderValue::from_str(&mapped).context("mapped referer is not a valid header")?,
                    );
                }
                None => {
                    request.headers.remove(REFERER);
                }
            }
        }

        request
            .headers
            .insert(ACCEPT_ENCODING, HeaderValue::from_static(ACCEPTED_ENCODINGS));
        Ok(())
    }
}

/// Adds configured headers for specific upstream hosts
pub struct DefaultHeadersStage {
    /// Lowercased host -> header name -> value
    host_headers: HashMap<String, HashMap<String, String>>,
}

impl DefaultHeadersStage {
    pub fn new(host_headers: HashMap<String, HashMap<String, String>>) -> Self {
        Self { host_headers }
    }
}

impl RequestStage for DefaultHeadersStage {
    fn name(&self) -> &'static str {
        "default_headers"
    }

    fn apply(&self, upstream: &Upstream, request: &mut ProxyRequest) -> StageResult {
        let host = upstream.host.to_ascii_lowercase();
        let headers = self
            .host_headers
            .get(&host)
            .or_else(|| self.host_headers.get(&upstream.hostname().to_ascii_lowercase()));
        let Some(headers) = headers else {
            return Ok(());
        };

        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name '{}' for {}", name, host))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for header '{}'", name))?;
            request.headers.insert(name, value);
        }
        Ok(())
    }
}

/// Replaces the client's Cookie header with the one the upstream expects
pub struct CookieStage {
    cookies: Arc<CookieTranslator>,
}

impl CookieStage {
    pub fn new(cookies: Arc<CookieTranslator>) -> Self {
        Self { cookies }
    }
}

impl RequestStage for CookieStage {
    fn name(&self) -> &'static str {
        "cookies"
    }

    fn apply(&self, upstream: &Upstream, request: &mut ProxyRequest) -> StageResult {
        let url = target_url(upstream, request);
        let header = self
            .cookies
            .upstream_cookie_header(&url, request.client_cookies());

        match &header {
            Some(value) => {
                request.headers.insert(
                    COOKIE,
                    HeaderValue::from_str(value).context("cookie header is not a valid header")?,
                );
            }
            None => {
                request.headers.remove(COOKIE);
            }
        }
        request.cookie_header = header;
        Ok(())
    }
}
