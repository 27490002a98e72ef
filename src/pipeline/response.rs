use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use hyper::header::{
    HeaderName, HeaderValue, ACCESS_CONTROL_ALLOW_CREDENTIALS,
    ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_LOCATION,
    CONTENT_TYPE, ETAG, LINK, LOCATION, SET_COOKIE, TRANSFER_ENCODING, VARY,
};
use hyper::{Method, StatusCode};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use super::decompress::decompress;
use super::request::strip_hop_by_hop;
use super::{rewrite_context, target_url, ResponseStage, StageResult};
use crate::codec::UrlCodec;
use crate::cookies::CookieTranslator;
use crate::models::{ProxyResponse, Upstream};
use crate::rewrite::{detect_category, rewrite_refresh, RewriteEngine, SNIFF_LEN};

/// Upstream headers that would stop the page working from the gateway origin
const SECURITY_HEADERS: &[&str] = &[
    "content-security-policy",
    "content-security-policy-report-only",
    "x-frame-options",
    "strict-transport-security",
    "cross-origin-opener-policy",
    "cross-origin-embedder-policy",
    "cross-origin-resource-policy",
    "alt-svc",
    "public-key-pins",
    "expect-ct",
    "report-to",
    "nel",
];

static LINK_TARGET: Lazy<Regex> = Lazy::new(|| Regex::new(r"<([^>]*)>").unwrap());

/// Undo Content-Encoding so later stages see plain bytes
pub struct DecompressStage;

impl ResponseStage for DecompressStage {
    fn name(&self) -> &'static str {
        "decompress"
    }

    fn apply(&self, _upstream: &Upstream, response: &mut ProxyResponse) -> StageResult {
        if response.streamed || response.content.is_empty() {
            return Ok(());
        }
        let Some(encoding) = response
            .headers
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
        else {
            return Ok(());
        };

        match decompress(&response.content, &encoding) {
            Ok(plain) => {
                debug!(encoding = %encoding, from = response.content.len(), to = plain.len(), "Decompressed body");
                response.content = Bytes::from(plain);
            }
            Err(e) => {
                warn!(encoding = %encoding, error = %e, "Failed to decompress body, passing it through");
            }
        }
        // Either way the client must not try to decode it again.
        response.headers.remove(CONTENT_ENCODING);
        response.headers.remove(CONTENT_LENGTH);
        Ok(())
    }
}

/// Drops headers that break proxied pages and retargets URL-bearing headers
pub struct HeaderSanitizerStage {
    codec: UrlCodec,
}

impl HeaderSanitizerStage {
    pub fn new(codec: UrlCodec) -> Self {
        Self { codec }
    }
}

impl ResponseStage for HeaderSanitizerStage {
    fn name(&self) -> &'static str {
        "header_sanitizer"
    }

    fn apply(&self, upstream: &Upstream, response: &mut ProxyResponse) -> StageResult {
        strip_hop_by_hop(&mut response.headers);
        for name in SECURITY_HEADERS {
            response.headers.remove(*name);
        }

        let Some(request) = response.request.as_ref() else {
            return Ok(());
        };
        let ctx = rewrite_context(upstream, request, &self.codec, "");

        let mut updates: Vec<(HeaderName, String)> = Vec::new();
        for name in [LOCATION, CONTENT_LOCATION] {
            if let Some(value) = response.headers.get(&name).and_then(|v| v.to_str().ok()) {
                if let Some(target) = ctx.retarget(value) {
                    updates.push((name, target));
                }
            }
        }
        if let Some(value) = response.headers.get("refresh").and_then(|v| v.to_str().ok()) {
            if let Some(target) = rewrite_refresh(value, &ctx, None) {
                updates.push((HeaderName::from_static("refresh"), target));
            }
        }
        let links: Vec<String> = response
            .headers
            .get_all(LINK)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(|value| {
                LINK_TARGET
                    .replace_all(value, |caps: &regex::Captures<'_>| {
                        match ctx.retarget(&caps[1]) {
                            Some(target) => format!("<{}>", target),
                            None => caps[0].to_string(),
                        }
                    })
                    .into_owned()
            })
            .collect();

        let cors_origin = HeaderValue::from_str(&request.site).context("gateway origin is not a valid header")?;

        for (name, value) in updates {
            debug!(header = %name, to = %value, "Retargeted response header");
            response.headers.insert(
                name,
                HeaderValue::from_str(&value).context("retargeted header is not valid")?,
            );
        }
        if !links.is_empty() {
            response.headers.remove(LINK);
            for link in links {
                response
                    .headers
                    .append(LINK, HeaderValue::from_str(&link).context("link header is not valid")?);
            }
        }

        response.headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, cors_origin);
        response
            .headers
            .insert(ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
        response.headers.append(VARY, HeaderValue::from_static("Origin"));
        Ok(())
    }
}

/// Runs the rewrite engine over text bodies
pub struct ContentRewriteStage {
    engine: Arc<RewriteEngine>,
    codec: UrlCodec,
}

impl ContentRewriteStage {
    pub fn new(engine: Arc<RewriteEngine>, codec: UrlCodec) -> Self {
        Self { engine, codec }
    }
}

impl ResponseStage for ContentRewriteStage {
    fn name(&self) -> &'static str {
        "content_rewrite"
    }

    fn apply(&self, upstream: &Upstream, response: &mut ProxyResponse) -> StageResult {
        if response.streamed || response.content.is_empty() {
            return Ok(());
        }
        let sample = &response.content[..response.content.len().min(SNIFF_LEN)];
        let category = detect_category(&response.headers, sample);
        response.category = Some(category);

        if !category.is_text() {
            return Ok(());
        }
        let Some(request) = response.request.as_ref() else {
            return Ok(());
        };
        let Ok(text) = std::str::from_utf8(&response.content) else {
            debug!(category = %category, "Skipping rewrite of non UTF-8 body");
            return Ok(());
        };

        let content_type = response
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(category.as_str());
        let ctx = rewrite_context(upstream, request, &self.codec, content_type);
        let rewritten = self.engine.rewrite(text, category, &ctx);

        if rewritten != text {
            debug!(category = %category, from = text.len(), to = rewritten.len(), "Rewrote body");
            response.content = Bytes::from(rewritten);
            response.content_rewritten = true;
        }
        Ok(())
    }
}

/// Stores upstream cookies and re-scopes them for the client
pub struct SetCookieStage {
    cookies: Arc<CookieTranslator>,
}

impl SetCookieStage {
    pub fn new(cookies: Arc<CookieTranslator>) -> Self {
        Self { cookies }
    }
}

impl ResponseStage for SetCookieStage {
    fn name(&self) -> &'static str {
        "set_cookie"
    }

    fn apply(&self, upstream: &Upstream, response: &mut ProxyResponse) -> StageResult {
        let values: Vec<String> = response
            .headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect();
        if values.is_empty() {
            return Ok(());
        }
        let Some(request) = response.request.as_ref() else {
            return Ok(());
        };

        self.cookies
            .record_from_upstream(&values, &target_url(upstream, request));
        let translated = self.cookies.for_client(&values, &upstream.site, &request.site);

        response.headers.remove(SET_COOKIE);
        for value in translated {
            response.headers.append(
                SET_COOKIE,
                HeaderValue::from_str(&value).context("translated cookie is not a valid header")?,
            );
        }
        Ok(())
    }
}

/// Keeps caches from storing responses that no longer match the upstream
pub struct CacheControlStage;

impl ResponseStage for CacheControlStage {
    fn name(&self) -> &'static str {
        "cache_control"
    }

    fn apply(&self, _upstream: &Upstream, response: &mut ProxyResponse) -> StageResult {
        if response.content_rewritten {
            response.headers.remove(ETAG);
            response.headers.remove("content-md5");
        }

        if response.status.as_u16() >= 400 {
            response
                .headers
                .insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
            return Ok(());
        }

        if response.headers.contains_key(SET_COOKIE) {
            let current = response
                .headers
                .get(CACHE_CONTROL)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if let Some(value) = private_cache_control(current) {
                response.headers.insert(
                    CACHE_CONTROL,
                    HeaderValue::from_str(&value).context("cache-control is not a valid header")?,
                );
            }
        }
        Ok(())
    }
}

/// Cache-Control for a cookie-bearing response, if it needs changing
fn private_cache_control(current: &str) -> Option<String> {
    let directives: Vec<&str> = current
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .collect();
    if directives
        .iter()
        .any(|d| d.eq_ignore_ascii_case("private") || d.eq_ignore_ascii_case("no-store"))
    {
        return None;
    }

    let mut out = vec!["private"];
    out.extend(
        directives
            .into_iter()
            .filter(|d| !d.eq_ignore_ascii_case("public") && !d.to_ascii_lowercase().starts_with("s-maxage")),
    );
    Some(out.join(", "))
}

/// Gives bodyless error responses a readable page
pub struct ErrorPageStage;

impl ResponseStage for ErrorPageStage {
    fn name(&self) -> &'static str {
        "error_page"
    }

    fn apply(&self, _upstream: &Upstream, response: &mut ProxyResponse) -> StageResult {
        if response.streamed || response.status.as_u16() < 400 || !response.content.is_empty() {
            return Ok(());
        }
        if response.request.as_ref().map(|r| r.method == Method::HEAD).unwrap_or(false) {
            return Ok(());
        }

        response.content = Bytes::from(error_page(response.status, response.request_path()));
        response.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        response.headers.remove(CONTENT_ENCODING);
        Ok(())
    }
}

fn error_page(status: StatusCode, path: &str) -> String {
    let title = format!(
        "{} {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Error")
    );
    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{title}</title></head>\
         <body><h1>{title}</h1><p>The upstream site returned an error for <code>{path}</code>.</p>\
         </body></html>\n",
        title = title,
        path = escape_html(path),
    )
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Sets Content-Length for the buffered body
pub struct FinalizeStage;

impl ResponseStage for FinalizeStage {
    fn name(&self) -> &'static str {
        "finalize"
    }

    fn apply(&self, _upstream: &Upstream, response: &mut ProxyResponse) -> StageResult {
        response.is_redirect = response.status.is_redirection();
        if response.streamed {
            return Ok(());
        }
        response.headers.remove(TRANSFER_ENCODING);

        let status = response.status;
        if status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
            response.headers.remove(CONTENT_LENGTH);
            return Ok(());
        }
        let is_head = response
            .request
            .as_ref()
            .map(|r| r.method == Method::HEAD)
            .unwrap_or(false);
        if is_head && !response.content_rewritten {
            // Keep the upstream's length for a body that was never sent.
            return Ok(());
        }

        response
            .headers
            .insert(CONTENT_LENGTH, HeaderValue::from(response.content.len()));
        Ok(())
    }
}
