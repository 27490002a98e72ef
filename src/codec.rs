//! Global-mode URL codec and target validation
//!
//! Targets are carried as `/<global path>/<base64(absolute url)>`. The token is
//! standard base64, so it may itself contain `/`; everything after the prefix
//! belongs to the token.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use tracing::debug;
use url::{Host, Url};

use crate::error::{GatewayError, Result};

/// Encode an absolute URL into a path token
pub fn encode(url: &str) -> String {
    STANDARD.encode(url.as_bytes())
}

/// Decode a path token back into the absolute URL it carries
///
/// Falls back to reading the token as a percent-encoded URL, which is how
/// older links were written.
pub fn decode(token: &str) -> Result<String> {
    let token = token.trim();
    if token.is_empty() {
        return Err(GatewayError::InvalidTargetUrl("empty target".to_string()));
    }

    if let Some(url) = decode_base64(token) {
        return Ok(url);
    }

    // Some clients percent-encode '=' and '+' inside the path.
    if token.contains('%') {
        if let Ok(unescaped) = urlencoding::decode(token) {
            if let Some(url) = decode_base64(&unescaped) {
                return Ok(url);
            }
            if let Some(url) = as_absolute_url(&unescaped) {
                debug!("Decoded legacy percent-encoded target");
                return Ok(url);
            }
        }
    }

    if let Some(url) = as_absolute_url(token) {
        debug!("Decoded legacy plain target");
        return Ok(url);
    }

    Err(GatewayError::InvalidTargetUrl(format!(
        "cannot decode target: {}",
        truncate(token, 64)
    )))
}

fn decode_base64(token: &str) -> Option<String> {
    let bytes = STANDARD.decode(token).ok().or_else(|| {
        let trimmed = token.trim_end_matches('=');
        URL_SAFE_NO_PAD.decode(trimmed).ok()
    })?;
    let text = String::from_utf8(bytes).ok()?;
    as_absolute_url(&text)
}

fn as_absolute_url(candidate: &str) -> Option<String> {
    let lower = candidate.to_ascii_lowercase();
    if !(lower.starts_with("http:") || lower.starts_with("https:")) {
        return None;
    }

    // Path normalization in some clients collapses "https://" to "https:/".
    let repaired = match candidate.find(":/") {
        Some(idx) if !candidate[idx..].starts_with("://") => {
            format!("{}://{}", &candidate[..idx], &candidate[idx + 2..])
        }
        _ => candidate.to_string(),
    };

    let url = Url::parse(&repaired).ok()?;
    url.host_str().filter(|h| !h.is_empty())?;
    Some(repaired)
}

/// Reject targets the gateway must never reach
///
/// Only http(s) is allowed, and loopback, private, link-local and unspecified
/// addresses are refused before any connection is attempted.
pub fn validate(url: &str) -> Result<Url> {
    let parsed = Url::parse(url)?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(GatewayError::InvalidTargetUrl(format!(
                "unsupported scheme: {}",
                other
            )))
        }
    }

    let host = parsed
        .host()
        .ok_or_else(|| GatewayError::InvalidTargetUrl(format!("missing host: {}", url)))?;

    let blocked = match &host {
        Host::Domain(domain) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            domain == "localhost" || domain.ends_with(".localhost")
        }
        Host::Ipv4(ip) => is_blocked_ipv4(ip),
        Host::Ipv6(ip) => is_blocked_ipv6(ip),
    };

    if blocked {
        return Err(GatewayError::AccessDenied(format!(
            "target host {} is not reachable through the gateway",
            host
        )));
    }

    Ok(parsed)
}

/// Same check for an already-resolved address
pub fn is_blocked_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_ipv4(v4),
        IpAddr::V6(v6) => is_blocked_ipv6(v6),
    }
}

fn is_blocked_ipv4(ip: &Ipv4Addr) -> bool {
    ip.is_loopback()          // 127.0.0.0/8
        || ip.is_private()    // 10/8, 172.16/12, 192.168/16
        || ip.is_link_local() // 169.254/16
        || ip.octets()[0] == 0
}

fn is_blocked_ipv6(ip: &Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_blocked_ipv4(&v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xFE00) == 0xFC00 // fc00::/7
        || (first & 0xFFC0) == 0xFE80 // fe80::/10
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Codec bound to the configured global proxy path
#[derive(Debug, Clone)]
pub struct UrlCodec {
    /// `/<global path>/`
    prefix: String,
}

impl UrlCodec {
    pub fn new(global_path: &str) -> Self {
        let segment = global_path.trim_matches('/');
        Self {
            prefix: format!("/{}/", segment),
        }
    }

    /// `/<global path>/`
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Root-relative gateway path for a target
    pub fn encode_path(&self, url: &str) -> String {
        format!("{}{}", self.prefix, encode(url))
    }

    /// Absolute gateway URL for a target
    pub fn proxied_url(&self, proxy_site: &str, url: &str) -> String {
        format!("{}{}", proxy_site, self.encode_path(url))
    }

    /// Token carried by a gateway path, if the path is a global-mode path
    pub fn token<'a>(&self, path: &'a str) -> Option<&'a str> {
        path.strip_prefix(self.prefix.as_str())
            .filter(|token| !token.is_empty())
    }

    pub fn is_global_path(&self, path: &str) -> bool {
        self.token(path).is_some()
    }

    /// Decode and validate the target behind a gateway path
    ///
    /// A query string sent outside the token replaces the target's own query,
    /// which is what a GET form posted to an encoded action produces.
    pub fn resolve(&self, path: &str, outer_query: Option<&str>) -> Result<Url> {
        let token = self
            .token(path)
            .ok_or_else(|| GatewayError::InvalidTargetUrl(format!("not a proxy path: {}", path)))?;
        let target = decode(token)?;
        let mut url = validate(&target)?;
        if let Some(query) = outer_query.filter(|q| !q.is_empty()) {
            url.set_query(Some(query));
        }
        Ok(url)
    }
}
