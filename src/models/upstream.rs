use serde::Serialize;
use url::Url;

use crate::error::{GatewayError, Result};

/// A site being proxied.
///
/// `site` is always `protocol + "//" + host`, with no path and no trailing slash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Upstream {
    /// Original absolute URL the upstream was created from
    pub url: String,
    /// Origin, e.g. `https://example.com:8443`
    pub site: String,
    /// Host including a non-default port
    pub host: String,
    /// `http:` or `https:`
    pub protocol: String,
}

impl Upstream {
    /// Build an upstream from an absolute http(s) URL
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw.trim())?;
        Self::from_url(&url)
    }

    pub fn from_url(url: &Url) -> Result<Self> {
        let scheme = url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(GatewayError::InvalidTargetUrl(format!(
                "unsupported scheme: {}",
                scheme
            )));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| GatewayError::InvalidTargetUrl(format!("missing host: {}", url)))?;

        // Url::port() is None when the port is the scheme default.
        let host = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let protocol = format!("{}:", scheme);

        Ok(Self {
            url: url.to_string(),
            site: format!("{}//{}", protocol, host),
            host,
            protocol,
        })
    }

    /// Scheme without the trailing colon
    pub fn scheme(&self) -> &str {
        self.protocol.trim_end_matches(':')
    }

    pub fn is_https(&self) -> bool {
        self.protocol == "https:"
    }

    /// Host without the port
    pub fn hostname(&self) -> &str {
        host_without_port(&self.host)
    }

    /// Absolute URL for a path (and query) relative to this upstream
    pub fn join(&self, url_no_site: &str) -> String {
        if url_no_site.starts_with('/') {
            format!("{}{}", self.site, url_no_site)
        } else {
            format!("{}/{}", self.site, url_no_site)
        }
    }
}

impl std::fmt::Display for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.site)
    }
}

/// Strip a `:port` suffix, leaving bracketed IPv6 literals intact
pub fn host_without_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}
