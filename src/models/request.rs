use bytes::Bytes;
use hyper::header::{HeaderMap, COOKIE};
use hyper::Method;

/// How the client addressed the upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressingMode {
    /// The configured base upstream, addressed by plain paths
    #[default]
    Fixed,
    /// An arbitrary target encoded under the global proxy path
    Global,
}

impl AddressingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressingMode::Fixed => "fixed",
            AddressingMode::Global => "global",
        }
    }
}

/// A client request translated for the upstream.
///
/// Created per inbound request and mutated in place by the request stages.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    /// Gateway origin the client addressed, e.g. `https://proxy.local`
    pub site: String,
    /// Gateway host (with port) the client addressed
    pub host: String,
    pub method: Method,
    pub headers: HeaderMap,
    /// Inbound path as seen by the gateway
    pub path: String,
    /// Inbound query string without the leading `?`
    pub query: Option<String>,
    /// Path and query on the upstream
    pub url_no_site: String,
    pub body: Option<Bytes>,
    /// Cookie header to send upstream, filled by the cookie stage
    pub cookie_header: Option<String>,
    pub mode: AddressingMode,
    pub client_ip: String,
    pub request_id: String,
}

impl ProxyRequest {
    pub fn new(site: impl Into<String>, host: impl Into<String>, method: Method, path: &str) -> Self {
        let (path, query) = match path.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (path.to_string(), None),
        };
        let url_no_site = match &query {
            Some(q) => format!("{}?{}", path, q),
            None => path.clone(),
        };

        Self {
            site: site.into(),
            host: host.into(),
            method,
            headers: HeaderMap::new(),
            path,
            query,
            url_no_site,
            body: None,
            cookie_header: None,
            mode: AddressingMode::Fixed,
            client_ip: String::new(),
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Whether the gateway itself is served over plain HTTP
    pub fn is_plain_http(&self) -> bool {
        self.site.starts_with("http://")
    }

    /// Upstream path without the query
    pub fn upstream_path(&self) -> &str {
        self.url_no_site
            .split_once('?')
            .map(|(p, _)| p)
            .unwrap_or(&self.url_no_site)
    }

    /// Cookie header the client sent to the gateway
    pub fn client_cookies(&self) -> Option<&str> {
        self.headers.get(COOKIE).and_then(|v| v.to_str().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_request_splits_query() {
        let req = ProxyRequest::new("https://proxy.local", "proxy.local", Method::GET, "/a/b?x=1&y=2");
        assert_eq!(req.path, "/a/b");
        assert_eq!(req.query.as_deref(), Some("x=1&y=2"));
        assert_eq!(req.url_no_site, "/a/b?x=1&y=2");
        assert_eq!(req.upstream_path(), "/a/b");
        assert!(!req.is_plain_http());
        assert!(!req.request_id.is_empty());
    }

    #[test]
    fn test_proxy_request_without_query() {
        let req = ProxyRequest::new("http://proxy.local", "proxy.local", Method::POST, "/submit");
        assert_eq!(req.query, None);
        assert_eq!(req.url_no_site, "/submit");
        assert!(req.is_plain_http());
    }
}
