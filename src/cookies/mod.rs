//! Cookie translation between the gateway origin and upstream origins
//!
//! Upstream cookies are kept in a per-origin store and replayed to the
//! upstream; the client gets a copy re-scoped to the gateway's own host.

mod jar;
mod parse;

pub use jar::{domain_matches, origin_key, path_matches, CookieJar};
pub use parse::{parse_cookie_date, SetCookie};

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};
use url::Url;

use crate::models::{host_without_port, SameSite};

/// Bridges client-facing and upstream-facing cookie semantics
#[derive(Debug, Default)]
pub struct CookieTranslator {
    jar: CookieJar,
    /// Cookies injected for specific upstream hosts, keyed by hostname
    defaults: HashMap<String, Vec<(String, String)>>,
}

impl CookieTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(defaults: HashMap<String, Vec<(String, String)>>) -> Self {
        Self {
            jar: CookieJar::new(),
            defaults,
        }
    }

    pub fn jar(&self) -> &CookieJar {
        &self.jar
    }

    /// Remember the Set-Cookie headers an upstream response carried
    pub fn record_from_upstream(&self, set_cookie_headers: &[String], upstream_url: &str) {
        let Ok(url) = Url::parse(upstream_url) else {
            return;
        };
        let parsed: Vec<SetCookie> = set_cookie_headers
            .iter()
            .filter_map(|h| SetCookie::parse(h))
            .collect();
        if parsed.is_empty() {
            return;
        }
        debug!(origin = %origin_key(&url), count = parsed.len(), "Recording upstream cookies");
        self.jar.store(&url, &parsed);
    }

    /// Cookie header built purely from the store
    pub fn cookie_header_for(&self, upstream_url: &str) -> String {
        match Url::parse(upstream_url) {
            Ok(url) => self.jar.header_for(&url),
            Err(_) => String::new(),
        }
    }

    /// Cookie header for an upstream call
    ///
    /// Stored cookies come first. Client cookies the store does not know are
    /// appended, then configured default cookies for the host.
    pub fn upstream_cookie_header(
        &self,
        upstream_url: &str,
        client_cookies: Option<&str>,
    ) -> Option<String> {
        let url = Url::parse(upstream_url).ok()?;
        let stored = self.jar.matching(&url);

        let mut names: HashSet<String> = stored.iter().map(|c| c.name.clone()).collect();
        let mut pairs: Vec<String> = stored.iter().map(|c| c.pair()).collect();

        for pair in client_cookies.unwrap_or("").split(';') {
            let pair = pair.trim();
            let Some((name, _)) = pair.split_once('=') else {
                continue;
            };
            if !name.is_empty() && names.insert(name.to_string()) {
                pairs.push(pair.to_string());
            }
        }

        if let Some(defaults) = url.host_str().and_then(|h| self.defaults.get(h)) {
            for (name, value) in defaults {
                if names.insert(name.clone()) {
                    pairs.push(format!("{}={}", name, value));
                }
            }
        }

        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }

    /// Re-scope upstream Set-Cookie headers for the client
    ///
    /// Domain becomes the gateway host. Secure is cleared on a plain-HTTP
    /// gateway, and SameSite=None without Secure is downgraded to Lax.
    pub fn for_client(
        &self,
        set_cookie_headers: &[String],
        upstream_origin: &str,
        proxy_origin: &str,
    ) -> Vec<String> {
        let upstream_host = Url::parse(upstream_origin)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()));
        let (proxy_domain, proxy_is_plain) = proxy_cookie_scope(proxy_origin);

        set_cookie_headers
            .iter()
            .filter_map(|header| SetCookie::parse(header))
            .filter(|cookie| match (&cookie.domain, &upstream_host) {
                (Some(domain), Some(host)) => domain_matches(host, domain),
                _ => true,
            })
            .map(|mut cookie| {
                cookie.domain = proxy_domain.clone();
                if proxy_is_plain {
                    cookie.secure = false;
                }
                if cookie.same_site == Some(SameSite::None) && !cookie.secure {
                    cookie.same_site = Some(SameSite::Lax);
                }
                let value = cookie.to_header_value();
                trace!(cookie = %value, "Translated cookie for client");
                value
            })
            .collect()
    }
}

/// Domain attribute to use on the gateway, and whether it is plain HTTP
///
/// IP literals and `localhost` get host-only cookies, since browsers refuse a
/// Domain attribute there.
fn proxy_cookie_scope(proxy_origin: &str) -> (Option<String>, bool) {
    let plain = proxy_origin.starts_with("http://");
    let host = proxy_origin
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(proxy_origin);
    let host = host.split('/').next().unwrap_or(host);
    let host = host_without_port(host).to_ascii_lowercase();

    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() || host == "localhost" || bare.parse::<std::net::IpAddr>().is_ok() {
        (None, plain)
    } else {
        (Some(host), plain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_for_client_plain_http_drops_secure() {
        let translator = CookieTranslator::new();
        let out = translator.for_client(
            &headers(&["name=v; Domain=example.com; Secure"]),
            "https://example.com",
            "http://proxy.local",
        );
        assert_eq!(out, vec!["name=v; Domain=proxy.local".to_string()]);
    }

    #[test]
    fn test_for_client_https_keeps_secure() {
        let translator = CookieTranslator::new();
        let out = translator.for_client(
            &headers(&["name=v; Path=/; Secure; SameSite=None"]),
            "https://example.com",
            "https://proxy.local:8443",
        );
        assert_eq!(
            out,
            vec!["name=v; Domain=proxy.local; Path=/; Secure; SameSite=None".to_string()]
        );
    }

    #[test]
    fn test_for_client_downgrades_same_site_none() {
        let translator = CookieTranslator::new();
        let out = translator.for_client(
            &headers(&["name=v; Secure; SameSite=None"]),
            "https://example.com",
            "http://proxy.local",
        );
        assert_eq!(out, vec!["name=v; Domain=proxy.local; SameSite=Lax".to_string()]);
    }

    #[test]
    fn test_for_client_ip_gateway_is_host_only() {
        let translator = CookieTranslator::new();
        let out = translator.for_client(
            &headers(&["name=v; Domain=example.com"]),
            "https://example.com",
            "http://127.0.0.1:8080",
        );
        assert_eq!(out, vec!["name=v".to_string()]);
    }

    #[test]
    fn test_for_client_drops_foreign_domain() {
        let translator = CookieTranslator::new();
        let out = translator.for_client(
            &headers(&["a=1; Domain=tracker.net", "b=2"]),
            "https://example.com",
            "https://proxy.local",
        );
        assert_eq!(out, vec!["b=2; Domain=proxy.local".to_string()]);
    }

    #[test]
    fn test_record_then_cookie_header() {
        let translator = CookieTranslator::new();
        translator.record_from_upstream(
            &headers(&["sid=abc; Path=/", "pref=dark; Path=/settings"]),
            "https://example.com/login",
        );

        assert_eq!(translator.cookie_header_for("https://example.com/"), "sid=abc");
        assert_eq!(
            translator.cookie_header_for("https://example.com/settings/theme"),
            "pref=dark; sid=abc"
        );
        assert_eq!(translator.cookie_header_for("https://elsewhere.com/"), "");
    }

    #[test]
    fn test_upstream_header_merges_client_and_defaults() {
        let mut defaults = HashMap::new();
        defaults.insert(
            "example.com".to_string(),
            vec![("consent".to_string(), "yes".to_string()), ("sid".to_string(), "x".to_string())],
        );
        let translator = CookieTranslator::with_defaults(defaults);
        translator.record_from_upstream(&headers(&["sid=stored; Path=/"]), "https://example.com/");

        let header = translator
            .upstream_cookie_header("https://example.com/", Some("sid=client; theme=blue"))
            .unwrap();
        assert_eq!(header, "sid=stored; theme=blue; consent=yes");

        assert_eq!(translator.upstream_cookie_header("https://other.com/", None), None);
    }
}
