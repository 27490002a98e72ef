//! Per-origin cookie store with RFC 6265 style scoping

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::debug;
use url::Url;

use super::parse::SetCookie;
use crate::models::StoredCookie;

/// Longest lifetime a Max-Age may grant (400 days, RFC 6265bis)
const MAX_AGE_CAP_SECS: i64 = 400 * 24 * 60 * 60;

/// Cookie store keyed by upstream origin
///
/// Writes for one origin are serialized by the map's shard lock.
#[derive(Debug, Default)]
pub struct CookieJar {
    origins: DashMap<String, Vec<StoredCookie>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self {
            origins: DashMap::new(),
        }
    }

    /// Store the cookies an upstream response set
    pub fn store(&self, url: &Url, set_cookies: &[SetCookie]) {
        let Some(host) = url.host_str().map(|h| h.to_ascii_lowercase()) else {
            return;
        };
        let now = Utc::now();
        let mut entry = self.origins.entry(origin_key(url)).or_default();

        for set_cookie in set_cookies {
            let (domain, host_only) = match &set_cookie.domain {
                Some(domain) if domain_matches(&host, domain) => (domain.clone(), false),
                Some(domain) => {
                    debug!(cookie = %set_cookie.name, domain = %domain, host = %host, "Ignoring cookie for foreign domain");
                    continue;
                }
                None => (host.clone(), true),
            };

            let path = match &set_cookie.path {
                Some(p) if p.starts_with('/') => p.clone(),
                _ => default_path(url.path()),
            };

            let expires = match set_cookie.max_age {
                Some(secs) => Some(expiry_after(now, secs)),
                None => set_cookie.expires,
            };

            entry.retain(|c| !(c.name == set_cookie.name && c.domain == domain && c.path == path));

            let cookie = StoredCookie {
                name: set_cookie.name.clone(),
                value: set_cookie.value.clone(),
                domain,
                host_only,
                path,
                secure: set_cookie.secure,
                http_only: set_cookie.http_only,
                same_site: set_cookie.same_site,
                expires,
            };

            // An already-expired cookie is a deletion.
            if !cookie.is_expired(now) {
                entry.push(cookie);
            }
        }

        entry.retain(|c| !c.is_expired(now));
        let emptied = entry.is_empty();
        drop(entry);

        if emptied {
            self.origins.remove_if(&origin_key(url), |_, cookies| cookies.is_empty());
        }
    }

    /// Cookies to send with a request to `url`, most specific path first
    pub fn matching(&self, url: &Url) -> Vec<StoredCookie> {
        let Some(host) = url.host_str().map(|h| h.to_ascii_lowercase()) else {
            return Vec::new();
        };
        let secure = url.scheme() == "https";
        let path = url.path();
        let now = Utc::now();

        let mut matched: Vec<StoredCookie> = self
            .origins
            .iter()
            .flat_map(|entry| entry.value().clone())
            .filter(|c| !c.is_expired(now))
            .filter(|c| !c.secure || secure)
            .filter(|c| {
                if c.host_only {
                    c.domain == host
                } else {
                    domain_matches(&host, &c.domain)
                }
            })
            .filter(|c| path_matches(path, &c.path))
            .collect();

        matched.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        matched
    }

    /// Serialized Cookie header for `url`
    pub fn header_for(&self, url: &Url) -> String {
        self.matching(url)
            .iter()
            .map(StoredCookie::pair)
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Drop expired cookies and empty origins
    pub fn prune(&self) {
        let now = Utc::now();
        self.origins.retain(|_, cookies| {
            cookies.retain(|c| !c.is_expired(now));
            !cookies.is_empty()
        });
    }

    pub fn origin_count(&self) -> usize {
        self.origins.len()
    }

    pub fn cookie_count(&self) -> usize {
        self.origins.iter().map(|e| e.value().len()).sum()
    }
}

/// `scheme://host[:port]`
pub fn origin_key(url: &Url) -> String {
    url.origin().ascii_serialization()
}

/// RFC 6265 §5.1.3 domain-match
pub fn domain_matches(host: &str, domain: &str) -> bool {
    if host == domain {
        return true;
    }
    // IP addresses only match exactly.
    if host.parse::<std::net::IpAddr>().is_ok() || host.starts_with('[') {
        return false;
    }
    host.len() > domain.len()
        && host.ends_with(domain)
        && host.as_bytes()[host.len() - domain.len() - 1] == b'.'
}

/// RFC 6265 §5.1.4 path-match
pub fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/')
            || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/'))
}

/// RFC 6265 §5.1.4 default-path
fn default_path(request_path: &str) -> String {
    if !request_path.starts_with('/') {
        return "/".to_string();
    }
    match request_path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => request_path[..idx].to_string(),
    }
}

/// Absolute expiry for a Max-Age, with non-positive values already expired
fn expiry_after(now: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
    if secs <= 0 {
        return now;
    }
    now + Duration::seconds(secs.min(MAX_AGE_CAP_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn parse_all(headers: &[&str]) -> Vec<SetCookie> {
        headers.iter().filter_map(|h| SetCookie::parse(h)).collect()
    }

    #[test]
    fn test_store_and_lookup() {
        let jar = CookieJar::new();
        jar.store(
            &url("https://example.com/login"),
            &parse_all(&["a=1; Path=/", "b=2; Path=/account"]),
        );

        assert_eq!(jar.header_for(&url("https://example.com/")), "a=1");
        assert_eq!(
            jar.header_for(&url("https://example.com/account/settings")),
            "b=2; a=1"
        );
        assert_eq!(jar.header_for(&url("https://other.com/")), "");
    }

    #[test]
    fn test_domain_cookie_reaches_subdomains() {
        let jar = CookieJar::new();
        jar.store(
            &url("https://www.example.com/"),
            &parse_all(&["shared=1; Domain=example.com; Path=/", "local=1; Path=/"]),
        );

        assert_eq!(jar.header_for(&url("https://api.example.com/")), "shared=1");
        let header = jar.header_for(&url("https://www.example.com/"));
        assert!(header.contains("shared=1"));
        assert!(header.contains("local=1"));
    }

    #[test]
    fn test_foreign_domain_is_ignored() {
        let jar = CookieJar::new();
        jar.store(
            &url("https://example.com/"),
            &parse_all(&["evil=1; Domain=bank.com"]),
        );
        assert_eq!(jar.cookie_count(), 0);
    }

    #[test]
    fn test_secure_cookie_not_sent_over_http() {
        let jar = CookieJar::new();
        jar.store(&url("https://example.com/"), &parse_all(&["s=1; Secure; Path=/"]));
        assert_eq!(jar.header_for(&url("http://example.com/")), "");
        assert_eq!(jar.header_for(&url("https://example.com/")), "s=1");
    }

    #[test]
    fn test_max_age_zero_deletes() {
        let jar = CookieJar::new();
        let target = url("https://example.com/");
        jar.store(&target, &parse_all(&["sid=1; Path=/"]));
        assert_eq!(jar.header_for(&target), "sid=1");

        jar.store(&target, &parse_all(&["sid=; Path=/; Max-Age=0"]));
        assert_eq!(jar.header_for(&target), "");
    }

    #[test]
    fn test_expired_cookie_is_pruned() {
        let jar = CookieJar::new();
        let target = url("https://example.com/");
        jar.store(
            &target,
            &parse_all(&["old=1; Path=/; Expires=Thu, 01 Jan 1970 00:00:00 GMT"]),
        );
        assert_eq!(jar.header_for(&target), "");
        jar.prune();
        assert_eq!(jar.origin_count(), 0);
    }

    #[test]
    fn test_huge_max_age_is_capped() {
        let jar = CookieJar::new();
        let target = url("https://example.com/");
        jar.store(&target, &parse_all(&["sid=1; Path=/; Max-Age=99999999999999999"]));
        assert_eq!(jar.header_for(&target), "sid=1");

        let expires = jar.matching(&target)[0].expires.unwrap();
        assert!(expires <= Utc::now() + Duration::days(400));
        assert!(expires > Utc::now() + Duration::days(399));

        jar.store(&target, &parse_all(&["sid=; Path=/; Max-Age=-99999999999999999"]));
        assert_eq!(jar.header_for(&target), "");
        assert_eq!(jar.origin_count(), 0);
    }

    #[test]
    fn test_prune_drops_expired_origins() {
        let jar = CookieJar::new();
        jar.store(&url("https://a.example/"), &parse_all(&["keep=1; Path=/"]));
        jar.store(&url("https://b.example/"), &parse_all(&["short=1; Path=/"]));
        jar.origins
            .get_mut("https://b.example")
            .unwrap()
            .iter_mut()
            .for_each(|c| c.expires = Some(Utc::now() - Duration::seconds(1)));
        assert_eq!(jar.origin_count(), 2);

        jar.prune();
        assert_eq!(jar.origin_count(), 1);
        assert_eq!(jar.header_for(&url("https://a.example/")), "keep=1");
        assert_eq!(jar.cookie_count(), 1);
    }

    #[test]
    fn test_replaces_same_name_domain_path() {
        let jar = CookieJar::new();
        let target = url("https://example.com/");
        jar.store(&target, &parse_all(&["sid=1; Path=/"]));
        jar.store(&target, &parse_all(&["sid=2; Path=/"]));
        assert_eq!(jar.header_for(&target), "sid=2");
        assert_eq!(jar.cookie_count(), 1);
    }

    #[test]
    fn test_default_path() {
        let jar = CookieJar::new();
        jar.store(&url("https://example.com/docs/page"), &parse_all(&["d=1"]));
        assert_eq!(jar.header_for(&url("https://example.com/docs/other")), "d=1");
        assert_eq!(jar.header_for(&url("https://example.com/")), "");
    }

    #[test]
    fn test_matching_helpers() {
        assert!(domain_matches("a.example.com", "example.com"));
        assert!(!domain_matches("badexample.com", "example.com"));
        assert!(!domain_matches("10.0.0.1", "0.0.1"));

        assert!(path_matches("/docs/a", "/docs"));
        assert!(path_matches("/docs/a", "/docs/"));
        assert!(!path_matches("/docsx", "/docs"));
    }

    #[tokio::test]
    async fn test_concurrent_writes_same_origin() {
        let jar = std::sync::Arc::new(CookieJar::new());
        let target = url("https://example.com/");

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let jar = jar.clone();
                let target = target.clone();
                tokio::spawn(async move {
                    let header = format!("c{}=v; Path=/", i);
                    jar.store(&target, &parse_all(&[header.as_str()]));
                })
            })
            .collect();
        futures::future::join_all(tasks).await;

        assert_eq!(jar.cookie_count(), 32);
    }
}
