//! Set-Cookie header parsing and serialization

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use crate::models::SameSite;

/// A parsed `Set-Cookie` header value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
    /// Expires attribute as sent, re-emitted verbatim
    pub expires_raw: Option<String>,
    pub expires: Option<DateTime<Utc>>,
    pub max_age: Option<i64>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<SameSite>,
    /// Attributes the gateway does not interpret (Priority, Partitioned, ...)
    pub extra: Vec<String>,
}

impl SetCookie {
    /// Parse a header value; returns None when there is no `name=value` pair
    pub fn parse(header: &str) -> Option<Self> {
        let mut parts = header.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = SetCookie {
            name: name.to_string(),
            value: value.trim().to_string(),
            domain: None,
            path: None,
            expires_raw: None,
            expires: None,
            max_age: None,
            secure: false,
            http_only: false,
            same_site: None,
            extra: Vec::new(),
        };

        for attr in parts {
            let attr = attr.trim();
            if attr.is_empty() {
                continue;
            }
            let (key, val) = match attr.split_once('=') {
                Some((k, v)) => (k.trim(), Some(v.trim())),
                None => (attr, None),
            };

            match (key.to_ascii_lowercase().as_str(), val) {
                ("domain", Some(v)) if !v.is_empty() => {
                    cookie.domain = Some(v.trim_start_matches('.').to_ascii_lowercase());
                }
                ("path", Some(v)) => cookie.path = Some(v.to_string()),
                ("expires", Some(v)) => {
                    cookie.expires = parse_cookie_date(v);
                    cookie.expires_raw = Some(v.to_string());
                }
                ("max-age", Some(v)) => cookie.max_age = v.parse().ok(),
                ("secure", _) => cookie.secure = true,
                ("httponly", _) => cookie.http_only = true,
                ("samesite", Some(v)) => cookie.same_site = SameSite::from_str(v),
                _ => cookie.extra.push(attr.to_string()),
            }
        }

        Some(cookie)
    }

    /// Serialize back into a `Set-Cookie` header value
    pub fn to_header_value(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        if let Some(domain) = &self.domain {
            out.push_str("; Domain=");
            out.push_str(domain);
        }
        if let Some(path) = &self.path {
            out.push_str("; Path=");
            out.push_str(path);
        }
        if let Some(expires) = &self.expires_raw {
            out.push_str("; Expires=");
            out.push_str(expires);
        }
        if let Some(max_age) = self.max_age {
            out.push_str(&format!("; Max-Age={}", max_age));
        }
        if self.secure {
            out.push_str("; Secure");
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        if let Some(same_site) = self.same_site {
            out.push_str("; SameSite=");
            out.push_str(same_site.as_str());
        }
        for attr in &self.extra {
            out.push_str("; ");
            out.push_str(attr);
        }
        out
    }
}

/// Parse the date formats seen in the wild for `Expires`
pub fn parse_cookie_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    const FORMATS: &[&str] = &[
        "%a, %d %b %Y %H:%M:%S GMT",
        "%a, %d-%b-%Y %H:%M:%S GMT",
        "%a, %d-%b-%y %H:%M:%S GMT",
        "%A, %d-%b-%y %H:%M:%S GMT",
        "%a %b %e %H:%M:%S %Y",
    ];
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}
