//! Content rewrite engine
//!
//! Retargets URLs inside text payloads so that every reference back to the
//! upstream points at the gateway instead. Rewriting is pattern based and
//! runs in a fixed order:
//!
//! 1. the generic pass over every text category
//! 2. the HTML / CSS / JS specialization for the detected category
//! 3. user-defined replace rules
//!
//! Running the engine twice over its own output is a no-op.

mod css;
mod detect;
mod generic;
mod html;
mod js;
mod rules;

pub use detect::{detect_category, sniff, ContentCategory, SNIFF_LEN};
pub use rules::RuleSet;

pub(crate) use html::rewrite_refresh;

use std::borrow::Cow;

use regex::{Captures, Regex};
use tracing::trace;
use url::Url;

use crate::codec::UrlCodec;
use crate::models::{AddressingMode, Upstream};

/// Character class for URLs found in free text
pub(crate) const URL_CHAR: &str = r#"[^\s"'<>()\\`{}|^\[\]]"#;

/// Hosts whose URLs are identifiers rather than links
const PASSTHROUGH_HOSTS: &[&str] = &[
    "www.w3.org",
    "w3.org",
    "schema.org",
    "schemas.xmlsoap.org",
    "schemas.openxmlformats.org",
    "schemas.microsoft.com",
    "purl.org",
    "ogp.me",
    "xmlns.com",
    "ns.adobe.com",
    "www.inkscape.org",
    "creativecommons.org",
];

/// Everything the engine needs to know about one response
#[derive(Debug, Clone, Copy)]
pub struct RewriteContext<'a> {
    pub upstream: &'a Upstream,
    /// Gateway origin, e.g. `https://proxy.local`
    pub proxy_site: &'a str,
    /// Gateway host with port
    pub proxy_host: &'a str,
    pub codec: &'a UrlCodec,
    pub mode: AddressingMode,
    /// Upstream request path, used by rule filters
    pub request_path: &'a str,
    /// Declared content type, used by rule filters
    pub content_type: &'a str,
}

impl<'a> RewriteContext<'a> {
    /// Absolute gateway URL carrying `target` under the global prefix
    pub fn proxied(&self, target: &str) -> String {
        // Attribute values arrive HTML-escaped; the target itself must not be.
        let target = target.replace("&amp;", "&");
        self.codec.proxied_url(self.proxy_site, &target)
    }

    /// Whether a URL already addresses the gateway
    pub fn points_at_gateway(&self, value: &str) -> bool {
        if value.starts_with(self.codec.prefix()) {
            return true;
        }
        if value.starts_with("//") {
            let (host, _) = split_authority(&value[2..]);
            return host.eq_ignore_ascii_case(self.proxy_host);
        }
        match absolute_host(value) {
            Some(host) => host.eq_ignore_ascii_case(self.proxy_host),
            None => false,
        }
    }

    /// Rewrite an absolute http(s) URL; None leaves it untouched
    pub fn map_absolute(&self, url: &str) -> Option<String> {
        if self.points_at_gateway(url) {
            return None;
        }
        if let Some(rest) = strip_origin(url, &self.upstream.site) {
            return Some(match self.mode {
                AddressingMode::Fixed => format!("{}{}", self.proxy_site, rest),
                AddressingMode::Global => self.proxied(url),
            });
        }
        match absolute_host(url) {
            Some(host) if !is_passthrough_host(host) => Some(self.proxied(url)),
            _ => None,
        }
    }

    /// Rewrite a protocol-relative `//host/...` reference
    pub fn map_protocol_relative(&self, value: &str) -> Option<String> {
        let (host, rest) = split_authority(value.strip_prefix("//")?);
        if host.is_empty() || host.eq_ignore_ascii_case(self.proxy_host) {
            return None;
        }
        if host.eq_ignore_ascii_case(&self.upstream.host) && self.mode == AddressingMode::Fixed {
            return Some(format!("//{}{}", self.proxy_host, rest));
        }
        if is_passthrough_host(host) {
            return None;
        }
        Some(self.proxied(&format!("{}{}", self.upstream.protocol, value)))
    }

    /// Retarget a link value found in markup, CSS or script
    pub fn retarget(&self, value: &str) -> Option<String> {
        self.retarget_against(value, None)
    }

    /// Like [`retarget`](Self::retarget), resolving relative values against
    /// `base` instead of the upstream URL
    pub fn retarget_against(&self, value: &str, base: Option<&Url>) -> Option<String> {
        let value = value.trim();
        if value.is_empty() || value.starts_with('#') || self.points_at_gateway(value) {
            return None;
        }
        if is_http_absolute(value) {
            return self.map_absolute(value);
        }
        if value.starts_with("//") {
            return self.map_protocol_relative(value);
        }
        if has_scheme(value) {
            // data:, javascript:, mailto:, blob: ...
            return None;
        }
        if self.mode == AddressingMode::Fixed {
            // Root-relative and relative paths already resolve against the gateway.
            return None;
        }

        let joined = match base {
            Some(base) => base.join(value).ok()?,
            None if value.starts_with('/') => return Some(self.proxied(&self.upstream.join(value))),
            None => Url::parse(&self.upstream.url).ok()?.join(value).ok()?,
        };
        trace!(value, target = %joined, "Resolved relative reference");
        Some(self.proxied(joined.as_str()))
    }
}

/// Rewrites text payloads for one gateway configuration
#[derive(Debug, Default)]
pub struct RewriteEngine {
    rules: RuleSet,
    strict_boundaries: bool,
}

impl RewriteEngine {
    pub fn new(rules: RuleSet, strict_boundaries: bool) -> Self {
        Self {
            rules,
            strict_boundaries,
        }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Rewrite `content` of the given category; binary content is returned as is
    pub fn rewrite(&self, content: &str, category: ContentCategory, ctx: &RewriteContext<'_>) -> String {
        if !category.is_text() {
            return content.to_string();
        }

        let mut out = generic::rewrite(content, ctx, self.strict_boundaries).into_owned();
        let specialized = match category {
            ContentCategory::Html => html::rewrite(&out, ctx),
            ContentCategory::Css => css::rewrite(&out, ctx),
            ContentCategory::JavaScript => js::rewrite(&out, ctx),
            _ => Cow::Borrowed(out.as_str()),
        };
        if let Some(next) = changed(specialized) {
            out = next;
        }
        if let Some(next) = changed(self.rules.apply(&out, ctx)) {
            out = next;
        }
        out
    }
}

/// The new text, if a pass produced one
pub(crate) fn changed(pass: Cow<'_, str>) -> Option<String> {
    match pass {
        Cow::Owned(s) => Some(s),
        Cow::Borrowed(_) => None,
    }
}

/// Replace regex matches through a callback that may decline
///
/// The callback also sees the text following the match. Returning None keeps
/// the match as it was.
pub(crate) fn replace_with<'t, F>(re: &Regex, text: &'t str, mut f: F) -> Cow<'t, str>
where
    F: FnMut(&Captures<'_>, &str) -> Option<String>,
{
    let mut out = String::new();
    let mut last = 0;
    let mut replaced = false;
    for caps in re.captures_iter(text) {
        let Some(m) = caps.get(0) else { continue };
        if let Some(replacement) = f(&caps, &text[m.end()..]) {
            out.push_str(&text[last..m.start()]);
            out.push_str(&replacement);
            last = m.end();
            replaced = true;
        }
    }
    if !replaced {
        return Cow::Borrowed(text);
    }
    out.push_str(&text[last..]);
    Cow::Owned(out)
}

/// Split `host[:port]/rest` into the authority and the rest
pub(crate) fn split_authority(s: &str) -> (&str, &str) {
    let end = s.find(['/', '?', '#']).unwrap_or(s.len());
    (&s[..end], &s[end..])
}

/// `rest` after `origin` when `url` starts with it at a URL boundary
pub(crate) fn strip_origin<'u>(url: &'u str, origin: &str) -> Option<&'u str> {
    let head = url.get(..origin.len())?;
    if !head.eq_ignore_ascii_case(origin) {
        return None;
    }
    let rest = &url[origin.len()..];
    if rest.is_empty() || rest.starts_with(['/', '?', '#']) {
        Some(rest)
    } else {
        None
    }
}

/// Whether the text right after a host continues that host
pub(crate) fn continues_host(rest: &str) -> bool {
    let mut chars = rest.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') => true,
        Some(':') => chars.next().map_or(false, |c| c.is_ascii_digit()),
        _ => false,
    }
}

pub(crate) fn is_http_absolute(value: &str) -> bool {
    let lower = value.get(..8).unwrap_or(value).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Host (with port, without userinfo) of an absolute http(s) URL
pub(crate) fn absolute_host(url: &str) -> Option<&str> {
    if !is_http_absolute(url) {
        return None;
    }
    let after = &url[url.find("://")? + 3..];
    let (authority, _) = split_authority(after);
    Some(authority.rsplit_once('@').map_or(authority, |(_, host)| host))
}

fn is_passthrough_host(host: &str) -> bool {
    let host = crate::models::host_without_port(host);
    PASSTHROUGH_HOSTS.iter().any(|h| h.eq_ignore_ascii_case(host))
}

fn has_scheme(value: &str) -> bool {
    match value.find(':') {
        Some(idx) if idx > 0 => {
            let scheme = &value[..idx];
            scheme.starts_with(|c: char| c.is_ascii_alphabetic())
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        _ => false,
    }
}

/// Strip one layer of quotes, HTML-escaped ones included
pub(crate) fn unquote(value: &str) -> (&str, &str, &str) {
    for quote in ["&quot;", "&#39;", "\"", "'"] {
        if value.len() >= 2 * quote.len() && value.starts_with(quote) && value.ends_with(quote) {
            let inner = &value[quote.len()..value.len() - quote.len()];
            return (quote, inner, quote);
        }
    }
    ("", value, "")
}
