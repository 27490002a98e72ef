//! Generic URL pass, applied to every text category

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;

use super::{continues_host, replace_with, RewriteContext, URL_CHAR};
use crate::models::AddressingMode;

static ABSOLUTE_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"(?i)\bhttps?://{}+", URL_CHAR)).unwrap());

/// `https:\/\/host\/path` as found inside JSON and script strings
static ESCAPED_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\bhttps?:\\/\\/[^\s"'<>()`{}|^\[\]]+"#).unwrap());

const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?'];

pub(super) fn rewrite<'t>(text: &'t str, ctx: &RewriteContext<'_>, strict: bool) -> Cow<'t, str> {
    let mut out = Cow::Borrowed(text);

    if ctx.mode == AddressingMode::Fixed {
        let site = &ctx.upstream.site;
        if let Some(next) = super::changed(replace_origin(&out, site, ctx.proxy_site, strict)) {
            out = Cow::Owned(next);
        }
        let escaped_site = site.replace('/', "\\/");
        let escaped_proxy = ctx.proxy_site.replace('/', "\\/");
        if let Some(next) =
            super::changed(replace_origin(&out, &escaped_site, &escaped_proxy, strict))
        {
            out = Cow::Owned(next);
        }
    }

    if let Some(next) = super::changed(protocol_relative(&out, ctx, strict)) {
        out = Cow::Owned(next);
    }
    if let Some(next) = super::changed(absolute_urls(&out, ctx)) {
        out = Cow::Owned(next);
    }
    if let Some(next) = super::changed(escaped_urls(&out, ctx)) {
        out = Cow::Owned(next);
    }
    out
}

/// Literal origin replacement
///
/// Legacy behavior replaces every occurrence. In strict mode an occurrence
/// followed by more host characters (`example.com.evil.net`) or another port
/// is left alone.
fn replace_origin<'t>(text: &'t str, from: &str, to: &str, strict: bool) -> Cow<'t, str> {
    if from.is_empty() || !text.contains(from) {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for (idx, _) in text.match_indices(from) {
        let end = idx + from.len();
        if strict && continues_host(&text[end..]) {
            continue;
        }
        out.push_str(&text[last..idx]);
        out.push_str(to);
        last = end;
    }
    if last == 0 {
        return Cow::Borrowed(text);
    }
    out.push_str(&text[last..]);
    Cow::Owned(out)
}

/// `//upstream-host` references outside of a full URL
fn protocol_relative<'t>(text: &'t str, ctx: &RewriteContext<'_>, strict: bool) -> Cow<'t, str> {
    let needle = format!("//{}", ctx.upstream.host);
    if !text.contains(&needle) {
        return Cow::Borrowed(text);
    }

    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for (idx, _) in text.match_indices(&needle) {
        if idx < last {
            continue;
        }
        // "https://host" is a full URL, "a//host" is a path.
        let prev = text[..idx].chars().next_back();
        if prev.map_or(false, |c| c.is_alphanumeric() || matches!(c, ':' | '/' | '\\')) {
            continue;
        }
        let after = &text[idx + needle.len()..];

        let (replacement, end) = match ctx.mode {
            AddressingMode::Fixed => {
                if strict && continues_host(after) {
                    continue;
                }
                (format!("//{}", ctx.proxy_host), idx + needle.len())
            }
            AddressingMode::Global => {
                if continues_host(after) {
                    continue;
                }
                let value = url_extent(&text[idx..]);
                match ctx.map_protocol_relative(value) {
                    Some(mapped) => (mapped, idx + value.len()),
                    None => continue,
                }
            }
        };

        out.push_str(&text[last..idx]);
        out.push_str(&replacement);
        last = end;
    }
    if last == 0 {
        return Cow::Borrowed(text);
    }
    out.push_str(&text[last..]);
    Cow::Owned(out)
}

/// Every absolute http(s) URL not already addressing the gateway
fn absolute_urls<'t>(text: &'t str, ctx: &RewriteContext<'_>) -> Cow<'t, str> {
    replace_with(&ABSOLUTE_URL, text, |caps, _| {
        let found = caps.get(0)?.as_str();
        let url = found.trim_end_matches(TRAILING_PUNCTUATION);
        let tail = &found[url.len()..];
        ctx.map_absolute(url).map(|mapped| format!("{}{}", mapped, tail))
    })
}

fn escaped_urls<'t>(text: &'t str, ctx: &RewriteContext<'_>) -> Cow<'t, str> {
    replace_with(&ESCAPED_URL, text, |caps, _| {
        let found = caps.get(0)?.as_str();
        let url = found.trim_end_matches(|c| TRAILING_PUNCTUATION.contains(&c) || c == '\\');
        let tail = &found[url.len()..];
        let plain = url.replace("\\/", "/").replace("\\u0026", "&");
        ctx.map_absolute(&plain)
            .map(|mapped| format!("{}{}", mapped.replace('/', "\\/"), tail))
    })
}

/// Longest URL-shaped prefix of `text`, without trailing punctuation
fn url_extent(text: &str) -> &str {
    let end = text
        .char_indices()
        .find(|&(_, c)| {
            c.is_whitespace() || matches!(c, '"' | '\'' | '<' | '>' | '(' | ')' | '\\' | '`' | '{' | '}' | '|' | '^' | '[' | ']')
        })
        .map_or(text.len(), |(i, _)| i);
    text[..end].trim_end_matches(TRAILING_PUNCTUATION)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Fixture;
    use super::*;

    fn run(fx: &Fixture, text: &str, strict: bool) -> String {
        rewrite(text, &fx.ctx(), strict).into_owned()
    }

    #[test]
    fn test_fixed_origin_replacement() {
        let fx = Fixture::fixed();
        assert_eq!(
            run(&fx, "see https://example.com/a and https://example.com", false),
            "see https://proxy.local/a and https://proxy.local"
        );
    }

    #[test]
    fn test_json_escaped_origin() {
        let fx = Fixture::fixed();
        assert_eq!(
            run(&fx, r#"{"u":"https:\/\/example.com\/a"}"#, false),
            r#"{"u":"https:\/\/proxy.local\/a"}"#
        );
    }

    #[test]
    fn test_escaped_third_party_url_is_encoded() {
        let fx = Fixture::fixed();
        let expected = fx.proxied("https://cdn.net/a").replace('/', "\\/");
        assert_eq!(
            run(&fx, r#"{"u":"https:\/\/cdn.net\/a"}"#, false),
            format!(r#"{{"u":"{}"}}"#, expected)
        );
    }

    #[test]
    fn test_protocol_relative_fixed() {
        let fx = Fixture::fixed();
        assert_eq!(
            run(&fx, r#"src="//example.com/x.js""#, false),
            r#"src="//proxy.local/x.js""#
        );
    }

    #[test]
    fn test_protocol_relative_global() {
        let fx = Fixture::global("https://example.com/");
        assert_eq!(
            run(&fx, r#"src="//example.com/x.js""#, false),
            format!(r#"src="{}""#, fx.proxied("https://example.com/x.js"))
        );
    }

    #[test]
    fn test_third_party_urls_are_encoded() {
        let fx = Fixture::fixed();
        assert_eq!(
            run(&fx, "Visit https://other.com/page.", false),
            format!("Visit {}.", fx.proxied("https://other.com/page"))
        );
    }

    #[test]
    fn test_namespace_urls_untouched() {
        let fx = Fixture::fixed();
        let svg = r#"<svg xmlns="http://www.w3.org/2000/svg" itemtype="https://schema.org/Thing">"#;
        assert_eq!(run(&fx, svg, false), svg);
    }

    #[test]
    fn test_legacy_vs_strict_boundaries() {
        let fx = Fixture::fixed();
        let text = "https://example.com.evil.net/x";

        // Legacy substring matching rewrites the prefix, corrupting the host.
        assert_eq!(
            run(&fx, text, false),
            fx.proxied("https://proxy.local.evil.net/x")
        );
        // Strict matching treats it as a third-party URL.
        assert_eq!(run(&fx, text, true), fx.proxied(text));
    }

    #[test]
    fn test_global_mode_encodes_upstream_urls() {
        let fx = Fixture::global("https://example.com/");
        assert_eq!(
            run(&fx, "https://example.com/a", false),
            fx.proxied("https://example.com/a")
        );
    }

    #[test]
    fn test_gateway_urls_are_kept() {
        let fx = Fixture::fixed();
        let text = "https://proxy.local/login?next=https://other.com/x";
        assert_eq!(run(&fx, text, false), text);
    }

    #[test]
    fn test_url_extent() {
        assert_eq!(url_extent("//a.com/x.js\" more"), "//a.com/x.js");
        assert_eq!(url_extent("//a.com/x."), "//a.com/x");
    }
}
