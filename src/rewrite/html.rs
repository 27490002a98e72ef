//! HTML specialization
//!
//! Works on tag soup with regexes, one tag at a time. Attribute values are
//! retargeted in place and keep their original quoting.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use super::{css, js, replace_with, unquote, RewriteContext};

static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<([a-z][a-z0-9-]*)(\s[^>]*)>").unwrap());

static ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(\s+)([a-z_:][a-z0-9_:.-]*)(\s*=\s*)("[^"]*"|'[^']*'|[^\s"'>]+)"#).unwrap()
});

static STYLE_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)(<style\b[^>]*>)(.*?)(</style\s*>)").unwrap());

static SCRIPT_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)(<script\b[^>]*>)(.*?)(</script\s*>)").unwrap());

static SCRIPT_TYPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\stype\s*=\s*["']?([^"'\s>]+)"#).unwrap());

static CSP_META: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<meta\b[^>]*http-equiv\s*=\s*["']?content-security-policy[^>]*>"#).unwrap()
});

static REFRESH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)http-equiv\s*=\s*["']?refresh"#).unwrap());

static BASE_HREF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<base\b[^>]*\shref\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#).unwrap()
});

/// Tags whose link attributes point at other resources
const LINK_TAGS: &[&str] = &[
    "a", "area", "audio", "base", "embed", "form", "frame", "iframe", "img", "input", "link",
    "object", "script", "source", "track", "video", "button", "image",
];

const LINK_ATTRS: &[&str] = &["href", "src", "action", "data", "poster", "formaction", "xlink:href"];

pub(super) fn rewrite<'t>(html: &'t str, ctx: &RewriteContext<'_>) -> Cow<'t, str> {
    let base = document_base(html, ctx);
    let base = base.as_ref();

    let mut out = Cow::Borrowed(html);

    let pass = replace_with(&STYLE_BLOCK, &out, |caps, _| {
        let rewritten = super::changed(css::rewrite(&caps[2], ctx))?;
        Some(format!("{}{}{}", &caps[1], rewritten, &caps[3]))
    });
    if let Some(next) = super::changed(pass) {
        out = Cow::Owned(next);
    }

    let pass = replace_with(&SCRIPT_BLOCK, &out, |caps, _| {
        if !is_javascript(&caps[1]) {
            return None;
        }
        let rewritten = super::changed(js::rewrite(&caps[2], ctx))?;
        Some(format!("{}{}{}", &caps[1], rewritten, &caps[3]))
    });
    if let Some(next) = super::changed(pass) {
        out = Cow::Owned(next);
    }

    let pass = CSP_META.replace_all(&out, "");
    if let Some(next) = super::changed(pass) {
        out = Cow::Owned(next);
    }

    let pass = replace_with(&TAG, &out, |caps, _| {
        let name = caps[1].to_ascii_lowercase();
        let attrs = rewrite_attributes(&name, &caps[2], ctx, base)?;
        Some(format!("<{}{}>", &caps[1], attrs))
    });
    if let Some(next) = super::changed(pass) {
        out = Cow::Owned(next);
    }

    out
}

fn rewrite_attributes(
    tag: &str,
    attrs: &str,
    ctx: &RewriteContext<'_>,
    base: Option<&Url>,
) -> Option<String> {
    let is_link_tag = LINK_TAGS.contains(&tag);
    let is_refresh = tag == "meta" && REFRESH.is_match(attrs);

    super::changed(replace_with(&ATTR, attrs, |caps, _| {
        let name = caps[2].to_ascii_lowercase();
        let (open, value, close) = unquote(&caps[4]);

        let rewritten = match name.as_str() {
            "integrity" => return Some(String::new()),
            "style" => super::changed(css::rewrite(value, ctx))?,
            "srcset" | "imagesrcset" if is_link_tag => rewrite_srcset(value, ctx, base)?,
            n if is_link_tag && LINK_ATTRS.contains(&n) => {
                // <base href> is resolved against the document, not itself.
                let base = if tag == "base" { None } else { base };
                ctx.retarget_against(value, base)?
            }
            "content" if is_refresh => rewrite_refresh(value, ctx, base)?,
            _ => return None,
        };

        Some(format!(
            "{}{}{}{}{}{}",
            &caps[1], &caps[2], &caps[3], open, rewritten, close
        ))
    }))
}

/// `a.png 1x, b.png 2x`
fn rewrite_srcset(value: &str, ctx: &RewriteContext<'_>, base: Option<&Url>) -> Option<String> {
    let mut changed = false;
    let candidates: Vec<String> = value
        .split(',')
        .map(|candidate| {
            let trimmed = candidate.trim();
            let (url, descriptor) = trimmed
                .split_once(char::is_whitespace)
                .map_or((trimmed, ""), |(u, d)| (u, d));
            match ctx.retarget_against(url, base) {
                Some(target) => {
                    changed = true;
                    if descriptor.is_empty() {
                        target
                    } else {
                        format!("{} {}", target, descriptor.trim())
                    }
                }
                None => trimmed.to_string(),
            }
        })
        .collect();

    changed.then(|| candidates.join(", "))
}

/// `5; url=/next`
pub(crate) fn rewrite_refresh(
    value: &str,
    ctx: &RewriteContext<'_>,
    base: Option<&Url>,
) -> Option<String> {
    let lower = value.to_ascii_lowercase();
    let start = match lower.find("url=") {
        Some(idx) => idx + 4,
        None => lower.find(';')? + 1,
    };
    let (open, target, close) = unquote(value[start..].trim());
    let retargeted = ctx.retarget_against(target, base)?;
    Some(format!("{}{}{}{}", &value[..start], open, retargeted, close))
}

fn is_javascript(open_tag: &str) -> bool {
    match SCRIPT_TYPE.captures(open_tag) {
        Some(caps) => {
            let kind = caps[1].to_ascii_lowercase();
            kind.contains("javascript") || kind.contains("ecmascript") || kind == "module"
        }
        None => true,
    }
}

/// Base URL relative references in this document resolve against
fn document_base(html: &str, ctx: &RewriteContext<'_>) -> Option<Url> {
    let caps = BASE_HREF.captures(html)?;
    let href = caps.get(1).or(caps.get(2)).or(caps.get(3))?.as_str();
    let page = Url::parse(&ctx.upstream.url).ok()?;
    page.join(href.trim()).ok()
}
