//! Content category detection

use hyper::header::{HeaderMap, CONTENT_TYPE};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Bytes inspected when the content type has to be sniffed
pub const SNIFF_LEN: usize = 512;

/// Share of NUL/high-bit bytes above which a sample counts as binary
const BINARY_RATIO: f64 = 0.30;

static CSS_HINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)@import\b|@media\b|@font-face\b|@charset\b|@keyframes\b|^\s*[.#]?[A-Za-z][\w\-\s,.#:>\[\]=]*\{\s*[a-z-]+\s*:")
        .unwrap()
});

static JS_HINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(function|var|let|const|return|typeof|async|await)\b|=>|\bdocument\.|\bwindow\.").unwrap()
});

/// What kind of payload a response carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentCategory {
    Html,
    Css,
    JavaScript,
    Json,
    Xml,
    Text,
    Binary,
}

impl ContentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentCategory::Html => "html",
            ContentCategory::Css => "css",
            ContentCategory::JavaScript => "javascript",
            ContentCategory::Json => "json",
            ContentCategory::Xml => "xml",
            ContentCategory::Text => "text",
            ContentCategory::Binary => "binary",
        }
    }

    /// Whether the rewrite engine processes this category
    pub fn is_text(&self) -> bool {
        !matches!(self, ContentCategory::Binary)
    }

    /// Category for a declared content type; None when it says nothing useful
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();

        let category = match essence.as_str() {
            "" | "application/octet-stream" | "binary/octet-stream" => return None,
            "text/html" | "application/xhtml+xml" => ContentCategory::Html,
            "text/css" => ContentCategory::Css,
            "application/x-www-form-urlencoded" => ContentCategory::Text,
            e if e.contains("javascript") || e.contains("ecmascript") => {
                ContentCategory::JavaScript
            }
            e if e.ends_with("/json") || e.ends_with("+json") => ContentCategory::Json,
            e if e.ends_with("/xml") || e.ends_with("+xml") => ContentCategory::Xml,
            e if e.starts_with("text/") => ContentCategory::Text,
            _ => ContentCategory::Binary,
        };
        Some(category)
    }
}

impl std::fmt::Display for ContentCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Category from the declared content type, sniffing the body when absent
pub fn detect_category(headers: &HeaderMap, sample: &[u8]) -> ContentCategory {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(ContentCategory::from_content_type)
        .unwrap_or_else(|| sniff(sample))
}

/// Guess the category from the first bytes of a body
pub fn sniff(body: &[u8]) -> ContentCategory {
    let sample = &body[..body.len().min(SNIFF_LEN)];
    if sample.is_empty() {
        return ContentCategory::Binary;
    }

    let suspicious = sample.iter().filter(|&&b| b == 0 || b & 0x80 != 0).count();
    if suspicious as f64 / sample.len() as f64 > BINARY_RATIO {
        return ContentCategory::Binary;
    }

    let text = String::from_utf8_lossy(sample);
    let text = text.trim_start_matches('\u{feff}').trim_start();
    let lower = text.to_ascii_lowercase();

    if lower.starts_with("<!doctype html")
        || lower.contains("<html")
        || lower.contains("<head")
        || lower.contains("<body")
    {
        ContentCategory::Html
    } else if lower.starts_with("<?xml") || lower.starts_with("<svg") || lower.starts_with("<rss") {
        ContentCategory::Xml
    } else if lower.starts_with('{') || lower.starts_with('[') {
        ContentCategory::Json
    } else if CSS_HINT.is_match(text) {
        ContentCategory::Css
    } else if JS_HINT.is_match(text) {
        ContentCategory::JavaScript
    } else {
        ContentCategory::Binary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn headers(content_type: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
        headers
    }

    #[test]
    fn test_declared_content_type_wins() {
        assert_eq!(
            detect_category(&headers("text/html; charset=utf-8"), b"{}"),
            ContentCategory::Html
        );
        assert_eq!(detect_category(&headers("text/css"), b""), ContentCategory::Css);
        assert_eq!(
            detect_category(&headers("application/javascript"), b""),
            ContentCategory::JavaScript
        );
        assert_eq!(
            detect_category(&headers("application/manifest+json"), b""),
            ContentCategory::Json
        );
        assert_eq!(
            detect_category(&headers("image/svg+xml"), b""),
            ContentCategory::Xml
        );
        assert_eq!(detect_category(&headers("text/plain"), b""), ContentCategory::Text);
        assert_eq!(detect_category(&headers("image/png"), b"<html>"), ContentCategory::Binary);
    }

    #[test]
    fn test_octet_stream_is_sniffed() {
        assert_eq!(
            detect_category(&headers("application/octet-stream"), b"<!DOCTYPE html><html>"),
            ContentCategory::Html
        );
    }

    #[test]
    fn test_sniff_markup_and_data() {
        assert_eq!(sniff(b"  <!doctype html><p>hi"), ContentCategory::Html);
        assert_eq!(sniff(b"<div><body>x</body></div>"), ContentCategory::Html);
        assert_eq!(sniff(b"<?xml version=\"1.0\"?><feed/>"), ContentCategory::Xml);
        assert_eq!(sniff(b"{\"a\": 1}"), ContentCategory::Json);
        assert_eq!(sniff(b"[1, 2, 3]"), ContentCategory::Json);
    }

    #[test]
    fn test_sniff_css_and_js() {
        assert_eq!(sniff(b"@import url(a.css);"), ContentCategory::Css);
        assert_eq!(sniff(b"body { color: red; }"), ContentCategory::Css);
        assert_eq!(
            sniff(b"(function () { return window.location; })();"),
            ContentCategory::JavaScript
        );
        assert_eq!(sniff(b"const x = () => 1;"), ContentCategory::JavaScript);
    }

    #[test]
    fn test_sniff_binary() {
        assert_eq!(sniff(&[0x89, b'P', b'N', b'G', 0, 0, 0, 0x0d]), ContentCategory::Binary);
        assert_eq!(sniff(&[0u8; 64]), ContentCategory::Binary);
        assert_eq!(sniff(b""), ContentCategory::Binary);
        assert_eq!(sniff(b"just some words"), ContentCategory::Binary);
    }

    #[test]
    fn test_sniff_only_looks_at_prefix() {
        let mut body = vec![b' '; SNIFF_LEN];
        body.extend_from_slice(b"<html>");
        assert_eq!(sniff(&body), ContentCategory::Binary);
    }
}
