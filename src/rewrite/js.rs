//! JavaScript specialization: string-literal URLs handed to navigation and
//! request APIs

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;

use super::{replace_with, RewriteContext};

/// A plain string literal without escapes or template substitutions
const LITERAL: &str = r#"(?P<lit>"[^"\\\n]*"|'[^'\\\n]*'|`[^`\\$]*`)"#;

static CALL_SITES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\bfetch\(\s*",
        r"\bwindow\.open\(\s*",
        r#"\.open\(\s*["'](?i:get|post|put|delete|patch|head|options)["']\s*,\s*"#,
        r"\blocation(?:\.href)?\s*=\s*",
        r"\blocation\.(?:assign|replace)\(\s*",
    ]
    .iter()
    .map(|prefix| Regex::new(&format!("{}{}", prefix, LITERAL)).unwrap())
    .collect()
});

pub(super) fn rewrite<'t>(script: &'t str, ctx: &RewriteContext<'_>) -> Cow<'t, str> {
    let mut out = Cow::Borrowed(script);
    for re in CALL_SITES.iter() {
        let pass = replace_with(re, &out, |caps, _| {
            let whole = caps.get(0)?;
            let lit = caps.name("lit")?;
            let quote = &lit.as_str()[..1];
            let value = &lit.as_str()[1..lit.as_str().len() - 1];
            let target = ctx.retarget(value)?;

            let prefix = &whole.as_str()[..lit.start() - whole.start()];
            Some(format!("{}{}{}{}", prefix, quote, target, quote))
        });
        if let Some(next) = super::changed(pass) {
            out = Cow::Owned(next);
        }
    }
    out
}
