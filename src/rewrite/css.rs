//! CSS specialization: `url(...)` references and `@import` strings

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;

use super::{replace_with, unquote, RewriteContext};

static URL_FN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)url\(\s*("[^"]*"|'[^']*'|[^)"']*?)\s*\)"#).unwrap());

static IMPORT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)(@import\s+)("[^"]*"|'[^']*')"#).unwrap());

pub(super) fn rewrite<'t>(css: &'t str, ctx: &RewriteContext<'_>) -> Cow<'t, str> {
    let out = replace_with(&URL_FN, css, |caps, _| {
        let (open, value, close) = unquote(caps.get(1)?.as_str());
        let target = ctx.retarget(value)?;
        Some(format!("url({}{}{})", open, target, close))
    });

    let imported = replace_with(&IMPORT, &out, |caps, _| {
        let (open, value, close) = unquote(caps.get(2)?.as_str());
        let target = ctx.retarget(value)?;
        Some(format!("{}{}{}{}", &caps[1], open, target, close))
    });

    match super::changed(imported) {
        Some(next) => Cow::Owned(next),
        None => out,
    }
}
