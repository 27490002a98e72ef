//! User-defined replace rules

use std::borrow::Cow;

use dashmap::DashMap;
use regex::Regex;
use tracing::warn;

use super::RewriteContext;
use crate::error::{GatewayError, Result};
use crate::models::{MatchType, ReplaceRule};

/// Compiled search regexes kept per rule before the cache is reset
const SEARCH_CACHE_LIMIT: usize = 64;

#[derive(Debug)]
struct CompiledRule {
    rule: ReplaceRule,
    url_match: Option<Regex>,
    url_exclude: Option<Regex>,
    /// Search regexes by placeholder-substituted pattern
    searches: DashMap<String, Regex>,
}

impl CompiledRule {
    fn applies(&self, request_path: &str, content_type: &str) -> bool {
        if let Some(re) = &self.url_match {
            if !re.is_match(request_path) {
                return false;
            }
        }
        if let Some(re) = &self.url_exclude {
            if re.is_match(request_path) {
                return false;
            }
        }
        match &self.rule.content_type {
            Some(filter) => content_type
                .to_ascii_lowercase()
                .contains(&filter.to_ascii_lowercase()),
            None => true,
        }
    }

    fn search_regex(&self, pattern: &str) -> std::result::Result<Regex, regex::Error> {
        if let Some(re) = self.searches.get(pattern) {
            return Ok(re.clone());
        }
        let re = Regex::new(pattern)?;
        if self.searches.len() >= SEARCH_CACHE_LIMIT {
            self.searches.clear();
        }
        self.searches.insert(pattern.to_string(), re.clone());
        Ok(re)
    }
}

/// Ordered list of replace rules
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Compile the path filters; an invalid regex is a configuration error
    pub fn new(rules: Vec<ReplaceRule>) -> Result<Self> {
        let rules = rules
            .into_iter()
            .map(|rule| {
                let compile = |pattern: &Option<String>| -> Result<Option<Regex>> {
                    pattern
                        .as_deref()
                        .map(Regex::new)
                        .transpose()
                        .map_err(|e| {
                            GatewayError::InvalidConfig(format!(
                                "replace rule '{}': {}",
                                rule.search, e
                            ))
                        })
                };
                let url_match = compile(&rule.url_match)?;
                let url_exclude = compile(&rule.url_exclude)?;

                if rule.match_type == MatchType::Regex && !rule.search.contains('$') {
                    Regex::new(&rule.search).map_err(|e| {
                        GatewayError::InvalidConfig(format!("replace rule '{}': {}", rule.search, e))
                    })?;
                }

                Ok(CompiledRule {
                    rule,
                    url_match,
                    url_exclude,
                    searches: DashMap::new(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Apply every rule whose filters accept this response, in order
    pub fn apply<'t>(&self, content: &'t str, ctx: &RewriteContext<'_>) -> Cow<'t, str> {
        let mut out = Cow::Borrowed(content);
        if self.rules.is_empty() {
            return out;
        }
        let placeholders = Placeholders::new(ctx);

        for compiled in &self.rules {
            if !compiled.applies(ctx.request_path, ctx.content_type) {
                continue;
            }
            let rule = &compiled.rule;

            let next = match rule.match_type {
                MatchType::String => {
                    let search = placeholders.substitute(&rule.search, Escape::None);
                    if search.is_empty() || !out.contains(search.as_str()) {
                        continue;
                    }
                    let replace = placeholders.substitute(&rule.replace, Escape::None);
                    Some(out.replace(search.as_str(), &replace))
                }
                MatchType::Regex => {
                    let search = placeholders.substitute(&rule.search, Escape::Regex);
                    let re = match compiled.search_regex(&search) {
                        Ok(re) => re,
                        Err(e) => {
                            warn!(rule = %rule.search, error = %e, "Skipping replace rule with invalid regex");
                            continue;
                        }
                    };
                    let replace = placeholders.substitute(&rule.replace, Escape::Replacement);
                    super::changed(re.replace_all(&out, replace.as_str()))
                }
            };

            if let Some(next) = next {
                out = Cow::Owned(next);
            }
        }
        out
    }
}

#[derive(Clone, Copy)]
enum Escape {
    None,
    /// Inside a regex search pattern
    Regex,
    /// Inside a regex replacement, where `$` introduces a group
    Replacement,
}

struct Placeholders {
    values: [(&'static str, String); 5],
}

impl Placeholders {
    fn new(ctx: &RewriteContext<'_>) -> Self {
        let scheme = ctx
            .proxy_site
            .split_once("://")
            .map_or("https", |(scheme, _)| scheme);
        Self {
            values: [
                ("$custom_site", ctx.proxy_site.to_string()),
                ("$upstream", ctx.upstream.site.clone()),
                ("$scheme", scheme.to_string()),
                ("$host", ctx.proxy_host.to_string()),
                ("$PROXY", format!("{}{}", ctx.proxy_site, ctx.codec.prefix())),
            ],
        }
    }

    fn substitute(&self, template: &str, escape: Escape) -> String {
        if !template.contains('$') {
            return template.to_string();
        }
        let mut out = template.to_string();
        for (name, value) in &self.values {
            if !out.contains(name) {
                continue;
            }
            let value = match escape {
                Escape::None => Cow::Borrowed(value.as_str()),
                Escape::Regex => Cow::Owned(regex::escape(value)),
                Escape::Replacement => Cow::Owned(value.replace('$', "$$")),
            };
            out = out.replace(name, &value);
        }
        out
    }
}
