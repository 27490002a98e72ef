use serde::{Deserialize, Serialize};

/// How a replace rule's `search` is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    /// Plain substring replacement
    #[default]
    String,
    Regex,
}

/// User-defined substitution applied to response bodies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceRule {
    pub search: String,
    pub replace: String,
    #[serde(default)]
    pub match_type: MatchType,
    /// Only apply when this regex matches the request path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_match: Option<String>,
    /// Never apply when this regex matches the request path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_exclude: Option<String>,
    /// Only apply when the content type contains this substring
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl ReplaceRule {
    pub fn literal(search: impl Into<String>, replace: impl Into<String>) -> Self {
        Self {
            search: search.into(),
            replace: replace.into(),
            match_type: MatchType::String,
            url_match: None,
            url_exclude: None,
            content_type: None,
        }
    }

    pub fn regex(search: impl Into<String>, replace: impl Into<String>) -> Self {
        Self {
            match_type: MatchType::Regex,
            ..Self::literal(search, replace)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_rule_deserialize() {
        let rules: Vec<ReplaceRule> = serde_json::from_str(
            r#"[
                {"search": "Example", "replace": "Proxied"},
                {"search": "a(\\d+)", "replace": "b$1", "matchType": "regex",
                 "urlMatch": "^/docs", "urlExclude": "\\.json$", "contentType": "html"}
            ]"#,
        )
        .unwrap();

        assert_eq!(rules[0].match_type, MatchType::String);
        assert_eq!(rules[0].url_match, None);
        assert_eq!(rules[1].match_type, MatchType::Regex);
        assert_eq!(rules[1].url_match.as_deref(), Some("^/docs"));
        assert_eq!(rules[1].url_exclude.as_deref(), Some("\\.json$"));
        assert_eq!(rules[1].content_type.as_deref(), Some("html"));
    }
}
