use chrono::{DateTime, Utc};
use serde::Serialize;

/// SameSite attribute of a cookie
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl SameSite {
    pub fn as_str(&self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "strict" => Some(SameSite::Strict),
            "lax" => Some(SameSite::Lax),
            "none" => Some(SameSite::None),
            _ => None,
        }
    }
}

/// A cookie as held by the per-origin store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    /// Lowercase domain without a leading dot
    pub domain: String,
    /// Only sent to exactly `domain` when no Domain attribute was given
    pub host_only: bool,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<SameSite>,
    pub expires: Option<DateTime<Utc>>,
}

impl StoredCookie {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.map(|e| e <= now).unwrap_or(false)
    }

    /// `name=value` pair for a Cookie header
    pub fn pair(&self) -> String {
        format!("{}={}", self.name, self.value)
    }
}
