use crate::error::{GatewayError, Result};
use crate::models::{ReplaceRule, Upstream};
use std::collections::HashMap;
use std::env;
use url::Url;

/// Default streaming-bypass patterns, matched against the upstream URL
pub const DEFAULT_MEDIA_PATTERNS: &str =
    r"\.(mp4|webm|mkv|avi|mov|m4v|flv|mp3|m4a|aac|ogg|oga|opus|wav|flac)(\?|$)";
pub const DEFAULT_LARGE_FILE_PATTERNS: &str =
    r"\.(zip|tar|gz|tgz|bz2|xz|7z|rar|iso|dmg|exe|msi|apk|deb|rpm|pdf)(\?|$)";
pub const DEFAULT_STREAM_PATTERNS: &str = r"\.(m3u8|mpd|ts|m4s)(\?|$)";

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Gateway front-end and rewriting configuration
    pub gateway: GatewayConfig,
    /// Upstream retry policy
    pub retry: RetryConfig,
    /// Upstream connection pools
    pub pool: PoolConfig,
    /// Status API configuration
    pub api: ApiServerConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Port for the gateway (default: 8080)
    pub port: u16,
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// Origin clients use to reach the gateway; derived from Host when unset
    pub public_origin: Option<String>,
    /// Base upstream for fixed mode
    pub upstream: Option<Upstream>,
    /// Upstream path served for `/` in fixed mode
    pub home_path: String,
    /// Path segment global-mode targets are encoded under
    pub global_path: String,
    /// Request paths the gateway refuses to fetch
    pub deny_patterns: Vec<String>,
    pub replace_rules: Vec<ReplaceRule>,
    pub media_patterns: Vec<String>,
    pub large_file_patterns: Vec<String>,
    pub stream_patterns: Vec<String>,
    /// Bodies larger than this are streamed instead of buffered
    pub large_file_threshold: u64,
    /// Hosts eligible for challenge solving; empty means all
    pub challenge_hosts: Vec<String>,
    /// Cookies injected per upstream host
    pub default_cookies: HashMap<String, Vec<(String, String)>>,
    /// Header overrides per upstream host
    pub host_headers: HashMap<String, HashMap<String, String>>,
    /// Challenge solver endpoint
    pub solver_url: Option<String>,
    /// Only rewrite origins at URL boundaries
    pub strict_url_boundaries: bool,
    /// Enable rate limiting
    pub rate_limit_enabled: bool,
    /// Rate limit requests per second
    pub rate_limit_per_second: u32,
    /// Rate limit burst size
    pub rate_limit_burst: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub exp_base: f64,
    pub max_delay_ms: u64,
    /// Upper bound of the random delay added to each backoff
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 200,
            exp_base: 2.0,
            max_delay_ms: 5000,
            jitter_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Connection timeout in seconds
    pub connect_timeout: u64,
    /// Request timeout in seconds
    pub request_timeout: u64,
    /// In-flight requests per pool
    pub max_concurrent: usize,
    pub max_idle_per_host: usize,
    /// Idle connection lifetime in seconds
    pub idle_timeout: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 10,
            request_timeout: 30,
            max_concurrent: 256,
            max_idle_per_host: 32,
            idle_timeout: 90,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Port for the status API (default: 8081)
    pub port: u16,
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// Allowed CORS origins (comma-separated, empty = localhost only)
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            gateway: GatewayConfig {
                port: get_env_or("GATEWAY_PORT", "8080").parse().map_err(|_| {
                    GatewayError::InvalidConfig("GATEWAY_PORT must be a valid port number".into())
                })?,
                host: get_env_or("GATEWAY_HOST", "0.0.0.0"),
                public_origin: parse_public_origin()?,
                upstream: parse_upstream()?,
                home_path: normalize_home_path(&get_env_or("GATEWAY_HOME_PATH", "/")),
                global_path: parse_global_path()?,
                deny_patterns: get_env_list("GATEWAY_DENY_PATTERNS", ""),
                replace_rules: parse_replace_rules()?,
                media_patterns: get_env_list("GATEWAY_MEDIA_PATTERNS", DEFAULT_MEDIA_PATTERNS),
                large_file_patterns: get_env_list(
                    "GATEWAY_LARGE_FILE_PATTERNS",
                    DEFAULT_LARGE_FILE_PATTERNS,
                ),
                stream_patterns: get_env_list("GATEWAY_STREAM_PATTERNS", DEFAULT_STREAM_PATTERNS),
                large_file_threshold: get_env_or("GATEWAY_LARGE_FILE_THRESHOLD", "10485760")
                    .parse()
                    .map_err(|_| {
                        GatewayError::InvalidConfig(
                            "GATEWAY_LARGE_FILE_THRESHOLD must be a byte count".into(),
                        )
                    })?,
                challenge_hosts: get_env_list("GATEWAY_CHALLENGE_HOSTS", "")
                    .into_iter()
                    .map(|h| h.to_ascii_lowercase())
                    .collect(),
                default_cookies: parse_default_cookies(&get_env_or("GATEWAY_DEFAULT_COOKIES", ""))?,
                host_headers: parse_host_headers()?,
                solver_url: env::var("GATEWAY_SOLVER_URL")
                    .ok()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty()),
                strict_url_boundaries: get_env_or("GATEWAY_STRICT_URL_BOUNDARIES", "false")
                    .parse()
                    .unwrap_or(false),
                rate_limit_enabled: get_env_or("GATEWAY_RATE_LIMIT_ENABLED", "false")
                    .parse()
                    .unwrap_or(false),
                rate_limit_per_second: get_env_or("GATEWAY_RATE_LIMIT_PER_SECOND", "100")
                    .parse()
                    .unwrap_or(100),
                rate_limit_burst: get_env_or("GATEWAY_RATE_LIMIT_BURST", "200")
                    .parse()
                    .unwrap_or(200),
            },
            retry: RetryConfig {
                max_retries: get_env_or("GATEWAY_MAX_RETRIES", "2").parse().unwrap_or(2),
                base_delay_ms: get_env_or("GATEWAY_RETRY_BASE_MS", "200")
                    .parse()
                    .unwrap_or(200),
                exp_base: get_env_or("GATEWAY_RETRY_EXP_BASE", "2.0")
                    .parse()
                    .ok()
                    .filter(|b: &f64| *b >= 1.0)
                    .unwrap_or(2.0),
                max_delay_ms: get_env_or("GATEWAY_RETRY_MAX_MS", "5000")
                    .parse()
                    .unwrap_or(5000),
                jitter_ms: get_env_or("GATEWAY_RETRY_JITTER_MS", "100")
                    .parse()
                    .unwrap_or(100),
            },
            pool: PoolConfig {
                connect_timeout: get_env_or("GATEWAY_CONNECT_TIMEOUT", "10")
                    .parse()
                    .unwrap_or(10),
                request_timeout: get_env_or("GATEWAY_REQUEST_TIMEOUT", "30")
                    .parse()
                    .unwrap_or(30),
                max_concurrent: get_env_or("GATEWAY_POOL_MAX_CONCURRENT", "256")
                    .parse()
                    .ok()
                    .filter(|n: &usize| *n > 0)
                    .unwrap_or(256),
                max_idle_per_host: get_env_or("GATEWAY_POOL_MAX_IDLE", "32")
                    .parse()
                    .unwrap_or(32),
                idle_timeout: get_env_or("GATEWAY_POOL_IDLE_TIMEOUT", "90")
                    .parse()
                    .unwrap_or(90),
            },
            api: ApiServerConfig {
                port: get_env_or("API_PORT", "8081").parse().map_err(|_| {
                    GatewayError::InvalidConfig("API_PORT must be a valid port number".into())
                })?,
                host: get_env_or("API_HOST", "0.0.0.0"),
                cors_origins: get_env_list("CORS_ORIGINS", ""),
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Get the gateway address
    pub fn gateway_addr(&self) -> String {
        format!("{}:{}", self.gateway.host, self.gateway.port)
    }

    /// Get the API server address
    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.api.host, self.api.port)
    }
}

fn parse_public_origin() -> Result<Option<String>> {
    let raw = env::var("GATEWAY_PUBLIC_ORIGIN").unwrap_or_default();
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }

    let url = Url::parse(raw).map_err(|e| {
        GatewayError::InvalidConfig(format!("GATEWAY_PUBLIC_ORIGIN must be a valid URL: {}", e))
    })?;
    if !(url.path().is_empty() || url.path() == "/") || url.query().is_some() {
        return Err(GatewayError::InvalidConfig(
            "GATEWAY_PUBLIC_ORIGIN must be an origin without path or query".into(),
        ));
    }
    let upstream = Upstream::from_url(&url).map_err(|e| {
        GatewayError::InvalidConfig(format!("GATEWAY_PUBLIC_ORIGIN: {}", e))
    })?;
    Ok(Some(upstream.site))
}

fn parse_upstream() -> Result<Option<Upstream>> {
    let raw = env::var("GATEWAY_UPSTREAM").unwrap_or_default();
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    Upstream::parse(raw)
        .map(Some)
        .map_err(|e| GatewayError::InvalidConfig(format!("GATEWAY_UPSTREAM: {}", e)))
}

fn parse_global_path() -> Result<String> {
    let raw = get_env_or("GATEWAY_GLOBAL_PATH", "proxy");
    let segment = raw.trim().trim_matches('/');
    if segment.is_empty() || segment.contains(['?', '#', ' ']) {
        return Err(GatewayError::InvalidConfig(
            "GATEWAY_GLOBAL_PATH must be a non-empty path segment".into(),
        ));
    }
    Ok(segment.to_string())
}

fn normalize_home_path(raw: &str) -> String {
    let raw = raw.trim();
    if raw.starts_with('/') {
        raw.to_string()
    } else {
        format!("/{}", raw)
    }
}

fn parse_replace_rules() -> Result<Vec<ReplaceRule>> {
    let inline = env::var("GATEWAY_REPLACE_RULES").unwrap_or_default();
    let raw = if !inline.trim().is_empty() {
        inline
    } else {
        match env::var("GATEWAY_REPLACE_RULES_FILE") {
            Ok(path) if !path.trim().is_empty() => {
                std::fs::read_to_string(path.trim()).map_err(|e| {
                    GatewayError::InvalidConfig(format!(
                        "GATEWAY_REPLACE_RULES_FILE could not be read: {}",
                        e
                    ))
                })?
            }
            _ => return Ok(Vec::new()),
        }
    };

    serde_json::from_str(&raw).map_err(|e| {
        GatewayError::InvalidConfig(format!("replace rules must be a JSON array: {}", e))
    })
}

/// `host=name=value;host=name=value`
fn parse_default_cookies(raw: &str) -> Result<HashMap<String, Vec<(String, String)>>> {
    let mut cookies: HashMap<String, Vec<(String, String)>> = HashMap::new();
    for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let parsed = entry.split_once('=').and_then(|(host, pair)| {
            let (name, value) = pair.split_once('=')?;
            let (host, name) = (host.trim(), name.trim());
            (!host.is_empty() && !name.is_empty())
                .then(|| (host.to_ascii_lowercase(), name.to_string(), value.trim().to_string()))
        });
        let Some((host, name, value)) = parsed else {
            return Err(GatewayError::InvalidConfig(format!(
                "GATEWAY_DEFAULT_COOKIES entry must be host=name=value: {}",
                entry
            )));
        };
        cookies.entry(host).or_default().push((name, value));
    }
    Ok(cookies)
}

fn parse_host_headers() -> Result<HashMap<String, HashMap<String, String>>> {
    let raw = env::var("GATEWAY_HOST_HEADERS").unwrap_or_default();
    if raw.trim().is_empty() {
        return Ok(HashMap::new());
    }
    let parsed: HashMap<String, HashMap<String, String>> = serde_json::from_str(&raw)
        .map_err(|e| {
            GatewayError::InvalidConfig(format!("GATEWAY_HOST_HEADERS must be JSON: {}", e))
        })?;
    Ok(parsed
        .into_iter()
        .map(|(host, headers)| (host.to_ascii_lowercase(), headers))
        .collect())
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Comma-separated list, empty entries dropped
fn get_env_list(key: &str, default: &str) -> Vec<String> {
    get_env_or(key, default)
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MatchType;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const CONFIG_ENV_KEYS: &[&str] = &[
        "GATEWAY_PORT",
        "GATEWAY_HOST",
        "GATEWAY_PUBLIC_ORIGIN",
        "GATEWAY_UPSTREAM",
        "GATEWAY_HOME_PATH",
        "GATEWAY_GLOBAL_PATH",
        "GATEWAY_DENY_PATTERNS",
        "GATEWAY_REPLACE_RULES",
        "GATEWAY_REPLACE_RULES_FILE",
        "GATEWAY_MEDIA_PATTERNS",
        "GATEWAY_LARGE_FILE_PATTERNS",
        "GATEWAY_STREAM_PATTERNS",
        "GATEWAY_LARGE_FILE_THRESHOLD",
        "GATEWAY_CHALLENGE_HOSTS",
        "GATEWAY_DEFAULT_COOKIES",
        "GATEWAY_HOST_HEADERS",
        "GATEWAY_SOLVER_URL",
        "GATEWAY_STRICT_URL_BOUNDARIES",
        "GATEWAY_RATE_LIMIT_ENABLED",
        "GATEWAY_RATE_LIMIT_PER_SECOND",
        "GATEWAY_RATE_LIMIT_BURST",
        "GATEWAY_MAX_RETRIES",
        "GATEWAY_RETRY_BASE_MS",
        "GATEWAY_RETRY_EXP_BASE",
        "GATEWAY_RETRY_MAX_MS",
        "GATEWAY_RETRY_JITTER_MS",
        "GATEWAY_CONNECT_TIMEOUT",
        "GATEWAY_REQUEST_TIMEOUT",
        "GATEWAY_POOL_MAX_CONCURRENT",
        "GATEWAY_POOL_MAX_IDLE",
        "GATEWAY_POOL_IDLE_TIMEOUT",
        "API_PORT",
        "API_HOST",
        "CORS_ORIGINS",
        "LOG_LEVEL",
        "LOG_FORMAT",
    ];

    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let saved = keys
                .iter()
                .map(|&key| {
                    let old = env::var(key).ok();
                    env::remove_var(key);
                    (key.to_string(), old)
                })
                .collect();

            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain(..) {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        let config = Config::from_env().unwrap();

        assert_eq!(config.gateway.port, 8080);
        assert_eq!(config.gateway.host, "0.0.0.0");
        assert!(config.gateway.public_origin.is_none());
        assert!(config.gateway.upstream.is_none());
        assert_eq!(config.gateway.home_path, "/");
        assert_eq!(config.gateway.global_path, "proxy");
        assert!(config.gateway.deny_patterns.is_empty());
        assert!(config.gateway.replace_rules.is_empty());
        assert_eq!(config.gateway.media_patterns, vec![DEFAULT_MEDIA_PATTERNS.to_string()]);
        assert_eq!(config.gateway.large_file_threshold, 10 * 1024 * 1024);
        assert!(config.gateway.solver_url.is_none());
        assert!(!config.gateway.strict_url_boundaries);
        assert!(!config.gateway.rate_limit_enabled);

        assert_eq!(config.retry, RetryConfig::default());
        assert_eq!(config.pool, PoolConfig::default());

        assert_eq!(config.api.port, 8081);
        assert!(config.api.cors_origins.is_empty());
        assert_eq!(config.log.format, "pretty");
    }

    #[test]
    fn test_config_from_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("GATEWAY_PORT", "9000");
        env::set_var("GATEWAY_PUBLIC_ORIGIN", "https://gw.example/");
        env::set_var("GATEWAY_UPSTREAM", "https://example.com:8443/start");
        env::set_var("GATEWAY_HOME_PATH", "index.html");
        env::set_var("GATEWAY_GLOBAL_PATH", "/p/");
        env::set_var("GATEWAY_DENY_PATTERNS", "^/admin, \\.env$");
        env::set_var(
            "GATEWAY_REPLACE_RULES",
            r#"[{"search": "a", "replace": "b", "matchType": "regex"}]"#,
        );
        env::set_var("GATEWAY_CHALLENGE_HOSTS", "Example.com");
        env::set_var("GATEWAY_DEFAULT_COOKIES", "example.com=consent=yes; example.com=lang=en");
        env::set_var("GATEWAY_HOST_HEADERS", r#"{"Example.com": {"X-Api": "1"}}"#);
        env::set_var("GATEWAY_MAX_RETRIES", "5");
        env::set_var("GATEWAY_RETRY_EXP_BASE", "0.5");
        env::set_var("CORS_ORIGINS", "https://a.example, https://b.example");

        let config = Config::from_env().unwrap();

        assert_eq!(config.gateway.port, 9000);
        assert_eq!(config.gateway.public_origin.as_deref(), Some("https://gw.example"));
        assert_eq!(
            config.gateway.upstream.as_ref().map(|u| u.site.as_str()),
            Some("https://example.com:8443")
        );
        assert_eq!(config.gateway.home_path, "/index.html");
        assert_eq!(config.gateway.global_path, "p");
        assert_eq!(
            config.gateway.deny_patterns,
            vec!["^/admin".to_string(), "\\.env$".to_string()]
        );
        assert_eq!(config.gateway.replace_rules.len(), 1);
        assert_eq!(config.gateway.replace_rules[0].match_type, MatchType::Regex);
        assert_eq!(config.gateway.challenge_hosts, vec!["example.com".to_string()]);
        assert_eq!(
            config.gateway.default_cookies.get("example.com").unwrap(),
            &vec![
                ("consent".to_string(), "yes".to_string()),
                ("lang".to_string(), "en".to_string())
            ]
        );
        assert_eq!(
            config.gateway.host_headers["example.com"].get("X-Api").map(String::as_str),
            Some("1")
        );
        assert_eq!(config.retry.max_retries, 5);
        // Bases below 1 would shrink the delay; the default is used instead.
        assert_eq!(config.retry.exp_base, 2.0);
        assert_eq!(
            config.api.cors_origins,
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
    }

    #[test]
    fn test_config_from_env_invalid_port() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("GATEWAY_PORT", "not-a-port");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, GatewayError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_from_env_invalid_upstream() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("GATEWAY_UPSTREAM", "ftp://example.com");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, GatewayError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_from_env_invalid_rules_json() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("GATEWAY_REPLACE_RULES", "{not json");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, GatewayError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_from_env_public_origin_with_path() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("GATEWAY_PUBLIC_ORIGIN", "https://gw.example/sub");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, GatewayError::InvalidConfig(_)));
    }

    #[test]
    fn test_parse_default_cookies_rejects_malformed() {
        assert!(parse_default_cookies("").unwrap().is_empty());
        assert!(matches!(
            parse_default_cookies("example.com"),
            Err(GatewayError::InvalidConfig(_))
        ));
        assert!(matches!(
            parse_default_cookies("=name=value"),
            Err(GatewayError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_config_formatters() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        let config = Config::from_env().unwrap();
        assert_eq!(config.gateway_addr(), "0.0.0.0:8080");
        assert_eq!(config.api_addr(), "0.0.0.0:8081");
    }
}
