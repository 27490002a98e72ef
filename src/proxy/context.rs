//! Shared gateway state, built once at startup

use std::sync::Arc;
use std::time::Duration;

use hyper::header::{HeaderMap, CONTENT_LENGTH, CONTENT_TYPE};
use regex::Regex;
use tracing::info;

use crate::codec::UrlCodec;
use crate::config::{Config, GatewayConfig};
use crate::cookies::CookieTranslator;
use crate::error::{GatewayError, Result};
use crate::pipeline::Pipeline;
use crate::proxy::challenge::{ChallengeDetector, ChallengeSolver, HttpSolver};
use crate::proxy::manager::ConnectionManager;
use crate::proxy::metrics::GatewayMetrics;
use crate::proxy::transport::{HyperTransport, Transport};
use crate::rewrite::{RewriteEngine, RuleSet};

/// How long the solver may spend on one page
const SOLVER_TIMEOUT: Duration = Duration::from_secs(60);

/// Which upstream responses bypass buffering
#[derive(Debug)]
pub struct StreamingPolicy {
    url_patterns: Vec<Regex>,
    large_file_threshold: u64,
}

impl StreamingPolicy {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let url_patterns = config
            .media_patterns
            .iter()
            .chain(&config.large_file_patterns)
            .chain(&config.stream_patterns)
            .map(|p| {
                Regex::new(&format!("(?i){}", p)).map_err(|e| {
                    GatewayError::InvalidConfig(format!("streaming pattern '{}': {}", p, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            url_patterns,
            large_file_threshold: config.large_file_threshold,
        })
    }

    /// Decided from the URL alone, before any headers are seen
    pub fn matches_url(&self, url: &str) -> bool {
        self.url_patterns.iter().any(|re| re.is_match(url))
    }

    pub fn should_stream(&self, url: &str, headers: &HeaderMap) -> bool {
        if self.matches_url(url) {
            return true;
        }

        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        if content_type.starts_with("video/")
            || content_type.starts_with("audio/")
            || content_type.contains("mpegurl")
            || content_type.contains("dash+xml")
        {
            return true;
        }

        headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|len| len > self.large_file_threshold)
            .unwrap_or(false)
    }
}

/// Everything a request needs, shared across connections
pub struct GatewayContext {
    pub config: GatewayConfig,
    pub codec: UrlCodec,
    pub cookies: Arc<CookieTranslator>,
    pub engine: Arc<RewriteEngine>,
    pub pipeline: Pipeline,
    pub manager: ConnectionManager,
    pub streaming: StreamingPolicy,
}

impl GatewayContext {
    /// Build the context with explicit transport and solver
    pub fn new(
        config: &Config,
        transport: Arc<dyn Transport>,
        solver: Option<Arc<dyn ChallengeSolver>>,
    ) -> Result<Self> {
        let gateway = config.gateway.clone();
        let codec = UrlCodec::new(&gateway.global_path);
        let cookies = Arc::new(CookieTranslator::with_defaults(
            gateway.default_cookies.clone(),
        ));
        let rules = RuleSet::new(gateway.replace_rules.clone())?;
        let engine = Arc::new(RewriteEngine::new(rules, gateway.strict_url_boundaries));
        let pipeline = Pipeline::standard(&gateway, cookies.clone(), engine.clone(), codec.clone())?;
        let manager = ConnectionManager::new(
            transport,
            config.retry.clone(),
            ChallengeDetector::new(gateway.challenge_hosts.clone()),
            solver,
        );
        let streaming = StreamingPolicy::new(&gateway)?;

        Ok(Self {
            config: gateway,
            codec,
            cookies,
            engine,
            pipeline,
            manager,
            streaming,
        })
    }

    /// Build the context with the pooled hyper transport
    pub fn from_config(config: &Config) -> Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(HyperTransport::new(&config.pool));
        let solver = config.gateway.solver_url.as_ref().map(|url| {
            info!(solver = %url, "Challenge solver enabled");
            Arc::new(HttpSolver::new(url.clone(), SOLVER_TIMEOUT)) as Arc<dyn ChallengeSolver>
        });

        let ctx = Self::new(config, transport, solver)?;
        info!(
            upstream = ?ctx.config.upstream.as_ref().map(|u| u.site.as_str()),
            prefix = %ctx.codec.prefix(),
            rules = ctx.engine.rules().len(),
            "Gateway context ready"
        );
        Ok(ctx)
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        self.manager.metrics()
    }
}
