//! Handler pipeline
//!
//! Request stages run in order before the upstream call, response stages in
//! order after it. A failing stage aborts the rest of its phase.

mod decompress;
mod request;
mod response;

pub use decompress::{decompress, is_supported};
pub use request::{CookieStage, DefaultHeadersStage, DenyListStage, TargetHeadersStage};
pub use response::{
    CacheControlStage, ContentRewriteStage, DecompressStage, ErrorPageStage, FinalizeStage,
    HeaderSanitizerStage, SetCookieStage,
};

use std::sync::Arc;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, trace};

use crate::codec::UrlCodec;
use crate::config::GatewayConfig;
use crate::cookies::CookieTranslator;
use crate::error::{GatewayError, Result};
use crate::models::{AddressingMode, ProxyRequest, ProxyResponse, Upstream};
use crate::rewrite::{RewriteContext, RewriteEngine};

/// Why a stage stopped the pipeline
#[derive(Debug, Error)]
pub enum StageError {
    /// An already-classified rejection, surfaced unchanged
    #[error(transparent)]
    Reject(#[from] GatewayError),
    /// An unexpected failure inside the stage
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

pub type StageResult = std::result::Result<(), StageError>;

/// Mutates a request before it is sent upstream
pub trait RequestStage: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, upstream: &Upstream, request: &mut ProxyRequest) -> StageResult;
}

/// Mutates an upstream response before it is returned to the client
pub trait ResponseStage: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, upstream: &Upstream, response: &mut ProxyResponse) -> StageResult;
}

/// Ordered request and response stages
pub struct Pipeline {
    request_stages: Vec<Box<dyn RequestStage>>,
    response_stages: Vec<Box<dyn ResponseStage>>,
}

impl Pipeline {
    pub fn new(
        request_stages: Vec<Box<dyn RequestStage>>,
        response_stages: Vec<Box<dyn ResponseStage>>,
    ) -> Self {
        Self {
            request_stages,
            response_stages,
        }
    }

    /// The gateway's stage lists
    pub fn standard(
        config: &GatewayConfig,
        cookies: Arc<CookieTranslator>,
        engine: Arc<RewriteEngine>,
        codec: UrlCodec,
    ) -> Result<Self> {
        let deny = config
            .deny_patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self::new(
            vec![
                Box::new(DenyListStage::new(deny)),
                Box::new(TargetHeadersStage::new(codec.clone())),
                Box::new(DefaultHeadersStage::new(config.host_headers.clone())),
                Box::new(CookieStage::new(cookies.clone())),
            ],
            vec![
                Box::new(DecompressStage),
                Box::new(HeaderSanitizerStage::new(codec.clone())),
                Box::new(ContentRewriteStage::new(engine, codec)),
                Box::new(SetCookieStage::new(cookies)),
                Box::new(CacheControlStage),
                Box::new(ErrorPageStage),
                Box::new(FinalizeStage),
            ],
        ))
    }

    pub fn request_stage_names(&self) -> Vec<&'static str> {
        self.request_stages.iter().map(|s| s.name()).collect()
    }

    pub fn response_stage_names(&self) -> Vec<&'static str> {
        self.response_stages.iter().map(|s| s.name()).collect()
    }

    pub fn run_request(&self, upstream: &Upstream, request: &mut ProxyRequest) -> Result<()> {
        for stage in &self.request_stages {
            stage
                .apply(upstream, request)
                .map_err(|e| classify(stage.name(), e))?;
            trace!(stage = stage.name(), "Request stage applied");
        }
        Ok(())
    }

    pub fn run_response(&self, upstream: &Upstream, response: &mut ProxyResponse) -> Result<()> {
        for stage in &self.response_stages {
            stage
                .apply(upstream, response)
                .map_err(|e| classify(stage.name(), e))?;
            trace!(stage = stage.name(), "Response stage applied");
        }
        Ok(())
    }
}

fn classify(stage: &'static str, err: StageError) -> GatewayError {
    match err {
        StageError::Reject(e) => e,
        StageError::Failed(e) => {
            debug!(stage, error = %e, "Stage failed");
            GatewayError::HandlerFailure {
                stage,
                message: format!("{:#}", e),
            }
        }
    }
}

/// Absolute upstream URL a request addresses
pub fn target_url(upstream: &Upstream, request: &ProxyRequest) -> String {
    match request.mode {
        AddressingMode::Global => upstream.url.clone(),
        AddressingMode::Fixed => upstream.join(&request.url_no_site),
    }
}

/// Rewrite context for a response to `request`
pub fn rewrite_context<'a>(
    upstream: &'a Upstream,
    request: &'a ProxyRequest,
    codec: &'a UrlCodec,
    content_type: &'a str,
) -> RewriteContext<'a> {
    RewriteContext {
        upstream,
        proxy_site: &request.site,
        proxy_host: &request.host,
        codec,
        mode: request.mode,
        request_path: request.upstream_path(),
        content_type,
    }
}
