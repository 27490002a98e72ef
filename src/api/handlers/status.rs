//! Gateway status endpoint

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::api::server::AppState;
use crate::proxy::MetricsSnapshot;

#[derive(Debug, Serialize)]
pub struct CookieStats {
    pub origins: usize,
    pub cookies: usize,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub service: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub upstream: Option<String>,
    pub global_prefix: String,
    pub replace_rules: usize,
    pub solver_enabled: bool,
    pub metrics: MetricsSnapshot,
    pub cookies: CookieStats,
}

/// Gateway configuration summary and live counters
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let ctx = &state.ctx;
    let jar = ctx.cookies.jar();

    Json(StatusResponse {
        service: "sitegate",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        upstream: ctx.config.upstream.as_ref().map(|u| u.site.clone()),
        global_prefix: ctx.codec.prefix().to_string(),
        replace_rules: ctx.engine.rules().len(),
        solver_enabled: ctx.config.solver_url.is_some(),
        metrics: ctx.metrics().snapshot(),
        cookies: CookieStats {
            origins: jar.origin_count(),
            cookies: jar.cookie_count(),
        },
    })
}
