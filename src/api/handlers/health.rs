//! Liveness endpoint

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::api::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// `fixed` when an upstream site is configured, `global` otherwise
    pub mode: &'static str,
    pub upstream_configured: bool,
    pub solver_enabled: bool,
    pub uptime_secs: u64,
}

/// Which rewriting modes the gateway is serving
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let upstream_configured = state.ctx.config.upstream.is_some();

    Json(HealthResponse {
        status: "healthy",
        mode: if upstream_configured { "fixed" } else { "global" },
        upstream_configured,
        solver_enabled: state.ctx.config.solver_url.is_some(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}
