//! Challenge detection and delegation to an external solver

use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderMap, CONTENT_TYPE};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// Markers anti-bot interstitials put in their pages
const BODY_SIGNATURES: &[&str] = &[
    "cf-browser-verification",
    "challenge-platform",
    "cf_chl_opt",
    "<title>just a moment...</title>",
    "attention required! | cloudflare",
    "ddos-guard",
    "_incapsula_resource",
    "captcha-delivery.com",
];

/// Decides whether an upstream response is an anti-bot challenge
#[derive(Debug, Clone, Default)]
pub struct ChallengeDetector {
    /// Lowercased hosts solving is restricted to; empty means every host
    hosts: Vec<String>,
}

impl ChallengeDetector {
    pub fn new(hosts: Vec<String>) -> Self {
        Self {
            hosts: hosts.into_iter().map(|h| h.to_ascii_lowercase()).collect(),
        }
    }

    pub fn applies_to(&self, host: &str) -> bool {
        if self.hosts.is_empty() {
            return true;
        }
        let host = host.to_ascii_lowercase();
        self.hosts
            .iter()
            .any(|h| host == *h || host.ends_with(&format!(".{}", h)))
    }

    /// Status and headers alone make this response worth inspecting
    pub fn is_candidate(&self, status: StatusCode, headers: &HeaderMap) -> bool {
        headers.contains_key("cf-mitigated")
            || matches!(status.as_u16(), 403 | 429 | 503 | 520..=530)
    }

    pub fn is_challenge(&self, status: StatusCode, headers: &HeaderMap, body: &[u8]) -> bool {
        if headers
            .get("cf-mitigated")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("challenge"))
            .unwrap_or(false)
        {
            return true;
        }
        if !self.is_candidate(status, headers) {
            return false;
        }
        let sample = &body[..body.len().min(64 * 1024)];
        let text = String::from_utf8_lossy(sample).to_ascii_lowercase();
        BODY_SIGNATURES.iter().any(|sig| text.contains(sig))
    }
}

/// What the solver is asked to open
#[derive(Debug, Clone)]
pub struct SolveRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub user_agent: Option<String>,
}

/// Clearance obtained by the solver
#[derive(Debug, Clone, Default)]
pub struct Solution {
    pub cookies: Vec<(String, String)>,
    pub user_agent: Option<String>,
    /// Page the solver ended up on, served if the upstream still challenges us
    pub content: Option<String>,
}

/// External capability that gets past anti-bot pages
#[async_trait]
pub trait ChallengeSolver: Send + Sync {
    async fn solve(&self, request: &SolveRequest) -> anyhow::Result<Solution>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SolverCommand<'a> {
    cmd: &'static str,
    url: &'a str,
    max_timeout: u64,
}

#[derive(Debug, Deserialize)]
struct SolverReply {
    status: String,
    #[serde(default)]
    message: String,
    solution: Option<SolverSolution>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SolverSolution {
    #[serde(default)]
    cookies: Vec<SolverCookie>,
    user_agent: Option<String>,
    response: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SolverCookie {
    name: String,
    value: String,
}

/// Client for a FlareSolverr-compatible solver service
///
/// The solver usually runs next to the gateway, so it is reached through an
/// unguarded client.
pub struct HttpSolver {
    endpoint: String,
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl HttpSolver {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
            timeout,
        }
    }
}

#[async_trait]
impl ChallengeSolver for HttpSolver {
    #[instrument(skip(self, request), fields(url = %request.url))]
    async fn solve(&self, request: &SolveRequest) -> anyhow::Result<Solution> {
        let command = SolverCommand {
            cmd: "request.get",
            url: &request.url,
            max_timeout: self.timeout.as_millis() as u64,
        };
        let body = serde_json::to_vec(&command)?;
        let req = Request::builder()
            .method(Method::POST)
            .uri(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))?;

        // Give the service a little longer than it gives the browser.
        let deadline = self.timeout + Duration::from_secs(5);
        let response = tokio::time::timeout(deadline, self.client.request(req))
            .await
            .map_err(|_| anyhow!("solver did not answer within {:?}", deadline))?
            .context("solver request failed")?;
        let status = response.status();
        let bytes = response.into_body().collect().await?.to_bytes();
        if !status.is_success() {
            bail!("solver returned {}", status);
        }

        let reply: SolverReply = serde_json::from_slice(&bytes).context("invalid solver reply")?;
        parse_reply(reply)
    }
}

fn parse_reply(reply: SolverReply) -> anyhow::Result<Solution> {
    if reply.status != "ok" {
        bail!("solver failed: {}", reply.message);
    }
    let solution = reply
        .solution
        .ok_or_else(|| anyhow!("solver reply has no solution"))?;
    debug!(cookies = solution.cookies.len(), "Solver returned clearance");

    Ok(Solution {
        cookies: solution
            .cookies
            .into_iter()
            .map(|c| (c.name, c.value))
            .collect(),
        user_agent: solution.user_agent.filter(|ua| !ua.is_empty()),
        content: solution.response.filter(|r| !r.is_empty()),
    })
}
