//! Connection manager
//!
//! Wraps the transport with classified retries, exponential backoff and a
//! single round of challenge solving per request.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::header::{HeaderValue, CONTENT_TYPE, COOKIE, USER_AGENT};
use hyper::{Response, StatusCode};
use rand::Rng;
use tracing::{debug, info, instrument, warn};

use crate::config::RetryConfig;
use crate::error::{GatewayError, Result};
use crate::proxy::challenge::{ChallengeDetector, ChallengeSolver, SolveRequest, Solution};
use crate::proxy::metrics::GatewayMetrics;
use crate::proxy::transport::{full, GatewayBody, Transport, TransportError, UpstreamRequest};

/// Why one attempt did not produce a final result
#[derive(Debug)]
pub enum AttemptError<T> {
    Transport(TransportError),
    /// The upstream answered with a retryable status
    Status { status: StatusCode, response: Option<T> },
}

/// 5xx, 408 and 429 are worth another attempt
pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

/// Origin-unreachable statuses some CDNs use; these are never mirrored
fn is_cdn_origin_error(status: StatusCode) -> bool {
    (520..=530).contains(&status.as_u16())
}

/// How the attempt loop ended
enum LoopEnd<T> {
    Done(T),
    Failed(GatewayError),
    /// Stopped on a status, either non-retryable or with attempts used up
    Exhausted {
        status: StatusCode,
        response: Option<T>,
    },
}

fn host_of(target: &str) -> String {
    url::Url::parse(target)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| target.to_string())
}

fn origin_failure(host: &str, status: StatusCode, attempts: u32) -> GatewayError {
    GatewayError::UpstreamGatewayError {
        status: status.as_u16(),
        message: format!("{} returned {} after {} attempts", host, status, attempts),
    }
}

/// Final result of an attempt loop
fn conclude<T>(host: &str, end: LoopEnd<T>, attempts: u32) -> Result<T> {
    match end {
        LoopEnd::Done(value) => Ok(value),
        LoopEnd::Failed(err) => Err(err),
        LoopEnd::Exhausted {
            status,
            response: Some(response),
        } if !is_cdn_origin_error(status) => {
            debug!(%status, "Mirroring last upstream response");
            Ok(response)
        }
        LoopEnd::Exhausted { status, .. } => Err(origin_failure(host, status, attempts)),
    }
}

/// Delay before the attempt following `attempt`
pub fn backoff_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let exp = retry.exp_base.powi(attempt.saturating_sub(1) as i32);
    let base = (retry.base_delay_ms as f64 * exp).min(retry.max_delay_ms as f64) as u64;
    let jitter = if retry.jitter_ms > 0 {
        rand::thread_rng().gen_range(0..=retry.jitter_ms)
    } else {
        0
    };
    Duration::from_millis(base.saturating_add(jitter).min(retry.max_delay_ms))
}

/// Result of a logical upstream request
pub struct Fetched {
    pub response: Response<GatewayBody>,
    /// The solver was consulted for this request
    pub challenge_used: bool,
    /// Clearance cookies the solver obtained
    pub solver_cookies: Vec<(String, String)>,
}

impl Fetched {
    fn plain(response: Response<GatewayBody>) -> Self {
        Self {
            response,
            challenge_used: false,
            solver_cookies: Vec::new(),
        }
    }
}

/// Pooled transport plus retry and challenge policy
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    retry: RetryConfig,
    detector: ChallengeDetector,
    solver: Option<Arc<dyn ChallengeSolver>>,
    metrics: Arc<GatewayMetrics>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        retry: RetryConfig,
        detector: ChallengeDetector,
        solver: Option<Arc<dyn ChallengeSolver>>,
    ) -> Self {
        Self {
            transport,
            retry,
            detector,
            solver,
            metrics: Arc::new(GatewayMetrics::new()),
        }
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Run `operation` until it succeeds, fails for good, or attempts run out
    ///
    /// `operation` receives the 1-based attempt number. Only retryable
    /// transport errors and retryable statuses are attempted again. When
    /// attempts run out on a status the last response is returned as-is,
    /// unless the status is a CDN origin error.
    pub async fn execute<T, F, Fut>(&self, target: &str, operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, AttemptError<T>>>,
    {
        let started = Instant::now();
        let host = host_of(target);
        let (end, attempts) = self.attempt_loop(&host, operation).await;
        let outcome = conclude(&host, end, attempts);
        self.record(started, attempts, &outcome);
        outcome
    }

    async fn attempt_loop<T, F, Fut>(&self, host: &str, mut operation: F) -> (LoopEnd<T>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, AttemptError<T>>>,
    {
        let max_attempts = self.retry.max_retries + 1;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match operation(attempt).await {
                Ok(value) => return (LoopEnd::Done(value), attempt),
                Err(AttemptError::Transport(err)) => {
                    if err.kind.is_retryable() && attempt < max_attempts {
                        warn!(
                            "Upstream {} failed: {} (attempt {}/{})",
                            host, err, attempt, max_attempts
                        );
                        tokio::time::sleep(backoff_delay(&self.retry, attempt)).await;
                        continue;
                    }
                    return (LoopEnd::Failed(err.into_gateway_error(host)), attempt);
                }
                Err(AttemptError::Status { status, response }) => {
                    if is_retryable_status(status) && attempt < max_attempts {
                        warn!(
                            "Upstream {} returned {} (attempt {}/{})",
                            host, status, attempt, max_attempts
                        );
                        tokio::time::sleep(backoff_delay(&self.retry, attempt)).await;
                        continue;
                    }
                    return (LoopEnd::Exhausted { status, response }, attempt);
                }
            }
        }
    }

    fn record<T>(&self, started: Instant, attempts: u32, outcome: &Result<T>) {
        self.metrics.record_retries(attempts.saturating_sub(1));
        match outcome {
            Ok(_) => self.metrics.record_success(started.elapsed()),
            Err(e) => self.metrics.record_failure(e.kind(), started.elapsed()),
        }
    }

    /// Attempts for one upstream request, without settling the outcome
    async fn send_attempts(
        &self,
        request: &UpstreamRequest,
        host: &str,
    ) -> (LoopEnd<Response<GatewayBody>>, u32) {
        self.attempt_loop(host, |attempt| {
            let transport = self.transport.clone();
            let request = request.clone();
            async move {
                debug!(attempt, "Sending upstream request");
                let response = match transport.send(request).await {
                    Ok(response) => response,
                    Err(e) => return Err(AttemptError::Transport(e)),
                };
                let status = response.status();
                if is_retryable_status(status) {
                    return Err(AttemptError::Status {
                        status,
                        response: Some(response),
                    });
                }
                Ok(response)
            }
        })
        .await
    }

    /// One upstream request through the retry loop
    async fn send_with_retry(&self, request: &UpstreamRequest) -> Result<Response<GatewayBody>> {
        let started = Instant::now();
        let host = host_of(&request.url);
        let (end, attempts) = self.send_attempts(request, &host).await;
        let outcome = conclude(&host, end, attempts);
        self.record(started, attempts, &outcome);
        outcome
    }

    /// Fetch a logical request, delegating a challenge to the solver once
    ///
    /// A CDN origin error left after retries is shown to the challenge
    /// detector before it becomes a gateway error.
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    pub async fn fetch(&self, request: UpstreamRequest) -> Result<Fetched> {
        let started = Instant::now();
        let host = host_of(&request.url);
        let (end, attempts) = self.send_attempts(&request, &host).await;

        let (response, origin_error) = match end {
            LoopEnd::Exhausted {
                status,
                response: Some(response),
            } if is_cdn_origin_error(status) && self.solver.is_some() => (response, Some(status)),
            end => {
                let outcome = conclude(&host, end, attempts);
                self.record(started, attempts, &outcome);
                (outcome?, None)
            }
        };

        let fetched = self.delegate(&request, response).await;
        let Some(status) = origin_error else {
            return fetched;
        };

        let outcome = match fetched {
            Ok(fetched) if is_cdn_origin_error(fetched.response.status()) => {
                Err(origin_failure(&host, status, attempts))
            }
            other => other,
        };
        self.record(started, attempts, &outcome);
        outcome
    }

    /// Hand a challenged response to the solver and re-execute once
    async fn delegate(
        &self,
        request: &UpstreamRequest,
        response: Response<GatewayBody>,
    ) -> Result<Fetched> {
        let host = request.host().unwrap_or_default();
        let Some(solver) = self.solver.clone() else {
            return Ok(Fetched::plain(response));
        };
        if !self.detector.applies_to(&host)
            || !self.detector.is_candidate(response.status(), response.headers())
        {
            return Ok(Fetched::plain(response));
        }

        let (parts, body) = buffer(response).await?;
        if !self.detector.is_challenge(parts.status, &parts.headers, &body) {
            return Ok(Fetched::plain(Response::from_parts(parts, full(body))));
        }

        info!(host = %host, status = %parts.status, "Upstream challenge detected, delegating to solver");
        let solve = SolveRequest {
            url: request.url.clone(),
            headers: request.headers.clone(),
            user_agent: request
                .headers
                .get(USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        };
        let solution = match solver.solve(&solve).await {
            Ok(solution) => solution,
            Err(e) => {
                warn!(host = %host, error = %e, "Challenge solver failed, returning original response");
                self.metrics.record_challenge(false);
                let mut fetched = Fetched::plain(Response::from_parts(parts, full(body)));
                fetched.challenge_used = true;
                return Ok(fetched);
            }
        };

        let retried = self.send_with_retry(&with_solution(request, &solution)).await;
        let (response, solved) = match retried {
            Ok(response) => self.settle(response, &solution).await?,
            Err(e) => match solver_page(&solution) {
                Some(page) => (page, true),
                None => {
                    warn!(host = %host, error = %e, "Request after solving failed, returning original response");
                    (Response::from_parts(parts, full(body)), false)
                }
            },
        };
        self.metrics.record_challenge(solved);

        Ok(Fetched {
            response,
            challenge_used: true,
            solver_cookies: solution.cookies,
        })
    }

    /// Response to serve after re-executing with clearance, and whether the
    /// challenge counts as solved
    async fn settle(
        &self,
        response: Response<GatewayBody>,
        solution: &Solution,
    ) -> Result<(Response<GatewayBody>, bool)> {
        if !self.detector.is_candidate(response.status(), response.headers()) {
            return Ok((response, true));
        }
        let (parts, body) = buffer(response).await?;
        if !self.detector.is_challenge(parts.status, &parts.headers, &body) {
            return Ok((Response::from_parts(parts, full(body)), true));
        }
        match solver_page(solution) {
            Some(page) => {
                debug!("Still challenged, serving the page the solver saw");
                Ok((page, true))
            }
            None => Ok((Response::from_parts(parts, full(body)), false)),
        }
    }
}

async fn buffer(response: Response<GatewayBody>) -> Result<(hyper::http::response::Parts, Bytes)> {
    let (parts, body) = response.into_parts();
    let bytes = body
        .collect()
        .await
        .map_err(|e| GatewayError::UpstreamGatewayError {
            status: 502,
            message: format!("failed to read upstream body: {}", e),
        })?
        .to_bytes();
    Ok((parts, bytes))
}

/// Copy of `request` carrying the solver's cookies and user agent
fn with_solution(request: &UpstreamRequest, solution: &Solution) -> UpstreamRequest {
    let mut retry = request.clone();
    let existing = retry.headers.get(COOKIE).and_then(|v| v.to_str().ok());
    let merged = merge_cookies(existing, &solution.cookies);
    if let Ok(value) = HeaderValue::from_str(&merged) {
        retry.headers.insert(COOKIE, value);
    }
    if let Some(ua) = solution
        .user_agent
        .as_deref()
        .and_then(|ua| HeaderValue::from_str(ua).ok())
    {
        retry.headers.insert(USER_AGENT, ua);
    }
    retry
}

/// Cookie header with `cookies` replacing same-named pairs in `existing`
pub fn merge_cookies(existing: Option<&str>, cookies: &[(String, String)]) -> String {
    let mut pairs: Vec<String> = existing
        .unwrap_or("")
        .split(';')
        .map(str::trim)
        .filter(|pair| {
            let name = pair.split_once('=').map_or(*pair, |(n, _)| n);
            !pair.is_empty() && !cookies.iter().any(|(n, _)| n == name)
        })
        .map(str::to_string)
        .collect();
    pairs.extend(cookies.iter().map(|(n, v)| format!("{}={}", n, v)));
    pairs.join("; ")
}

fn solver_page(solution: &Solution) -> Option<Response<GatewayBody>> {
    let content = solution.content.clone()?;
    let mut response = Response::new(full(content));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    Some(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::transport::test_support::{MockTransport, Reply};
    use crate::proxy::transport::TransportErrorKind;
    use async_trait::async_trait;
    use hyper::header::HeaderMap;
    use hyper::Method;

    const CHALLENGE_PAGE: &str = "<html><head><title>Just a moment...</title></head></html>";

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay_ms: 1,
            exp_base: 2.0,
            max_delay_ms: 5,
            jitter_ms: 0,
        }
    }

    fn manager(transport: Arc<MockTransport>, retries: u32) -> ConnectionManager {
        ConnectionManager::new(transport, fast_retry(retries), ChallengeDetector::default(), None)
    }

    fn request() -> UpstreamRequest {
        UpstreamRequest {
            method: Method::GET,
            url: "https://example.com/page".to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    async fn body_text(response: Response<GatewayBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    struct FixedSolver(Option<Solution>);

    #[async_trait]
    impl ChallengeSolver for FixedSolver {
        async fn solve(&self, _request: &SolveRequest) -> anyhow::Result<Solution> {
            self.0.clone().ok_or_else(|| anyhow::anyhow!("solver unavailable"))
        }
    }

    fn with_solver(transport: Arc<MockTransport>, solution: Option<Solution>) -> ConnectionManager {
        ConnectionManager::new(
            transport,
            fast_retry(0),
            ChallengeDetector::default(),
            Some(Arc::new(FixedSolver(solution))),
        )
    }

    fn clearance(content: Option<&str>) -> Solution {
        Solution {
            cookies: vec![("cf_clearance".to_string(), "token".to_string())],
            user_agent: Some("SolverAgent/1.0".to_string()),
            content: content.map(str::to_string),
        }
    }

    #[test]
    fn test_backoff_delay() {
        let retry = RetryConfig {
            max_retries: 5,
            base_delay_ms: 200,
            exp_base: 2.0,
            max_delay_ms: 5000,
            jitter_ms: 0,
        };
        assert_eq!(backoff_delay(&retry, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(&retry, 2), Duration::from_millis(400));
        assert_eq!(backoff_delay(&retry, 3), Duration::from_millis(800));
        assert_eq!(backoff_delay(&retry, 10), Duration::from_millis(5000));

        let jittered = RetryConfig {
            jitter_ms: 50,
            ..retry
        };
        for _ in 0..20 {
            let delay = backoff_delay(&jittered, 1);
            assert!(delay >= Duration::from_millis(200) && delay <= Duration::from_millis(250));
        }
    }

    #[test]
    fn test_retryable_statuses() {
        for status in [500, 502, 503, 504, 408, 429, 522] {
            assert!(is_retryable_status(StatusCode::from_u16(status).unwrap()), "{}", status);
        }
        for status in [200, 301, 400, 403, 404] {
            assert!(!is_retryable_status(StatusCode::from_u16(status).unwrap()), "{}", status);
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let transport = Arc::new(MockTransport::new(vec![
            Reply::status(503),
            Reply::status(503),
            Reply::ok("done"),
        ]));
        let manager = manager(transport.clone(), 2);

        let fetched = manager.fetch(request()).await.unwrap();
        assert_eq!(fetched.response.status(), StatusCode::OK);
        assert_eq!(body_text(fetched.response).await, "done");
        assert_eq!(transport.call_count(), 3);

        let snap = manager.metrics().snapshot();
        assert_eq!(snap.retried_requests, 1);
        assert_eq!(snap.total_retries, 2);
        assert_eq!(snap.successful_requests, 1);
    }

    #[tokio::test]
    async fn test_resets_then_success() {
        let transport = Arc::new(MockTransport::new(vec![
            Reply::Fail(TransportErrorKind::ConnectionReset),
            Reply::Fail(TransportErrorKind::ConnectionReset),
            Reply::ok("done"),
        ]));
        let manager = manager(transport.clone(), 2);

        let fetched = manager.fetch(request()).await.unwrap();
        assert_eq!(body_text(fetched.response).await, "done");
        assert_eq!(transport.call_count(), 3);

        let snap = manager.metrics().snapshot();
        assert_eq!(snap.retried_requests, 1);
        assert_eq!(snap.total_retries, 2);
        assert_eq!(snap.successful_requests, 1);
        assert_eq!(snap.failed_requests, 0);
    }

    #[tokio::test]
    async fn test_execute_stops_on_non_retryable_status() {
        let manager = manager(Arc::new(MockTransport::default()), 2);
        let mut attempts = 0;

        let result = manager
            .execute::<(), _, _>("https://example.com/missing", |_| {
                attempts += 1;
                async {
                    Err(AttemptError::Status {
                        status: StatusCode::NOT_FOUND,
                        response: None,
                    })
                }
            })
            .await;

        assert_eq!(attempts, 1);
        assert!(matches!(
            result,
            Err(GatewayError::UpstreamGatewayError { status: 404, .. })
        ));
        assert_eq!(manager.metrics().snapshot().total_retries, 0);
    }

    #[tokio::test]
    async fn test_execute_retries_retryable_status() {
        let manager = manager(Arc::new(MockTransport::default()), 2);
        let mut attempts = 0;

        let result = manager
            .execute("https://example.com/busy", |attempt| {
                attempts += 1;
                async move {
                    if attempt < 3 {
                        Err(AttemptError::Status {
                            status: StatusCode::SERVICE_UNAVAILABLE,
                            response: None,
                        })
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_transport_failures_are_classified() {
        let transport = Arc::new(MockTransport::new(vec![
            Reply::Fail(TransportErrorKind::ConnectionRefused),
            Reply::Fail(TransportErrorKind::ConnectionRefused),
            Reply::Fail(TransportErrorKind::ConnectionRefused),
        ]));
        let manager = manager(transport.clone(), 2);

        let err = manager.fetch(request()).await.err().unwrap();
        assert!(matches!(err, GatewayError::TargetConnectionRefused(_)));
        assert_eq!(transport.call_count(), 3);
        assert_eq!(
            manager.metrics().snapshot().errors.get("target_connection_refused"),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn test_non_retryable_failure_stops() {
        let transport = Arc::new(MockTransport::new(vec![Reply::Fail(TransportErrorKind::Tls)]));
        let manager = manager(transport.clone(), 3);

        let err = manager.fetch(request()).await.err().unwrap();
        assert!(matches!(err, GatewayError::UpstreamGatewayError { status: 502, .. }));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_client_errors_not_retried() {
        let transport = Arc::new(MockTransport::new(vec![Reply::status(404)]));
        let manager = manager(transport.clone(), 3);

        let fetched = manager.fetch(request()).await.unwrap();
        assert_eq!(fetched.response.status(), StatusCode::NOT_FOUND);
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_status_is_mirrored() {
        let transport = Arc::new(MockTransport::new(vec![
            Reply::status(503),
            Reply::html(503, "maintenance"),
        ]));
        let manager = manager(transport.clone(), 1);

        let fetched = manager.fetch(request()).await.unwrap();
        assert_eq!(fetched.response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_text(fetched.response).await, "maintenance");
    }

    #[tokio::test]
    async fn test_exhausted_cdn_error_is_gateway_error() {
        let transport = Arc::new(MockTransport::new(vec![Reply::status(522), Reply::status(522)]));
        let manager = manager(transport.clone(), 1);

        let err = manager.fetch(request()).await.err().unwrap();
        assert!(matches!(err, GatewayError::UpstreamGatewayError { status: 522, .. }));
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_challenge_is_solved_once() {
        let transport = Arc::new(MockTransport::new(vec![
            Reply::html(403, CHALLENGE_PAGE),
            Reply::ok("welcome"),
        ]));
        let manager = with_solver(transport.clone(), Some(clearance(None)));

        let mut req = request();
        req.headers.insert(COOKIE, HeaderValue::from_static("sid=1; cf_clearance=old"));
        let fetched = manager.fetch(req).await.unwrap();

        assert!(fetched.challenge_used);
        assert_eq!(fetched.solver_cookies.len(), 1);
        assert_eq!(body_text(fetched.response).await, "welcome");

        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].headers[COOKIE], "sid=1; cf_clearance=token");
        assert_eq!(calls[1].headers[USER_AGENT], "SolverAgent/1.0");

        let snap = manager.metrics().snapshot();
        assert_eq!(snap.challenges_attempted, 1);
        assert_eq!(snap.challenges_solved, 1);
    }

    #[tokio::test]
    async fn test_cdn_challenge_reaches_solver() {
        let transport = Arc::new(MockTransport::new(vec![
            Reply::html(522, CHALLENGE_PAGE),
            Reply::ok("welcome"),
        ]));
        let manager = with_solver(transport.clone(), Some(clearance(None)));

        let fetched = manager.fetch(request()).await.unwrap();
        assert!(fetched.challenge_used);
        assert_eq!(fetched.response.status(), StatusCode::OK);
        assert_eq!(body_text(fetched.response).await, "welcome");
        assert_eq!(transport.call_count(), 2);
        assert_eq!(manager.metrics().snapshot().challenges_solved, 1);
    }

    #[tokio::test]
    async fn test_cdn_error_without_challenge_fails() {
        let transport = Arc::new(MockTransport::new(vec![Reply::html(522, "origin down")]));
        let manager = with_solver(transport.clone(), Some(clearance(None)));

        let err = manager.fetch(request()).await.err().unwrap();
        assert!(matches!(err, GatewayError::UpstreamGatewayError { status: 522, .. }));
        assert_eq!(transport.call_count(), 1);

        let snap = manager.metrics().snapshot();
        assert_eq!(snap.failed_requests, 1);
        assert_eq!(snap.challenges_attempted, 0);
    }

    #[tokio::test]
    async fn test_solver_failure_returns_original() {
        let transport = Arc::new(MockTransport::new(vec![Reply::html(403, CHALLENGE_PAGE)]));
        let manager = with_solver(transport.clone(), None);

        let fetched = manager.fetch(request()).await.unwrap();
        assert_eq!(fetched.response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_text(fetched.response).await, CHALLENGE_PAGE);
        assert_eq!(transport.call_count(), 1);
        assert_eq!(manager.metrics().snapshot().challenges_solved, 0);
    }

    #[tokio::test]
    async fn test_still_challenged_serves_solver_content() {
        let transport = Arc::new(MockTransport::new(vec![
            Reply::html(403, CHALLENGE_PAGE),
            Reply::html(403, CHALLENGE_PAGE),
        ]));
        let manager = with_solver(transport.clone(), Some(clearance(Some("<html>real</html>"))));

        let fetched = manager.fetch(request()).await.unwrap();
        assert_eq!(fetched.response.status(), StatusCode::OK);
        assert_eq!(body_text(fetched.response).await, "<html>real</html>");
        // No recursion: one original call and one re-execution.
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_plain_forbidden_is_not_a_challenge() {
        let transport = Arc::new(MockTransport::new(vec![Reply::html(403, "Forbidden")]));
        let manager = with_solver(transport.clone(), Some(clearance(None)));

        let fetched = manager.fetch(request()).await.unwrap();
        assert!(!fetched.challenge_used);
        assert_eq!(body_text(fetched.response).await, "Forbidden");
        assert_eq!(transport.call_count(), 1);
    }

    #[test]
    fn test_merge_cookies() {
        let cookies = vec![("b".to_string(), "new".to_string())];
        assert_eq!(merge_cookies(Some("a=1; b=old"), &cookies), "a=1; b=new");
        assert_eq!(merge_cookies(None, &cookies), "b=new");
    }
}
