//! Connection manager metrics

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

/// Weight of the newest sample in the latency average
const EWMA_ALPHA: f64 = 0.2;

/// Counters shared by every upstream call
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    /// Requests that needed more than one attempt
    retried_requests: AtomicU64,
    /// Attempts beyond the first, summed over all requests
    total_retries: AtomicU64,
    challenges_attempted: AtomicU64,
    challenges_solved: AtomicU64,
    streamed_responses: AtomicU64,
    avg_latency_ms: Mutex<Option<f64>>,
    errors: DashMap<&'static str, u64>,
}

/// Point-in-time copy of [`GatewayMetrics`]
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub retried_requests: u64,
    pub total_retries: u64,
    pub challenges_attempted: u64,
    pub challenges_solved: u64,
    pub streamed_responses: u64,
    pub avg_latency_ms: f64,
    pub success_rate: f64,
    pub errors: std::collections::BTreeMap<String, u64>,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, latency: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        self.observe_latency(latency);
    }

    pub fn record_failure(&self, kind: &'static str, latency: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        *self.errors.entry(kind).or_insert(0) += 1;
        self.observe_latency(latency);
    }

    /// `retries` is the number of attempts after the first one
    pub fn record_retries(&self, retries: u32) {
        if retries == 0 {
            return;
        }
        self.retried_requests.fetch_add(1, Ordering::Relaxed);
        self.total_retries.fetch_add(retries as u64, Ordering::Relaxed);
    }

    pub fn record_challenge(&self, solved: bool) {
        self.challenges_attempted.fetch_add(1, Ordering::Relaxed);
        if solved {
            self.challenges_solved.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_streamed(&self) {
        self.streamed_responses.fetch_add(1, Ordering::Relaxed);
    }

    fn observe_latency(&self, latency: Duration) {
        let sample = latency.as_secs_f64() * 1000.0;
        let mut avg = self.avg_latency_ms.lock();
        *avg = Some(match *avg {
            Some(prev) => prev + EWMA_ALPHA * (sample - prev),
            None => sample,
        });
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total_requests.load(Ordering::Relaxed);
        let successful = self.successful_requests.load(Ordering::Relaxed);
        let success_rate = if total > 0 {
            successful as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        MetricsSnapshot {
            total_requests: total,
            successful_requests: successful,
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            retried_requests: self.retried_requests.load(Ordering::Relaxed),
            total_retries: self.total_retries.load(Ordering::Relaxed),
            challenges_attempted: self.challenges_attempted.load(Ordering::Relaxed),
            challenges_solved: self.challenges_solved.load(Ordering::Relaxed),
            streamed_responses: self.streamed_responses.load(Ordering::Relaxed),
            avg_latency_ms: self.avg_latency_ms.lock().unwrap_or(0.0),
            success_rate,
            errors: self
                .errors
                .iter()
                .map(|e| (e.key().to_string(), *e.value()))
                .collect(),
        }
    }
}
