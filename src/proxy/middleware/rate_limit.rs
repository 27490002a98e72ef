//! Per-client rate limiting for the gateway front-end
//!
//! One governor direct limiter per client IP, dropped after a period without
//! requests.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovRateLimiter};
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};

type DirectLimiter = GovRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// How long a client's limiter survives without traffic
const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(10 * 60);

#[derive(Debug)]
struct ClientLimiter {
    limiter: Arc<DirectLimiter>,
    last_seen_ms: AtomicU64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn non_zero(value: u32) -> NonZeroU32 {
    NonZeroU32::new(value).unwrap_or(NonZeroU32::MIN)
}

/// Token-bucket limiter keyed by client IP
#[derive(Clone)]
pub struct RateLimiter {
    enabled: bool,
    limiters: Arc<DashMap<String, ClientLimiter>>,
    quota: Quota,
    max_idle: Duration,
}

impl RateLimiter {
    pub fn new(enabled: bool, requests_per_second: u32, burst_size: u32) -> Self {
        Self {
            enabled,
            limiters: Arc::new(DashMap::new()),
            quota: Quota::per_second(non_zero(requests_per_second))
                .allow_burst(non_zero(burst_size)),
            max_idle: DEFAULT_MAX_IDLE,
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, 100, 100)
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        if config.rate_limit_enabled {
            Self::new(true, config.rate_limit_per_second, config.rate_limit_burst)
        } else {
            Self::disabled()
        }
    }

    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Admit or reject one request from `client_ip`
    pub fn check(&self, client_ip: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if self.limiter_for(client_ip).check().is_err() {
            warn!(client_ip, "Rate limit exceeded");
            return Err(GatewayError::RateLimitExceeded {
                client_ip: client_ip.to_string(),
            });
        }
        Ok(())
    }

    fn limiter_for(&self, client_ip: &str) -> Arc<DirectLimiter> {
        let now = now_ms();
        let entry = self
            .limiters
            .entry(client_ip.to_string())
            .or_insert_with(|| {
                debug!(client_ip, "Tracking new client");
                ClientLimiter {
                    limiter: Arc::new(GovRateLimiter::direct(self.quota)),
                    last_seen_ms: AtomicU64::new(now),
                }
            });
        entry.last_seen_ms.store(now, Ordering::Relaxed);
        entry.limiter.clone()
    }

    /// Forget clients idle for longer than the configured window
    pub fn cleanup(&self) {
        let now = now_ms();
        let max_idle_ms = self.max_idle.as_millis() as u64;
        let before = self.limiters.len();

        self.limiters.retain(|_, entry| {
            now.saturating_sub(entry.last_seen_ms.load(Ordering::Relaxed)) <= max_idle_ms
        });

        let removed = before.saturating_sub(self.limiters.len());
        if removed > 0 {
            debug!(removed, "Dropped idle rate limiter entries");
        }
    }

    pub fn client_count(&self) -> usize {
        self.limiters.len()
    }
}
