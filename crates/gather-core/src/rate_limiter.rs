//! Sliding-window rate limiting with per-minute and per-hour ceilings.
//!
//! [`RateLimiter`] is shared by the collection service; [`RateLimitedFetcher`]
//! wraps any [`Fetcher`] with one limiter per domain.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use url::Url;

use crate::error::AppError;
use crate::traits::{FetchRequest, FetchResponse, Fetcher};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub per_minute: u32,
    pub per_hour: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: 30,
            per_hour: 600,
        }
    }
}

impl RateLimitConfig {
    /// Time until another call is allowed, given the timestamps of past calls
    /// (oldest first). Zero when neither window is saturated.
    pub fn wait_time(&self, calls: &VecDeque<Instant>, now: Instant) -> Duration {
        let window_wait = |window: Duration, ceiling: u32| -> Duration {
            if ceiling == 0 {
                return Duration::ZERO;
            }
            let in_window: Vec<&Instant> = calls
                .iter()
                .filter(|&&t| now.saturating_duration_since(t) < window)
                .collect();
            if in_window.len() < ceiling as usize {
                return Duration::ZERO;
            }
            // The call that has to leave the window before we may proceed.
            let releasing = in_window[in_window.len() - ceiling as usize];
            (*releasing + window).saturating_duration_since(now)
        };

        window_wait(MINUTE, self.per_minute).max(window_wait(HOUR, self.per_hour))
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    calls: Arc<Mutex<VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            calls: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Wait until a call is allowed, then record it. Returns the time waited.
    pub async fn acquire(&self) -> Duration {
        let mut waited = Duration::ZERO;
        loop {
            let wait = {
                let mut calls = self.calls.lock().await;
                let now = Instant::now();
                while calls
                    .front()
                    .is_some_and(|&t| now.saturating_duration_since(t) >= HOUR)
                {
                    calls.pop_front();
                }
                let wait = self.config.wait_time(&calls, now);
                if wait.is_zero() {
                    calls.push_back(now);
                    return waited;
                }
                wait
            };
            tracing::debug!(wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting");
            tokio::time::sleep(wait).await;
            waited += wait;
        }
    }

    /// Wait that `acquire` would incur right now, without recording a call.
    pub async fn current_wait(&self) -> Duration {
        let calls = self.calls.lock().await;
        self.config.wait_time(&calls, Instant::now())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

/// A [`Fetcher`] wrapper with one rate limiter per domain.
#[derive(Clone)]
pub struct RateLimitedFetcher<F> {
    inner: F,
    config: RateLimitConfig,
    limiters: Arc<Mutex<HashMap<String, RateLimiter>>>,
}

impl<F: Fetcher> RateLimitedFetcher<F> {
    pub fn new(inner: F, config: RateLimitConfig) -> Self {
        Self {
            inner,
            config,
            limiters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// scheme://host:port of a URL.
    fn domain_key(url_str: &str) -> Option<String> {
        let url = Url::parse(url_str).ok()?;
        let host = url.host_str()?;
        let port = url
            .port_or_known_default()
            .map(|p| format!(":{p}"))
            .unwrap_or_default();
        Some(format!("{}://{}{}", url.scheme(), host, port))
    }

    async fn limiter_for(&self, domain: &str) -> RateLimiter {
        let mut limiters = self.limiters.lock().await;
        limiters
            .entry(domain.to_string())
            .or_insert_with(|| RateLimiter::new(self.config))
            .clone()
    }
}

impl<F: Fetcher> Fetcher for RateLimitedFetcher<F> {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, AppError> {
        if let Some(domain) = Self::domain_key(&request.url) {
            let limiter = self.limiter_for(&domain).await;
            let waited = limiter.acquire().await;
            if !waited.is_zero() {
                tracing::debug!(domain = %domain, waited_ms = waited.as_millis() as u64, "Throttled request");
            }
        }
        self.inner.fetch(request).await
    }
}
