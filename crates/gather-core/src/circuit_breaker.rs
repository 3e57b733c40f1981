//! Per-component circuit breakers.
//!
//! A source (or the AI fallback) whose calls keep failing is suppressed for a
//! while instead of being hammered on every collection run.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED --[N consecutive failures]--> OPEN --[timeout]--> HALF_OPEN
//!   ^                                    ^                     |
//!   |                                    +-----[failure]-------+
//!   +-------------[M consecutive successes]--------------------+
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Consecutive half-open successes before the circuit closes.
    pub success_threshold: u32,
    /// Time spent open before probing again.
    pub recovery_timeout_secs: u64,
    /// Rate-limit failures stretch the recovery timeout by this factor.
    pub rate_limit_backoff_multiplier: f32,
    pub max_recovery_timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout_secs: 60,
            rate_limit_backoff_multiplier: 2.0,
            max_recovery_timeout_secs: 600,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }

    fn max_recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.max_recovery_timeout_secs)
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    total_calls: u64,
    total_failures: u64,
    last_failure_time: Option<Instant>,
    last_error: Option<String>,
    current_recovery_timeout: Duration,
}

impl BreakerState {
    fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            total_calls: 0,
            total_failures: 0,
            last_failure_time: None,
            last_error: None,
            current_recovery_timeout: config.recovery_timeout(),
        }
    }

    fn remaining_open_time(&self) -> Duration {
        self.last_failure_time
            .map(|t| self.current_recovery_timeout.saturating_sub(t.elapsed()))
            .unwrap_or(self.current_recovery_timeout)
    }
}

/// Snapshot of a breaker for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub failure_rate: f64,
    pub last_error: Option<String>,
    pub time_until_half_open_secs: Option<u64>,
}

/// Thread-safe circuit breaker for one component.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let inner = BreakerState::new(&config);
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock_inner(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Current state, applying the lazy Open → HalfOpen transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock_inner();
        self.maybe_half_open(&mut inner);
        inner.state
    }

    /// True while calls must be skipped.
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Failures over all recorded calls since creation.
    pub fn failure_rate(&self) -> f64 {
        let inner = self.lock_inner();
        if inner.total_calls == 0 {
            0.0
        } else {
            inner.total_failures as f64 / inner.total_calls as f64
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock_inner();
        self.maybe_half_open(&mut inner);
        let failure_rate = if inner.total_calls == 0 {
            0.0
        } else {
            inner.total_failures as f64 / inner.total_calls as f64
        };
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            failure_rate,
            last_error: inner.last_error.clone(),
            time_until_half_open_secs: (inner.state == CircuitState::Open)
                .then(|| inner.remaining_open_time().as_secs()),
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock_inner();
        self.maybe_half_open(&mut inner);
        inner.total_calls += 1;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    tracing::info!(
                        circuit = %self.name,
                        probes = inner.success_count,
                        "Circuit closing"
                    );
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.last_error = None;
                    inner.current_recovery_timeout = self.config.recovery_timeout();
                }
            }
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, error: &AppError) {
        let mut inner = self.lock_inner();
        self.maybe_half_open(&mut inner);
        inner.total_calls += 1;
        inner.total_failures += 1;
        inner.last_error = Some(error.to_string());

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                inner.last_failure_time = Some(Instant::now());
                if inner.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.failure_count,
                        error = %error,
                        "Circuit opening"
                    );
                    inner.state = CircuitState::Open;
                    self.stretch_on_rate_limit(&mut inner, error);
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(circuit = %self.name, error = %error, "Probe failed, circuit reopening");
                inner.state = CircuitState::Open;
                inner.last_failure_time = Some(Instant::now());
                inner.success_count = 0;
                self.stretch_on_rate_limit(&mut inner, error);
            }
            CircuitState::Open => {}
        }
    }

    fn stretch_on_rate_limit(&self, inner: &mut BreakerState, error: &AppError) {
        if !error.is_rate_limit() {
            return;
        }
        inner.current_recovery_timeout = std::cmp::min(
            inner
                .current_recovery_timeout
                .mul_f32(self.config.rate_limit_backoff_multiplier),
            self.config.max_recovery_timeout(),
        );
        tracing::info!(
            circuit = %self.name,
            recovery_timeout_secs = inner.current_recovery_timeout.as_secs(),
            "Extended recovery timeout due to rate limit"
        );
    }

    fn maybe_half_open(&self, inner: &mut BreakerState) {
        if inner.state == CircuitState::Open
            && let Some(last_failure) = inner.last_failure_time
            && last_failure.elapsed() >= inner.current_recovery_timeout
        {
            tracing::info!(circuit = %self.name, "Circuit half-open");
            inner.state = CircuitState::HalfOpen;
            inner.success_count = 0;
        }
    }
}

/// Breakers keyed by component (source id, "ai-fallback", ...), created on
/// first use with a shared config.
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Arc<Mutex<HashMap<String, CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn get(&self, component: &str) -> CircuitBreaker {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        breakers
            .entry(component.to_string())
            .or_insert_with(|| CircuitBreaker::new(component, self.config.clone()))
            .clone()
    }

    /// Stats for every breaker created so far, sorted by name.
    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        let breakers: Vec<CircuitBreaker> = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        let mut stats: Vec<_> = breakers.iter().map(CircuitBreaker::stats).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick(failure_threshold: u32, success_threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            success_threshold,
            recovery_timeout_secs: 0,
            ..Default::default()
        }
    }

    fn net() -> AppError {
        AppError::NetworkError("connection reset".into())
    }

    #[test]
    fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::new("source-a", CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(!cb.is_open());
        assert_eq!(cb.failure_rate(), 0.0);
    }

    #[test]
    fn test_opens_at_threshold() {
        let cb = CircuitBreaker::new("source-a", CircuitBreakerConfig::default());
        for _ in 0..4 {
            cb.record_failure(&net());
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure(&net());
        assert!(cb.is_open());
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let cb = CircuitBreaker::new("source-a", CircuitBreakerConfig::default());
        for _ in 0..4 {
            cb.record_failure(&net());
        }
        cb.record_success();
        for _ in 0..4 {
            cb.record_failure(&net());
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_threshold_timeout_half_open_close_sequence() {
        let cb = CircuitBreaker::new("source-a", quick(2, 2));

        cb.record_failure(&net());
        cb.record_failure(&net());
        // Zero recovery timeout: the next read moves straight to half-open.
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_open_blocks_until_timeout() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout_secs: 300,
            ..Default::default()
        };
        let cb = CircuitBreaker::new("source-a", config);
        cb.record_failure(&net());
        assert!(cb.is_open());
        let stats = cb.stats();
        assert!(stats.time_until_half_open_secs.unwrap() > 290);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 2,
            recovery_timeout_secs: 0,
            ..Default::default()
        };
        let cb = CircuitBreaker::new("source-a", config);
        cb.record_failure(&net());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        // Stretch the timeout so the reopened state is observable.
        {
            let mut inner = cb.lock_inner();
            inner.current_recovery_timeout = Duration::from_secs(60);
        }
        cb.record_failure(&net());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_rate_limit_extends_recovery_timeout() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout_secs: 30,
            rate_limit_backoff_multiplier: 2.0,
            max_recovery_timeout_secs: 300,
            ..Default::default()
        };
        let cb = CircuitBreaker::new("llm", config);
        cb.record_failure(&AppError::RateLimitExceeded);
        assert!(cb.stats().time_until_half_open_secs.unwrap() > 55);
    }

    #[test]
    fn test_failure_rate() {
        let cb = CircuitBreaker::new("source-a", CircuitBreakerConfig::default());
        cb.record_success();
        cb.record_success();
        cb.record_success();
        cb.record_failure(&net());
        assert!((cb.failure_rate() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_registry_shares_breakers_by_component() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout_secs: 60,
            ..Default::default()
        });
        registry.get("a").record_failure(&net());
        assert!(registry.get("a").is_open());
        assert!(!registry.get("b").is_open());

        let stats = registry.stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].name, "a");
    }
}
