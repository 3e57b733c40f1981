//! Error classification, recovery decisions and error statistics, bundled
//! with the circuit breakers and rate limiter into one injected layer.

pub mod classify;
pub mod recovery;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

pub use classify::{Classification, ErrorCategory, ErrorClassifier, ErrorSeverity, SuggestedAction};
pub use recovery::{RecoveryAction, RecoveryConfig, RecoveryContext, RecoveryPolicy};

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::error::AppError;
use crate::rate_limiter::{RateLimitConfig, RateLimiter};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub recovery: RecoveryConfig,
}

/// Counts of handled errors, for observability.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorStatistics {
    pub total_errors: u64,
    pub by_category: BTreeMap<String, u64>,
    pub by_severity: BTreeMap<String, u64>,
    pub by_action: BTreeMap<String, u64>,
    pub recovery_attempts: u64,
    pub recovery_successes: u64,
    pub recovery_success_rate: f64,
}

impl ErrorStatistics {
    /// Counts accumulated after `earlier` was taken from the same source.
    pub fn since(&self, earlier: &ErrorStatistics) -> ErrorStatistics {
        fn diff(now: &BTreeMap<String, u64>, then: &BTreeMap<String, u64>) -> BTreeMap<String, u64> {
            now.iter()
                .filter_map(|(key, count)| {
                    let delta = count.saturating_sub(then.get(key).copied().unwrap_or(0));
                    (delta > 0).then(|| (key.clone(), delta))
                })
                .collect()
        }

        let recovery_attempts = self.recovery_attempts.saturating_sub(earlier.recovery_attempts);
        let recovery_successes = self.recovery_successes.saturating_sub(earlier.recovery_successes);
        ErrorStatistics {
            total_errors: self.total_errors.saturating_sub(earlier.total_errors),
            by_category: diff(&self.by_category, &earlier.by_category),
            by_severity: diff(&self.by_severity, &earlier.by_severity),
            by_action: diff(&self.by_action, &earlier.by_action),
            recovery_attempts,
            recovery_successes,
            recovery_success_rate: if recovery_attempts == 0 {
                0.0
            } else {
                recovery_successes as f64 / recovery_attempts as f64
            },
        }
    }
}

#[derive(Clone, Default)]
pub struct ErrorStats {
    inner: Arc<Mutex<ErrorStatistics>>,
}

impl ErrorStats {
    fn lock(&self) -> MutexGuard<'_, ErrorStatistics> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, classification: &Classification, action: &RecoveryAction) {
        let mut stats = self.lock();
        stats.total_errors += 1;
        *stats
            .by_category
            .entry(classification.category.as_str().to_string())
            .or_default() += 1;
        *stats
            .by_severity
            .entry(classification.severity.as_str().to_string())
            .or_default() += 1;
        *stats
            .by_action
            .entry(action.as_str().to_string())
            .or_default() += 1;
    }

    /// Record whether an attempted recovery (retry or fallback) worked.
    pub fn record_recovery(&self, success: bool) {
        let mut stats = self.lock();
        stats.recovery_attempts += 1;
        if success {
            stats.recovery_successes += 1;
        }
        stats.recovery_success_rate =
            stats.recovery_successes as f64 / stats.recovery_attempts as f64;
    }

    pub fn snapshot(&self) -> ErrorStatistics {
        self.lock().clone()
    }
}

/// Classifier, policy, breakers, limiter and stats shared by the collection
/// service and the scheduler.
#[derive(Clone)]
pub struct ResilienceLayer {
    classifier: ErrorClassifier,
    policy: RecoveryPolicy,
    breakers: CircuitBreakerRegistry,
    limiter: RateLimiter,
    stats: ErrorStats,
}

impl ResilienceLayer {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            classifier: ErrorClassifier::default(),
            policy: RecoveryPolicy::new(config.recovery),
            breakers: CircuitBreakerRegistry::new(config.circuit_breaker),
            limiter: RateLimiter::new(config.rate_limit),
            stats: ErrorStats::default(),
        }
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn stats(&self) -> &ErrorStats {
        &self.stats
    }

    /// Classify, decide, record and log one error.
    pub fn handle(&self, error: &AppError, ctx: &RecoveryContext) -> (Classification, RecoveryAction) {
        let classification = self.classifier.classify(error, ctx.stage);
        let action = self.policy.decide(&classification, ctx);
        self.stats.record(&classification, &action);

        tracing::warn!(
            component = %ctx.component,
            operation = %ctx.operation,
            attempt = ctx.attempt,
            category = %classification.category,
            severity = %classification.severity,
            action = action.as_str(),
            error = %error,
            "Handled error"
        );

        (classification, action)
    }
}

impl Default for ResilienceLayer {
    fn default() -> Self {
        Self::new(ResilienceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_records_statistics() {
        let layer = ResilienceLayer::default();
        let ctx = RecoveryContext::new("src", "fetch");

        layer.handle(&AppError::NetworkError("reset".into()), &ctx);
        layer.handle(&AppError::ParseError("bad".into()), &ctx);
        layer.handle(&AppError::Timeout(10), &ctx.clone().with_attempt(3));

        let stats = layer.stats().snapshot();
        assert_eq!(stats.total_errors, 3);
        assert_eq!(stats.by_category.get("network"), Some(&1));
        assert_eq!(stats.by_category.get("malformed_response"), Some(&1));
        assert_eq!(stats.by_action.get("retry"), Some(&1));
        assert_eq!(stats.by_action.get("fallback"), Some(&1));
        assert_eq!(stats.by_action.get("skip"), Some(&1));
        assert_eq!(stats.by_severity.get("medium"), Some(&2));
    }

    #[test]
    fn test_statistics_since_earlier_snapshot() {
        let layer = ResilienceLayer::default();
        let ctx = RecoveryContext::new("src", "fetch");
        layer.handle(&AppError::NetworkError("reset".into()), &ctx);
        layer.stats().record_recovery(false);
        let before = layer.stats().snapshot();

        layer.handle(&AppError::ParseError("bad".into()), &ctx);
        layer.stats().record_recovery(true);
        let delta = layer.stats().snapshot().since(&before);

        assert_eq!(delta.total_errors, 1);
        assert_eq!(delta.by_category.get("network"), None);
        assert_eq!(delta.by_category.get("malformed_response"), Some(&1));
        assert_eq!(delta.recovery_attempts, 1);
        assert!((delta.recovery_success_rate - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_recovery_success_rate() {
        let stats = ErrorStats::default();
        stats.record_recovery(true);
        stats.record_recovery(false);
        stats.record_recovery(true);
        stats.record_recovery(true);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.recovery_attempts, 4);
        assert!((snapshot.recovery_success_rate - 0.75).abs() < 1e-9);
    }
}
