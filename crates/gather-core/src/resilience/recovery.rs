use std::time::Duration;

use chrono::{DateTime, TimeDelta, Timelike, Utc};
use serde::{Deserialize, Serialize};

use super::classify::{Classification, ErrorCategory, SuggestedAction};
use crate::models::CollectionStage;

/// Where an error happened.
#[derive(Debug, Clone)]
pub struct RecoveryContext {
    pub component: String,
    pub operation: String,
    pub stage: Option<CollectionStage>,
    /// 1 for the first failure of this operation.
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

impl RecoveryContext {
    pub fn new(component: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            operation: operation.into(),
            stage: None,
            attempt: 1,
            at: Utc::now(),
        }
    }

    pub fn with_stage(mut self, stage: CollectionStage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }

    fn is_critical(&self) -> bool {
        self.stage.is_some_and(|s| s.is_critical())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    Retry { delay: Duration, max_attempts: u32 },
    /// Continue with substitute data.
    Fallback(serde_json::Value),
    Skip,
    Fail,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryAction::Retry { .. } => "retry",
            RecoveryAction::Fallback(_) => "fallback",
            RecoveryAction::Skip => "skip",
            RecoveryAction::Fail => "fail",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub base_delay_ms: u64,
    pub max_attempts: u32,
    /// Rate-limit retries wait this many times longer.
    pub rate_limit_delay_factor: u32,
    /// Local-time window [start, end) in which retry delays are halved.
    pub off_peak_start_hour: u32,
    pub off_peak_end_hour: u32,
    /// Offset of the region's local time from UTC.
    pub utc_offset_hours: i64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_attempts: 2,
            rate_limit_delay_factor: 5,
            off_peak_start_hour: 22,
            off_peak_end_hour: 6,
            utc_offset_hours: 9,
        }
    }
}

impl RecoveryConfig {
    pub fn is_off_peak(&self, at: DateTime<Utc>) -> bool {
        let hour = (at + TimeDelta::hours(self.utc_offset_hours)).hour();
        let (start, end) = (self.off_peak_start_hour, self.off_peak_end_hour);
        if start <= end {
            (start..end).contains(&hour)
        } else {
            hour >= start || hour < end
        }
    }
}

/// Turns a classification plus context into a recovery action.
#[derive(Debug, Clone, Default)]
pub struct RecoveryPolicy {
    config: RecoveryConfig,
}

impl RecoveryPolicy {
    pub fn new(config: RecoveryConfig) -> Self {
        Self { config }
    }

    pub fn decide(&self, classification: &Classification, ctx: &RecoveryContext) -> RecoveryAction {
        if ctx.attempt > 2 {
            return RecoveryAction::Skip;
        }

        match classification.suggested {
            // Unmatched errors only reach here on critical stages: one retry.
            SuggestedAction::Retry if classification.category == ErrorCategory::Unknown => {
                if ctx.attempt <= 1 {
                    RecoveryAction::Retry {
                        delay: self.retry_delay(classification, ctx),
                        max_attempts: 1,
                    }
                } else {
                    RecoveryAction::Skip
                }
            }
            SuggestedAction::Retry => RecoveryAction::Retry {
                delay: self.retry_delay(classification, ctx),
                max_attempts: self.config.max_attempts,
            },
            SuggestedAction::Fallback => RecoveryAction::Fallback(serde_json::json!({
                "component": ctx.component,
                "operation": ctx.operation,
                "events": [],
            })),
            SuggestedAction::Skip if ctx.is_critical() && ctx.attempt <= 1 => {
                RecoveryAction::Retry {
                    delay: self.retry_delay(classification, ctx),
                    max_attempts: 1,
                }
            }
            SuggestedAction::Skip => RecoveryAction::Skip,
            SuggestedAction::Fail => RecoveryAction::Fail,
        }
    }

    fn retry_delay(&self, classification: &Classification, ctx: &RecoveryContext) -> Duration {
        let exponent = ctx.attempt.saturating_sub(1).min(10);
        let mut delay_ms = self.config.base_delay_ms.saturating_mul(1 << exponent);
        if classification.category == ErrorCategory::RateLimit {
            delay_ms = delay_ms.saturating_mul(self.config.rate_limit_delay_factor as u64);
        }
        if self.config.is_off_peak(ctx.at) {
            delay_ms /= 2;
        }
        Duration::from_millis(delay_ms)
    }
}
