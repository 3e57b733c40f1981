use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::collect::CollectionRequest;

/// Status of a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// Failed, waiting for its backoff to elapse.
    Retrying,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Retrying => "retrying",
        }
    }

    /// The last run has finished and no retry is pending.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            "retrying" => Ok(JobStatus::Retrying),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// What a job does when it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobType {
    Collection { request: CollectionRequest },
    /// Fetch-history pruning.
    Maintenance,
    /// Snapshot and run-log retention.
    Cleanup,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Collection { .. } => "collection",
            JobType::Maintenance => "maintenance",
            JobType::Cleanup => "cleanup",
        }
    }
}

/// Optional caps applied when the job runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub max_concurrent_sources: Option<usize>,
    pub max_events: Option<usize>,
}

/// One finished execution of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub status: JobStatus,
    pub error: Option<String>,
    /// Handler-specific summary, e.g. event and error counts.
    pub summary: Option<serde_json::Value>,
}

/// Retry configuration with exponential backoff.
///
/// Delay for retry n (1-indexed): `base * multiplier^(n-1)`, capped at
/// `max_delay`, optionally scaled by a ±25% jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_secs: u64,
    pub multiplier: f64,
    pub max_delay_secs: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 60,
            multiplier: 2.0,
            max_delay_secs: 3600,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Un-jittered delay for a given retry number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> TimeDelta {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = (self.base_delay_secs as f64 * self.multiplier.powi(exponent))
            .min(self.max_delay_secs as f64);
        TimeDelta::milliseconds((secs * 1000.0) as i64)
    }

    pub fn next_delay(&self, attempt: u32) -> TimeDelta {
        let delay = self.delay_for_attempt(attempt);
        if !self.jitter {
            return delay;
        }
        TimeDelta::milliseconds((delay.num_milliseconds() as f64 * jitter_factor()) as i64)
    }
}

/// Uniform-ish factor in [0.75, 1.25).
// xorshift64 seeded from the clock.
fn jitter_factor() -> f64 {
    let mut x = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
        | 1;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    0.75 + (x % 10_000) as f64 / 20_000.0
}

/// A recurring job and its run state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: Uuid,
    pub name: String,
    pub job_type: JobType,
    /// Cron-like descriptor, see [`crate::schedule::Schedule`].
    pub schedule: String,
    pub enabled: bool,
    /// 1 = urgent … 4 = low.
    pub priority: u8,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_secs: u64,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    pub last_error: Option<String>,
    #[serde(default)]
    pub history: VecDeque<JobRun>,
}

impl ScheduledJob {
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Enabled, not running or cancelled, and its next run has arrived.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled
            && !matches!(self.status, JobStatus::Running | JobStatus::Cancelled)
            && self.next_run.is_some_and(|next| next <= now)
    }

    /// Append a run, keeping only the newest `limit` entries.
    pub fn push_history(&mut self, run: JobRun, limit: usize) {
        self.history.push_back(run);
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }
}

/// Request to register a job with the scheduler.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub job_type: JobType,
    pub schedule: String,
    pub enabled: bool,
    pub priority: u8,
    pub max_retries: u32,
    pub timeout_secs: u64,
    pub resource_limits: ResourceLimits,
}

impl NewJob {
    pub fn new(name: impl Into<String>, job_type: JobType, schedule: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            job_type,
            schedule: schedule.into(),
            enabled: true,
            priority: 3,
            max_retries: 3,
            timeout_secs: 1800,
            resource_limits: ResourceLimits::default(),
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = limits;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Configuration for the scheduler loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_secs: u64,
    pub health_check_interval_secs: u64,
    pub max_concurrent_jobs: usize,
    /// Finished runs kept per job.
    pub history_limit: usize,
    /// Abort jobs running longer than twice their timeout instead of only
    /// reporting them.
    pub cancel_stuck_jobs: bool,
    pub retry: RetryConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            health_check_interval_secs: 300,
            max_concurrent_jobs: 3,
            history_limit: 50,
            cancel_stuck_jobs: false,
            retry: RetryConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
            JobStatus::Retrying,
        ] {
            let parsed: JobStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Retrying.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_retry_delay_exponential_and_capped() {
        let config = RetryConfig {
            jitter: false,
            ..Default::default()
        };
        assert_eq!(config.delay_for_attempt(1), TimeDelta::minutes(1));
        assert_eq!(config.delay_for_attempt(2), TimeDelta::minutes(2));
        assert_eq!(config.delay_for_attempt(3), TimeDelta::minutes(4));
        assert_eq!(config.delay_for_attempt(10), TimeDelta::minutes(60));
        assert_eq!(config.next_delay(2), TimeDelta::minutes(2));
    }

    #[test]
    fn test_retry_jitter_is_bounded() {
        let config = RetryConfig::default();
        for _ in 0..100 {
            let d = config.next_delay(1).num_milliseconds();
            assert!((45_000..75_000).contains(&d), "got {d}");
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let mut job = crate::testutil::make_test_job("daily", JobType::Maintenance);
        let now = Utc::now();
        for _ in 0..5 {
            job.push_history(
                JobRun {
                    started_at: now,
                    completed_at: now,
                    status: JobStatus::Completed,
                    error: None,
                    summary: None,
                },
                3,
            );
        }
        assert_eq!(job.history.len(), 3);
    }

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        let mut job = crate::testutil::make_test_job("daily", JobType::Cleanup);
        job.next_run = Some(now - TimeDelta::seconds(1));
        assert!(job.is_due(now));

        job.status = JobStatus::Running;
        assert!(!job.is_due(now));

        job.status = JobStatus::Completed;
        job.enabled = false;
        assert!(!job.is_due(now));
    }

    #[test]
    fn test_job_type_serde_tagging() {
        let json = serde_json::to_value(JobType::Maintenance).unwrap();
        assert_eq!(json, serde_json::json!({"type": "maintenance"}));
        let back: JobType = serde_json::from_value(json).unwrap();
        assert_eq!(back, JobType::Maintenance);
    }

    #[test]
    fn test_new_job_builder() {
        let job = NewJob::new("weekly", JobType::Cleanup, "@weekly")
            .with_priority(4)
            .with_max_retries(1)
            .disabled();
        assert_eq!(job.priority, 4);
        assert_eq!(job.max_retries, 1);
        assert!(!job.enabled);
    }
}
