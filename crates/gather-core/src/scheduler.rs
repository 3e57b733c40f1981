//! Recurring job scheduler.
//!
//! ```text
//! pending -> running -> completed
//!                    -> retrying -> pending      (retryable, retries left)
//!                    -> failed                   (next natural run)
//!                    -> cancelled
//! ```
//!
//! A poll loop dispatches due jobs by priority under a concurrency cap; a
//! health loop reports jobs running longer than twice their timeout.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::collect::CollectionRequest;
use crate::error::AppError;
use crate::job::{JobRun, JobStatus, JobType, NewJob, ScheduledJob, SchedulerConfig};
use crate::job_store::JobStore;
use crate::schedule::Schedule;

/// Executes a job's work. Returns a summary stored in the job history.
pub trait JobHandler: Send + Sync + Clone + 'static {
    fn handle(
        &self,
        job: &ScheduledJob,
    ) -> impl Future<Output = Result<serde_json::Value, AppError>> + Send;
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

/// Events emitted by the scheduler for monitoring/logging.
#[derive(Debug, Clone)]
pub enum SchedulerEvent<'a> {
    Started {
        jobs: usize,
    },
    JobDispatched {
        job_id: Uuid,
        name: &'a str,
        priority: u8,
    },
    JobCompleted {
        job_id: Uuid,
        name: &'a str,
        duration_ms: u64,
        next_run: Option<DateTime<Utc>>,
    },
    JobFailed {
        job_id: Uuid,
        name: &'a str,
        error: &'a str,
        will_retry: bool,
        next_run: Option<DateTime<Utc>>,
    },
    JobStuck {
        job_id: Uuid,
        name: &'a str,
        running_secs: u64,
        cancelled: bool,
    },
    ShuttingDown {
        aborted: usize,
    },
    Stopped,
}

/// Trait for receiving scheduler events (decoupled logging).
pub trait SchedulerReporter: Send + Sync {
    fn report(&self, event: SchedulerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSchedulerReporter;

impl SchedulerReporter for TracingSchedulerReporter {
    fn report(&self, event: SchedulerEvent<'_>) {
        match event {
            SchedulerEvent::Started { jobs } => {
                tracing::info!(%jobs, "Scheduler started");
            }
            SchedulerEvent::JobDispatched {
                job_id,
                name,
                priority,
            } => {
                tracing::info!(%job_id, %name, %priority, "Job dispatched");
            }
            SchedulerEvent::JobCompleted {
                job_id,
                name,
                duration_ms,
                next_run,
            } => {
                tracing::info!(%job_id, %name, %duration_ms, ?next_run, "Job completed");
            }
            SchedulerEvent::JobFailed {
                job_id,
                name,
                error,
                will_retry,
                next_run,
            } => {
                tracing::warn!(%job_id, %name, %error, %will_retry, ?next_run, "Job failed");
            }
            SchedulerEvent::JobStuck {
                job_id,
                name,
                running_secs,
                cancelled,
            } => {
                tracing::error!(%job_id, %name, %running_secs, %cancelled, "Job appears stuck");
            }
            SchedulerEvent::ShuttingDown { aborted } => {
                tracing::info!(%aborted, "Scheduler shutting down");
            }
            SchedulerEvent::Stopped => {
                tracing::info!("Scheduler stopped");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Static jobs
// ---------------------------------------------------------------------------

/// Jobs registered at start when absent. Times are UTC (06:00, 03:00 Monday,
/// 02:30 and 04:00 Sunday in Japan).
pub fn static_jobs(collection: &CollectionRequest) -> Vec<NewJob> {
    let full_refresh = CollectionRequest {
        force_refresh: true,
        ..collection.clone()
    };
    vec![
        NewJob::new(
            "daily-collection",
            JobType::Collection {
                request: collection.clone(),
            },
            "0 21 * * *",
        )
        .with_priority(2),
        NewJob::new(
            "weekly-full-refresh",
            JobType::Collection {
                request: full_refresh,
            },
            "0 18 * * 0",
        )
        .with_priority(2)
        .with_timeout(3600),
        NewJob::new("daily-maintenance", JobType::Maintenance, "30 17 * * *")
            .with_priority(3)
            .with_timeout(600),
        NewJob::new("weekly-cleanup", JobType::Cleanup, "0 19 * * 6")
            .with_priority(4)
            .with_timeout(600),
    ]
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

struct RunningJob {
    abort: AbortHandle,
    started: Instant,
}

pub struct Scheduler<S: JobStore, H: JobHandler> {
    store: S,
    handler: H,
    config: SchedulerConfig,
    jobs: AsyncMutex<HashMap<Uuid, ScheduledJob>>,
    running: Mutex<HashMap<Uuid, RunningJob>>,
}

impl<S: JobStore, H: JobHandler> Scheduler<S, H> {
    pub fn new(store: S, handler: H, config: SchedulerConfig) -> Self {
        Self {
            store,
            handler,
            config,
            jobs: AsyncMutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn lock_running(&self) -> MutexGuard<'_, HashMap<Uuid, RunningJob>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn persist(&self, jobs: &HashMap<Uuid, ScheduledJob>) -> Result<(), AppError> {
        let mut all: Vec<ScheduledJob> = jobs.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        self.store.save(&all).await
    }

    /// Load persisted jobs. Jobs left `running` by a previous process are
    /// reset to `pending`; missing next runs are recomputed.
    pub async fn load(&self) -> Result<usize, AppError> {
        let stored = self.store.load().await?;
        let now = Utc::now();
        let mut jobs = self.jobs.lock().await;
        for mut job in stored {
            if job.status == JobStatus::Running {
                tracing::warn!(job_id = %job.id, name = %job.name, "Recovering job interrupted mid-run");
                job.status = JobStatus::Pending;
                job.next_run = Some(now);
            }
            if job.next_run.is_none() && job.status != JobStatus::Cancelled {
                job.next_run = job
                    .schedule
                    .parse::<Schedule>()
                    .ok()
                    .and_then(|s| s.next_after(now));
            }
            jobs.insert(job.id, job);
        }
        Ok(jobs.len())
    }

    /// Register a job, compute its first run and persist it.
    pub async fn schedule_job(&self, new: NewJob) -> Result<ScheduledJob, AppError> {
        if !(1..=4).contains(&new.priority) {
            return Err(AppError::InvalidRequest(format!(
                "priority must be 1-4, got {}",
                new.priority
            )));
        }
        if new.name.trim().is_empty() {
            return Err(AppError::InvalidRequest("job name must not be empty".into()));
        }
        if let JobType::Collection { request } = &new.job_type {
            request.validate()?;
        }
        let schedule: Schedule = new.schedule.parse()?;
        let now = Utc::now();
        let next_run = schedule.next_after(now).ok_or_else(|| {
            AppError::InvalidRequest(format!("schedule '{}' never fires", new.schedule))
        })?;

        let job = ScheduledJob {
            id: Uuid::new_v4(),
            name: new.name,
            job_type: new.job_type,
            schedule: new.schedule,
            enabled: new.enabled,
            priority: new.priority,
            status: JobStatus::Pending,
            created_at: now,
            scheduled_at: Some(next_run),
            started_at: None,
            completed_at: None,
            last_run: None,
            next_run: Some(next_run),
            retry_count: 0,
            max_retries: new.max_retries,
            timeout_secs: new.timeout_secs,
            resource_limits: new.resource_limits,
            last_error: None,
            history: Default::default(),
        };

        let mut jobs = self.jobs.lock().await;
        if jobs.values().any(|j| j.name == job.name) {
            return Err(AppError::InvalidRequest(format!(
                "job '{}' already exists",
                job.name
            )));
        }
        jobs.insert(job.id, job.clone());
        self.persist(&jobs).await?;
        tracing::info!(job_id = %job.id, name = %job.name, next_run = %next_run, "Job scheduled");
        Ok(job)
    }

    /// Register the static job set, skipping names already present.
    pub async fn register_static_jobs(
        &self,
        collection: &CollectionRequest,
    ) -> Result<Vec<ScheduledJob>, AppError> {
        let existing: Vec<String> = self
            .jobs
            .lock()
            .await
            .values()
            .map(|j| j.name.clone())
            .collect();

        let mut registered = Vec::new();
        for new in static_jobs(collection) {
            if existing.contains(&new.name) {
                continue;
            }
            registered.push(self.schedule_job(new).await?);
        }
        Ok(registered)
    }

    pub async fn get_job(&self, id: Uuid) -> Option<ScheduledJob> {
        self.jobs.lock().await.get(&id).cloned()
    }

    /// All jobs, most urgent first.
    pub async fn list_jobs(&self) -> Vec<ScheduledJob> {
        let mut jobs: Vec<ScheduledJob> = self.jobs.lock().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.name.cmp(&b.name)));
        jobs
    }

    pub async fn job_history(&self, id: Uuid) -> Result<Vec<JobRun>, AppError> {
        self.jobs
            .lock()
            .await
            .get(&id)
            .map(|job| job.history.iter().cloned().collect())
            .ok_or_else(|| AppError::NotFound(format!("job {id}")))
    }

    /// Cancel a job; a running execution is aborted.
    pub async fn cancel_job(&self, id: Uuid) -> Result<(), AppError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("job {id}")))?;
        job.status = JobStatus::Cancelled;
        job.next_run = None;
        if let Some(running) = self.lock_running().remove(&id) {
            running.abort.abort();
        }
        tracing::info!(job_id = %id, name = %job.name, "Job cancelled");
        self.persist(&jobs).await
    }

    /// Ids of due jobs in dispatch order: priority, then oldest next run.
    pub async fn due_jobs(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let jobs = self.jobs.lock().await;
        let mut heap: BinaryHeap<Reverse<(u8, DateTime<Utc>, Uuid)>> = jobs
            .values()
            .filter(|job| job.is_due(now))
            .filter_map(|job| job.next_run.map(|next| Reverse((job.priority, next, job.id))))
            .collect();

        let mut due = Vec::with_capacity(heap.len());
        while let Some(Reverse((_, _, id))) = heap.pop() {
            due.push(id);
        }
        due
    }

    /// Dispatch due jobs up to the concurrency limit. Returns dispatched ids.
    pub async fn tick<R: SchedulerReporter + 'static>(
        self: &Arc<Self>,
        now: DateTime<Utc>,
        reporter: &Arc<R>,
    ) -> Vec<Uuid> {
        let due = self.due_jobs(now).await;
        let mut dispatched = Vec::new();

        let mut running = self.lock_running();
        let capacity = self.config.max_concurrent_jobs.saturating_sub(running.len());
        let ready: Vec<Uuid> = due
            .into_iter()
            .filter(|id| !running.contains_key(id))
            .take(capacity)
            .collect();
        for id in ready {
            let scheduler = Arc::clone(self);
            let task_reporter = Arc::clone(reporter);
            let handle = tokio::spawn(async move {
                if let Err(e) = scheduler.execute_job(id, task_reporter.as_ref()).await {
                    tracing::error!(job_id = %id, error = %e, "Job execution aborted");
                }
                scheduler.lock_running().remove(&id);
            });
            running.insert(
                id,
                RunningJob {
                    abort: handle.abort_handle(),
                    started: Instant::now(),
                },
            );
            dispatched.push(id);
        }
        dispatched
    }

    /// Run one job to completion and apply the outcome. Returns the job's
    /// resulting status.
    pub async fn execute_job<R: SchedulerReporter + ?Sized>(
        &self,
        id: Uuid,
        reporter: &R,
    ) -> Result<JobStatus, AppError> {
        let started_at = Utc::now();
        let job = {
            let mut jobs = self.jobs.lock().await;
            let job = jobs
                .get_mut(&id)
                .ok_or_else(|| AppError::NotFound(format!("job {id}")))?;
            if job.status == JobStatus::Running {
                return Err(AppError::InvalidRequest(format!(
                    "job '{}' is already running",
                    job.name
                )));
            }
            let previous = (job.status, job.started_at);
            job.status = JobStatus::Running;
            job.started_at = Some(started_at);
            let snapshot = job.clone();
            if let Err(e) = self.persist(&jobs).await {
                if let Some(job) = jobs.get_mut(&id) {
                    (job.status, job.started_at) = previous;
                }
                return Err(e);
            }
            snapshot
        };

        reporter.report(SchedulerEvent::JobDispatched {
            job_id: id,
            name: &job.name,
            priority: job.priority,
        });

        let clock = Instant::now();
        let outcome = match tokio::time::timeout(job.timeout(), self.handler.handle(&job)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::SchedulerTimeout {
                job: job.name.clone(),
                seconds: job.timeout_secs,
            }),
        };
        let duration_ms = clock.elapsed().as_millis() as u64;
        let now = Utc::now();

        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("job {id}")))?;

        if job.status == JobStatus::Cancelled {
            return Ok(JobStatus::Cancelled);
        }

        let natural_next = job
            .schedule
            .parse::<Schedule>()
            .ok()
            .and_then(|s| s.next_after(now));

        job.last_run = Some(started_at);
        job.completed_at = Some(now);

        let run = match outcome {
            Ok(summary) => {
                job.status = JobStatus::Completed;
                job.retry_count = 0;
                job.last_error = None;
                job.next_run = natural_next;
                job.scheduled_at = natural_next;
                reporter.report(SchedulerEvent::JobCompleted {
                    job_id: id,
                    name: &job.name,
                    duration_ms,
                    next_run: job.next_run,
                });
                JobRun {
                    started_at,
                    completed_at: now,
                    status: JobStatus::Completed,
                    error: None,
                    summary: Some(summary),
                }
            }
            Err(e) => {
                let error = e.to_string();
                let will_retry = job.can_retry() && e.is_retryable();
                if will_retry {
                    job.retry_count += 1;
                    job.status = JobStatus::Retrying;
                    job.next_run = Some(now + self.config.retry.next_delay(job.retry_count));
                } else {
                    job.status = JobStatus::Failed;
                    job.retry_count = 0;
                    job.next_run = natural_next;
                    job.scheduled_at = natural_next;
                }
                job.last_error = Some(error.clone());
                reporter.report(SchedulerEvent::JobFailed {
                    job_id: id,
                    name: &job.name,
                    error: &error,
                    will_retry,
                    next_run: job.next_run,
                });
                JobRun {
                    started_at,
                    completed_at: now,
                    status: JobStatus::Failed,
                    error: Some(error),
                    summary: None,
                }
            }
        };

        job.push_history(run, self.config.history_limit);
        let status = job.status;
        // The outcome stays applied in memory; the next successful save
        // carries it to disk.
        if let Err(e) = self.persist(&jobs).await {
            tracing::error!(job_id = %id, error = %e, "Failed to persist job outcome");
        }
        Ok(status)
    }

    /// Report jobs running longer than twice their timeout; abort them when
    /// `cancel_stuck_jobs` is set. Returns the stuck job ids.
    pub async fn check_health<R: SchedulerReporter + ?Sized>(&self, reporter: &R) -> Vec<Uuid> {
        let mut jobs = self.jobs.lock().await;
        let mut stuck = Vec::new();
        {
            let mut running = self.lock_running();
            for (id, entry) in running.iter() {
                let Some(job) = jobs.get(id) else { continue };
                let elapsed = entry.started.elapsed();
                if elapsed > job.timeout() * 2 {
                    reporter.report(SchedulerEvent::JobStuck {
                        job_id: *id,
                        name: &job.name,
                        running_secs: elapsed.as_secs(),
                        cancelled: self.config.cancel_stuck_jobs,
                    });
                    stuck.push(*id);
                }
            }
            if self.config.cancel_stuck_jobs {
                for id in &stuck {
                    if let Some(entry) = running.remove(id) {
                        entry.abort.abort();
                    }
                }
            }
        }

        if self.config.cancel_stuck_jobs && !stuck.is_empty() {
            let now = Utc::now();
            for id in &stuck {
                if let Some(job) = jobs.get_mut(id) {
                    job.status = JobStatus::Failed;
                    job.retry_count = 0;
                    job.last_error = Some("aborted after exceeding twice its timeout".into());
                    job.next_run = job
                        .schedule
                        .parse::<Schedule>()
                        .ok()
                        .and_then(|s| s.next_after(now));
                }
            }
            if let Err(e) = self.persist(&jobs).await {
                tracing::error!(error = %e, "Failed to persist jobs after stuck-job cancellation");
            }
        }
        stuck
    }

    /// Run the poll and health loops until cancellation. Running jobs are
    /// aborted on shutdown and left `pending` for the next start.
    pub async fn run<R: SchedulerReporter + 'static>(
        self: Arc<Self>,
        cancel_token: CancellationToken,
        reporter: Arc<R>,
    ) -> Result<(), AppError> {
        let job_count = self.jobs.lock().await.len();
        reporter.report(SchedulerEvent::Started { jobs: job_count });

        let mut poll = tokio::time::interval(self.config.poll_interval());
        let mut health = tokio::time::interval(self.config.health_check_interval());

        loop {
            tokio::select! {
                () = cancel_token.cancelled() => break,
                _ = poll.tick() => {
                    self.tick(Utc::now(), &reporter).await;
                }
                _ = health.tick() => {
                    self.check_health(reporter.as_ref()).await;
                }
            }
        }

        let aborted: Vec<Uuid> = {
            let mut running = self.lock_running();
            running
                .drain()
                .map(|(id, entry)| {
                    entry.abort.abort();
                    id
                })
                .collect()
        };
        if !aborted.is_empty() {
            let mut jobs = self.jobs.lock().await;
            for id in &aborted {
                if let Some(job) = jobs.get_mut(id)
                    && job.status == JobStatus::Running
                {
                    job.status = JobStatus::Pending;
                }
            }
            self.persist(&jobs).await?;
        }

        reporter.report(SchedulerEvent::ShuttingDown {
            aborted: aborted.len(),
        });
        reporter.report(SchedulerEvent::Stopped);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::job::RetryConfig;
    use crate::testutil::{MockJobHandler, MockJobStore, MockReporter};

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            retry: RetryConfig {
                base_delay_secs: 1,
                jitter: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn network_error() -> AppError {
        AppError::NetworkError("connection refused".into())
    }

    #[tokio::test]
    async fn test_schedule_job_computes_next_run_and_persists() {
        let store = MockJobStore::new();
        let scheduler = Scheduler::new(store.clone(), MockJobHandler::succeeding(), config());

        let job = scheduler
            .schedule_job(NewJob::new("hourly", JobType::Maintenance, "@hourly"))
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.next_run.unwrap() > Utc::now());
        assert_eq!(store.saved().len(), 1);
    }

    #[tokio::test]
    async fn test_schedule_job_rejects_bad_input() {
        let scheduler = Scheduler::new(MockJobStore::new(), MockJobHandler::succeeding(), config());

        let bad_priority = NewJob::new("a", JobType::Maintenance, "@daily").with_priority(9);
        assert!(scheduler.schedule_job(bad_priority).await.is_err());

        let bad_schedule = NewJob::new("b", JobType::Maintenance, "whenever");
        assert!(scheduler.schedule_job(bad_schedule).await.is_err());

        let never = NewJob::new("c", JobType::Maintenance, "0 0 31 2 *");
        assert!(scheduler.schedule_job(never).await.is_err());

        scheduler
            .schedule_job(NewJob::new("d", JobType::Maintenance, "@daily"))
            .await
            .unwrap();
        let duplicate = NewJob::new("d", JobType::Cleanup, "@daily");
        assert!(scheduler.schedule_job(duplicate).await.is_err());
    }

    #[tokio::test]
    async fn test_success_resets_retry_count() {
        let handler = MockJobHandler::with_results(vec![Err(network_error()), Ok(serde_json::json!({}))]);
        let scheduler = Scheduler::new(MockJobStore::new(), handler, config());
        let reporter = MockReporter::new();
        let job = scheduler
            .schedule_job(NewJob::new("collect", JobType::Maintenance, "@daily"))
            .await
            .unwrap();

        let status = scheduler.execute_job(job.id, &reporter).await.unwrap();
        assert_eq!(status, JobStatus::Retrying);
        assert_eq!(scheduler.get_job(job.id).await.unwrap().retry_count, 1);

        let status = scheduler.execute_job(job.id, &reporter).await.unwrap();
        assert_eq!(status, JobStatus::Completed);
        let job = scheduler.get_job(job.id).await.unwrap();
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.history.len(), 2);
        assert!(job.next_run.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_retry_exhaustion_marks_failed() {
        let handler = MockJobHandler::with_results((0..4).map(|_| Err(network_error())).collect());
        let scheduler = Scheduler::new(MockJobStore::new(), handler.clone(), config());
        let reporter = MockReporter::new();
        let job = scheduler
            .schedule_job(NewJob::new("collect", JobType::Maintenance, "@daily").with_max_retries(3))
            .await
            .unwrap();

        let mut statuses = Vec::new();
        for _ in 0..4 {
            statuses.push(scheduler.execute_job(job.id, &reporter).await.unwrap());
        }

        assert_eq!(
            statuses,
            vec![
                JobStatus::Retrying,
                JobStatus::Retrying,
                JobStatus::Retrying,
                JobStatus::Failed
            ]
        );
        let job = scheduler.get_job(job.id).await.unwrap();
        assert_eq!(job.retry_count, 0);
        assert!(job.last_error.is_some());
        assert_eq!(handler.calls(), 4);
        assert_eq!(reporter.failures(), 4);
    }

    #[tokio::test]
    async fn test_retry_backoff_grows() {
        let handler = MockJobHandler::with_results((0..2).map(|_| Err(network_error())).collect());
        let scheduler = Scheduler::new(MockJobStore::new(), handler, config());
        let reporter = MockReporter::new();
        let job = scheduler
            .schedule_job(NewJob::new("collect", JobType::Maintenance, "@daily"))
            .await
            .unwrap();

        scheduler.execute_job(job.id, &reporter).await.unwrap();
        let first = scheduler.get_job(job.id).await.unwrap();
        let first_delay = first.next_run.unwrap() - first.completed_at.unwrap();

        scheduler.execute_job(job.id, &reporter).await.unwrap();
        let second = scheduler.get_job(job.id).await.unwrap();
        let second_delay = second.next_run.unwrap() - second.completed_at.unwrap();

        assert_eq!(first_delay.num_seconds(), 1);
        assert_eq!(second_delay.num_seconds(), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_waits_for_next_run() {
        let handler = MockJobHandler::with_results(vec![Err(AppError::ConfigError("bad".into()))]);
        let scheduler = Scheduler::new(MockJobStore::new(), handler, config());
        let reporter = MockReporter::new();
        let job = scheduler
            .schedule_job(NewJob::new("collect", JobType::Maintenance, "@yearly"))
            .await
            .unwrap();

        let status = scheduler.execute_job(job.id, &reporter).await.unwrap();
        assert_eq!(status, JobStatus::Failed);
        let job = scheduler.get_job(job.id).await.unwrap();
        assert!(job.next_run.unwrap() > Utc::now() + chrono::TimeDelta::minutes(1));
    }

    #[tokio::test]
    async fn test_timeout_is_retryable_failure() {
        let handler = MockJobHandler::succeeding().with_delay(Duration::from_millis(1500));
        let scheduler = Scheduler::new(MockJobStore::new(), handler, config());
        let reporter = MockReporter::new();
        let job = scheduler
            .schedule_job(NewJob::new("slow", JobType::Maintenance, "@daily").with_timeout(1))
            .await
            .unwrap();

        let status = scheduler.execute_job(job.id, &reporter).await.unwrap();
        assert_eq!(status, JobStatus::Retrying);
        let job = scheduler.get_job(job.id).await.unwrap();
        assert!(job.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_due_jobs_ordered_by_priority() {
        let scheduler = Scheduler::new(MockJobStore::new(), MockJobHandler::succeeding(), config());
        let low = scheduler
            .schedule_job(NewJob::new("low", JobType::Cleanup, "@hourly").with_priority(4))
            .await
            .unwrap();
        let urgent = scheduler
            .schedule_job(NewJob::new("urgent", JobType::Maintenance, "@hourly").with_priority(1))
            .await
            .unwrap();
        let disabled = scheduler
            .schedule_job(NewJob::new("off", JobType::Maintenance, "@hourly").disabled())
            .await
            .unwrap();

        let later = Utc::now() + chrono::TimeDelta::hours(2);
        let due = scheduler.due_jobs(later).await;
        assert_eq!(due, vec![urgent.id, low.id]);
        assert!(!due.contains(&disabled.id));
        assert!(scheduler.due_jobs(Utc::now()).await.is_empty());
    }

    #[tokio::test]
    async fn test_tick_respects_concurrency_limit() {
        let handler = MockJobHandler::succeeding().with_delay(Duration::from_millis(200));
        let scheduler = Arc::new(Scheduler::new(
            MockJobStore::new(),
            handler.clone(),
            SchedulerConfig {
                max_concurrent_jobs: 2,
                ..config()
            },
        ));
        for name in ["a", "b", "c"] {
            scheduler
                .schedule_job(NewJob::new(name, JobType::Maintenance, "@hourly"))
                .await
                .unwrap();
        }

        let reporter = Arc::new(MockReporter::new());
        let later = Utc::now() + chrono::TimeDelta::hours(2);
        assert_eq!(scheduler.tick(later, &reporter).await.len(), 2);
        assert!(scheduler.tick(later, &reporter).await.is_empty());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(handler.calls(), 2);
        assert_eq!(scheduler.tick(later, &reporter).await.len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_job() {
        let scheduler = Scheduler::new(MockJobStore::new(), MockJobHandler::succeeding(), config());
        let job = scheduler
            .schedule_job(NewJob::new("a", JobType::Maintenance, "@hourly"))
            .await
            .unwrap();

        scheduler.cancel_job(job.id).await.unwrap();
        let job = scheduler.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(scheduler.due_jobs(Utc::now() + chrono::TimeDelta::days(2)).await.is_empty());
        assert!(matches!(
            scheduler.cancel_job(Uuid::new_v4()).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_register_static_jobs_once() {
        let store = MockJobStore::new();
        let scheduler = Scheduler::new(store.clone(), MockJobHandler::succeeding(), config());
        let request = CollectionRequest::default();

        assert_eq!(scheduler.register_static_jobs(&request).await.unwrap().len(), 4);
        assert!(scheduler.register_static_jobs(&request).await.unwrap().is_empty());

        let jobs = scheduler.list_jobs().await;
        assert_eq!(jobs.len(), 4);
        assert_eq!(jobs[0].priority, 2);
        let refresh = jobs.iter().find(|j| j.name == "weekly-full-refresh").unwrap();
        assert!(matches!(
            &refresh.job_type,
            JobType::Collection { request } if request.force_refresh
        ));
    }

    #[tokio::test]
    async fn test_load_recovers_interrupted_jobs() {
        let store = MockJobStore::new();
        let mut job = crate::testutil::make_test_job("interrupted", JobType::Maintenance);
        job.status = JobStatus::Running;
        store.seed(vec![job.clone()]);

        let scheduler = Scheduler::new(store, MockJobHandler::succeeding(), config());
        assert_eq!(scheduler.load().await.unwrap(), 1);
        let loaded = scheduler.get_job(job.id).await.unwrap();
        assert_eq!(loaded.status, JobStatus::Pending);
        assert!(loaded.next_run.is_some());
    }

    #[tokio::test]
    async fn test_failed_dispatch_save_leaves_job_runnable() {
        let store = MockJobStore::new();
        let handler = MockJobHandler::succeeding();
        let scheduler = Scheduler::new(store.clone(), handler.clone(), config());
        let reporter = MockReporter::new();
        let job = scheduler
            .schedule_job(NewJob::new("hourly", JobType::Maintenance, "@hourly"))
            .await
            .unwrap();

        store.set_failing(true);
        let err = scheduler.execute_job(job.id, &reporter).await.unwrap_err();
        assert!(matches!(err, AppError::StorageError(_)));
        assert_eq!(handler.calls(), 0);

        store.set_failing(false);
        let restored = scheduler.get_job(job.id).await.unwrap();
        assert_eq!(restored.status, JobStatus::Pending);
        assert_eq!(restored.started_at, None);
        let later = Utc::now() + chrono::TimeDelta::days(2);
        assert_eq!(scheduler.due_jobs(later).await, vec![job.id]);

        let status = scheduler.execute_job(job.id, &reporter).await.unwrap();
        assert_eq!(status, JobStatus::Completed);
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_outcome_save_keeps_outcome_in_memory() {
        let store = MockJobStore::new();
        let handler = MockJobHandler::succeeding().with_delay(Duration::from_millis(50));
        let scheduler = Arc::new(Scheduler::new(store.clone(), handler, config()));
        let reporter = Arc::new(MockReporter::new());
        let job = scheduler
            .schedule_job(NewJob::new("hourly", JobType::Maintenance, "@hourly"))
            .await
            .unwrap();

        let task = {
            let scheduler = Arc::clone(&scheduler);
            let reporter = Arc::clone(&reporter);
            tokio::spawn(async move { scheduler.execute_job(job.id, reporter.as_ref()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.set_failing(true);

        let status = task.await.unwrap().unwrap();
        assert_eq!(status, JobStatus::Completed);
        let job = scheduler.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.history.len(), 1);
        assert_eq!(store.saved()[0].status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_check_health_flags_stuck_jobs() {
        let handler = MockJobHandler::succeeding().with_delay(Duration::from_secs(30));
        let scheduler = Arc::new(Scheduler::new(
            MockJobStore::new(),
            handler,
            SchedulerConfig {
                cancel_stuck_jobs: true,
                ..config()
            },
        ));
        let job = scheduler
            .schedule_job(NewJob::new("stuck", JobType::Maintenance, "@hourly").with_timeout(0))
            .await
            .unwrap();

        let reporter = Arc::new(MockReporter::new());
        let later = Utc::now() + chrono::TimeDelta::hours(2);
        scheduler.tick(later, &reporter).await;
        std::thread::sleep(Duration::from_millis(2));

        let stuck = scheduler.check_health(reporter.as_ref()).await;
        assert_eq!(stuck, vec![job.id]);
        assert_eq!(reporter.stuck(), 1);
        assert_eq!(scheduler.get_job(job.id).await.unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let scheduler = Arc::new(Scheduler::new(
            MockJobStore::new(),
            MockJobHandler::succeeding(),
            config(),
        ));
        let token = CancellationToken::new();
        let reporter = Arc::new(MockReporter::new());

        let handle = tokio::spawn(Arc::clone(&scheduler).run(token.clone(), Arc::clone(&reporter)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        handle.await.unwrap().unwrap();
        assert!(reporter.stopped());
    }
}
