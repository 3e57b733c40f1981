//! Collection orchestrator.
//!
//! Filters registry sources by the request, processes them in batches of
//! spawned tasks, validates and deduplicates the events, and writes a run log
//! entry per source attempt. Registry fetch metadata is written only here,
//! once per settled batch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreaker;
use crate::dedup::{DedupConfig, DedupStatistics, DeduplicationEngine, DuplicateGroup};
use crate::error::AppError;
use crate::job::{JobType, ResourceLimits, ScheduledJob};
use crate::models::{
    CollectionStage, EnhancedEventInfo, FetchOutcome, FetchRecord, RawEventData, RunLogEntry,
    Source, SourceStatus, compute_hash,
};
use crate::registry::SourceRegistry;
use crate::resilience::{ErrorStatistics, RecoveryAction, RecoveryContext, ResilienceLayer};
use crate::scheduler::JobHandler;
use crate::traits::{FallbackQuery, FallbackSearch, RunLogSink, SnapshotSink, SourceAdapter};
use crate::validation::EventValidator;

/// Source id under which AI fallback candidates are reported.
pub const FALLBACK_SOURCE_ID: &str = "ai-fallback";

// ---------------------------------------------------------------------------
// Request / config
// ---------------------------------------------------------------------------

/// What to collect. Empty filter lists match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionRequest {
    pub stages: Vec<CollectionStage>,
    pub regions: Vec<String>,
    pub categories: Vec<String>,
    pub target_event_count: Option<usize>,
    /// Whole-collection deadline.
    pub time_limit_secs: Option<u64>,
    /// Ignore update-frequency caching and unchanged fingerprints.
    pub force_refresh: bool,
}

impl CollectionRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.target_event_count == Some(0) {
            return Err(AppError::InvalidRequest(
                "target_event_count must be at least 1".into(),
            ));
        }
        if self.time_limit_secs == Some(0) {
            return Err(AppError::InvalidRequest(
                "time_limit_secs must be at least 1".into(),
            ));
        }
        if self.stages.contains(&CollectionStage::AiFallback) {
            return Err(AppError::InvalidRequest(
                "ai-fallback is not a source stage".into(),
            ));
        }
        if self
            .regions
            .iter()
            .chain(&self.categories)
            .any(|s| s.trim().is_empty())
        {
            return Err(AppError::InvalidRequest(
                "region and category filters must not be empty strings".into(),
            ));
        }
        Ok(())
    }

    pub fn time_limit(&self) -> Option<Duration> {
        self.time_limit_secs.map(Duration::from_secs)
    }

    /// Enabled, and matching the region, category and stage filters.
    pub fn matches(&self, source: &Source) -> bool {
        source.enabled
            && (self.regions.is_empty() || self.regions.iter().any(|r| source.matches_region(r)))
            && (self.categories.is_empty()
                || self
                    .categories
                    .iter()
                    .any(|c| c.eq_ignore_ascii_case(&source.category)))
            && (self.stages.is_empty() || self.stages.contains(&source.stage))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    /// Sources processed in parallel per batch.
    pub max_concurrency: usize,
    /// Batch size when the request carries a time limit.
    pub deadline_concurrency: usize,
    pub fetch_timeout_secs: u64,
    /// Fetch-history entries kept per source by the maintenance job.
    pub history_limit: usize,
    /// Days of snapshots and run logs kept by the cleanup job.
    pub retention_days: i64,
    /// Region name sent to the fallback search when the request names none.
    pub region: String,
    pub fallback_window_days: i64,
    pub fallback_limit: usize,
    pub fallback_reliability: f64,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            deadline_concurrency: 3,
            fetch_timeout_secs: 30,
            history_limit: 100,
            retention_days: 30,
            region: "iwate".to_string(),
            fallback_window_days: 60,
            fallback_limit: 20,
            fallback_reliability: 0.3,
        }
    }
}

impl CollectionConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.max(1))
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of one source attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceResult {
    pub source_id: String,
    pub status: SourceStatus,
    /// Raw payloads fetched.
    pub fetched: usize,
    /// Events produced by normalization.
    pub parsed: usize,
    /// Events that passed validation.
    pub accepted: usize,
    /// Events that survived deduplication.
    pub upserted: usize,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub snapshot_paths: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CollectionStatistics {
    pub sources_attempted: usize,
    pub succeeded: usize,
    pub partial: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cache_hits: usize,
    pub no_new_data: usize,
    pub events_before_dedup: usize,
    pub events_after_dedup: usize,
    pub fallback_used: bool,
    pub dedup: DedupStatistics,
    /// Errors handled during this run only.
    pub error_statistics: ErrorStatistics,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionResult {
    pub run_id: Uuid,
    /// Deduplicated events ordered by start time.
    pub events: Vec<EnhancedEventInfo>,
    /// Ids of the sources that contributed at least one returned event.
    pub sources: Vec<String>,
    pub execution_time_ms: u64,
    pub api_calls_used: usize,
    /// `"<source_id>: <error>"` for every failed or degraded attempt.
    pub errors: Vec<String>,
    pub statistics: CollectionStatistics,
    pub source_results: Vec<SourceResult>,
    pub duplicate_groups: Vec<DuplicateGroup>,
}

impl CollectionResult {
    fn empty(run_id: Uuid, execution_time_ms: u64) -> Self {
        Self {
            run_id,
            events: Vec::new(),
            sources: Vec::new(),
            execution_time_ms,
            api_calls_used: 0,
            errors: Vec::new(),
            statistics: CollectionStatistics::default(),
            source_results: Vec::new(),
            duplicate_groups: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-source attempt
// ---------------------------------------------------------------------------

/// Registry changes produced by one attempt, applied after the batch settles.
#[derive(Debug)]
struct RegistryUpdate {
    record: FetchRecord,
    etag: Option<String>,
    last_modified: Option<String>,
    fingerprint: Option<String>,
    checked_at: DateTime<Utc>,
}

#[derive(Debug)]
struct SourceAttempt {
    result: SourceResult,
    events: Vec<EnhancedEventInfo>,
    update: Option<RegistryUpdate>,
    api_calls: usize,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    clock: Instant,
}

impl SourceAttempt {
    fn start(source_id: &str) -> Self {
        let now = Utc::now();
        Self {
            result: SourceResult {
                source_id: source_id.to_string(),
                status: SourceStatus::Success,
                fetched: 0,
                parsed: 0,
                accepted: 0,
                upserted: 0,
                error: None,
                duration_ms: 0,
                snapshot_paths: Vec::new(),
            },
            events: Vec::new(),
            update: None,
            api_calls: 0,
            started_at: now,
            finished_at: now,
            clock: Instant::now(),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.clock.elapsed().as_millis() as u64
    }

    fn finish(mut self, status: SourceStatus, error: Option<String>) -> Self {
        self.result.status = status;
        self.result.error = error;
        self.result.accepted = self.events.len();
        self.result.duration_ms = self.elapsed_ms();
        self.finished_at = Utc::now();
        self
    }

    fn not_started(source_id: &str, reason: &str) -> Self {
        Self::start(source_id).finish(SourceStatus::Skipped, Some(reason.to_string()))
    }

    fn record_failure(&mut self, error: &AppError) {
        let status_code = match error {
            AppError::FetchError { status, .. } => Some(*status),
            _ => None,
        };
        self.update = Some(RegistryUpdate {
            record: FetchRecord {
                timestamp: Utc::now(),
                success: false,
                status_code,
                error: Some(error.to_string()),
                items_found: 0,
                processing_time_ms: self.elapsed_ms(),
            },
            etag: None,
            last_modified: None,
            fingerprint: None,
            checked_at: Utc::now(),
        });
    }

    fn record_success(
        &mut self,
        outcome: &FetchOutcome,
        items_found: usize,
        fingerprint: Option<String>,
    ) {
        self.update = Some(RegistryUpdate {
            record: FetchRecord {
                timestamp: Utc::now(),
                success: true,
                status_code: Some(outcome.status),
                error: None,
                items_found,
                processing_time_ms: self.elapsed_ms(),
            },
            etag: outcome.etag.clone(),
            last_modified: outcome.last_modified.clone(),
            fingerprint,
            checked_at: Utc::now(),
        });
    }
}

/// Fingerprint of a whole fetch, used to detect unchanged sources.
fn combined_fingerprint(raw: &[RawEventData]) -> String {
    match raw {
        [single] => single.fingerprint.clone(),
        many => compute_hash(
            &many
                .iter()
                .map(|r| r.fingerprint.as_str())
                .collect::<Vec<_>>()
                .join("|"),
        ),
    }
}

/// Everything a spawned source task needs, owned.
#[derive(Clone)]
struct SourceWorker<A, S> {
    adapter: A,
    snapshots: S,
    validator: EventValidator,
    resilience: ResilienceLayer,
    fetch_timeout: Duration,
    force_refresh: bool,
    now: DateTime<Utc>,
}

impl<A: SourceAdapter, S: SnapshotSink> SourceWorker<A, S> {
    async fn process(self, source: Source) -> SourceAttempt {
        let mut attempt = SourceAttempt::start(&source.id);

        if !self.force_refresh && source.is_fresh(self.now) {
            tracing::debug!(source_id = %source.id, "Source is fresh, skipping fetch");
            return attempt.finish(SourceStatus::CacheHit, None);
        }

        let breaker = self.resilience.breakers().get(&source.id);
        if breaker.is_open() {
            let stats = breaker.stats();
            let error = AppError::CircuitOpen {
                name: source.id.clone(),
                retry_after_secs: stats.time_until_half_open_secs.unwrap_or(0),
            };
            tracing::info!(source_id = %source.id, "Circuit open, skipping source");
            return attempt.finish(SourceStatus::Skipped, Some(error.to_string()));
        }

        let outcome = match self.fetch_with_recovery(&source, &breaker, &mut attempt).await {
            Ok(outcome) => outcome,
            Err((error, action)) => {
                attempt.record_failure(&error);
                let status = match action {
                    RecoveryAction::Fallback(_) => SourceStatus::Partial,
                    RecoveryAction::Skip => SourceStatus::Skipped,
                    RecoveryAction::Retry { .. } | RecoveryAction::Fail => SourceStatus::Fail,
                };
                return attempt.finish(status, Some(error.to_string()));
            }
        };

        attempt.result.fetched = outcome.raw.len();
        if outcome.not_modified || outcome.raw.is_empty() {
            attempt.record_success(&outcome, 0, None);
            return attempt.finish(SourceStatus::NoNewData, None);
        }

        let fingerprint = combined_fingerprint(&outcome.raw);
        if !self.force_refresh && source.last_fingerprint.as_deref() == Some(fingerprint.as_str())
        {
            tracing::debug!(source_id = %source.id, "Content unchanged");
            attempt.record_success(&outcome, 0, Some(fingerprint));
            return attempt.finish(SourceStatus::NoNewData, None);
        }

        for raw in &outcome.raw {
            if let Some(path) = self.snapshots.save(raw).await {
                attempt.result.snapshot_paths.push(path.display().to_string());
            }
        }

        let mut parse_error = None;
        let mut parsed = Vec::new();
        for raw in &outcome.raw {
            match self.adapter.normalize(raw, &source) {
                Ok(events) => parsed.extend(events),
                Err(e) => {
                    tracing::warn!(source_id = %source.id, error = %e, "Failed to normalize payload");
                    parse_error = Some(e);
                }
            }
        }
        attempt.result.parsed = parsed.len();

        attempt.events = parsed
            .into_iter()
            .filter_map(|event| self.validator.accept(event, self.now))
            .map(|event| EnhancedEventInfo::new(event, source.stage, source.reliability, self.now))
            .collect();

        tracing::debug!(
            source_id = %source.id,
            parsed = attempt.result.parsed,
            accepted = attempt.events.len(),
            "Source processed"
        );

        match parse_error {
            // Keep the old fingerprint so the payload is parsed again next run.
            Some(error) => {
                attempt.record_success(&outcome, attempt.result.parsed, None);
                let status = if attempt.events.is_empty() {
                    let ctx = RecoveryContext::new(&source.id, "normalize")
                        .with_stage(source.stage)
                        .at(self.now);
                    match self.resilience.handle(&error, &ctx).1 {
                        RecoveryAction::Skip => SourceStatus::Skipped,
                        RecoveryAction::Fail => SourceStatus::Fail,
                        RecoveryAction::Fallback(_) | RecoveryAction::Retry { .. } => {
                            SourceStatus::Partial
                        }
                    }
                } else {
                    SourceStatus::Partial
                };
                attempt.finish(status, Some(error.to_string()))
            }
            None => {
                attempt.record_success(&outcome, attempt.result.parsed, Some(fingerprint));
                attempt.finish(SourceStatus::Success, None)
            }
        }
    }

    /// Fetch through the limiter with a timeout, retrying in-line while the
    /// recovery policy says so. Returns the final error and its action.
    async fn fetch_with_recovery(
        &self,
        source: &Source,
        breaker: &CircuitBreaker,
        attempt: &mut SourceAttempt,
    ) -> Result<FetchOutcome, (AppError, RecoveryAction)> {
        let mut attempt_no = 1;
        loop {
            self.resilience.limiter().acquire().await;
            attempt.api_calls += 1;

            let result = match tokio::time::timeout(self.fetch_timeout, self.adapter.fetch(source))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(AppError::Timeout(self.fetch_timeout.as_secs())),
            };

            match result {
                Ok(outcome) => {
                    breaker.record_success();
                    if attempt_no > 1 {
                        self.resilience.stats().record_recovery(true);
                    }
                    return Ok(outcome);
                }
                Err(error) => {
                    breaker.record_failure(&error);
                    if attempt_no > 1 {
                        self.resilience.stats().record_recovery(false);
                    }
                    let ctx = RecoveryContext::new(&source.id, "fetch")
                        .with_stage(source.stage)
                        .with_attempt(attempt_no);
                    let (_, action) = self.resilience.handle(&error, &ctx);
                    match action {
                        RecoveryAction::Retry {
                            delay,
                            max_attempts,
                        } if attempt_no <= max_attempts && !breaker.is_open() => {
                            tracing::info!(
                                source_id = %source.id,
                                attempt = attempt_no,
                                delay_ms = delay.as_millis() as u64,
                                "Retrying fetch"
                            );
                            tokio::time::sleep(delay).await;
                            attempt_no += 1;
                        }
                        action => return Err((error, action)),
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Runs collections against a shared registry.
///
/// Generic over the adapter, the two best-effort sinks and the fallback
/// search so tests can inject mocks.
#[derive(Clone)]
pub struct CollectionService<A, S, L, FB> {
    registry: Arc<RwLock<SourceRegistry>>,
    adapter: A,
    snapshots: S,
    run_logs: L,
    fallback: FB,
    validator: EventValidator,
    dedup: DeduplicationEngine,
    resilience: ResilienceLayer,
    config: CollectionConfig,
}

impl<A, S, L, FB> CollectionService<A, S, L, FB>
where
    A: SourceAdapter + 'static,
    S: SnapshotSink + 'static,
    L: RunLogSink + 'static,
    FB: FallbackSearch + 'static,
{
    pub fn new(
        registry: SourceRegistry,
        adapter: A,
        snapshots: S,
        run_logs: L,
        fallback: FB,
    ) -> Self {
        Self {
            registry: Arc::new(RwLock::new(registry)),
            adapter,
            snapshots,
            run_logs,
            fallback,
            validator: EventValidator::default(),
            dedup: DeduplicationEngine::new(DedupConfig::default()),
            resilience: ResilienceLayer::default(),
            config: CollectionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: CollectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_validator(mut self, validator: EventValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_dedup(mut self, dedup: DeduplicationEngine) -> Self {
        self.dedup = dedup;
        self
    }

    pub fn with_resilience(mut self, resilience: ResilienceLayer) -> Self {
        self.resilience = resilience;
        self
    }

    pub fn registry(&self) -> Arc<RwLock<SourceRegistry>> {
        Arc::clone(&self.registry)
    }

    pub fn resilience(&self) -> &ResilienceLayer {
        &self.resilience
    }

    pub fn config(&self) -> &CollectionConfig {
        &self.config
    }

    /// Collect, deduplicate and return the events only.
    pub async fn fetch_events(
        &self,
        request: &CollectionRequest,
    ) -> Result<Vec<EnhancedEventInfo>, AppError> {
        Ok(self.collect(request).await?.events)
    }

    /// Run one collection. Only an invalid request is an error; per-source
    /// failures are reported in the result.
    pub async fn collect(&self, request: &CollectionRequest) -> Result<CollectionResult, AppError> {
        self.collect_with_limits(request, &ResourceLimits::default())
            .await
    }

    pub async fn collect_with_limits(
        &self,
        request: &CollectionRequest,
        limits: &ResourceLimits,
    ) -> Result<CollectionResult, AppError> {
        request.validate()?;
        let run_id = Uuid::new_v4();
        let clock = Instant::now();
        let now = Utc::now();
        let stats_before = self.resilience.stats().snapshot();
        let deadline = request.time_limit().map(|limit| clock + limit);
        let target = match (request.target_event_count, limits.max_events) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let sources: Vec<Source> = {
            let registry = self.registry.read().await;
            registry
                .sources()
                .iter()
                .filter(|s| request.matches(s))
                .cloned()
                .collect()
        };

        if sources.is_empty() {
            tracing::info!(%run_id, "No sources match the request");
            return Ok(CollectionResult::empty(
                run_id,
                clock.elapsed().as_millis() as u64,
            ));
        }

        let batch_size = self.batch_size(request, limits);
        tracing::info!(
            %run_id,
            sources = sources.len(),
            batch_size,
            force_refresh = request.force_refresh,
            "Starting collection"
        );

        let mut attempts: Vec<SourceAttempt> = Vec::with_capacity(sources.len());
        let mut collected = 0;
        for batch in sources.chunks(batch_size) {
            let stop = if deadline.is_some_and(|d| Instant::now() >= d) {
                Some("collection time limit reached")
            } else if target.is_some_and(|t| collected >= t) {
                Some("target event count reached")
            } else {
                None
            };
            if let Some(reason) = stop {
                tracing::info!(%run_id, skipped = batch.len(), reason, "Skipping batch");
                attempts.extend(batch.iter().map(|s| SourceAttempt::not_started(&s.id, reason)));
                continue;
            }

            let mut settled = self.run_batch(batch, request.force_refresh, now).await;
            self.apply_updates(&mut settled).await;
            collected += settled.iter().map(|a| a.events.len()).sum::<usize>();
            attempts.extend(settled);
        }

        let mut events: Vec<EnhancedEventInfo> = attempts
            .iter_mut()
            .flat_map(|a| std::mem::take(&mut a.events))
            .collect();

        let mut fallback_used = false;
        if events.is_empty() && self.fallback.is_enabled() {
            let mut fallback = self.run_fallback(request, target, now).await;
            fallback_used = true;
            events = std::mem::take(&mut fallback.events);
            attempts.push(fallback);
        }

        let events_before_dedup = events.len();
        let dedup = self.dedup.deduplicate(events, now);
        let mut events = dedup.events;

        if let Some(target) = target
            && events.len() > target
        {
            events.sort_by(|a, b| b.event.confidence.total_cmp(&a.event.confidence));
            events.truncate(target);
        }
        events.sort_by(|a, b| {
            a.event
                .starts_at
                .cmp(&b.event.starts_at)
                .then_with(|| a.event.title.cmp(&b.event.title))
        });

        let mut surviving: HashMap<&str, usize> = HashMap::new();
        for info in &events {
            *surviving.entry(info.event.source_id.as_str()).or_default() += 1;
        }
        for attempt in &mut attempts {
            attempt.result.upserted = surviving
                .get(attempt.result.source_id.as_str())
                .copied()
                .unwrap_or(0);
        }

        self.write_run_logs(run_id, &attempts).await;

        let mut statistics = tally(&attempts);
        statistics.events_before_dedup = events_before_dedup;
        statistics.events_after_dedup = events.len();
        statistics.fallback_used = fallback_used;
        statistics.dedup = dedup.statistics;
        statistics.error_statistics = self.resilience.stats().snapshot().since(&stats_before);

        let errors = attempts
            .iter()
            .filter(|a| {
                matches!(
                    a.result.status,
                    SourceStatus::Fail | SourceStatus::Partial | SourceStatus::Skipped
                )
            })
            .filter_map(|a| {
                a.result
                    .error
                    .as_ref()
                    .map(|e| format!("{}: {e}", a.result.source_id))
            })
            .collect();

        let mut contributing: Vec<String> = surviving.keys().map(|id| id.to_string()).collect();
        contributing.sort();

        let result = CollectionResult {
            run_id,
            sources: contributing,
            execution_time_ms: clock.elapsed().as_millis() as u64,
            api_calls_used: attempts.iter().map(|a| a.api_calls).sum(),
            errors,
            statistics,
            source_results: attempts.into_iter().map(|a| a.result).collect(),
            duplicate_groups: dedup.groups,
            events,
        };

        tracing::info!(
            %run_id,
            events = result.events.len(),
            succeeded = result.statistics.succeeded,
            failed = result.statistics.failed,
            skipped = result.statistics.skipped,
            duplicates = result.statistics.dedup.duplicates_removed,
            execution_time_ms = result.execution_time_ms,
            "Collection complete"
        );

        Ok(result)
    }

    fn batch_size(&self, request: &CollectionRequest, limits: &ResourceLimits) -> usize {
        let mut size = self.config.max_concurrency;
        if request.time_limit_secs.is_some() {
            size = size.min(self.config.deadline_concurrency);
        }
        if let Some(cap) = limits.max_concurrent_sources {
            size = size.min(cap);
        }
        size.max(1)
    }

    /// Process one batch to completion. A panicking task becomes a failed
    /// attempt for its source.
    async fn run_batch(
        &self,
        batch: &[Source],
        force_refresh: bool,
        now: DateTime<Utc>,
    ) -> Vec<SourceAttempt> {
        let worker = SourceWorker {
            adapter: self.adapter.clone(),
            snapshots: self.snapshots.clone(),
            validator: self.validator.clone(),
            resilience: self.resilience.clone(),
            fetch_timeout: self.config.fetch_timeout(),
            force_refresh,
            now,
        };

        let mut tasks = JoinSet::new();
        let mut owners = HashMap::new();
        for source in batch {
            let handle = tasks.spawn(worker.clone().process(source.clone()));
            owners.insert(handle.id(), source.id.clone());
        }

        let mut settled = Vec::with_capacity(batch.len());
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, attempt)) => settled.push(attempt),
                Err(e) => {
                    let source_id = owners.get(&e.id()).cloned().unwrap_or_default();
                    tracing::error!(source_id = %source_id, error = %e, "Source task failed");
                    let mut attempt = SourceAttempt::start(&source_id);
                    let error = AppError::Generic(format!("source task failed: {e}"));
                    attempt.record_failure(&error);
                    settled.push(attempt.finish(SourceStatus::Fail, Some(error.to_string())));
                }
            }
        }

        settled.sort_by_key(|a| batch.iter().position(|s| s.id == a.result.source_id));
        settled
    }

    async fn apply_updates(&self, attempts: &mut [SourceAttempt]) {
        let mut registry = self.registry.write().await;
        for attempt in attempts {
            let Some(update) = attempt.update.take() else {
                continue;
            };
            if let Err(e) = registry.record_fetch(
                &attempt.result.source_id,
                update.record,
                update.etag,
                update.last_modified,
                update.fingerprint,
                update.checked_at,
            ) {
                tracing::warn!(source_id = %attempt.result.source_id, error = %e, "Failed to record fetch");
            }
        }
    }

    async fn run_fallback(
        &self,
        request: &CollectionRequest,
        target: Option<usize>,
        now: DateTime<Utc>,
    ) -> SourceAttempt {
        let mut attempt = SourceAttempt::start(FALLBACK_SOURCE_ID);
        let breaker = self.resilience.breakers().get(FALLBACK_SOURCE_ID);
        if breaker.is_open() {
            return attempt.finish(
                SourceStatus::Skipped,
                Some(format!("circuit '{FALLBACK_SOURCE_ID}' is open")),
            );
        }

        let query = FallbackQuery {
            region: request
                .regions
                .first()
                .cloned()
                .unwrap_or_else(|| self.config.region.clone()),
            categories: request.categories.clone(),
            from: now,
            to: now + TimeDelta::days(self.config.fallback_window_days),
            limit: target.unwrap_or(self.config.fallback_limit),
        };
        tracing::info!(region = %query.region, "No events from sources, trying AI fallback");

        self.resilience.limiter().acquire().await;
        attempt.api_calls += 1;
        let timeout = self.config.fetch_timeout();
        let result = match tokio::time::timeout(timeout, self.fallback.search(&query)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(timeout.as_secs())),
        };

        match result {
            Ok(candidates) => {
                breaker.record_success();
                attempt.result.fetched = 1;
                attempt.result.parsed = candidates.len();
                attempt.events = candidates
                    .into_iter()
                    .filter_map(|event| self.validator.accept(event, now))
                    .map(|event| {
                        EnhancedEventInfo::new(
                            event,
                            CollectionStage::AiFallback,
                            self.config.fallback_reliability,
                            now,
                        )
                    })
                    .collect();
                attempt.finish(SourceStatus::Success, None)
            }
            Err(error) => {
                breaker.record_failure(&error);
                let ctx = RecoveryContext::new(FALLBACK_SOURCE_ID, "search")
                    .with_stage(CollectionStage::AiFallback);
                let status = match self.resilience.handle(&error, &ctx).1 {
                    RecoveryAction::Skip => SourceStatus::Skipped,
                    _ => SourceStatus::Fail,
                };
                attempt.finish(status, Some(error.to_string()))
            }
        }
    }

    async fn write_run_logs(&self, run_id: Uuid, attempts: &[SourceAttempt]) {
        for attempt in attempts {
            let entry = RunLogEntry {
                run_id,
                source_id: attempt.result.source_id.clone(),
                started_at: attempt.started_at,
                finished_at: attempt.finished_at,
                status: attempt.result.status,
                fetched: attempt.result.fetched,
                parsed: attempt.result.parsed,
                upserted: attempt.result.upserted,
                error: attempt.result.error.clone(),
                snapshot_paths: attempt.result.snapshot_paths.clone(),
            };
            self.run_logs.append(&entry).await;
        }
    }
}

fn tally(attempts: &[SourceAttempt]) -> CollectionStatistics {
    let mut stats = CollectionStatistics {
        sources_attempted: attempts.len(),
        ..Default::default()
    };
    for attempt in attempts {
        match attempt.result.status {
            SourceStatus::Success => stats.succeeded += 1,
            SourceStatus::Partial => stats.partial += 1,
            SourceStatus::Fail => stats.failed += 1,
            SourceStatus::Skipped => stats.skipped += 1,
            SourceStatus::CacheHit => stats.cache_hits += 1,
            SourceStatus::NoNewData => stats.no_new_data += 1,
        }
    }
    stats
}

impl<A, S, L, FB> JobHandler for CollectionService<A, S, L, FB>
where
    A: SourceAdapter + 'static,
    S: SnapshotSink + 'static,
    L: RunLogSink + 'static,
    FB: FallbackSearch + 'static,
{
    async fn handle(&self, job: &ScheduledJob) -> Result<serde_json::Value, AppError> {
        match &job.job_type {
            JobType::Collection { request } => {
                let result = self.collect_with_limits(request, &job.resource_limits).await?;
                Ok(serde_json::json!({
                    "run_id": result.run_id,
                    "events": result.events.len(),
                    "sources_attempted": result.statistics.sources_attempted,
                    "failed": result.statistics.failed,
                    "errors": result.errors.len(),
                    "execution_time_ms": result.execution_time_ms,
                }))
            }
            JobType::Maintenance => {
                let removed = self
                    .registry
                    .write()
                    .await
                    .prune_history(self.config.history_limit);
                tracing::info!(job_id = %job.id, removed, "Pruned fetch history");
                Ok(serde_json::json!({ "history_pruned": removed }))
            }
            JobType::Cleanup => {
                let cutoff =
                    (Utc::now() - TimeDelta::days(self.config.retention_days)).date_naive();
                let snapshots = self.snapshots.prune_before(cutoff).await?;
                let run_logs = self.run_logs.prune_before(cutoff).await?;
                tracing::info!(job_id = %job.id, %cutoff, snapshots, run_logs, "Retention cleanup done");
                Ok(serde_json::json!({
                    "cutoff": cutoff,
                    "snapshots_removed": snapshots,
                    "run_logs_removed": run_logs,
                }))
            }
        }
    }
}
