//! Test utilities: mock implementations of all core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{JobStatus, JobType, ResourceLimits, ScheduledJob};
use crate::job_store::JobStore;
use crate::models::{
    CollectionStage, FetchOutcome, NormalizedEvent, RawEventData, RunLogEntry, Source, SourceType,
    UpdateFrequency, ValidationResult, ValidationStatus, compute_hash,
};
use crate::normalize::dedupe_key;
use crate::scheduler::{JobHandler, SchedulerEvent, SchedulerReporter};
use crate::traits::{
    FallbackQuery, FallbackSearch, FetchRequest, FetchResponse, Fetcher, RunLogSink, SnapshotSink,
    SourceAdapter,
};

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Mock fetcher that returns queued responses, then a repeating default.
#[derive(Clone)]
pub struct MockFetcher {
    responses: Arc<Mutex<VecDeque<Result<FetchResponse, AppError>>>>,
    default: FetchResponse,
    requests: Arc<Mutex<Vec<FetchRequest>>>,
}

impl MockFetcher {
    fn from_parts(responses: Vec<Result<FetchResponse, AppError>>, default: FetchResponse) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            default,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every request answers 200 with `body`.
    pub fn with_body(body: &str) -> Self {
        Self::from_parts(
            vec![],
            FetchResponse {
                status: 200,
                body: body.to_string(),
                ..Default::default()
            },
        )
    }

    /// Every request answers `status` with an empty body.
    pub fn with_status(status: u16) -> Self {
        Self::from_parts(
            vec![],
            FetchResponse {
                status,
                ..Default::default()
            },
        )
    }

    /// Queued responses, then empty 200s.
    pub fn with_responses(responses: Vec<Result<FetchResponse, AppError>>) -> Self {
        Self::from_parts(
            responses,
            FetchResponse {
                status: 200,
                ..Default::default()
            },
        )
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Fetcher for MockFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, AppError> {
        self.requests.lock().unwrap().push(request.clone());
        let queued = self.responses.lock().unwrap().pop_front();
        queued.unwrap_or_else(|| Ok(self.default.clone()))
    }
}

// ---------------------------------------------------------------------------
// MockAdapter
// ---------------------------------------------------------------------------

/// Mock adapter keyed by source id.
///
/// Without queued fetch results every fetch returns one payload
/// `"payload-<id>"`; `normalize` returns the events configured for the source.
#[derive(Clone, Default)]
pub struct MockAdapter {
    fetch_results: Arc<Mutex<HashMap<String, VecDeque<Result<FetchOutcome, AppError>>>>>,
    events: Arc<Mutex<HashMap<String, Vec<NormalizedEvent>>>>,
    invalid: Arc<Mutex<HashSet<String>>>,
    parse_errors: Arc<Mutex<HashSet<String>>>,
    panics: Arc<Mutex<HashSet<String>>>,
    fetches: Arc<Mutex<Vec<String>>>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_invalid(self, source_id: &str) -> Self {
        self.invalid.lock().unwrap().insert(source_id.to_string());
        self
    }

    pub fn with_events(self, source_id: &str, events: Vec<NormalizedEvent>) -> Self {
        self.events
            .lock()
            .unwrap()
            .insert(source_id.to_string(), events);
        self
    }

    pub fn with_fetch_results(
        self,
        source_id: &str,
        results: Vec<Result<FetchOutcome, AppError>>,
    ) -> Self {
        self.fetch_results
            .lock()
            .unwrap()
            .insert(source_id.to_string(), results.into());
        self
    }

    pub fn with_parse_error(self, source_id: &str) -> Self {
        self.parse_errors
            .lock()
            .unwrap()
            .insert(source_id.to_string());
        self
    }

    /// Fetching this source panics.
    pub fn with_panic(self, source_id: &str) -> Self {
        self.panics.lock().unwrap().insert(source_id.to_string());
        self
    }

    pub fn fetch_count(&self, source_id: &str) -> usize {
        self.fetches
            .lock()
            .unwrap()
            .iter()
            .filter(|id| *id == source_id)
            .count()
    }
}

impl SourceAdapter for MockAdapter {
    fn can_handle(&self, _source: &Source) -> bool {
        true
    }

    async fn fetch(&self, source: &Source) -> Result<FetchOutcome, AppError> {
        self.fetches.lock().unwrap().push(source.id.clone());
        if self.panics.lock().unwrap().contains(&source.id) {
            panic!("adapter panicked for {}", source.id);
        }
        let queued = self
            .fetch_results
            .lock()
            .unwrap()
            .get_mut(&source.id)
            .and_then(|q| q.pop_front());
        queued.unwrap_or_else(|| {
            Ok(FetchOutcome {
                raw: vec![RawEventData::new(
                    source.id.clone(),
                    source.url.clone(),
                    format!("payload-{}", source.id),
                    Some("application/rss+xml".to_string()),
                )],
                status: 200,
                etag: Some(format!("\"etag-{}\"", source.id)),
                last_modified: None,
                not_modified: false,
            })
        })
    }

    async fn validate(&self, source: &Source) -> ValidationResult {
        if self.invalid.lock().unwrap().contains(&source.id) {
            ValidationResult::invalid("unreachable")
        } else {
            ValidationResult::valid(0.9)
        }
    }

    fn normalize(
        &self,
        raw: &RawEventData,
        source: &Source,
    ) -> Result<Vec<NormalizedEvent>, AppError> {
        if self.parse_errors.lock().unwrap().contains(&source.id) {
            return Err(AppError::parse(format!(
                "unexpected eof in {}",
                raw.fingerprint
            )));
        }
        Ok(self
            .events
            .lock()
            .unwrap()
            .get(&source.id)
            .cloned()
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// MockSink
// ---------------------------------------------------------------------------

/// Records snapshots, run-log entries and prune calls.
#[derive(Clone, Default)]
pub struct MockSink {
    snapshots: Arc<Mutex<Vec<RawEventData>>>,
    run_logs: Arc<Mutex<Vec<RunLogEntry>>>,
    prune_calls: Arc<Mutex<Vec<NaiveDate>>>,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshots(&self) -> Vec<RawEventData> {
        self.snapshots.lock().unwrap().clone()
    }

    pub fn run_logs(&self) -> Vec<RunLogEntry> {
        self.run_logs.lock().unwrap().clone()
    }

    pub fn prune_calls(&self) -> Vec<NaiveDate> {
        self.prune_calls.lock().unwrap().clone()
    }
}

impl SnapshotSink for MockSink {
    async fn save(&self, raw: &RawEventData) -> Option<PathBuf> {
        self.snapshots.lock().unwrap().push(raw.clone());
        Some(PathBuf::from(format!(
            "snapshots/{}/{}.{}",
            raw.source_id,
            raw.fingerprint,
            raw.snapshot_extension()
        )))
    }

    async fn prune_before(&self, cutoff: NaiveDate) -> Result<usize, AppError> {
        self.prune_calls.lock().unwrap().push(cutoff);
        Ok(0)
    }
}

impl RunLogSink for MockSink {
    async fn append(&self, entry: &RunLogEntry) -> Option<PathBuf> {
        self.run_logs.lock().unwrap().push(entry.clone());
        Some(PathBuf::from(format!("runlogs/{}.json", entry.run_id)))
    }

    async fn prune_before(&self, cutoff: NaiveDate) -> Result<usize, AppError> {
        self.prune_calls.lock().unwrap().push(cutoff);
        Ok(0)
    }
}

// ---------------------------------------------------------------------------
// MockFallback
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct MockFallback {
    events: Vec<NormalizedEvent>,
    fail: bool,
    queries: Arc<Mutex<Vec<FallbackQuery>>>,
}

impl MockFallback {
    pub fn with_events(events: Vec<NormalizedEvent>) -> Self {
        Self {
            events,
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn queries(&self) -> Vec<FallbackQuery> {
        self.queries.lock().unwrap().clone()
    }
}

impl FallbackSearch for MockFallback {
    async fn search(&self, query: &FallbackQuery) -> Result<Vec<NormalizedEvent>, AppError> {
        self.queries.lock().unwrap().push(query.clone());
        if self.fail {
            return Err(AppError::LlmError {
                message: "service unavailable".into(),
                status_code: 503,
                retryable: true,
            });
        }
        Ok(self.events.clone())
    }
}

// ---------------------------------------------------------------------------
// MockJobStore
// ---------------------------------------------------------------------------

/// In-memory job store; `saved` returns the last written set. Saves fail
/// while `set_failing(true)` is in effect.
#[derive(Clone, Default)]
pub struct MockJobStore {
    jobs: Arc<Mutex<Vec<ScheduledJob>>>,
    saves: Arc<Mutex<usize>>,
    failing: Arc<Mutex<bool>>,
}

impl MockJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, jobs: Vec<ScheduledJob>) {
        *self.jobs.lock().unwrap() = jobs;
    }

    pub fn saved(&self) -> Vec<ScheduledJob> {
        self.jobs.lock().unwrap().clone()
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }
}

impl JobStore for MockJobStore {
    async fn load(&self) -> Result<Vec<ScheduledJob>, AppError> {
        Ok(self.jobs.lock().unwrap().clone())
    }

    async fn save(&self, jobs: &[ScheduledJob]) -> Result<(), AppError> {
        if *self.failing.lock().unwrap() {
            return Err(AppError::storage("disk full"));
        }
        *self.jobs.lock().unwrap() = jobs.to_vec();
        *self.saves.lock().unwrap() += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockJobHandler
// ---------------------------------------------------------------------------

/// Returns queued results, then `Ok({})`, optionally after a delay.
#[derive(Clone, Default)]
pub struct MockJobHandler {
    results: Arc<Mutex<VecDeque<Result<serde_json::Value, AppError>>>>,
    delay: Option<Duration>,
    calls: Arc<Mutex<usize>>,
}

impl MockJobHandler {
    pub fn succeeding() -> Self {
        Self::default()
    }

    pub fn with_results(results: Vec<Result<serde_json::Value, AppError>>) -> Self {
        Self {
            results: Arc::new(Mutex::new(results.into())),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl JobHandler for MockJobHandler {
    async fn handle(&self, _job: &ScheduledJob) -> Result<serde_json::Value, AppError> {
        *self.calls.lock().unwrap() += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let queued = self.results.lock().unwrap().pop_front();
        queued.unwrap_or_else(|| Ok(serde_json::json!({})))
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Records the kind of every scheduler event.
#[derive(Default)]
pub struct MockReporter {
    events: Mutex<Vec<&'static str>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, kind: &str) -> usize {
        self.events.lock().unwrap().iter().filter(|k| **k == kind).count()
    }

    pub fn failures(&self) -> usize {
        self.count("failed")
    }

    pub fn stuck(&self) -> usize {
        self.count("stuck")
    }

    pub fn stopped(&self) -> bool {
        self.count("stopped") > 0
    }
}

impl SchedulerReporter for MockReporter {
    fn report(&self, event: SchedulerEvent<'_>) {
        let kind = match event {
            SchedulerEvent::Started { .. } => "started",
            SchedulerEvent::JobDispatched { .. } => "dispatched",
            SchedulerEvent::JobCompleted { .. } => "completed",
            SchedulerEvent::JobFailed { .. } => "failed",
            SchedulerEvent::JobStuck { .. } => "stuck",
            SchedulerEvent::ShuttingDown { .. } => "shutting_down",
            SchedulerEvent::Stopped => "stopped",
        };
        self.events.lock().unwrap().push(kind);
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// An enabled feed source in Morioka, never fetched.
pub fn make_test_source(id: &str) -> Source {
    Source {
        id: id.to_string(),
        name: format!("Test source {id}"),
        url: format!("https://{id}.example.jp/feed.xml"),
        source_type: SourceType::Feed,
        fetch_strategy: None,
        category: "festival".to_string(),
        region: "morioka".to_string(),
        reliability: 0.85,
        update_frequency: UpdateFrequency::Daily,
        stage: CollectionStage::Secondary,
        enabled: true,
        etag: None,
        last_modified: None,
        last_checked: None,
        last_fingerprint: None,
        fetch_history: Vec::new(),
    }
}

/// A festival at Iwate Park, Morioka, with coordinates inside the region.
pub fn make_test_event(source_id: &str, title: &str, starts_at: DateTime<Utc>) -> NormalizedEvent {
    let venue = "Iwate Park";
    let key = dedupe_key(title, starts_at, venue);
    NormalizedEvent {
        id: compute_hash(&format!("{source_id}|{key}"))[..16].to_string(),
        title: title.to_string(),
        description: String::new(),
        starts_at,
        ends_at: None,
        venue: venue.to_string(),
        city: "Morioka".to_string(),
        lat: Some(39.70),
        lon: Some(141.15),
        category: "festival".to_string(),
        price: None,
        organizer: None,
        event_url: None,
        source_url: format!("https://{source_id}.example.jp/"),
        source_id: source_id.to_string(),
        dedupe_key: key,
        confidence: 0.9,
        validation_status: ValidationStatus::default(),
    }
}

/// A pending daily job due in one hour.
pub fn make_test_job(name: &str, job_type: JobType) -> ScheduledJob {
    let now = Utc::now();
    ScheduledJob {
        id: Uuid::new_v4(),
        name: name.to_string(),
        job_type,
        schedule: "@daily".to_string(),
        enabled: true,
        priority: 3,
        status: JobStatus::Pending,
        created_at: now,
        scheduled_at: Some(now + TimeDelta::hours(1)),
        started_at: None,
        completed_at: None,
        last_run: None,
        next_run: Some(now + TimeDelta::hours(1)),
        retry_count: 0,
        max_retries: 3,
        timeout_secs: 1800,
        resource_limits: ResourceLimits::default(),
        last_error: None,
        history: VecDeque::new(),
    }
}
