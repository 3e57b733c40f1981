use std::future::Future;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};

use crate::error::AppError;
use crate::models::{
    FetchOutcome, NormalizedEvent, RawEventData, RunLogEntry, Source, ValidationResult,
};

// ---------------------------------------------------------------------------
// Fetching
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMethod {
    Get,
    Head,
}

/// One HTTP request, optionally conditional on stored cache tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub method: FetchMethod,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: FetchMethod::Get,
            etag: None,
            last_modified: None,
        }
    }

    pub fn head(url: impl Into<String>) -> Self {
        Self {
            method: FetchMethod::Head,
            ..Self::get(url)
        }
    }

    /// Conditional GET using the source's stored `etag`/`last_modified`.
    pub fn conditional(source: &Source) -> Self {
        Self {
            etag: source.etag.clone(),
            last_modified: source.last_modified.clone(),
            ..Self::get(source.url.clone())
        }
    }
}

/// Raw HTTP response. Non-2xx statuses are returned, not raised.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub body: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_type: Option<String>,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_not_modified(&self) -> bool {
        self.status == 304
    }
}

/// Performs HTTP requests against external sources.
pub trait Fetcher: Send + Sync + Clone {
    fn fetch(
        &self,
        request: &FetchRequest,
    ) -> impl Future<Output = Result<FetchResponse, AppError>> + Send;
}

/// Conditional GET for a source: 304 is an empty outcome, any other non-2xx
/// status is a `FetchError`.
pub async fn conditional_fetch<F: Fetcher>(
    fetcher: &F,
    source: &Source,
) -> Result<FetchOutcome, AppError> {
    let response = fetcher.fetch(&FetchRequest::conditional(source)).await?;

    if response.is_not_modified() {
        tracing::debug!(source_id = %source.id, "Source not modified");
        return Ok(FetchOutcome::not_modified(
            response.etag.or_else(|| source.etag.clone()),
            response
                .last_modified
                .or_else(|| source.last_modified.clone()),
        ));
    }

    if !response.is_success() {
        return Err(AppError::FetchError {
            status: response.status,
            url: source.url.clone(),
        });
    }

    let raw = if response.body.trim().is_empty() {
        Vec::new()
    } else {
        vec![RawEventData::new(
            source.id.clone(),
            source.url.clone(),
            response.body,
            response.content_type,
        )]
    };

    Ok(FetchOutcome {
        raw,
        status: response.status,
        etag: response.etag,
        last_modified: response.last_modified,
        not_modified: false,
    })
}

/// HEAD probe used by adapter `validate` implementations.
pub async fn probe<F: Fetcher>(fetcher: &F, source: &Source, confidence: f64) -> ValidationResult {
    match fetcher.fetch(&FetchRequest::head(source.url.clone())).await {
        Ok(response) if response.is_success() || response.is_not_modified() => {
            ValidationResult::valid(confidence)
        }
        // Some servers refuse HEAD but serve GET fine.
        Ok(response) if response.status == 405 => {
            let mut result = ValidationResult::valid(confidence * 0.8);
            result
                .warnings
                .push("HEAD not allowed; reachability assumed".to_string());
            result
        }
        Ok(response) => ValidationResult::invalid(format!(
            "HEAD {} returned HTTP {}",
            source.url, response.status
        )),
        Err(e) => ValidationResult::invalid(e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Adapters
// ---------------------------------------------------------------------------

/// Fetch/validate/normalize for one source shape.
pub trait SourceAdapter: Send + Sync + Clone {
    fn can_handle(&self, source: &Source) -> bool;

    /// Conditional fetch. Never mutates the source: new cache tokens are
    /// returned in the outcome and applied by the orchestrator.
    fn fetch(&self, source: &Source)
    -> impl Future<Output = Result<FetchOutcome, AppError>> + Send;

    /// Reachability probe with a shape-specific confidence.
    fn validate(&self, source: &Source) -> impl Future<Output = ValidationResult> + Send;

    /// Turn one raw payload into normalized (not yet validated) events.
    fn normalize(
        &self,
        raw: &RawEventData,
        source: &Source,
    ) -> Result<Vec<NormalizedEvent>, AppError>;
}

// ---------------------------------------------------------------------------
// Best-effort sinks
// ---------------------------------------------------------------------------

/// Archives raw fetch payloads. Failures are swallowed by implementations.
pub trait SnapshotSink: Send + Sync + Clone {
    /// Returns the written path, or `None` when nothing was stored.
    fn save(&self, raw: &RawEventData) -> impl Future<Output = Option<PathBuf>> + Send;

    /// Delete snapshots from days before `cutoff`. Returns the number of files removed.
    fn prune_before(&self, cutoff: NaiveDate)
    -> impl Future<Output = Result<usize, AppError>> + Send;
}

/// Appends run-log entries. Failures are swallowed by implementations.
pub trait RunLogSink: Send + Sync + Clone {
    fn append(&self, entry: &RunLogEntry) -> impl Future<Output = Option<PathBuf>> + Send;

    fn prune_before(&self, cutoff: NaiveDate)
    -> impl Future<Output = Result<usize, AppError>> + Send;
}

/// A no-op sink for use when persistence is not needed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl SnapshotSink for NullSink {
    async fn save(&self, _raw: &RawEventData) -> Option<PathBuf> {
        None
    }

    async fn prune_before(&self, _cutoff: NaiveDate) -> Result<usize, AppError> {
        Ok(0)
    }
}

impl RunLogSink for NullSink {
    async fn append(&self, _entry: &RunLogEntry) -> Option<PathBuf> {
        None
    }

    async fn prune_before(&self, _cutoff: NaiveDate) -> Result<usize, AppError> {
        Ok(0)
    }
}

// ---------------------------------------------------------------------------
// AI fallback
// ---------------------------------------------------------------------------

/// What the fallback search is asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackQuery {
    pub region: String,
    pub categories: Vec<String>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub limit: usize,
}

/// Last-resort producer of candidate events when structured sources yield none.
pub trait FallbackSearch: Send + Sync + Clone {
    fn is_enabled(&self) -> bool {
        true
    }

    fn search(
        &self,
        query: &FallbackQuery,
    ) -> impl Future<Output = Result<Vec<NormalizedEvent>, AppError>> + Send;
}

/// Disabled fallback.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFallback;

impl FallbackSearch for NoFallback {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn search(&self, _query: &FallbackQuery) -> Result<Vec<NormalizedEvent>, AppError> {
        Ok(vec![])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockFetcher, make_test_source};

    #[tokio::test]
    async fn test_conditional_fetch_sends_stored_tokens() {
        let fetcher = MockFetcher::with_body("<rss></rss>");
        let mut source = make_test_source("feed");
        source.etag = Some("\"v1\"".into());
        source.last_modified = Some("Mon, 01 Jul 2024 00:00:00 GMT".into());

        conditional_fetch(&fetcher, &source).await.unwrap();

        let requests = fetcher.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].etag.as_deref(), Some("\"v1\""));
        assert_eq!(
            requests[0].last_modified.as_deref(),
            Some("Mon, 01 Jul 2024 00:00:00 GMT")
        );
    }

    #[tokio::test]
    async fn test_conditional_fetch_not_modified_is_empty() {
        let fetcher = MockFetcher::with_status(304);
        let mut source = make_test_source("feed");
        source.etag = Some("\"v1\"".into());

        let outcome = conditional_fetch(&fetcher, &source).await.unwrap();
        assert!(outcome.not_modified);
        assert!(outcome.raw.is_empty());
        assert_eq!(outcome.etag.as_deref(), Some("\"v1\""));
    }

    #[tokio::test]
    async fn test_conditional_fetch_error_status() {
        let fetcher = MockFetcher::with_status(503);
        let source = make_test_source("feed");

        let err = conditional_fetch(&fetcher, &source).await.unwrap_err();
        assert!(matches!(err, AppError::FetchError { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_conditional_fetch_returns_new_tokens() {
        let fetcher = MockFetcher::with_responses(vec![Ok(FetchResponse {
            status: 200,
            body: "BEGIN:VCALENDAR".into(),
            etag: Some("\"v2\"".into()),
            last_modified: None,
            content_type: Some("text/calendar".into()),
        })]);
        let source = make_test_source("cal");

        let outcome = conditional_fetch(&fetcher, &source).await.unwrap();
        assert_eq!(outcome.raw.len(), 1);
        assert_eq!(outcome.etag.as_deref(), Some("\"v2\""));
        assert_eq!(outcome.raw[0].snapshot_extension(), "ics");
    }

    #[tokio::test]
    async fn test_probe_statuses() {
        let source = make_test_source("s");
        assert!(probe(&MockFetcher::with_status(200), &source, 0.9).await.is_valid);

        let head_refused = probe(&MockFetcher::with_status(405), &source, 0.9).await;
        assert!(head_refused.is_valid);
        assert_eq!(head_refused.warnings.len(), 1);

        let missing = probe(&MockFetcher::with_status(404), &source, 0.9).await;
        assert!(!missing.is_valid);
        assert_eq!(missing.confidence, 0.0);
    }
}
