//! Source adapters: one per [`SourceType`], plus the [`AdapterSet`] that
//! dispatches on the type a source was registered with.

pub mod calendar;
pub mod feed;
pub mod page;
pub mod rest;

pub use calendar::CalendarAdapter;
pub use feed::FeedAdapter;
pub use page::{
    Candidate, CandidateExtractor, HeuristicExtractor, JsonLdExtractor, MicrodataExtractor,
    StructuredPageAdapter,
};
pub use rest::{ResponseShape, RestAdapter};

use gather_core::error::AppError;
use gather_core::models::{
    FetchOutcome, NormalizedEvent, RawEventData, Source, SourceType, ValidationResult,
};
use gather_core::normalize::EventDraft;
use gather_core::traits::{Fetcher, SourceAdapter};

/// Closed set of adapters sharing one fetcher.
#[derive(Clone)]
pub struct AdapterSet<F: Fetcher> {
    feed: FeedAdapter<F>,
    calendar: CalendarAdapter<F>,
    page: StructuredPageAdapter<F>,
    rest: RestAdapter<F>,
}

impl<F: Fetcher> AdapterSet<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            feed: FeedAdapter::new(fetcher.clone()),
            calendar: CalendarAdapter::new(fetcher.clone()),
            page: StructuredPageAdapter::new(fetcher.clone()),
            rest: RestAdapter::new(fetcher),
        }
    }

    /// Replace the structured-page adapter, e.g. to inject custom extractors.
    pub fn with_page_adapter(mut self, page: StructuredPageAdapter<F>) -> Self {
        self.page = page;
        self
    }

    /// Replace the REST adapter, e.g. to register extra response shapes.
    pub fn with_rest_adapter(mut self, rest: RestAdapter<F>) -> Self {
        self.rest = rest;
        self
    }
}

impl<F: Fetcher> SourceAdapter for AdapterSet<F> {
    fn can_handle(&self, source: &Source) -> bool {
        match source.source_type {
            SourceType::Feed => self.feed.can_handle(source),
            SourceType::Calendar => self.calendar.can_handle(source),
            SourceType::StructuredPage => self.page.can_handle(source),
            SourceType::RestEndpoint => self.rest.can_handle(source),
        }
    }

    async fn fetch(&self, source: &Source) -> Result<FetchOutcome, AppError> {
        match source.source_type {
            SourceType::Feed => self.feed.fetch(source).await,
            SourceType::Calendar => self.calendar.fetch(source).await,
            SourceType::StructuredPage => self.page.fetch(source).await,
            SourceType::RestEndpoint => self.rest.fetch(source).await,
        }
    }

    async fn validate(&self, source: &Source) -> ValidationResult {
        match source.source_type {
            SourceType::Feed => self.feed.validate(source).await,
            SourceType::Calendar => self.calendar.validate(source).await,
            SourceType::StructuredPage => self.page.validate(source).await,
            SourceType::RestEndpoint => self.rest.validate(source).await,
        }
    }

    fn normalize(
        &self,
        raw: &RawEventData,
        source: &Source,
    ) -> Result<Vec<NormalizedEvent>, AppError> {
        match source.source_type {
            SourceType::Feed => self.feed.normalize(raw, source),
            SourceType::Calendar => self.calendar.normalize(raw, source),
            SourceType::StructuredPage => self.page.normalize(raw, source),
            SourceType::RestEndpoint => self.rest.normalize(raw, source),
        }
    }
}

/// Whether `kind` accepts the source by declared type, fetch strategy or URL.
pub(crate) fn accepts(kind: SourceType, source: &Source) -> bool {
    kind.can_handle(
        Some(source.source_type),
        source.fetch_strategy.as_deref(),
        &source.url,
    )
}

/// Turn drafts into events, dropping the ones without a title or start.
pub(crate) fn finish_drafts(
    drafts: impl IntoIterator<Item = (EventDraft, f64)>,
    raw: &RawEventData,
    source: &Source,
) -> Vec<NormalizedEvent> {
    let mut dropped = 0usize;
    let events: Vec<NormalizedEvent> = drafts
        .into_iter()
        .filter_map(|(draft, confidence)| {
            let event =
                draft.into_event(&source.id, &raw.source_url, &source.category, confidence);
            if event.is_none() {
                dropped += 1;
            }
            event
        })
        .collect();

    if dropped > 0 {
        tracing::debug!(
            source_id = %source.id,
            dropped,
            kept = events.len(),
            "Dropped entries without a title or resolvable date"
        );
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use gather_core::testutil::{MockFetcher, make_test_source};

    const ICS: &str = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nSUMMARY:Morioka Jazz Night\r\nDTSTART:20250712T180000Z\r\nLOCATION:Morioka Civic Hall\\, Morioka\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";

    #[test]
    fn test_dispatch_uses_registered_type() {
        let set = AdapterSet::new(MockFetcher::with_body(""));
        let mut source = make_test_source("city-calendar");
        source.source_type = SourceType::Calendar;
        source.url = "https://city.example.jp/events".to_string();

        let raw = RawEventData::new(&source.id, &source.url, ICS, None);
        let events = set.normalize(&raw, &source).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].title, "Morioka Jazz Night");

        // The same payload is not a feed.
        source.source_type = SourceType::Feed;
        assert!(set.normalize(&raw, &source).is_err());
    }

    #[test]
    fn test_can_handle_follows_registered_type() {
        let set = AdapterSet::new(MockFetcher::with_body(""));
        for kind in SourceType::ALL {
            let mut source = make_test_source("any");
            source.source_type = kind;
            assert!(set.can_handle(&source), "{kind} not handled");
        }
    }

    #[tokio::test]
    async fn test_validate_confidence_by_shape() {
        let set = AdapterSet::new(MockFetcher::with_body(""));

        let mut feed = make_test_source("feed");
        feed.source_type = SourceType::Feed;
        let mut page = make_test_source("page");
        page.source_type = SourceType::StructuredPage;
        let mut rest = make_test_source("rest");
        rest.source_type = SourceType::RestEndpoint;

        let feed = set.validate(&feed).await;
        let page = set.validate(&page).await;
        let rest = set.validate(&rest).await;

        assert!(feed.is_valid && feed.confidence >= 0.9);
        assert!(rest.is_valid && rest.confidence >= 0.9);
        assert!(page.is_valid && page.confidence <= 0.7);
    }

    #[tokio::test]
    async fn test_validate_reports_http_failure() {
        let set = AdapterSet::new(MockFetcher::with_status(500));
        let result = set.validate(&make_test_source("down")).await;
        assert!(!result.is_valid);
        assert!(result.errors[0].contains("500"));
    }
}
