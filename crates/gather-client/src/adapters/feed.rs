//! RSS 2.0 / Atom adapter.

use gather_core::error::AppError;
use gather_core::models::{
    FetchOutcome, NormalizedEvent, RawEventData, Source, SourceType, ValidationResult,
};
use gather_core::normalize::{EventDraft, find_date_in_text, infer_category, parse_datetime};
use gather_core::traits::{Fetcher, SourceAdapter, conditional_fetch, probe};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use super::{accepts, finish_drafts};

const VALIDATE_CONFIDENCE: f64 = 0.9;
/// Entry carried an explicit event-date element.
const EXPLICIT_DATE_CONFIDENCE: f64 = 0.85;
/// Date was found in the title or description text.
const TEXT_DATE_CONFIDENCE: f64 = 0.75;

#[derive(Clone)]
pub struct FeedAdapter<F: Fetcher> {
    fetcher: F,
}

impl<F: Fetcher> FeedAdapter<F> {
    pub fn new(fetcher: F) -> Self {
        Self { fetcher }
    }
}

impl<F: Fetcher> SourceAdapter for FeedAdapter<F> {
    fn can_handle(&self, source: &Source) -> bool {
        accepts(SourceType::Feed, source)
    }

    async fn fetch(&self, source: &Source) -> Result<FetchOutcome, AppError> {
        conditional_fetch(&self.fetcher, source).await
    }

    async fn validate(&self, source: &Source) -> ValidationResult {
        probe(&self.fetcher, source, VALIDATE_CONFIDENCE).await
    }

    fn normalize(
        &self,
        raw: &RawEventData,
        source: &Source,
    ) -> Result<Vec<NormalizedEvent>, AppError> {
        let entries = parse_entries(&raw.content)?;
        Ok(finish_drafts(
            entries.into_iter().map(FeedEntry::into_draft),
            raw,
            source,
        ))
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct FeedEntry {
    title: String,
    description: String,
    content: String,
    link: Option<String>,
    event_start: Option<String>,
    event_end: Option<String>,
    location: String,
    organizer: String,
    category: String,
}

#[derive(Debug, Clone, Copy)]
enum Field {
    Title,
    Description,
    Content,
    Link,
    EventStart,
    EventEnd,
    Location,
    Organizer,
    Category,
}

impl Field {
    fn from_name(name: &str) -> Option<Self> {
        let field = match name {
            "title" => Field::Title,
            "description" | "summary" => Field::Description,
            "content" | "content:encoded" => Field::Content,
            "link" => Field::Link,
            "ev:startdate" | "event:startdate" | "event:date" | "startdate" | "eventdate" => {
                Field::EventStart
            }
            "ev:enddate" | "event:enddate" | "enddate" => Field::EventEnd,
            "ev:location" | "event:location" | "location" => Field::Location,
            "ev:organizer" | "dc:creator" | "author" | "name" => Field::Organizer,
            "category" | "dc:subject" => Field::Category,
            _ => return None,
        };
        Some(field)
    }
}

impl FeedEntry {
    fn push(&mut self, field: Field, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        match field {
            Field::Title => append(&mut self.title, text),
            Field::Description => append(&mut self.description, text),
            Field::Content => append(&mut self.content, text),
            Field::Link => {
                if self.link.is_none() {
                    self.link = Some(text.to_string());
                }
            }
            Field::EventStart => self.event_start = Some(text.to_string()),
            Field::EventEnd => self.event_end = Some(text.to_string()),
            Field::Location => append(&mut self.location, text),
            Field::Organizer => append(&mut self.organizer, text),
            Field::Category => append(&mut self.category, text),
        }
    }

    fn into_draft(self) -> (EventDraft, f64) {
        let description = if self.description.is_empty() {
            self.content
        } else {
            self.description
        };

        let explicit = self.event_start.as_deref().and_then(parse_datetime);
        let confidence = if explicit.is_some() {
            EXPLICIT_DATE_CONFIDENCE
        } else {
            TEXT_DATE_CONFIDENCE
        };
        let starts_at = explicit
            .or_else(|| find_date_in_text(&self.title))
            .or_else(|| find_date_in_text(&description));

        let draft = EventDraft {
            title: self.title,
            starts_at,
            ends_at: self.event_end.as_deref().and_then(parse_datetime),
            location: self.location,
            url: self.link,
            organizer: Some(self.organizer).filter(|o| !o.is_empty()),
            price_text: None,
            // Feed categories are free-form; keep them only when they map to a known one.
            category: infer_category(&self.category).map(str::to_string),
            description,
            ..Default::default()
        };
        (draft, confidence)
    }
}

fn append(target: &mut String, text: &str) {
    if !target.is_empty() {
        target.push(' ');
    }
    target.push_str(text);
}

fn element_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).to_lowercase()
}

fn attribute(e: &BytesStart<'_>, key: &str) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref().eq_ignore_ascii_case(key.as_bytes()))
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// Atom links carry the URL in `href`; prefer `rel="alternate"` or no rel.
fn atom_link(e: &BytesStart<'_>) -> Option<String> {
    let rel = attribute(e, "rel");
    if rel.as_deref().is_some_and(|r| r != "alternate") {
        return None;
    }
    attribute(e, "href")
}

/// Collect `<item>` (RSS/RDF) and `<entry>` (Atom) elements.
fn parse_entries(xml: &str) -> Result<Vec<FeedEntry>, AppError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<FeedEntry> = None;
    let mut field: Option<Field> = None;
    let mut saw_root = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = element_name(&e);
                match name.as_str() {
                    "rss" | "feed" | "rdf:rdf" => saw_root = true,
                    "item" | "entry" => {
                        current = Some(FeedEntry::default());
                        field = None;
                    }
                    _ => {
                        if let Some(entry) = current.as_mut() {
                            if name == "link"
                                && let Some(href) = atom_link(&e)
                            {
                                entry.push(Field::Link, &href);
                            }
                            field = Field::from_name(&name);
                        }
                    }
                }
            }
            Ok(Event::Empty(e)) => {
                if let Some(entry) = current.as_mut() {
                    match element_name(&e).as_str() {
                        "link" => {
                            if let Some(href) = atom_link(&e) {
                                entry.push(Field::Link, &href);
                            }
                        }
                        "category" => {
                            if let Some(term) = attribute(&e, "term") {
                                entry.push(Field::Category, &term);
                            }
                        }
                        _ => {}
                    }
                }
            }
            Ok(Event::Text(t)) => {
                if let (Some(entry), Some(f)) = (current.as_mut(), field) {
                    // HTML entities such as &nbsp; are not XML; keep the raw text and
                    // let normalization decode them.
                    let text = t.unescape().map(|c| c.into_owned()).unwrap_or_else(|e| {
                        tracing::debug!(error = %e, "Keeping undecoded feed text");
                        String::from_utf8_lossy(&t).into_owned()
                    });
                    entry.push(f, &text);
                }
            }
            Ok(Event::CData(c)) => {
                if let (Some(entry), Some(f)) = (current.as_mut(), field) {
                    entry.push(f, &String::from_utf8_lossy(&c));
                }
            }
            Ok(Event::End(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_lowercase();
                if name == "item" || name == "entry" {
                    if let Some(entry) = current.take() {
                        entries.push(entry);
                    }
                } else {
                    field = None;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(AppError::parse(format!(
                    "Invalid feed XML at position {}: {e}",
                    reader.buffer_position()
                )));
            }
            _ => {}
        }
    }

    if !saw_root {
        return Err(AppError::parse("Payload is not an RSS or Atom feed"));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use gather_core::testutil::{MockFetcher, make_test_source};

    fn normalize(xml: &str) -> Result<Vec<NormalizedEvent>, AppError> {
        let adapter = FeedAdapter::new(MockFetcher::with_body(""));
        let source = make_test_source("city-feed");
        let raw = RawEventData::new(&source.id, &source.url, xml, None);
        adapter.normalize(&raw, &source)
    }

    #[test]
    fn test_rss_item_with_event_date() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:ev="http://purl.org/rss/1.0/modules/event/">
  <channel>
    <title>City news</title>
    <item>
      <title>Morioka Sansa Odori Festival</title>
      <link>https://city.example.jp/sansa</link>
      <description><![CDATA[<p>Dance parade on Chuo-dori. Admission free.</p>]]></description>
      <ev:startdate>2025-08-01T18:00:00+09:00</ev:startdate>
      <ev:enddate>2025-08-04T21:00:00+09:00</ev:enddate>
      <ev:location>Chuo-dori, Morioka</ev:location>
    </item>
  </channel>
</rss>"#;

        let events = normalize(xml).unwrap();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.title, "Morioka Sansa Odori Festival");
        assert_eq!(
            event.starts_at,
            Utc.with_ymd_and_hms(2025, 8, 1, 9, 0, 0).unwrap()
        );
        assert!(event.ends_at.is_some());
        assert_eq!(event.city, "Morioka");
        assert_eq!(event.venue, "Chuo-dori");
        assert_eq!(event.category, "festival");
        assert_eq!(event.price, Some(0));
        assert_eq!(event.event_url.as_deref(), Some("https://city.example.jp/sansa"));
        assert_eq!(event.confidence, EXPLICIT_DATE_CONFIDENCE);
    }

    #[test]
    fn test_date_found_in_title() {
        let xml = r#"<rss><channel>
<item><title>2025年10月12日 盛岡マルシェ開催</title><description>岩手公園で開催</description></item>
</channel></rss>"#;

        let events = normalize(xml).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].starts_at,
            Utc.with_ymd_and_hms(2025, 10, 12, 0, 0, 0).unwrap()
        );
        assert_eq!(events[0].category, "market");
        assert_eq!(events[0].confidence, TEXT_DATE_CONFIDENCE);
    }

    #[test]
    fn test_unresolvable_entries_dropped() {
        let xml = r#"<rss><channel>
<item><title>Office closed notice</title><description>No date here</description></item>
<item><title>Autumn Leaves Walk 2025/11/03</title></item>
</channel></rss>"#;

        let events = normalize(xml).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].title.starts_with("Autumn Leaves Walk"));
    }

    #[test]
    fn test_html_entity_does_not_drop_feed() {
        let xml = r#"<rss><channel>
<item><title>Sansa&nbsp;Odori 2025/08/01</title></item>
<item><title>Autumn Leaves Walk 2025/11/03</title></item>
</channel></rss>"#;

        let events = normalize(xml).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].title.starts_with("Sansa Odori"));
    }

    #[test]
    fn test_atom_entries() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Hanamaki events</title>
  <entry>
    <title>Hanamaki Jazz Live</title>
    <link rel="self" href="https://hanamaki.example.jp/feed/1"/>
    <link rel="alternate" href="https://hanamaki.example.jp/events/1"/>
    <summary>Concert at Hanamaki Civic Hall on 2025-09-20 19:00, tickets ¥2,000</summary>
    <category term="music"/>
    <author><name>Hanamaki Tourism</name></author>
  </entry>
</feed>"#;

        let events = normalize(xml).unwrap();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(
            event.event_url.as_deref(),
            Some("https://hanamaki.example.jp/events/1")
        );
        assert_eq!(
            event.starts_at,
            Utc.with_ymd_and_hms(2025, 9, 20, 19, 0, 0).unwrap()
        );
        assert_eq!(event.category, "music");
        assert_eq!(event.price, Some(2000));
        assert_eq!(event.city, "Hanamaki");
        assert_eq!(event.organizer.as_deref(), Some("Hanamaki Tourism"));
    }

    #[test]
    fn test_not_a_feed() {
        let err = normalize("<html><body>hello</body></html>").unwrap_err();
        assert!(matches!(err, AppError::ParseError(_)));
    }

    #[test]
    fn test_malformed_xml() {
        let err = normalize("<rss><channel><item><title>x</item></rss>").unwrap_err();
        assert!(matches!(err, AppError::ParseError(_)));
    }

    #[tokio::test]
    async fn test_fetch_sends_stored_tokens() {
        let fetcher = MockFetcher::with_status(304);
        let adapter = FeedAdapter::new(fetcher.clone());
        let mut source = make_test_source("city-feed");
        source.etag = Some("\"abc\"".to_string());
        source.last_modified = Some("Wed, 01 Oct 2025 00:00:00 GMT".to_string());

        let outcome = adapter.fetch(&source).await.unwrap();
        assert!(outcome.not_modified);
        assert!(outcome.raw.is_empty());
        assert_eq!(outcome.etag.as_deref(), Some("\"abc\""));

        let request = &fetcher.requests()[0];
        assert_eq!(request.etag.as_deref(), Some("\"abc\""));
        assert!(request.last_modified.is_some());
    }
}
