//! iCalendar (RFC 5545) adapter.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use gather_core::error::AppError;
use gather_core::models::{
    FetchOutcome, NormalizedEvent, RawEventData, Source, SourceType, ValidationResult,
};
use gather_core::normalize::{EventDraft, infer_category, parse_datetime};
use gather_core::traits::{Fetcher, SourceAdapter, conditional_fetch, probe};

use super::{accepts, finish_drafts};

const VALIDATE_CONFIDENCE: f64 = 0.9;
const EVENT_CONFIDENCE: f64 = 0.9;

#[derive(Clone)]
pub struct CalendarAdapter<F: Fetcher> {
    fetcher: F,
}

impl<F: Fetcher> CalendarAdapter<F> {
    pub fn new(fetcher: F) -> Self {
        Self { fetcher }
    }
}

impl<F: Fetcher> SourceAdapter for CalendarAdapter<F> {
    fn can_handle(&self, source: &Source) -> bool {
        accepts(SourceType::Calendar, source)
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
        let components = parse_vevents(&raw.content)?;
        Ok(finish_drafts(
            components
                .iter()
                .map(|c| (c.to_draft(), EVENT_CONFIDENCE)),
            raw,
            source,
        ))
    }
}

// ---------------------------------------------------------------------------
// Content lines
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
struct ContentLine {
    name: String,
    params: Vec<(String, String)>,
    value: String,
}

impl ContentLine {
    fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// Join folded lines: a line starting with a space or tab continues the
/// previous one, minus that single whitespace character.
fn unfold(content: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for line in content.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix([' ', '\t']) {
            if let Some(last) = lines.last_mut() {
                last.push_str(rest);
                continue;
            }
        }
        if !line.is_empty() {
            lines.push(line.to_string());
        }
    }
    lines
}

/// Split `NAME;PARAM=VALUE:value`; the first colon outside quotes ends the params.
fn parse_content_line(line: &str) -> Option<ContentLine> {
    let mut in_quotes = false;
    let colon = line.char_indices().find_map(|(i, c)| match c {
        '"' => {
            in_quotes = !in_quotes;
            None
        }
        ':' if !in_quotes => Some(i),
        _ => None,
    })?;

    let (head, value) = (&line[..colon], &line[colon + 1..]);
    let mut parts = head.split(';');
    let name = parts.next()?.trim().to_uppercase();
    if name.is_empty() {
        return None;
    }
    let params = parts
        .filter_map(|p| p.split_once('='))
        .map(|(k, v)| (k.trim().to_uppercase(), v.trim_matches('"').to_string()))
        .collect();

    Some(ContentLine {
        name,
        params,
        value: value.to_string(),
    })
}

/// Undo TEXT escaping: `\n`, `\N`, `\,`, `\;` and `\\`.
fn unescape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n' | 'N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Date-only (`VALUE=DATE`, `YYYYMMDD`) or date-time (`YYYYMMDDTHHMMSS[Z]`).
/// Floating and TZID-qualified times are taken as UTC.
fn parse_ics_datetime(line: &ContentLine) -> Option<DateTime<Utc>> {
    let value = line.value.trim();
    let date_only = line
        .param("VALUE")
        .is_some_and(|v| v.eq_ignore_ascii_case("DATE"))
        || value.len() == 8;

    if date_only {
        let date = NaiveDate::parse_from_str(value.get(..8)?, "%Y%m%d").ok()?;
        return date.and_hms_opt(0, 0, 0).map(|n| Utc.from_utc_datetime(&n));
    }

    let naive = value.trim_end_matches(['Z', 'z']);
    NaiveDateTime::parse_from_str(naive, "%Y%m%dT%H%M%S")
        .or_else(|_| NaiveDateTime::parse_from_str(naive, "%Y%m%dT%H%M"))
        .map(|n| Utc.from_utc_datetime(&n))
        .ok()
        .or_else(|| parse_datetime(value))
}

// ---------------------------------------------------------------------------
// VEVENT
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct VEvent {
    lines: Vec<ContentLine>,
}

impl VEvent {
    fn get(&self, name: &str) -> Option<&ContentLine> {
        self.lines.iter().find(|l| l.name == name)
    }

    fn text(&self, name: &str) -> Option<String> {
        self.get(name)
            .map(|l| unescape_text(&l.value))
            .filter(|v| !v.trim().is_empty())
    }

    fn to_draft(&self) -> EventDraft {
        let (lat, lon) = self
            .get("GEO")
            .and_then(|l| l.value.split_once(';'))
            .and_then(|(lat, lon)| {
                Some((
                    lat.trim().parse::<f64>().ok()?,
                    lon.trim().parse::<f64>().ok()?,
                ))
            })
            .map_or((None, None), |(lat, lon)| (Some(lat), Some(lon)));

        let organizer = self.get("ORGANIZER").and_then(|l| {
            l.param("CN")
                .map(str::to_string)
                .or_else(|| {
                    let value = l.value.trim();
                    let value = value
                        .strip_prefix("mailto:")
                        .or_else(|| value.strip_prefix("MAILTO:"))
                        .unwrap_or(value);
                    Some(value.to_string())
                })
                .filter(|o| !o.is_empty())
        });

        EventDraft {
            title: self.text("SUMMARY").unwrap_or_default(),
            description: self.text("DESCRIPTION").unwrap_or_default(),
            starts_at: self.get("DTSTART").and_then(parse_ics_datetime),
            ends_at: self.get("DTEND").and_then(parse_ics_datetime),
            location: self.text("LOCATION").unwrap_or_default(),
            lat,
            lon,
            url: self.text("URL"),
            organizer,
            price_text: None,
            category: self
                .text("CATEGORIES")
                .and_then(|c| infer_category(&c))
                .map(str::to_string),
        }
    }
}

/// Collect top-level VEVENT components; nested components such as VALARM
/// are skipped.
fn parse_vevents(content: &str) -> Result<Vec<VEvent>, AppError> {
    let lines = unfold(content.trim_start_matches('\u{feff}'));
    if !lines
        .first()
        .is_some_and(|l| l.trim().eq_ignore_ascii_case("BEGIN:VCALENDAR"))
    {
        return Err(AppError::parse("Payload is not an iCalendar document"));
    }

    let mut events = Vec::new();
    let mut current: Option<VEvent> = None;
    let mut nested = 0usize;

    for line in &lines {
        let Some(parsed) = parse_content_line(line) else {
            continue;
        };
        let component = parsed.value.trim().to_uppercase();
        match parsed.name.as_str() {
            "BEGIN" if component == "VEVENT" && current.is_none() => {
                current = Some(VEvent::default());
            }
            "BEGIN" if current.is_some() => nested += 1,
            "END" if component == "VEVENT" && nested == 0 => {
                if let Some(event) = current.take() {
                    events.push(event);
                }
            }
            "END" if current.is_some() => nested = nested.saturating_sub(1),
            _ => {
                if let Some(event) = current.as_mut()
                    && nested == 0
                {
                    event.lines.push(parsed);
                }
            }
        }
    }

    if current.is_some() {
        tracing::debug!("Unterminated VEVENT ignored");
    }
    Ok(events)
}
