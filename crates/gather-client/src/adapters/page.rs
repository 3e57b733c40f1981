//! Structured-page adapter.
//!
//! HTML pages are handed to a chain of [`CandidateExtractor`]s; the first
//! extractor that finds anything wins. The default chain tries embedded
//! JSON-LD, then schema.org microdata, then keyword-gated heuristics over
//! list items, announcement blocks and calendar grids.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use chrono::{NaiveDate, TimeZone, Utc};
use gather_core::error::AppError;
use gather_core::models::{
    FetchOutcome, NormalizedEvent, RawEventData, Source, SourceType, ValidationResult,
};
use gather_core::normalize::{
    EventDraft, clean_text, find_date_in_text, normalize_for_match, parse_datetime,
};
use gather_core::traits::{Fetcher, SourceAdapter, conditional_fetch, probe};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use url::Url;

use super::{accepts, finish_drafts};

const VALIDATE_CONFIDENCE: f64 = 0.7;
const JSON_LD_CONFIDENCE: f64 = 0.9;
const MICRODATA_CONFIDENCE: f64 = 0.85;
const HEURISTIC_CONFIDENCE: f64 = 0.55;
const CALENDAR_CELL_CONFIDENCE: f64 = 0.5;

/// Blocks longer than this are page containers, not announcements.
const MAX_BLOCK_CHARS: usize = 600;
const MAX_TITLE_CHARS: usize = 100;

// ---------------------------------------------------------------------------
// Extraction interface
// ---------------------------------------------------------------------------

/// An event-like record found on a page, with the extractor's confidence.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub draft: EventDraft,
    pub confidence: f64,
}

/// Finds candidate event records in a parsed HTML document.
pub trait CandidateExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    /// `base` is the page URL, used to resolve relative links.
    fn extract(&self, document: &Html, base: Option<&Url>) -> Vec<Candidate>;
}

#[derive(Clone)]
pub struct StructuredPageAdapter<F: Fetcher> {
    fetcher: F,
    extractors: Arc<Vec<Box<dyn CandidateExtractor>>>,
}

impl<F: Fetcher> StructuredPageAdapter<F> {
    pub fn new(fetcher: F) -> Self {
        Self::with_extractors(
            fetcher,
            vec![
                Box::new(JsonLdExtractor),
                Box::new(MicrodataExtractor),
                Box::new(HeuristicExtractor),
            ],
        )
    }

    pub fn with_extractors(fetcher: F, extractors: Vec<Box<dyn CandidateExtractor>>) -> Self {
        Self {
            fetcher,
            extractors: Arc::new(extractors),
        }
    }
}

impl<F: Fetcher> SourceAdapter for StructuredPageAdapter<F> {
    fn can_handle(&self, source: &Source) -> bool {
        accepts(SourceType::StructuredPage, source)
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
        let document = Html::parse_document(&raw.content);
        let base = Url::parse(&raw.source_url).ok();

        for extractor in self.extractors.iter() {
            let candidates = extractor.extract(&document, base.as_ref());
            if candidates.is_empty() {
                continue;
            }
            tracing::debug!(
                source_id = %source.id,
                extractor = extractor.name(),
                candidates = candidates.len(),
                "Extracted page candidates"
            );
            return Ok(finish_drafts(
                candidates.into_iter().map(|c| (c.draft, c.confidence)),
                raw,
                source,
            ));
        }

        tracing::debug!(source_id = %source.id, "No event candidates on page");
        Ok(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("valid selector")
}

fn element_text(el: ElementRef<'_>) -> String {
    clean_text(&el.text().collect::<Vec<_>>().join(" "))
}

fn resolve(base: Option<&Url>, href: &str) -> String {
    base.and_then(|b| b.join(href).ok())
        .map(|u| u.to_string())
        .unwrap_or_else(|| href.to_string())
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect::<String>().trim().to_string()
}

// ---------------------------------------------------------------------------
// JSON-LD
// ---------------------------------------------------------------------------

static LD_JSON: LazyLock<Selector> =
    LazyLock::new(|| selector(r#"script[type="application/ld+json"]"#));

/// schema.org `Event` records embedded as JSON-LD.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLdExtractor;

impl CandidateExtractor for JsonLdExtractor {
    fn name(&self) -> &'static str {
        "json-ld"
    }

    fn extract(&self, document: &Html, base: Option<&Url>) -> Vec<Candidate> {
        let mut records = Vec::new();
        for script in document.select(&LD_JSON) {
            let text: String = script.text().collect();
            match serde_json::from_str::<Value>(text.trim()) {
                Ok(value) => records.push(value),
                Err(e) => tracing::debug!(error = %e, "Skipping malformed JSON-LD block"),
            }
        }

        let mut events = Vec::new();
        for record in &records {
            collect_ld_events(record, &mut events);
        }
        events
            .into_iter()
            .map(|event| Candidate {
                draft: ld_draft(event, base),
                confidence: JSON_LD_CONFIDENCE,
            })
            .collect()
    }
}

fn is_event_type(value: Option<&Value>) -> bool {
    match value {
        Some(Value::String(t)) => t.ends_with("Event") || t == "Festival",
        Some(Value::Array(types)) => types.iter().any(|t| is_event_type(Some(t))),
        _ => false,
    }
}

fn collect_ld_events<'a>(value: &'a Value, out: &mut Vec<&'a Value>) {
    match value {
        Value::Array(items) => items.iter().for_each(|v| collect_ld_events(v, out)),
        Value::Object(map) => {
            if is_event_type(map.get("@type")) {
                out.push(value);
            }
            for key in ["@graph", "itemListElement", "item"] {
                if let Some(nested) = map.get(key) {
                    collect_ld_events(nested, out);
                }
            }
        }
        _ => {}
    }
}

/// Plain text of a JSON-LD value: strings as-is, objects by `name`.
fn ld_text(value: Option<&Value>) -> Option<String> {
    let text = match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => ld_text(map.get("name")),
        Value::Array(items) => items.first().and_then(|v| ld_text(Some(v))),
        _ => None,
    };
    text.filter(|s| !s.trim().is_empty())
}

fn ld_f64(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn ld_address(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => {
            let parts: Vec<String> = ["streetAddress", "addressLocality", "addressRegion"]
                .iter()
                .filter_map(|k| ld_text(map.get(*k)))
                .collect();
            (!parts.is_empty()).then(|| parts.join(", "))
        }
        _ => None,
    }
}

fn ld_draft(event: &Value, base: Option<&Url>) -> EventDraft {
    let location = match event.get("location") {
        Some(Value::Array(places)) => places.first(),
        other => other,
    };
    let (location_text, lat, lon) = match location {
        Some(Value::Object(place)) => {
            let parts: Vec<String> = [ld_text(place.get("name")), ld_address(place.get("address"))]
                .into_iter()
                .flatten()
                .collect();
            let geo = place.get("geo");
            (
                parts.join(", "),
                ld_f64(geo.and_then(|g| g.get("latitude"))),
                ld_f64(geo.and_then(|g| g.get("longitude"))),
            )
        }
        other => (ld_text(other).unwrap_or_default(), None, None),
    };

    let offer = match event.get("offers") {
        Some(Value::Array(offers)) => offers.first(),
        other => other,
    };
    let free = event
        .get("isAccessibleForFree")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let price_text = if free {
        Some("free".to_string())
    } else {
        ld_f64(offer.and_then(|o| o.get("price"))).map(|p| {
            if p == 0.0 {
                "free".to_string()
            } else {
                format!("¥{}", p.round() as u64)
            }
        })
    };

    EventDraft {
        title: ld_text(event.get("name")).unwrap_or_default(),
        description: ld_text(event.get("description")).unwrap_or_default(),
        starts_at: ld_text(event.get("startDate")).as_deref().and_then(parse_datetime),
        ends_at: ld_text(event.get("endDate")).as_deref().and_then(parse_datetime),
        location: location_text,
        lat,
        lon,
        url: ld_text(event.get("url")).map(|u| resolve(base, &u)),
        organizer: ld_text(event.get("organizer")),
        price_text,
        category: None,
    }
}

// ---------------------------------------------------------------------------
// Microdata
// ---------------------------------------------------------------------------

static ITEM_SCOPE: LazyLock<Selector> = LazyLock::new(|| selector("[itemscope][itemtype]"));
static ITEM_PROP: LazyLock<Selector> = LazyLock::new(|| selector("[itemprop]"));

/// schema.org `Event` items marked up with `itemscope`/`itemprop`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MicrodataExtractor;

impl CandidateExtractor for MicrodataExtractor {
    fn name(&self) -> &'static str {
        "microdata"
    }

    fn extract(&self, document: &Html, base: Option<&Url>) -> Vec<Candidate> {
        document
            .select(&ITEM_SCOPE)
            .filter(|scope| {
                scope.value().attr("itemtype").is_some_and(|t| {
                    t.contains("schema.org/")
                        && (t.ends_with("Event") || t.ends_with("Festival"))
                })
            })
            .map(|scope| Candidate {
                draft: microdata_draft(scope, base),
                confidence: MICRODATA_CONFIDENCE,
            })
            .collect()
    }
}

/// Properties whose nearest enclosing item is `scope` itself.
fn scoped_props<'a>(scope: ElementRef<'a>) -> Vec<(String, ElementRef<'a>)> {
    scope
        .select(&ITEM_PROP)
        .filter(|prop| {
            prop.ancestors()
                .filter_map(ElementRef::wrap)
                .find(|a| a.value().attr("itemscope").is_some())
                .is_some_and(|owner| owner.id() == scope.id())
        })
        .filter_map(|prop| {
            let name = prop.value().attr("itemprop")?.trim().to_string();
            Some((name, prop))
        })
        .collect()
}

fn prop_value(prop: ElementRef<'_>) -> String {
    let el = prop.value();
    el.attr("content")
        .or_else(|| el.attr("datetime"))
        .or_else(|| match el.name() {
            "a" | "link" => el.attr("href"),
            "img" => el.attr("src"),
            _ => None,
        })
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| element_text(prop))
}

fn find_prop<'a>(props: &[(String, ElementRef<'a>)], name: &str) -> Option<ElementRef<'a>> {
    props.iter().find(|(n, _)| n == name).map(|(_, el)| *el)
}

fn microdata_draft(scope: ElementRef<'_>, base: Option<&Url>) -> EventDraft {
    let props = scoped_props(scope);
    let text = |name: &str| find_prop(&props, name).map(prop_value).filter(|v| !v.is_empty());

    let (location, lat, lon) = match find_prop(&props, "location") {
        Some(place) if place.value().attr("itemscope").is_some() => {
            let place_props = scoped_props(place);
            let parts: Vec<String> = ["name", "address"]
                .iter()
                .filter_map(|n| find_prop(&place_props, n).map(prop_value))
                .filter(|v| !v.is_empty())
                .collect();
            let coordinate = |name: &str| {
                place
                    .select(&ITEM_PROP)
                    .find(|p| p.value().attr("itemprop") == Some(name))
                    .and_then(|p| prop_value(p).parse::<f64>().ok())
            };
            (
                parts.join(", "),
                coordinate("latitude"),
                coordinate("longitude"),
            )
        }
        Some(place) => (prop_value(place), None, None),
        None => (String::new(), None, None),
    };

    EventDraft {
        title: text("name").unwrap_or_default(),
        description: text("description").unwrap_or_default(),
        starts_at: text("startDate").as_deref().and_then(parse_datetime),
        ends_at: text("endDate").as_deref().and_then(parse_datetime),
        location,
        lat,
        lon,
        url: text("url").map(|u| resolve(base, &u)),
        organizer: text("organizer"),
        price_text: text("price").map(|p| format!("¥{p}")),
        category: None,
    }
}

// ---------------------------------------------------------------------------
// Heuristics
// ---------------------------------------------------------------------------

static BLOCKS: LazyLock<Selector> =
    LazyLock::new(|| selector(r#"article, section.event, [class*="event"], dl"#));
static LIST_ITEMS: LazyLock<Selector> = LazyLock::new(|| selector("li"));
static TABLES: LazyLock<Selector> = LazyLock::new(|| selector("table"));
static CELLS: LazyLock<Selector> = LazyLock::new(|| selector("td"));
static CAPTION: LazyLock<Selector> = LazyLock::new(|| selector("caption, th"));
static HEADINGS: LazyLock<Selector> =
    LazyLock::new(|| selector(r#"h1, h2, h3, h4, h5, .title, dt, strong"#));
static LINKS: LazyLock<Selector> = LazyLock::new(|| selector("a[href]"));

static EVENT_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:events?|festival|concert|live|workshop|fair|market|exhibition|parade|fireworks|marathon)\b|イベント|祭|まつり|開催|フェス|ライブ|コンサート|マルシェ|展示|花火|体験|講座",
    )
    .expect("valid regex")
});

static DATE_STRIP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\d{4}\s*[-/年.]\s*\d{1,2}\s*[-/月.]\s*\d{1,2}\s*日?(?:\s*[（(][^）)]{1,4}[）)])?(?:\s*\d{1,2}\s*[:時]\s*\d{0,2}\s*分?)?",
    )
    .expect("valid regex")
});

static LOCATION_LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:会場|場所|(?i:venue|place))\s*[:：]\s*([^、。,;|/]+)").expect("valid regex")
});

static YEAR_MONTH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{4})\s*[年/.-]\s*(\d{1,2})").expect("valid regex")
});

static DAY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d{1,2})\s*日?").expect("valid regex"));

/// Keyword-gated extraction from announcement blocks, list items and
/// month-calendar tables.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicExtractor;

impl CandidateExtractor for HeuristicExtractor {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn extract(&self, document: &Html, base: Option<&Url>) -> Vec<Candidate> {
        let mut seen = HashSet::new();
        let mut used_blocks = HashSet::new();
        let mut candidates = Vec::new();
        let mut push = |candidate: Candidate| {
            let key = (
                normalize_for_match(&candidate.draft.title),
                candidate
                    .draft
                    .starts_at
                    .map(|d| d.date_naive().to_string())
                    .unwrap_or_default(),
            );
            if seen.insert(key) {
                candidates.push(candidate);
            }
        };

        for block in document.select(&BLOCKS) {
            if let Some(candidate) = text_block_candidate(block, base) {
                used_blocks.insert(block.id());
                push(candidate);
            }
        }

        for item in document.select(&LIST_ITEMS) {
            let inside_used = item.ancestors().any(|a| used_blocks.contains(&a.id()));
            if inside_used {
                continue;
            }
            if let Some(candidate) = text_block_candidate(item, base) {
                push(candidate);
            }
        }

        for table in document.select(&TABLES) {
            for candidate in calendar_grid_candidates(table, base) {
                push(candidate);
            }
        }

        candidates
    }
}

fn is_only_date(text: &str) -> bool {
    DATE_STRIP_RE.replace_all(text, "").trim().is_empty()
        || text.chars().all(|c| c.is_ascii_digit() || c.is_whitespace())
}

fn text_block_candidate(el: ElementRef<'_>, base: Option<&Url>) -> Option<Candidate> {
    let text = element_text(el);
    if text.is_empty() || text.chars().count() > MAX_BLOCK_CHARS || !EVENT_KEYWORDS.is_match(&text)
    {
        return None;
    }
    let starts_at = find_date_in_text(&text)?;

    let location_match = LOCATION_LABEL_RE.captures(&text);
    let location = location_match
        .as_ref()
        .and_then(|c| c.get(1))
        .map(|m| truncate_chars(m.as_str(), 60))
        .unwrap_or_default();

    let title = el
        .select(&HEADINGS)
        .map(element_text)
        .find(|t| !t.is_empty() && !is_only_date(t))
        .or_else(|| el.select(&LINKS).map(element_text).find(|t| !t.is_empty()))
        .unwrap_or_else(|| {
            let head = match location_match.as_ref().and_then(|c| c.get(0)) {
                Some(m) => &text[..m.start()],
                None => text.as_str(),
            };
            let stripped = DATE_STRIP_RE.replace_all(head, " ");
            stripped
                .trim_matches(|c: char| c.is_whitespace() || ":：-–|・".contains(c))
                .to_string()
        });

    let url = el
        .select(&LINKS)
        .find_map(|a| a.value().attr("href"))
        .map(|href| resolve(base, href));

    Some(Candidate {
        draft: EventDraft {
            title: truncate_chars(&title, MAX_TITLE_CHARS),
            description: text,
            starts_at: Some(starts_at),
            location,
            url,
            ..Default::default()
        },
        confidence: HEURISTIC_CONFIDENCE,
    })
}

/// Cells of a month table whose caption or header names the year and month:
/// the leading day number dates the cell, the rest must mention an event.
fn calendar_grid_candidates(table: ElementRef<'_>, base: Option<&Url>) -> Vec<Candidate> {
    let month = table
        .select(&CAPTION)
        .map(element_text)
        .chain(table.value().attr("data-month").map(str::to_string))
        .find_map(|header| {
            let caps = YEAR_MONTH_RE.captures(&header)?;
            let year: i32 = caps.get(1)?.as_str().parse().ok()?;
            let month: u32 = caps.get(2)?.as_str().parse().ok()?;
            Some((year, month))
        });
    let Some((year, month)) = month else {
        return Vec::new();
    };

    table
        .select(&CELLS)
        .filter_map(|cell| {
            let text = element_text(cell);
            let caps = DAY_RE.captures(&text)?;
            let day: u32 = caps.get(1)?.as_str().parse().ok()?;
            let rest = text[caps.get(0)?.end()..].trim();
            if rest.is_empty() || !EVENT_KEYWORDS.is_match(rest) {
                return None;
            }
            let date = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(0, 0, 0)?;
            let link = cell.select(&LINKS).next();
            let title = link
                .map(element_text)
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| rest.to_string());

            Some(Candidate {
                draft: EventDraft {
                    title: truncate_chars(&title, MAX_TITLE_CHARS),
                    description: rest.to_string(),
                    starts_at: Some(Utc.from_utc_datetime(&date)),
                    url: link
                        .and_then(|a| a.value().attr("href"))
                        .map(|href| resolve(base, href)),
                    ..Default::default()
                },
                confidence: CALENDAR_CELL_CONFIDENCE,
            })
        })
        .collect()
}
