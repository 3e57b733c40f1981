//! REST/JSON endpoint adapter.
//!
//! Responses from known APIs are read through a registered [`ResponseShape`]
//! picked by URL pattern; anything else goes through a generic extractor
//! that looks for the first array of objects and common field names.

use std::sync::{Arc, LazyLock};

use gather_core::error::AppError;
use gather_core::models::{
    FetchOutcome, NormalizedEvent, RawEventData, Source, SourceType, ValidationResult,
};
use gather_core::normalize::{EventDraft, infer_category, parse_datetime};
use gather_core::traits::{Fetcher, SourceAdapter, conditional_fetch, probe};
use regex::Regex;
use serde_json::{Map, Value};

use super::{accepts, finish_drafts};

const VALIDATE_CONFIDENCE: f64 = 0.9;
const KNOWN_SHAPE_CONFIDENCE: f64 = 0.9;
const GENERIC_CONFIDENCE: f64 = 0.8;

/// Keys tried, in order, for each event field. Dotted keys walk nested objects.
#[derive(Debug, Clone, Copy)]
pub struct FieldMap {
    pub title: &'static [&'static str],
    pub start: &'static [&'static str],
    /// Separate time-of-day for APIs that split date and time.
    pub start_time: &'static [&'static str],
    pub end: &'static [&'static str],
    pub description: &'static [&'static str],
    /// Every present key contributes, joined with ", ".
    pub location: &'static [&'static str],
    pub lat: &'static [&'static str],
    pub lon: &'static [&'static str],
    pub url: &'static [&'static str],
    pub organizer: &'static [&'static str],
    pub price: &'static [&'static str],
    pub category: &'static [&'static str],
}

const GENERIC_FIELDS: FieldMap = FieldMap {
    title: &["title", "name", "event_name", "summary", "イベント名", "名称"],
    start: &[
        "start", "start_date", "startDate", "starts_at", "started_at", "start_at", "date",
        "開始日", "開始日時",
    ],
    start_time: &["start_time", "開始時間"],
    end: &["end", "end_date", "endDate", "ends_at", "ended_at", "end_at", "終了日", "終了日時"],
    description: &["description", "detail", "body", "catch", "説明", "概要"],
    location: &["venue", "venue_name", "place", "location", "address", "場所名称", "場所", "住所"],
    lat: &["lat", "latitude", "緯度"],
    lon: &["lon", "lng", "long", "longitude", "経度"],
    url: &["url", "event_url", "public_url", "link", "URL"],
    organizer: &["organizer", "owner_display_name", "host", "主催者"],
    price: &["price", "fee", "料金", "料金(基本)"],
    category: &["category", "genre", "カテゴリー", "カテゴリ"],
};

/// A known API response layout.
#[derive(Debug, Clone)]
pub struct ResponseShape {
    pub name: &'static str,
    pub url_pattern: Regex,
    /// Keys leading to the event array; empty for a top-level array.
    pub items_path: &'static [&'static str],
    /// Key wrapping each array element, e.g. `{"event": {...}}`.
    pub item_key: Option<&'static str>,
    pub fields: FieldMap,
}

static KNOWN_SHAPES: LazyLock<Vec<ResponseShape>> = LazyLock::new(|| {
    vec![
        ResponseShape {
            name: "connpass",
            url_pattern: Regex::new(r"(?i)connpass\.com/api/").expect("valid regex"),
            items_path: &["events"],
            item_key: None,
            fields: FieldMap {
                title: &["title"],
                start: &["started_at"],
                start_time: &[],
                end: &["ended_at"],
                description: &["catch", "description"],
                location: &["place", "address"],
                lat: &["lat"],
                lon: &["lon"],
                url: &["url", "event_url"],
                organizer: &["owner_display_name", "series.title"],
                price: &[],
                category: &[],
            },
        },
        ResponseShape {
            name: "doorkeeper",
            url_pattern: Regex::new(r"(?i)api\.doorkeeper\.jp/").expect("valid regex"),
            items_path: &[],
            item_key: Some("event"),
            fields: FieldMap {
                title: &["title"],
                start: &["starts_at"],
                start_time: &[],
                end: &["ends_at"],
                description: &["description"],
                location: &["venue_name", "address"],
                lat: &["lat"],
                lon: &["long"],
                url: &["public_url"],
                organizer: &["group.name"],
                price: &[],
                category: &[],
            },
        },
        ResponseShape {
            // Municipal open-data event listings (standard dataset columns).
            name: "opendata-events",
            url_pattern: Regex::new(r"(?i)/opendata/|/open-data/|/odp/").expect("valid regex"),
            items_path: &[],
            item_key: None,
            fields: FieldMap {
                title: &["イベント名", "イベント名_英語"],
                start: &["開始日"],
                start_time: &["開始時間"],
                end: &["終了日"],
                description: &["説明", "概要"],
                location: &["場所名称", "住所"],
                lat: &["緯度"],
                lon: &["経度"],
                url: &["URL"],
                organizer: &["主催者"],
                price: &["料金(基本)", "料金"],
                category: &["カテゴリー"],
            },
        },
    ]
});

#[derive(Clone)]
pub struct RestAdapter<F: Fetcher> {
    fetcher: F,
    shapes: Arc<Vec<ResponseShape>>,
}

impl<F: Fetcher> RestAdapter<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            shapes: Arc::new(KNOWN_SHAPES.clone()),
        }
    }

    /// Register an extra shape; it is tried before the built-in ones.
    pub fn with_shape(mut self, shape: ResponseShape) -> Self {
        Arc::make_mut(&mut self.shapes).insert(0, shape);
        self
    }

    fn shape_for(&self, url: &str) -> Option<&ResponseShape> {
        self.shapes.iter().find(|s| s.url_pattern.is_match(url))
    }
}

impl<F: Fetcher> SourceAdapter for RestAdapter<F> {
    fn can_handle(&self, source: &Source) -> bool {
        accepts(SourceType::RestEndpoint, source)
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
        let body: Value = serde_json::from_str(&raw.content)
            .map_err(|e| AppError::parse(format!("Invalid JSON response: {e}")))?;

        let (items, fields, confidence) = match self.shape_for(&source.url) {
            Some(shape) => {
                let items = shape_items(&body, shape).ok_or_else(|| {
                    AppError::parse(format!(
                        "Response does not match the {} layout",
                        shape.name
                    ))
                })?;
                tracing::debug!(
                    source_id = %source.id,
                    shape = shape.name,
                    "Using known response shape"
                );
                (items, shape.fields, KNOWN_SHAPE_CONFIDENCE)
            }
            None => {
                let items = generic_items(&body)
                    .ok_or_else(|| AppError::parse("No event array in response"))?;
                (items, GENERIC_FIELDS, GENERIC_CONFIDENCE)
            }
        };

        Ok(finish_drafts(
            items
                .into_iter()
                .map(|item| (item_draft(item, &fields), confidence)),
            raw,
            source,
        ))
    }
}

// ---------------------------------------------------------------------------
// Locating records
// ---------------------------------------------------------------------------

fn shape_items<'a>(body: &'a Value, shape: &ResponseShape) -> Option<Vec<&'a Map<String, Value>>> {
    let mut node = body;
    for key in shape.items_path {
        node = node.get(key)?;
    }
    let items = node.as_array()?;
    Some(
        items
            .iter()
            .filter_map(|item| match shape.item_key {
                Some(key) => item.get(key)?.as_object(),
                None => item.as_object(),
            })
            .collect(),
    )
}

const COLLECTION_KEYS: &[&str] = &["events", "items", "data", "results", "records", "list"];

/// First array of objects: the body itself, a well-known collection key, or
/// any array one level down.
fn generic_items(body: &Value) -> Option<Vec<&Map<String, Value>>> {
    fn objects(items: &[Value]) -> Option<Vec<&Map<String, Value>>> {
        let objects: Vec<_> = items.iter().filter_map(unwrap_item).collect();
        (!objects.is_empty() || items.is_empty()).then_some(objects)
    }

    match body {
        Value::Array(items) => objects(items),
        Value::Object(map) => {
            for key in COLLECTION_KEYS {
                match map.get(*key) {
                    Some(Value::Array(items)) => return objects(items),
                    Some(nested @ Value::Object(_)) => {
                        if let Some(found) = generic_items(nested) {
                            return Some(found);
                        }
                    }
                    _ => {}
                }
            }
            map.values().find_map(|v| v.as_array().and_then(|a| objects(a)))
        }
        _ => None,
    }
}

/// Elements like `{"event": {...}}` are unwrapped to the inner object.
fn unwrap_item(item: &Value) -> Option<&Map<String, Value>> {
    let map = item.as_object()?;
    if map.len() == 1
        && let Some(Value::Object(inner)) = map.values().next()
    {
        return Some(inner);
    }
    Some(map)
}

// ---------------------------------------------------------------------------
// Field mapping
// ---------------------------------------------------------------------------

fn lookup<'a>(item: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    let mut parts = key.split('.');
    let mut node = item.get(parts.next()?)?;
    for part in parts {
        node = node.get(part)?;
    }
    Some(node)
}

fn value_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Object(map) => {
            return map
                .get("name")
                .or_else(|| map.get("title"))
                .and_then(value_text);
        }
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn first_text(item: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| lookup(item, k))
        .find_map(value_text)
}

fn first_f64(item: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().filter_map(|k| lookup(item, k)).find_map(|v| match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn item_draft(item: &Map<String, Value>, fields: &FieldMap) -> EventDraft {
    let mut location: Vec<String> = Vec::new();
    for text in fields
        .location
        .iter()
        .filter_map(|k| lookup(item, k))
        .filter_map(value_text)
    {
        if !location.contains(&text) {
            location.push(text);
        }
    }

    let start = first_text(item, fields.start);
    let starts_at = match (start.as_deref(), first_text(item, fields.start_time)) {
        (Some(date), Some(time)) => {
            parse_datetime(&format!("{date} {time}")).or_else(|| parse_datetime(date))
        }
        (Some(date), None) => parse_datetime(date),
        (None, _) => None,
    };

    let price_text = fields
        .price
        .iter()
        .filter_map(|k| lookup(item, k))
        .find_map(|v| match v {
            Value::Number(n) if n.as_f64() == Some(0.0) => Some("free".to_string()),
            Value::Number(n) => Some(format!("¥{n}")),
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            _ => None,
        });

    EventDraft {
        title: first_text(item, fields.title).unwrap_or_default(),
        description: first_text(item, fields.description).unwrap_or_default(),
        starts_at,
        ends_at: first_text(item, fields.end).as_deref().and_then(parse_datetime),
        location: location.join(", "),
        lat: first_f64(item, fields.lat),
        lon: first_f64(item, fields.lon),
        url: first_text(item, fields.url),
        organizer: first_text(item, fields.organizer),
        price_text,
        category: first_text(item, fields.category)
            .as_deref()
            .and_then(infer_category)
            .map(str::to_string),
    }
}
