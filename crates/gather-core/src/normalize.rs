//! Shared normalization helpers used by every adapter.
//!
//! Adapters turn their payloads into [`EventDraft`]s; the draft performs the
//! common steps: gazetteer location extraction, keyword category inference,
//! price extraction, dedupe key and id derivation.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;

use crate::models::{NormalizedEvent, ValidationStatus, compute_hash};

// ---------------------------------------------------------------------------
// Text folding and similarity
// ---------------------------------------------------------------------------

/// Fold full-width ASCII variants (U+FF01..U+FF5E) and the ideographic space
/// to their half-width forms.
pub fn fold_width(c: char) -> char {
    match c {
        '\u{3000}' => ' ',
        '\u{FF01}'..='\u{FF5E}' => char::from_u32(c as u32 - 0xFEE0).unwrap_or(c),
        _ => c,
    }
}

/// Case-fold, width-fold and drop whitespace and punctuation.
pub fn normalize_for_match(s: &str) -> String {
    s.chars()
        .map(fold_width)
        .flat_map(char::to_lowercase)
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// Normalized edit-distance ratio in [0, 1]; 1.0 for an exact match after
/// normalization, 0.0 when either side is empty.
pub fn string_similarity(a: &str, b: &str) -> f64 {
    let a = normalize_for_match(a);
    let b = normalize_for_match(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    strsim::normalized_levenshtein(&a, &b)
}

/// Non-unique key used to pre-bucket likely duplicates.
pub fn dedupe_key(title: &str, starts_at: DateTime<Utc>, venue: &str) -> String {
    format!(
        "{}|{}|{}",
        normalize_for_match(title),
        starts_at.format("%Y-%m-%d"),
        normalize_for_match(venue)
    )
}

// ---------------------------------------------------------------------------
// HTML/text cleanup
// ---------------------------------------------------------------------------

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));
static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Strip tags, decode the common entities and collapse whitespace.
pub fn clean_text(s: &str) -> String {
    let without_tags = TAG_RE.replace_all(s, " ");
    let decoded = without_tags
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&");
    WS_RE.replace_all(decoded.trim(), " ").into_owned()
}

// ---------------------------------------------------------------------------
// Dates
// ---------------------------------------------------------------------------

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
];

const NAIVE_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d", "%Y.%m.%d"];

/// Parse an absolute timestamp in any of the encodings sources use.
/// Naive values are taken as UTC.
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s: String = s.trim().chars().map(fold_width).collect();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(&s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    for fmt in NAIVE_DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(&s, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|n| Utc.from_utc_datetime(&n));
        }
    }
    find_date_in_text(&s)
}

static TEXT_DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{4})\s*[-/年.]\s*(\d{1,2})\s*[-/月.]\s*(\d{1,2})\s*日?(?:[^\d]{0,6}?(\d{1,2})\s*[:時]\s*(\d{2})?)?")
        .expect("valid regex")
});

/// Find the first date (with optional time) embedded in free text.
pub fn find_date_in_text(text: &str) -> Option<DateTime<Utc>> {
    let folded: String = text.chars().map(fold_width).collect();
    let caps = TEXT_DATE_RE.captures(&folded)?;
    let year: i32 = caps.get(1)?.as_str().parse().ok()?;
    let month: u32 = caps.get(2)?.as_str().parse().ok()?;
    let day: u32 = caps.get(3)?.as_str().parse().ok()?;
    let hour: u32 = caps
        .get(4)
        .and_then(|m| m.as_str().parse().ok())
        .filter(|h| *h < 24)
        .unwrap_or(0);
    let minute: u32 = caps
        .get(5)
        .and_then(|m| m.as_str().parse().ok())
        .filter(|m| *m < 60)
        .unwrap_or(0);
    let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, 0)?;
    Some(Utc.from_utc_datetime(&naive))
}

// ---------------------------------------------------------------------------
// Gazetteer
// ---------------------------------------------------------------------------

struct Locality {
    name: &'static str,
    pattern: Regex,
}

/// Known localities of the region: (canonical name, aliases). Order matters:
/// cities first, the town sharing the prefecture's name last.
const LOCALITIES: &[(&str, &[&str])] = &[
    ("Morioka", &["盛岡"]),
    ("Hanamaki", &["花巻"]),
    ("Kitakami", &["北上"]),
    ("Ichinoseki", &["一関", "一ノ関"]),
    ("Oshu", &["奥州", "Ōshū"]),
    ("Miyako", &["宮古"]),
    ("Kamaishi", &["釜石"]),
    ("Ofunato", &["大船渡", "Ōfunato"]),
    ("Rikuzentakata", &["陸前高田"]),
    ("Kuji", &["久慈"]),
    ("Ninohe", &["二戸"]),
    ("Hachimantai", &["八幡平"]),
    ("Takizawa", &["滝沢"]),
    ("Tono", &["遠野", "Tōno"]),
    ("Shizukuishi", &["雫石"]),
    ("Hiraizumi", &["平泉"]),
    ("Shiwa", &["紫波"]),
    ("Yahaba", &["矢巾"]),
    ("Kanegasaki", &["金ケ崎", "金ヶ崎"]),
    ("Nishiwaga", &["西和賀"]),
    ("Otsuchi", &["大槌"]),
    ("Yamada", &["山田町"]),
    ("Iwaizumi", &["岩泉"]),
    ("Kuzumaki", &["葛巻"]),
    ("Karumai", &["軽米"]),
    ("Ichinohe", &["一戸"]),
    ("Kunohe", &["九戸"]),
    ("Tanohata", &["田野畑"]),
    ("Fudai", &["普代"]),
    ("Noda", &["野田村"]),
    ("Hirono", &["洋野"]),
    ("Sumita", &["住田"]),
    ("Iwate", &["岩手町"]),
];

static GAZETTEER: LazyLock<Vec<Locality>> = LazyLock::new(|| {
    LOCALITIES
        .iter()
        .map(|(name, aliases)| {
            let mut alternatives = vec![format!(r"\b{}\b", regex::escape(&name.to_lowercase()))];
            alternatives.extend(aliases.iter().map(|a| regex::escape(&a.to_lowercase())));
            let pattern = Regex::new(&format!("(?i){}", alternatives.join("|"))).expect("valid regex");
            Locality { name, pattern }
        })
        .collect()
});

static LOCATION_SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[,、，/|()（）\n]+").expect("valid regex"));

static CITY_SUFFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:岩手県|iwate(?:\s+prefecture)?)?\s*$").expect("valid regex")
});

/// Venue and city extracted from a free-form location string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    pub venue: String,
    pub city: String,
}

/// Canonical locality name mentioned in `text`, if any.
pub fn find_locality(text: &str) -> Option<&'static str> {
    let folded: String = text.chars().map(fold_width).collect();
    GAZETTEER
        .iter()
        .find(|l| l.pattern.is_match(&folded))
        .map(|l| l.name)
}

/// Split a location string into {venue, city} against the gazetteer.
pub fn extract_location(text: &str) -> Location {
    let folded: String = text.chars().map(fold_width).collect();
    let segments: Vec<&str> = LOCATION_SPLIT_RE
        .split(&folded)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    let Some(city) = find_locality(&folded) else {
        return Location {
            venue: segments.first().map(|s| s.to_string()).unwrap_or_default(),
            city: String::new(),
        };
    };

    let locality = GAZETTEER.iter().find(|l| l.name == city);
    let is_city_segment = |segment: &str| {
        locality.is_some_and(|l| {
            let stripped = l.pattern.replace_all(segment, "");
            let stripped = stripped
                .trim()
                .trim_end_matches(['市', '町', '村'])
                .trim_end_matches(" city")
                .trim_end_matches(" City")
                .trim_end_matches(" town");
            CITY_SUFFIX_RE.is_match(stripped.trim())
        })
    };

    let venue = segments
        .iter()
        .find(|s| !is_city_segment(s))
        .map(|s| {
            if segments.len() == 1 {
                // Single Japanese-style segment: "盛岡市内丸 岩手公園" → drop the city prefix.
                locality
                    .map(|l| l.pattern.replace(s, "").to_string())
                    .unwrap_or_else(|| s.to_string())
                    .trim_start_matches(['市', '町', '村'])
                    .trim()
                    .to_string()
            } else {
                s.to_string()
            }
        })
        .unwrap_or_default();

    Location {
        venue,
        city: city.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Category and price
// ---------------------------------------------------------------------------

const CATEGORY_RULES: &[(&str, &[&str])] = &[
    ("festival", &["festival", "matsuri", "祭", "まつり", "フェス"]),
    ("fireworks", &["fireworks", "hanabi", "花火"]),
    ("market", &["market", "marche", "flea", "マルシェ", "朝市", "市場", "フリマ"]),
    ("music", &["concert", "live", "music", "jazz", "ライブ", "コンサート", "音楽"]),
    ("food", &["food", "gourmet", "sake", "ramen", "wanko", "グルメ", "酒", "食"]),
    ("art", &["art", "exhibition", "gallery", "展", "美術", "アート"]),
    ("sports", &["marathon", "race", "sports", "ski", "マラソン", "スポーツ"]),
    ("seasonal", &["illumination", "snow", "sakura", "雪", "桜", "紅葉", "イルミネーション"]),
    ("community", &["workshop", "community", "seminar", "体験", "ワークショップ", "交流"]),
];

static CATEGORY_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    CATEGORY_RULES
        .iter()
        .map(|(category, keywords)| {
            let alternatives: Vec<String> = keywords
                .iter()
                .map(|k| {
                    if k.is_ascii() {
                        format!(r"\b{}\b", regex::escape(k))
                    } else {
                        regex::escape(k)
                    }
                })
                .collect();
            let pattern = Regex::new(&format!("(?i){}", alternatives.join("|"))).expect("valid regex");
            (*category, pattern)
        })
        .collect()
});

/// First matching keyword category, if any.
pub fn infer_category(text: &str) -> Option<&'static str> {
    let folded: String = text.chars().map(fold_width).collect();
    CATEGORY_PATTERNS
        .iter()
        .find(|(_, pattern)| pattern.is_match(&folded))
        .map(|(category, _)| *category)
}

static PRICE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[¥￥]\s*([0-9][0-9,]*)|([0-9][0-9,]*)\s*(?:円|yen\b|jpy\b)").expect("valid regex")
});

static FREE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bfree\b|無料").expect("valid regex"));

/// Price in yen from a currency-marked number; "free" words yield 0.
pub fn extract_price(text: &str) -> Option<u32> {
    let folded: String = text.chars().map(fold_width).collect();
    if let Some(caps) = PRICE_RE.captures(&folded) {
        let digits = caps.get(1).or_else(|| caps.get(2))?.as_str().replace(',', "");
        if let Ok(amount) = digits.parse() {
            return Some(amount);
        }
    }
    FREE_RE.is_match(&folded).then_some(0)
}

// ---------------------------------------------------------------------------
// EventDraft
// ---------------------------------------------------------------------------

/// Adapter-agnostic candidate event, before normalization.
#[derive(Debug, Clone, Default)]
pub struct EventDraft {
    pub title: String,
    pub description: String,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub location: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub url: Option<String>,
    pub organizer: Option<String>,
    pub price_text: Option<String>,
    pub category: Option<String>,
}

impl EventDraft {
    /// Finish normalization. Returns `None` when the title or start is missing.
    pub fn into_event(
        self,
        source_id: &str,
        source_url: &str,
        fallback_category: &str,
        confidence: f64,
    ) -> Option<NormalizedEvent> {
        let title = clean_text(&self.title);
        let starts_at = self.starts_at?;
        if title.is_empty() {
            return None;
        }
        let description = clean_text(&self.description);
        let location = extract_location(&clean_text(&self.location));
        let city = if location.city.is_empty() {
            find_locality(&format!("{title} {description}"))
                .map(str::to_string)
                .unwrap_or_default()
        } else {
            location.city
        };

        let category = self
            .category
            .filter(|c| !c.trim().is_empty())
            .map(|c| c.trim().to_lowercase())
            .or_else(|| infer_category(&format!("{title} {description}")).map(str::to_string))
            .unwrap_or_else(|| fallback_category.to_string());

        let price = self
            .price_text
            .as_deref()
            .and_then(extract_price)
            .or_else(|| extract_price(&description));

        let key = dedupe_key(&title, starts_at, &location.venue);
        let id = compute_hash(&format!("{source_id}|{key}"))[..16].to_string();

        Some(NormalizedEvent {
            id,
            title,
            description,
            starts_at,
            ends_at: self.ends_at,
            venue: location.venue,
            city,
            lat: self.lat,
            lon: self.lon,
            category,
            price,
            organizer: self.organizer.map(|o| clean_text(&o)).filter(|o| !o.is_empty()),
            event_url: self.url.filter(|u| !u.trim().is_empty()),
            source_url: source_url.to_string(),
            source_id: source_id.to_string(),
            dedupe_key: key,
            confidence: confidence.clamp(0.0, 1.0),
            validation_status: ValidationStatus::Unverified,
        })
    }
}
