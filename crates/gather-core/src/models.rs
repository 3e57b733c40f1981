use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;
use uuid::Uuid;

/// Shape of an external source; also selects the adapter that handles it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceType {
    Feed,
    Calendar,
    StructuredPage,
    RestEndpoint,
}

impl SourceType {
    pub const ALL: [SourceType; 4] = [
        SourceType::Feed,
        SourceType::Calendar,
        SourceType::StructuredPage,
        SourceType::RestEndpoint,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Feed => "feed",
            SourceType::Calendar => "calendar",
            SourceType::StructuredPage => "structured-page",
            SourceType::RestEndpoint => "rest-endpoint",
        }
    }

    /// Map a declared fetch strategy hint ("rss", "ical", "scrape", "api", ...).
    pub fn from_strategy(strategy: &str) -> Option<SourceType> {
        match strategy.trim().to_lowercase().as_str() {
            "rss" | "atom" | "feed" => Some(SourceType::Feed),
            "ical" | "ics" | "calendar" => Some(SourceType::Calendar),
            "scrape" | "html" | "page" | "structured-page" => Some(SourceType::StructuredPage),
            "api" | "rest" | "json" | "rest-endpoint" => Some(SourceType::RestEndpoint),
            _ => None,
        }
    }

    /// True if the URL's path suffix is characteristic of this source shape.
    pub fn handles_url(&self, url: &str) -> bool {
        let path = Url::parse(url)
            .map(|u| u.path().to_lowercase())
            .unwrap_or_else(|_| url.to_lowercase());
        match self {
            SourceType::Calendar => {
                path.ends_with(".ics") || path.ends_with(".ical") || path.ends_with("/ical")
            }
            SourceType::Feed => {
                path.ends_with(".rss")
                    || path.ends_with(".xml")
                    || path.ends_with(".atom")
                    || path.ends_with("/feed")
                    || path.ends_with("/rss")
            }
            SourceType::RestEndpoint => path.ends_with(".json") || path.contains("/api/"),
            SourceType::StructuredPage => {
                path.ends_with(".html")
                    || path.ends_with(".htm")
                    || path.ends_with(".php")
                    || path.ends_with('/')
            }
        }
    }

    /// Whether this variant can handle a source declared with the given
    /// type, fetch strategy and URL.
    pub fn can_handle(
        &self,
        declared: Option<SourceType>,
        strategy: Option<&str>,
        url: &str,
    ) -> bool {
        declared == Some(*self)
            || strategy.and_then(SourceType::from_strategy) == Some(*self)
            || self.handles_url(url)
    }

    /// Pick the variant for a source definition: declared type, then fetch
    /// strategy, then URL suffix, then structured page.
    pub fn resolve(declared: Option<SourceType>, strategy: Option<&str>, url: &str) -> Self {
        if let Some(declared) = declared {
            return declared;
        }
        if let Some(by_strategy) = strategy.and_then(SourceType::from_strategy) {
            return by_strategy;
        }
        [
            SourceType::Calendar,
            SourceType::Feed,
            SourceType::RestEndpoint,
        ]
        .into_iter()
        .find(|t| t.handles_url(url))
        .unwrap_or(SourceType::StructuredPage)
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "feed" => Ok(SourceType::Feed),
            "calendar" => Ok(SourceType::Calendar),
            "structured-page" => Ok(SourceType::StructuredPage),
            "rest-endpoint" => Ok(SourceType::RestEndpoint),
            _ => Err(format!("Unknown source type: {}", s)),
        }
    }
}

/// How often a source publishes new listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateFrequency {
    #[default]
    Daily,
    AlternateDays,
    Weekly,
    Monthly,
    Seasonal,
}

impl UpdateFrequency {
    /// Minimum time between two fetches of a source.
    pub fn interval(&self) -> TimeDelta {
        match self {
            UpdateFrequency::Daily => TimeDelta::days(1),
            UpdateFrequency::AlternateDays => TimeDelta::days(2),
            UpdateFrequency::Weekly => TimeDelta::days(7),
            UpdateFrequency::Monthly => TimeDelta::days(30),
            UpdateFrequency::Seasonal => TimeDelta::days(90),
        }
    }
}

/// Collection priority tier. Primary sources are stage-critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CollectionStage {
    Primary,
    #[default]
    Secondary,
    Supplemental,
    AiFallback,
}

impl CollectionStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionStage::Primary => "primary",
            CollectionStage::Secondary => "secondary",
            CollectionStage::Supplemental => "supplemental",
            CollectionStage::AiFallback => "ai-fallback",
        }
    }

    /// Weight used by the dedup quality score.
    pub fn weight(&self) -> f64 {
        match self {
            CollectionStage::Primary => 1.0,
            CollectionStage::Secondary => 0.7,
            CollectionStage::Supplemental => 0.4,
            CollectionStage::AiFallback => 0.2,
        }
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, CollectionStage::Primary)
    }
}

impl fmt::Display for CollectionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CollectionStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "primary" => Ok(CollectionStage::Primary),
            "secondary" => Ok(CollectionStage::Secondary),
            "supplemental" => Ok(CollectionStage::Supplemental),
            "ai-fallback" => Ok(CollectionStage::AiFallback),
            _ => Err(format!("Unknown collection stage: {}", s)),
        }
    }
}

/// User-supplied source definition, as found in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDefinition {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(rename = "type", default)]
    pub source_type: Option<SourceType>,
    #[serde(default)]
    pub fetch_strategy: Option<String>,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Static reliability; when absent a per-type baseline is used.
    #[serde(default)]
    pub reliability: Option<f64>,
    #[serde(default)]
    pub update_frequency: UpdateFrequency,
    #[serde(default)]
    pub stage: CollectionStage,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_category() -> String {
    "general".to_string()
}

fn default_region() -> String {
    "all".to_string()
}

fn default_enabled() -> bool {
    true
}

impl SourceDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            url: url.into(),
            source_type: None,
            fetch_strategy: None,
            category: default_category(),
            region: default_region(),
            reliability: None,
            update_frequency: UpdateFrequency::default(),
            stage: CollectionStage::default(),
            enabled: true,
        }
    }

    pub fn with_type(mut self, source_type: SourceType) -> Self {
        self.source_type = Some(source_type);
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_stage(mut self, stage: CollectionStage) -> Self {
        self.stage = stage;
        self
    }

    pub fn with_reliability(mut self, reliability: f64) -> Self {
        self.reliability = Some(reliability);
        self
    }
}

/// One entry of a source's append-only fetch history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRecord {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub items_found: usize,
    pub processing_time_ms: u64,
}

/// A registered source with its fetch metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(rename = "type")]
    pub source_type: SourceType,
    pub fetch_strategy: Option<String>,
    pub category: String,
    pub region: String,
    pub reliability: f64,
    pub update_frequency: UpdateFrequency,
    pub stage: CollectionStage,
    pub enabled: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_fingerprint: Option<String>,
    pub fetch_history: Vec<FetchRecord>,
}

impl Source {
    /// True when `update_frequency` has not elapsed since the last check.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.last_checked
            .is_some_and(|checked| now - checked < self.update_frequency.interval())
    }

    pub fn matches_region(&self, region: &str) -> bool {
        region == "all" || self.region == "all" || self.region.eq_ignore_ascii_case(region)
    }
}

/// One fetch's payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEventData {
    pub source_id: String,
    pub content: String,
    pub extracted_at: DateTime<Utc>,
    /// SHA-256 of `content`
    pub fingerprint: String,
    pub source_url: String,
    pub content_type: Option<String>,
}

impl RawEventData {
    pub fn new(
        source_id: impl Into<String>,
        source_url: impl Into<String>,
        content: impl Into<String>,
        content_type: Option<String>,
    ) -> Self {
        let content = content.into();
        Self {
            source_id: source_id.into(),
            fingerprint: compute_hash(&content),
            content,
            extracted_at: Utc::now(),
            source_url: source_url.into(),
            content_type,
        }
    }

    /// Snapshot file extension: html, ics, xml or json.
    pub fn snapshot_extension(&self) -> &'static str {
        let ct = self.content_type.as_deref().unwrap_or("").to_lowercase();
        if ct.contains("calendar") {
            "ics"
        } else if ct.contains("json") {
            "json"
        } else if ct.contains("xml") || ct.contains("rss") || ct.contains("atom") {
            "xml"
        } else if ct.contains("html") {
            "html"
        } else {
            let trimmed = self.content.trim_start_matches('\u{feff}').trim_start();
            if trimmed.starts_with("BEGIN:VCALENDAR") {
                "ics"
            } else if trimmed.starts_with('{') || trimmed.starts_with('[') {
                "json"
            } else if trimmed.starts_with("<?xml")
                || trimmed.starts_with("<rss")
                || trimmed.starts_with("<feed")
            {
                "xml"
            } else {
                "html"
            }
        }
    }
}

/// Validation state carried by a normalized event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    #[default]
    Unverified,
    Validated,
    /// Validated and its coordinates lie inside the region bounds.
    GeoVerified,
    Rejected,
}

impl ValidationStatus {
    /// Bonus used by the dedup quality score.
    pub fn verification_bonus(&self) -> f64 {
        match self {
            ValidationStatus::GeoVerified => 1.0,
            ValidationStatus::Validated => 0.5,
            ValidationStatus::Unverified | ValidationStatus::Rejected => 0.0,
        }
    }
}

/// Canonical intermediate event shape produced by every adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub id: String,
    pub title: String,
    pub description: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub venue: String,
    pub city: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub category: String,
    /// Price in yen; 0 means free.
    pub price: Option<u32>,
    pub organizer: Option<String>,
    /// The event's own page, when distinct from the listing.
    pub event_url: Option<String>,
    pub source_url: String,
    pub source_id: String,
    pub dedupe_key: String,
    pub confidence: f64,
    pub validation_status: ValidationStatus,
}

impl NormalizedEvent {
    pub fn has_coordinates(&self) -> bool {
        self.lat.is_some() && self.lon.is_some()
    }

    /// Venue, falling back to the city, used for location matching.
    pub fn location_name(&self) -> &str {
        if self.venue.trim().is_empty() {
            &self.city
        } else {
            &self.venue
        }
    }
}

/// Age bucket of a collected event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    Fresh,
    Recent,
    Stale,
}

impl Freshness {
    pub fn from_age(age: TimeDelta) -> Self {
        if age < TimeDelta::hours(24) {
            Freshness::Fresh
        } else if age < TimeDelta::days(7) {
            Freshness::Recent
        } else {
            Freshness::Stale
        }
    }
}

/// A normalized event with collection metadata; the unit returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancedEventInfo {
    #[serde(flatten)]
    pub event: NormalizedEvent,
    pub stage: CollectionStage,
    pub source_reliability: f64,
    pub last_updated: DateTime<Utc>,
    pub freshness: Freshness,
    /// Number of duplicates merged into this event.
    pub duplicate_score: u32,
    pub has_geolocation: bool,
}

impl EnhancedEventInfo {
    pub fn new(
        event: NormalizedEvent,
        stage: CollectionStage,
        source_reliability: f64,
        now: DateTime<Utc>,
    ) -> Self {
        let has_geolocation = event.has_coordinates();
        Self {
            event,
            stage,
            source_reliability,
            last_updated: now,
            freshness: Freshness::Fresh,
            duplicate_score: 0,
            has_geolocation,
        }
    }

    /// Recompute the freshness tag relative to `now`.
    pub fn refresh(&mut self, now: DateTime<Utc>) {
        self.freshness = Freshness::from_age(now - self.last_updated);
    }
}

/// Result of probing a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub confidence: f64,
}

impl ValidationResult {
    pub fn valid(confidence: f64) -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            confidence,
        }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            errors: vec![error.into()],
            warnings: Vec::new(),
            confidence: 0.0,
        }
    }
}

/// What one adapter fetch produced. Applied to the registry by the
/// orchestrator, never by the adapter.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub raw: Vec<RawEventData>,
    pub status: u16,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub not_modified: bool,
}

impl FetchOutcome {
    pub fn not_modified(etag: Option<String>, last_modified: Option<String>) -> Self {
        Self {
            raw: Vec::new(),
            status: 304,
            etag,
            last_modified,
            not_modified: true,
        }
    }
}

/// Outcome of one source-collection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Success,
    Fail,
    /// The attempt degraded: the payload only partly normalized, or the
    /// recovery policy chose fallback data.
    Partial,
    NoNewData,
    Skipped,
    CacheHit,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::Success => "success",
            SourceStatus::Fail => "fail",
            SourceStatus::Partial => "partial",
            SourceStatus::NoNewData => "no_new_data",
            SourceStatus::Skipped => "skipped",
            SourceStatus::CacheHit => "cache_hit",
        }
    }
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Audit record of one source attempt, written to `runlogs/<date>/<run_id>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub run_id: Uuid,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: SourceStatus,
    pub fetched: usize,
    pub parsed: usize,
    pub upserted: usize,
    pub error: Option<String>,
    pub snapshot_paths: Vec<String>,
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
