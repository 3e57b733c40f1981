use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::TimeDelta;
use serde::Deserialize;

use gather_core::collect::{CollectionConfig, CollectionRequest};
use gather_core::job::SchedulerConfig;
use gather_core::rate_limiter::RateLimitConfig;
use gather_core::validation::EventValidator;
use gather_core::{BoundingBox, DedupConfig, ResilienceConfig, SourceDefinition, SourceRegistry};

const DEFAULT_AI_MODEL: &str = "gpt-4o-mini";

/// Geographic scope of accepted events.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegionConfig {
    pub bounds: BoundingBox,
    /// How many days ahead an event may start.
    pub horizon_days: i64,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            bounds: BoundingBox::default(),
            horizon_days: 365,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Permit sources on private or loopback addresses.
    pub allow_private_urls: bool,
    /// Request ceiling applied to each origin separately.
    pub per_domain: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub model: String,
    pub base_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_AI_MODEL.to_string(),
            base_url: None,
            timeout_secs: 120,
        }
    }
}

/// Contents of `gather.toml`. Every section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatherConfig {
    pub region: RegionConfig,
    pub collection: CollectionConfig,
    pub dedup: DedupConfig,
    pub scheduler: SchedulerConfig,
    pub resilience: ResilienceConfig,
    pub fetch: FetchConfig,
    pub ai: AiConfig,
    /// Request used by the built-in daily and weekly collection jobs.
    pub scheduled_collection: CollectionRequest,
    pub sources: Vec<SourceDefinition>,
}

impl GatherConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Load `path` when given, else `gather.toml` if present, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None if Path::new("gather.toml").exists() => Self::load(Path::new("gather.toml")),
            None => {
                tracing::warn!("No config file found, using defaults with no sources");
                Ok(Self::default())
            }
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if !self.region.bounds.is_well_formed() {
            bail!("region.bounds is not a valid latitude/longitude box");
        }
        if self.region.horizon_days <= 0 {
            bail!("region.horizon_days must be positive");
        }
        if !(0.0..=1.0).contains(&self.dedup.threshold) {
            bail!(
                "dedup.threshold must be within 0.0..=1.0, got {}",
                self.dedup.threshold
            );
        }
        if self.collection.max_concurrency == 0 {
            bail!("collection.max_concurrency must be at least 1");
        }
        if self.scheduler.max_concurrent_jobs == 0 {
            bail!("scheduler.max_concurrent_jobs must be at least 1");
        }
        let breaker = &self.resilience.circuit_breaker;
        if breaker.failure_threshold == 0 || breaker.success_threshold == 0 {
            bail!("circuit breaker thresholds must be at least 1");
        }
        self.scheduled_collection
            .validate()
            .context("scheduled_collection")?;
        Ok(())
    }

    pub fn registry(&self) -> Result<SourceRegistry> {
        SourceRegistry::from_definitions(self.sources.clone()).context("Invalid source definitions")
    }

    pub fn validator(&self) -> EventValidator {
        EventValidator {
            bounds: self.region.bounds,
            horizon: TimeDelta::days(self.region.horizon_days),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gather_core::{CollectionStage, SourceType};

    const SAMPLE: &str = r#"
[region]
horizon_days = 180

[region.bounds]
min_lat = 38.74
max_lat = 40.45
min_lon = 140.65
max_lon = 142.08

[collection]
max_concurrency = 8
region = "iwate"

[dedup]
threshold = 0.6

[scheduler]
cancel_stuck_jobs = true

[resilience.circuit_breaker]
failure_threshold = 3

[fetch.per_domain]
per_minute = 10

[scheduled_collection]
regions = ["morioka"]

[[sources]]
id = "morioka-city"
name = "Morioka City events"
url = "https://www.city.morioka.iwate.jp/event.rss"
type = "feed"
region = "morioka"
category = "festival"
stage = "primary"

[[sources]]
id = "iwate-calendar"
name = "Iwate tourism calendar"
url = "https://iwatetabi.jp/events.ics"
"#;

    #[test]
    fn test_parse_full_config() {
        let config = GatherConfig::parse(SAMPLE).unwrap();

        assert_eq!(config.region.horizon_days, 180);
        assert_eq!(config.collection.max_concurrency, 8);
        assert_eq!(config.collection.fetch_timeout_secs, 30);
        assert_eq!(config.dedup.threshold, 0.6);
        assert!(config.scheduler.cancel_stuck_jobs);
        assert_eq!(config.resilience.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.resilience.circuit_breaker.success_threshold, 2);
        assert_eq!(config.fetch.per_domain.per_minute, 10);
        assert_eq!(config.scheduled_collection.regions, vec!["morioka"]);
        assert_eq!(config.ai.model, DEFAULT_AI_MODEL);

        let registry = config.registry().unwrap();
        assert_eq!(registry.len(), 2);
        let city = registry.get_source("morioka-city").unwrap();
        assert_eq!(city.stage, CollectionStage::Primary);
        let calendar = registry.get_source("iwate-calendar").unwrap();
        assert_eq!(calendar.source_type, SourceType::Calendar);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = GatherConfig::parse("").unwrap();
        assert!(config.sources.is_empty());
        assert_eq!(config.region.bounds, BoundingBox::iwate());
        assert_eq!(config.dedup.threshold, DedupConfig::default().threshold);
    }

    #[test]
    fn test_rejects_bad_threshold() {
        let err = GatherConfig::parse("[dedup]\nthreshold = 1.5").unwrap_err();
        assert!(err.to_string().contains("dedup.threshold"));
    }

    #[test]
    fn test_rejects_inverted_bounds() {
        let raw = "[region.bounds]\nmin_lat = 41.0\nmax_lat = 39.0\nmin_lon = 140.0\nmax_lon = 142.0";
        assert!(GatherConfig::parse(raw).is_err());
    }

    #[test]
    fn test_rejects_invalid_scheduled_request() {
        let raw = "[scheduled_collection]\ntarget_event_count = 0";
        assert!(GatherConfig::parse(raw).is_err());
    }

    #[test]
    fn test_duplicate_source_ids_fail_registry() {
        let raw = r#"
[[sources]]
id = "a"
name = "A"
url = "https://a.example.jp/feed.xml"

[[sources]]
id = "a"
name = "A again"
url = "https://b.example.jp/feed.xml"
"#;
        let config = GatherConfig::parse(raw).unwrap();
        assert!(config.registry().is_err());
    }

    #[test]
    fn test_load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gather.toml");
        std::fs::write(&path, "[dedup]\nthreshold = \"high\"").unwrap();

        let err = GatherConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("gather.toml"));
    }

    #[test]
    fn test_validator_uses_region() {
        let config = GatherConfig::parse(SAMPLE).unwrap();
        let validator = config.validator();
        assert_eq!(validator.horizon, TimeDelta::days(180));
        assert!(validator.bounds.contains(39.70, 141.15));
    }
}
