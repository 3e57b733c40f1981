//! Source registry: definitions plus per-source fetch metadata.
//!
//! Sources are never removed, only deactivated. Fetch history and cache tokens
//! are written through [`SourceRegistry::record_fetch`], which the collection
//! service calls once per batch.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use url::Url;

use crate::error::AppError;
use crate::models::{FetchRecord, Source, SourceDefinition, SourceType, ValidationResult};
use crate::traits::SourceAdapter;

/// Baseline reliability when a definition carries no static value.
fn baseline_reliability(source_type: SourceType) -> f64 {
    match source_type {
        SourceType::Calendar => 0.9,
        SourceType::Feed => 0.85,
        SourceType::RestEndpoint => 0.85,
        SourceType::StructuredPage => 0.6,
    }
}

/// Reliability adjustment from the URL's host.
fn domain_adjustment(url: &str) -> f64 {
    let Some(host) = Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
    else {
        return 0.0;
    };

    if host.ends_with(".go.jp") || host.ends_with(".lg.jp") || host.ends_with(".gov") {
        0.1
    } else if host.ends_with(".or.jp") || host.ends_with(".org") || host.ends_with(".ac.jp") {
        0.05
    } else if ["blog", "ameblo", "fc2", "hatena", "note.com"]
        .iter()
        .any(|b| host.contains(b))
    {
        -0.1
    } else {
        0.0
    }
}

/// Per-source outcome of [`SourceRegistry::validate_all`].
#[derive(Debug, Clone, Serialize)]
pub struct SourceValidation {
    pub source_id: String,
    pub result: ValidationResult,
}

/// Registry counts for reporting.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistryStatistics {
    pub total: usize,
    pub active: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_region: BTreeMap<String, usize>,
    pub mean_reliability: f64,
}

#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    sources: Vec<Source>,
    index: HashMap<String, usize>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from definitions, failing on the first duplicate.
    pub fn from_definitions(
        defs: impl IntoIterator<Item = SourceDefinition>,
    ) -> Result<Self, AppError> {
        let mut registry = Self::new();
        for def in defs {
            registry.add_source(def)?;
        }
        Ok(registry)
    }

    /// Register a source. Rejects duplicate ids and duplicate URLs.
    pub fn add_source(&mut self, def: SourceDefinition) -> Result<&Source, AppError> {
        if def.id.trim().is_empty() {
            return Err(AppError::validation("source id must not be empty"));
        }
        Url::parse(&def.url)
            .map_err(|e| AppError::validation(format!("source {}: invalid url: {e}", def.id)))?;

        if self.index.contains_key(&def.id) {
            return Err(AppError::DuplicateSource(def.id));
        }
        if self.sources.iter().any(|s| s.url == def.url) {
            return Err(AppError::DuplicateSource(def.url));
        }

        let source_type =
            SourceType::resolve(def.source_type, def.fetch_strategy.as_deref(), &def.url);
        let reliability = (def
            .reliability
            .unwrap_or_else(|| baseline_reliability(source_type))
            + domain_adjustment(&def.url))
        .clamp(0.0, 1.0);

        let source = Source {
            id: def.id.clone(),
            name: def.name,
            url: def.url,
            source_type,
            fetch_strategy: def.fetch_strategy,
            category: def.category,
            region: def.region,
            reliability,
            update_frequency: def.update_frequency,
            stage: def.stage,
            enabled: def.enabled,
            etag: None,
            last_modified: None,
            last_checked: None,
            last_fingerprint: None,
            fetch_history: Vec::new(),
        };

        tracing::debug!(
            source_id = %source.id,
            source_type = %source.source_type,
            reliability = source.reliability,
            "Registered source"
        );

        self.index.insert(def.id, self.sources.len());
        self.sources.push(source);
        Ok(&self.sources[self.sources.len() - 1])
    }

    pub fn get_source(&self, id: &str) -> Option<&Source> {
        self.index.get(id).map(|&i| &self.sources[i])
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn list_by_type(&self, source_type: SourceType) -> Vec<&Source> {
        self.sources
            .iter()
            .filter(|s| s.source_type == source_type)
            .collect()
    }

    /// Sources serving `region`, including those registered for "all".
    pub fn list_by_region(&self, region: &str) -> Vec<&Source> {
        self.sources
            .iter()
            .filter(|s| s.matches_region(region))
            .collect()
    }

    pub fn list_by_category(&self, category: &str) -> Vec<&Source> {
        self.sources
            .iter()
            .filter(|s| s.category.eq_ignore_ascii_case(category))
            .collect()
    }

    /// Soft delete.
    pub fn deactivate(&mut self, id: &str) -> Result<(), AppError> {
        let source = self.get_mut(id)?;
        source.enabled = false;
        tracing::info!(source_id = %id, "Source deactivated");
        Ok(())
    }

    /// Probe every source through its adapter, concurrently.
    pub async fn validate_all<A: SourceAdapter>(&self, adapter: &A) -> Vec<SourceValidation> {
        let probes = self.sources.iter().map(|source| async move {
            let result = if adapter.can_handle(source) {
                adapter.validate(source).await
            } else {
                ValidationResult::invalid(format!(
                    "no adapter handles source type {}",
                    source.source_type
                ))
            };
            SourceValidation {
                source_id: source.id.clone(),
                result,
            }
        });
        join_all(probes).await
    }

    pub fn statistics(&self) -> RegistryStatistics {
        let mut stats = RegistryStatistics {
            total: self.sources.len(),
            ..Default::default()
        };
        for source in &self.sources {
            if source.enabled {
                stats.active += 1;
            }
            *stats
                .by_type
                .entry(source.source_type.as_str().to_string())
                .or_default() += 1;
            *stats.by_region.entry(source.region.clone()).or_default() += 1;
        }
        if !self.sources.is_empty() {
            stats.mean_reliability = self.sources.iter().map(|s| s.reliability).sum::<f64>()
                / self.sources.len() as f64;
        }
        stats
    }

    /// Apply one fetch attempt: append history and update cache tokens.
    ///
    /// `etag`/`last_modified` replace the stored values only when present;
    /// `fingerprint` likewise. Only successful attempts move `last_checked`,
    /// so a failing source is not treated as fresh.
    pub fn record_fetch(
        &mut self,
        id: &str,
        record: FetchRecord,
        etag: Option<String>,
        last_modified: Option<String>,
        fingerprint: Option<String>,
        checked_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let source = self.get_mut(id)?;
        if record.success {
            source.last_checked = Some(checked_at);
        }
        source.fetch_history.push(record);
        if etag.is_some() {
            source.etag = etag;
        }
        if last_modified.is_some() {
            source.last_modified = last_modified;
        }
        if fingerprint.is_some() {
            source.last_fingerprint = fingerprint;
        }
        Ok(())
    }

    /// Trim every source's fetch history to its newest `max_entries` records.
    /// Returns the number of records removed.
    pub fn prune_history(&mut self, max_entries: usize) -> usize {
        let mut removed = 0;
        for source in &mut self.sources {
            let excess = source.fetch_history.len().saturating_sub(max_entries);
            if excess > 0 {
                source.fetch_history.drain(..excess);
                removed += excess;
            }
        }
        removed
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut Source, AppError> {
        let i = *self
            .index
            .get(id)
            .ok_or_else(|| AppError::NotFound(format!("source {id}")))?;
        Ok(&mut self.sources[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CollectionStage;
    use crate::testutil::MockAdapter;

    fn def(id: &str, url: &str) -> SourceDefinition {
        SourceDefinition::new(id, id.to_uppercase(), url)
    }

    fn record(success: bool) -> FetchRecord {
        FetchRecord {
            timestamp: Utc::now(),
            success,
            status_code: Some(200),
            error: None,
            items_found: 3,
            processing_time_ms: 10,
        }
    }

    #[test]
    fn test_add_source_rejects_duplicate_id() {
        let mut registry = SourceRegistry::new();
        registry.add_source(def("a", "https://a.example.jp/feed")).unwrap();
        let err = registry
            .add_source(def("a", "https://b.example.jp/feed"))
            .unwrap_err();
        assert!(matches!(err, AppError::DuplicateSource(id) if id == "a"));
    }

    #[test]
    fn test_add_source_rejects_duplicate_url() {
        let mut registry = SourceRegistry::new();
        registry.add_source(def("a", "https://a.example.jp/feed")).unwrap();
        let err = registry
            .add_source(def("b", "https://a.example.jp/feed"))
            .unwrap_err();
        assert!(matches!(err, AppError::DuplicateSource(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_add_source_rejects_invalid_url() {
        let mut registry = SourceRegistry::new();
        assert!(registry.add_source(def("a", "not a url")).is_err());
    }

    #[test]
    fn test_add_source_resolves_type_and_reliability() {
        let mut registry = SourceRegistry::new();
        let source = registry
            .add_source(def("pref", "https://www.pref.iwate.lg.jp/events.ics"))
            .unwrap();
        assert_eq!(source.source_type, SourceType::Calendar);
        assert!((source.reliability - 1.0).abs() < 1e-9);

        let source = registry
            .add_source(def("blog", "https://someone.hatenablog.com/").with_reliability(0.5))
            .unwrap();
        assert_eq!(source.source_type, SourceType::StructuredPage);
        assert!((source.reliability - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_listing_filters() {
        let mut registry = SourceRegistry::new();
        registry
            .add_source(
                def("a", "https://a.example.jp/feed")
                    .with_region("morioka")
                    .with_category("festival"),
            )
            .unwrap();
        registry
            .add_source(def("b", "https://b.example.jp/events.ics").with_region("all"))
            .unwrap();
        registry
            .add_source(def("c", "https://c.example.jp/api/events").with_region("kamaishi"))
            .unwrap();

        assert_eq!(registry.list_by_type(SourceType::Feed).len(), 1);
        assert_eq!(registry.list_by_region("morioka").len(), 2);
        assert_eq!(registry.list_by_category("festival").len(), 1);
    }

    #[test]
    fn test_deactivate_is_soft() {
        let mut registry = SourceRegistry::new();
        registry.add_source(def("a", "https://a.example.jp/feed")).unwrap();
        registry.deactivate("a").unwrap();
        assert!(!registry.get_source("a").unwrap().enabled);
        assert_eq!(registry.len(), 1);
        assert!(matches!(
            registry.deactivate("missing"),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn test_statistics() {
        let mut registry = SourceRegistry::new();
        registry
            .add_source(def("a", "https://a.example.jp/feed").with_reliability(0.8))
            .unwrap();
        registry
            .add_source(
                def("b", "https://b.example.jp/feed.xml")
                    .with_reliability(0.6)
                    .with_stage(CollectionStage::Primary),
            )
            .unwrap();
        registry.deactivate("b").unwrap();

        let stats = registry.statistics();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.by_type.get("feed"), Some(&2));
        assert!((stats.mean_reliability - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_record_fetch_keeps_tokens_when_absent() {
        let mut registry = SourceRegistry::new();
        registry.add_source(def("a", "https://a.example.jp/feed")).unwrap();
        let now = Utc::now();

        registry
            .record_fetch("a", record(true), Some("\"v1\"".into()), None, Some("fp".into()), now)
            .unwrap();
        registry
            .record_fetch("a", record(false), None, None, None, now)
            .unwrap();

        let source = registry.get_source("a").unwrap();
        assert_eq!(source.etag.as_deref(), Some("\"v1\""));
        assert_eq!(source.last_fingerprint.as_deref(), Some("fp"));
        assert_eq!(source.fetch_history.len(), 2);
        assert!(source.fetch_history[0].success);
        assert!(!source.fetch_history[1].success);
        assert_eq!(source.last_checked, Some(now));
    }

    #[test]
    fn test_prune_history_keeps_newest() {
        let mut registry = SourceRegistry::new();
        registry.add_source(def("a", "https://a.example.jp/feed")).unwrap();
        let now = Utc::now();
        for i in 0..5 {
            let mut r = record(true);
            r.items_found = i;
            registry.record_fetch("a", r, None, None, None, now).unwrap();
        }

        assert_eq!(registry.prune_history(2), 3);
        let history = &registry.get_source("a").unwrap().fetch_history;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].items_found, 3);
        assert_eq!(history[1].items_found, 4);
    }

    #[tokio::test]
    async fn test_validate_all_reports_every_source() {
        let mut registry = SourceRegistry::new();
        registry.add_source(def("a", "https://a.example.jp/feed")).unwrap();
        registry
            .add_source(def("b", "https://b.example.jp/events.ics"))
            .unwrap();

        let adapter = MockAdapter::new().with_invalid("b");
        let results = registry.validate_all(&adapter).await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().any(|r| r.source_id == "a" && r.result.is_valid));
        assert!(results.iter().any(|r| r.source_id == "b" && !r.result.is_valid));
    }
}
