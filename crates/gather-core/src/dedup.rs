//! Fuzzy cross-source deduplication.
//!
//! Pairwise weighted similarity over title, date, location, geo-proximity and
//! category. Each group keeps the member with the best quality score. Passes
//! repeat until stable, so deduplicating an already deduplicated set is a no-op.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::geo::haversine_km;
use crate::models::{EnhancedEventInfo, NormalizedEvent};
use crate::normalize::string_similarity;

const TITLE_WEIGHT: f64 = 0.4;
const DATE_WEIGHT: f64 = 0.25;
const LOCATION_WEIGHT: f64 = 0.2;
const GEO_WEIGHT: f64 = 0.1;
const CATEGORY_WEIGHT: f64 = 0.05;

/// Beyond this distance geo-proximity contributes nothing.
const GEO_FALLOFF_KM: f64 = 5.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Pairs scoring at or above this join the same group.
    pub threshold: f64,
    /// Full geo-proximity credit below this distance.
    pub proximity_km: f64,
    /// Half-life of the freshness term in the quality score, in hours.
    pub freshness_half_life_hours: i64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            proximity_km: 0.5,
            freshness_half_life_hours: 24,
        }
    }
}

/// One set of events judged to be the same real-world event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateGroup {
    pub canonical_id: String,
    pub duplicate_ids: Vec<String>,
    /// Highest pairwise similarity that formed the group.
    pub similarity: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConfidenceHistogram {
    /// confidence >= 0.9
    pub high: usize,
    /// 0.7 <= confidence < 0.9
    pub medium: usize,
    /// 0.5 <= confidence < 0.7
    pub low: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DedupStatistics {
    pub input_count: usize,
    pub output_count: usize,
    pub duplicates_removed: usize,
    pub group_count: usize,
    pub confidence: ConfidenceHistogram,
}

#[derive(Debug, Clone, Serialize)]
pub struct DedupResult {
    pub events: Vec<EnhancedEventInfo>,
    pub groups: Vec<DuplicateGroup>,
    pub statistics: DedupStatistics,
}

#[derive(Debug, Clone, Default)]
pub struct DeduplicationEngine {
    config: DedupConfig,
}

impl DeduplicationEngine {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Weighted similarity in [0, 1], normalized by the weights that apply to
    /// this pair. Symmetric in its arguments.
    pub fn similarity(&self, a: &NormalizedEvent, b: &NormalizedEvent) -> f64 {
        let distance = match (a.lat, a.lon, b.lat, b.lon) {
            (Some(lat_a), Some(lon_a), Some(lat_b), Some(lon_b)) => {
                Some(haversine_km(lat_a, lon_a, lat_b, lon_b))
            }
            _ => None,
        };
        // Both located and beyond the falloff: different places, never the same event.
        if distance.is_some_and(|d| d >= GEO_FALLOFF_KM) {
            return 0.0;
        }

        let mut score = 0.0;
        let mut weight = 0.0;

        if !a.title.trim().is_empty() && !b.title.trim().is_empty() {
            score += TITLE_WEIGHT * string_similarity(&a.title, &b.title);
            weight += TITLE_WEIGHT;
        }

        let same_date = a.starts_at.format("%Y-%m-%d").to_string()
            == b.starts_at.format("%Y-%m-%d").to_string();
        score += DATE_WEIGHT * if same_date { 1.0 } else { 0.0 };
        weight += DATE_WEIGHT;

        let (loc_a, loc_b) = (a.location_name(), b.location_name());
        if !loc_a.trim().is_empty() && !loc_b.trim().is_empty() {
            score += LOCATION_WEIGHT * string_similarity(loc_a, loc_b);
            weight += LOCATION_WEIGHT;
        }

        if let Some(distance) = distance {
            score += GEO_WEIGHT * self.proximity(distance);
            weight += GEO_WEIGHT;
        }

        if !a.category.is_empty() && !b.category.is_empty() {
            let same = a.category.eq_ignore_ascii_case(&b.category);
            score += CATEGORY_WEIGHT * if same { 1.0 } else { 0.0 };
            weight += CATEGORY_WEIGHT;
        }

        if weight == 0.0 { 0.0 } else { score / weight }
    }

    fn proximity(&self, distance_km: f64) -> f64 {
        if distance_km < self.config.proximity_km {
            1.0
        } else if distance_km >= GEO_FALLOFF_KM {
            0.0
        } else {
            1.0 - (distance_km - self.config.proximity_km)
                / (GEO_FALLOFF_KM - self.config.proximity_km)
        }
    }

    /// Quality score used to elect the canonical member of a group.
    pub fn quality_score(&self, info: &EnhancedEventInfo, now: DateTime<Utc>) -> f64 {
        let description = (info.event.description.chars().count() as f64 / 200.0).min(1.0);
        let official_url = if info.event.event_url.is_some() { 1.0 } else { 0.0 };
        let freshness = self.freshness_decay(now - info.last_updated);

        info.source_reliability * 0.3
            + description * 0.2
            + official_url * 0.15
            + freshness * 0.15
            + info.stage.weight() * 0.1
            + info.event.validation_status.verification_bonus() * 0.1
    }

    fn freshness_decay(&self, age: TimeDelta) -> f64 {
        let half_life = TimeDelta::hours(self.config.freshness_half_life_hours.max(1));
        let age_secs = age.num_seconds().max(0) as f64;
        0.5_f64.powf(age_secs / half_life.num_seconds() as f64)
    }

    /// Group duplicates and keep one canonical event per group.
    pub fn deduplicate(&self, events: Vec<EnhancedEventInfo>, now: DateTime<Utc>) -> DedupResult {
        let input_count = events.len();
        let mut current = events;
        let mut groups = Vec::new();

        loop {
            let (next, merged) = self.single_pass(current, now);
            current = next;
            if merged.is_empty() {
                break;
            }
            groups.extend(merged);
        }

        let mut confidence = ConfidenceHistogram::default();
        for info in &current {
            match info.event.confidence {
                c if c >= 0.9 => confidence.high += 1,
                c if c >= 0.7 => confidence.medium += 1,
                c if c >= 0.5 => confidence.low += 1,
                _ => {}
            }
        }

        let statistics = DedupStatistics {
            input_count,
            output_count: current.len(),
            duplicates_removed: input_count - current.len(),
            group_count: groups.len(),
            confidence,
        };

        tracing::debug!(
            input = statistics.input_count,
            output = statistics.output_count,
            groups = statistics.group_count,
            "Deduplication complete"
        );

        DedupResult {
            events: current,
            groups,
            statistics,
        }
    }

    fn single_pass(
        &self,
        events: Vec<EnhancedEventInfo>,
        now: DateTime<Utc>,
    ) -> (Vec<EnhancedEventInfo>, Vec<DuplicateGroup>) {
        let n = events.len();
        let mut processed = vec![false; n];
        let mut members: Vec<(Vec<usize>, f64)> = Vec::new();

        for i in 0..n {
            if processed[i] {
                continue;
            }
            processed[i] = true;
            let mut group = vec![i];
            let mut best = 0.0_f64;
            for j in (i + 1)..n {
                if processed[j] {
                    continue;
                }
                let sim = self.similarity(&events[i].event, &events[j].event);
                if sim >= self.config.threshold {
                    processed[j] = true;
                    group.push(j);
                    best = best.max(sim);
                }
            }
            members.push((group, best));
        }

        let mut slots: Vec<Option<EnhancedEventInfo>> = events.into_iter().map(Some).collect();
        let mut output = Vec::with_capacity(members.len());
        let mut groups = Vec::new();

        for (group, similarity) in members {
            let canonical_idx = group
                .iter()
                .copied()
                .fold(None::<(usize, f64)>, |best, idx| {
                    let score = slots[idx]
                        .as_ref()
                        .map(|e| self.quality_score(e, now))
                        .unwrap_or(f64::MIN);
                    match best {
                        Some((_, best_score)) if best_score >= score => best,
                        _ => Some((idx, score)),
                    }
                })
                .map(|(idx, _)| idx)
                .unwrap_or(group[0]);

            let Some(mut canonical) = slots[canonical_idx].take() else {
                continue;
            };

            if group.len() > 1 {
                let mut duplicate_ids = Vec::with_capacity(group.len() - 1);
                for &idx in group.iter().filter(|&&idx| idx != canonical_idx) {
                    if let Some(dup) = slots[idx].take() {
                        canonical.duplicate_score += dup.duplicate_score + 1;
                        duplicate_ids.push(dup.event.id);
                    }
                }
                groups.push(DuplicateGroup {
                    canonical_id: canonical.event.id.clone(),
                    duplicate_ids,
                    similarity,
                });
            }
            output.push(canonical);
        }

        (output, groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CollectionStage, ValidationStatus};
    use crate::testutil::make_test_event;

    fn info(event: NormalizedEvent, reliability: f64, now: DateTime<Utc>) -> EnhancedEventInfo {
        EnhancedEventInfo::new(event, CollectionStage::Secondary, reliability, now)
    }

    #[test]
    fn test_exact_duplicate_collapses() {
        let now = Utc::now();
        let start = now + TimeDelta::days(7);
        let a = make_test_event("feed", "Sansa Dance Festival", start);
        let mut b = a.clone();
        b.id = "other".into();
        b.source_id = "calendar".into();

        let engine = DeduplicationEngine::default();
        let result = engine.deduplicate(vec![info(a, 0.9, now), info(b, 0.5, now)], now);

        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].duplicate_score, 1);
        assert_eq!(result.events[0].event.source_id, "feed");
        assert_eq!(result.statistics.duplicates_removed, 1);
        assert_eq!(result.statistics.group_count, 1);
        assert_eq!(result.groups[0].duplicate_ids, vec!["other".to_string()]);
    }

    #[test]
    fn test_near_duplicate_titles_merge() {
        let now = Utc::now();
        let start = now + TimeDelta::days(7);
        let a = make_test_event("a", "Sansa Odori Matsuri", start);
        let mut b = make_test_event("b", "Sansa-Odori Festival", start);
        b.description = "A much longer description with the full parade schedule".into();

        let engine = DeduplicationEngine::default();
        assert!(engine.similarity(&a, &b) >= 0.5);

        let result = engine.deduplicate(vec![info(a, 0.7, now), info(b, 0.7, now)], now);
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].event.source_id, "b");
    }

    #[test]
    fn test_distinct_events_stay_apart() {
        let now = Utc::now();
        let mut a = make_test_event("a", "Morioka Autumn Festival", now + TimeDelta::days(7));
        a.venue = "Iwate Park".into();
        let mut b = make_test_event("b", "Kamaishi Fish Market", now + TimeDelta::days(9));
        b.venue = "Kamaishi Port".into();
        b.city = "Kamaishi".into();
        b.category = "market".into();
        b.lat = Some(39.27);
        b.lon = Some(141.88);

        let engine = DeduplicationEngine::default();
        assert!(engine.similarity(&a, &b) < 0.5);

        let result = engine.deduplicate(vec![info(a, 0.8, now), info(b, 0.8, now)], now);
        assert_eq!(result.events.len(), 2);
        assert!(result.groups.is_empty());
        assert!(result.events.iter().all(|e| e.duplicate_score == 0));
    }

    #[test]
    fn test_same_day_events_in_different_towns_stay_apart() {
        let now = Utc::now();
        let start = now + TimeDelta::days(7);
        let mut a = make_test_event("a", "Morioka Jazz Night", start);
        a.venue = "Civic Hall".into();
        let mut b = make_test_event("b", "Kitakami Rock Night", start);
        b.venue = "Sakura Hall".into();
        b.city = "Kitakami".into();
        b.lat = Some(39.29);
        b.lon = Some(141.11);

        let engine = DeduplicationEngine::default();
        assert_eq!(engine.similarity(&a, &b), 0.0);

        let result = engine.deduplicate(vec![info(a, 0.8, now), info(b, 0.8, now)], now);
        assert_eq!(result.events.len(), 2);
        assert!(result.groups.is_empty());
    }

    #[test]
    fn test_same_day_events_without_coordinates_still_scored() {
        let now = Utc::now();
        let start = now + TimeDelta::days(7);
        let mut a = make_test_event("a", "Sansa Odori", start);
        let mut b = make_test_event("b", "Sansa Odori", start);
        b.lat = None;
        b.lon = None;
        a.venue = "Chuo-dori".into();
        b.venue = "Chuo-dori".into();

        let engine = DeduplicationEngine::default();
        assert!(engine.similarity(&a, &b) > 0.9);
    }

    #[test]
    fn test_similarity_is_symmetric() {
        let now = Utc::now();
        let a = make_test_event("a", "Hanamaki Matsuri", now + TimeDelta::days(3));
        let mut b = make_test_event("b", "Hanamaki Festival Parade", now + TimeDelta::days(3));
        b.lat = Some(39.71);
        b.lon = Some(141.16);
        b.venue = "Hanamaki Station".into();

        let engine = DeduplicationEngine::default();
        assert_eq!(engine.similarity(&a, &b), engine.similarity(&b, &a));
    }

    #[test]
    fn test_dedup_is_idempotent() {
        let now = Utc::now();
        let start = now + TimeDelta::days(5);
        let events = vec![
            info(make_test_event("a", "Sansa Odori Matsuri", start), 0.9, now),
            info(make_test_event("b", "Sansa-Odori Festival", start), 0.6, now),
            info(make_test_event("c", "Sansa Odori", start), 0.5, now),
            info(
                make_test_event("d", "Jazz Night", start + TimeDelta::days(3)),
                0.8,
                now,
            ),
        ];

        let engine = DeduplicationEngine::default();
        let first = engine.deduplicate(events, now);
        let second = engine.deduplicate(first.events.clone(), now);

        assert_eq!(first.events, second.events);
        assert!(second.groups.is_empty());
        assert_eq!(second.statistics.duplicates_removed, 0);
    }

    #[test]
    fn test_duplicate_score_accumulates_group_size() {
        let now = Utc::now();
        let start = now + TimeDelta::days(5);
        let events = (0..3)
            .map(|i| {
                let mut e = make_test_event("s", "Chagu Chagu Umakko", start);
                e.id = format!("e{i}");
                info(e, 0.8, now)
            })
            .collect();

        let result = DeduplicationEngine::default().deduplicate(events, now);
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].duplicate_score, 2);
    }

    #[test]
    fn test_quality_score_prefers_verified_official_recent() {
        let now = Utc::now();
        let engine = DeduplicationEngine::default();
        let base = make_test_event("a", "Event", now + TimeDelta::days(1));

        let mut strong = info(base.clone(), 0.9, now);
        strong.event.event_url = Some("https://example.jp/event".into());
        strong.event.validation_status = ValidationStatus::GeoVerified;

        let weak = info(base, 0.9, now - TimeDelta::days(3));

        assert!(engine.quality_score(&strong, now) > engine.quality_score(&weak, now));
    }

    #[test]
    fn test_freshness_decay_half_life() {
        let engine = DeduplicationEngine::default();
        assert!((engine.freshness_decay(TimeDelta::zero()) - 1.0).abs() < 1e-9);
        assert!((engine.freshness_decay(TimeDelta::hours(24)) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_histogram() {
        let now = Utc::now();
        let fixtures = [
            ("Sansa Dance", "Chuo-dori", "festival", 0.95),
            ("Kamaishi Fish Market", "Kamaishi Port", "market", 0.75),
            ("Hanamaki Onsen Night", "Dai Onsen", "seasonal", 0.55),
            ("Tono Folk Tales", "Denshoen", "community", 0.3),
        ];
        let events = fixtures
            .into_iter()
            .enumerate()
            .map(|(i, (title, venue, category, conf))| {
                let mut e = make_test_event("s", title, now + TimeDelta::days(i as i64 * 10 + 1));
                e.venue = venue.into();
                e.category = category.into();
                e.confidence = conf;
                e.lat = None;
                e.lon = None;
                info(e, 0.5, now)
            })
            .collect();

        let result = DeduplicationEngine::default().deduplicate(events, now);
        let hist = &result.statistics.confidence;
        assert_eq!(result.events.len(), 4);
        assert_eq!((hist.high, hist.medium, hist.low), (1, 1, 1));
    }
}
