use chrono::{DateTime, TimeDelta, Utc};

use crate::error::AppError;
use crate::geo::BoundingBox;
use crate::models::{NormalizedEvent, ValidationStatus};

/// Accept/reject rules applied to every normalized event before dedup.
#[derive(Debug, Clone)]
pub struct EventValidator {
    pub bounds: BoundingBox,
    /// How far into the future an event may start.
    pub horizon: TimeDelta,
}

impl Default for EventValidator {
    fn default() -> Self {
        Self {
            bounds: BoundingBox::default(),
            horizon: TimeDelta::days(365),
        }
    }
}

impl EventValidator {
    pub fn new(bounds: BoundingBox) -> Self {
        Self {
            bounds,
            ..Default::default()
        }
    }

    /// Check one event against `now`.
    ///
    /// An event starting in the past is still accepted while it is ongoing
    /// (`ends_at >= now`).
    pub fn check(&self, event: &NormalizedEvent, now: DateTime<Utc>) -> Result<(), AppError> {
        if event.title.trim().is_empty() {
            return Err(AppError::validation("missing title"));
        }

        if let Some(ends_at) = event.ends_at
            && ends_at < event.starts_at
        {
            return Err(AppError::validation(format!(
                "'{}' ends before it starts",
                event.title
            )));
        }

        let ongoing = event.ends_at.is_some_and(|end| end >= now);
        if event.starts_at < now && !ongoing {
            return Err(AppError::validation(format!(
                "'{}' is in the past",
                event.title
            )));
        }
        if event.starts_at > now + self.horizon {
            return Err(AppError::validation(format!(
                "'{}' starts beyond the collection horizon",
                event.title
            )));
        }

        match (event.lat, event.lon) {
            (Some(lat), Some(lon)) if !self.bounds.contains(lat, lon) => {
                Err(AppError::validation(format!(
                    "'{}' at ({lat}, {lon}) lies outside the region",
                    event.title
                )))
            }
            (Some(_), None) | (None, Some(_)) => Err(AppError::validation(format!(
                "'{}' has a partial coordinate pair",
                event.title
            ))),
            _ => Ok(()),
        }
    }

    /// Validate and tag the event, or return `None` when it is rejected.
    pub fn accept(&self, mut event: NormalizedEvent, now: DateTime<Utc>) -> Option<NormalizedEvent> {
        match self.check(&event, now) {
            Ok(()) => {
                event.validation_status = if event.has_coordinates() {
                    ValidationStatus::GeoVerified
                } else {
                    ValidationStatus::Validated
                };
                Some(event)
            }
            Err(e) => {
                tracing::debug!(event_id = %event.id, source_id = %event.source_id, reason = %e, "Event rejected");
                None
            }
        }
    }
}
