use std::fmt;

use regex::Regex;
use serde::Serialize;

use crate::error::AppError;
use crate::models::CollectionStage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Low => "low",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::High => "high",
            ErrorSeverity::Critical => "critical",
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    RateLimit,
    Authentication,
    Timeout,
    MalformedResponse,
    Validation,
    Storage,
    ResourceExhaustion,
    CircuitOpen,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::MalformedResponse => "malformed_response",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Storage => "storage",
            ErrorCategory::ResourceExhaustion => "resource_exhaustion",
            ErrorCategory::CircuitOpen => "circuit_open",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the classifier proposes; the recovery policy makes the final call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestedAction {
    Retry,
    Fallback,
    Skip,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub retryable: bool,
    pub suggested: SuggestedAction,
}

impl Classification {
    const fn new(
        category: ErrorCategory,
        severity: ErrorSeverity,
        retryable: bool,
        suggested: SuggestedAction,
    ) -> Self {
        Self {
            category,
            severity,
            retryable,
            suggested,
        }
    }
}

const NETWORK: Classification = Classification::new(
    ErrorCategory::Network,
    ErrorSeverity::Medium,
    true,
    SuggestedAction::Retry,
);
const RATE_LIMIT: Classification = Classification::new(
    ErrorCategory::RateLimit,
    ErrorSeverity::Medium,
    true,
    SuggestedAction::Retry,
);
const AUTH: Classification = Classification::new(
    ErrorCategory::Authentication,
    ErrorSeverity::High,
    false,
    SuggestedAction::Fail,
);
const TIMEOUT: Classification = Classification::new(
    ErrorCategory::Timeout,
    ErrorSeverity::Medium,
    true,
    SuggestedAction::Retry,
);
const MALFORMED: Classification = Classification::new(
    ErrorCategory::MalformedResponse,
    ErrorSeverity::Low,
    false,
    SuggestedAction::Fallback,
);
const VALIDATION: Classification = Classification::new(
    ErrorCategory::Validation,
    ErrorSeverity::Low,
    false,
    SuggestedAction::Skip,
);
const STORAGE: Classification = Classification::new(
    ErrorCategory::Storage,
    ErrorSeverity::Low,
    false,
    SuggestedAction::Skip,
);
const RESOURCE: Classification = Classification::new(
    ErrorCategory::ResourceExhaustion,
    ErrorSeverity::Critical,
    false,
    SuggestedAction::Fail,
);
const CIRCUIT_OPEN: Classification = Classification::new(
    ErrorCategory::CircuitOpen,
    ErrorSeverity::Low,
    false,
    SuggestedAction::Skip,
);

/// Message patterns, checked in order after the typed rules.
const PATTERNS: &[(&str, Classification)] = &[
    (
        r"connection|connect\b|dns|network|reset by peer|refused|unreachable",
        NETWORK,
    ),
    (r"rate.?limit|too many requests|\b429\b|quota", RATE_LIMIT),
    (
        r"unauthori[sz]ed|forbidden|\b40[13]\b|api key|authenticat",
        AUTH,
    ),
    (r"timed? ?out|timeout|deadline", TIMEOUT),
    (
        r"parse|malformed|invalid json|unexpected (token|eof)|decode|syntax",
        MALFORMED,
    ),
    (r"validation|invalid|missing field|required", VALIDATION),
    (
        r"disk|storage|cache|permission denied|no such file|i/o",
        STORAGE,
    ),
    (
        r"out of memory|too many open files|resource|exhausted|capacity",
        RESOURCE,
    ),
];

/// Maps errors to {category, severity, retryable, suggested action}.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    patterns: Vec<(Regex, Classification)>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        let patterns = PATTERNS
            .iter()
            .filter_map(|(pattern, classification)| {
                Regex::new(&format!("(?i){pattern}"))
                    .ok()
                    .map(|re| (re, *classification))
            })
            .collect();
        Self { patterns }
    }
}

impl ErrorClassifier {
    pub fn classify(&self, error: &AppError, stage: Option<CollectionStage>) -> Classification {
        if let Some(typed) = Self::classify_typed(error) {
            return typed;
        }

        let message = error.to_string();
        if let Some((_, classification)) = self.patterns.iter().find(|(re, _)| re.is_match(&message))
        {
            return *classification;
        }

        // Unmatched: critical stages get one retry, everything else is skipped.
        if stage.is_some_and(|s| s.is_critical()) {
            Classification::new(
                ErrorCategory::Unknown,
                ErrorSeverity::High,
                true,
                SuggestedAction::Retry,
            )
        } else {
            Classification::new(
                ErrorCategory::Unknown,
                ErrorSeverity::Low,
                false,
                SuggestedAction::Skip,
            )
        }
    }

    fn classify_typed(error: &AppError) -> Option<Classification> {
        let classification = match error {
            e if e.is_rate_limit() => RATE_LIMIT,
            AppError::FetchError { status, .. } => match status {
                401 | 403 => AUTH,
                408 => TIMEOUT,
                s if *s >= 500 => NETWORK,
                _ => return None,
            },
            AppError::Timeout(_) | AppError::SchedulerTimeout { .. } => TIMEOUT,
            AppError::NetworkError(_) => NETWORK,
            AppError::ParseError(_) | AppError::SerializationError(_) => MALFORMED,
            AppError::ValidationError(_) => VALIDATION,
            AppError::StorageError(_) => STORAGE,
            AppError::CircuitOpen { .. } => CIRCUIT_OPEN,
            AppError::LlmError {
                status_code: 401 | 403,
                ..
            } => AUTH,
            _ => return None,
        };
        Some(classification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::recovery::{RecoveryAction, RecoveryContext, RecoveryPolicy};

    fn classify(error: AppError) -> Classification {
        ErrorClassifier::default().classify(&error, None)
    }

    #[test]
    fn test_typed_http_statuses() {
        let url = "https://example.jp".to_string();
        assert_eq!(
            classify(AppError::FetchError {
                status: 429,
                url: url.clone()
            })
            .category,
            ErrorCategory::RateLimit
        );
        assert_eq!(
            classify(AppError::FetchError {
                status: 403,
                url: url.clone()
            })
            .suggested,
            SuggestedAction::Fail
        );
        let server = classify(AppError::FetchError {
            status: 502,
            url: url.clone(),
        });
        assert_eq!(server.category, ErrorCategory::Network);
        assert!(server.retryable);
    }

    #[test]
    fn test_typed_before_message() {
        // The message mentions "connection" but the type says parse failure.
        let c = classify(AppError::ParseError("connection element missing".into()));
        assert_eq!(c.category, ErrorCategory::MalformedResponse);
    }

    #[test]
    fn test_message_patterns_in_order() {
        assert_eq!(
            classify(AppError::HttpError("dns lookup failed".into())).category,
            ErrorCategory::Network
        );
        assert_eq!(
            classify(AppError::Generic("Too Many Requests".into())).category,
            ErrorCategory::RateLimit
        );
        assert_eq!(
            classify(AppError::Generic("invalid api key".into())).category,
            ErrorCategory::Authentication
        );
        assert_eq!(
            classify(AppError::HttpError("operation timed out".into())).category,
            ErrorCategory::Timeout
        );
        assert_eq!(
            classify(AppError::Generic("too many open files".into())).severity,
            ErrorSeverity::Critical
        );
    }

    #[test]
    fn test_circuit_open_is_skipped() {
        let c = classify(AppError::CircuitOpen {
            name: "a".into(),
            retry_after_secs: 10,
        });
        assert_eq!(c.suggested, SuggestedAction::Skip);
    }

    #[test]
    fn test_unmatched_default_is_stage_aware() {
        let classifier = ErrorClassifier::default();
        let error = AppError::Generic("something odd".into());

        let critical = classifier.classify(&error, Some(CollectionStage::Primary));
        assert_eq!(critical.category, ErrorCategory::Unknown);
        assert_eq!(critical.suggested, SuggestedAction::Retry);

        let policy = RecoveryPolicy::default();
        let first = RecoveryContext::new("src", "fetch").with_stage(CollectionStage::Primary);
        assert!(matches!(
            policy.decide(&critical, &first),
            RecoveryAction::Retry {
                max_attempts: 1,
                ..
            }
        ));
        let second = first.clone().with_attempt(2);
        assert_eq!(policy.decide(&critical, &second), RecoveryAction::Skip);

        let other = classifier.classify(&error, Some(CollectionStage::Supplemental));
        assert_eq!(other.suggested, SuggestedAction::Skip);
        assert_eq!(
            classifier.classify(&error, None).suggested,
            SuggestedAction::Skip
        );
    }

    #[test]
    fn test_not_found_falls_through_to_default() {
        let c = classify(AppError::FetchError {
            status: 404,
            url: "https://example.jp/gone".into(),
        });
        assert_eq!(c.category, ErrorCategory::Unknown);
    }
}
