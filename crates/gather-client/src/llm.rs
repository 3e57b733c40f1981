use std::time::Duration;

use gather_core::collect::FALLBACK_SOURCE_ID;
use gather_core::error::AppError;
use gather_core::models::NormalizedEvent;
use gather_core::normalize::{EventDraft, parse_datetime};
use gather_core::traits::{FallbackQuery, FallbackSearch};
use reqwest::Client;
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_SYSTEM_PROMPT: &str = "You are a local events researcher. List real, publicly announced events only. Respond ONLY with a JSON object of the form {\"events\": [...]}. Do not include explanations.";

/// Candidates from a language model are the least trusted input.
const FALLBACK_CONFIDENCE: f64 = 0.4;

/// OpenAI-compatible chat-completions client used as the last-resort event
/// search when no structured source produced anything.
///
/// Works with any OpenAI-compatible API, including:
/// - OpenAI directly (`https://api.openai.com/v1`)
/// - Gemini via compatibility layer (`https://generativelanguage.googleapis.com/v1beta/openai`)
#[derive(Clone)]
pub struct OpenAiEventSearch {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout_secs: u64,
    system_prompt: String,
}

impl OpenAiEventSearch {
    pub fn new(api_key: &str, model: &str) -> Result<Self, AppError> {
        Self::with_base_url(api_key, model, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: &str, model: &str, base_url: &str) -> Result<Self, AppError> {
        Self::build(api_key, model, base_url, DEFAULT_LLM_TIMEOUT)
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self, AppError> {
        Self::build(&self.api_key, &self.model, &self.base_url, timeout)
            .map(|s| s.with_system_prompt(self.system_prompt))
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    fn build(
        api_key: &str,
        model: &str,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout_secs: timeout.as_secs(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        })
    }

    fn build_request(&self, query: &FallbackQuery) -> ChatRequest {
        let categories = if query.categories.is_empty() {
            "any".to_string()
        } else {
            query.categories.join(", ")
        };
        let prompt = format!(
            "Find up to {limit} upcoming public events in the {region} region of Japan \
             between {from} and {to} (categories: {categories}).\n\
             Each event object must have: \"title\", \"start\" (ISO 8601), and when known \
             \"end\", \"venue\", \"city\", \"description\", \"url\", \"category\", \"price\" (yen).",
            limit = query.limit,
            region = query.region,
            from = query.from.format("%Y-%m-%d"),
            to = query.to.format("%Y-%m-%d"),
        );

        ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: self.system_prompt.clone(),
                },
                Message {
                    role: "user".to_string(),
                    content: prompt,
                },
            ],
            response_format: Some(ResponseFormat {
                format_type: "json_object".to_string(),
            }),
        }
    }
}

// ---- OpenAI API types ----

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

// ---- Candidate payload ----

#[derive(Deserialize)]
struct CandidateList {
    #[serde(default)]
    events: Vec<CandidateEvent>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct CandidateEvent {
    title: String,
    start: Option<String>,
    end: Option<String>,
    venue: Option<String>,
    city: Option<String>,
    description: Option<String>,
    url: Option<String>,
    category: Option<String>,
    price: Option<serde_json::Value>,
}

impl CandidateEvent {
    fn into_draft(self) -> EventDraft {
        let location = [self.venue, self.city]
            .into_iter()
            .flatten()
            .filter(|s| !s.trim().is_empty())
            .collect::<Vec<_>>()
            .join(", ");
        let price_text = match self.price {
            Some(serde_json::Value::Number(n)) if n.as_f64() == Some(0.0) => Some("free".into()),
            Some(serde_json::Value::Number(n)) => Some(format!("¥{n}")),
            Some(serde_json::Value::String(s)) => Some(s),
            _ => None,
        };

        EventDraft {
            title: self.title,
            description: self.description.unwrap_or_default(),
            starts_at: self.start.as_deref().and_then(parse_datetime),
            ends_at: self.end.as_deref().and_then(parse_datetime),
            location,
            url: self.url,
            price_text,
            category: self.category,
            ..Default::default()
        }
    }
}

/// Map the model's JSON answer through the normal normalization helpers.
fn parse_candidates(
    content: &str,
    query: &FallbackQuery,
    source_url: &str,
) -> Result<Vec<NormalizedEvent>, AppError> {
    let list: CandidateList = serde_json::from_str(content)
        .map_err(|e| AppError::parse(format!("LLM returned invalid JSON: {e}. Raw: {content}")))?;

    let fallback_category = query
        .categories
        .first()
        .map(String::as_str)
        .unwrap_or("general");

    let total = list.events.len();
    let events: Vec<NormalizedEvent> = list
        .events
        .into_iter()
        .filter_map(|c| {
            c.into_draft().into_event(
                FALLBACK_SOURCE_ID,
                source_url,
                fallback_category,
                FALLBACK_CONFIDENCE,
            )
        })
        .take(query.limit)
        .collect();

    if events.len() < total {
        tracing::debug!(
            total,
            kept = events.len(),
            "Dropped fallback candidates without a title, start, or over the limit"
        );
    }
    Ok(events)
}

impl FallbackSearch for OpenAiEventSearch {
    fn is_enabled(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    async fn search(&self, query: &FallbackQuery) -> Result<Vec<NormalizedEvent>, AppError> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = self.build_request(query);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(self.timeout_secs)
                } else if e.is_connect() {
                    AppError::NetworkError(format!("Connection failed: {e}"))
                } else {
                    AppError::HttpError(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            if status_code == 429 {
                return Err(AppError::RateLimitExceeded);
            }
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiError>(&body)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| format!("HTTP {status_code}: {body}"));

            return Err(AppError::LlmError {
                message,
                status_code,
                retryable: status_code >= 500,
            });
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to parse LLM response: {e}")))?;

        let content = chat_response
            .choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .ok_or_else(|| AppError::LlmError {
                message: "Empty response from LLM".into(),
                status_code: 200,
                retryable: false,
            })?;

        let events = parse_candidates(content, query, &self.base_url)?;
        tracing::info!(
            model = %self.model,
            region = %query.region,
            events = events.len(),
            "AI fallback search completed"
        );
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone, Utc};

    fn query() -> FallbackQuery {
        let from = Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap();
        FallbackQuery {
            region: "iwate".to_string(),
            categories: vec!["festival".to_string()],
            from,
            to: from + TimeDelta::days(60),
            limit: 2,
        }
    }

    #[test]
    fn test_request_mentions_query() {
        let search = OpenAiEventSearch::new("sk-test", "gpt-4o-mini").unwrap();
        let request = search.build_request(&query());
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["model"], "gpt-4o-mini");
        assert_eq!(json["response_format"]["type"], "json_object");
        let prompt = json["messages"][1]["content"].as_str().unwrap();
        assert!(prompt.contains("iwate"));
        assert!(prompt.contains("2025-07-01"));
        assert!(prompt.contains("2025-08-30"));
        assert!(prompt.contains("festival"));
    }

    #[test]
    fn test_parse_candidates_maps_through_normalization() {
        let content = r#"{"events":[
            {"title":"Morioka Sansa Odori","start":"2025-08-01T18:00:00+09:00",
             "venue":"Chuo-dori","city":"Morioka","price":0},
            {"title":"Undated rumour"},
            {"title":"Tono Matsuri","start":"2025-09-20","city":"Tono"},
            {"title":"Over the limit","start":"2025-09-21"}
        ]}"#;

        let events = parse_candidates(content, &query(), DEFAULT_BASE_URL).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.source_id == FALLBACK_SOURCE_ID));
        assert!(events.iter().all(|e| e.confidence == FALLBACK_CONFIDENCE));
        assert_eq!(events[0].venue, "Chuo-dori");
        assert_eq!(events[0].city, "Morioka");
        assert_eq!(events[0].price, Some(0));
        assert_eq!(events[1].city, "Tono");
    }

    #[test]
    fn test_parse_candidates_invalid_json() {
        let err = parse_candidates("Sorry, I cannot help", &query(), DEFAULT_BASE_URL).unwrap_err();
        assert!(matches!(err, AppError::ParseError(_)));
    }

    #[test]
    fn test_missing_events_key_is_empty() {
        let events = parse_candidates("{}", &query(), DEFAULT_BASE_URL).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_disabled_without_api_key() {
        assert!(!OpenAiEventSearch::new("", "gpt-4o-mini").unwrap().is_enabled());
        assert!(OpenAiEventSearch::new("sk-test", "gpt-4o-mini").unwrap().is_enabled());
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let search =
            OpenAiEventSearch::with_base_url("k", "m", "https://llm.example.com/v1/").unwrap();
        assert_eq!(search.base_url, "https://llm.example.com/v1");
    }
}
