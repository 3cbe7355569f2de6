//! Optional content-moderation adapter.
//!
//! Queries an OpenAI-compatible moderations endpoint. When no moderator is
//! configured the supervisor treats all inputs as allowed.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use thiserror::Error;

/// Outcome of a moderation check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Block { reason: String },
}

#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("moderation endpoint error: HTTP {0}")]
    Upstream(u16),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("malformed moderation response: {0}")]
    Decode(String),
    #[error("moderation configuration error: {0}")]
    Config(String),
}

#[async_trait]
pub trait Moderator: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Verdict, ModerationError>;
}

#[derive(Deserialize)]
struct ModerationResponse {
    results: Vec<ModerationResult>,
}

#[derive(Deserialize)]
struct ModerationResult {
    flagged: bool,
    #[serde(default)]
    categories: serde_json::Map<String, serde_json::Value>,
}

/// Moderator backed by an OpenAI-compatible `/moderations` endpoint.
pub struct HttpModerator {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl HttpModerator {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, ModerationError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = api_key {
            let value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|_| ModerationError::Config("invalid API key format".into()))?;
            headers.insert(AUTHORIZATION, value);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            model: "omni-moderation-latest".into(),
        })
    }

    pub fn from_env() -> Result<Self, ModerationError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ModerationError::Config("OPENAI_API_KEY not set".into()))?;
        Self::new(
            "https://api.openai.com/v1/moderations",
            Some(&api_key),
            Duration::from_secs(15),
        )
    }
}

#[async_trait]
impl Moderator for HttpModerator {
    async fn classify(&self, text: &str) -> Result<Verdict, ModerationError> {
        let body = serde_json::json!({ "model": self.model, "input": text });
        let response = self.client.post(&self.endpoint).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ModerationError::Upstream(status.as_u16()));
        }

        let parsed: ModerationResponse = response
            .json()
            .await
            .map_err(|e| ModerationError::Decode(e.to_string()))?;

        let Some(result) = parsed.results.into_iter().next() else {
            return Err(ModerationError::Decode("empty results".into()));
        };

        if result.flagged {
            let reason = result
                .categories
                .iter()
                .filter(|(_, v)| v.as_bool().unwrap_or(false))
                .map(|(k, _)| k.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            let reason = if reason.is_empty() {
                "flagged by moderation".to_string()
            } else {
                reason
            };
            Ok(Verdict::Block { reason })
        } else {
            Ok(Verdict::Allow)
        }
    }
}
