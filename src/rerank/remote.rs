//! Remote HTTP reranker backend.
//!
//! Splits score requests into bounded batches and issues up to
//! `max_inflight` of them concurrently; scores are reassembled in input
//! order before returning. One contract serves both the plain HTTP service
//! and the modal-style serverless endpoint (which only adds bearer auth).

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::debug;

use crate::cancel::CancelToken;

use super::{Reranker, RerankError};

/// Bounded retries per batch for transient failures.
const MAX_BATCH_RETRIES: u32 = 2;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

#[derive(Serialize)]
struct ScoreRequest<'a> {
    query: &'a str,
    passages: &'a [String],
}

#[derive(Deserialize)]
struct ScoreResponse {
    scores: Vec<f64>,
}

pub struct RemoteHttpReranker {
    client: reqwest::Client,
    endpoint: String,
    batch_size: usize,
    max_inflight: usize,
}

impl RemoteHttpReranker {
    pub fn new(
        endpoint: String,
        auth_token: Option<String>,
        timeout: Duration,
        batch_size: usize,
        max_inflight: usize,
    ) -> Result<Self, RerankError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| RerankError::Config("invalid reranker auth token".into()))?;
            headers.insert(AUTHORIZATION, value);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;
        Ok(Self {
            client,
            endpoint,
            batch_size: batch_size.max(1),
            max_inflight: max_inflight.max(1),
        })
    }

    async fn score_batch(&self, query: &str, passages: &[String]) -> Result<Vec<f64>, RerankError> {
        let mut attempt = 0u32;
        loop {
            let result = self.score_batch_once(query, passages).await;
            match result {
                Ok(scores) => return Ok(scores),
                Err(err) if err.is_retryable() && attempt < MAX_BATCH_RETRIES => {
                    let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
                    debug!(?err, attempt, "reranker batch retry");
                    attempt += 1;
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn score_batch_once(
        &self,
        query: &str,
        passages: &[String],
    ) -> Result<Vec<f64>, RerankError> {
        let request = ScoreRequest { query, passages };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RerankError::Timeout
                } else {
                    RerankError::Network(e)
                }
            })?;

        let status = response.status();
        if status.as_u16() >= 500 {
            let message = response.text().await.unwrap_or_default();
            return Err(RerankError::Upstream {
                status: status.as_u16(),
                message,
            });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RerankError::Decode(format!(
                "HTTP {}: {message}",
                status.as_u16()
            )));
        }

        let body = response.text().await.map_err(RerankError::Network)?;
        let parsed: ScoreResponse =
            serde_json::from_str(&body).map_err(|e| RerankError::Decode(e.to_string()))?;

        if parsed.scores.len() != passages.len() {
            return Err(RerankError::Decode(format!(
                "score count mismatch: {} passages, {} scores",
                passages.len(),
                parsed.scores.len()
            )));
        }
        Ok(parsed.scores)
    }
}

fn score_one<'a>(
    reranker: &'a RemoteHttpReranker,
    query: &'a str,
    idx: usize,
    batch: &'a [String],
) -> Pin<Box<dyn Future<Output = Result<(usize, Vec<f64>), RerankError>> + Send + 'a>> {
    Box::pin(async move {
        let scores = reranker.score_batch(query, batch).await?;
        Ok::<_, RerankError>((idx, scores))
    })
}

#[async_trait]
impl Reranker for RemoteHttpReranker {
    async fn score(
        &self,
        query: &str,
        passages: &[String],
        cancel: &CancelToken,
    ) -> Result<Vec<f64>, RerankError> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }
        cancel.check().map_err(RerankError::Interrupted)?;

        let batches: Vec<(usize, &[String])> =
            passages.chunks(self.batch_size).enumerate().collect();

        let mut pending = Vec::with_capacity(batches.len());
        for (idx, batch) in batches.into_iter() {
            pending.push(score_one(self, query, idx, batch));
        }
        let mut scored: Vec<(usize, Vec<f64>)> = stream::iter(pending)
            .buffer_unordered(self.max_inflight)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;

        cancel.check().map_err(RerankError::Interrupted)?;

        // Batches complete out of order; reassemble by batch index.
        scored.sort_by_key(|(idx, _)| *idx);
        Ok(scored.into_iter().flat_map(|(_, s)| s).collect())
    }
}
