//! Rate-limited model client with caching and fallback.
//!
//! Every model-calling stage goes through [`ModelClient`]. A call:
//! 1. checks the completion cache (hits bypass the rate limiter entirely),
//! 2. acquires the process-wide token buckets with a size estimate,
//! 3. dispatches through the provider gateway (which owns same-model
//!    retries and backoff),
//! 4. reconciles actual token usage and writes the cache.
//!
//! A call names a primary model and an ordered fallback list. Exhausting the
//! rate-limit wait budget on a model advances to the next immediately;
//! retryable provider failures advance after the gateway's retries run out.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::warn;

use crate::cache::{CachedCompletion, CompletionCache, CompletionCacheKey, SqliteCompletionCache};
use crate::cancel::{CancelToken, Interrupt};
use crate::gateway::rate_limit::model_route;
use crate::gateway::{
    AcquireError, Attribution, ChatGateway, ChatModel, ChatRequest, Message, ProviderError,
    RateLimiter,
};
use crate::tokens::estimate_prompt_tokens;

// =============================================================================
// Types
// =============================================================================

/// Primary model plus ordered fallbacks.
#[derive(Debug, Clone)]
pub struct ModelLadder {
    pub primary: String,
    pub fallbacks: Vec<String>,
}

impl ModelLadder {
    pub fn new(primary: impl Into<String>, fallbacks: Vec<String>) -> Self {
        Self {
            primary: primary.into(),
            fallbacks,
        }
    }

    pub fn single(model: impl Into<String>) -> Self {
        Self {
            primary: model.into(),
            fallbacks: Vec::new(),
        }
    }

    fn models(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.fallbacks.iter().map(|s| s.as_str()))
    }
}

/// Options for a single completion call.
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub temperature: f32,
    /// Hard cap on generation; also the output-token reservation against the
    /// rate limiter.
    pub max_output_tokens: u32,
    /// Request JSON output from the provider.
    pub json_mode: bool,
    /// Retries on schema violation for structured calls.
    pub schema_retries: u32,
    /// Extra component mixed into the cache key.
    pub cache_salt: Option<String>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_output_tokens: 4096,
            json_mode: false,
            schema_retries: 2,
            cache_salt: None,
        }
    }
}

/// A completed model call with its usage facts.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    /// Model that actually produced the completion.
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_nanodollars: i64,
    /// Served from the completion cache; no counters were touched.
    pub cached: bool,
    /// A non-primary model produced this completion.
    pub fallback: bool,
    /// Time spent waiting on the rate limiter.
    pub waited_ms: u64,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("rate limit wait budget exhausted on all models")]
    RateLimitedExhausted,
    #[error("upstream model failure: {0}")]
    Upstream(String),
    #[error("model response does not conform to the expected schema: {0}")]
    SchemaViolation(String),
    #[error("interrupted")]
    Interrupted(Interrupt),
}

// =============================================================================
// Client
// =============================================================================

pub struct ModelClient {
    gateway: Arc<dyn ChatGateway>,
    limiter: Arc<RateLimiter>,
    cache: Option<Arc<SqliteCompletionCache>>,
}

impl ModelClient {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        limiter: Arc<RateLimiter>,
        cache: Option<Arc<SqliteCompletionCache>>,
    ) -> Self {
        Self {
            gateway,
            limiter,
            cache,
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// One completion over the model ladder.
    pub async fn complete(
        &self,
        models: &ModelLadder,
        system_text: &str,
        user_text: &str,
        opts: &CallOptions,
        attribution: Attribution,
        cancel: &CancelToken,
    ) -> Result<Completion, ModelError> {
        let mut rate_limited_everywhere = true;
        let mut last_failure: Option<String> = None;

        for (model_index, model) in models.models().enumerate() {
            cancel.check().map_err(ModelError::Interrupted)?;

            let cache_key = self.cache.as_ref().map(|_| {
                CompletionCacheKey::new(
                    model,
                    system_text,
                    user_text,
                    opts.temperature,
                    Some(opts.max_output_tokens),
                    opts.json_mode,
                    opts.cache_salt.as_deref(),
                )
            });

            // Cache hits return without touching the buckets; the original
            // usage record rides along so cost accounting stays accurate.
            if let (Some(cache), Some(key)) = (self.cache.as_ref(), cache_key.as_ref()) {
                match cache.get(key).await {
                    Ok(Some(hit)) => {
                        return Ok(Completion {
                            content: hit.content,
                            model: model.to_string(),
                            input_tokens: hit.input_tokens,
                            output_tokens: hit.output_tokens,
                            cost_nanodollars: hit.cost_nanodollars,
                            cached: true,
                            fallback: model_index > 0,
                            waited_ms: 0,
                        });
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(error = %err, "completion cache read failed; calling live");
                    }
                }
            }

            let estimated_input = estimate_prompt_tokens(system_text, user_text);
            let route = model_route(model);
            let waited = match self
                .limiter
                .acquire(route, estimated_input, opts.max_output_tokens, cancel)
                .await
            {
                Ok(waited) => waited,
                Err(AcquireError::Exhausted { .. }) => {
                    // Immediate fallback to the next model in the ladder.
                    warn!(model, "rate limit wait budget exhausted; falling back");
                    last_failure = Some(format!("{model}: rate limit exhausted"));
                    continue;
                }
                Err(AcquireError::Interrupted(reason)) => {
                    return Err(ModelError::Interrupted(reason))
                }
            };

            let mut messages = Vec::with_capacity(2);
            if !system_text.is_empty() {
                messages.push(Message::system(system_text));
            }
            messages.push(Message::user(user_text));

            let mut request =
                ChatRequest::new(ChatModel::openrouter(model), messages, attribution.clone())
                    .temperature(opts.temperature)
                    .max_tokens(opts.max_output_tokens);
            if opts.json_mode {
                request = request.json();
            }

            match self.gateway.chat(request).await {
                Ok(response) => {
                    self.limiter.reconcile(
                        route,
                        estimated_input,
                        response.input_tokens,
                        opts.max_output_tokens,
                        response.output_tokens,
                    );

                    if let (Some(cache), Some(key)) = (self.cache.as_ref(), cache_key.as_ref()) {
                        let entry = CachedCompletion {
                            content: response.content.clone(),
                            input_tokens: response.input_tokens,
                            output_tokens: response.output_tokens,
                            cost_nanodollars: response.cost_nanodollars,
                        };
                        if let Err(err) = cache.put(key, &entry).await {
                            warn!(error = %err, "completion cache write failed");
                        }
                    }

                    return Ok(Completion {
                        content: response.content,
                        model: model.to_string(),
                        input_tokens: response.input_tokens,
                        output_tokens: response.output_tokens,
                        cost_nanodollars: response.cost_nanodollars,
                        cached: false,
                        fallback: model_index > 0,
                        waited_ms: waited.as_millis() as u64,
                    });
                }
                Err(err) => {
                    // The reservation was spent on a failed call; give the
                    // output tokens back.
                    self.limiter.reconcile(
                        route,
                        estimated_input,
                        estimated_input,
                        opts.max_output_tokens,
                        0,
                    );

                    if advances_ladder(&err) {
                        warn!(model, error = %err, "model call failed; trying next model");
                        rate_limited_everywhere = false;
                        last_failure = Some(format!("{model}: {err}"));
                        continue;
                    }
                    return Err(ModelError::Upstream(format!("{model}: {err}")));
                }
            }
        }

        if rate_limited_everywhere && last_failure.is_some() {
            Err(ModelError::RateLimitedExhausted)
        } else {
            Err(ModelError::Upstream(
                last_failure.unwrap_or_else(|| "no models configured".into()),
            ))
        }
    }

    /// Structured completion: parse and validate the output against `T`.
    ///
    /// Non-conforming output is retried up to `opts.schema_retries` times on
    /// the same ladder, bypassing the cache for retries so a bad cached
    /// response cannot wedge the call. Usage is accumulated across attempts.
    pub async fn complete_structured<T: DeserializeOwned>(
        &self,
        models: &ModelLadder,
        system_text: &str,
        user_text: &str,
        opts: &CallOptions,
        attribution: Attribution,
        cancel: &CancelToken,
    ) -> Result<(T, Completion), ModelError> {
        let mut opts = opts.clone();
        opts.json_mode = true;

        let base_salt = opts.cache_salt.clone();
        let mut total_input = 0u32;
        let mut total_output = 0u32;
        let mut total_cost = 0i64;
        let mut last_error = String::new();

        for attempt in 0..=opts.schema_retries {
            if attempt > 0 {
                // Distinct salt so the retry misses the cached bad response.
                opts.cache_salt = Some(match &base_salt {
                    Some(salt) => format!("{salt};schema_retry={attempt}"),
                    None => format!("schema_retry={attempt}"),
                });
            }

            let completion = self
                .complete(models, system_text, user_text, &opts, attribution.clone(), cancel)
                .await?;

            total_input += completion.input_tokens;
            total_output += completion.output_tokens;
            total_cost += completion.cost_nanodollars;

            let json_str = extract_json(&completion.content);
            match serde_json::from_str::<T>(json_str) {
                Ok(parsed) => {
                    let completion = Completion {
                        input_tokens: total_input,
                        output_tokens: total_output,
                        cost_nanodollars: total_cost,
                        ..completion
                    };
                    return Ok((parsed, completion));
                }
                Err(err) => {
                    let preview: String = completion.content.chars().take(300).collect();
                    last_error = format!("{err} — raw: {preview}");
                    warn!(attempt, error = %err, "structured output parse failed");
                }
            }
        }

        Err(ModelError::SchemaViolation(last_error))
    }
}

/// Whether a provider error should advance the model ladder rather than fail
/// the call: transient upstream trouble and provider-reported quota issues.
fn advances_ladder(err: &ProviderError) -> bool {
    match err {
        ProviderError::RateLimited { .. } => true,
        ProviderError::Timeout(_, _) => true,
        ProviderError::Provider { retryable, .. } => *retryable,
        ProviderError::Http(_) => true,
        ProviderError::InvalidRequest { .. }
        | ProviderError::Refused { .. }
        | ProviderError::Config(_) => false,
    }
}

/// Extract a JSON object from a model response that may carry surrounding
/// prose.
pub fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();

    if let Some(start) = trimmed.find('{') {
        let remainder = &trimmed[start..];
        let mut depth = 0;
        let mut in_string = false;
        let mut escaped = false;
        for (i, c) in remainder.char_indices() {
            if escaped {
                escaped = false;
                continue;
            }
            match c {
                '\\' if in_string => escaped = true,
                '"' => in_string = !in_string,
                '{' if !in_string => depth += 1,
                '}' if !in_string => {
                    depth -= 1;
                    if depth == 0 {
                        return &remainder[..=i];
                    }
                }
                _ => {}
            }
        }
    }

    trimmed
}
