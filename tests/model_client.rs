//! Model client behavior: ladder fallback, rate-limit accounting and the
//! completion cache.

use std::sync::Arc;
use std::time::Duration;

use scholar_harness::cache::SqliteCompletionCache;
use scholar_harness::cancel::CancelToken;
use scholar_harness::gateway::openrouter::OpenRouterAdapter;
use scholar_harness::gateway::{
    Attribution, GatewayConfig, NoopUsageSink, ProviderGateway, RateLimitPolicy, RateLimiter,
};
use scholar_harness::llm::{CallOptions, ModelClient, ModelError, ModelLadder};
use serde_json::json;
use tempfile::tempdir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Answers with the model id that was asked for, so fallback is observable.
struct EchoModelResponder;

impl Respond for EchoModelResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        let model = body["model"].as_str().unwrap_or("unknown").to_string();
        ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": format!("answered-by {model}") },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 5 }
        }))
    }
}

fn client_with(
    server: &MockServer,
    policy: RateLimitPolicy,
    cache: Option<Arc<SqliteCompletionCache>>,
) -> ModelClient {
    let adapter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap();
    let gateway = Arc::new(ProviderGateway::with_config(
        adapter,
        Arc::new(NoopUsageSink),
        GatewayConfig {
            max_retries: 0,
            retry_base_delay: Duration::from_millis(0),
        },
    ));
    ModelClient::new(gateway, Arc::new(RateLimiter::new(policy)), cache)
}

fn ladder() -> ModelLadder {
    ModelLadder::new(
        "primary/model".to_string(),
        vec!["fallback/model".to_string()],
    )
}

#[tokio::test]
async fn rate_limit_exhaustion_falls_back_to_secondary_model() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(EchoModelResponder)
        .mount(&server)
        .await;

    // One request per minute; the second call cannot wait long enough.
    let client = client_with(
        &server,
        RateLimitPolicy {
            requests_per_minute: 1,
            input_tokens_per_minute: 100_000,
            output_tokens_per_minute: 100_000,
            max_wait: Duration::from_millis(50),
        },
        None,
    );
    let cancel = CancelToken::new();
    let opts = CallOptions::default();

    let first = client
        .complete(&ladder(), "sys", "user", &opts, Attribution::new("test"), &cancel)
        .await
        .unwrap();
    assert_eq!(first.content, "answered-by primary/model");
    assert!(!first.fallback);

    // The primary route's request bucket is drained; the wait would exceed
    // the budget, so the call falls back to the differently-routed model
    // immediately.
    let second = client
        .complete(&ladder(), "sys", "user", &opts, Attribution::new("test"), &cancel)
        .await
        .unwrap();
    assert!(second.fallback);
    assert_eq!(second.content, "answered-by fallback/model");

    // With both routes drained, the ladder exhausts.
    let err = client
        .complete(&ladder(), "sys", "user", &opts, Attribution::new("test"), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ModelError::RateLimitedExhausted));
}

#[tokio::test]
async fn warm_cache_avoids_the_second_upstream_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(EchoModelResponder)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let cache = Arc::new(SqliteCompletionCache::new(dir.path().join("c.sqlite")).unwrap());
    let client = client_with(&server, RateLimitPolicy::default(), Some(cache));
    let cancel = CancelToken::new();
    let opts = CallOptions::default();

    let first = client
        .complete(&ladder(), "sys", "the question", &opts, Attribution::new("test"), &cancel)
        .await
        .unwrap();
    assert!(!first.cached);

    let second = client
        .complete(&ladder(), "sys", "the question", &opts, Attribution::new("test"), &cancel)
        .await
        .unwrap();
    assert!(second.cached);
    assert_eq!(second.content, first.content);
    // Cached hits still report the original usage for cost accounting.
    assert_eq!(second.input_tokens, first.input_tokens);
    assert_eq!(second.cost_nanodollars, first.cost_nanodollars);

    // Exactly one upstream request was made.
    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
}

#[tokio::test]
async fn upstream_5xx_advances_the_ladder() {
    let server = MockServer::start().await;

    struct PrimaryDown;
    impl Respond for PrimaryDown {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
            if body["model"].as_str() == Some("primary/model") {
                ResponseTemplate::new(500).set_body_json(json!({
                    "error": { "message": "server exploded", "code": "internal" }
                }))
            } else {
                ResponseTemplate::new(200).set_body_json(json!({
                    "choices": [{
                        "message": { "content": "fallback says hi" },
                        "finish_reason": "stop"
                    }],
                    "usage": { "prompt_tokens": 3, "completion_tokens": 2 }
                }))
            }
        }
    }

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(PrimaryDown)
        .mount(&server)
        .await;

    let client = client_with(&server, RateLimitPolicy::default(), None);
    let cancel = CancelToken::new();

    let completion = client
        .complete(
            &ladder(),
            "sys",
            "user",
            &CallOptions::default(),
            Attribution::new("test"),
            &cancel,
        )
        .await
        .unwrap();
    assert!(completion.fallback);
    assert_eq!(completion.model, "fallback/model");
    assert_eq!(completion.content, "fallback says hi");
}

#[tokio::test]
async fn structured_call_retries_schema_violations_then_gives_up() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "this is not json at all" },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
        })))
        .mount(&server)
        .await;

    let client = client_with(&server, RateLimitPolicy::default(), None);
    let cancel = CancelToken::new();

    #[derive(Debug, serde::Deserialize)]
    struct Expected {
        #[allow(dead_code)]
        answer: String,
    }

    let opts = CallOptions {
        schema_retries: 2,
        ..Default::default()
    };
    let err = client
        .complete_structured::<Expected>(
            &ModelLadder::single("primary/model"),
            "sys",
            "user",
            &opts,
            Attribution::new("test"),
            &cancel,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ModelError::SchemaViolation(_)));

    // Initial attempt plus two retries.
    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 3);
}
