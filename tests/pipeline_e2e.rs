//! End-to-end pipeline scenarios against mocked index, reranker and model
//! servers.

use std::sync::Arc;
use std::time::Duration;

use scholar_harness::config::{AppConfig, RerankService, TraceMode};
use scholar_harness::corpus::{HttpPaperIndex, HttpPaperIndexConfig};
use scholar_harness::gateway::openrouter::OpenRouterAdapter;
use scholar_harness::gateway::{GatewayConfig, NoopUsageSink, ProviderGateway};
use scholar_harness::moderation::HttpModerator;
use scholar_harness::moderation::Moderator;
use scholar_harness::pipeline::outline::SectionFormat;
use scholar_harness::rerank::build_reranker;
use scholar_harness::state::{InMemoryResultStore, TaskState, TaskStatus};
use scholar_harness::supervisor::{SubmitRequest, TaskSupervisor};
use scholar_harness::trace::LocalTraceWriter;
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

// =============================================================================
// Mock model server
// =============================================================================

/// Scripted chat-completions responder keyed off the stage system prompts.
struct StageResponder {
    outline_json: String,
    section_text: String,
    extraction_delay: Option<Duration>,
}

impl StageResponder {
    fn new(outline_json: &str, section_text: &str) -> Self {
        Self {
            outline_json: outline_json.to_string(),
            section_text: section_text.to_string(),
            extraction_delay: None,
        }
    }

    fn with_extraction_delay(mut self, delay: Duration) -> Self {
        self.extraction_delay = Some(delay);
        self
    }
}

fn chat_body(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{
            "message": { "content": content },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 50, "completion_tokens": 30 }
    }))
}

impl Respond for StageResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body = String::from_utf8_lossy(&request.body).to_string();

        if body.contains("scientific search query planner") {
            return chat_body(
                r#"{"rewritten_query": "planet nine evidence", "keyword_query": "planet nine",
                    "earliest_search_year": null, "latest_search_year": null,
                    "venues": [], "authors": [], "fields_of_study": []}"#,
            );
        }

        if body.contains("extract evidence from a single research paper") {
            let quote = if body.contains("Paper One") {
                quote_text("first")
            } else if body.contains("Paper Two") {
                quote_text("second")
            } else {
                quote_text("third")
            };
            let template = chat_body(&format!(r#"{{"quotes": ["{quote}"]}}"#));
            return match self.extraction_delay {
                Some(delay) => template.set_delay(delay),
                None => template,
            };
        }

        if body.contains("organize extracted paper quotes") {
            return chat_body(&self.outline_json);
        }

        if body.contains("write one section") {
            return chat_body(&self.section_text);
        }

        if body.contains("design the columns") {
            return chat_body(
                r#"{"columns": [
                    {"name": "Model", "definition": "name of the proposed model"},
                    {"name": "Parameters", "definition": "parameter count of the model"}
                ]}"#,
            );
        }

        if body.contains("fill one cell") {
            let value = if body.contains("Parameters") {
                if body.contains("Paper One") {
                    "1300M"
                } else if body.contains("Paper Two") {
                    "\u{2248}1.3 billion"
                } else {
                    "1.3B"
                }
            } else {
                "SystemX"
            };
            return chat_body(&format!(r#"{{"value": "{value}"}}"#));
        }

        if body.contains("normalize one column") {
            let values = if body.contains("Parameters") {
                r#"{"values": ["1.3B", "1.3B", "1.3B"]}"#
            } else {
                r#"{"values": ["SystemX", "SystemX", "SystemX"]}"#
            };
            return chat_body(values);
        }

        chat_body("TLDR: Unexpected stage.\nUnexpected stage.")
    }
}

/// Body text of the snippets served by the mock index; the extraction
/// responder returns these verbatim so the substring invariant holds.
fn quote_text(marker: &str) -> String {
    format!(
        "{marker} snippet sentence carrying well over twenty words of evidence text \
         so the retrieval filter keeps it and the extractor can quote it verbatim here"
    )
}

// =============================================================================
// Mock paper index + reranker
// =============================================================================

async fn mount_index(server: &MockServer, n_papers: usize) {
    let data: Vec<serde_json::Value> = (0..n_papers)
        .map(|i| {
            let markers = ["first", "second", "third"];
            json!({
                "snippet": {
                    "text": quote_text(markers[i]),
                    "snippetKind": "body",
                    "snippetOffset": { "start": 100 * (i + 1), "end": 100 * (i + 1) + 80 }
                },
                "paper": { "corpusId": 101 + i },
                "score": (10 - i) as f64,
                "section": "Results"
            })
        })
        .collect();

    Mock::given(method("GET"))
        .and(path("/snippet/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": data })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/paper/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
        .mount(server)
        .await;

    let titles = ["Paper One", "Paper Two", "Paper Three"];
    let metadata: Vec<serde_json::Value> = (0..n_papers)
        .map(|i| {
            json!({
                "corpusId": 101 + i,
                "title": titles[i],
                "year": 2020 + i as i32,
                "venue": "AJ",
                "authors": [{ "name": "Brown", "authorId": "1" }],
                "citationCount": 40 - i as i64,
                "influentialCitationCount": 5,
                "isOpenAccess": true,
                "abstract": format!("Abstract of {}.", titles[i])
            })
        })
        .collect();

    Mock::given(method("POST"))
        .and(path("/paper/batch"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(metadata)))
        .mount(server)
        .await;
}

async fn mount_reranker(server: &MockServer, scores: Vec<f64>) {
    Mock::given(method("POST"))
        .and(path("/rerank"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "scores": scores })))
        .mount(server)
        .await;
}

// =============================================================================
// Supervisor assembly
// =============================================================================

struct Harness {
    supervisor: Arc<TaskSupervisor>,
    trace_dir: TempDir,
}

async fn build_harness(
    index_server: &MockServer,
    rerank_server: &MockServer,
    model_server: &MockServer,
    moderator: Option<Arc<dyn Moderator>>,
    tweak: impl FnOnce(&mut AppConfig),
) -> Harness {
    let trace_dir = TempDir::new().unwrap();

    let mut config = AppConfig::default();
    config.rerank.service = RerankService::RemoteHttp {
        endpoint: format!("{}/rerank", rerank_server.uri()),
    };
    config.rerank.client_timeout = Duration::from_secs(2);
    config.paper_finder.context_threshold = 0.3;
    config.pipeline.llm = "anthropic/claude-3-5-sonnet".into();
    config.pipeline.fallback_llm = vec!["openai/gpt-4o".into()];
    config.pipeline.max_llm_workers = 4;
    config.tasks.max_concurrent = 2;
    config.tasks.timeout = Duration::from_secs(30);
    config.trace.mode = TraceMode::Local;
    config.trace.location = trace_dir.path().to_string_lossy().to_string();
    tweak(&mut config);

    let adapter =
        OpenRouterAdapter::with_config("sk-test", model_server.uri(), Duration::from_secs(10))
            .unwrap();
    let gateway = Arc::new(ProviderGateway::with_config(
        adapter,
        Arc::new(NoopUsageSink),
        GatewayConfig {
            max_retries: 0,
            retry_base_delay: Duration::from_millis(0),
        },
    ));
    let index = Arc::new(
        HttpPaperIndex::new(HttpPaperIndexConfig {
            base_url: index_server.uri(),
            max_retries: 0,
            retry_base_delay: Duration::from_millis(1),
            ..Default::default()
        })
        .unwrap(),
    );
    let reranker = build_reranker(&config.rerank).unwrap();
    let store = Arc::new(InMemoryResultStore::new(Duration::from_secs(3600)));
    let trace_writer = Arc::new(LocalTraceWriter::new(trace_dir.path()));

    let supervisor = TaskSupervisor::from_parts(
        config,
        gateway,
        index,
        reranker,
        moderator,
        store,
        trace_writer,
    )
    .unwrap();

    Harness {
        supervisor,
        trace_dir,
    }
}

async fn wait_terminal(supervisor: &Arc<TaskSupervisor>, task_id: &str) -> TaskState {
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let state = supervisor.poll(task_id).await.expect("task exists");
            if state.task_status.is_terminal() {
                return state;
            }
        }
    })
    .await
    .expect("task should reach a terminal state")
}

/// Trace persistence happens just after the terminal status flip, so poll
/// briefly for the file.
async fn read_trace(dir: &TempDir, task_id: &str) -> serde_json::Value {
    let path = dir.path().join(format!("{task_id}.json"));
    for _ in 0..40 {
        if let Ok(body) = std::fs::read_to_string(&path) {
            return serde_json::from_str(&body).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("trace file never appeared: {}", path.display());
}

const SYNTHESIS_OUTLINE: &str = r#"{"cot": "one theme",
    "sections": [{"name": "Summary", "format": "synthesis", "quotes": [0, 1]}]}"#;

const LIST_OUTLINE: &str = r#"{"cot": "comparable items",
    "sections": [{"name": "Model comparison", "format": "list", "quotes": [0, 1, 2]}]}"#;

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn happy_path_synthesis_only() {
    let index_server = MockServer::start().await;
    let rerank_server = MockServer::start().await;
    let model_server = MockServer::start().await;

    // 3 passages across papers 101/102/103; 0.2 falls below the threshold,
    // leaving two papers.
    mount_index(&index_server, 3).await;
    mount_reranker(&rerank_server, vec![0.9, 0.8, 0.2]).await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(StageResponder::new(
            SYNTHESIS_OUTLINE,
            "TLDR: No ninth planet is confirmed.\nEvidence points to a distant body [1]. \
             Simulations agree [2].",
        ))
        .mount(&model_server)
        .await;

    let harness = build_harness(&index_server, &rerank_server, &model_server, None, |_| {}).await;
    let state = harness
        .supervisor
        .submit(SubmitRequest {
            query: "What is the ninth planet of our solar system?".into(),
            user_id: Some("u1".into()),
            opt_in: true,
        })
        .await;
    assert_eq!(state.task_status, TaskStatus::Queued);

    let final_state = wait_terminal(&harness.supervisor, &state.task_id).await;
    assert_eq!(final_state.task_status, TaskStatus::Complete);

    let result = final_state.task_result.expect("complete task has a result");
    assert_eq!(result.sections.len(), 1);
    let section = &result.sections[0];
    assert_eq!(section.title, "Summary");
    assert_eq!(section.format, SectionFormat::Synthesis);
    assert_eq!(section.tldr.as_deref(), Some("No ninth planet is confirmed."));
    assert!(section.table.is_none());

    // Both papers are cited with dense reference numbers.
    let mut ids: Vec<&str> = section.citations.iter().map(|c| c.id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["1", "2"]);
    assert_eq!(result.references.len(), 2);

    // Steps are totally ordered by start timestamp, and every step but at
    // most the last is closed.
    let steps = &final_state.steps;
    assert!(!steps.is_empty());
    for pair in steps.windows(2) {
        assert!(pair[0].start_timestamp <= pair[1].start_timestamp);
    }
    assert!(steps
        .iter()
        .take(steps.len() - 1)
        .all(|s| s.end_timestamp.is_some()));

    // Cost accounting captured the model calls.
    assert!(result.cost.total_nanodollars > 0);

    // The trace has one record per stage.
    let trace = read_trace(&harness.trace_dir, &state.task_id).await;
    let stages: Vec<&str> = trace["stages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["stage"].as_str().unwrap())
        .collect();
    assert_eq!(
        stages,
        vec!["decompose", "retrieve", "extract", "plan", "synthesize"]
    );
}

#[tokio::test]
async fn list_section_triggers_a_normalized_table() {
    let index_server = MockServer::start().await;
    let rerank_server = MockServer::start().await;
    let model_server = MockServer::start().await;

    mount_index(&index_server, 3).await;
    mount_reranker(&rerank_server, vec![0.9, 0.8, 0.7]).await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(StageResponder::new(
            LIST_OUTLINE,
            "TLDR: Three rerankers compared.\nSystemX leads [1]. Variants follow [2]. \
             A third approach differs [3].",
        ))
        .mount(&model_server)
        .await;

    let harness = build_harness(&index_server, &rerank_server, &model_server, None, |_| {}).await;
    let state = harness
        .supervisor
        .submit(SubmitRequest {
            query: "Compare reranker models for scientific passage ranking".into(),
            user_id: None,
            opt_in: false,
        })
        .await;

    let final_state = wait_terminal(&harness.supervisor, &state.task_id).await;
    assert_eq!(final_state.task_status, TaskStatus::Complete);

    let result = final_state.task_result.unwrap();
    let section = &result.sections[0];
    assert_eq!(section.format, SectionFormat::List);
    let table = section.table.as_ref().expect("list section has a table");

    assert!(table.columns.len() <= 6);
    assert_eq!(table.rows.len(), 3);

    // Every (row, column) pair has a cell.
    for row in &table.rows {
        for column in &table.columns {
            let key = format!("{}_{}", row.id, column.id);
            assert!(table.cells.contains_key(&key), "missing cell {key}");
        }
    }

    // Normalization harmonized the parameter counts.
    let parameters = table
        .columns
        .iter()
        .find(|c| c.name == "Parameters")
        .expect("Parameters column");
    for row in &table.rows {
        let key = format!("{}_{}", row.id, parameters.id);
        assert_eq!(table.cells[&key].display_value, "1.3B");
    }
}

#[tokio::test]
async fn reranker_outage_completes_with_warning_in_retrieval_order() {
    let index_server = MockServer::start().await;
    let rerank_server = MockServer::start().await;
    let model_server = MockServer::start().await;

    mount_index(&index_server, 2).await;
    Mock::given(method("POST"))
        .and(path("/rerank"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&rerank_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(StageResponder::new(
            SYNTHESIS_OUTLINE,
            "TLDR: Degraded but alive.\nRetrieval order held [1]. Second source [2].",
        ))
        .mount(&model_server)
        .await;

    let harness = build_harness(&index_server, &rerank_server, &model_server, None, |c| {
        // Normalized retrieval scores include 0.0 for the last passage.
        c.paper_finder.context_threshold = 0.0;
    })
    .await;
    let state = harness
        .supervisor
        .submit(SubmitRequest {
            query: "planet nine".into(),
            user_id: None,
            opt_in: false,
        })
        .await;

    let final_state = wait_terminal(&harness.supervisor, &state.task_id).await;
    assert_eq!(final_state.task_status, TaskStatus::Complete);

    // Retrieval order: paper 101 (score 10) gets reference number 1.
    let result = final_state.task_result.unwrap();
    let first_ref = result
        .references
        .iter()
        .find(|p| p.corpus_id == "101")
        .expect("paper 101 referenced");
    assert_eq!(first_ref.title, "Paper One");

    let trace = read_trace(&harness.trace_dir, &state.task_id).await;
    let warnings = trace["warnings"].as_array().unwrap();
    assert!(warnings
        .iter()
        .any(|w| w.as_str().unwrap().contains("reranker unavailable")));
}

#[tokio::test]
async fn no_retrieval_hits_fails_before_downstream_stages() {
    let index_server = MockServer::start().await;
    let rerank_server = MockServer::start().await;
    let model_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/snippet/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
        .mount(&index_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/paper/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
        .mount(&index_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(StageResponder::new(SYNTHESIS_OUTLINE, "TLDR: x.\nx"))
        .mount(&model_server)
        .await;

    let harness = build_harness(&index_server, &rerank_server, &model_server, None, |_| {}).await;
    let state = harness
        .supervisor
        .submit(SubmitRequest {
            query: "a query with no matches".into(),
            user_id: None,
            opt_in: false,
        })
        .await;

    let final_state = wait_terminal(&harness.supervisor, &state.task_id).await;
    assert_eq!(final_state.task_status, TaskStatus::Failed);
    assert!(final_state
        .detail
        .unwrap()
        .contains("No relevant papers were found"));
    assert!(final_state.task_result.is_none());

    // Only decomposition reached the model server.
    let received = model_server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
}

#[tokio::test]
async fn cancellation_mid_flight_discards_partial_results() {
    let index_server = MockServer::start().await;
    let rerank_server = MockServer::start().await;
    let model_server = MockServer::start().await;

    mount_index(&index_server, 2).await;
    mount_reranker(&rerank_server, vec![0.9, 0.8]).await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            StageResponder::new(
                SYNTHESIS_OUTLINE,
                "TLDR: Should never arrive.\nNever [1].",
            )
            .with_extraction_delay(Duration::from_secs(2)),
        )
        .mount(&model_server)
        .await;

    let harness = build_harness(&index_server, &rerank_server, &model_server, None, |_| {}).await;
    let state = harness
        .supervisor
        .submit(SubmitRequest {
            query: "planet nine".into(),
            user_id: None,
            opt_in: false,
        })
        .await;

    // Wait until retrieval is done and extraction has started, then cancel.
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let s = harness.supervisor.poll(&state.task_id).await.unwrap();
            if s.steps.iter().any(|s| s.description.contains("Extracting")) {
                break;
            }
        }
    })
    .await
    .expect("extraction step should appear");
    assert!(harness.supervisor.cancel(&state.task_id));

    let final_state = wait_terminal(&harness.supervisor, &state.task_id).await;
    assert_eq!(final_state.task_status, TaskStatus::Cancelled);
    assert!(final_state.task_result.is_none());
    assert!(final_state.steps.iter().all(|s| s.end_timestamp.is_some()));

    // The trace holds the retrieval record plus the cancellation mark.
    let trace = read_trace(&harness.trace_dir, &state.task_id).await;
    let stages: Vec<&str> = trace["stages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["stage"].as_str().unwrap())
        .collect();
    assert!(stages.contains(&"retrieve"));
    assert_eq!(trace["interruption"].as_str(), Some("cancelled"));
}

#[tokio::test]
async fn timeout_fails_the_task_and_closes_steps() {
    let index_server = MockServer::start().await;
    let rerank_server = MockServer::start().await;
    let model_server = MockServer::start().await;

    mount_index(&index_server, 2).await;
    mount_reranker(&rerank_server, vec![0.9, 0.8]).await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            StageResponder::new(SYNTHESIS_OUTLINE, "TLDR: late.\nLate [1].")
                .with_extraction_delay(Duration::from_secs(3)),
        )
        .mount(&model_server)
        .await;

    let harness = build_harness(&index_server, &rerank_server, &model_server, None, |c| {
        c.tasks.timeout = Duration::from_secs(1);
    })
    .await;
    let state = harness
        .supervisor
        .submit(SubmitRequest {
            query: "planet nine".into(),
            user_id: None,
            opt_in: false,
        })
        .await;

    let final_state = wait_terminal(&harness.supervisor, &state.task_id).await;
    assert_eq!(final_state.task_status, TaskStatus::Failed);
    assert!(final_state.detail.unwrap().contains("timed out"));
    assert!(final_state.steps.iter().all(|s| s.end_timestamp.is_some()));

    let trace = read_trace(&harness.trace_dir, &state.task_id).await;
    assert_eq!(trace["interruption"].as_str(), Some("timeout"));
}

#[tokio::test]
async fn moderation_block_fails_without_further_external_calls() {
    let index_server = MockServer::start().await;
    let rerank_server = MockServer::start().await;
    let model_server = MockServer::start().await;
    let moderation_server = MockServer::start().await;

    mount_index(&index_server, 2).await;
    mount_reranker(&rerank_server, vec![0.9, 0.8]).await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(StageResponder::new(SYNTHESIS_OUTLINE, "TLDR: x.\nx"))
        .mount(&model_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/moderations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{ "flagged": true, "categories": { "violence": true } }]
        })))
        .mount(&moderation_server)
        .await;

    let moderator: Arc<dyn Moderator> = Arc::new(
        HttpModerator::new(
            format!("{}/moderations", moderation_server.uri()),
            None,
            Duration::from_secs(2),
        )
        .unwrap(),
    );

    let harness = build_harness(
        &index_server,
        &rerank_server,
        &model_server,
        Some(moderator),
        |c| c.pipeline.validate = true,
    )
    .await;
    let state = harness
        .supervisor
        .submit(SubmitRequest {
            query: "a blocked query".into(),
            user_id: None,
            opt_in: false,
        })
        .await;

    let final_state = wait_terminal(&harness.supervisor, &state.task_id).await;
    assert_eq!(final_state.task_status, TaskStatus::Failed);
    assert!(final_state.detail.unwrap().contains("moderation"));

    // No model or index call was ever issued.
    assert!(model_server.received_requests().await.unwrap().is_empty());
    assert!(index_server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn empty_query_fails_immediately() {
    let index_server = MockServer::start().await;
    let rerank_server = MockServer::start().await;
    let model_server = MockServer::start().await;

    let harness = build_harness(&index_server, &rerank_server, &model_server, None, |_| {}).await;
    let state = harness
        .supervisor
        .submit(SubmitRequest {
            query: "   ".into(),
            user_id: None,
            opt_in: false,
        })
        .await;
    assert_eq!(state.task_status, TaskStatus::Failed);
    assert!(state.detail.unwrap().contains("empty"));
}

#[tokio::test]
async fn single_retrieved_paper_still_produces_a_one_section_result() {
    let index_server = MockServer::start().await;
    let rerank_server = MockServer::start().await;
    let model_server = MockServer::start().await;

    mount_index(&index_server, 1).await;
    mount_reranker(&rerank_server, vec![0.9]).await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(StageResponder::new(
            r#"{"cot": "only one paper",
                "sections": [{"name": "Summary", "format": "synthesis", "quotes": [0]}]}"#,
            "TLDR: One paper answers it.\nA single source suffices [1].",
        ))
        .mount(&model_server)
        .await;

    let harness = build_harness(&index_server, &rerank_server, &model_server, None, |_| {}).await;
    let state = harness
        .supervisor
        .submit(SubmitRequest {
            query: "planet nine".into(),
            user_id: None,
            opt_in: false,
        })
        .await;

    let final_state = wait_terminal(&harness.supervisor, &state.task_id).await;
    assert_eq!(final_state.task_status, TaskStatus::Complete);
    let result = final_state.task_result.unwrap();
    assert_eq!(result.sections.len(), 1);
    assert_eq!(result.sections[0].citations.len(), 1);
    assert_eq!(result.references.len(), 1);
}

#[tokio::test]
async fn feedback_is_acknowledged_and_persisted_for_known_tasks() {
    let index_server = MockServer::start().await;
    let rerank_server = MockServer::start().await;
    let model_server = MockServer::start().await;

    mount_index(&index_server, 2).await;
    mount_reranker(&rerank_server, vec![0.9, 0.8]).await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(StageResponder::new(
            SYNTHESIS_OUTLINE,
            "TLDR: Fine.\nFine [1]. Also fine [2].",
        ))
        .mount(&model_server)
        .await;

    let harness = build_harness(&index_server, &rerank_server, &model_server, None, |_| {}).await;
    let state = harness
        .supervisor
        .submit(SubmitRequest {
            query: "planet nine".into(),
            user_id: Some("u1".into()),
            opt_in: false,
        })
        .await;
    wait_terminal(&harness.supervisor, &state.task_id).await;

    let ack = harness
        .supervisor
        .feedback(scholar_harness::supervisor::Feedback {
            task_id: state.task_id.clone(),
            user_id: Some("u1".into()),
            text: Some("very helpful".into()),
            reaction: Some(1),
            section: Some("Summary".into()),
        })
        .await
        .unwrap();
    assert!(!ack.is_empty());

    // The feedback document landed next to the traces.
    let feedback_dir = harness.trace_dir.path().join("feedback");
    let entries: Vec<_> = std::fs::read_dir(&feedback_dir).unwrap().collect();
    assert_eq!(entries.len(), 1);

    // Unknown tasks are rejected.
    let err = harness
        .supervisor
        .feedback(scholar_harness::supervisor::Feedback {
            task_id: "nope".into(),
            user_id: None,
            text: None,
            reaction: Some(-1),
            section: None,
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unknown task"));
}

#[tokio::test]
async fn admission_cap_keeps_excess_tasks_queued() {
    let index_server = MockServer::start().await;
    let rerank_server = MockServer::start().await;
    let model_server = MockServer::start().await;

    mount_index(&index_server, 2).await;
    mount_reranker(&rerank_server, vec![0.9, 0.8]).await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            StageResponder::new(SYNTHESIS_OUTLINE, "TLDR: Done.\nDone [1].")
                .with_extraction_delay(Duration::from_millis(800)),
        )
        .mount(&model_server)
        .await;

    let harness = build_harness(&index_server, &rerank_server, &model_server, None, |c| {
        c.tasks.max_concurrent = 1;
    })
    .await;

    let first = harness
        .supervisor
        .submit(SubmitRequest {
            query: "planet nine".into(),
            user_id: None,
            opt_in: false,
        })
        .await;
    let second = harness
        .supervisor
        .submit(SubmitRequest {
            query: "planet nine".into(),
            user_id: None,
            opt_in: false,
        })
        .await;

    // While the first task works, the second waits in the queue.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let s1 = harness.supervisor.poll(&first.task_id).await.unwrap();
    let s2 = harness.supervisor.poll(&second.task_id).await.unwrap();
    assert_eq!(s1.task_status, TaskStatus::InProgress);
    assert_eq!(s2.task_status, TaskStatus::Queued);

    // Both finish eventually.
    let f1 = wait_terminal(&harness.supervisor, &first.task_id).await;
    let f2 = wait_terminal(&harness.supervisor, &second.task_id).await;
    assert_eq!(f1.task_status, TaskStatus::Complete);
    assert_eq!(f2.task_status, TaskStatus::Complete);
}
