//! Minimal end-to-end run: submit one query against live services and print
//! the section titles as they arrive.
//!
//! Requires OPENROUTER_API_KEY plus a running reranker endpoint:
//!
//! ```sh
//! RERANK_ENDPOINT=http://localhost:8000/rerank \
//!   cargo run --example quickstart -- "What is retrieval-augmented generation?"
//! ```

use std::sync::Arc;
use std::time::Duration;

use scholar_harness::config::{AppConfig, RerankService};
use scholar_harness::corpus::{HttpPaperIndex, HttpPaperIndexConfig};
use scholar_harness::gateway::{NoopUsageSink, ProviderGateway};
use scholar_harness::rerank::build_reranker;
use scholar_harness::supervisor::{SubmitRequest, TaskSupervisor};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let query = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "What is retrieval-augmented generation?".to_string());

    let mut config = AppConfig::default();
    if let Ok(endpoint) = std::env::var("RERANK_ENDPOINT") {
        config.rerank.service = RerankService::RemoteHttp { endpoint };
    }

    let gateway = Arc::new(ProviderGateway::from_env(Arc::new(NoopUsageSink))?);
    let index = Arc::new(HttpPaperIndex::new(HttpPaperIndexConfig::default())?);
    let reranker = build_reranker(&config.rerank)?;
    let supervisor = TaskSupervisor::new(config, gateway, index, reranker, None)?;

    let state = supervisor
        .submit(SubmitRequest {
            query,
            user_id: None,
            opt_in: false,
        })
        .await;
    println!("submitted task {}", state.task_id);

    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let state = supervisor.poll(&state.task_id).await.expect("task exists");
        if let Some(step) = state.steps.last() {
            println!("  {}", step.description);
        }
        if state.task_status.is_terminal() {
            if let Some(result) = state.task_result {
                for section in result.sections {
                    println!(
                        "== {} ({} citations)",
                        section.title,
                        section.citations.len()
                    );
                }
            } else {
                println!("ended: {:?} — {:?}", state.task_status, state.detail);
            }
            break;
        }
    }
    Ok(())
}
