#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use scholar_harness::cache::SqliteCompletionCache;
use scholar_harness::config::{AppConfig, RerankService};
use scholar_harness::corpus::{HttpPaperIndex, HttpPaperIndexConfig};
use scholar_harness::gateway::{NoopUsageSink, ProviderGateway};
use scholar_harness::moderation::{HttpModerator, Moderator};
use scholar_harness::rerank::build_reranker;
use scholar_harness::state::TaskStatus;
use scholar_harness::supervisor::{SubmitRequest, TaskSupervisor};

#[derive(Parser)]
#[command(name = "scholarqa", version, about = "Scholar QA pipeline CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer one query end to end; JSON result on stdout
    Ask {
        /// The question to answer
        query: String,
        /// Primary model
        #[arg(long)]
        model: Option<String>,
        /// Fallback model (repeatable)
        #[arg(long)]
        fallback: Vec<String>,
        /// Reranker scoring endpoint
        #[arg(long)]
        rerank_endpoint: Option<String>,
        /// Enable the completion cache in this directory
        #[arg(long)]
        cache_dir: Option<PathBuf>,
        /// Directory for event traces
        #[arg(long)]
        trace_dir: Option<String>,
        /// Run the moderation check on the query
        #[arg(long)]
        validate: bool,
        /// Per-task timeout in seconds
        #[arg(long, default_value_t = 600)]
        timeout: u64,
        /// Write the result JSON here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Export the completion cache to JSONL
    CacheExport {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
    /// Prune the completion cache (by age and/or size)
    CachePrune {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        max_age_days: Option<u64>,
        #[arg(long)]
        max_rows: Option<usize>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("scholar_harness=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Ask {
            query,
            model,
            fallback,
            rerank_endpoint,
            cache_dir,
            trace_dir,
            validate,
            timeout,
            out,
        } => {
            let mut config = AppConfig::default();
            if let Some(model) = model {
                config.pipeline.llm = model;
            }
            if !fallback.is_empty() {
                config.pipeline.fallback_llm = fallback;
            }
            if let Some(endpoint) = rerank_endpoint {
                config.rerank.service = RerankService::RemoteHttp { endpoint };
            }
            if let Some(dir) = cache_dir {
                config.cache.enabled = true;
                config.cache.llm_cache_dir = dir;
            }
            if let Some(dir) = trace_dir {
                config.trace.location = dir;
            }
            config.pipeline.validate = validate;
            config.tasks.timeout = Duration::from_secs(timeout);

            let gateway = Arc::new(ProviderGateway::from_env(Arc::new(NoopUsageSink))?);
            let index = Arc::new(HttpPaperIndex::new(HttpPaperIndexConfig {
                api_key: std::env::var("S2_API_KEY").ok(),
                ..Default::default()
            })?);
            let reranker = build_reranker(&config.rerank)?;
            let moderator: Option<Arc<dyn Moderator>> = if validate {
                Some(Arc::new(HttpModerator::from_env()?))
            } else {
                None
            };

            let supervisor =
                TaskSupervisor::new(config, gateway, index, reranker, moderator)?;

            let state = supervisor
                .submit(SubmitRequest {
                    query,
                    user_id: Some("cli_user".to_string()),
                    opt_in: false,
                })
                .await;
            eprintln!("[scholarqa] task {} submitted", state.task_id);

            let mut seen_steps = 0usize;
            let final_state = loop {
                tokio::time::sleep(Duration::from_millis(500)).await;
                let Some(state) = supervisor.poll(&state.task_id).await else {
                    return Err("task disappeared from the result store".into());
                };
                for step in &state.steps[seen_steps..] {
                    eprintln!("[scholarqa] {}", step.description);
                }
                seen_steps = state.steps.len();
                if state.task_status.is_terminal() {
                    break state;
                }
            };

            match final_state.task_status {
                TaskStatus::Complete => {
                    let json = serde_json::to_string_pretty(&final_state)?;
                    match out {
                        Some(path) => std::fs::write(path, json)?,
                        None => println!("{json}"),
                    }
                    if let Some(result) = &final_state.task_result {
                        eprintln!(
                            "[scholarqa] {} sections, {} references, cost ${:.4}",
                            result.sections.len(),
                            result.references.len(),
                            result.cost.total_nanodollars as f64 / 1e9,
                        );
                    }
                }
                status => {
                    eprintln!(
                        "[scholarqa] task ended with status {status:?}: {}",
                        final_state.detail.as_deref().unwrap_or("no detail")
                    );
                    std::process::exit(2);
                }
            }
        }
        Commands::CacheExport { db, out } => {
            let cache = SqliteCompletionCache::new(&db)?;
            let _lock = cache.lock_exclusive()?;
            cache.export_jsonl(&out).await?;
            eprintln!("[scholarqa] exported cache to {}", out.display());
        }
        Commands::CachePrune {
            db,
            max_age_days,
            max_rows,
        } => {
            let cache = SqliteCompletionCache::new(&db)?;
            let stats = cache.prune(max_age_days, max_rows).await?;
            eprintln!(
                "[scholarqa] pruned {} rows, {} remaining",
                stats.deleted, stats.remaining
            );
        }
    }
    Ok(())
}
