//! Task supervisor.
//!
//! Accepts queries, enforces cross-task admission (`max_concurrent` with a
//! FIFO semaphore), drives the pipeline for each task, owns the status state
//! machine, cancellation and the per-task wall-clock deadline, and persists
//! the event trace. External pollers read the task state document from the
//! result store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::{CacheError, SqliteCompletionCache};
use crate::cancel::{CancelToken, Interrupt};
use crate::config::AppConfig;
use crate::corpus::PaperIndex;
use crate::gateway::{ChatGateway, RateLimitPolicy, RateLimiter};
use crate::llm::ModelClient;
use crate::moderation::{Moderator, Verdict};
use crate::paper_finder::PaperFinder;
use crate::pipeline::{PipelineError, QaPipeline};
use crate::rerank::Reranker;
use crate::state::{
    InMemoryResultStore, ResultStore, TaskState, TaskStatus, TaskStep,
};
use crate::trace::{
    build_trace_writer, persist_trace, EventTrace, FeedbackRecord, TraceError, TraceWriter,
};

// =============================================================================
// Requests
// =============================================================================

/// A task submission.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub query: String,
    pub user_id: Option<String>,
    /// Whether the query and response may be included in public releases.
    pub opt_in: bool,
}

/// Feedback on a finished (or running) task: free text, a reaction, or both.
#[derive(Debug, Clone)]
pub struct Feedback {
    pub task_id: String,
    pub user_id: Option<String>,
    pub text: Option<String>,
    /// +1 or -1.
    pub reaction: Option<i8>,
    /// Section title the feedback refers to, if any.
    pub section: Option<String>,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("unknown task: {0}")]
    UnknownTask(String),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("trace error: {0}")]
    Trace(#[from] TraceError),
}

// =============================================================================
// Supervisor
// =============================================================================

pub struct TaskSupervisor {
    pipeline: QaPipeline,
    store: Arc<dyn ResultStore>,
    trace_writer: Arc<dyn TraceWriter>,
    moderator: Option<Arc<dyn Moderator>>,
    admission: Arc<Semaphore>,
    config: Arc<AppConfig>,
    cancels: Mutex<HashMap<String, CancelToken>>,
}

impl TaskSupervisor {
    /// Assemble a supervisor from its external collaborators. The rate
    /// limiter, completion cache, result store and trace writer are built
    /// from the configuration.
    pub fn new(
        config: AppConfig,
        gateway: Arc<dyn ChatGateway>,
        index: Arc<dyn PaperIndex>,
        reranker: Arc<dyn Reranker>,
        moderator: Option<Arc<dyn Moderator>>,
    ) -> Result<Arc<Self>, SupervisorError> {
        let store: Arc<InMemoryResultStore> =
            Arc::new(InMemoryResultStore::new(config.tasks.result_ttl));
        store.spawn_sweeper(Duration::from_secs(60));
        let trace_writer: Arc<dyn TraceWriter> = Arc::from(build_trace_writer(&config.trace)?);
        Self::from_parts(config, gateway, index, reranker, moderator, store, trace_writer)
    }

    /// Assemble a supervisor with explicit store and trace backends.
    pub fn from_parts(
        config: AppConfig,
        gateway: Arc<dyn ChatGateway>,
        index: Arc<dyn PaperIndex>,
        reranker: Arc<dyn Reranker>,
        moderator: Option<Arc<dyn Moderator>>,
        store: Arc<dyn ResultStore>,
        trace_writer: Arc<dyn TraceWriter>,
    ) -> Result<Arc<Self>, SupervisorError> {
        let config = Arc::new(config);

        let limiter = Arc::new(RateLimiter::new(RateLimitPolicy {
            requests_per_minute: config.pipeline.rate_limit_rpm,
            input_tokens_per_minute: config.pipeline.rate_limit_itpm,
            output_tokens_per_minute: config.pipeline.rate_limit_otpm,
            max_wait: config.pipeline.rate_limit_max_wait,
        }));

        let cache = if config.cache.enabled {
            Some(Arc::new(SqliteCompletionCache::new(
                SqliteCompletionCache::default_path(&config.cache.llm_cache_dir),
            )?))
        } else {
            None
        };

        let client = Arc::new(ModelClient::new(gateway, limiter, cache));
        let finder = Arc::new(PaperFinder::new(
            index,
            reranker,
            config.retrieval.clone(),
            config.paper_finder.clone(),
        ));
        let pipeline = QaPipeline::new(client, finder, Arc::clone(&config));

        let admission = Arc::new(Semaphore::new(config.tasks.max_concurrent.max(1)));

        Ok(Arc::new(Self {
            pipeline,
            store,
            trace_writer,
            moderator,
            admission,
            config,
            cancels: Mutex::new(HashMap::new()),
        }))
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    /// Submit a query. Returns the initial task state document; the task
    /// runs in the background and is observed via [`TaskSupervisor::poll`].
    pub async fn submit(self: &Arc<Self>, req: SubmitRequest) -> TaskState {
        let task_id = Uuid::new_v4().to_string();
        let mut state = TaskState::new(&task_id, req.query.trim(), req.user_id.clone());
        info!(%task_id, "task submitted");

        // Malformed submissions fail before anything is spawned.
        if req.query.trim().is_empty() {
            state.task_status = TaskStatus::Failed;
            state.detail = Some("The query must not be empty.".to_string());
            self.store.put(state.clone()).await;
            return state;
        }

        self.store.put(state.clone()).await;

        let token = CancelToken::new();
        self.cancels
            .lock()
            .expect("cancel registry lock")
            .insert(task_id.clone(), token.clone());

        let supervisor = Arc::clone(self);
        let spawned_query = state.query.clone();
        let spawned_id = task_id.clone();
        tokio::spawn(async move {
            supervisor
                .run_task(spawned_id, spawned_query, req.user_id, req.opt_in, token)
                .await;
        });

        state
    }

    /// Current task state document.
    pub async fn poll(&self, task_id: &str) -> Option<TaskState> {
        self.store.get(task_id).await
    }

    /// Cooperatively cancel a task. Returns false for unknown task ids.
    pub fn cancel(&self, task_id: &str) -> bool {
        let cancels = self.cancels.lock().expect("cancel registry lock");
        match cancels.get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Record user feedback for a known task.
    pub async fn feedback(&self, feedback: Feedback) -> Result<String, SupervisorError> {
        if self.store.get(&feedback.task_id).await.is_none() {
            return Err(SupervisorError::UnknownTask(feedback.task_id));
        }
        let ack = Uuid::new_v4().to_string();
        let record = FeedbackRecord {
            task_id: feedback.task_id.clone(),
            user_id: feedback.user_id,
            text: feedback.text,
            reaction: feedback.reaction.map(|r| r.clamp(-1, 1)),
            section: feedback.section,
            timestamp: chrono::Utc::now(),
        };
        let key = format!("feedback/{}-{ack}.json", feedback.task_id);
        let document = serde_json::to_value(&record)
            .map_err(|e| SupervisorError::Trace(TraceError::Serde(e.to_string())))?;
        self.trace_writer.write_document(&key, &document).await?;
        Ok(ack)
    }

    // =========================================================================
    // Task execution
    // =========================================================================

    async fn run_task(
        self: Arc<Self>,
        task_id: String,
        query: String,
        user_id: Option<String>,
        opt_in: bool,
        token: CancelToken,
    ) {
        // FIFO admission: the permit bounds simultaneously-running tasks.
        let permit = match self.admission.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        // Cancelled while queued.
        if token.is_cancelled() {
            let _ = self
                .store
                .update_status(&task_id, TaskStatus::Cancelled, None)
                .await;
            self.forget(&task_id);
            drop(permit);
            return;
        }

        // The wall-clock deadline starts when processing starts.
        let deadline = Instant::now() + self.config.tasks.timeout;
        let cancel = token.child_with_deadline(deadline);

        if let Err(err) = self
            .store
            .update_status(&task_id, TaskStatus::InProgress, None)
            .await
        {
            warn!(%task_id, error = %err, "failed to start task");
            self.forget(&task_id);
            drop(permit);
            return;
        }
        let _ = self
            .store
            .append_step(
                &task_id,
                TaskStep::new("Processing user query", Duration::from_secs(5)),
            )
            .await;

        let mut trace = EventTrace::new(&task_id, &query, user_id.clone(), opt_in);

        // Moderation runs before any other external call.
        if self.config.pipeline.validate {
            if let Some(moderator) = &self.moderator {
                match moderator.classify(&query).await {
                    Ok(Verdict::Block { reason }) => {
                        info!(%task_id, %reason, "query blocked by moderation");
                        let _ = self.store.close_open_step(&task_id, Some(reason.clone())).await;
                        let _ = self
                            .store
                            .update_status(
                                &task_id,
                                TaskStatus::Failed,
                                Some("The query was flagged by content moderation.".to_string()),
                            )
                            .await;
                        trace.add_warning(format!("moderation block: {reason}"));
                        persist_trace(self.trace_writer.as_ref(), &trace).await;
                        self.forget(&task_id);
                        drop(permit);
                        return;
                    }
                    Ok(Verdict::Allow) => {}
                    Err(err) => {
                        warn!(%task_id, error = %err, "moderation check failed; allowing query");
                        trace.add_warning(format!("moderation check failed ({err}); allowed"));
                    }
                }
            }
        }

        let outcome = self
            .pipeline
            .run(&task_id, user_id.as_deref(), &query, &self.store, &mut trace, &cancel)
            .await;

        match outcome {
            Ok(result) => {
                let _ = self.store.close_open_step(&task_id, None).await;
                let _ = self.store.set_result(&task_id, result).await;
                let _ = self
                    .store
                    .update_status(&task_id, TaskStatus::Complete, None)
                    .await;
                info!(%task_id, "task complete");
            }
            Err(PipelineError::Interrupted(Interrupt::Cancelled)) => {
                // Partial results are discarded.
                let _ = self
                    .store
                    .close_open_step(&task_id, Some("cancelled".to_string()))
                    .await;
                let _ = self
                    .store
                    .update_status(&task_id, TaskStatus::Cancelled, None)
                    .await;
                trace.mark_interrupted("cancelled");
                info!(%task_id, "task cancelled");
            }
            Err(PipelineError::Interrupted(Interrupt::DeadlineExceeded)) => {
                let _ = self
                    .store
                    .close_open_step(&task_id, Some("timeout".to_string()))
                    .await;
                let _ = self
                    .store
                    .update_status(
                        &task_id,
                        TaskStatus::Failed,
                        Some(format!(
                            "The task timed out after {}s.",
                            self.config.tasks.timeout.as_secs()
                        )),
                    )
                    .await;
                trace.mark_interrupted("timeout");
                info!(%task_id, "task timed out");
            }
            Err(err) => {
                let detail = err.detail();
                let _ = self.store.close_open_step(&task_id, Some(err.to_string())).await;
                let _ = self
                    .store
                    .update_status(&task_id, TaskStatus::Failed, Some(detail))
                    .await;
                trace.add_warning(format!("fatal: {err}"));
                warn!(%task_id, error = %err, "task failed");
            }
        }

        persist_trace(self.trace_writer.as_ref(), &trace).await;
        self.forget(&task_id);
        drop(permit);
    }

    fn forget(&self, task_id: &str) {
        self.cancels
            .lock()
            .expect("cancel registry lock")
            .remove(task_id);
    }
}
