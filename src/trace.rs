//! Per-task event traces.
//!
//! An append-only log of stage records (inputs summarized, structured
//! outputs, duration, cost) accumulated while a task runs and persisted as
//! one JSON document per task. Persistence is best-effort: a trace failure
//! must never fail the task.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::config::{TraceConfig, TraceMode};

// =============================================================================
// Trace document
// =============================================================================

/// One stage's record in the event trace.
#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub stage: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub cost_nanodollars: i64,
    /// Summarized inputs, not the full payload.
    pub input_summary: String,
    /// Structured stage output.
    pub output: serde_json::Value,
}

/// The per-task event trace document.
#[derive(Debug, Serialize)]
pub struct EventTrace {
    pub task_id: String,
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub opt_in: bool,
    pub created_at: DateTime<Utc>,
    pub stages: Vec<StageRecord>,
    pub warnings: Vec<String>,
    /// Present when the task was cancelled or timed out mid-flight.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interruption: Option<String>,
    pub total_cost_nanodollars: i64,
}

impl EventTrace {
    pub fn new(task_id: impl Into<String>, query: impl Into<String>, user_id: Option<String>, opt_in: bool) -> Self {
        Self {
            task_id: task_id.into(),
            query: query.into(),
            user_id,
            opt_in,
            created_at: Utc::now(),
            stages: Vec::new(),
            warnings: Vec::new(),
            interruption: None,
            total_cost_nanodollars: 0,
        }
    }

    /// Append one stage record.
    pub fn record_stage(
        &mut self,
        stage: &str,
        started_at: DateTime<Utc>,
        cost_nanodollars: i64,
        input_summary: impl Into<String>,
        output: serde_json::Value,
    ) {
        let ended_at = Utc::now();
        let duration_ms = (ended_at - started_at).num_milliseconds().max(0) as u64;
        self.stages.push(StageRecord {
            stage: stage.to_string(),
            started_at,
            ended_at,
            duration_ms,
            cost_nanodollars,
            input_summary: input_summary.into(),
            output,
        });
        self.total_cost_nanodollars += cost_nanodollars;
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn add_warnings<I: IntoIterator<Item = String>>(&mut self, warnings: I) {
        self.warnings.extend(warnings);
    }

    /// Mark the trace as ending early; the partial record is still persisted.
    pub fn mark_interrupted(&mut self, reason: impl Into<String>) {
        self.interruption = Some(reason.into());
    }
}

/// A feedback submission, appended next to the traces.
#[derive(Debug, Serialize)]
pub struct FeedbackRecord {
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// +1 or -1 when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reaction: Option<i8>,
    /// Section title the feedback refers to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Writers
// =============================================================================

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("object store error: HTTP {0}")]
    ObjectStore(u16),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("task join error: {0}")]
    Join(String),
}

/// Pluggable trace backend. Keys are relative paths like `"<task_id>.json"`.
#[async_trait]
pub trait TraceWriter: Send + Sync {
    async fn write_document(&self, key: &str, document: &serde_json::Value)
        -> Result<(), TraceError>;
}

/// Writes one JSON file per document under a local directory.
pub struct LocalTraceWriter {
    dir: PathBuf,
}

impl LocalTraceWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl TraceWriter for LocalTraceWriter {
    async fn write_document(
        &self,
        key: &str,
        document: &serde_json::Value,
    ) -> Result<(), TraceError> {
        let path = self.dir.join(key);
        let body = serde_json::to_vec_pretty(document).map_err(|e| TraceError::Serde(e.to_string()))?;
        tokio::task::spawn_blocking(move || -> Result<(), TraceError> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, body)?;
            Ok(())
        })
        .await
        .map_err(|e| TraceError::Join(e.to_string()))?
    }
}

/// PUTs the per-task document to an object-store endpoint with the same key
/// layout.
pub struct ObjectStoreTraceWriter {
    client: reqwest::Client,
    base_url: String,
}

impl ObjectStoreTraceWriter {
    pub fn new(base_url: impl Into<String>) -> Result<Self, TraceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl TraceWriter for ObjectStoreTraceWriter {
    async fn write_document(
        &self,
        key: &str,
        document: &serde_json::Value,
    ) -> Result<(), TraceError> {
        let url = format!("{}/{key}", self.base_url.trim_end_matches('/'));
        let response = self.client.put(url).json(document).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TraceError::ObjectStore(status.as_u16()));
        }
        Ok(())
    }
}

/// Build the configured trace writer.
pub fn build_trace_writer(config: &TraceConfig) -> Result<Box<dyn TraceWriter>, TraceError> {
    match config.mode {
        TraceMode::Local => Ok(Box::new(LocalTraceWriter::new(config.location.clone()))),
        TraceMode::ObjectStore => Ok(Box::new(ObjectStoreTraceWriter::new(
            config.location.clone(),
        )?)),
    }
}

/// Persist a finished trace, best-effort.
pub async fn persist_trace(writer: &dyn TraceWriter, trace: &EventTrace) {
    let key = format!("{}.json", trace.task_id);
    match serde_json::to_value(trace) {
        Ok(document) => {
            if let Err(err) = writer.write_document(&key, &document).await {
                warn!(task_id = %trace.task_id, error = %err, "trace persistence failed");
            }
        }
        Err(err) => {
            warn!(task_id = %trace.task_id, error = %err, "trace serialization failed");
        }
    }
}
