//! Task state: wire types and the result store.
//!
//! The task state document is wire-stable; external pollers read it as-is.
//! The [`ResultStore`] trait keeps the core independent of the storage
//! backend; the in-memory default validates status transitions and evicts
//! expired records with a background sweeper.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::corpus::PaperRecord;
use crate::llm::Completion;
use crate::pipeline::outline::SectionFormat;

// =============================================================================
// Status
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    InProgress,
    Complete,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Complete | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Valid transitions of the task state machine.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, InProgress)
                | (Queued, Cancelled)
                | (Queued, Failed)
                | (InProgress, Complete)
                | (InProgress, Failed)
                | (InProgress, Cancelled)
        )
    }
}

// =============================================================================
// Steps
// =============================================================================

/// One progress step. Steps are append-only; at most one step per task lacks
/// an end timestamp at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStep {
    pub description: String,
    pub start_timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskStep {
    pub fn new(description: impl Into<String>, estimated: Duration) -> Self {
        let now = Utc::now();
        Self {
            description: description.into(),
            start_timestamp: now,
            estimated_timestamp: chrono::Duration::from_std(estimated)
                .ok()
                .map(|d| now + d),
            end_timestamp: None,
            error: None,
        }
    }
}

// =============================================================================
// Result payload
// =============================================================================

/// A resolved citation: marker id plus the cited paper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    /// The inline marker's id, i.e. the reference number as text.
    pub id: String,
    pub paper: PaperRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableColumn {
    pub id: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRow {
    pub id: String,
    pub corpus_id: String,
    pub display_value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableCell {
    pub display_value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
}

/// Comparison table for a list-formatted section.
///
/// Cells are keyed `"{row_id}_{column_id}"`; every (row, column) pair has an
/// entry, with missing values as "N/A".
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TableWidget {
    pub columns: Vec<TableColumn>,
    pub rows: Vec<TableRow>,
    pub cells: BTreeMap<String, TableCell>,
}

impl TableWidget {
    pub fn cell_key(row_id: &str, column_id: &str) -> String {
        format!("{row_id}_{column_id}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedSection {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tldr: Option<String>,
    pub format: SectionFormat,
    /// Section prose containing inline citation markers like `[3]`.
    pub text: String,
    pub citations: Vec<Citation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<TableWidget>,
}

/// Per-model usage aggregated over a task.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelCost {
    pub model: String,
    pub calls: u64,
    pub cached_calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_nanodollars: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CostRecord {
    pub models: Vec<ModelCost>,
    pub total_nanodollars: i64,
}

impl CostRecord {
    /// Aggregate completion usage per model. Cached calls count toward call
    /// totals and carry their original cost record.
    pub fn from_completions(completions: &[Completion]) -> Self {
        let mut by_model: BTreeMap<String, ModelCost> = BTreeMap::new();
        for c in completions {
            let entry = by_model.entry(c.model.clone()).or_insert_with(|| ModelCost {
                model: c.model.clone(),
                ..Default::default()
            });
            entry.calls += 1;
            if c.cached {
                entry.cached_calls += 1;
            }
            entry.input_tokens += c.input_tokens as u64;
            entry.output_tokens += c.output_tokens as u64;
            entry.cost_nanodollars += c.cost_nanodollars;
        }
        let total_nanodollars = by_model.values().map(|m| m.cost_nanodollars).sum();
        Self {
            models: by_model.into_values().collect(),
            total_nanodollars,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TimingRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub total_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub sections: Vec<GeneratedSection>,
    /// Every paper cited anywhere in the result, reference order.
    pub references: Vec<PaperRecord>,
    pub cost: CostRecord,
    pub timing: TimingRecord,
}

// =============================================================================
// Task state document
// =============================================================================

/// The wire-stable task state document returned to pollers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub task_id: String,
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub task_status: TaskStatus,
    /// Human-readable estimate for the whole task, e.g. "~3 minutes".
    pub estimated_time: String,
    pub steps: Vec<TaskStep>,
    pub task_result: Option<TaskResult>,
    /// Failure message, present when the task failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskState {
    pub fn new(task_id: impl Into<String>, query: impl Into<String>, user_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            query: query.into(),
            user_id,
            task_status: TaskStatus::Queued,
            estimated_time: "~3 minutes".to_string(),
            steps: Vec::new(),
            task_result: None,
            detail: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// =============================================================================
// Store
// =============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown task: {0}")]
    UnknownTask(String),
    #[error("invalid status transition: {from:?} -> {to:?}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
}

/// Keyed task state storage, safe for concurrent supervisor updates.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn put(&self, state: TaskState);

    async fn get(&self, task_id: &str) -> Option<TaskState>;

    /// Transition the task's status, validating against the state machine.
    /// A `detail` message is recorded for failures.
    async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        detail: Option<String>,
    ) -> Result<(), StoreError>;

    /// Close any open step and append a new one.
    async fn append_step(&self, task_id: &str, step: TaskStep) -> Result<(), StoreError>;

    /// Close the open step, optionally with an error message.
    async fn close_open_step(&self, task_id: &str, error: Option<String>)
        -> Result<(), StoreError>;

    async fn set_result(&self, task_id: &str, result: TaskResult) -> Result<(), StoreError>;

    async fn set_estimated_time(&self, task_id: &str, estimate: String) -> Result<(), StoreError>;
}

/// In-memory store with TTL-based eviction of terminal records.
pub struct InMemoryResultStore {
    tasks: RwLock<HashMap<String, TaskState>>,
    ttl: Duration,
}

impl InMemoryResultStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Background sweeper removing expired terminal records.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                store.sweep().await;
            }
        })
    }

    /// Remove terminal records older than the TTL. Returns how many were
    /// evicted.
    pub async fn sweep(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::hours(24));
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, state| !(state.task_status.is_terminal() && state.updated_at < cutoff));
        let evicted = before - tasks.len();
        if evicted > 0 {
            debug!(evicted, "result store sweep");
        }
        evicted
    }

    async fn with_task<F>(&self, task_id: &str, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut TaskState) -> Result<(), StoreError>,
    {
        let mut tasks = self.tasks.write().await;
        let state = tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::UnknownTask(task_id.to_string()))?;
        f(state)?;
        state.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn put(&self, state: TaskState) {
        let mut tasks = self.tasks.write().await;
        tasks.insert(state.task_id.clone(), state);
    }

    async fn get(&self, task_id: &str) -> Option<TaskState> {
        let tasks = self.tasks.read().await;
        tasks.get(task_id).cloned()
    }

    async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        detail: Option<String>,
    ) -> Result<(), StoreError> {
        self.with_task(task_id, |state| {
            if !state.task_status.can_transition_to(status) {
                return Err(StoreError::InvalidTransition {
                    from: state.task_status,
                    to: status,
                });
            }
            state.task_status = status;
            if detail.is_some() {
                state.detail = detail;
            }
            Ok(())
        })
        .await
    }

    async fn append_step(&self, task_id: &str, step: TaskStep) -> Result<(), StoreError> {
        self.with_task(task_id, |state| {
            let now = Utc::now();
            for open in state.steps.iter_mut().filter(|s| s.end_timestamp.is_none()) {
                open.end_timestamp = Some(now);
            }
            state.steps.push(step);
            Ok(())
        })
        .await
    }

    async fn close_open_step(
        &self,
        task_id: &str,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        self.with_task(task_id, |state| {
            let now = Utc::now();
            for open in state.steps.iter_mut().filter(|s| s.end_timestamp.is_none()) {
                open.end_timestamp = Some(now);
                if open.error.is_none() {
                    open.error = error.clone();
                }
            }
            Ok(())
        })
        .await
    }

    async fn set_result(&self, task_id: &str, result: TaskResult) -> Result<(), StoreError> {
        self.with_task(task_id, |state| {
            state.task_result = Some(result);
            Ok(())
        })
        .await
    }

    async fn set_estimated_time(&self, task_id: &str, estimate: String) -> Result<(), StoreError> {
        self.with_task(task_id, |state| {
            state.estimated_time = estimate;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_follow_state_machine() {
        use TaskStatus::*;
        assert!(Queued.can_transition_to(InProgress));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(InProgress.can_transition_to(Complete));
        assert!(InProgress.can_transition_to(Failed));
        assert!(!Complete.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(InProgress));
        assert!(!Queued.can_transition_to(Complete));
    }

    #[tokio::test]
    async fn append_step_closes_previous_open_step() {
        let store = InMemoryResultStore::new(Duration::from_secs(60));
        store.put(TaskState::new("t1", "q", None)).await;
        store
            .append_step("t1", TaskStep::new("first", Duration::from_secs(5)))
            .await
            .unwrap();
        store
            .append_step("t1", TaskStep::new("second", Duration::from_secs(5)))
            .await
            .unwrap();

        let state = store.get("t1").await.unwrap();
        assert_eq!(state.steps.len(), 2);
        assert!(state.steps[0].end_timestamp.is_some());
        assert!(state.steps[1].end_timestamp.is_none());
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected() {
        let store = InMemoryResultStore::new(Duration::from_secs(60));
        store.put(TaskState::new("t1", "q", None)).await;
        store
            .update_status("t1", TaskStatus::InProgress, None)
            .await
            .unwrap();
        store
            .update_status("t1", TaskStatus::Complete, None)
            .await
            .unwrap();
        let err = store
            .update_status("t1", TaskStatus::Failed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[test]
    fn task_state_document_round_trips() {
        let mut state = TaskState::new("t1", "what is planet nine?", Some("u1".into()));
        state.task_status = TaskStatus::InProgress;
        state.steps.push(TaskStep::new("first", Duration::from_secs(5)));
        state.steps.push(TaskStep::new("second", Duration::from_secs(10)));

        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains(r#""task_status":"in_progress""#));

        let parsed: TaskState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.task_id, "t1");
        assert_eq!(parsed.task_status, TaskStatus::InProgress);
        assert_eq!(parsed.steps.len(), 2);
        assert_eq!(parsed.steps[0].description, "first");
        assert!(parsed.task_result.is_none());
    }

    #[tokio::test]
    async fn sweep_evicts_expired_terminal_records() {
        let store = InMemoryResultStore::new(Duration::from_secs(0));
        let mut done = TaskState::new("done", "q", None);
        done.task_status = TaskStatus::Complete;
        done.updated_at = Utc::now() - chrono::Duration::seconds(10);
        store.put(done).await;
        store.put(TaskState::new("running", "q", None)).await;

        let evicted = store.sweep().await;
        assert_eq!(evicted, 1);
        assert!(store.get("done").await.is_none());
        assert!(store.get("running").await.is_some());
    }
}
