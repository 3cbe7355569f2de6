#![forbid(unsafe_code)]

//! # scholar-harness
//!
//! Citation-grounded question answering over a large scientific paper corpus.
//!
//! A query is decomposed into retrieval parameters, candidate passages are
//! retrieved and reranked, and a bounded fan-out of language-model calls
//! extracts per-paper evidence, clusters it into an outline, and synthesizes
//! each section, with an optional comparison table per list-typed section.
//! The whole pipeline runs under process-wide rate limits and per-task
//! deadlines, emits pollable progress steps, and degrades gracefully when an
//! external service misbehaves.
//!
//! The entry point is [`supervisor::TaskSupervisor`]: submit a query, poll the
//! task state document, read the final sections with their citations.

pub mod cache;
pub mod cancel;
pub mod citation;
pub mod config;
pub mod corpus;
pub mod gateway;
pub mod llm;
pub mod moderation;
pub mod paper_finder;
pub mod pipeline;
pub mod prompts;
pub mod rerank;
pub mod state;
pub mod supervisor;
pub mod tokens;
pub mod trace;

pub use cancel::CancelToken;
pub use config::AppConfig;
pub use gateway::{ChatGateway, ProviderGateway, RateLimiter, UsageSink};
pub use llm::{ModelClient, ModelError, ModelLadder};
pub use state::{ResultStore, TaskState, TaskStatus};
pub use supervisor::{SubmitRequest, TaskSupervisor};
