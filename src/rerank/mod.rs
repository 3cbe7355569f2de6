//! Reranker adapter.
//!
//! A reranker is a remote scoring function: given a query and a list of
//! passages it returns one relevance score per passage, aligned with input
//! order. The backend is configuration-driven; this crate ships HTTP
//! backends only (the model server itself is an external collaborator).

pub mod remote;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::cancel::{CancelToken, Interrupt};
use crate::config::{RerankConfig, RerankService};

pub use remote::RemoteHttpReranker;

#[derive(Debug, Error)]
pub enum RerankError {
    #[error("reranker timeout")]
    Timeout,
    #[error("reranker upstream error: HTTP {status}")]
    Upstream { status: u16, message: String },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("malformed reranker response: {0}")]
    Decode(String),
    #[error("interrupted")]
    Interrupted(Interrupt),
    #[error("reranker configuration error: {0}")]
    Config(String),
}

impl RerankError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Upstream { .. } => true,
            Self::Network(e) => e.is_timeout() || e.is_connect(),
            Self::Decode(_) | Self::Interrupted(_) | Self::Config(_) => false,
        }
    }
}

#[async_trait]
pub trait Reranker: Send + Sync {
    /// Score `passages` against `query`. The returned vector is aligned 1:1
    /// with the input order.
    async fn score(
        &self,
        query: &str,
        passages: &[String],
        cancel: &CancelToken,
    ) -> Result<Vec<f64>, RerankError>;
}

/// Build the configured reranker backend.
///
/// The in-process variants are part of the recognized configuration surface
/// but no model is bundled in this build; selecting one is a configuration
/// error rather than a silent stub.
pub fn build_reranker(config: &RerankConfig) -> Result<Arc<dyn Reranker>, RerankError> {
    match &config.service {
        RerankService::RemoteHttp { endpoint } => Ok(Arc::new(RemoteHttpReranker::new(
            endpoint.clone(),
            None,
            config.client_timeout,
            config.batch_size,
            config.max_inflight,
        )?)),
        RerankService::ModalLike {
            endpoint,
            auth_token,
        } => Ok(Arc::new(RemoteHttpReranker::new(
            endpoint.clone(),
            auth_token.clone(),
            config.client_timeout,
            config.batch_size,
            config.max_inflight,
        )?)),
        RerankService::InProcessCrossEncoder { .. }
        | RerankService::InProcessBiEncoder { .. }
        | RerankService::InProcessFlag { .. } => Err(RerankError::Config(
            "in-process reranker models are not bundled in this build; \
             configure rerank.service = remote_http or modal_like"
                .into(),
        )),
    }
}
