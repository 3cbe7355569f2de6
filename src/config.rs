//! Configuration for the question-answering pipeline.
//!
//! One explicit record per concern, assembled into [`AppConfig`]. Parsing a
//! configuration file is the embedding application's job; this crate only
//! defines the recognized options and their defaults.

use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// Retrieval
// =============================================================================

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// Passage-level results requested from snippet search.
    pub n_retrieval: usize,
    /// Paper-level results requested from keyword search.
    pub n_keyword_srch: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            n_retrieval: 256,
            n_keyword_srch: 20,
        }
    }
}

// =============================================================================
// Reranking
// =============================================================================

/// Which reranker backend to build. The in-process variants are recognized
/// for configuration compatibility but this build does not bundle a model;
/// selecting one fails at construction with a configuration error.
#[derive(Debug, Clone)]
pub enum RerankService {
    /// Plain HTTP scoring endpoint: POST {query, passages} -> {scores}.
    RemoteHttp { endpoint: String },
    /// Serverless GPU endpoint (modal-style): same contract, token auth.
    ModalLike {
        endpoint: String,
        auth_token: Option<String>,
    },
    InProcessCrossEncoder { model_path: PathBuf },
    InProcessBiEncoder { model_path: PathBuf },
    InProcessFlag { model_path: PathBuf },
}

#[derive(Debug, Clone)]
pub struct RerankConfig {
    pub service: RerankService,
    /// Per-call timeout for one score batch.
    pub client_timeout: Duration,
    /// Passages per scoring request.
    pub batch_size: usize,
    /// Maximum score batches in flight at once.
    pub max_inflight: usize,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            service: RerankService::RemoteHttp {
                endpoint: "http://localhost:8000/rerank".into(),
            },
            client_timeout: Duration::from_millis(30_000),
            batch_size: 32,
            max_inflight: 4,
        }
    }
}

// =============================================================================
// Paper finder
// =============================================================================

#[derive(Debug, Clone)]
pub struct PaperFinderConfig {
    /// Papers retained after rerank + aggregation (0 = unbounded).
    pub n_rerank: usize,
    /// Passages with a rerank score below this are dropped.
    pub context_threshold: f64,
    /// Top passages kept per paper when building the merged text.
    pub passages_per_paper: usize,
}

impl Default for PaperFinderConfig {
    fn default() -> Self {
        Self {
            n_rerank: 50,
            context_threshold: 0.3,
            passages_per_paper: 8,
        }
    }
}

// =============================================================================
// Pipeline / models
// =============================================================================

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Primary model for extraction, planning and synthesis.
    pub llm: String,
    /// Ordered fallbacks tried when the primary fails or is rate limited.
    pub fallback_llm: Vec<String>,
    /// Model for query decomposition (defaults to `llm`).
    pub decomposer_llm: Option<String>,
    /// Model for table generation (defaults to `llm`).
    pub tables_llm: Option<String>,
    /// Bound on concurrent model calls within a fan-out stage.
    pub max_llm_workers: usize,
    pub rate_limit_rpm: u32,
    pub rate_limit_itpm: u32,
    pub rate_limit_otpm: u32,
    /// Wait budget for a rate-limit acquire before falling back.
    pub rate_limit_max_wait: Duration,
    /// Run the moderation check on incoming queries.
    pub validate: bool,
    /// Previous-section context carried into synthesis, in characters.
    pub prior_context_chars: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            llm: "anthropic/claude-3-5-sonnet".into(),
            fallback_llm: vec!["openai/gpt-4o".into()],
            decomposer_llm: None,
            tables_llm: None,
            max_llm_workers: 20,
            rate_limit_rpm: 100,
            rate_limit_itpm: 200_000,
            rate_limit_otpm: 80_000,
            rate_limit_max_wait: Duration::from_secs(30),
            validate: false,
            prior_context_chars: 8_000,
        }
    }
}

// =============================================================================
// Tables
// =============================================================================

#[derive(Debug, Clone)]
pub struct TableConfig {
    /// List sections with fewer cited papers than this get no table.
    pub min_rows: usize,
    pub max_rows: usize,
    pub max_columns: usize,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            min_rows: 3,
            max_rows: 10,
            max_columns: 6,
        }
    }
}

// =============================================================================
// Tasks
// =============================================================================

#[derive(Debug, Clone)]
pub struct TasksConfig {
    /// Tasks processed simultaneously; the rest queue FIFO.
    pub max_concurrent: usize,
    /// Per-task wall-clock timeout.
    pub timeout: Duration,
    /// How long finished task records are retained before eviction.
    pub result_ttl: Duration,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            timeout: Duration::from_secs(600),
            result_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

// =============================================================================
// Traces & cache
// =============================================================================

#[derive(Debug, Clone)]
pub enum TraceMode {
    /// One JSON file per task under a local directory.
    Local,
    /// HTTP PUT of the per-task document to an object-store endpoint.
    ObjectStore,
}

#[derive(Debug, Clone)]
pub struct TraceConfig {
    pub mode: TraceMode,
    /// Local directory or object-store base URL, per `mode`.
    pub location: String,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            mode: TraceMode::Local,
            location: "logs/event_traces".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub llm_cache_dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            llm_cache_dir: PathBuf::from("llm_cache"),
        }
    }
}

// =============================================================================
// Top level
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub retrieval: RetrievalConfig,
    pub rerank: RerankConfig,
    pub paper_finder: PaperFinderConfig,
    pub pipeline: PipelineConfig,
    pub tables: TableConfig,
    pub tasks: TasksConfig,
    pub trace: TraceConfig,
    pub cache: CacheConfig,
}

impl AppConfig {
    /// Model used for query decomposition.
    pub fn decomposer_model(&self) -> &str {
        self.pipeline
            .decomposer_llm
            .as_deref()
            .unwrap_or(&self.pipeline.llm)
    }

    /// Model used for table generation.
    pub fn tables_model(&self) -> &str {
        self.pipeline
            .tables_llm
            .as_deref()
            .unwrap_or(&self.pipeline.llm)
    }
}
