//! Paper index adapter.
//!
//! Narrow client for the external paper corpus: passage-level snippet
//! search, paper-level keyword search, and batch metadata lookup. Metadata
//! is cached across tasks with an independent TTL; everything else is
//! per-call and idempotent.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

// =============================================================================
// Data model
// =============================================================================

/// Where in a paper a snippet came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnippetKind {
    Abstract,
    Body,
    Title,
    Other,
}

impl SnippetKind {
    fn from_api(kind: &str) -> Self {
        match kind {
            "abstract" => SnippetKind::Abstract,
            "body" => SnippetKind::Body,
            "title" => SnippetKind::Title,
            _ => SnippetKind::Other,
        }
    }
}

/// A candidate passage returned by retrieval.
///
/// Keyed by (corpus_id, offsets): snippets are unique per paper location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Passage {
    pub corpus_id: String,
    pub text: String,
    pub section_title: Option<String>,
    pub kind: SnippetKind,
    /// Retrieval score from the index.
    pub score: f64,
    pub char_start: Option<usize>,
    pub char_end: Option<usize>,
}

impl Passage {
    /// Dedup key: paper location.
    pub fn location_key(&self) -> (String, Option<usize>, Option<usize>) {
        (self.corpus_id.clone(), self.char_start, self.char_end)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    #[serde(default)]
    pub author_id: Option<String>,
}

/// Paper metadata, immutable once fetched within a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperRecord {
    pub corpus_id: String,
    pub title: String,
    #[serde(default)]
    pub authors: Vec<Author>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub venue: Option<String>,
    #[serde(default)]
    pub citation_count: i64,
    #[serde(default)]
    pub influential_citation_count: i64,
    #[serde(default)]
    pub open_access: Option<bool>,
    #[serde(default)]
    pub abstract_text: Option<String>,
}

impl PaperRecord {
    /// Short author reference like "Smith et al." for citation strings.
    pub fn ref_author_str(&self) -> String {
        match self.authors.len() {
            0 => "Unknown".to_string(),
            1 => self.authors[0].name.clone(),
            2 => format!("{} and {}", self.authors[0].name, self.authors[1].name),
            _ => format!("{} et al.", self.authors[0].name),
        }
    }
}

/// Structured retrieval filters extracted from the query.
///
/// The year range is half-open: `[year_start, year_end)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SearchFilters {
    pub year_start: Option<i32>,
    pub year_end: Option<i32>,
    pub venues: BTreeSet<String>,
    pub authors: BTreeSet<String>,
    pub fields_of_study: BTreeSet<String>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.year_start.is_none()
            && self.year_end.is_none()
            && self.venues.is_empty()
            && self.authors.is_empty()
            && self.fields_of_study.is_empty()
    }

    /// Render the half-open year range as the index's inclusive "start-end"
    /// parameter.
    fn year_param(&self) -> Option<String> {
        match (self.year_start, self.year_end) {
            (None, None) => None,
            (Some(start), None) => Some(format!("{start}-")),
            (None, Some(end)) => Some(format!("-{}", end - 1)),
            (Some(start), Some(end)) => Some(format!("{start}-{}", end - 1)),
        }
    }

    fn apply(&self, params: &mut Vec<(String, String)>) {
        if let Some(year) = self.year_param() {
            params.push(("year".into(), year));
        }
        if !self.venues.is_empty() {
            params.push((
                "venue".into(),
                self.venues.iter().cloned().collect::<Vec<_>>().join(","),
            ));
        }
        if !self.fields_of_study.is_empty() {
            params.push((
                "fieldsOfStudy".into(),
                self.fields_of_study
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(","),
            ));
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("not found")]
    NotFound,
    #[error("throttled by paper index")]
    Throttled,
    #[error("paper index upstream error: HTTP {status}")]
    Upstream { status: u16, message: String },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("malformed index response: {0}")]
    Decode(String),
}

impl IndexError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Throttled => true,
            Self::Upstream { .. } => true,
            Self::Network(e) => e.is_timeout() || e.is_connect(),
            Self::NotFound | Self::Decode(_) => false,
        }
    }
}

// =============================================================================
// Trait
// =============================================================================

#[async_trait]
pub trait PaperIndex: Send + Sync {
    /// Passage-level search over the full-text index.
    async fn snippet_search(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<Passage>, IndexError>;

    /// Paper-level keyword search; results carry metadata and abstracts.
    async fn keyword_search(
        &self,
        keyword_query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<PaperRecord>, IndexError>;

    /// Batch metadata lookup by corpus id.
    async fn fetch_metadata(
        &self,
        corpus_ids: &[String],
    ) -> Result<HashMap<String, PaperRecord>, IndexError>;
}

// =============================================================================
// HTTP implementation
// =============================================================================

/// Metadata fields requested from the index.
const METADATA_FIELDS: &str =
    "corpusId,title,year,venue,authors,citationCount,influentialCitationCount,isOpenAccess,abstract";

/// Snippets shorter than this many words are noise and dropped.
const MIN_SNIPPET_WORDS: usize = 20;

/// Batch size for metadata lookups.
const METADATA_BATCH: usize = 100;

#[derive(Debug, Clone)]
pub struct HttpPaperIndexConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// TTL for the cross-task metadata cache.
    pub metadata_ttl: Duration,
}

impl Default for HttpPaperIndexConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.semanticscholar.org/graph/v1".into(),
            api_key: None,
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            metadata_ttl: Duration::from_secs(3600),
        }
    }
}

pub struct HttpPaperIndex {
    client: reqwest::Client,
    config: HttpPaperIndexConfig,
    metadata_cache: Mutex<HashMap<String, (Instant, PaperRecord)>>,
}

impl HttpPaperIndex {
    pub fn new(config: HttpPaperIndexConfig) -> Result<Self, IndexError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &config.api_key {
            if let Ok(v) = HeaderValue::from_str(key) {
                headers.insert("x-api-key", v);
            }
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .gzip(true)
            .build()?;
        Ok(Self {
            client,
            config,
            metadata_cache: Mutex::new(HashMap::new()),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<T, IndexError> {
        let url = format!("{}/{path}", self.config.base_url);
        let mut attempt = 0u32;
        loop {
            let result = self.get_json_once(&url, params).await;
            match result {
                Ok(v) => return Ok(v),
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.config.retry_base_delay * 2u32.pow(attempt.min(5));
                    debug!(?err, attempt, "paper index retry");
                    attempt += 1;
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn get_json_once<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        params: &[(String, String)],
    ) -> Result<T, IndexError> {
        let response = self.client.get(url).query(params).send().await?;
        Self::decode_response(response).await
    }

    async fn post_json<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(String, String)],
        body: &B,
    ) -> Result<T, IndexError> {
        let url = format!("{}/{path}", self.config.base_url);
        let mut attempt = 0u32;
        loop {
            let result = async {
                let response = self
                    .client
                    .post(&url)
                    .query(params)
                    .json(body)
                    .send()
                    .await?;
                Self::decode_response(response).await
            }
            .await;
            match result {
                Ok(v) => return Ok(v),
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.config.retry_base_delay * 2u32.pow(attempt.min(5));
                    debug!(?err, attempt, "paper index retry");
                    attempt += 1;
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn decode_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, IndexError> {
        let status = response.status();
        match status.as_u16() {
            404 => return Err(IndexError::NotFound),
            429 => return Err(IndexError::Throttled),
            s if s >= 500 => {
                let message = response.text().await.unwrap_or_default();
                return Err(IndexError::Upstream { status: s, message });
            }
            s if !status.is_success() => {
                let message = response.text().await.unwrap_or_default();
                return Err(IndexError::Decode(format!("HTTP {s}: {message}")));
            }
            _ => {}
        }
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| IndexError::Decode(e.to_string()))
    }
}

// =============================================================================
// API payloads
// =============================================================================

#[derive(Deserialize)]
struct SnippetSearchResponse {
    data: Option<Vec<SnippetHit>>,
}

#[derive(Deserialize)]
struct SnippetHit {
    snippet: Option<ApiSnippet>,
    paper: Option<ApiSnippetPaper>,
    score: Option<f64>,
    section: Option<String>,
}

#[derive(Deserialize)]
struct ApiSnippet {
    text: Option<String>,
    #[serde(rename = "snippetKind")]
    snippet_kind: Option<String>,
    #[serde(rename = "snippetOffset")]
    snippet_offset: Option<ApiOffset>,
}

#[derive(Deserialize)]
struct ApiOffset {
    start: Option<usize>,
    end: Option<usize>,
}

#[derive(Deserialize)]
struct ApiSnippetPaper {
    #[serde(rename = "corpusId")]
    corpus_id: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct PaperSearchResponse {
    data: Option<Vec<ApiPaper>>,
}

#[derive(Deserialize)]
struct ApiPaper {
    #[serde(rename = "corpusId")]
    corpus_id: Option<serde_json::Value>,
    title: Option<String>,
    year: Option<i32>,
    venue: Option<String>,
    #[serde(default)]
    authors: Vec<ApiAuthor>,
    #[serde(rename = "citationCount")]
    citation_count: Option<i64>,
    #[serde(rename = "influentialCitationCount")]
    influential_citation_count: Option<i64>,
    #[serde(rename = "isOpenAccess")]
    is_open_access: Option<bool>,
    #[serde(rename = "abstract")]
    abstract_text: Option<String>,
}

#[derive(Deserialize)]
struct ApiAuthor {
    name: Option<String>,
    #[serde(rename = "authorId")]
    author_id: Option<String>,
}

fn corpus_id_string(value: Option<serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl ApiPaper {
    fn into_record(self) -> Option<PaperRecord> {
        let corpus_id = corpus_id_string(self.corpus_id)?;
        let title = self.title?;
        Some(PaperRecord {
            corpus_id,
            title,
            authors: self
                .authors
                .into_iter()
                .filter_map(|a| {
                    a.name.map(|name| Author {
                        name,
                        author_id: a.author_id,
                    })
                })
                .collect(),
            year: self.year,
            venue: self.venue.filter(|v| !v.is_empty()),
            citation_count: self.citation_count.unwrap_or(0),
            influential_citation_count: self.influential_citation_count.unwrap_or(0),
            open_access: self.is_open_access,
            abstract_text: self.abstract_text.filter(|a| !a.is_empty()),
        })
    }
}

// =============================================================================
// Trait impl
// =============================================================================

#[async_trait]
impl PaperIndex for HttpPaperIndex {
    async fn snippet_search(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<Passage>, IndexError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut params = vec![
            ("query".to_string(), query.to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        filters.apply(&mut params);

        let response: SnippetSearchResponse = self.get_json("snippet/search", &params).await?;
        let hits = response.data.unwrap_or_default();

        let mut passages = Vec::with_capacity(hits.len());
        for hit in hits {
            let Some(snippet) = hit.snippet else { continue };
            let Some(text) = snippet.text else { continue };
            if text.split_whitespace().count() <= MIN_SNIPPET_WORDS {
                continue;
            }
            let Some(corpus_id) = hit.paper.and_then(|p| corpus_id_string(p.corpus_id)) else {
                continue;
            };
            let kind = snippet
                .snippet_kind
                .as_deref()
                .map(SnippetKind::from_api)
                .unwrap_or(SnippetKind::Other);
            let section_title = match kind {
                SnippetKind::Body => hit.section,
                SnippetKind::Abstract => Some("abstract".to_string()),
                SnippetKind::Title => Some("title".to_string()),
                SnippetKind::Other => hit.section,
            };
            let (char_start, char_end) = snippet
                .snippet_offset
                .map(|o| (o.start, o.end))
                .unwrap_or((None, None));
            passages.push(Passage {
                corpus_id,
                text,
                section_title,
                kind,
                score: hit.score.unwrap_or(0.0),
                char_start,
                char_end,
            });
        }
        Ok(passages)
    }

    async fn keyword_search(
        &self,
        keyword_query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<PaperRecord>, IndexError> {
        if limit == 0 || keyword_query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let mut params = vec![
            ("query".to_string(), keyword_query.to_string()),
            ("limit".to_string(), limit.to_string()),
            ("fields".to_string(), METADATA_FIELDS.to_string()),
        ];
        filters.apply(&mut params);

        let response: PaperSearchResponse = self.get_json("paper/search", &params).await?;
        let papers = response
            .data
            .unwrap_or_default()
            .into_iter()
            .filter_map(ApiPaper::into_record)
            // Keyword hits without an abstract cannot contribute a passage.
            .filter(|p| p.abstract_text.is_some())
            .collect();
        Ok(papers)
    }

    async fn fetch_metadata(
        &self,
        corpus_ids: &[String],
    ) -> Result<HashMap<String, PaperRecord>, IndexError> {
        let mut out = HashMap::new();
        let mut missing: Vec<String> = Vec::new();
        {
            let cache = self.metadata_cache.lock().expect("metadata cache lock");
            let now = Instant::now();
            for id in corpus_ids {
                match cache.get(id) {
                    Some((fetched, record))
                        if now.duration_since(*fetched) < self.config.metadata_ttl =>
                    {
                        out.insert(id.clone(), record.clone());
                    }
                    _ => missing.push(id.clone()),
                }
            }
        }

        for chunk in missing.chunks(METADATA_BATCH) {
            let ids: Vec<String> = chunk.iter().map(|id| format!("CorpusId:{id}")).collect();
            let body = serde_json::json!({ "ids": ids });
            let params = vec![("fields".to_string(), METADATA_FIELDS.to_string())];
            let papers: Vec<Option<ApiPaper>> =
                self.post_json("paper/batch", &params, &body).await?;
            let mut cache = self.metadata_cache.lock().expect("metadata cache lock");
            let now = Instant::now();
            for paper in papers.into_iter().flatten() {
                if let Some(record) = paper.into_record() {
                    cache.insert(record.corpus_id.clone(), (now, record.clone()));
                    out.insert(record.corpus_id.clone(), record);
                }
            }
        }

        if out.len() < corpus_ids.len() {
            let missed = corpus_ids.len() - out.len();
            warn!(missed, "metadata lookup returned fewer papers than requested");
        }
        Ok(out)
    }
}
