//! Fetch stage: query a metadata source and upsert paper records.
//!
//! Fetch is the pipeline's entry point and the one stage without a
//! candidate query — its input is a search request, not the store. Each
//! returned paper is upserted immediately, so an interrupted search still
//! leaves every received record durable and downstream-eligible.
//!
//! The wire client pages through the source in batches (the public API caps
//! a page at 100 results) and retries rate limits and server errors with
//! linear backoff. A definitive rejection aborts the whole fetch: if the
//! first page is a 401, page two will be as well.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::{FetchRequest, PipelineConfig};
use crate::error::{PipelineError, StageError};
use crate::paper::{PaperMetadata, Stage};
use crate::pipeline::executor::ExecutionReport;
use crate::store::PaperStore;

/// Maximum page size the metadata API accepts.
const PAGE_LIMIT: usize = 100;
/// Retries per page for transient failures.
const PAGE_RETRIES: u32 = 3;

/// One page of search results.
#[derive(Debug, Clone)]
pub struct SearchPage {
    pub papers: Vec<PaperMetadata>,
    /// Offset of the next page, or `None` when the source is exhausted.
    pub next_offset: Option<usize>,
}

/// A source of paper metadata.
///
/// Implementations translate one page request into one upstream call and
/// classify failures: [`StageError::Transient`] for retryable conditions
/// (rate limit, server error, network), [`StageError::Permanent`] for
/// definitive rejections (bad query, auth).
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn search_page(
        &self,
        request: &FetchRequest,
        offset: usize,
        limit: usize,
    ) -> Result<SearchPage, StageError>;
}

/// Run a metadata fetch: page through the source, upsert every paper.
///
/// Returns an [`ExecutionReport`] for the implicit `fetched` stage:
/// `succeeded` counts upserted papers, `failed` stays zero (a paper either
/// arrives whole or not at all).
///
/// # Errors
/// [`PipelineError::MetadataSearchFailed`] when the source rejects the
/// search permanently or a page exhausts its retries.
pub async fn run_fetch(
    store: &PaperStore,
    config: &PipelineConfig,
    source: &dyn MetadataSource,
    request: &FetchRequest,
) -> Result<ExecutionReport, PipelineError> {
    let policy = config.policy_for(Stage::Fetched);
    let mut report = ExecutionReport::empty(Stage::Fetched);
    report.candidates = request.desired_total;
    info!(query = %request.query, desired = request.desired_total, "fetch starting");
    if let Some(progress) = &config.progress {
        progress.on_stage_start(Stage::Fetched, request.desired_total);
    }

    let mut offset = 0usize;
    while report.succeeded < request.desired_total {
        if config
            .interrupt
            .as_ref()
            .map(|f| f.load(std::sync::atomic::Ordering::SeqCst))
            .unwrap_or(false)
        {
            report.interrupted = true;
            warn!("interrupt received; stopping fetch");
            break;
        }
        let limit = PAGE_LIMIT.min(request.desired_total - report.succeeded);
        let page = fetch_page_with_retry(source, request, offset, limit).await?;

        for paper in &page.papers {
            store.upsert_paper(paper)?;
            report.attempted += 1;
            report.succeeded += 1;
            if let Some(progress) = &config.progress {
                progress.on_item_done(Stage::Fetched, &paper.paper_id);
            }
        }
        debug!(offset, received = page.papers.len(), "fetch page stored");

        match page.next_offset {
            Some(next) if !page.papers.is_empty() => offset = next,
            _ => break,
        }
        if !policy.delay.is_zero() {
            tokio::time::sleep(policy.delay).await;
        }
    }

    if let Some(progress) = &config.progress {
        progress.on_stage_complete(Stage::Fetched, report.succeeded, report.failed);
    }
    info!(stored = report.succeeded, "fetch finished");
    Ok(report)
}

async fn fetch_page_with_retry(
    source: &dyn MetadataSource,
    request: &FetchRequest,
    offset: usize,
    limit: usize,
) -> Result<SearchPage, PipelineError> {
    let mut last_detail = String::new();
    for attempt in 1..=PAGE_RETRIES {
        match source.search_page(request, offset, limit).await {
            Ok(page) => return Ok(page),
            Err(StageError::Permanent { detail }) => {
                return Err(PipelineError::MetadataSearchFailed { detail });
            }
            Err(StageError::Transient { detail }) => {
                warn!(offset, attempt, detail = %detail, "search page failed; retrying");
                last_detail = detail;
                if attempt < PAGE_RETRIES {
                    // Linear backoff keeps total wait bounded and is enough
                    // for the API's short rate-limit windows.
                    tokio::time::sleep(std::time::Duration::from_secs(2 * attempt as u64)).await;
                }
            }
        }
    }
    Err(PipelineError::MetadataSearchFailed {
        detail: format!("page at offset {offset} failed after {PAGE_RETRIES} attempts: {last_detail}"),
    })
}

// ── HTTP client ───────────────────────────────────────────────────────────

/// Fields requested from the search endpoint. Kept to what the record store
/// persists.
const SEARCH_FIELDS: &str =
    "title,abstract,year,venue,authors,externalIds,url,isOpenAccess,openAccessPdf";

/// Client for a Semantic-Scholar-compatible graph API.
pub struct ScholarClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl ScholarClient {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.semanticscholar.org/graph/v1";

    /// Build a client; the API key, if any, is read from
    /// `SEMANTIC_SCHOLAR_API_KEY`. Unauthenticated use works but is
    /// rate-limited aggressively.
    pub fn new() -> Result<Self, PipelineError> {
        Self::with_base_url(Self::DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, PipelineError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| PipelineError::Internal(format!("build http client: {e}")))?;
        Ok(ScholarClient {
            http,
            base_url: base_url.into(),
            api_key: std::env::var("SEMANTIC_SCHOLAR_API_KEY").ok(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    next: Option<usize>,
    #[serde(default)]
    data: Vec<ApiPaper>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiPaper {
    paper_id: Option<String>,
    title: Option<String>,
    r#abstract: Option<String>,
    year: Option<i32>,
    venue: Option<String>,
    #[serde(default)]
    authors: Vec<ApiAuthor>,
    #[serde(default)]
    external_ids: serde_json::Value,
    url: Option<String>,
    #[serde(default)]
    is_open_access: bool,
    open_access_pdf: Option<ApiOpenAccessPdf>,
}

#[derive(Debug, Deserialize)]
struct ApiAuthor {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiOpenAccessPdf {
    url: Option<String>,
}

impl ApiPaper {
    /// Records without an id or title are unusable downstream and dropped.
    fn into_metadata(self) -> Option<PaperMetadata> {
        let paper_id = self.paper_id?;
        let title = self.title?;
        Some(PaperMetadata {
            paper_id,
            title,
            r#abstract: self.r#abstract,
            year: self.year,
            venue: self.venue,
            authors: self.authors.into_iter().filter_map(|a| a.name).collect(),
            external_ids: self.external_ids,
            url: self.url,
            is_open_access: self.is_open_access,
            pdf_url: self.open_access_pdf.and_then(|p| p.url),
        })
    }
}

#[async_trait]
impl MetadataSource for ScholarClient {
    async fn search_page(
        &self,
        request: &FetchRequest,
        offset: usize,
        limit: usize,
    ) -> Result<SearchPage, StageError> {
        let url = format!("{}/paper/search", self.base_url);
        let mut req = self.http.get(&url).query(&[
            ("query", request.query.as_str()),
            ("offset", &offset.to_string()),
            ("limit", &limit.to_string()),
            ("fields", SEARCH_FIELDS),
        ]);
        if !request.fields_of_study.is_empty() {
            req = req.query(&[("fieldsOfStudy", request.fields_of_study.join(","))]);
        }
        if request.open_access_only {
            req = req.query(&[("openAccessPdf", "")]);
        }
        if let Some(year) = &request.year {
            req = req.query(&[("year", year.as_str())]);
        }
        if let Some(key) = &self.api_key {
            req = req.header("x-api-key", key);
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                StageError::transient(format!("search request: {e}"))
            } else {
                StageError::permanent(format!("search request: {e}"))
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(StageError::transient(format!("search returned {status}")));
        }
        if !status.is_success() {
            return Err(StageError::permanent(format!("search returned {status}")));
        }

        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| StageError::transient(format!("decode search response: {e}")))?;
        Ok(SearchPage {
            papers: body.data.into_iter().filter_map(ApiPaper::into_metadata).collect(),
            next_offset: body.next,
        })
    }
}
