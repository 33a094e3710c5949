//! Download stage: retrieve each paper's PDF and validate it.
//!
//! Publisher hosts are hostile terrain: landing pages served with a 200,
//! rate limits, dead links. The stage therefore validates what it gets —
//! content type and the `%PDF` magic — before a byte reaches the storage
//! root, and classifies failures so a 404 is parked as permanent while a
//! timeout is retried on the next run.
//!
//! Papers without open access are skipped, not errored: under default
//! policy they are simply out of scope, and a later `--all-access` run can
//! still attempt them.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, StageError};
use crate::paper::{PaperRecord, Stage};
use crate::pipeline::executor::{run_stage, ExecutionReport, StageOutcome};
use crate::pipeline::{artifact_file_name, write_artifact};
use crate::store::PaperStore;

const PDF_MAGIC: &[u8] = b"%PDF";

// Some hosts refuse non-browser clients outright.
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

/// Retrieves raw PDF bytes from a URL.
#[async_trait]
pub trait PdfFetcher: Send + Sync {
    async fn fetch_pdf(&self, url: &str) -> Result<Vec<u8>, StageError>;
}

/// reqwest-backed fetcher with a browser-like User-Agent.
pub struct HttpPdfFetcher {
    http: reqwest::Client,
}

impl HttpPdfFetcher {
    pub fn new() -> Result<Self, PipelineError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| PipelineError::Internal(format!("build http client: {e}")))?;
        Ok(HttpPdfFetcher { http })
    }
}

#[async_trait]
impl PdfFetcher for HttpPdfFetcher {
    async fn fetch_pdf(&self, url: &str) -> Result<Vec<u8>, StageError> {
        let response = self.http.get(url).send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                StageError::transient(format!("request: {e}"))
            } else {
                StageError::permanent(format!("request: {e}"))
            }
        })?;

        let status = response.status();
        match status.as_u16() {
            401 | 403 | 404 | 410 => {
                return Err(StageError::permanent(format!("host returned {status}")))
            }
            429 => return Err(StageError::transient("host returned 429".to_string())),
            _ if status.is_server_error() => {
                return Err(StageError::transient(format!("host returned {status}")))
            }
            _ if !status.is_success() => {
                return Err(StageError::permanent(format!("host returned {status}")))
            }
            _ => {}
        }

        // A 200 with an HTML content type is a paywall or landing page.
        if let Some(content_type) = response.headers().get(reqwest::header::CONTENT_TYPE) {
            let content_type = content_type.to_str().unwrap_or_default();
            if content_type.contains("text/html") {
                return Err(StageError::permanent(format!(
                    "host served '{content_type}' instead of a PDF"
                )));
            }
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| StageError::transient(format!("read body: {e}")))
    }
}

/// Run the Download stage over its current candidates.
pub async fn run_download(
    store: &PaperStore,
    config: &PipelineConfig,
    fetcher: Arc<dyn PdfFetcher>,
) -> Result<ExecutionReport, PipelineError> {
    let pdf_dir = config.pdf_dir.clone();
    let all_access = config.all_access;
    let overwrite = config.policy_for(Stage::Downloaded).overwrite;
    run_stage(
        store,
        config,
        Stage::Downloaded,
        move |record| {
            perform_download(record, fetcher.clone(), pdf_dir.clone(), all_access, overwrite)
        },
        None,
    )
    .await
}

/// Attempt one paper's download.
pub(crate) async fn perform_download(
    record: PaperRecord,
    fetcher: Arc<dyn PdfFetcher>,
    pdf_dir: PathBuf,
    all_access: bool,
    overwrite: bool,
) -> StageOutcome {
    let paper_id = &record.metadata.paper_id;
    let target = pdf_dir.join(artifact_file_name(paper_id, "pdf"));

    // After a status reset the artifact may still be on disk; re-adopting it
    // makes the post-reset run cheap. Overwrite means "fetch fresh bytes",
    // so it bypasses re-adoption.
    if !overwrite {
        for existing in [record.downloaded.artifact.as_deref(), target.to_str()]
            .into_iter()
            .flatten()
        {
            if is_valid_pdf(existing).await {
                debug!(paper_id, path = existing, "re-adopting existing PDF");
                return StageOutcome::Done {
                    artifact: existing.to_string(),
                };
            }
        }
    }

    if !record.metadata.is_open_access && !all_access {
        return StageOutcome::Skipped {
            reason: "not open access".into(),
        };
    }
    let url = match record
        .metadata
        .pdf_url
        .as_deref()
        .or(if all_access { record.metadata.url.as_deref() } else { None })
    {
        Some(url) => url,
        None => {
            return StageOutcome::Skipped {
                reason: "no pdf url".into(),
            }
        }
    };

    let bytes = match fetcher.fetch_pdf(url).await {
        Ok(bytes) => bytes,
        Err(error) => return StageOutcome::Failed { error },
    };
    if !bytes.starts_with(PDF_MAGIC) {
        return StageOutcome::Failed {
            error: StageError::permanent("response body is not a PDF".to_string()),
        };
    }
    if let Err(error) = write_artifact(&target, &bytes).await {
        return StageOutcome::Failed { error };
    }
    StageOutcome::Done {
        artifact: target.to_string_lossy().into_owned(),
    }
}

/// True when `path` exists and starts with the PDF magic bytes.
async fn is_valid_pdf(path: &str) -> bool {
    let Ok(mut file) = tokio::fs::File::open(path).await else {
        return false;
    };
    let mut header = [0u8; 4];
    matches!(file.read_exact(&mut header).await, Ok(_)) && header == *PDF_MAGIC
}
