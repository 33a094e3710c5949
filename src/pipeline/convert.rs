//! Convert stage: submit each PDF to the conversion service for TEI XML.
//!
//! The service (a GROBID-compatible HTTP endpoint) runs out-of-process; its
//! lifecycle is not this crate's concern. What is: probing it once before a
//! batch so a dead service aborts the run instead of stamping a transient
//! error on every candidate, and classifying per-document failures so a
//! busy 503 retries next run while a rejected document parks.
//!
//! With `delete_pdf_after_convert` the source PDF is removed — but only
//! after the `done` outcome is durably recorded, via the executor's
//! `after_record` hook. A crash between conversion and recording therefore
//! leaves the PDF in place for the re-run.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, StageError};
use crate::paper::{PaperRecord, Stage};
use crate::pipeline::executor::{run_stage, ExecutionReport, StageOutcome};
use crate::pipeline::{artifact_file_name, write_artifact};
use crate::store::PaperStore;

/// Converts PDF bytes into a TEI XML document.
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    /// Probe the service once before a batch.
    async fn health_check(&self) -> Result<(), PipelineError>;

    async fn convert_pdf(&self, pdf: &[u8]) -> Result<String, StageError>;
}

/// Client for a GROBID-compatible conversion service.
pub struct TeiServiceClient {
    http: reqwest::Client,
    base_url: String,
}

impl TeiServiceClient {
    pub const DEFAULT_BASE_URL: &'static str = "http://localhost:8070";

    pub fn new(base_url: impl Into<String>) -> Result<Self, PipelineError> {
        let http = reqwest::Client::builder()
            // Full-text processing of a long paper can take a while.
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|e| PipelineError::Internal(format!("build http client: {e}")))?;
        Ok(TeiServiceClient {
            http,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl DocumentConverter for TeiServiceClient {
    async fn health_check(&self) -> Result<(), PipelineError> {
        let url = format!("{}/api/isalive", self.base_url);
        let alive = match self.http.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        };
        if alive {
            Ok(())
        } else {
            Err(PipelineError::ServiceUnavailable {
                service: "conversion service",
                url: self.base_url.clone(),
            })
        }
    }

    async fn convert_pdf(&self, pdf: &[u8]) -> Result<String, StageError> {
        let url = format!("{}/api/processFulltextDocument", self.base_url);
        let part = reqwest::multipart::Part::bytes(pdf.to_vec())
            .file_name("input.pdf")
            .mime_str("application/pdf")
            .map_err(|e| StageError::permanent(format!("build request: {e}")))?;
        let form = reqwest::multipart::Form::new().part("input", part);

        let response = self
            .http
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| StageError::transient(format!("request: {e}")))?;

        let status = response.status();
        if status.as_u16() == 503 {
            // All worker threads busy; the document itself is fine.
            return Err(StageError::transient("service busy (503)".to_string()));
        }
        if status.is_server_error() {
            return Err(StageError::transient(format!("service returned {status}")));
        }
        if !status.is_success() {
            return Err(StageError::permanent(format!("service returned {status}")));
        }
        response
            .text()
            .await
            .map_err(|e| StageError::transient(format!("read response: {e}")))
    }
}

/// Run the Convert stage over its current candidates.
pub async fn run_convert(
    store: &PaperStore,
    config: &PipelineConfig,
    converter: Arc<dyn DocumentConverter>,
) -> Result<ExecutionReport, PipelineError> {
    converter.health_check().await?;

    let tei_dir = config.tei_dir.clone();
    let delete_source = config.delete_pdf_after_convert;
    let after_record = move |record: &PaperRecord| {
        if !delete_source {
            return;
        }
        if let Some(pdf_path) = record.downloaded.artifact.as_deref() {
            match std::fs::remove_file(pdf_path) {
                Ok(()) => debug!(pdf_path, "removed source PDF after conversion"),
                Err(e) => warn!(pdf_path, error = %e, "could not remove source PDF"),
            }
        }
    };

    run_stage(
        store,
        config,
        Stage::Converted,
        move |record| perform_convert(record, converter.clone(), tei_dir.clone()),
        Some(&after_record),
    )
    .await
}

/// Attempt one paper's conversion.
pub(crate) async fn perform_convert(
    record: PaperRecord,
    converter: Arc<dyn DocumentConverter>,
    tei_dir: PathBuf,
) -> StageOutcome {
    let paper_id = &record.metadata.paper_id;
    let Some(pdf_path) = record.downloaded.artifact.as_deref() else {
        return StageOutcome::Failed {
            error: StageError::permanent("no PDF artifact recorded".to_string()),
        };
    };
    let bytes = match tokio::fs::read(pdf_path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return StageOutcome::Failed {
                error: StageError::permanent(format!("source PDF missing at '{pdf_path}'")),
            }
        }
        Err(e) => {
            return StageOutcome::Failed {
                error: StageError::transient(format!("read '{pdf_path}': {e}")),
            }
        }
    };

    let tei = match converter.convert_pdf(&bytes).await {
        Ok(tei) => tei,
        Err(error) => return StageOutcome::Failed { error },
    };
    if tei.trim().is_empty() {
        return StageOutcome::Failed {
            error: StageError::permanent("service returned an empty document".to_string()),
        };
    }

    let target = tei_dir.join(artifact_file_name(paper_id, "tei.xml"));
    if let Err(error) = write_artifact(&target, tei.as_bytes()).await {
        return StageOutcome::Failed { error };
    }
    StageOutcome::Done {
        artifact: target.to_string_lossy().into_owned(),
    }
}
