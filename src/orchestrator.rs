//! Pipeline orchestrator: runs stages in dependency order under one mode.
//!
//! The orchestrator owns nothing clever. Each stage runner already knows
//! how to select candidates, pace itself, and record outcomes; the
//! orchestrator sequences them, carries the collaborator set, and folds the
//! per-stage reports into one [`RunReport`]. Mode is an explicit value — no
//! ambient state decides what a run does.
//!
//! A full run recomputes each stage's candidates *after* the previous
//! stage's writes, so a paper downloaded in this run is converted in this
//! run. There is no streaming between stages; the store is the only
//! hand-off.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::config::{FetchRequest, PipelineConfig};
use crate::error::PipelineError;
use crate::paper::StatusSummary;
use crate::pipeline::{
    run_convert, run_download, run_extract, run_fetch, DocumentConverter, ExecutionReport,
    HttpPdfFetcher, MetadataSource, PdfFetcher, ScholarClient, SectionExtractor,
    TeiSectionExtractor, TeiServiceClient,
};
use crate::reset::{run_reset, ResetOutcome, ResetScope};
use crate::store::PaperStore;

/// The collaborator set a run executes against.
///
/// Trait objects so tests and alternative deployments can swap any
/// collaborator without touching the orchestration.
#[derive(Clone)]
pub struct StageOps {
    pub metadata: Arc<dyn MetadataSource>,
    pub pdf: Arc<dyn PdfFetcher>,
    pub converter: Arc<dyn DocumentConverter>,
    pub extractor: Arc<dyn SectionExtractor>,
}

impl StageOps {
    /// The production collaborator set: live HTTP clients plus the regex
    /// section extractor.
    pub fn live(convert_service_url: &str) -> Result<Self, PipelineError> {
        Ok(StageOps {
            metadata: Arc::new(ScholarClient::new()?),
            pdf: Arc::new(HttpPdfFetcher::new()?),
            converter: Arc::new(TeiServiceClient::new(convert_service_url)?),
            extractor: Arc::new(TeiSectionExtractor),
        })
    }
}

/// What a single `run` call should do.
#[derive(Debug, Clone)]
pub enum Mode {
    /// Fetch, then download, convert, and extract, in order.
    FullRun(FetchRequest),
    /// Only the metadata fetch.
    Fetch(FetchRequest),
    /// Only the named downstream stage, over its current candidates.
    Download,
    Convert,
    Extract,
    /// Read-only status snapshot.
    Status,
    /// Apply a reset, then report the resulting status.
    Reset(ResetScope),
}

/// Everything a run did, plus the store's state afterwards.
///
/// Partial failures live inside the stage reports; an `Err` from `run`
/// means the run itself could not proceed.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub stages: Vec<ExecutionReport>,
    pub summary: StatusSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset: Option<SerializableResetOutcome>,
}

/// [`ResetOutcome`] mirror that serialises into run reports.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SerializableResetOutcome {
    pub papers_affected: usize,
    pub artifacts_removed: usize,
}

impl From<ResetOutcome> for SerializableResetOutcome {
    fn from(outcome: ResetOutcome) -> Self {
        SerializableResetOutcome {
            papers_affected: outcome.papers_affected,
            artifacts_removed: outcome.artifacts_removed,
        }
    }
}

/// Sequences stage runs against one store and one collaborator set.
pub struct Orchestrator {
    store: PaperStore,
    config: PipelineConfig,
    ops: StageOps,
}

impl Orchestrator {
    /// Open the store at the configured path and build an orchestrator.
    pub fn new(config: PipelineConfig, ops: StageOps) -> Result<Self, PipelineError> {
        let store = PaperStore::open(&config.db_path)?;
        Ok(Orchestrator { store, config, ops })
    }

    /// Build an orchestrator over an existing store. Used by tests and the
    /// experiment sandbox.
    pub fn with_store(store: PaperStore, config: PipelineConfig, ops: StageOps) -> Self {
        Orchestrator { store, config, ops }
    }

    pub fn store(&self) -> &PaperStore {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Execute one mode to completion.
    pub async fn run(&self, mode: Mode) -> Result<RunReport, PipelineError> {
        info!(mode = ?mode_name(&mode), "run starting");
        let mut stages = Vec::new();
        let mut reset = None;

        match mode {
            Mode::FullRun(request) => {
                stages.push(
                    run_fetch(&self.store, &self.config, self.ops.metadata.as_ref(), &request)
                        .await?,
                );
                if !self.interrupted() {
                    stages.push(
                        run_download(&self.store, &self.config, self.ops.pdf.clone()).await?,
                    );
                }
                if !self.config.skip_convert && !self.interrupted() {
                    stages.push(
                        run_convert(&self.store, &self.config, self.ops.converter.clone())
                            .await?,
                    );
                }
                if !self.config.skip_extract && !self.interrupted() {
                    stages.push(
                        run_extract(&self.store, &self.config, self.ops.extractor.clone())
                            .await?,
                    );
                }
            }
            Mode::Fetch(request) => {
                stages.push(
                    run_fetch(&self.store, &self.config, self.ops.metadata.as_ref(), &request)
                        .await?,
                );
            }
            Mode::Download => {
                stages.push(run_download(&self.store, &self.config, self.ops.pdf.clone()).await?);
            }
            Mode::Convert => {
                stages.push(
                    run_convert(&self.store, &self.config, self.ops.converter.clone()).await?,
                );
            }
            Mode::Extract => {
                stages.push(
                    run_extract(&self.store, &self.config, self.ops.extractor.clone()).await?,
                );
            }
            Mode::Status => {}
            Mode::Reset(scope) => {
                reset = Some(run_reset(&self.store, &self.config, &scope)?.into());
            }
        }

        let summary = self.store.status_summary()?;
        info!(
            total = summary.total,
            downloaded = summary.downloaded.done,
            converted = summary.converted.done,
            extracted = summary.extracted.done,
            "run finished"
        );
        Ok(RunReport {
            stages,
            summary,
            reset,
        })
    }

    fn interrupted(&self) -> bool {
        self.config
            .interrupt
            .as_ref()
            .map(|f| f.load(std::sync::atomic::Ordering::SeqCst))
            .unwrap_or(false)
    }
}

fn mode_name(mode: &Mode) -> &'static str {
    match mode {
        Mode::FullRun(_) => "full-run",
        Mode::Fetch(_) => "fetch",
        Mode::Download => "download",
        Mode::Convert => "convert",
        Mode::Extract => "extract",
        Mode::Status => "status",
        Mode::Reset(_) => "reset",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StageError;
    use crate::paper::PaperMetadata;
    use crate::pipeline::SearchPage;
    use async_trait::async_trait;

    struct OnePageSource;

    #[async_trait]
    impl MetadataSource for OnePageSource {
        async fn search_page(
            &self,
            _request: &FetchRequest,
            _offset: usize,
            _limit: usize,
        ) -> Result<SearchPage, StageError> {
            let mut a = PaperMetadata::new("a", "Paper A");
            a.is_open_access = true;
            a.pdf_url = Some("https://example.org/a.pdf".into());
            let b = PaperMetadata::new("b", "Paper B");
            Ok(SearchPage {
                papers: vec![a, b],
                next_offset: None,
            })
        }
    }

    struct FixedPdf;

    #[async_trait]
    impl crate::pipeline::PdfFetcher for FixedPdf {
        async fn fetch_pdf(&self, _url: &str) -> Result<Vec<u8>, StageError> {
            Ok(b"%PDF-1.4 fixture".to_vec())
        }
    }

    struct FixedConverter;

    #[async_trait]
    impl DocumentConverter for FixedConverter {
        async fn health_check(&self) -> Result<(), PipelineError> {
            Ok(())
        }

        async fn convert_pdf(&self, _pdf: &[u8]) -> Result<String, StageError> {
            Ok("<TEI><text><body><div><head>S</head><p>body text</p></div></body></text></TEI>"
                .to_string())
        }
    }

    fn test_ops() -> StageOps {
        StageOps {
            metadata: Arc::new(OnePageSource),
            pdf: Arc::new(FixedPdf),
            converter: Arc::new(FixedConverter),
            extractor: Arc::new(TeiSectionExtractor),
        }
    }

    fn sandboxed_orchestrator(dir: &std::path::Path) -> Orchestrator {
        let config = PipelineConfig::builder()
            .db_path(dir.join("papers.db"))
            .storage_root(dir)
            .build()
            .unwrap();
        Orchestrator::with_store(PaperStore::in_memory().unwrap(), config, test_ops())
    }

    #[tokio::test]
    async fn full_run_moves_open_access_paper_to_extracted() {
        let dir = tempfile::tempdir().unwrap();
        let orch = sandboxed_orchestrator(dir.path());
        let report = orch
            .run(Mode::FullRun(FetchRequest::new("q")))
            .await
            .unwrap();

        assert_eq!(report.stages.len(), 4);
        assert_eq!(report.summary.total, 2);
        // Paper "a" went all the way; "b" was skipped at download.
        assert_eq!(report.summary.downloaded.done, 1);
        assert_eq!(report.summary.converted.done, 1);
        assert_eq!(report.summary.extracted.done, 1);
        assert_eq!(report.summary.downloaded.pending, 1);
    }

    #[tokio::test]
    async fn skip_flags_cut_the_tail_of_a_full_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::builder()
            .db_path(dir.path().join("papers.db"))
            .storage_root(dir.path())
            .skip_convert(true)
            .build()
            .unwrap();
        let orch = Orchestrator::with_store(PaperStore::in_memory().unwrap(), config, test_ops());

        let report = orch
            .run(Mode::FullRun(FetchRequest::new("q")))
            .await
            .unwrap();
        // fetch + download + extract; extract simply finds no candidates.
        assert_eq!(report.stages.len(), 3);
        assert_eq!(report.summary.converted.done, 0);
        assert_eq!(report.stages[2].candidates, 0);
    }

    #[tokio::test]
    async fn status_mode_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let orch = sandboxed_orchestrator(dir.path());
        orch.run(Mode::Fetch(FetchRequest::new("q"))).await.unwrap();

        let before = orch.store().status_summary().unwrap();
        let report = orch.run(Mode::Status).await.unwrap();
        assert!(report.stages.is_empty());
        assert_eq!(report.summary, before);
    }

    #[tokio::test]
    async fn single_stage_run_is_incremental() {
        let dir = tempfile::tempdir().unwrap();
        let orch = sandboxed_orchestrator(dir.path());
        orch.run(Mode::Fetch(FetchRequest::new("q"))).await.unwrap();

        let report = orch.run(Mode::Download).await.unwrap();
        assert_eq!(report.stages[0].succeeded, 1);
        assert_eq!(report.stages[0].skipped, 1);

        // A second download run finds nothing left to do.
        let report = orch.run(Mode::Download).await.unwrap();
        assert_eq!(report.stages[0].candidates, 1); // the skipped one, still pending
        assert_eq!(report.stages[0].succeeded, 0);
        assert_eq!(report.stages[0].skipped, 1);
    }

    #[tokio::test]
    async fn reset_mode_reports_the_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let orch = sandboxed_orchestrator(dir.path());
        orch.run(Mode::Fetch(FetchRequest::new("q"))).await.unwrap();

        let report = orch.run(Mode::Reset(ResetScope::Status)).await.unwrap();
        assert_eq!(report.reset.unwrap().papers_affected, 2);
    }
}
