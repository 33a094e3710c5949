//! Integration tests for the pipeline state machine.
//!
//! Everything runs against scripted collaborators and temp-dir storage —
//! no network, no external services. The properties under test are the
//! ones the pipeline promises callers: dependency ordering, resumable
//! idempotence, partial-failure containment, sandbox isolation, and reset
//! semantics.

use async_trait::async_trait;
use paperflow::{
    DocumentConverter, ExperimentSandbox, FetchRequest, MetadataSource, Mode, Orchestrator,
    PaperMetadata, PaperStore, PdfFetcher, PipelineConfig, PipelineError, ResetScope, StageError,
    StageOps, StagePolicy, StageStatus, TeiSectionExtractor, WipeConfirmation,
};
use paperflow::pipeline::SearchPage;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ── Scripted collaborators ───────────────────────────────────────────────────

/// Serves `count` open-access papers (p0..pN) in one page.
struct FixtureSource {
    count: usize,
    open_access: HashSet<String>,
}

impl FixtureSource {
    fn all_open_access(count: usize) -> Self {
        FixtureSource {
            count,
            open_access: (0..count).map(|i| format!("p{i}")).collect(),
        }
    }
}

#[async_trait]
impl MetadataSource for FixtureSource {
    async fn search_page(
        &self,
        _request: &FetchRequest,
        offset: usize,
        limit: usize,
    ) -> Result<SearchPage, StageError> {
        let papers = (offset..self.count.min(offset + limit))
            .map(|i| {
                let id = format!("p{i}");
                let mut meta = PaperMetadata::new(&id, format!("Paper {i}"));
                if self.open_access.contains(&id) {
                    meta.is_open_access = true;
                    meta.pdf_url = Some(format!("https://example.org/{id}.pdf"));
                }
                meta
            })
            .collect::<Vec<_>>();
        let next = offset + papers.len();
        Ok(SearchPage {
            papers,
            next_offset: (next < self.count).then_some(next),
        })
    }
}

/// Fails for scripted URLs, serves a valid PDF for everything else.
struct FixtureFetcher {
    fail: Vec<(String, StageError)>,
    calls: AtomicUsize,
}

impl FixtureFetcher {
    fn reliable() -> Self {
        FixtureFetcher {
            fail: Vec::new(),
            calls: AtomicUsize::new(0),
        }
    }

    fn failing(fail: Vec<(&str, StageError)>) -> Self {
        FixtureFetcher {
            fail: fail.into_iter().map(|(id, e)| (id.to_string(), e)).collect(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PdfFetcher for FixtureFetcher {
    async fn fetch_pdf(&self, url: &str) -> Result<Vec<u8>, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        for (id, error) in &self.fail {
            if url.contains(id.as_str()) {
                return Err(error.clone());
            }
        }
        Ok(format!("%PDF-1.4 fixture for {url}").into_bytes())
    }
}

struct FixtureConverter;

#[async_trait]
impl DocumentConverter for FixtureConverter {
    async fn health_check(&self) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn convert_pdf(&self, _pdf: &[u8]) -> Result<String, StageError> {
        Ok("<TEI><teiHeader><fileDesc><titleStmt><title>T</title></titleStmt></fileDesc>\
            </teiHeader><text><body><div><head>Intro</head><p>Some text.</p></div></body>\
            </text></TEI>"
            .to_string())
    }
}

fn ops_with_fetcher(source: FixtureSource, fetcher: FixtureFetcher) -> (StageOps, Arc<FixtureFetcher>) {
    let fetcher = Arc::new(fetcher);
    let ops = StageOps {
        metadata: Arc::new(source),
        pdf: fetcher.clone(),
        converter: Arc::new(FixtureConverter),
        extractor: Arc::new(TeiSectionExtractor),
    };
    (ops, fetcher)
}

fn config_in(dir: &Path) -> PipelineConfig {
    PipelineConfig::builder()
        .db_path(dir.join("papers.db"))
        .storage_root(dir.join("storage"))
        .all_policies(StagePolicy::default()) // no pacing delays in tests
        .build()
        .unwrap()
}

fn orchestrator_in(dir: &Path, ops: StageOps) -> Orchestrator {
    Orchestrator::with_store(PaperStore::in_memory().unwrap(), config_in(dir), ops)
}

// ── Dependency ordering ──────────────────────────────────────────────────────

#[tokio::test]
async fn done_stages_always_imply_done_dependencies() {
    let dir = tempfile::tempdir().unwrap();
    let (ops, _) = ops_with_fetcher(
        FixtureSource::all_open_access(6),
        FixtureFetcher::failing(vec![("p2", StageError::permanent("404"))]),
    );
    let orch = orchestrator_in(dir.path(), ops);
    orch.run(Mode::FullRun(FetchRequest::new("q"))).await.unwrap();

    for i in 0..6 {
        let record = orch.store().get(&format!("p{i}")).unwrap().unwrap();
        if record.converted.status == StageStatus::Done {
            assert_eq!(record.downloaded.status, StageStatus::Done);
        }
        if record.extracted.status == StageStatus::Done {
            assert_eq!(record.converted.status, StageStatus::Done);
        }
    }
    // The failed download never progressed.
    let failed = orch.store().get("p2").unwrap().unwrap();
    assert_eq!(failed.downloaded.status, StageStatus::Error);
    assert_eq!(failed.converted.status, StageStatus::Pending);
}

// ── Resumability and idempotence ─────────────────────────────────────────────

#[tokio::test]
async fn rerun_without_overwrite_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let (ops, fetcher) = ops_with_fetcher(
        FixtureSource::all_open_access(3),
        FixtureFetcher::reliable(),
    );
    let orch = orchestrator_in(dir.path(), ops);

    orch.run(Mode::FullRun(FetchRequest::new("q"))).await.unwrap();
    let calls_after_first = fetcher.calls.load(Ordering::SeqCst);
    let summary_after_first = orch.store().status_summary().unwrap();
    assert_eq!(summary_after_first.extracted.done, 3);

    // Same pipeline again: nothing left to do, nothing re-attempted.
    let report = orch.run(Mode::FullRun(FetchRequest::new("q"))).await.unwrap();
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), calls_after_first);
    assert_eq!(orch.store().status_summary().unwrap(), summary_after_first);
    for stage_report in &report.stages[1..] {
        assert_eq!(stage_report.attempted, 0);
    }
}

#[tokio::test]
async fn overwrite_reprocesses_completed_work() {
    let dir = tempfile::tempdir().unwrap();
    let (ops, fetcher) = ops_with_fetcher(
        FixtureSource::all_open_access(2),
        FixtureFetcher::reliable(),
    );
    let mut config = config_in(dir.path());
    config.download_policy.overwrite = true;
    let orch = Orchestrator::with_store(PaperStore::in_memory().unwrap(), config, ops);

    orch.run(Mode::FullRun(FetchRequest::new("q"))).await.unwrap();
    let calls_after_first = fetcher.calls.load(Ordering::SeqCst);
    assert_eq!(calls_after_first, 2);

    // With overwrite the done papers are candidates again and re-fetched.
    let report = orch.run(Mode::Download).await.unwrap();
    assert_eq!(report.stages[0].succeeded, 2);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), calls_after_first + 2);
}

// ── Partial failure containment ──────────────────────────────────────────────

#[tokio::test]
async fn two_failures_out_of_ten_leave_eight_done() {
    let dir = tempfile::tempdir().unwrap();
    let (ops, _) = ops_with_fetcher(
        FixtureSource::all_open_access(10),
        FixtureFetcher::failing(vec![
            ("p3", StageError::transient("connection reset")),
            ("p7", StageError::permanent("404")),
        ]),
    );
    let orch = orchestrator_in(dir.path(), ops);
    let report = orch
        .run(Mode::FullRun(FetchRequest::new("q")))
        .await
        .unwrap();

    let download = &report.stages[1];
    assert_eq!(download.attempted, 10);
    assert_eq!(download.succeeded, 8);
    assert_eq!(download.failed, 2);
    assert_eq!(download.attempted, download.succeeded + download.failed);

    // Failures are recorded with their kind; successes kept their artifacts.
    let transient = orch.store().get("p3").unwrap().unwrap();
    assert_eq!(transient.downloaded.error_kind.as_deref(), Some("transient"));
    let permanent = orch.store().get("p7").unwrap().unwrap();
    assert_eq!(permanent.downloaded.error_kind.as_deref(), Some("permanent"));
    let ok = orch.store().get("p0").unwrap().unwrap();
    assert!(Path::new(&ok.downloaded.artifact.unwrap()).exists());

    // The eight good papers flowed through to extraction.
    assert_eq!(report.summary.extracted.done, 8);

    // A plain re-run retries the transient failure only.
    let report = orch.run(Mode::Download).await.unwrap();
    assert_eq!(report.stages[0].candidates, 1);
}

// ── Sandbox isolation ────────────────────────────────────────────────────────

#[tokio::test]
async fn experiment_runs_never_touch_the_primary_dataset() {
    let primary_dir = tempfile::tempdir().unwrap();
    let experiment_dir = tempfile::tempdir().unwrap();

    // Primary: file-backed store with some completed work.
    let primary_config = config_in(primary_dir.path());
    let (ops, _) = ops_with_fetcher(
        FixtureSource::all_open_access(3),
        FixtureFetcher::reliable(),
    );
    let primary = Orchestrator::new(primary_config.clone(), ops.clone()).unwrap();
    primary.run(Mode::FullRun(FetchRequest::new("q"))).await.unwrap();
    let before = primary.store().status_summary().unwrap();

    // Experiment: different query, different failure profile.
    let experiment_config = config_in(experiment_dir.path());
    let (exp_ops, _) = ops_with_fetcher(
        FixtureSource::all_open_access(5),
        FixtureFetcher::failing(vec![("p1", StageError::permanent("404"))]),
    );
    let sandbox = ExperimentSandbox::new(&primary_config, experiment_config, exp_ops).unwrap();
    let report = sandbox
        .orchestrator()
        .run(Mode::FullRun(FetchRequest::new("other query")))
        .await
        .unwrap();
    assert_eq!(report.summary.total, 5);

    // The primary store is byte-for-byte unaffected.
    let after = primary.store().status_summary().unwrap();
    assert_eq!(before, after);

    // And the experiment's artifacts live under its own roots.
    let experiment_pdf_dir = sandbox.orchestrator().config().pdf_dir.clone();
    assert!(experiment_pdf_dir.starts_with(experiment_dir.path()));
    assert!(experiment_pdf_dir.join("p0.pdf").exists());
    assert!(!primary_config.pdf_dir.join("p4.pdf").exists());
}

#[tokio::test]
async fn sandbox_refuses_overlapping_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let primary = config_in(dir.path());
    let (ops, _) = ops_with_fetcher(
        FixtureSource::all_open_access(1),
        FixtureFetcher::reliable(),
    );

    // Same paths entirely: must be rejected before any store is opened.
    let err = ExperimentSandbox::new(&primary, primary.clone(), ops).unwrap_err();
    assert!(matches!(err, PipelineError::SandboxCollision { .. }));
}

// ── Reset semantics ──────────────────────────────────────────────────────────

#[tokio::test]
async fn status_reset_preserves_artifacts_and_rerun_re_adopts_them() {
    let dir = tempfile::tempdir().unwrap();
    let (ops, fetcher) = ops_with_fetcher(
        FixtureSource::all_open_access(2),
        FixtureFetcher::reliable(),
    );
    let orch = orchestrator_in(dir.path(), ops);
    orch.run(Mode::FullRun(FetchRequest::new("q"))).await.unwrap();
    let calls_before = fetcher.calls.load(Ordering::SeqCst);

    orch.run(Mode::Reset(ResetScope::Status)).await.unwrap();
    let record = orch.store().get("p0").unwrap().unwrap();
    assert_eq!(record.downloaded.status, StageStatus::Pending);
    let pdf_path = record.downloaded.artifact.clone().unwrap();
    assert!(Path::new(&pdf_path).exists());

    // Post-reset download re-adopts the on-disk PDFs without refetching.
    let report = orch.run(Mode::Download).await.unwrap();
    assert_eq!(report.stages[0].succeeded, 2);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), calls_before);
}

#[tokio::test]
async fn unconfirmed_wipe_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (ops, _) = ops_with_fetcher(
        FixtureSource::all_open_access(2),
        FixtureFetcher::reliable(),
    );
    let orch = orchestrator_in(dir.path(), ops);
    orch.run(Mode::FullRun(FetchRequest::new("q"))).await.unwrap();
    let before = orch.store().status_summary().unwrap();

    let err = orch
        .run(Mode::Reset(ResetScope::Full {
            confirmation: WipeConfirmation::new(true, false),
            remove_artifacts: true,
        }))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::WipeNotConfirmed));
    assert_eq!(orch.store().status_summary().unwrap(), before);
    // Artifact files survived too.
    let record = orch.store().get("p0").unwrap().unwrap();
    assert!(Path::new(&record.downloaded.artifact.unwrap()).exists());
}

#[tokio::test]
async fn confirmed_full_wipe_empties_store_and_storage() {
    let dir = tempfile::tempdir().unwrap();
    let (ops, _) = ops_with_fetcher(
        FixtureSource::all_open_access(2),
        FixtureFetcher::reliable(),
    );
    let orch = orchestrator_in(dir.path(), ops);
    orch.run(Mode::FullRun(FetchRequest::new("q"))).await.unwrap();

    let report = orch
        .run(Mode::Reset(ResetScope::Full {
            confirmation: WipeConfirmation::new(true, true),
            remove_artifacts: true,
        }))
        .await
        .unwrap();
    assert_eq!(report.summary.total, 0);
    let pdf_dir = orch.config().pdf_dir.clone();
    assert!(!pdf_dir.join("p0.pdf").exists());
}

// ── Skip vs error ────────────────────────────────────────────────────────────

#[tokio::test]
async fn non_open_access_papers_are_skipped_without_error_state() {
    let dir = tempfile::tempdir().unwrap();
    let source = FixtureSource {
        count: 3,
        open_access: ["p0".to_string()].into_iter().collect(),
    };
    let (ops, fetcher) = ops_with_fetcher(source, FixtureFetcher::reliable());
    let orch = orchestrator_in(dir.path(), ops);
    let report = orch
        .run(Mode::FullRun(FetchRequest::new("q")))
        .await
        .unwrap();

    let download = &report.stages[1];
    assert_eq!(download.succeeded, 1);
    assert_eq!(download.skipped, 2);
    assert_eq!(download.failed, 0);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

    // Skipped papers carry no error and stay pending.
    let skipped = orch.store().get("p1").unwrap().unwrap();
    assert_eq!(skipped.downloaded.status, StageStatus::Pending);
    assert!(skipped.downloaded.error.is_none());
}
