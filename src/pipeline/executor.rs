//! Generic resumable stage executor.
//!
//! Every downstream stage runs through [`run_stage`]: candidate selection,
//! pacing, bounded parallelism, outcome recording, and interruption live
//! here exactly once. A stage contributes only a `perform` function mapping
//! a candidate record to a [`StageOutcome`].
//!
//! # Execution contract
//!
//! * The candidate set is computed once, up front, from the store.
//! * At most `policy.concurrency` items are in flight; the configured
//!   `delay` elapses between successive dispatches.
//! * Every completion is written through the store as it arrives, before
//!   the run finishes. There is no cross-stage streaming: an item completed
//!   here becomes a candidate for the next stage only via the store.
//! * Per-item failures are data in the report, never an `Err`. Only store
//!   failures abort the run.
//! * The interrupt flag stops further dispatches; in-flight items are
//!   drained and their outcomes recorded, so interruption never loses a
//!   completed result.

use std::future::Future;
use std::sync::atomic::Ordering;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, StageError};
use crate::paper::{PaperRecord, Stage};
use crate::store::PaperStore;

/// The result of attempting one candidate.
///
/// Every candidate lands in exactly one bucket. `Skipped` records no error
/// and is not retried automatically; it means "not applicable under current
/// policy", not "failed".
#[derive(Debug, Clone)]
pub enum StageOutcome {
    /// The stage completed; `artifact` is the produced file's path.
    Done { artifact: String },
    /// The stage failed; the error is recorded against the paper.
    Failed { error: StageError },
    /// The item was not applicable (e.g. not open access).
    Skipped { reason: String },
}

/// Per-run bookkeeping for one stage.
///
/// `attempted` counts items whose `perform` ran to a done/failed outcome;
/// it always equals `succeeded + failed`. Skipped items are counted
/// separately and appear in no other bucket.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub stage: Stage,
    /// Size of the candidate set at run start.
    pub candidates: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// True when the interrupt flag cut the run short.
    pub interrupted: bool,
    /// Per-item failures, in completion order.
    pub failures: Vec<ItemFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    pub paper_id: String,
    pub error: StageError,
}

impl ExecutionReport {
    pub(crate) fn empty(stage: Stage) -> Self {
        ExecutionReport {
            stage,
            candidates: 0,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            interrupted: false,
            failures: Vec::new(),
        }
    }
}

/// Run one downstream stage over its current candidate set.
///
/// `perform` is called once per candidate and must be self-contained: the
/// returned future owns everything it touches, so items can run
/// concurrently. `after_record` fires only after a `Done` outcome is
/// durably recorded, which is the hook the Convert stage uses to delete
/// source PDFs without ever racing the record write.
///
/// # Errors
/// [`PipelineError::Store`] aborts the run; anything already recorded stays
/// recorded.
pub async fn run_stage<F, Fut>(
    store: &PaperStore,
    config: &PipelineConfig,
    stage: Stage,
    perform: F,
    after_record: Option<&(dyn Fn(&PaperRecord) + Send + Sync)>,
) -> Result<ExecutionReport, PipelineError>
where
    F: Fn(PaperRecord) -> Fut,
    Fut: Future<Output = StageOutcome> + Send + 'static,
{
    if stage == Stage::Fetched {
        return Err(PipelineError::Internal(
            "fetch runs through run_fetch, not the stage executor".into(),
        ));
    }
    let policy = config.policy_for(stage);
    let candidates = store.candidates_for(stage, policy.overwrite, policy.limit)?;

    let mut report = ExecutionReport::empty(stage);
    report.candidates = candidates.len();
    info!(
        stage = %stage,
        candidates = report.candidates,
        overwrite = policy.overwrite,
        concurrency = policy.concurrency,
        "stage run starting"
    );
    if let Some(progress) = &config.progress {
        progress.on_stage_start(stage, report.candidates);
    }

    let mut queue = candidates.into_iter();
    let mut in_flight: JoinSet<(PaperRecord, StageOutcome)> = JoinSet::new();
    let mut dispatched_any = false;

    loop {
        // Fill the in-flight window, pacing between dispatches. Once the
        // interrupt flag is seen, nothing new is dispatched.
        while in_flight.len() < policy.concurrency && !report.interrupted {
            if is_interrupted(config) {
                report.interrupted = true;
                warn!(stage = %stage, "interrupt received; draining in-flight items");
                break;
            }
            let Some(record) = queue.next() else { break };
            if dispatched_any && !policy.delay.is_zero() {
                tokio::time::sleep(policy.delay).await;
            }
            dispatched_any = true;
            let fut = perform(record.clone());
            in_flight.spawn(async move { (record, fut.await) });
        }

        let Some(joined) = in_flight.join_next().await else {
            break;
        };
        let (record, outcome) = joined
            .map_err(|e| PipelineError::Internal(format!("stage task failed: {e}")))?;
        record_outcome(store, config, stage, &record, outcome, after_record, &mut report)?;
    }

    if let Some(progress) = &config.progress {
        progress.on_stage_complete(stage, report.succeeded, report.failed);
    }
    info!(
        stage = %stage,
        attempted = report.attempted,
        succeeded = report.succeeded,
        failed = report.failed,
        skipped = report.skipped,
        interrupted = report.interrupted,
        "stage run finished"
    );
    Ok(report)
}

fn is_interrupted(config: &PipelineConfig) -> bool {
    config
        .interrupt
        .as_ref()
        .map(|flag| flag.load(Ordering::SeqCst))
        .unwrap_or(false)
}

fn record_outcome(
    store: &PaperStore,
    config: &PipelineConfig,
    stage: Stage,
    record: &PaperRecord,
    outcome: StageOutcome,
    after_record: Option<&(dyn Fn(&PaperRecord) + Send + Sync)>,
    report: &mut ExecutionReport,
) -> Result<(), PipelineError> {
    let paper_id = &record.metadata.paper_id;
    match outcome {
        StageOutcome::Done { artifact } => {
            store.record_done(paper_id, stage, &artifact)?;
            report.attempted += 1;
            report.succeeded += 1;
            debug!(stage = %stage, paper_id, artifact, "item done");
            if let Some(progress) = &config.progress {
                progress.on_item_done(stage, paper_id);
            }
            // Only after the done status is durable.
            if let Some(hook) = after_record {
                hook(record);
            }
        }
        StageOutcome::Failed { error } => {
            store.record_error(paper_id, stage, &error)?;
            report.attempted += 1;
            report.failed += 1;
            warn!(stage = %stage, paper_id, error = %error, "item failed");
            if let Some(progress) = &config.progress {
                progress.on_item_failed(stage, paper_id, &error.to_string());
            }
            report.failures.push(ItemFailure {
                paper_id: paper_id.clone(),
                error,
            });
        }
        StageOutcome::Skipped { reason } => {
            report.skipped += 1;
            debug!(stage = %stage, paper_id, reason, "item skipped");
            if let Some(progress) = &config.progress {
                progress.on_item_skipped(stage, paper_id, &reason);
            }
        }
    }
    Ok(())
}
