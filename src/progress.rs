//! Progress-callback trait for per-item stage events.
//!
//! Inject an [`Arc<dyn PipelineProgress>`] via
//! [`crate::config::PipelineConfigBuilder::progress`] to receive real-time
//! events as a stage works through its candidates.
//!
//! # Why callbacks instead of channels?
//!
//! The callback approach is the least-invasive integration point: callers can
//! forward events to a Tokio broadcast channel, a WebSocket, a database
//! record, or a terminal progress bar — without the library knowing anything
//! about how the host application communicates. The trait is `Send + Sync` so
//! it works correctly when items are processed concurrently via spawned
//! tasks.

use crate::paper::Stage;
use std::sync::Arc;

/// Called by a stage executor as it works through its candidate set.
///
/// Implementations must be `Send + Sync` (items may be in flight
/// concurrently when a stage's concurrency cap is above 1). All methods have
/// default no-op implementations so callers only override what they care
/// about.
///
/// # Thread safety
///
/// `on_item_done`, `on_item_failed`, and `on_item_skipped` are invoked from
/// the executor's driver loop, one at a time, as completions are recorded —
/// but a different thread may be running the loop for each stage, so shared
/// mutable state still needs synchronisation.
pub trait PipelineProgress: Send + Sync {
    /// Called once before a stage dispatches its first item.
    fn on_stage_start(&self, stage: Stage, total: usize) {
        let _ = (stage, total);
    }

    /// Called when an item completes and its outcome is recorded.
    fn on_item_done(&self, stage: Stage, paper_id: &str) {
        let _ = (stage, paper_id);
    }

    /// Called when an item fails and its error is recorded.
    fn on_item_failed(&self, stage: Stage, paper_id: &str, error: &str) {
        let _ = (stage, paper_id, error);
    }

    /// Called when an item is skipped (no error recorded, not retried).
    fn on_item_skipped(&self, stage: Stage, paper_id: &str, reason: &str) {
        let _ = (stage, paper_id, reason);
    }

    /// Called once after all candidates have been attempted or the run was
    /// interrupted.
    fn on_stage_complete(&self, stage: Stage, succeeded: usize, failed: usize) {
        let _ = (stage, succeeded, failed);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgress;

impl PipelineProgress for NoopProgress {}

/// Convenience alias matching the type stored in
/// [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgress>;
