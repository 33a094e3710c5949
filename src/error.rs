//! Error types for the paperflow library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PipelineError`] — **Fatal**: the run cannot proceed at all (invalid
//!   policy, sandbox/primary collision, record store unreachable, metadata
//!   search rejected outright). Returned as `Err(PipelineError)` from the
//!   orchestrator and store entry points.
//!
//! * [`StageError`] — **Non-fatal**: a single paper failed its stage
//!   (download 404, conversion timeout) but the rest of the batch is fine.
//!   Recorded against the paper in the store and aggregated into
//!   [`crate::pipeline::ExecutionReport`] so callers can inspect partial
//!   success rather than losing the whole batch to one bad paper.
//!
//! The separation lets callers decide their own tolerance: a full run never
//! aborts on a per-paper failure, while a misconfigured sandbox aborts before
//! a single record is touched.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the paperflow library.
///
/// Per-paper failures use [`StageError`] and are recorded in the store
/// rather than propagated here.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Configuration errors ──────────────────────────────────────────────
    /// Builder or policy validation failed. Aborts before any mutation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The experiment sandbox overlaps the primary dataset.
    ///
    /// This is fatal by design: silent cross-contamination would corrupt the
    /// primary dataset's invariants, so construction refuses outright.
    #[error(
        "Experiment sandbox collides with the primary dataset on {field}: \
         primary='{primary}', experiment='{experiment}'\n\
         Give the experiment its own database file and storage roots."
    )]
    SandboxCollision {
        field: &'static str,
        primary: PathBuf,
        experiment: PathBuf,
    },

    /// `wipe_all` was called without both independent confirmations.
    ///
    /// A single flag can be passed accidentally; two cannot. The store never
    /// infers consent from flag presence alone.
    #[error("Full wipe refused: both confirmations must be given explicitly")]
    WipeNotConfirmed,

    // ── Store errors ──────────────────────────────────────────────────────
    /// The record store is unreachable or a statement failed.
    ///
    /// Fatal for the current run. Per-record atomicity bounds the damage:
    /// no partial state past the last recorded outcome is assumed.
    #[error("Record store unavailable: {source}")]
    Store {
        #[from]
        source: rusqlite::Error,
    },

    /// A stage outcome would violate the dependency ordering
    /// (e.g. marking `converted = done` while `downloaded` is not `done`).
    ///
    /// Normal operation never produces this; it exists as a defensive check
    /// against records mutated outside the pipeline.
    #[error("Dependency violation: cannot mark {stage} done for paper '{paper_id}' — prior stage is not done")]
    DependencyViolation { paper_id: String, stage: &'static str },

    // ── Fetch errors ──────────────────────────────────────────────────────
    /// The metadata source rejected the search fatally (auth failure,
    /// malformed query). Transient failures are retried inside the Fetch
    /// stage and never surface here.
    #[error("Metadata search failed: {detail}")]
    MetadataSearchFailed { detail: String },

    /// A required external service failed its health probe before the batch
    /// started. Aborting up front beats recording one transient error per
    /// candidate.
    #[error("{service} is not reachable at {url}; is the service running?")]
    ServiceUnavailable { service: &'static str, url: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create a storage root or write a run artifact.
    #[error("Failed to prepare storage path '{path}': {source}")]
    StorageIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single paper within a stage run.
///
/// The two variants drive candidate eligibility on the *next* run:
/// transient errors are re-eligible automatically, permanent errors need
/// `overwrite` or a status reset. Neither is retried within the same run.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum StageError {
    /// Network/service hiccup — eligible for retry on the next run.
    #[error("transient: {detail}")]
    Transient { detail: String },

    /// Malformed input or definitive rejection — excluded from future
    /// candidates unless `overwrite` is set.
    #[error("permanent: {detail}")]
    Permanent { detail: String },
}

impl StageError {
    pub fn transient(detail: impl Into<String>) -> Self {
        StageError::Transient { detail: detail.into() }
    }

    pub fn permanent(detail: impl Into<String>) -> Self {
        StageError::Permanent { detail: detail.into() }
    }

    /// Stable tag persisted in the store's `*_error_kind` column.
    pub fn kind(&self) -> &'static str {
        match self {
            StageError::Transient { .. } => "transient",
            StageError::Permanent { .. } => "permanent",
        }
    }

    /// The human-readable detail without the kind prefix.
    pub fn detail(&self) -> &str {
        match self {
            StageError::Transient { detail } | StageError::Permanent { detail } => detail,
        }
    }
}
