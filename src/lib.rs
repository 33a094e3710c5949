//! # paperflow
//!
//! A resumable pipeline that moves academic papers through four ordered
//! stages — metadata fetch, PDF download, TEI conversion, and section
//! extraction — with per-paper progress persisted in SQLite.
//!
//! ## Why this crate?
//!
//! Building a paper corpus means talking to three flaky external systems
//! (a metadata API, publisher PDF hosts, a conversion service) for
//! thousands of items. One-shot scripts lose everything on the first
//! timeout. This crate instead treats the corpus as a state machine: every
//! paper carries a tri-state status per stage, every outcome is recorded
//! durably the moment it happens, and any stage can be re-run at any time —
//! it simply picks up the papers that still need it.
//!
//! ## Pipeline Overview
//!
//! ```text
//! search query
//!  │
//!  ├─ 1. Fetch     page through the metadata API, upsert paper records
//!  ├─ 2. Download  retrieve each PDF, validate magic bytes + content type
//!  ├─ 3. Convert   POST each PDF to a GROBID-compatible service → TEI XML
//!  └─ 4. Extract   split the TEI into Markdown section text
//! ```
//!
//! Stages hand off only through the record store. Transient failures (rate
//! limits, timeouts) become candidates again on the next run; permanent
//! failures (404s, rejected documents) stay parked until `overwrite` or a
//! reset. Interrupting a run loses nothing: in-flight items are drained and
//! recorded.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use paperflow::{FetchRequest, Mode, Orchestrator, PipelineConfig, StageOps};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder()
//!         .db_path("papers.db")
//!         .storage_root("storage")
//!         .build()?;
//!     let ops = StageOps::live("http://localhost:8070")?;
//!     let orchestrator = Orchestrator::new(config, ops)?;
//!
//!     let report = orchestrator
//!         .run(Mode::FullRun(FetchRequest::new("retrieval augmented generation")))
//!         .await?;
//!     println!("{} papers extracted", report.summary.extracted.done);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `paperflow` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only
//! deps:
//! ```toml
//! paperflow = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod paper;
pub mod pipeline;
pub mod progress;
pub mod reset;
pub mod sandbox;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{FetchRequest, PipelineConfig, PipelineConfigBuilder, StagePolicy};
pub use error::{PipelineError, StageError};
pub use orchestrator::{Mode, Orchestrator, RunReport, StageOps};
pub use paper::{PaperMetadata, PaperRecord, Stage, StageCounts, StageStatus, StatusSummary};
pub use pipeline::{
    DocumentConverter, ExecutionReport, HttpPdfFetcher, MetadataSource, PdfFetcher, ScholarClient,
    SectionExtractor, StageOutcome, TeiSectionExtractor, TeiServiceClient,
};
pub use progress::{NoopProgress, PipelineProgress, ProgressCallback};
pub use reset::{ResetOutcome, ResetScope, WipeConfirmation};
pub use sandbox::ExperimentSandbox;
pub use store::PaperStore;
