//! Configuration types for the paper pipeline.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`]. Keeping every knob in one struct makes it
//! trivial to share configs across tasks, log them at run start, and diff two
//! runs to understand why their outputs differ.
//!
//! # Design choice: builder over constructor
//! A fifteen-field constructor is unreadable and breaks on every new field.
//! The builder pattern lets callers set only what they care about and rely on
//! well-documented defaults for the rest.

use crate::error::PipelineError;
use crate::paper::Stage;
use crate::progress::PipelineProgress;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

// ── Per-stage policy ──────────────────────────────────────────────────────

/// Execution policy for one stage run.
///
/// Every stage accepts the same four knobs; their defaults differ per stage
/// (see [`PipelineConfig`] field docs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePolicy {
    /// Maximum number of candidates to process this run. `None` = all.
    pub limit: Option<usize>,

    /// Pause between successive dispatches. Default varies per stage; used
    /// to stay polite toward external services.
    pub delay: Duration,

    /// Re-process items already `done` or in a permanent error state.
    /// Default: `false` — only pending items and transient errors run.
    pub overwrite: bool,

    /// Maximum in-flight items. Default: 1 (strictly sequential, the safe
    /// setting for rate-limited services). Must be at least 1.
    pub concurrency: usize,
}

impl StagePolicy {
    fn with_delay(delay_ms: u64) -> Self {
        StagePolicy {
            limit: None,
            delay: Duration::from_millis(delay_ms),
            overwrite: false,
            concurrency: 1,
        }
    }
}

impl Default for StagePolicy {
    fn default() -> Self {
        StagePolicy::with_delay(0)
    }
}

// ── Fetch request ─────────────────────────────────────────────────────────

/// Parameters for the metadata-fetch entry point.
///
/// The query string is passed through to the metadata source verbatim; the
/// pipeline attaches no semantics to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub query: String,

    /// Total number of results wanted. The client pages through the source
    /// API in batches of at most 100 until this many are collected or the
    /// source is exhausted. Default: 100.
    pub desired_total: usize,

    /// Fields-of-study filter forwarded to the source, comma-joined.
    pub fields_of_study: Vec<String>,

    /// Restrict the search itself to open-access papers.
    pub open_access_only: bool,

    /// Publication-year filter, e.g. "2019-2024" or "2020".
    pub year: Option<String>,
}

impl FetchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        FetchRequest {
            query: query.into(),
            desired_total: 100,
            fields_of_study: Vec::new(),
            open_access_only: false,
            year: None,
        }
    }
}

// ── Pipeline config ───────────────────────────────────────────────────────

/// Configuration for a pipeline run.
///
/// Built via [`PipelineConfig::builder()`] or [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use paperflow::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .db_path("papers.db")
///     .pdf_dir("storage/pdf")
///     .all_access(true)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Path of the SQLite record-store file. Default: `papers.db`.
    pub db_path: PathBuf,

    /// Storage root for downloaded PDFs. Default: `storage/pdf`.
    pub pdf_dir: PathBuf,

    /// Storage root for converted TEI XML. Default: `storage/tei`.
    pub tei_dir: PathBuf,

    /// Storage root for extracted section text. Default: `storage/text`.
    pub text_dir: PathBuf,

    /// Attempt downloads for papers without an open-access flag too.
    /// Default: `false` — non-open-access papers are skipped, not errored.
    pub all_access: bool,

    /// Delete the source PDF once its conversion outcome is durably
    /// recorded. Default: `false`. Space saver for large corpora.
    pub delete_pdf_after_convert: bool,

    /// Skip the Convert stage during a full run. Default: `false`.
    pub skip_convert: bool,

    /// Skip the Extract stage during a full run. Default: `false`.
    pub skip_extract: bool,

    /// Policy for the Fetch stage. Default delay: 150 ms between search
    /// pages (the metadata API rate-limits unauthenticated clients hard).
    pub fetch_policy: StagePolicy,

    /// Policy for the Download stage. Default delay: 500 ms — publisher
    /// hosts throttle rapid-fire PDF requests.
    pub download_policy: StagePolicy,

    /// Policy for the Convert stage. Default delay: 100 ms.
    pub convert_policy: StagePolicy,

    /// Policy for the Extract stage. Local CPU work, default delay: 0.
    pub extract_policy: StagePolicy,

    /// Optional progress callback receiving per-item events.
    pub progress: Option<Arc<dyn PipelineProgress>>,

    /// Cooperative interrupt flag. When set to `true` mid-run, stages stop
    /// dispatching new items, drain in-flight work, and record outcomes.
    pub interrupt: Option<Arc<AtomicBool>>,
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// The policy governing a given stage.
    pub fn policy_for(&self, stage: Stage) -> &StagePolicy {
        match stage {
            Stage::Fetched => &self.fetch_policy,
            Stage::Downloaded => &self.download_policy,
            Stage::Converted => &self.convert_policy,
            Stage::Extracted => &self.extract_policy,
        }
    }

    /// The storage root a stage writes its artifacts under, if any.
    pub fn artifact_dir(&self, stage: Stage) -> Option<&PathBuf> {
        match stage {
            Stage::Fetched => None,
            Stage::Downloaded => Some(&self.pdf_dir),
            Stage::Converted => Some(&self.tei_dir),
            Stage::Extracted => Some(&self.text_dir),
        }
    }

    /// All storage roots, for overlap checks and wipe traversal.
    pub fn storage_roots(&self) -> [&PathBuf; 3] {
        [&self.pdf_dir, &self.tei_dir, &self.text_dir]
    }

    /// A copy of this config pointed at a different database and storage
    /// parent.
    ///
    /// Everything else — per-stage policies, access and skip flags, the
    /// progress callback, the interrupt flag — carries over unchanged, so
    /// an experiment run behaves exactly like the primary run would, just
    /// against its own data.
    pub fn relocated(
        &self,
        db_path: impl Into<PathBuf>,
        storage_root: impl Into<PathBuf>,
    ) -> PipelineConfig {
        let root = storage_root.into();
        PipelineConfig {
            db_path: db_path.into(),
            pdf_dir: root.join("pdf"),
            tei_dir: root.join("tei"),
            text_dir: root.join("text"),
            ..self.clone()
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            db_path: PathBuf::from("papers.db"),
            pdf_dir: PathBuf::from("storage/pdf"),
            tei_dir: PathBuf::from("storage/tei"),
            text_dir: PathBuf::from("storage/text"),
            all_access: false,
            delete_pdf_after_convert: false,
            skip_convert: false,
            skip_extract: false,
            fetch_policy: StagePolicy::with_delay(150),
            download_policy: StagePolicy::with_delay(500),
            convert_policy: StagePolicy::with_delay(100),
            extract_policy: StagePolicy::with_delay(0),
            progress: None,
            interrupt: None,
        }
    }
}

// Manual Debug: `progress` and `interrupt` hold trait objects that don't
// implement Debug.
impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("db_path", &self.db_path)
            .field("pdf_dir", &self.pdf_dir)
            .field("tei_dir", &self.tei_dir)
            .field("text_dir", &self.text_dir)
            .field("all_access", &self.all_access)
            .field("delete_pdf_after_convert", &self.delete_pdf_after_convert)
            .field("skip_convert", &self.skip_convert)
            .field("skip_extract", &self.skip_extract)
            .field("fetch_policy", &self.fetch_policy)
            .field("download_policy", &self.download_policy)
            .field("convert_policy", &self.convert_policy)
            .field("extract_policy", &self.extract_policy)
            .field("progress", &self.progress.as_ref().map(|_| "<callback>"))
            .field("interrupt", &self.interrupt.as_ref().map(|_| "<flag>"))
            .finish()
    }
}

// ── Builder ───────────────────────────────────────────────────────────────

/// Builder for [`PipelineConfig`]. Every setter is optional; unset fields
/// take the documented defaults.
#[derive(Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.db_path = path.into();
        self
    }

    pub fn pdf_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdf_dir = path.into();
        self
    }

    pub fn tei_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.tei_dir = path.into();
        self
    }

    pub fn text_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.text_dir = path.into();
        self
    }

    /// Put all three storage roots under one parent directory.
    pub fn storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        self.config.pdf_dir = root.join("pdf");
        self.config.tei_dir = root.join("tei");
        self.config.text_dir = root.join("text");
        self
    }

    pub fn all_access(mut self, yes: bool) -> Self {
        self.config.all_access = yes;
        self
    }

    pub fn delete_pdf_after_convert(mut self, yes: bool) -> Self {
        self.config.delete_pdf_after_convert = yes;
        self
    }

    pub fn skip_convert(mut self, yes: bool) -> Self {
        self.config.skip_convert = yes;
        self
    }

    pub fn skip_extract(mut self, yes: bool) -> Self {
        self.config.skip_extract = yes;
        self
    }

    pub fn fetch_policy(mut self, policy: StagePolicy) -> Self {
        self.config.fetch_policy = policy;
        self
    }

    pub fn download_policy(mut self, policy: StagePolicy) -> Self {
        self.config.download_policy = policy;
        self
    }

    pub fn convert_policy(mut self, policy: StagePolicy) -> Self {
        self.config.convert_policy = policy;
        self
    }

    pub fn extract_policy(mut self, policy: StagePolicy) -> Self {
        self.config.extract_policy = policy;
        self
    }

    /// Apply one policy to every stage. Convenient for tests and `--limit`
    /// style CLI flags that should affect whichever stage runs.
    pub fn all_policies(mut self, policy: StagePolicy) -> Self {
        self.config.fetch_policy = policy.clone();
        self.config.download_policy = policy.clone();
        self.config.convert_policy = policy.clone();
        self.config.extract_policy = policy;
        self
    }

    pub fn progress(mut self, callback: Arc<dyn PipelineProgress>) -> Self {
        self.config.progress = Some(callback);
        self
    }

    pub fn interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.config.interrupt = Some(flag);
        self
    }

    /// Validate and produce the config.
    ///
    /// # Errors
    /// [`PipelineError::InvalidConfig`] when a concurrency cap is zero or a
    /// storage root collides with another.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        for (stage, policy) in [
            (Stage::Fetched, &c.fetch_policy),
            (Stage::Downloaded, &c.download_policy),
            (Stage::Converted, &c.convert_policy),
            (Stage::Extracted, &c.extract_policy),
        ] {
            if policy.concurrency == 0 {
                return Err(PipelineError::InvalidConfig(format!(
                    "{stage} concurrency must be at least 1"
                )));
            }
            if policy.limit == Some(0) {
                return Err(PipelineError::InvalidConfig(format!(
                    "{stage} limit of 0 would process nothing; omit the limit instead"
                )));
            }
        }
        let roots = c.storage_roots();
        for i in 0..roots.len() {
            for j in (i + 1)..roots.len() {
                if roots[i] == roots[j] {
                    return Err(PipelineError::InvalidConfig(format!(
                        "storage roots must be distinct: '{}' is used twice",
                        roots[i].display()
                    )));
                }
            }
        }
        Ok(self.config)
    }
}
