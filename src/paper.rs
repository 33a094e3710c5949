//! Core pipeline vocabulary: stages, statuses, paper records, summaries.
//!
//! A paper moves through four ordered stages. The first (metadata fetch) is
//! implicit — a paper record existing in the store *is* a completed fetch.
//! The three downstream stages each carry a tri-state status plus an artifact
//! path, so any stage can be re-run independently without redoing the others.

use serde::{Deserialize, Serialize};

// ── Stages ────────────────────────────────────────────────────────────────

/// The four pipeline stages, in dependency order.
///
/// Each downstream stage requires its predecessor to be `done` before a
/// paper becomes a candidate for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Metadata acquired; implicit (row existence = done).
    Fetched,
    /// PDF bytes on disk (`pdf_path`).
    Downloaded,
    /// Structured TEI XML produced from the PDF (`tei_path`).
    Converted,
    /// Section text extracted from the TEI (`text_path`).
    Extracted,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 4] = [
        Stage::Fetched,
        Stage::Downloaded,
        Stage::Converted,
        Stage::Extracted,
    ];

    /// The three stages that carry explicit status columns.
    pub const TRACKED: [Stage; 3] = [Stage::Downloaded, Stage::Converted, Stage::Extracted];

    /// The stage that must be `done` before this one can run.
    /// `Fetched` has no dependency; `Downloaded` depends on the implicit
    /// fetch, which every stored row satisfies.
    pub fn dependency(self) -> Option<Stage> {
        match self {
            Stage::Fetched => None,
            Stage::Downloaded => Some(Stage::Fetched),
            Stage::Converted => Some(Stage::Downloaded),
            Stage::Extracted => Some(Stage::Converted),
        }
    }

    /// Stable lowercase name, used in column prefixes, logs, and reports.
    pub fn name(self) -> &'static str {
        match self {
            Stage::Fetched => "fetched",
            Stage::Downloaded => "downloaded",
            Stage::Converted => "converted",
            Stage::Extracted => "extracted",
        }
    }

    /// The artifact column this stage writes, if any.
    pub fn artifact_column(self) -> Option<&'static str> {
        match self {
            Stage::Fetched => None,
            Stage::Downloaded => Some("pdf_path"),
            Stage::Converted => Some("tei_path"),
            Stage::Extracted => Some("text_path"),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ── Status ────────────────────────────────────────────────────────────────

/// Tri-state per-stage status.
///
/// Legal transitions: `Pending → Done`, `Pending → Error`, `Error → Pending`
/// (via reset), `Error → Done` only through a fresh run that re-attempts the
/// item. A stage never moves directly from `Error` to `Done` without a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Done,
    Error,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Done => "done",
            StageStatus::Error => "error",
        }
    }

    /// Parse a status column value. Unknown text maps to `None` so a row
    /// mutated outside the pipeline shows up as a hard error, not a guess.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(StageStatus::Pending),
            "done" => Some(StageStatus::Done),
            "error" => Some(StageStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Metadata ──────────────────────────────────────────────────────────────

/// Paper metadata as returned by a metadata source.
///
/// `external_ids` is carried as an opaque JSON object; the pipeline never
/// interprets it, only stores and returns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperMetadata {
    /// Source-assigned unique identifier. Primary key in the store.
    pub paper_id: String,
    pub title: String,
    #[serde(default)]
    pub r#abstract: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub venue: Option<String>,
    /// Author display names, in source order.
    #[serde(default)]
    pub authors: Vec<String>,
    /// Opaque identifier map (DOI, ArXiv, ...) from the source.
    #[serde(default)]
    pub external_ids: serde_json::Value,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub is_open_access: bool,
    /// Direct PDF URL, present only when the source reports one.
    #[serde(default)]
    pub pdf_url: Option<String>,
}

impl PaperMetadata {
    /// Minimal metadata for tests and synthetic entries.
    pub fn new(paper_id: impl Into<String>, title: impl Into<String>) -> Self {
        PaperMetadata {
            paper_id: paper_id.into(),
            title: title.into(),
            r#abstract: None,
            year: None,
            venue: None,
            authors: Vec::new(),
            external_ids: serde_json::Value::Null,
            url: None,
            is_open_access: false,
            pdf_url: None,
        }
    }
}

// ── Records ───────────────────────────────────────────────────────────────

/// Status, error bookkeeping, and artifact for one tracked stage of one
/// paper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageState {
    pub status: StageStatus,
    /// Last error message, if any. Cleared when the stage completes.
    pub error: Option<String>,
    /// 'transient' or 'permanent'; drives re-eligibility on the next run.
    pub error_kind: Option<String>,
    /// RFC 3339 timestamp of the last error.
    pub error_at: Option<String>,
    /// Path of the stage's output artifact. Present iff status is `Done`,
    /// except after a status reset, which deliberately preserves artifacts.
    pub artifact: Option<String>,
}

impl StageState {
    pub fn pending() -> Self {
        StageState {
            status: StageStatus::Pending,
            error: None,
            error_kind: None,
            error_at: None,
            artifact: None,
        }
    }
}

/// A full paper row as read from the record store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperRecord {
    pub metadata: PaperMetadata,
    pub downloaded: StageState,
    pub converted: StageState,
    pub extracted: StageState,
    pub created_at: String,
    pub updated_at: String,
}

impl PaperRecord {
    /// The state for a tracked stage. `Fetched` is implicit and has no
    /// per-row state.
    pub fn stage_state(&self, stage: Stage) -> Option<&StageState> {
        match stage {
            Stage::Fetched => None,
            Stage::Downloaded => Some(&self.downloaded),
            Stage::Converted => Some(&self.converted),
            Stage::Extracted => Some(&self.extracted),
        }
    }
}

// ── Summaries ─────────────────────────────────────────────────────────────

/// Per-stage done/pending/error counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub done: usize,
    pub pending: usize,
    pub error: usize,
}

/// A point-in-time snapshot of the whole store, one [`StageCounts`] per
/// stage. `fetched.done` equals the total row count; its other fields are
/// always zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub total: usize,
    pub fetched: StageCounts,
    pub downloaded: StageCounts,
    pub converted: StageCounts,
    pub extracted: StageCounts,
}

impl StatusSummary {
    pub fn counts_for(&self, stage: Stage) -> StageCounts {
        match stage {
            Stage::Fetched => self.fetched,
            Stage::Downloaded => self.downloaded,
            Stage::Converted => self.converted,
            Stage::Extracted => self.extracted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_dependency_chain() {
        assert_eq!(Stage::Fetched.dependency(), None);
        assert_eq!(Stage::Downloaded.dependency(), Some(Stage::Fetched));
        assert_eq!(Stage::Converted.dependency(), Some(Stage::Downloaded));
        assert_eq!(Stage::Extracted.dependency(), Some(Stage::Converted));
    }

    #[test]
    fn stage_names_are_stable() {
        let names: Vec<_> = Stage::ALL.iter().map(|s| s.name()).collect();
        assert_eq!(names, ["fetched", "downloaded", "converted", "extracted"]);
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [StageStatus::Pending, StageStatus::Done, StageStatus::Error] {
            assert_eq!(StageStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(StageStatus::parse("bogus"), None);
    }

    #[test]
    fn artifact_columns_match_stages() {
        assert_eq!(Stage::Fetched.artifact_column(), None);
        assert_eq!(Stage::Downloaded.artifact_column(), Some("pdf_path"));
        assert_eq!(Stage::Converted.artifact_column(), Some("tei_path"));
        assert_eq!(Stage::Extracted.artifact_column(), Some("text_path"));
    }
}
