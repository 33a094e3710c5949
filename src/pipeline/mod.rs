//! Pipeline stages for paper processing.
//!
//! Each submodule implements exactly one stage. Keeping stages separate
//! makes each independently testable and lets us swap collaborator
//! implementations (e.g. a different metadata source) without touching
//! other stages.
//!
//! ## Data Flow
//!
//! ```text
//! fetch ──▶ download ──▶ convert ──▶ extract
//! (metadata)  (PDF)      (TEI XML)   (section text)
//! ```
//!
//! 1. [`fetch`]    — query a metadata source and upsert paper records; the
//!    pipeline's entry point, the only stage without a candidate query
//! 2. [`download`] — retrieve each paper's PDF and validate it
//! 3. [`convert`]  — submit each PDF to the conversion service for TEI XML
//! 4. [`extract`]  — split the TEI into section text; the only stage without
//!    network I/O
//!
//! All three downstream stages run through the generic [`executor`], which
//! owns candidate selection, pacing, bounded parallelism, per-record outcome
//! recording, and cooperative interruption. A stage contributes only its
//! `perform` function.

pub mod convert;
pub mod download;
pub mod executor;
pub mod extract;
pub mod fetch;

use std::path::{Path, PathBuf};

use crate::error::StageError;

pub use convert::{run_convert, DocumentConverter, TeiServiceClient};
pub use download::{run_download, HttpPdfFetcher, PdfFetcher};
pub use executor::{run_stage, ExecutionReport, ItemFailure, StageOutcome};
pub use extract::{run_extract, SectionExtractor, TeiSectionExtractor};
pub use fetch::{run_fetch, MetadataSource, ScholarClient, SearchPage};

/// Artifact file name for a paper, with path-hostile characters escaped.
///
/// Source-assigned ids are normally plain hex, but ids from other sources
/// can carry slashes (e.g. DOIs), which must never become path components.
/// Each byte outside the safe set (including `_` itself) becomes `_xx` hex,
/// so distinct ids always map to distinct file names and one paper can never
/// adopt or overwrite another's artifact.
pub(crate) fn artifact_file_name(paper_id: &str, extension: &str) -> String {
    let mut safe = String::with_capacity(paper_id.len());
    for c in paper_id.chars() {
        if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
            safe.push(c);
        } else {
            let mut buf = [0u8; 4];
            for b in c.encode_utf8(&mut buf).bytes() {
                safe.push_str(&format!("_{b:02x}"));
            }
        }
    }
    format!("{safe}.{extension}")
}

/// Atomic write: write to a sibling `.tmp` file, then rename over the
/// destination. A crash mid-write leaves either the old artifact or none —
/// never a truncated one that a `done` status would then vouch for.
pub(crate) async fn write_artifact(path: &Path, bytes: &[u8]) -> Result<(), StageError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StageError::transient(format!("create {}: {e}", parent.display())))?;
    }
    let tmp_path = tmp_sibling(path);
    tokio::fs::write(&tmp_path, bytes)
        .await
        .map_err(|e| StageError::transient(format!("write {}: {e}", tmp_path.display())))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| StageError::transient(format!("rename to {}: {e}", path.display())))?;
    Ok(())
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}
