//! Reset controller: status reset and confirmed full wipe.
//!
//! Two scopes with very different blast radii. A status reset is cheap and
//! recoverable (artifacts stay on disk, the next run re-adopts them). A full
//! wipe destroys the dataset and therefore demands two independent
//! confirmations, so a single misplaced flag can never trigger it.

use std::fs;
use std::path::Path;

use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::store::PaperStore;

/// Explicit consent for a full wipe.
///
/// Both acknowledgements must be obtained independently — the CLI asks two
/// separate interactive questions, non-interactive callers pass two separate
/// flags. Constructing one half-confirmed is allowed; using it is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WipeConfirmation {
    acknowledge_data_loss: bool,
    acknowledge_irreversible: bool,
}

impl WipeConfirmation {
    pub fn new(acknowledge_data_loss: bool, acknowledge_irreversible: bool) -> Self {
        WipeConfirmation {
            acknowledge_data_loss,
            acknowledge_irreversible,
        }
    }

    /// True only when both acknowledgements were given.
    pub fn is_confirmed(&self) -> bool {
        self.acknowledge_data_loss && self.acknowledge_irreversible
    }
}

/// What a reset should cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetScope {
    /// Set every downstream stage back to `pending`, clear error fields,
    /// keep all rows and all artifact files.
    Status,
    /// Delete every paper record; optionally delete artifact files under
    /// the configured storage roots too.
    Full {
        confirmation: WipeConfirmation,
        remove_artifacts: bool,
    },
}

/// What a reset actually did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetOutcome {
    /// Rows reset (status scope) or deleted (full scope).
    pub papers_affected: usize,
    /// Artifact files removed from disk.
    pub artifacts_removed: usize,
}

/// Apply a reset to the store (and, for a full wipe, the storage roots).
///
/// # Errors
/// [`PipelineError::WipeNotConfirmed`] for a full wipe without both
/// confirmations; [`PipelineError::StorageIo`] if an artifact file cannot be
/// removed.
pub fn run_reset(
    store: &PaperStore,
    config: &PipelineConfig,
    scope: &ResetScope,
) -> Result<ResetOutcome, PipelineError> {
    match scope {
        ResetScope::Status => {
            let papers_affected = store.reset_status()?;
            Ok(ResetOutcome {
                papers_affected,
                artifacts_removed: 0,
            })
        }
        ResetScope::Full {
            confirmation,
            remove_artifacts,
        } => {
            // Confirmation is checked before any mutation, including file
            // removal.
            if !confirmation.is_confirmed() {
                return Err(PipelineError::WipeNotConfirmed);
            }
            let papers_affected = store.wipe_all(confirmation)?;
            let mut artifacts_removed = 0;
            if *remove_artifacts {
                for root in config.storage_roots() {
                    artifacts_removed += remove_files_under(root)?;
                }
            }
            info!(papers_affected, artifacts_removed, "full wipe complete");
            Ok(ResetOutcome {
                papers_affected,
                artifacts_removed,
            })
        }
    }
}

/// Delete regular files directly under `root`. Storage roots are flat by
/// construction; anything nested was not written by the pipeline and is left
/// alone.
fn remove_files_under(root: &Path) -> Result<usize, PipelineError> {
    if !root.exists() {
        return Ok(0);
    }
    let entries = fs::read_dir(root).map_err(|source| PipelineError::StorageIo {
        path: root.to_path_buf(),
        source,
    })?;
    let mut removed = 0;
    for entry in entries {
        let entry = entry.map_err(|source| PipelineError::StorageIo {
            path: root.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_file() {
            fs::remove_file(&path).map_err(|source| PipelineError::StorageIo {
                path: path.clone(),
                source,
            })?;
            removed += 1;
        } else {
            warn!(path = %path.display(), "leaving non-file entry in storage root");
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper::PaperMetadata;

    fn seeded_store() -> PaperStore {
        let store = PaperStore::in_memory().unwrap();
        store.upsert_paper(&PaperMetadata::new("p0", "Paper 0")).unwrap();
        store.upsert_paper(&PaperMetadata::new("p1", "Paper 1")).unwrap();
        store
    }

    #[test]
    fn confirmation_requires_both_flags() {
        assert!(!WipeConfirmation::new(false, false).is_confirmed());
        assert!(!WipeConfirmation::new(true, false).is_confirmed());
        assert!(!WipeConfirmation::new(false, true).is_confirmed());
        assert!(WipeConfirmation::new(true, true).is_confirmed());
    }

    #[test]
    fn status_reset_needs_no_confirmation() {
        let store = seeded_store();
        let config = PipelineConfig::default();
        let outcome = run_reset(&store, &config, &ResetScope::Status).unwrap();
        assert_eq!(outcome.papers_affected, 2);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn unconfirmed_full_wipe_is_a_no_op_error() {
        let store = seeded_store();
        let config = PipelineConfig::default();
        let err = run_reset(
            &store,
            &config,
            &ResetScope::Full {
                confirmation: WipeConfirmation::new(true, false),
                remove_artifacts: false,
            },
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::WipeNotConfirmed));
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn full_wipe_removes_rows_and_artifacts() {
        let store = seeded_store();
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::builder()
            .storage_root(dir.path())
            .build()
            .unwrap();
        std::fs::create_dir_all(&config.pdf_dir).unwrap();
        std::fs::write(config.pdf_dir.join("p0.pdf"), b"%PDF-1.4").unwrap();

        let outcome = run_reset(
            &store,
            &config,
            &ResetScope::Full {
                confirmation: WipeConfirmation::new(true, true),
                remove_artifacts: true,
            },
        )
        .unwrap();
        assert_eq!(outcome.papers_affected, 2);
        assert_eq!(outcome.artifacts_removed, 1);
        assert_eq!(store.count().unwrap(), 0);
        assert!(!config.pdf_dir.join("p0.pdf").exists());
    }

    #[test]
    fn missing_storage_roots_are_fine() {
        let store = seeded_store();
        let config = PipelineConfig::builder()
            .storage_root("does/not/exist")
            .build()
            .unwrap();
        let outcome = run_reset(
            &store,
            &config,
            &ResetScope::Full {
                confirmation: WipeConfirmation::new(true, true),
                remove_artifacts: true,
            },
        )
        .unwrap();
        assert_eq!(outcome.artifacts_removed, 0);
    }
}
