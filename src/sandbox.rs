//! Experiment sandbox: an isolated pipeline namespace.
//!
//! An experiment gets its own database file and its own storage roots, and
//! construction proves it: any overlap with the primary dataset — same db
//! path, same root, or one root nested inside the other — is a fatal
//! [`PipelineError::SandboxCollision`] before a single record is touched.
//! Runs inside the sandbox can therefore never mutate primary state, and
//! discarding an experiment is `rm -rf` on its directory.

use std::path::Path;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::orchestrator::{Orchestrator, StageOps};

/// An orchestrator bound to a verified-isolated configuration.
pub struct ExperimentSandbox {
    orchestrator: Orchestrator,
}

impl std::fmt::Debug for ExperimentSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentSandbox").finish_non_exhaustive()
    }
}

impl ExperimentSandbox {
    /// Verify isolation between `primary` and `experiment`, then open the
    /// experiment's own store.
    pub fn new(
        primary: &PipelineConfig,
        experiment: PipelineConfig,
        ops: StageOps,
    ) -> Result<Self, PipelineError> {
        check_isolation(primary, &experiment)?;
        let orchestrator = Orchestrator::new(experiment, ops)?;
        Ok(ExperimentSandbox { orchestrator })
    }

    /// The orchestrator operating inside the sandbox.
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }
}

/// Assert that the experiment shares no state location with the primary.
///
/// Nesting counts as overlap in both directions: an experiment root inside
/// a primary root would let a full wipe of the experiment delete primary
/// artifacts, and the converse would let primary runs write into the
/// experiment.
pub fn check_isolation(
    primary: &PipelineConfig,
    experiment: &PipelineConfig,
) -> Result<(), PipelineError> {
    if experiment.db_path == primary.db_path {
        return Err(PipelineError::SandboxCollision {
            field: "db_path",
            primary: primary.db_path.clone(),
            experiment: experiment.db_path.clone(),
        });
    }

    let primary_roots = [
        ("pdf_dir", &primary.pdf_dir),
        ("tei_dir", &primary.tei_dir),
        ("text_dir", &primary.text_dir),
    ];
    let experiment_roots = [
        ("pdf_dir", &experiment.pdf_dir),
        ("tei_dir", &experiment.tei_dir),
        ("text_dir", &experiment.text_dir),
    ];
    for (field, experiment_root) in experiment_roots {
        for (_, primary_root) in primary_roots {
            if paths_overlap(primary_root, experiment_root) {
                return Err(PipelineError::SandboxCollision {
                    field,
                    primary: primary_root.clone(),
                    experiment: experiment_root.clone(),
                });
            }
        }
    }
    Ok(())
}

fn paths_overlap(a: &Path, b: &Path) -> bool {
    a == b || a.starts_with(b) || b.starts_with(a)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn primary() -> PipelineConfig {
        PipelineConfig::builder()
            .db_path("data/papers.db")
            .storage_root("data/storage")
            .build()
            .unwrap()
    }

    #[test]
    fn disjoint_experiment_passes() {
        let experiment = PipelineConfig::builder()
            .db_path("experiments/exp1/papers.db")
            .storage_root("experiments/exp1/storage")
            .build()
            .unwrap();
        check_isolation(&primary(), &experiment).unwrap();
    }

    #[test]
    fn relocated_primary_config_passes_isolation() {
        // The CLI derives the experiment config from the fully-configured
        // primary one; only its paths move, and that is enough to isolate.
        let primary = primary();
        let experiment = primary.relocated("experiments/exp1/papers.db", "experiments/exp1/storage");
        check_isolation(&primary, &experiment).unwrap();
    }

    #[test]
    fn shared_db_path_is_a_collision() {
        let experiment = PipelineConfig::builder()
            .db_path("data/papers.db")
            .storage_root("experiments/exp1")
            .build()
            .unwrap();
        let err = check_isolation(&primary(), &experiment).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::SandboxCollision { field: "db_path", .. }
        ));
    }

    #[test]
    fn experiment_root_nested_in_primary_is_a_collision() {
        let experiment = PipelineConfig::builder()
            .db_path("experiments/exp1/papers.db")
            .pdf_dir("data/storage/pdf/exp1")
            .tei_dir("experiments/exp1/tei")
            .text_dir("experiments/exp1/text")
            .build()
            .unwrap();
        let err = check_isolation(&primary(), &experiment).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::SandboxCollision { field: "pdf_dir", .. }
        ));
    }

    #[test]
    fn primary_root_nested_in_experiment_is_a_collision() {
        // The experiment claims a directory that contains every primary root.
        let experiment = PipelineConfig::builder()
            .db_path("experiments/papers.db")
            .pdf_dir("data/storage")
            .tei_dir("experiments/tei")
            .text_dir("experiments/text")
            .build()
            .unwrap();
        let err = check_isolation(&primary(), &experiment).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::SandboxCollision { field: "pdf_dir", .. }
        ));
    }
}
