//! SQLite-backed record store: one row per paper, tri-state status per
//! downstream stage.
//!
//! The store is the pipeline's single source of truth. Every stage reads its
//! candidates from here and writes its outcomes back here, one atomic UPDATE
//! per record, so a crash mid-run loses at most the in-flight items — never a
//! recorded outcome.
//!
//! # Why SQLite
//!
//! The corpus tops out in the tens of thousands of rows with one writer; a
//! single WAL-journalled file gives durable per-record commits, a queryable
//! status model, and zero operational surface.

use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::error::{PipelineError, StageError};
use crate::paper::{
    PaperMetadata, PaperRecord, Stage, StageCounts, StageState, StageStatus, StatusSummary,
};
use crate::reset::WipeConfirmation;

/// SQLite-backed paper store.
///
/// Not `Sync`: the executor's driver loop owns the store and records
/// outcomes serially as completions arrive.
pub struct PaperStore {
    conn: Connection,
}

impl PaperStore {
    /// Open a file-backed store at `path`, creating the schema if absent.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PipelineError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Open an in-memory store. Used by tests and dry runs.
    pub fn in_memory() -> Result<Self, PipelineError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), PipelineError> {
        // Pragmas for durability: a recorded outcome must survive a crash.
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "FULL")?;

        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS papers (
                paper_id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                abstract TEXT,
                year INTEGER,
                venue TEXT,
                authors TEXT NOT NULL DEFAULT '[]',
                external_ids TEXT NOT NULL DEFAULT 'null',
                url TEXT,
                is_open_access INTEGER NOT NULL DEFAULT 0,
                pdf_url TEXT,

                downloaded_status TEXT NOT NULL DEFAULT 'pending',
                downloaded_error TEXT,
                downloaded_error_kind TEXT,
                downloaded_error_at TEXT,
                pdf_path TEXT,

                converted_status TEXT NOT NULL DEFAULT 'pending',
                converted_error TEXT,
                converted_error_kind TEXT,
                converted_error_at TEXT,
                tei_path TEXT,

                extracted_status TEXT NOT NULL DEFAULT 'pending',
                extracted_error TEXT,
                extracted_error_kind TEXT,
                extracted_error_at TEXT,
                text_path TEXT,

                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_papers_downloaded_status
                ON papers(downloaded_status);
            CREATE INDEX IF NOT EXISTS idx_papers_converted_status
                ON papers(converted_status);
            CREATE INDEX IF NOT EXISTS idx_papers_extracted_status
                ON papers(extracted_status);
            "#,
        )?;
        debug!("record store schema ready");
        Ok(())
    }

    // ── Upsert ────────────────────────────────────────────────────────────

    /// Insert or update a paper's metadata.
    ///
    /// The conflict clause lists only metadata columns: re-fetching a paper
    /// refreshes its metadata but never disturbs stage status or artifacts,
    /// which is what makes the Fetch stage idempotent.
    pub fn upsert_paper(&self, meta: &PaperMetadata) -> Result<String, PipelineError> {
        let authors = serde_json::to_string(&meta.authors)
            .map_err(|e| PipelineError::Internal(format!("serialise authors: {e}")))?;
        let external_ids = serde_json::to_string(&meta.external_ids)
            .map_err(|e| PipelineError::Internal(format!("serialise external_ids: {e}")))?;
        let now = Utc::now().to_rfc3339();

        self.conn.execute(
            r#"
            INSERT INTO papers (
                paper_id, title, abstract, year, venue, authors, external_ids,
                url, is_open_access, pdf_url, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
            ON CONFLICT(paper_id) DO UPDATE SET
                title=excluded.title,
                abstract=excluded.abstract,
                year=excluded.year,
                venue=excluded.venue,
                authors=excluded.authors,
                external_ids=excluded.external_ids,
                url=excluded.url,
                is_open_access=excluded.is_open_access,
                pdf_url=excluded.pdf_url,
                updated_at=excluded.updated_at
            "#,
            params![
                meta.paper_id,
                meta.title,
                meta.r#abstract,
                meta.year,
                meta.venue,
                authors,
                external_ids,
                meta.url,
                meta.is_open_access as i64,
                meta.pdf_url,
                now,
            ],
        )?;
        Ok(meta.paper_id.clone())
    }

    // ── Candidate selection ───────────────────────────────────────────────

    /// Papers eligible for `stage` under the given policy, in insertion
    /// order.
    ///
    /// Eligible means: the dependency stage is `done`, and the stage itself
    /// is `pending`, or in a *transient* error state, or (with `overwrite`)
    /// already `done` or in any error state. Permanent errors without
    /// `overwrite` stay parked until a reset.
    pub fn candidates_for(
        &self,
        stage: Stage,
        overwrite: bool,
        limit: Option<usize>,
    ) -> Result<Vec<PaperRecord>, PipelineError> {
        let prefix = match stage {
            Stage::Fetched => {
                return Err(PipelineError::Internal(
                    "fetch has no candidate query; it is the pipeline entry point".into(),
                ))
            }
            tracked => tracked.name(),
        };
        // Fetch is implicit, so Download's dependency is satisfied by row
        // existence.
        let dep_clause = match stage {
            Stage::Downloaded => "1=1",
            Stage::Converted => "downloaded_status = 'done'",
            Stage::Extracted => "converted_status = 'done'",
            Stage::Fetched => unreachable!(),
        };
        let overwrite_clause = if overwrite {
            format!("OR {prefix}_status IN ('done', 'error')")
        } else {
            String::new()
        };
        let sql = format!(
            "SELECT * FROM papers
             WHERE {dep_clause}
               AND ({prefix}_status = 'pending'
                    OR ({prefix}_status = 'error' AND {prefix}_error_kind = 'transient')
                    {overwrite_clause})
             ORDER BY rowid
             LIMIT ?1"
        );
        let limit = limit.map(|n| n as i64).unwrap_or(-1);

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit], row_to_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        debug!(stage = %stage, overwrite, count = records.len(), "selected candidates");
        Ok(records)
    }

    // ── Outcome recording ─────────────────────────────────────────────────

    /// Record a successful stage completion: status `done`, artifact set,
    /// error fields cleared. One atomic UPDATE.
    ///
    /// The UPDATE's WHERE clause re-checks the dependency, so a record
    /// mutated outside the pipeline cannot be pushed into an inconsistent
    /// state; the violation surfaces as an error instead of being written.
    pub fn record_done(
        &self,
        paper_id: &str,
        stage: Stage,
        artifact: &str,
    ) -> Result<(), PipelineError> {
        let prefix = stage.name();
        let artifact_col = stage
            .artifact_column()
            .ok_or_else(|| PipelineError::Internal("fetch records no outcome".into()))?;
        let dep_clause = match stage {
            Stage::Downloaded => "1=1",
            Stage::Converted => "downloaded_status = 'done'",
            Stage::Extracted => "converted_status = 'done'",
            Stage::Fetched => unreachable!(),
        };
        let now = Utc::now().to_rfc3339();
        let sql = format!(
            "UPDATE papers SET
                {prefix}_status = 'done',
                {artifact_col} = ?2,
                {prefix}_error = NULL,
                {prefix}_error_kind = NULL,
                {prefix}_error_at = NULL,
                updated_at = ?3
             WHERE paper_id = ?1 AND {dep_clause}"
        );
        let affected = self.conn.execute(&sql, params![paper_id, artifact, now])?;
        if affected == 0 {
            if self.exists(paper_id)? {
                return Err(PipelineError::DependencyViolation {
                    paper_id: paper_id.to_string(),
                    stage: stage.name(),
                });
            }
            return Err(PipelineError::Internal(format!(
                "cannot record outcome for unknown paper '{paper_id}'"
            )));
        }
        Ok(())
    }

    /// Record a stage failure: status `error`, message/kind/timestamp set.
    /// Any artifact from a previous success is deliberately preserved.
    pub fn record_error(
        &self,
        paper_id: &str,
        stage: Stage,
        error: &StageError,
    ) -> Result<(), PipelineError> {
        let prefix = match stage {
            Stage::Fetched => {
                return Err(PipelineError::Internal("fetch records no outcome".into()))
            }
            tracked => tracked.name(),
        };
        let now = Utc::now().to_rfc3339();
        let sql = format!(
            "UPDATE papers SET
                {prefix}_status = 'error',
                {prefix}_error = ?2,
                {prefix}_error_kind = ?3,
                {prefix}_error_at = ?4,
                updated_at = ?4
             WHERE paper_id = ?1"
        );
        let affected = self
            .conn
            .execute(&sql, params![paper_id, error.detail(), error.kind(), now])?;
        if affected == 0 {
            return Err(PipelineError::Internal(format!(
                "cannot record error for unknown paper '{paper_id}'"
            )));
        }
        Ok(())
    }

    // ── Queries ───────────────────────────────────────────────────────────

    /// Load one paper by id.
    pub fn get(&self, paper_id: &str) -> Result<Option<PaperRecord>, PipelineError> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM papers WHERE paper_id = ?1")?;
        let mut rows = stmt.query_map(params![paper_id], row_to_record)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Total number of papers.
    pub fn count(&self) -> Result<usize, PipelineError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM papers", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Point-in-time snapshot of per-stage counts, computed in one scan.
    ///
    /// Fetch is implicit, so `fetched.done` is the total row count.
    pub fn status_summary(&self) -> Result<StatusSummary, PipelineError> {
        let sql = "
            SELECT COUNT(*),
                COUNT(*) FILTER (WHERE downloaded_status = 'done'),
                COUNT(*) FILTER (WHERE downloaded_status = 'pending'),
                COUNT(*) FILTER (WHERE downloaded_status = 'error'),
                COUNT(*) FILTER (WHERE converted_status = 'done'),
                COUNT(*) FILTER (WHERE converted_status = 'pending'),
                COUNT(*) FILTER (WHERE converted_status = 'error'),
                COUNT(*) FILTER (WHERE extracted_status = 'done'),
                COUNT(*) FILTER (WHERE extracted_status = 'pending'),
                COUNT(*) FILTER (WHERE extracted_status = 'error')
            FROM papers";
        self.conn
            .query_row(sql, [], |row| {
                let total: i64 = row.get(0)?;
                let counts = |base: usize| -> rusqlite::Result<StageCounts> {
                    Ok(StageCounts {
                        done: row.get::<_, i64>(base)? as usize,
                        pending: row.get::<_, i64>(base + 1)? as usize,
                        error: row.get::<_, i64>(base + 2)? as usize,
                    })
                };
                Ok(StatusSummary {
                    total: total as usize,
                    fetched: StageCounts {
                        done: total as usize,
                        pending: 0,
                        error: 0,
                    },
                    downloaded: counts(1)?,
                    converted: counts(4)?,
                    extracted: counts(7)?,
                })
            })
            .map_err(PipelineError::from)
    }

    // ── Reset ─────────────────────────────────────────────────────────────

    /// Reset every downstream stage to `pending` and clear error fields.
    ///
    /// Artifact paths are preserved: the Download stage re-adopts an
    /// existing valid PDF rather than re-fetching it, so a post-reset run
    /// only redoes work whose artifacts are actually missing.
    pub fn reset_status(&self) -> Result<usize, PipelineError> {
        let now = Utc::now().to_rfc3339();
        let affected = self.conn.execute(
            "UPDATE papers SET
                downloaded_status = 'pending', downloaded_error = NULL,
                downloaded_error_kind = NULL, downloaded_error_at = NULL,
                converted_status = 'pending', converted_error = NULL,
                converted_error_kind = NULL, converted_error_at = NULL,
                extracted_status = 'pending', extracted_error = NULL,
                extracted_error_kind = NULL, extracted_error_at = NULL,
                updated_at = ?1",
            params![now],
        )?;
        info!(papers = affected, "reset stage status to pending");
        Ok(affected)
    }

    /// Delete every paper record.
    ///
    /// Refuses unless both confirmations were given. Artifact files on disk
    /// are not touched here; removing them is the reset controller's job.
    pub fn wipe_all(&self, confirmation: &WipeConfirmation) -> Result<usize, PipelineError> {
        if !confirmation.is_confirmed() {
            return Err(PipelineError::WipeNotConfirmed);
        }
        let affected = self.conn.execute("DELETE FROM papers", [])?;
        info!(papers = affected, "wiped all paper records");
        Ok(affected)
    }

    fn exists(&self, paper_id: &str) -> Result<bool, PipelineError> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM papers WHERE paper_id = ?1",
            params![paper_id],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }
}

// ── Row mapping ───────────────────────────────────────────────────────────

fn parse_status(idx: usize, raw: String) -> rusqlite::Result<StageStatus> {
    StageStatus::parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown stage status '{raw}'").into(),
        )
    })
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<PaperRecord> {
    let authors: String = row.get("authors")?;
    let external_ids: String = row.get("external_ids")?;
    let stage_state = |prefix: &str, artifact_col: &str| -> rusqlite::Result<StageState> {
        let status_col = format!("{prefix}_status");
        let status_idx = row.as_ref().column_index(status_col.as_str())?;
        let raw: String = row.get(status_idx)?;
        Ok(StageState {
            status: parse_status(status_idx, raw)?,
            error: row.get(format!("{prefix}_error").as_str())?,
            error_kind: row.get(format!("{prefix}_error_kind").as_str())?,
            error_at: row.get(format!("{prefix}_error_at").as_str())?,
            artifact: row.get(artifact_col)?,
        })
    };

    Ok(PaperRecord {
        metadata: PaperMetadata {
            paper_id: row.get("paper_id")?,
            title: row.get("title")?,
            r#abstract: row.get("abstract")?,
            year: row.get("year")?,
            venue: row.get("venue")?,
            authors: serde_json::from_str(&authors).unwrap_or_default(),
            external_ids: serde_json::from_str(&external_ids)
                .unwrap_or(serde_json::Value::Null),
            url: row.get("url")?,
            is_open_access: row.get::<_, i64>("is_open_access")? != 0,
            pdf_url: row.get("pdf_url")?,
        },
        downloaded: stage_state("downloaded", "pdf_path")?,
        converted: stage_state("converted", "tei_path")?,
        extracted: stage_state("extracted", "text_path")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}
