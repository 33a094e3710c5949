//! Extract stage: split TEI XML into Markdown section text.
//!
//! The substance here is deliberately thin — title, abstract, and body
//! sections lifted with regular expressions, tags stripped, whitespace
//! collapsed. The pipeline's contract is only that the output is non-empty
//! text derived from the TEI; anything smarter belongs to a different
//! extractor behind the same trait.
//!
//! The output file is replaced wholesale (`.tmp` + rename): re-running the
//! stage never appends to or interleaves with a previous extraction.

use std::path::PathBuf;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, StageError};
use crate::paper::{PaperRecord, Stage};
use crate::pipeline::executor::{run_stage, ExecutionReport, StageOutcome};
use crate::pipeline::{artifact_file_name, write_artifact};
use crate::store::PaperStore;

/// Turns a TEI XML document into section text.
///
/// Pure CPU work; implementations need no async.
pub trait SectionExtractor: Send + Sync {
    /// # Errors
    /// [`StageError::Permanent`] when no text can be extracted — an empty
    /// result would poison downstream consumers, so it is never written.
    fn extract(&self, tei_xml: &str) -> Result<String, StageError>;
}

static TITLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<titleStmt>\s*<title[^>]*>(.*?)</title>").unwrap()
});
static ABSTRACT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<abstract[^>]*>(.*?)</abstract>").unwrap());
static BODY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<body[^>]*>(.*?)</body>").unwrap());
static DIV_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<div[^>]*>(.*?)</div>").unwrap());
static HEAD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<head[^>]*>(.*?)</head>").unwrap());
static PARA_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<p[^>]*>(.*?)</p>").unwrap());
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());
static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Regex-based TEI-to-Markdown extractor.
pub struct TeiSectionExtractor;

impl TeiSectionExtractor {
    fn clean(fragment: &str) -> String {
        let stripped = TAG_RE.replace_all(fragment, " ");
        WHITESPACE_RE.replace_all(&stripped, " ").trim().to_string()
    }
}

impl SectionExtractor for TeiSectionExtractor {
    fn extract(&self, tei_xml: &str) -> Result<String, StageError> {
        let mut out = String::new();

        if let Some(caps) = TITLE_RE.captures(tei_xml) {
            let title = Self::clean(&caps[1]);
            if !title.is_empty() {
                out.push_str(&format!("# {title}\n\n"));
            }
        }
        if let Some(caps) = ABSTRACT_RE.captures(tei_xml) {
            let text = Self::clean(&caps[1]);
            if !text.is_empty() {
                out.push_str(&format!("## Abstract\n\n{text}\n\n"));
            }
        }
        if let Some(body) = BODY_RE.captures(tei_xml) {
            for div in DIV_RE.captures_iter(&body[1]) {
                let section = &div[1];
                if let Some(head) = HEAD_RE.captures(section) {
                    let heading = Self::clean(&head[1]);
                    if !heading.is_empty() {
                        out.push_str(&format!("## {heading}\n\n"));
                    }
                }
                for para in PARA_RE.captures_iter(section) {
                    let text = Self::clean(&para[1]);
                    if !text.is_empty() {
                        out.push_str(&text);
                        out.push_str("\n\n");
                    }
                }
            }
        }

        let out = out.trim_end().to_string();
        if out.is_empty() {
            return Err(StageError::permanent(
                "no extractable text in TEI document".to_string(),
            ));
        }
        Ok(out)
    }
}

/// Run the Extract stage over its current candidates.
pub async fn run_extract(
    store: &PaperStore,
    config: &PipelineConfig,
    extractor: Arc<dyn SectionExtractor>,
) -> Result<ExecutionReport, PipelineError> {
    let text_dir = config.text_dir.clone();
    run_stage(
        store,
        config,
        Stage::Extracted,
        move |record| perform_extract(record, extractor.clone(), text_dir.clone()),
        None,
    )
    .await
}

/// Attempt one paper's extraction.
pub(crate) async fn perform_extract(
    record: PaperRecord,
    extractor: Arc<dyn SectionExtractor>,
    text_dir: PathBuf,
) -> StageOutcome {
    let paper_id = &record.metadata.paper_id;
    let Some(tei_path) = record.converted.artifact.as_deref() else {
        return StageOutcome::Failed {
            error: StageError::permanent("no TEI artifact recorded".to_string()),
        };
    };
    let tei = match tokio::fs::read_to_string(tei_path).await {
        Ok(tei) => tei,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return StageOutcome::Failed {
                error: StageError::permanent(format!("TEI missing at '{tei_path}'")),
            }
        }
        Err(e) => {
            return StageOutcome::Failed {
                error: StageError::transient(format!("read '{tei_path}': {e}")),
            }
        }
    };

    let text = match extractor.extract(&tei) {
        Ok(text) => text,
        Err(error) => return StageOutcome::Failed { error },
    };
    let target = text_dir.join(artifact_file_name(paper_id, "md"));
    if let Err(error) = write_artifact(&target, text.as_bytes()).await {
        return StageOutcome::Failed { error };
    }
    StageOutcome::Done {
        artifact: target.to_string_lossy().into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_TEI: &str = r#"<TEI>
      <teiHeader>
        <fileDesc>
          <titleStmt><title level="a">Attention Is All You Need</title></titleStmt>
        </fileDesc>
        <profileDesc>
          <abstract><p>We propose a new <hi>architecture</hi>.</p></abstract>
        </profileDesc>
      </teiHeader>
      <text>
        <body>
          <div><head>Introduction</head><p>Sequence models dominate.</p><p>We change that.</p></div>
          <div><head>Method</head><p>Self-attention only.</p></div>
        </body>
      </text>
    </TEI>"#;

    #[test]
    fn extracts_title_abstract_and_sections() {
        let text = TeiSectionExtractor.extract(SAMPLE_TEI).unwrap();
        assert!(text.starts_with("# Attention Is All You Need"));
        assert!(text.contains("## Abstract\n\nWe propose a new architecture."));
        assert!(text.contains("## Introduction"));
        assert!(text.contains("Sequence models dominate."));
        assert!(text.contains("## Method\n\nSelf-attention only."));
    }

    #[test]
    fn nested_tags_are_stripped_and_whitespace_collapsed() {
        let tei = "<TEI><text><body><div><head>A</head>\
                   <p>one <ref type=\"bibr\">two</ref>   three</p></div></body></text></TEI>";
        let text = TeiSectionExtractor.extract(tei).unwrap();
        assert!(text.contains("one two three"));
    }

    #[test]
    fn empty_document_is_a_permanent_error() {
        let err = TeiSectionExtractor.extract("<TEI></TEI>").unwrap_err();
        assert_eq!(err.kind(), "permanent");
    }

    #[tokio::test]
    async fn rerun_replaces_rather_than_appends() {
        use crate::paper::{PaperMetadata, StageState};

        let dir = tempfile::tempdir().unwrap();
        let tei_path = dir.path().join("p0.tei.xml");
        std::fs::write(&tei_path, SAMPLE_TEI).unwrap();

        let record = PaperRecord {
            metadata: PaperMetadata::new("p0", "Paper 0"),
            downloaded: StageState::pending(),
            converted: StageState {
                artifact: Some(tei_path.to_string_lossy().into_owned()),
                ..StageState::pending()
            },
            extracted: StageState::pending(),
            created_at: String::new(),
            updated_at: String::new(),
        };

        let text_dir = dir.path().join("text");
        let first = perform_extract(record.clone(), Arc::new(TeiSectionExtractor), text_dir.clone())
            .await;
        let StageOutcome::Done { artifact } = first else {
            panic!("expected done, got {first:?}");
        };
        let first_content = std::fs::read_to_string(&artifact).unwrap();

        let second = perform_extract(record, Arc::new(TeiSectionExtractor), text_dir).await;
        assert!(matches!(second, StageOutcome::Done { .. }));
        let second_content = std::fs::read_to_string(&artifact).unwrap();
        assert_eq!(first_content, second_content);
    }
}
