//! Core data models used throughout the engine.
//!
//! These types represent the documents, units, alignment links, relations,
//! runs, and jobs that flow through the ingestion, query, and alignment
//! pipelines. Enums are closed: unknown tags are validation errors at the
//! boundary, never silently accepted.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Role a document plays within the corpus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocRole {
    Standalone,
    Original,
    Translation,
    Excerpt,
    Unknown,
}

impl DocRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocRole::Standalone => "standalone",
            DocRole::Original => "original",
            DocRole::Translation => "translation",
            DocRole::Excerpt => "excerpt",
            DocRole::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Result<Self, EngineError> {
        match s {
            "standalone" => Ok(DocRole::Standalone),
            "original" => Ok(DocRole::Original),
            "translation" => Ok(DocRole::Translation),
            "excerpt" => Ok(DocRole::Excerpt),
            "unknown" => Ok(DocRole::Unknown),
            other => Err(EngineError::validation(format!(
                "unknown document role: '{}'. Use standalone, original, translation, excerpt, or unknown.",
                other
            ))),
        }
    }
}

/// Kind of a unit. Only `line` units are indexed and alignable; `structure`
/// units are scaffolding (headings, stage directions) kept for context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Line,
    Structure,
}

impl UnitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitKind::Line => "line",
            UnitKind::Structure => "structure",
        }
    }
}

/// One imported source document.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: i64,
    pub title: String,
    pub language: String,
    pub role: DocRole,
    pub resource_type: String,
    pub metadata: serde_json::Value,
    pub source_path: String,
    pub content_hash: String,
    pub created_at: i64,
}

/// The atomic addressable span of text in a document.
///
/// `(doc_id, n)` is unique and covers `1..N` contiguously. `external_id` is
/// the integer anchor extracted from the source (e.g. `[42] …`); it may
/// repeat within a document — the importer warns but does not reject.
#[derive(Debug, Clone, Serialize)]
pub struct Unit {
    pub id: i64,
    pub doc_id: i64,
    pub kind: UnitKind,
    pub n: i64,
    pub external_id: Option<i64>,
    pub text_raw: String,
    pub text_norm: String,
    pub metadata: serde_json::Value,
}

/// Review status of an alignment link. Absence means unreviewed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Accepted,
    Rejected,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Accepted => "accepted",
            LinkStatus::Rejected => "rejected",
        }
    }

    pub fn parse_opt(s: Option<&str>) -> Result<Option<Self>, EngineError> {
        match s {
            None => Ok(None),
            Some("accepted") => Ok(Some(LinkStatus::Accepted)),
            Some("rejected") => Ok(Some(LinkStatus::Rejected)),
            Some(other) => Err(EngineError::validation(format!(
                "unknown link status: '{}'. Use accepted, rejected, or null.",
                other
            ))),
        }
    }
}

/// A one-to-one correspondence between a pivot unit and a target unit,
/// produced by one alignment run.
#[derive(Debug, Clone, Serialize)]
pub struct AlignmentLink {
    pub id: i64,
    pub run_id: String,
    pub pivot_unit_id: i64,
    pub target_unit_id: i64,
    pub pivot_doc_id: i64,
    pub target_doc_id: i64,
    pub external_id: Option<i64>,
    pub created_at: i64,
    pub status: Option<LinkStatus>,
}

/// Typed document-level edge used by the query engine to find siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    TranslationOf,
    ExcerptOf,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::TranslationOf => "translation_of",
            RelationType::ExcerptOf => "excerpt_of",
        }
    }

    pub fn parse(s: &str) -> Result<Self, EngineError> {
        match s {
            "translation_of" => Ok(RelationType::TranslationOf),
            "excerpt_of" => Ok(RelationType::ExcerptOf),
            other => Err(EngineError::validation(format!(
                "unknown relation type: '{}'. Use translation_of or excerpt_of.",
                other
            ))),
        }
    }
}

/// A document relation row.
#[derive(Debug, Clone, Serialize)]
pub struct DocRelation {
    pub id: i64,
    pub doc_id: i64,
    pub relation_type: RelationType,
    pub target_doc_id: i64,
    pub note: Option<String>,
}

/// Kind of a persisted run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Init,
    Import,
    Index,
    Query,
    Curate,
    Segment,
    Align,
    Export,
}

impl RunKind {
    pub fn parse(s: &str) -> Result<Self, EngineError> {
        match s {
            "init" => Ok(RunKind::Init),
            "import" => Ok(RunKind::Import),
            "index" => Ok(RunKind::Index),
            "query" => Ok(RunKind::Query),
            "curate" => Ok(RunKind::Curate),
            "segment" => Ok(RunKind::Segment),
            "align" => Ok(RunKind::Align),
            "export" => Ok(RunKind::Export),
            other => Err(EngineError::validation(format!(
                "unknown run kind: '{}'",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Init => "init",
            RunKind::Import => "import",
            RunKind::Index => "index",
            RunKind::Query => "query",
            RunKind::Curate => "curate",
            RunKind::Segment => "segment",
            RunKind::Align => "align",
            RunKind::Export => "export",
        }
    }
}

/// Immutable record of one operation: parameters in, statistics out.
#[derive(Debug, Clone, Serialize)]
pub struct Run {
    pub id: String,
    pub kind: RunKind,
    pub params: serde_json::Value,
    pub stats: serde_json::Value,
    pub created_at: i64,
}

/// Lifecycle state of an async job. Terminal states are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Error,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error | JobStatus::Canceled)
    }

    pub fn parse(s: &str) -> Result<Self, EngineError> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "error" => Ok(JobStatus::Error),
            "canceled" => Ok(JobStatus::Canceled),
            other => Err(EngineError::validation(format!(
                "unknown job status: '{}'",
                other
            ))),
        }
    }
}

/// Transient in-memory record of async work owned by the job runtime.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub kind: String,
    pub status: JobStatus,
    pub progress_pct: u8,
    pub progress_message: String,
    pub params: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trip() {
        for s in ["standalone", "original", "translation", "excerpt", "unknown"] {
            assert_eq!(DocRole::parse(s).unwrap().as_str(), s);
        }
        assert!(DocRole::parse("pivot").is_err());
    }

    #[test]
    fn link_status_null_is_unreviewed() {
        assert_eq!(LinkStatus::parse_opt(None).unwrap(), None);
        assert_eq!(
            LinkStatus::parse_opt(Some("accepted")).unwrap(),
            Some(LinkStatus::Accepted)
        );
        assert!(LinkStatus::parse_opt(Some("maybe")).is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Done.is_terminal());
        assert!(JobStatus::Error.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
    }
}
