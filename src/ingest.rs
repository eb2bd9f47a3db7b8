//! Ingestion pipeline orchestration.
//!
//! Coordinates the full import flow: bytes on disk → decode → format
//! parser → normalization → atomic storage. One document is one
//! transaction: either the document row and every unit land, or nothing
//! does. The full-text index is never written here — imports mark it stale
//! and the caller rebuilds.

use std::path::PathBuf;

use serde_json::json;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use crate::encoding;
use crate::error::{EngineError, Result};
use crate::migrate;
use crate::models::{DocRole, RunKind, UnitKind};
use crate::normalize;
use crate::parse_docx;
use crate::parse_numbered::{self, ParsedUnit};
use crate::parse_tei::{self, TeiUnitElement};
use crate::progress::{checkpoint, Progress};
use crate::runs::{RunContext, RunRecorder};

/// Supported import formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportFormat {
    TxtNumbered,
    DocxNumbered,
    DocxParagraphs,
    Tei,
}

impl ImportFormat {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "txt_numbered" => Ok(ImportFormat::TxtNumbered),
            "docx_numbered" => Ok(ImportFormat::DocxNumbered),
            "docx_paragraphs" => Ok(ImportFormat::DocxParagraphs),
            "tei" => Ok(ImportFormat::Tei),
            other => Err(EngineError::validation(format!(
                "unknown import format: '{}'. Use txt_numbered, docx_numbered, docx_paragraphs, or tei.",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImportFormat::TxtNumbered => "txt_numbered",
            ImportFormat::DocxNumbered => "docx_numbered",
            ImportFormat::DocxParagraphs => "docx_paragraphs",
            ImportFormat::Tei => "tei",
        }
    }

    /// Infers a format from the file extension. DOCX defaults to the
    /// numbered-line reading; callers wanting plain paragraphs say so.
    pub fn from_extension(path: &std::path::Path) -> Option<Self> {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("txt") => Some(ImportFormat::TxtNumbered),
            Some("docx") => Some(ImportFormat::DocxNumbered),
            Some("xml") | Some("tei") => Some(ImportFormat::Tei),
            _ => None,
        }
    }
}

/// Parameters of one import invocation.
#[derive(Debug, Clone)]
pub struct ImportParams {
    pub path: PathBuf,
    /// When `None`, inferred from the file extension.
    pub format: Option<ImportFormat>,
    pub title: Option<String>,
    pub language: Option<String>,
    pub role: DocRole,
    pub resource_type: String,
    /// Unit element for TEI sources.
    pub tei_unit: TeiUnitElement,
    pub metadata: serde_json::Value,
}

impl ImportParams {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ImportParams {
            path: path.into(),
            format: None,
            title: None,
            language: None,
            role: DocRole::Standalone,
            resource_type: String::new(),
            tei_unit: TeiUnitElement::Paragraph,
            metadata: json!({}),
        }
    }
}

/// Report emitted by one ingestion invocation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ImportReport {
    pub doc_id: i64,
    pub run_id: String,
    pub units_total: usize,
    pub units_line: usize,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    pub fts_stale: bool,
}

/// Imports one document. Atomic: the document row and all of its units are
/// written in a single transaction.
pub async fn import_document(
    pool: &SqlitePool,
    ctx: &RunContext,
    params: ImportParams,
    progress: &dyn Progress,
) -> Result<ImportReport> {
    let format = match params.format {
        Some(f) => f,
        None => ImportFormat::from_extension(&params.path).ok_or_else(|| {
            EngineError::validation(format!(
                "cannot infer format from path: {}",
                params.path.display()
            ))
        })?,
    };

    let run = RunRecorder::begin(
        ctx,
        RunKind::Import,
        json!({
            "path": params.path.display().to_string(),
            "format": format.as_str(),
            "language": params.language.clone(),
            "role": params.role.as_str(),
        }),
    );

    checkpoint(progress, 5, "reading source")?;
    let bytes = std::fs::read(&params.path)?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let content_hash = format!("{:x}", hasher.finalize());

    checkpoint(progress, 20, "parsing units")?;
    let parsed = parse_source(&bytes, format, params.tei_unit)?;
    run.log(&format!(
        "parsed {} units ({} warnings) from {}",
        parsed.units.len(),
        parsed.warnings.len(),
        params.path.display()
    ));
    for w in &parsed.warnings {
        run.log(&format!("warning: {}", w));
    }

    let title = params
        .title
        .or(parsed.title)
        .unwrap_or_else(|| file_stem(&params.path));
    let language = params
        .language
        .or(parsed.language)
        .unwrap_or_else(|| "und".to_string());

    let mut doc_metadata = match params.metadata {
        serde_json::Value::Object(m) => m,
        serde_json::Value::Null => serde_json::Map::new(),
        _ => {
            return Err(EngineError::validation(
                "document metadata must be a JSON object",
            ))
        }
    };
    if let Some(enc) = &parsed.encoding {
        doc_metadata.insert("encoding".to_string(), json!(enc));
    }
    doc_metadata.insert("format".to_string(), json!(format.as_str()));

    checkpoint(progress, 40, "writing units")?;

    let mut tx = pool.begin().await?;

    let created_at = chrono::Utc::now().timestamp();
    let doc_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO documents (title, language, role, resource_type, metadata_json, source_path, content_hash, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(&title)
    .bind(&language)
    .bind(params.role.as_str())
    .bind(&params.resource_type)
    .bind(serde_json::Value::Object(doc_metadata).to_string())
    .bind(params.path.display().to_string())
    .bind(&content_hash)
    .bind(created_at)
    .fetch_one(&mut *tx)
    .await?;

    let mut units_line = 0usize;
    let total = parsed.units.len();
    for (i, unit) in parsed.units.iter().enumerate() {
        let n = (i + 1) as i64;
        let norm = normalize::normalize(&unit.text);
        let mut unit_meta = serde_json::Map::new();
        if norm.separator_count > 0 {
            unit_meta.insert("separators".to_string(), json!(norm.separator_count));
        }
        if unit.kind == UnitKind::Line {
            units_line += 1;
        }
        sqlx::query(
            r#"
            INSERT INTO units (doc_id, kind, n, external_id, text_raw, text_norm, metadata_json)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(doc_id)
        .bind(unit.kind.as_str())
        .bind(n)
        .bind(unit.external_id)
        .bind(&norm.raw)
        .bind(&norm.norm)
        .bind(serde_json::Value::Object(unit_meta).to_string())
        .execute(&mut *tx)
        .await?;

        if (i + 1) % 100 == 0 {
            let pct = 40 + ((i + 1) * 50 / total.max(1)) as u8;
            checkpoint(progress, pct.min(90), &format!("{}/{} units", i + 1, total))?;
        }
    }

    // Imports invalidate the index; rebuild is an explicit separate step.
    sqlx::query(
        "INSERT INTO meta (key, value) VALUES (?, 'true') ON CONFLICT(key) DO UPDATE SET value = 'true'",
    )
    .bind(migrate::META_FTS_STALE)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    checkpoint(progress, 95, "recording run")?;
    let stats = json!({
        "doc_id": doc_id,
        "units_total": total,
        "units_line": units_line,
        "warnings": parsed.warnings.len(),
        "encoding": parsed.encoding.clone(),
    });
    let run_id = run.finish(pool, stats).await?;

    Ok(ImportReport {
        doc_id,
        run_id,
        units_total: total,
        units_line,
        warnings: parsed.warnings,
        encoding: parsed.encoding,
        fts_stale: true,
    })
}

/// Format-independent parse result.
struct ParsedSource {
    units: Vec<ParsedUnit>,
    warnings: Vec<String>,
    title: Option<String>,
    language: Option<String>,
    encoding: Option<String>,
}

fn parse_source(bytes: &[u8], format: ImportFormat, tei_unit: TeiUnitElement) -> Result<ParsedSource> {
    match format {
        ImportFormat::TxtNumbered => {
            let decoded = encoding::decode(bytes);
            let mut outcome = parse_numbered::parse_text(&decoded.text);
            if decoded.lossy {
                outcome
                    .warnings
                    .push(format!("decoding was lossy ({})", decoded.detection));
            }
            Ok(ParsedSource {
                units: outcome.units,
                warnings: outcome.warnings,
                title: None,
                language: None,
                encoding: Some(decoded.detection),
            })
        }
        ImportFormat::DocxNumbered => {
            let paragraphs = parse_docx::extract_paragraphs(bytes)?;
            let outcome = parse_numbered::parse_paragraphs(&paragraphs);
            Ok(ParsedSource {
                units: outcome.units,
                warnings: outcome.warnings,
                title: None,
                language: None,
                encoding: None,
            })
        }
        ImportFormat::DocxParagraphs => {
            let paragraphs = parse_docx::extract_paragraphs(bytes)?;
            // Every non-empty paragraph is a line unit anchored by its own
            // ordinal, which keeps position-based alignment available.
            let units: Vec<ParsedUnit> = paragraphs
                .into_iter()
                .filter(|p| !p.trim().is_empty())
                .enumerate()
                .map(|(i, text)| ParsedUnit {
                    kind: UnitKind::Line,
                    external_id: Some((i + 1) as i64),
                    text,
                })
                .collect();
            Ok(ParsedSource {
                units,
                warnings: Vec::new(),
                title: None,
                language: None,
                encoding: None,
            })
        }
        ImportFormat::Tei => {
            let decoded = encoding::decode(bytes);
            let doc = parse_tei::parse(&decoded.text, tei_unit)?;
            Ok(ParsedSource {
                units: doc.units,
                warnings: doc.warnings,
                title: doc.title,
                language: doc.language,
                encoding: Some(decoded.detection),
            })
        }
    }
}

fn file_stem(path: &std::path::Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("untitled")
        .to_string()
}
