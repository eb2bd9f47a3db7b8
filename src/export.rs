//! Exports: structured XML, alignment dumps, and run reports.
//!
//! Three writers share the same contract: output goes to a caller-supplied
//! local path, the write is recorded as a run of kind `export`, and
//! everything that leaves the database is escaped for its format (XML
//! escaping plus the XML 1.0 invalid-codepoint filter; CSV quoting; HTML
//! entity escaping).

use std::path::Path;

use serde_json::json;
use sqlx::{Row, SqlitePool};

use crate::error::{EngineError, Result};
use crate::models::RunKind;
use crate::runs::{self, RunContext, RunRecorder};

/// Rejects pseudo-paths with a URL scheme; exports write local files only.
pub fn ensure_local_path(path: &Path) -> Result<()> {
    let s = path.to_string_lossy();
    if s.contains("://") {
        return Err(EngineError::validation(format!(
            "output path must be a local filesystem path: {}",
            s
        )));
    }
    Ok(())
}

// ============ Structured XML export ============

/// Result of one XML export.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TeiExportReport {
    pub run_id: String,
    pub documents_exported: usize,
    pub files: Vec<String>,
}

/// Exports each requested document as one XML file in `out_dir`.
/// Line units are exported by default; `include_structure` adds the rest.
pub async fn export_tei(
    pool: &SqlitePool,
    ctx: &RunContext,
    doc_ids: &[i64],
    out_dir: &Path,
    include_structure: bool,
) -> Result<TeiExportReport> {
    if doc_ids.is_empty() {
        return Err(EngineError::validation("doc_ids must not be empty"));
    }
    ensure_local_path(out_dir)?;

    let run = RunRecorder::begin(
        ctx,
        RunKind::Export,
        json!({ "what": "tei", "doc_ids": doc_ids, "include_structure": include_structure }),
    );

    std::fs::create_dir_all(out_dir)?;
    let mut files = Vec::with_capacity(doc_ids.len());

    for &doc_id in doc_ids {
        let doc = sqlx::query(
            "SELECT id, title, language, role, resource_type, source_path FROM documents WHERE id = ?",
        )
        .bind(doc_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| EngineError::validation(format!("unknown document: {}", doc_id)))?;

        let title: String = doc.get("title");
        let language: String = doc.get("language");
        let role: String = doc.get("role");
        let resource_type: String = doc.get("resource_type");

        let unit_sql = if include_structure {
            "SELECT n, kind, external_id, text_norm FROM units WHERE doc_id = ? ORDER BY n"
        } else {
            "SELECT n, kind, external_id, text_norm FROM units WHERE doc_id = ? AND kind = 'line' ORDER BY n"
        };
        let units = sqlx::query(unit_sql).bind(doc_id).fetch_all(pool).await?;

        let mut xml = String::new();
        xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        xml.push_str(&format!(
            "<TEI xmlns=\"http://www.tei-c.org/ns/1.0\" xml:lang=\"{}\">\n",
            xml_escape_attr(&language)
        ));
        xml.push_str("  <teiHeader>\n    <fileDesc>\n      <titleStmt>\n");
        xml.push_str(&format!(
            "        <title>{}</title>\n",
            xml_escape(&title)
        ));
        xml.push_str("      </titleStmt>\n      <sourceDesc>\n");
        xml.push_str(&format!(
            "        <p>role: {}; resource type: {}</p>\n",
            xml_escape(&role),
            xml_escape(&resource_type)
        ));
        xml.push_str("      </sourceDesc>\n    </fileDesc>\n  </teiHeader>\n");
        xml.push_str("  <text>\n    <body>\n");
        for unit in &units {
            let n: i64 = unit.get("n");
            let kind: String = unit.get("kind");
            let external_id: Option<i64> = unit.get("external_id");
            let text: String = unit.get("text_norm");
            let text = xml_escape(&filter_xml_codepoints(&text));
            if kind == "line" {
                match external_id {
                    Some(ext) => xml.push_str(&format!(
                        "      <p n=\"{}\" xml:id=\"u{}\">{}</p>\n",
                        n, ext, text
                    )),
                    None => xml.push_str(&format!("      <p n=\"{}\">{}</p>\n", n, text)),
                }
            } else {
                xml.push_str(&format!("      <head n=\"{}\">{}</head>\n", n, text));
            }
        }
        xml.push_str("    </body>\n  </text>\n</TEI>\n");

        let file_name = format!("doc_{}.xml", doc_id);
        let out_path = out_dir.join(&file_name);
        std::fs::write(&out_path, xml.as_bytes())?;
        run.log(&format!("wrote {}", out_path.display()));
        files.push(file_name);
    }

    let run_id = run
        .finish(pool, json!({ "documents_exported": files.len(), "files": files.clone() }))
        .await?;

    Ok(TeiExportReport {
        run_id,
        documents_exported: doc_ids.len(),
        files,
    })
}

// ============ Alignment dump (CSV/TSV) ============

/// Result of one alignment dump.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AlignCsvReport {
    pub run_id: String,
    pub rows_written: usize,
    pub path: String,
}

/// Dumps alignment links as delimited rows of
/// `(pivot_external_id, pivot_text, target_external_id, target_text, status)`.
pub async fn export_align_csv(
    pool: &SqlitePool,
    ctx: &RunContext,
    out_path: &Path,
    delimiter: char,
    pivot_doc_id: Option<i64>,
    target_doc_id: Option<i64>,
    external_id: Option<i64>,
) -> Result<AlignCsvReport> {
    if delimiter != ',' && delimiter != '\t' && delimiter != ';' {
        return Err(EngineError::validation(
            "delimiter must be ',', ';', or a tab",
        ));
    }
    ensure_local_path(out_path)?;

    let run = RunRecorder::begin(
        ctx,
        RunKind::Export,
        json!({
            "what": "align_csv",
            "pivot_doc_id": pivot_doc_id,
            "target_doc_id": target_doc_id,
            "external_id": external_id,
        }),
    );

    let mut sql = String::from(
        "SELECT l.external_id, l.status, \
                p.external_id AS pivot_external_id, p.text_norm AS pivot_text, \
                t.external_id AS target_external_id, t.text_norm AS target_text \
         FROM alignment_links l \
         JOIN units p ON p.id = l.pivot_unit_id \
         JOIN units t ON t.id = l.target_unit_id \
         WHERE 1=1",
    );
    if pivot_doc_id.is_some() {
        sql.push_str(" AND l.pivot_doc_id = ?");
    }
    if target_doc_id.is_some() {
        sql.push_str(" AND l.target_doc_id = ?");
    }
    if external_id.is_some() {
        sql.push_str(" AND l.external_id = ?");
    }
    sql.push_str(" ORDER BY l.pivot_doc_id, l.target_doc_id, p.n, l.id");

    let mut query = sqlx::query(&sql);
    if let Some(v) = pivot_doc_id {
        query = query.bind(v);
    }
    if let Some(v) = target_doc_id {
        query = query.bind(v);
    }
    if let Some(v) = external_id {
        query = query.bind(v);
    }
    let rows = query.fetch_all(pool).await?;

    let mut out = String::new();
    out.push_str(&delimited_row(
        delimiter,
        &[
            "pivot_external_id",
            "pivot_text",
            "target_external_id",
            "target_text",
            "status",
        ],
    ));
    for row in &rows {
        let pivot_external_id: Option<i64> = row.get("pivot_external_id");
        let pivot_text: String = row.get("pivot_text");
        let target_external_id: Option<i64> = row.get("target_external_id");
        let target_text: String = row.get("target_text");
        let status: Option<String> = row.get("status");
        out.push_str(&delimited_row(
            delimiter,
            &[
                &pivot_external_id.map(|v| v.to_string()).unwrap_or_default(),
                &pivot_text,
                &target_external_id.map(|v| v.to_string()).unwrap_or_default(),
                &target_text,
                status.as_deref().unwrap_or(""),
            ],
        ));
    }

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(out_path, out.as_bytes())?;

    let run_id = run
        .finish(pool, json!({ "rows_written": rows.len(), "path": out_path.display().to_string() }))
        .await?;

    Ok(AlignCsvReport {
        run_id,
        rows_written: rows.len(),
        path: out_path.display().to_string(),
    })
}

// ============ Run report (JSONL/HTML) ============

/// Output format of the run report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportFormat {
    Jsonl,
    Html,
}

/// Result of one run-report export.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunReportResult {
    pub run_id: String,
    pub runs_written: usize,
    pub path: String,
}

/// Serializes `runs` rows, optionally restricted to one run identity.
pub async fn export_run_report(
    pool: &SqlitePool,
    ctx: &RunContext,
    out_path: &Path,
    format: ReportFormat,
    only_run_id: Option<&str>,
) -> Result<RunReportResult> {
    ensure_local_path(out_path)?;

    let run = RunRecorder::begin(
        ctx,
        RunKind::Export,
        json!({ "what": "run_report", "run_id": only_run_id }),
    );

    let entries = runs::fetch_runs(pool, only_run_id).await?;
    if only_run_id.is_some() && entries.is_empty() {
        return Err(EngineError::not_found(format!(
            "unknown run: {}",
            only_run_id.unwrap_or_default()
        )));
    }

    let body = match format {
        ReportFormat::Jsonl => {
            let mut out = String::new();
            for entry in &entries {
                out.push_str(&serde_json::to_string(entry)?);
                out.push('\n');
            }
            out
        }
        ReportFormat::Html => {
            let mut out = String::from(
                "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Run report</title></head><body>\n<table border=\"1\">\n<tr><th>id</th><th>kind</th><th>created_at</th><th>params</th><th>stats</th></tr>\n",
            );
            for entry in &entries {
                out.push_str(&format!(
                    "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
                    html_escape(&entry.id),
                    html_escape(entry.kind.as_str()),
                    entry.created_at,
                    html_escape(&entry.params.to_string()),
                    html_escape(&entry.stats.to_string()),
                ));
            }
            out.push_str("</table>\n</body></html>\n");
            out
        }
    };

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(out_path, body.as_bytes())?;

    let run_id = run
        .finish(pool, json!({ "runs_written": entries.len(), "path": out_path.display().to_string() }))
        .await?;

    Ok(RunReportResult {
        run_id,
        runs_written: entries.len(),
        path: out_path.display().to_string(),
    })
}

// ============ Escaping helpers ============

/// XML 1.0 forbids most C0 controls; strip anything a conforming parser
/// would reject.
fn filter_xml_codepoints(s: &str) -> String {
    s.chars()
        .filter(|&c| {
            c == '\t'
                || c == '\n'
                || c == '\r'
                || ('\u{20}'..='\u{D7FF}').contains(&c)
                || ('\u{E000}'..='\u{FFFD}').contains(&c)
                || c >= '\u{10000}'
        })
        .collect()
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
    out
}

fn xml_escape_attr(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn html_escape(s: &str) -> String {
    xml_escape_attr(s)
}

/// Quotes a field when it contains the delimiter, a quote, or a newline.
fn delimited_row(delimiter: char, fields: &[&str]) -> String {
    let mut out = String::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(delimiter);
        }
        if field.contains(delimiter) || field.contains('"') || field.contains('\n') {
            out.push('"');
            out.push_str(&field.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(field);
        }
    }
    out.push('\n');
    out
}
