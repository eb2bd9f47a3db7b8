//! Document resegmentation.
//!
//! Replaces the line-unit set of one document by splitting each existing
//! line unit after occurrences of a boundary pattern (sentence punctuation
//! by default). Structure units stay in place; `n` is renumbered over the
//! whole document; produced units carry no `external_id` but remember
//! their source unit's ordinal in metadata. Alignment links touching the
//! document are dropped, and the full-text index goes stale.

use regex::Regex;
use serde_json::json;
use sqlx::{Row, SqlitePool};

use crate::error::{EngineError, Result};
use crate::migrate;
use crate::models::{RunKind, UnitKind};
use crate::normalize;
use crate::progress::{checkpoint, Progress};
use crate::runs::{RunContext, RunRecorder};

/// Default boundary: sentence punctuation followed by whitespace.
pub const DEFAULT_BOUNDARY: &str = r"[.!?]+\s+";

/// Outcome of one resegmentation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SegmentReport {
    pub run_id: String,
    pub doc_id: i64,
    pub units_before: usize,
    pub units_after: usize,
    pub links_dropped: u64,
    pub fts_stale: bool,
}

/// Splits `text` after each boundary match. The boundary text stays with
/// the preceding piece, so sentence punctuation is not lost.
fn split_after(re: &Regex, text: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut start = 0usize;
    for m in re.find_iter(text) {
        let piece = text[start..m.end()].trim();
        if !piece.is_empty() {
            pieces.push(piece.to_string());
        }
        start = m.end();
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        pieces.push(tail.to_string());
    }
    if pieces.is_empty() && !text.trim().is_empty() {
        pieces.push(text.trim().to_string());
    }
    pieces
}

/// Resegments one document.
pub async fn resegment(
    pool: &SqlitePool,
    ctx: &RunContext,
    doc_id: i64,
    pattern: Option<&str>,
    progress: &dyn Progress,
) -> Result<SegmentReport> {
    let pattern = pattern.unwrap_or(DEFAULT_BOUNDARY);
    let re = Regex::new(pattern)
        .map_err(|e| EngineError::validation(format!("invalid boundary pattern: {}", e)))?;

    let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM documents WHERE id = ?")
        .bind(doc_id)
        .fetch_one(pool)
        .await?;
    if !exists {
        return Err(EngineError::validation(format!(
            "unknown document: {}",
            doc_id
        )));
    }

    let run = RunRecorder::begin(
        ctx,
        RunKind::Segment,
        json!({ "doc_id": doc_id, "pattern": pattern }),
    );

    checkpoint(progress, 10, "loading units")?;
    let rows = sqlx::query(
        "SELECT id, kind, n, text_raw, metadata_json FROM units WHERE doc_id = ? ORDER BY n",
    )
    .bind(doc_id)
    .fetch_all(pool)
    .await?;
    let units_before = rows.len();

    // Plan the replacement unit sequence in memory first; the write is one
    // transaction.
    struct NewUnit {
        kind: UnitKind,
        text: String,
        source_n: i64,
        metadata_json: String,
    }
    let mut planned: Vec<NewUnit> = Vec::new();
    for row in &rows {
        let kind: String = row.get("kind");
        let n: i64 = row.get("n");
        let text_raw: String = row.get("text_raw");
        if kind == "line" {
            for piece in split_after(&re, &text_raw) {
                planned.push(NewUnit {
                    kind: UnitKind::Line,
                    text: piece,
                    source_n: n,
                    metadata_json: String::new(),
                });
            }
        } else {
            let metadata_json: String = row.get("metadata_json");
            planned.push(NewUnit {
                kind: UnitKind::Structure,
                text: text_raw,
                source_n: n,
                metadata_json,
            });
        }
    }

    checkpoint(progress, 40, "rewriting unit set")?;
    let mut tx = pool.begin().await?;

    let dropped = sqlx::query("DELETE FROM alignment_links WHERE pivot_doc_id = ? OR target_doc_id = ?")
        .bind(doc_id)
        .bind(doc_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    sqlx::query("DELETE FROM units WHERE doc_id = ?")
        .bind(doc_id)
        .execute(&mut *tx)
        .await?;

    let total = planned.len();
    for (i, unit) in planned.iter().enumerate() {
        let n = (i + 1) as i64;
        let (text_raw, text_norm, metadata_json) = match unit.kind {
            UnitKind::Line => {
                let norm = normalize::normalize(&unit.text);
                let mut meta = serde_json::Map::new();
                meta.insert("source_n".to_string(), json!(unit.source_n));
                if norm.separator_count > 0 {
                    meta.insert("separators".to_string(), json!(norm.separator_count));
                }
                (
                    norm.raw,
                    norm.norm,
                    serde_json::Value::Object(meta).to_string(),
                )
            }
            UnitKind::Structure => {
                let norm = normalize::normalize(&unit.text);
                (norm.raw, norm.norm, unit.metadata_json.clone())
            }
        };
        sqlx::query(
            r#"
            INSERT INTO units (doc_id, kind, n, external_id, text_raw, text_norm, metadata_json)
            VALUES (?, ?, ?, NULL, ?, ?, ?)
            "#,
        )
        .bind(doc_id)
        .bind(unit.kind.as_str())
        .bind(n)
        .bind(&text_raw)
        .bind(&text_norm)
        .bind(&metadata_json)
        .execute(&mut *tx)
        .await?;

        if (i + 1) % 100 == 0 {
            let pct = 40 + ((i + 1) * 50 / total.max(1)) as u8;
            if let Err(e) = checkpoint(progress, pct.min(90), &format!("{}/{} units", i + 1, total)) {
                tx.rollback().await?;
                return Err(e);
            }
        }
    }

    sqlx::query(
        "INSERT INTO meta (key, value) VALUES (?, 'true') ON CONFLICT(key) DO UPDATE SET value = 'true'",
    )
    .bind(migrate::META_FTS_STALE)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    run.log(&format!(
        "{} units resegmented into {}, {} links dropped",
        units_before, total, dropped
    ));
    let run_id = run
        .finish(
            pool,
            json!({
                "doc_id": doc_id,
                "units_before": units_before,
                "units_after": total,
                "links_dropped": dropped,
            }),
        )
        .await?;

    Ok(SegmentReport {
        run_id,
        doc_id,
        units_before,
        units_after: total,
        links_dropped: dropped,
        fts_stale: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_after_sentence_punctuation() {
        let re = Regex::new(DEFAULT_BOUNDARY).unwrap();
        let pieces = split_after(&re, "Une phrase. Une autre! Et la fin");
        assert_eq!(pieces, vec!["Une phrase.", "Une autre!", "Et la fin"]);
    }

    #[test]
    fn no_boundary_keeps_whole_text() {
        let re = Regex::new(DEFAULT_BOUNDARY).unwrap();
        let pieces = split_after(&re, "pas de ponctuation");
        assert_eq!(pieces, vec!["pas de ponctuation"]);
    }

    #[test]
    fn trailing_punctuation_stays_attached() {
        let re = Regex::new(DEFAULT_BOUNDARY).unwrap();
        let pieces = split_after(&re, "Fin de ligne.");
        assert_eq!(pieces, vec!["Fin de ligne."]);
    }
}
