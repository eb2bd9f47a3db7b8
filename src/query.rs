//! Query engine: full-text search projected into segment or KWIC shapes.
//!
//! The query string is interpreted by FTS5 (phrase, boolean, `NEAR(a b, n)`
//! proximity). Hits join back to units and documents through the rowid
//! identity contract, and FTS5 `highlight()` wraps matches in private-use
//! sentinels that the projection layer turns into `<<`/`>>` markers or
//! KWIC windows.
//!
//! Pagination fetches `limit + 1` rows to compute `has_more` without a
//! global count; `total` stays `null`. With `all_occurrences` the page
//! boundary stays unit-aligned — every occurrence of a paged unit is
//! emitted on that unit's page.
//!
//! A stale index is not an error: hits come from the last successful
//! rebuild and the response carries `fts_stale: true` so collaborators can
//! warn users.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{Row, SqlitePool};

use crate::config::QueryConfig;
use crate::error::{EngineError, Result};
use crate::kwic::{self, KwicParts, MARK_CLOSE, MARK_OPEN};
use crate::migrate;
use crate::models::{DocRole, RunKind};
use crate::runs::{RunContext, RunRecorder};

/// Hit shape requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    #[default]
    Segment,
    Kwic,
}

/// Query request. Everything except `q` is optional.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryParams {
    pub q: String,
    #[serde(default)]
    pub mode: QueryMode,
    pub window: Option<usize>,
    pub language: Option<String>,
    pub doc_id: Option<i64>,
    pub doc_role: Option<String>,
    pub resource_type: Option<String>,
    #[serde(default)]
    pub include_aligned: bool,
    pub aligned_limit: Option<usize>,
    #[serde(default)]
    pub all_occurrences: bool,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// A sibling unit attached to a hit through alignment links.
#[derive(Debug, Clone, Serialize)]
pub struct AlignedUnit {
    pub unit_id: i64,
    pub doc_id: i64,
    pub language: String,
    pub title: String,
    pub external_id: Option<i64>,
    pub text: String,
}

/// One hit. Segment mode fills `text`; KWIC mode fills `left`/`match`/`right`.
#[derive(Debug, Clone, Serialize)]
pub struct QueryHit {
    pub doc_id: i64,
    pub unit_id: i64,
    pub external_id: Option<i64>,
    pub n: i64,
    pub language: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    // A flattened `None` serializes to nothing, giving KWIC hits their
    // left/match/right fields at the top level.
    #[serde(flatten)]
    pub kwic: Option<KwicParts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aligned: Option<Vec<AlignedUnit>>,
}

/// Paginated response.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub hits: Vec<QueryHit>,
    pub limit: i64,
    pub offset: i64,
    pub has_more: bool,
    pub next_offset: Option<i64>,
    /// Always `null`: the engine skips a global count for cost reasons.
    pub total: Option<i64>,
    pub fts_stale: bool,
}

struct MatchRow {
    unit_id: i64,
    doc_id: i64,
    external_id: Option<i64>,
    n: i64,
    language: String,
    title: String,
    marked: String,
}

/// Runs one query and records it in the run log.
pub async fn run_query(
    pool: &SqlitePool,
    ctx: &RunContext,
    config: &QueryConfig,
    params: &QueryParams,
) -> Result<QueryResponse> {
    if params.q.trim().is_empty() {
        return Err(EngineError::validation("q must not be empty"));
    }

    let window = params.window.unwrap_or(config.default_window);
    if !(1..=25).contains(&window) {
        return Err(EngineError::validation("window must be in 1..=25"));
    }
    let limit = params.limit.unwrap_or(config.default_limit);
    if !(1..=200).contains(&limit) {
        return Err(EngineError::validation("limit must be in 1..=200"));
    }
    let offset = params.offset.unwrap_or(0);
    if offset < 0 {
        return Err(EngineError::validation("offset must be >= 0"));
    }
    let aligned_limit = params.aligned_limit.unwrap_or(config.default_aligned_limit);
    if !(1..=200).contains(&aligned_limit) {
        return Err(EngineError::validation("aligned_limit must be in 1..=200"));
    }
    let role = match &params.doc_role {
        Some(r) => Some(DocRole::parse(r)?),
        None => None,
    };
    if params.all_occurrences && params.mode != QueryMode::Kwic {
        return Err(EngineError::validation(
            "all_occurrences applies to kwic mode only",
        ));
    }

    let rows = fetch_match_rows(pool, params, role, limit, offset).await?;

    let has_more = rows.len() as i64 > limit;
    let page: Vec<MatchRow> = rows.into_iter().take(limit as usize).collect();

    let aligned_by_unit = if params.include_aligned && !page.is_empty() {
        fetch_aligned(pool, &page, aligned_limit).await?
    } else {
        HashMap::new()
    };

    let mut hits = Vec::with_capacity(page.len());
    for row in &page {
        let aligned = if params.include_aligned {
            Some(aligned_by_unit.get(&row.unit_id).cloned().unwrap_or_default())
        } else {
            None
        };
        match params.mode {
            QueryMode::Segment => {
                hits.push(QueryHit {
                    doc_id: row.doc_id,
                    unit_id: row.unit_id,
                    external_id: row.external_id,
                    n: row.n,
                    language: row.language.clone(),
                    title: row.title.clone(),
                    text: Some(kwic::segment_text(&row.marked)),
                    kwic: None,
                    aligned,
                });
            }
            QueryMode::Kwic => {
                let rows = kwic::kwic_rows(&row.marked, window, params.all_occurrences);
                if rows.is_empty() {
                    // Matched unit without a highlightable span (e.g. a
                    // column-filter query); keep the unit visible.
                    hits.push(QueryHit {
                        doc_id: row.doc_id,
                        unit_id: row.unit_id,
                        external_id: row.external_id,
                        n: row.n,
                        language: row.language.clone(),
                        title: row.title.clone(),
                        text: None,
                        kwic: Some(KwicParts {
                            left: String::new(),
                            match_text: String::new(),
                            right: kwic::parse_marked(&row.marked).plain,
                        }),
                        aligned,
                    });
                } else {
                    for parts in rows {
                        hits.push(QueryHit {
                            doc_id: row.doc_id,
                            unit_id: row.unit_id,
                            external_id: row.external_id,
                            n: row.n,
                            language: row.language.clone(),
                            title: row.title.clone(),
                            text: None,
                            kwic: Some(parts),
                            aligned: aligned.clone(),
                        });
                    }
                }
            }
        }
    }

    let fts_stale = migrate::fts_stale(pool).await?;

    let mode_str = match params.mode {
        QueryMode::Segment => "segment",
        QueryMode::Kwic => "kwic",
    };
    let run = RunRecorder::begin(
        ctx,
        RunKind::Query,
        json!({
            "q": params.q,
            "mode": mode_str,
            "limit": limit,
            "offset": offset,
        }),
    );
    run.finish(pool, json!({ "hits": hits.len(), "has_more": has_more }))
        .await?;

    Ok(QueryResponse {
        hits,
        limit,
        offset,
        has_more,
        next_offset: if has_more { Some(offset + limit) } else { None },
        total: None,
        fts_stale,
    })
}

async fn fetch_match_rows(
    pool: &SqlitePool,
    params: &QueryParams,
    role: Option<DocRole>,
    limit: i64,
    offset: i64,
) -> Result<Vec<MatchRow>> {
    let mut sql = String::from(
        "SELECT u.id AS unit_id, u.doc_id, u.external_id, u.n, d.language, d.title, \
                highlight(units_fts, 0, ?, ?) AS marked \
         FROM units_fts \
         JOIN units u ON u.id = units_fts.rowid \
         JOIN documents d ON d.id = u.doc_id \
         WHERE units_fts MATCH ?",
    );
    if params.language.is_some() {
        sql.push_str(" AND d.language = ?");
    }
    if params.doc_id.is_some() {
        sql.push_str(" AND u.doc_id = ?");
    }
    if role.is_some() {
        sql.push_str(" AND d.role = ?");
    }
    if params.resource_type.is_some() {
        sql.push_str(" AND d.resource_type = ?");
    }
    sql.push_str(" ORDER BY u.doc_id, u.n LIMIT ? OFFSET ?");

    let mut query = sqlx::query(&sql)
        .bind(MARK_OPEN.to_string())
        .bind(MARK_CLOSE.to_string())
        .bind(&params.q);
    if let Some(lang) = &params.language {
        query = query.bind(lang);
    }
    if let Some(doc_id) = params.doc_id {
        query = query.bind(doc_id);
    }
    if let Some(role) = role {
        query = query.bind(role.as_str());
    }
    if let Some(rt) = &params.resource_type {
        query = query.bind(rt);
    }
    query = query.bind(limit + 1).bind(offset);

    let rows = query.fetch_all(pool).await.map_err(map_match_error)?;

    Ok(rows
        .into_iter()
        .map(|row| MatchRow {
            unit_id: row.get("unit_id"),
            doc_id: row.get("doc_id"),
            external_id: row.get("external_id"),
            n: row.get("n"),
            language: row.get("language"),
            title: row.get("title"),
            marked: row.get("marked"),
        })
        .collect())
}

/// FTS5 reports bad query syntax as a database error; surface it as a
/// validation failure instead of an internal one.
fn map_match_error(e: sqlx::Error) -> EngineError {
    if let sqlx::Error::Database(db) = &e {
        let msg = db.message();
        if msg.contains("fts5") || msg.contains("syntax error") || msg.contains("unterminated") {
            return EngineError::validation(format!("malformed query: {}", msg));
        }
    }
    EngineError::Db(e)
}

/// Batched aligned-unit attachment for one page of hits.
///
/// Sibling documents come from `doc_relations` in either direction; a
/// document with no declared relations falls back to every linked
/// document, so an uncurated corpus still gets a parallel view.
async fn fetch_aligned(
    pool: &SqlitePool,
    page: &[MatchRow],
    aligned_limit: usize,
) -> Result<HashMap<i64, Vec<AlignedUnit>>> {
    let unit_ids: Vec<i64> = page.iter().map(|r| r.unit_id).collect();
    let placeholders = vec!["?"; unit_ids.len()].join(", ");

    // Sibling map over all relations; the table is small by construction.
    let mut siblings: HashMap<i64, HashSet<i64>> = HashMap::new();
    let rel_rows = sqlx::query("SELECT doc_id, target_doc_id FROM doc_relations")
        .fetch_all(pool)
        .await?;
    for row in rel_rows {
        let a: i64 = row.get("doc_id");
        let b: i64 = row.get("target_doc_id");
        siblings.entry(a).or_default().insert(b);
        siblings.entry(b).or_default().insert(a);
    }

    let mut out: HashMap<i64, Vec<AlignedUnit>> = HashMap::new();

    // Outgoing links (hit unit is the pivot) then incoming (hit unit is
    // the target); both join the far side of the link.
    for (own_col, far_col) in [
        ("pivot_unit_id", "target_unit_id"),
        ("target_unit_id", "pivot_unit_id"),
    ] {
        let sql = format!(
            "SELECT l.{own} AS own_unit, u.id AS far_unit, u.doc_id, u.external_id, u.n, u.text_norm, \
                    d.language, d.title \
             FROM alignment_links l \
             JOIN units u ON u.id = l.{far} \
             JOIN documents d ON d.id = u.doc_id \
             WHERE l.{own} IN ({placeholders}) \
             ORDER BY u.doc_id, u.n",
            own = own_col,
            far = far_col,
            placeholders = placeholders,
        );
        let mut query = sqlx::query(&sql);
        for id in &unit_ids {
            query = query.bind(*id);
        }
        for row in query.fetch_all(pool).await? {
            let own_unit: i64 = row.get("own_unit");
            out.entry(own_unit).or_default().push(AlignedUnit {
                unit_id: row.get("far_unit"),
                doc_id: row.get("doc_id"),
                language: row.get("language"),
                title: row.get("title"),
                external_id: row.get("external_id"),
                text: row.get("text_norm"),
            });
        }
    }

    let doc_of_unit: HashMap<i64, i64> = page.iter().map(|r| (r.unit_id, r.doc_id)).collect();

    for (unit_id, units) in out.iter_mut() {
        if let Some(doc_id) = doc_of_unit.get(unit_id) {
            if let Some(allowed) = siblings.get(doc_id) {
                units.retain(|u| allowed.contains(&u.doc_id));
            }
        }
        // Deduplicate mutual links, keep deterministic order, then cap.
        units.sort_by_key(|u| (u.doc_id, u.unit_id));
        units.dedup_by_key(|u| u.unit_id);
        units.truncate(aligned_limit);
    }

    Ok(out)
}
