//! Alignment audit surface: link listing, review, and quality metrics.
//!
//! Listing is paginated with the same `limit + 1` lookahead the query
//! engine uses. Status mutation is idempotent; retargeting revalidates the
//! new endpoint. Quality metrics summarize coverage, orphans, collisions,
//! and review progress for one pivot↔target pair, optionally scoped to a
//! single run.

use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::error::{EngineError, Result};
use crate::models::LinkStatus;

/// Link listing request.
#[derive(Debug, Clone, Deserialize)]
pub struct AuditParams {
    pub pivot_doc_id: i64,
    pub target_doc_id: i64,
    pub run_id: Option<String>,
    pub external_id: Option<i64>,
    /// `"accepted"`, `"rejected"`, or `"unreviewed"`; absent means all.
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// One audited link with both unit texts attached.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRow {
    pub link_id: i64,
    pub run_id: String,
    pub pivot_unit_id: i64,
    pub target_unit_id: i64,
    pub external_id: Option<i64>,
    pub pivot_external_id: Option<i64>,
    pub target_external_id: Option<i64>,
    pub pivot_text: String,
    pub target_text: String,
    pub status: Option<LinkStatus>,
}

/// Paginated listing.
#[derive(Debug, Clone, Serialize)]
pub struct AuditPage {
    pub links: Vec<AuditRow>,
    pub limit: i64,
    pub offset: i64,
    pub has_more: bool,
    pub next_offset: Option<i64>,
    pub total: Option<i64>,
}

/// Lists links for a pivot↔target pair.
pub async fn list_links(pool: &SqlitePool, params: &AuditParams) -> Result<AuditPage> {
    let limit = params.limit.unwrap_or(50);
    if !(1..=200).contains(&limit) {
        return Err(EngineError::validation("limit must be in 1..=200"));
    }
    let offset = params.offset.unwrap_or(0);
    if offset < 0 {
        return Err(EngineError::validation("offset must be >= 0"));
    }
    let status_filter = parse_status_filter(params.status.as_deref())?;

    let mut sql = String::from(
        "SELECT l.id AS link_id, l.run_id, l.pivot_unit_id, l.target_unit_id, l.external_id, l.status, \
                p.external_id AS pivot_external_id, p.text_norm AS pivot_text, \
                t.external_id AS target_external_id, t.text_norm AS target_text \
         FROM alignment_links l \
         JOIN units p ON p.id = l.pivot_unit_id \
         JOIN units t ON t.id = l.target_unit_id \
         WHERE l.pivot_doc_id = ? AND l.target_doc_id = ?",
    );
    if params.run_id.is_some() {
        sql.push_str(" AND l.run_id = ?");
    }
    if params.external_id.is_some() {
        sql.push_str(" AND l.external_id = ?");
    }
    match status_filter {
        StatusFilter::All => {}
        StatusFilter::Unreviewed => sql.push_str(" AND l.status IS NULL"),
        StatusFilter::Is(_) => sql.push_str(" AND l.status = ?"),
    }
    sql.push_str(" ORDER BY p.n, l.id LIMIT ? OFFSET ?");

    let mut query = sqlx::query(&sql)
        .bind(params.pivot_doc_id)
        .bind(params.target_doc_id);
    if let Some(run_id) = &params.run_id {
        query = query.bind(run_id);
    }
    if let Some(ext) = params.external_id {
        query = query.bind(ext);
    }
    if let StatusFilter::Is(status) = status_filter {
        query = query.bind(status.as_str());
    }
    query = query.bind(limit + 1).bind(offset);

    let rows = query.fetch_all(pool).await?;
    let has_more = rows.len() as i64 > limit;

    let mut links = Vec::with_capacity(rows.len().min(limit as usize));
    for row in rows.into_iter().take(limit as usize) {
        let status: Option<String> = row.get("status");
        links.push(AuditRow {
            link_id: row.get("link_id"),
            run_id: row.get("run_id"),
            pivot_unit_id: row.get("pivot_unit_id"),
            target_unit_id: row.get("target_unit_id"),
            external_id: row.get("external_id"),
            pivot_external_id: row.get("pivot_external_id"),
            target_external_id: row.get("target_external_id"),
            pivot_text: row.get("pivot_text"),
            target_text: row.get("target_text"),
            status: LinkStatus::parse_opt(status.as_deref())?,
        });
    }

    Ok(AuditPage {
        links,
        limit,
        offset,
        has_more,
        next_offset: if has_more { Some(offset + limit) } else { None },
        total: None,
    })
}

#[derive(Debug, Clone, Copy)]
enum StatusFilter {
    All,
    Unreviewed,
    Is(LinkStatus),
}

fn parse_status_filter(s: Option<&str>) -> Result<StatusFilter> {
    match s {
        None => Ok(StatusFilter::All),
        Some("unreviewed") => Ok(StatusFilter::Unreviewed),
        Some("accepted") => Ok(StatusFilter::Is(LinkStatus::Accepted)),
        Some("rejected") => Ok(StatusFilter::Is(LinkStatus::Rejected)),
        Some(other) => Err(EngineError::validation(format!(
            "unknown status filter: '{}'. Use accepted, rejected, or unreviewed.",
            other
        ))),
    }
}

/// Sets the review status of one link. Idempotent: setting the current
/// status again succeeds.
pub async fn update_status(
    pool: &SqlitePool,
    link_id: i64,
    status: Option<LinkStatus>,
) -> Result<()> {
    ensure_link(pool, link_id).await?;
    sqlx::query("UPDATE alignment_links SET status = ? WHERE id = ?")
        .bind(status.map(|s| s.as_str()))
        .bind(link_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Removes one link by id.
pub async fn delete_link(pool: &SqlitePool, link_id: i64) -> Result<()> {
    ensure_link(pool, link_id).await?;
    sqlx::query("DELETE FROM alignment_links WHERE id = ?")
        .bind(link_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Changes the target unit of an existing link. The new target must exist
/// and be a line unit; the denormalized target document follows it.
pub async fn retarget_link(pool: &SqlitePool, link_id: i64, new_target_unit_id: i64) -> Result<()> {
    ensure_link(pool, link_id).await?;

    let row = sqlx::query("SELECT doc_id, kind FROM units WHERE id = ?")
        .bind(new_target_unit_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| {
            EngineError::validation(format!("unknown unit: {}", new_target_unit_id))
        })?;
    let kind: String = row.get("kind");
    if kind != "line" {
        return Err(EngineError::validation(
            "retarget requires a unit of kind line",
        ));
    }
    let doc_id: i64 = row.get("doc_id");

    sqlx::query("UPDATE alignment_links SET target_unit_id = ?, target_doc_id = ? WHERE id = ?")
        .bind(new_target_unit_id)
        .bind(doc_id)
        .bind(link_id)
        .execute(pool)
        .await?;
    Ok(())
}

async fn ensure_link(pool: &SqlitePool, link_id: i64) -> Result<()> {
    let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM alignment_links WHERE id = ?")
        .bind(link_id)
        .fetch_one(pool)
        .await?;
    if exists {
        Ok(())
    } else {
        Err(EngineError::not_found(format!("unknown link: {}", link_id)))
    }
}

/// Orphan sample carried by the quality report.
#[derive(Debug, Clone, Serialize)]
pub struct OrphanUnit {
    pub unit_id: i64,
    pub external_id: Option<i64>,
    pub text: String,
}

/// Review-status tallies.
#[derive(Debug, Clone, Serialize)]
pub struct StatusCounts {
    pub unreviewed: i64,
    pub accepted: i64,
    pub rejected: i64,
}

/// Coverage and quality metrics for one pivot↔target pair.
#[derive(Debug, Clone, Serialize)]
pub struct QualityReport {
    pub pivot_doc_id: i64,
    pub target_doc_id: i64,
    pub pivot_total: i64,
    pub target_total: i64,
    pub links_total: i64,
    pub covered_pivot: i64,
    pub covered_target: i64,
    pub coverage_pct: f64,
    pub orphan_pivot_count: i64,
    pub orphan_target_count: i64,
    pub collision_count: i64,
    pub status_counts: StatusCounts,
    pub sample_orphan_pivot: Vec<OrphanUnit>,
    pub sample_orphan_target: Vec<OrphanUnit>,
}

/// Computes quality metrics, optionally scoped to one run.
pub async fn quality(
    pool: &SqlitePool,
    pivot_doc_id: i64,
    target_doc_id: i64,
    run_id: Option<&str>,
) -> Result<QualityReport> {
    let run_clause = if run_id.is_some() { " AND run_id = ?" } else { "" };

    let pivot_total = count_line_units(pool, pivot_doc_id).await?;
    let target_total = count_line_units(pool, target_doc_id).await?;

    let links_total = pair_count(
        pool,
        &format!(
            "SELECT COUNT(*) FROM alignment_links WHERE pivot_doc_id = ? AND target_doc_id = ?{}",
            run_clause
        ),
        pivot_doc_id,
        target_doc_id,
        run_id,
    )
    .await?;

    let covered_pivot = pair_count(
        pool,
        &format!(
            "SELECT COUNT(DISTINCT pivot_unit_id) FROM alignment_links WHERE pivot_doc_id = ? AND target_doc_id = ?{}",
            run_clause
        ),
        pivot_doc_id,
        target_doc_id,
        run_id,
    )
    .await?;

    let covered_target = pair_count(
        pool,
        &format!(
            "SELECT COUNT(DISTINCT target_unit_id) FROM alignment_links WHERE pivot_doc_id = ? AND target_doc_id = ?{}",
            run_clause
        ),
        pivot_doc_id,
        target_doc_id,
        run_id,
    )
    .await?;

    let collision_count = pair_count(
        pool,
        &format!(
            "SELECT COUNT(*) FROM ( \
                SELECT pivot_unit_id FROM alignment_links \
                WHERE pivot_doc_id = ? AND target_doc_id = ?{} \
                GROUP BY pivot_unit_id HAVING COUNT(*) > 1)",
            run_clause
        ),
        pivot_doc_id,
        target_doc_id,
        run_id,
    )
    .await?;

    let mut status_counts = StatusCounts {
        unreviewed: 0,
        accepted: 0,
        rejected: 0,
    };
    let status_sql = format!(
        "SELECT status, COUNT(*) AS c FROM alignment_links \
         WHERE pivot_doc_id = ? AND target_doc_id = ?{} GROUP BY status",
        run_clause
    );
    let mut status_query = sqlx::query(&status_sql)
        .bind(pivot_doc_id)
        .bind(target_doc_id);
    if let Some(run_id) = run_id {
        status_query = status_query.bind(run_id);
    }
    let status_rows = status_query.fetch_all(pool).await?;
    for row in status_rows {
        let status: Option<String> = row.get("status");
        let c: i64 = row.get("c");
        match status.as_deref() {
            None => status_counts.unreviewed = c,
            Some("accepted") => status_counts.accepted = c,
            Some("rejected") => status_counts.rejected = c,
            Some(_) => {}
        }
    }

    let sample_orphan_pivot = orphan_samples(
        pool,
        pivot_doc_id,
        "pivot_unit_id",
        pivot_doc_id,
        target_doc_id,
        run_id,
    )
    .await?;
    let sample_orphan_target = orphan_samples(
        pool,
        target_doc_id,
        "target_unit_id",
        pivot_doc_id,
        target_doc_id,
        run_id,
    )
    .await?;

    let coverage_pct = if pivot_total > 0 {
        covered_pivot as f64 / pivot_total as f64 * 100.0
    } else {
        0.0
    };

    Ok(QualityReport {
        pivot_doc_id,
        target_doc_id,
        pivot_total,
        target_total,
        links_total,
        covered_pivot,
        covered_target,
        coverage_pct,
        orphan_pivot_count: pivot_total - covered_pivot,
        orphan_target_count: target_total - covered_target,
        collision_count,
        status_counts,
        sample_orphan_pivot,
        sample_orphan_target,
    })
}

async fn count_line_units(pool: &SqlitePool, doc_id: i64) -> Result<i64> {
    Ok(
        sqlx::query_scalar("SELECT COUNT(*) FROM units WHERE doc_id = ? AND kind = 'line'")
            .bind(doc_id)
            .fetch_one(pool)
            .await?,
    )
}

async fn pair_count(
    pool: &SqlitePool,
    sql: &str,
    pivot_doc_id: i64,
    target_doc_id: i64,
    run_id: Option<&str>,
) -> Result<i64> {
    let mut query = sqlx::query_scalar(sql).bind(pivot_doc_id).bind(target_doc_id);
    if let Some(run_id) = run_id {
        query = query.bind(run_id);
    }
    Ok(query.fetch_one(pool).await?)
}

async fn orphan_samples(
    pool: &SqlitePool,
    doc_id: i64,
    link_column: &str,
    pivot_doc_id: i64,
    target_doc_id: i64,
    run_id: Option<&str>,
) -> Result<Vec<OrphanUnit>> {
    let run_clause = if run_id.is_some() { " AND run_id = ?" } else { "" };
    let sql = format!(
        "SELECT id, external_id, text_norm FROM units \
         WHERE doc_id = ? AND kind = 'line' AND id NOT IN ( \
             SELECT {} FROM alignment_links \
             WHERE pivot_doc_id = ? AND target_doc_id = ?{}) \
         ORDER BY n LIMIT 5",
        link_column, run_clause
    );
    let mut query = sqlx::query(&sql)
        .bind(doc_id)
        .bind(pivot_doc_id)
        .bind(target_doc_id);
    if let Some(run_id) = run_id {
        query = query.bind(run_id);
    }
    let rows = query.fetch_all(pool).await?;
    Ok(rows
        .into_iter()
        .map(|row| OrphanUnit {
            unit_id: row.get("id"),
            external_id: row.get("external_id"),
            text: row.get("text_norm"),
        })
        .collect())
}
