//! Full-text index maintenance.
//!
//! `units_fts` is a tokenized inverted index over `text_norm` of `line`
//! units only; its rowid equals the unit id. Full rebuild is the supported
//! refresh mode: any operation that changes `text_norm` or the line-unit
//! set marks the index stale, and the next rebuild restores the identity
//! contract deterministically.

use serde_json::json;
use sqlx::SqlitePool;

use crate::error::Result;
use crate::migrate;
use crate::models::RunKind;
use crate::progress::{checkpoint, Progress};
use crate::runs::{RunContext, RunRecorder};

/// Result of one rebuild.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IndexReport {
    pub run_id: String,
    pub units_indexed: i64,
    pub fts_stale: bool,
}

/// Drops and repopulates the inverted index from the line units.
pub async fn rebuild(
    pool: &SqlitePool,
    ctx: &RunContext,
    progress: &dyn Progress,
) -> Result<IndexReport> {
    let run = RunRecorder::begin(ctx, RunKind::Index, json!({}));

    checkpoint(progress, 10, "clearing index")?;

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM units_fts").execute(&mut *tx).await?;

    checkpoint(progress, 30, "indexing line units")?;
    let result = sqlx::query(
        "INSERT INTO units_fts (rowid, text_norm) SELECT id, text_norm FROM units WHERE kind = 'line'",
    )
    .execute(&mut *tx)
    .await?;
    let units_indexed = result.rows_affected() as i64;

    sqlx::query("UPDATE meta SET value = 'false' WHERE key = ?")
        .bind(migrate::META_FTS_STALE)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    checkpoint(progress, 90, "recording run")?;
    let run_id = run
        .finish(pool, json!({ "units_indexed": units_indexed }))
        .await?;
    tracing::info!(units_indexed, "full-text index rebuilt");

    Ok(IndexReport {
        run_id,
        units_indexed,
        fts_stale: false,
    })
}
