//! Database schema migrations.
//!
//! Migrations are ordered, versioned, and idempotent: each has a monotone
//! integer version, `schema_migrations` records applied versions, and
//! re-running is a no-op. Schema evolution is additive only — no migration
//! may drop or rewrite existing data.
//!
//! The FTS5 table `units_fts` is a regular (non-content) index whose rowid
//! equals the id of the corresponding `line` unit; that identity is the
//! joining contract between search hits and units.

use sqlx::SqlitePool;

use crate::error::Result;

/// Key in the `meta` table flagging that `units_fts` no longer matches
/// `text_norm` for some unit.
pub const META_FTS_STALE: &str = "fts_stale";

struct Migration {
    version: i64,
    statements: &'static [&'static str],
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        statements: &[
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id INTEGER PRIMARY KEY,
                title TEXT NOT NULL,
                language TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'unknown',
                resource_type TEXT NOT NULL DEFAULT '',
                metadata_json TEXT NOT NULL DEFAULT '{}',
                source_path TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS units (
                id INTEGER PRIMARY KEY,
                doc_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                n INTEGER NOT NULL,
                external_id INTEGER,
                text_raw TEXT NOT NULL,
                text_norm TEXT NOT NULL,
                metadata_json TEXT NOT NULL DEFAULT '{}',
                UNIQUE(doc_id, n),
                FOREIGN KEY (doc_id) REFERENCES documents(id)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_units_doc_external ON units(doc_id, external_id)",
            "CREATE INDEX IF NOT EXISTS idx_units_doc_n ON units(doc_id, n)",
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                params_json TEXT NOT NULL DEFAULT '{}',
                stats_json TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL
            )
            "#,
        ],
    },
    Migration {
        version: 2,
        statements: &[
            r#"
            CREATE TABLE IF NOT EXISTS alignment_links (
                id INTEGER PRIMARY KEY,
                run_id TEXT NOT NULL,
                pivot_unit_id INTEGER NOT NULL,
                target_unit_id INTEGER NOT NULL,
                pivot_doc_id INTEGER NOT NULL,
                target_doc_id INTEGER NOT NULL,
                external_id INTEGER,
                created_at INTEGER NOT NULL,
                status TEXT,
                FOREIGN KEY (pivot_unit_id) REFERENCES units(id),
                FOREIGN KEY (target_unit_id) REFERENCES units(id)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_links_pivot_unit ON alignment_links(pivot_unit_id)",
            "CREATE INDEX IF NOT EXISTS idx_links_target_unit ON alignment_links(target_unit_id)",
            "CREATE INDEX IF NOT EXISTS idx_links_doc_pair ON alignment_links(pivot_doc_id, target_doc_id)",
            "CREATE INDEX IF NOT EXISTS idx_links_external ON alignment_links(external_id)",
            "CREATE INDEX IF NOT EXISTS idx_links_status ON alignment_links(status)",
        ],
    },
    Migration {
        version: 3,
        statements: &[
            r#"
            CREATE TABLE IF NOT EXISTS doc_relations (
                id INTEGER PRIMARY KEY,
                doc_id INTEGER NOT NULL,
                relation_type TEXT NOT NULL,
                target_doc_id INTEGER NOT NULL,
                note TEXT,
                UNIQUE(doc_id, relation_type, target_doc_id),
                FOREIGN KEY (doc_id) REFERENCES documents(id),
                FOREIGN KEY (target_doc_id) REFERENCES documents(id)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_relations_doc_type ON doc_relations(doc_id, relation_type)",
        ],
    },
];

/// Applies all pending migrations in version order.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    for migration in MIGRATIONS {
        let applied: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM schema_migrations WHERE version = ?")
                .bind(migration.version)
                .fetch_one(pool)
                .await?;
        if applied {
            continue;
        }

        let mut tx = pool.begin().await?;
        for stmt in migration.statements {
            sqlx::query(stmt).execute(&mut *tx).await?;
        }
        sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?)")
            .bind(migration.version)
            .bind(chrono::Utc::now().timestamp())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
    }

    // CREATE VIRTUAL TABLE has no IF NOT EXISTS in older SQLite builds;
    // probe sqlite_master first.
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='units_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query("CREATE VIRTUAL TABLE units_fts USING fts5(text_norm)")
            .execute(pool)
            .await?;
    }

    Ok(())
}

/// Reads the stale flag for the full-text index. Absent means fresh.
pub async fn fts_stale(pool: &SqlitePool) -> Result<bool> {
    let value: Option<String> = sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
        .bind(META_FTS_STALE)
        .fetch_optional(pool)
        .await?;
    Ok(value.as_deref() == Some("true"))
}

/// Sets or clears the stale flag.
pub async fn set_fts_stale(pool: &SqlitePool, stale: bool) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO meta (key, value) VALUES (?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
    )
    .bind(META_FTS_STALE)
    .bind(if stale { "true" } else { "false" })
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = db::connect(&tmp.path().join("corpus.sqlite")).await.unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let versions: Vec<i64> =
            sqlx::query_scalar("SELECT version FROM schema_migrations ORDER BY version")
                .fetch_all(&pool)
                .await
                .unwrap();
        assert_eq!(versions, vec![1, 2, 3]);
        pool.close().await;
    }

    #[tokio::test]
    async fn stale_flag_round_trip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = db::connect(&tmp.path().join("corpus.sqlite")).await.unwrap();
        run_migrations(&pool).await.unwrap();

        assert!(!fts_stale(&pool).await.unwrap());
        set_fts_stale(&pool, true).await.unwrap();
        assert!(fts_stale(&pool).await.unwrap());
        set_fts_stale(&pool, false).await.unwrap();
        assert!(!fts_stale(&pool).await.unwrap());
        pool.close().await;
    }
}
