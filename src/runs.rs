//! Append-only run log.
//!
//! Every operation writes exactly one `runs` row: an opaque id, the kind,
//! the parameter object, and the statistics object. Free-form progress
//! lines additionally go to `runs/<run_id>/run.log` beside the database
//! when a run directory is configured; those files are diagnostic only —
//! the row is the contract.

use std::io::Write;
use std::path::{Path, PathBuf};

use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Run, RunKind};

/// Where (and whether) free-form run logs are written.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub runs_dir: Option<PathBuf>,
}

impl RunContext {
    /// Run logs under `<dir>/runs/<run_id>/run.log`.
    pub fn beside_db(db_path: &Path) -> Self {
        let base = db_path.parent().unwrap_or_else(|| Path::new("."));
        RunContext {
            runs_dir: Some(base.join("runs")),
        }
    }

    /// No log files; rows only. Used by tests and in-memory callers.
    pub fn disabled() -> Self {
        RunContext::default()
    }
}

/// An in-flight run. Create with [`RunRecorder::begin`], append free-form
/// lines with [`log`](RunRecorder::log), and persist the row with
/// [`finish`](RunRecorder::finish).
pub struct RunRecorder {
    id: String,
    kind: RunKind,
    params: serde_json::Value,
    log_file: Option<PathBuf>,
}

impl RunRecorder {
    pub fn begin(ctx: &RunContext, kind: RunKind, params: serde_json::Value) -> Self {
        let id = Uuid::new_v4().to_string();
        let log_file = ctx.runs_dir.as_ref().and_then(|dir| {
            let run_dir = dir.join(&id);
            std::fs::create_dir_all(&run_dir).ok()?;
            Some(run_dir.join("run.log"))
        });
        RunRecorder {
            id,
            kind,
            params,
            log_file,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Appends one line to the run's log file. Best-effort: log I/O never
    /// fails the operation it describes.
    pub fn log(&self, line: &str) {
        if let Some(path) = &self.log_file {
            if let Ok(mut f) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
                let _ = writeln!(f, "{}", line);
            }
        }
    }

    /// Writes the run row. Consumes the recorder: a run is recorded once.
    pub async fn finish(self, pool: &SqlitePool, stats: serde_json::Value) -> Result<String> {
        sqlx::query(
            "INSERT INTO runs (id, kind, params_json, stats_json, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&self.id)
        .bind(self.kind.as_str())
        .bind(self.params.to_string())
        .bind(stats.to_string())
        .bind(chrono::Utc::now().timestamp())
        .execute(pool)
        .await?;
        Ok(self.id)
    }
}

/// Fetches runs, newest first, optionally restricted to one id.
pub async fn fetch_runs(pool: &SqlitePool, run_id: Option<&str>) -> Result<Vec<Run>> {
    let rows = match run_id {
        Some(id) => {
            sqlx::query(
                "SELECT id, kind, params_json, stats_json, created_at FROM runs WHERE id = ?",
            )
            .bind(id)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(
                "SELECT id, kind, params_json, stats_json, created_at FROM runs ORDER BY created_at DESC, id",
            )
            .fetch_all(pool)
            .await?
        }
    };

    let mut runs = Vec::with_capacity(rows.len());
    for row in rows {
        let kind_str: String = row.get("kind");
        let kind = RunKind::parse(&kind_str)?;
        let params_json: String = row.get("params_json");
        let stats_json: String = row.get("stats_json");
        runs.push(Run {
            id: row.get("id"),
            kind,
            params: serde_json::from_str(&params_json).unwrap_or(serde_json::Value::Null),
            stats: serde_json::from_str(&stats_json).unwrap_or(serde_json::Value::Null),
            created_at: row.get("created_at"),
        });
    }
    Ok(runs)
}
