//! Curation engine: ordered regex substitution over normalized text.
//!
//! Rules run in list order against `text_norm` of line units; `text_raw`
//! is never touched. Preview applies the rules in memory and reports what
//! would change; apply rewrites within one transaction and flags the
//! full-text index stale. Invalid patterns fail eagerly, before any unit
//! is read.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{Row, SqlitePool};

use crate::error::{EngineError, Result};
use crate::migrate;
use crate::models::RunKind;
use crate::progress::{checkpoint, Progress};
use crate::runs::{RunContext, RunRecorder};

/// One substitution rule as supplied by the caller.
///
/// `flags` is a compact string over the set `i` (case-insensitive), `m`
/// (multi-line `^`/`$`), `s` (dot matches newline), `x` (ignore pattern
/// whitespace).
#[derive(Debug, Clone, Deserialize)]
pub struct CurationRule {
    pub pattern: String,
    pub replacement: String,
    #[serde(default)]
    pub flags: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug)]
struct CompiledRule {
    re: Regex,
    replacement: String,
}

fn compile_rules(rules: &[CurationRule]) -> Result<Vec<CompiledRule>> {
    if rules.is_empty() {
        return Ok(Vec::new());
    }
    let mut compiled = Vec::with_capacity(rules.len());
    for (i, rule) in rules.iter().enumerate() {
        let mut builder = RegexBuilder::new(&rule.pattern);
        for flag in rule.flags.chars() {
            match flag {
                'i' => {
                    builder.case_insensitive(true);
                }
                'm' => {
                    builder.multi_line(true);
                }
                's' => {
                    builder.dot_matches_new_line(true);
                }
                'x' => {
                    builder.ignore_whitespace(true);
                }
                other => {
                    return Err(EngineError::validation(format!(
                        "rule {}: unknown flag '{}'. Use i, m, s, x.",
                        i + 1,
                        other
                    )))
                }
            }
        }
        let re = builder.build().map_err(|e| {
            EngineError::validation(format!("rule {}: invalid pattern: {}", i + 1, e))
        })?;
        compiled.push(CompiledRule {
            re,
            replacement: rule.replacement.clone(),
        });
    }
    Ok(compiled)
}

/// Applies all rules to one text, returning the rewritten text and the
/// total number of replacements.
fn apply_rules(rules: &[CompiledRule], text: &str) -> (String, usize) {
    let mut current = text.to_string();
    let mut replacements = 0usize;
    for rule in rules {
        let count = rule.re.find_iter(&current).count();
        if count > 0 {
            replacements += count;
            current = rule
                .re
                .replace_all(&current, rule.replacement.as_str())
                .into_owned();
        }
    }
    (current, replacements)
}

/// Before/after sample in a preview.
#[derive(Debug, Clone, Serialize)]
pub struct CurateExample {
    pub unit_id: i64,
    pub n: i64,
    pub before: String,
    pub after: String,
}

/// Preview outcome. The database is untouched, so `fts_stale` is false by
/// construction.
#[derive(Debug, Clone, Serialize)]
pub struct PreviewReport {
    pub units_total: usize,
    pub units_changed: usize,
    pub replacements_total: usize,
    pub examples: Vec<CurateExample>,
    pub fts_stale: bool,
}

/// Dry-runs the rules against one document.
pub async fn preview(
    pool: &SqlitePool,
    doc_id: i64,
    rules: &[CurationRule],
    limit_examples: usize,
) -> Result<PreviewReport> {
    let compiled = compile_rules(rules)?;
    ensure_document(pool, doc_id).await?;

    let rows = sqlx::query(
        "SELECT id, n, text_norm FROM units WHERE doc_id = ? AND kind = 'line' ORDER BY n",
    )
    .bind(doc_id)
    .fetch_all(pool)
    .await?;

    let mut report = PreviewReport {
        units_total: rows.len(),
        units_changed: 0,
        replacements_total: 0,
        examples: Vec::new(),
        fts_stale: false,
    };

    for row in rows {
        let text: String = row.get("text_norm");
        let (after, count) = apply_rules(&compiled, &text);
        if after != text {
            report.units_changed += 1;
            report.replacements_total += count;
            if report.examples.len() < limit_examples {
                report.examples.push(CurateExample {
                    unit_id: row.get("id"),
                    n: row.get("n"),
                    before: text,
                    after,
                });
            }
        } else {
            report.replacements_total += count;
        }
    }

    Ok(report)
}

/// Apply outcome. `fts_stale` reflects what this apply did: true when at
/// least one unit was rewritten.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    pub run_id: String,
    pub units_total: usize,
    pub units_changed: usize,
    pub replacements_total: usize,
    pub fts_stale: bool,
}

/// Rewrites `text_norm` for the scope (one document, or all when `doc_id`
/// is `None`) in one transaction.
pub async fn apply(
    pool: &SqlitePool,
    ctx: &RunContext,
    doc_id: Option<i64>,
    rules: &[CurationRule],
    progress: &dyn Progress,
) -> Result<ApplyReport> {
    let compiled = compile_rules(rules)?;
    if let Some(doc_id) = doc_id {
        ensure_document(pool, doc_id).await?;
    }

    let run = RunRecorder::begin(
        ctx,
        RunKind::Curate,
        json!({
            "doc_id": doc_id,
            "rules": rules.len(),
        }),
    );

    let rows = match doc_id {
        Some(doc_id) => {
            sqlx::query("SELECT id, text_norm FROM units WHERE doc_id = ? AND kind = 'line' ORDER BY id")
                .bind(doc_id)
                .fetch_all(pool)
                .await?
        }
        None => {
            sqlx::query("SELECT id, text_norm FROM units WHERE kind = 'line' ORDER BY id")
                .fetch_all(pool)
                .await?
        }
    };

    let units_total = rows.len();
    let mut units_changed = 0usize;
    let mut replacements_total = 0usize;

    let mut tx = pool.begin().await?;
    for (i, row) in rows.iter().enumerate() {
        let text: String = row.get("text_norm");
        let (after, count) = apply_rules(&compiled, &text);
        replacements_total += count;
        if after != text {
            units_changed += 1;
            let id: i64 = row.get("id");
            sqlx::query("UPDATE units SET text_norm = ? WHERE id = ?")
                .bind(&after)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        if (i + 1) % 100 == 0 {
            let pct = ((i + 1) * 90 / units_total.max(1)) as u8;
            if let Err(e) = checkpoint(progress, pct, &format!("{}/{} units", i + 1, units_total)) {
                tx.rollback().await?;
                return Err(e);
            }
        }
    }

    if units_changed > 0 {
        sqlx::query(
            "INSERT INTO meta (key, value) VALUES (?, 'true') ON CONFLICT(key) DO UPDATE SET value = 'true'",
        )
        .bind(migrate::META_FTS_STALE)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    run.log(&format!(
        "{} of {} units rewritten ({} replacements)",
        units_changed, units_total, replacements_total
    ));
    let run_id = run
        .finish(
            pool,
            json!({
                "units_total": units_total,
                "units_changed": units_changed,
                "replacements_total": replacements_total,
            }),
        )
        .await?;

    Ok(ApplyReport {
        run_id,
        units_total,
        units_changed,
        replacements_total,
        fts_stale: units_changed > 0,
    })
}

async fn ensure_document(pool: &SqlitePool, doc_id: i64) -> Result<()> {
    let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM documents WHERE id = ?")
        .bind(doc_id)
        .fetch_one(pool)
        .await?;
    if exists {
        Ok(())
    } else {
        Err(EngineError::validation(format!(
            "unknown document: {}",
            doc_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str, replacement: &str) -> CurationRule {
        CurationRule {
            pattern: pattern.to_string(),
            replacement: replacement.to_string(),
            flags: String::new(),
            description: None,
        }
    }

    #[test]
    fn rules_apply_in_order() {
        let compiled = compile_rules(&[rule("a", "b"), rule("bb", "c")]).unwrap();
        let (out, count) = apply_rules(&compiled, "ab");
        // "ab" -> "bb" (1 replacement) -> "c" (1 replacement)
        assert_eq!(out, "c");
        assert_eq!(count, 2);
    }

    #[test]
    fn invalid_pattern_fails_eagerly() {
        let err = compile_rules(&[rule("(unclosed", "x")]).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn unknown_flag_is_rejected() {
        let mut r = rule("a", "b");
        r.flags = "iz".to_string();
        let err = compile_rules(&[r]).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn case_insensitive_flag() {
        let mut r = rule("bonjour", "salut");
        r.flags = "i".to_string();
        let compiled = compile_rules(&[r]).unwrap();
        let (out, count) = apply_rules(&compiled, "BONJOUR le monde");
        assert_eq!(out, "salut le monde");
        assert_eq!(count, 1);
    }

    #[test]
    fn capture_group_replacement() {
        let compiled = compile_rules(&[rule(r"(\w+)-(\w+)", "$2-$1")]).unwrap();
        let (out, _) = apply_rules(&compiled, "avant-hier");
        assert_eq!(out, "hier-avant");
    }

    #[test]
    fn empty_rule_set_is_a_no_op() {
        let compiled = compile_rules(&[]).unwrap();
        let (out, count) = apply_rules(&compiled, "texte inchangé");
        assert_eq!(out, "texte inchangé");
        assert_eq!(count, 0);
    }
}
