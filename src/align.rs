//! Alignment engine: builds pivot↔target link sets.
//!
//! Four strategies produce one-to-one links between the line units of a
//! pivot document and each target document:
//!
//! - **anchor** (`external_id`) — match shared integer anchors
//! - **hybrid** (`external_id_then_position`) — anchors first, then
//!   position for the leftovers
//! - **position** (`n`) — match by ordering index
//! - **similarity** — greedy normalized edit-distance matching
//!
//! Each (pivot, target) pair writes its link set in one transaction tagged
//! by the run id; re-running never overwrites earlier link sets.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{Row, SqlitePool};

use crate::error::{EngineError, Result};
use crate::models::RunKind;
use crate::progress::{checkpoint, Progress};
use crate::runs::{RunContext, RunRecorder};

/// Alignment strategy tag as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    ExternalId,
    ExternalIdThenPosition,
    Position,
    Similarity,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::ExternalId => "external_id",
            Strategy::ExternalIdThenPosition => "external_id_then_position",
            Strategy::Position => "position",
            Strategy::Similarity => "similarity",
        }
    }
}

/// Alignment request.
#[derive(Debug, Clone, Deserialize)]
pub struct AlignParams {
    pub pivot_doc_id: i64,
    pub target_doc_ids: Vec<i64>,
    #[serde(default)]
    pub strategy: Strategy,
    pub sim_threshold: Option<f64>,
    #[serde(default)]
    pub debug_align: bool,
}

/// Per-target outcome.
#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    pub target_doc_id: i64,
    pub links_created: usize,
    pub links_skipped: usize,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<serde_json::Value>,
}

/// Whole-run outcome, persisted as a run of kind `align`.
#[derive(Debug, Clone, Serialize)]
pub struct AlignReport {
    pub run_id: String,
    pub strategy: Strategy,
    pub links_created_total: usize,
    pub targets: Vec<TargetReport>,
}

#[derive(Debug, Clone)]
struct LineUnit {
    id: i64,
    n: i64,
    external_id: Option<i64>,
    text_norm: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkSource {
    Anchor,
    Position,
    Similarity,
}

impl LinkSource {
    fn as_str(&self) -> &'static str {
        match self {
            LinkSource::Anchor => "anchor",
            LinkSource::Position => "position",
            LinkSource::Similarity => "similarity",
        }
    }
}

#[derive(Debug, Clone)]
struct PlannedLink {
    pivot_unit_id: i64,
    target_unit_id: i64,
    external_id: Option<i64>,
    source: LinkSource,
    score: Option<f64>,
}

struct PairPlan {
    links: Vec<PlannedLink>,
    skipped: usize,
    warnings: Vec<String>,
}

/// Runs alignment for one pivot against each target document.
pub async fn run_align(
    pool: &SqlitePool,
    ctx: &RunContext,
    params: &AlignParams,
    progress: &dyn Progress,
) -> Result<AlignReport> {
    if params.target_doc_ids.is_empty() {
        return Err(EngineError::validation("target_doc_ids must not be empty"));
    }
    if params.target_doc_ids.contains(&params.pivot_doc_id) {
        return Err(EngineError::validation(
            "pivot document cannot be its own target",
        ));
    }
    let sim_threshold = params.sim_threshold.unwrap_or(0.8);
    if !(0.0..=1.0).contains(&sim_threshold) {
        return Err(EngineError::validation("sim_threshold must be in [0.0, 1.0]"));
    }
    ensure_document(pool, params.pivot_doc_id).await?;
    for target in &params.target_doc_ids {
        ensure_document(pool, *target).await?;
    }

    let run = RunRecorder::begin(
        ctx,
        RunKind::Align,
        json!({
            "pivot_doc_id": params.pivot_doc_id,
            "target_doc_ids": params.target_doc_ids.clone(),
            "strategy": params.strategy.as_str(),
            "sim_threshold": sim_threshold,
        }),
    );
    let run_id = run.id().to_string();

    let pivot_units = load_line_units(pool, params.pivot_doc_id).await?;
    run.log(&format!(
        "pivot doc {} has {} line units",
        params.pivot_doc_id,
        pivot_units.len()
    ));

    let mut targets = Vec::with_capacity(params.target_doc_ids.len());
    let mut links_created_total = 0usize;
    let total_targets = params.target_doc_ids.len();

    for (i, &target_doc_id) in params.target_doc_ids.iter().enumerate() {
        let pct = 10 + (i * 80 / total_targets) as u8;
        checkpoint(progress, pct, &format!("aligning against doc {}", target_doc_id))?;

        let target_units = load_line_units(pool, target_doc_id).await?;
        let plan = plan_pair(params.strategy, &pivot_units, &target_units, sim_threshold);

        let created_at = chrono::Utc::now().timestamp();
        let mut tx = pool.begin().await?;
        for link in &plan.links {
            sqlx::query(
                r#"
                INSERT INTO alignment_links
                    (run_id, pivot_unit_id, target_unit_id, pivot_doc_id, target_doc_id, external_id, created_at, status)
                VALUES (?, ?, ?, ?, ?, ?, ?, NULL)
                "#,
            )
            .bind(&run_id)
            .bind(link.pivot_unit_id)
            .bind(link.target_unit_id)
            .bind(params.pivot_doc_id)
            .bind(target_doc_id)
            .bind(link.external_id)
            .bind(created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        run.log(&format!(
            "doc {}: {} links created, {} pivots skipped",
            target_doc_id,
            plan.links.len(),
            plan.skipped
        ));

        let debug = if params.debug_align {
            Some(debug_payload(&plan))
        } else {
            None
        };

        links_created_total += plan.links.len();
        targets.push(TargetReport {
            target_doc_id,
            links_created: plan.links.len(),
            links_skipped: plan.skipped,
            warnings: plan.warnings,
            debug,
        });
    }

    checkpoint(progress, 95, "recording run")?;
    let stats = json!({
        "strategy": params.strategy.as_str(),
        "links_created_total": links_created_total,
        "targets": targets
            .iter()
            .map(|t| json!({
                "target_doc_id": t.target_doc_id,
                "links_created": t.links_created,
                "links_skipped": t.links_skipped,
                "warnings": t.warnings,
            }))
            .collect::<Vec<_>>(),
    });
    let run_id = run.finish(pool, stats).await?;

    Ok(AlignReport {
        run_id,
        strategy: params.strategy,
        links_created_total,
        targets,
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

async fn load_line_units(pool: &SqlitePool, doc_id: i64) -> Result<Vec<LineUnit>> {
    let rows = sqlx::query(
        "SELECT id, n, external_id, text_norm FROM units WHERE doc_id = ? AND kind = 'line' ORDER BY n",
    )
    .bind(doc_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| LineUnit {
            id: row.get("id"),
            n: row.get("n"),
            external_id: row.get("external_id"),
            text_norm: row.get("text_norm"),
        })
        .collect())
}

fn plan_pair(
    strategy: Strategy,
    pivot: &[LineUnit],
    target: &[LineUnit],
    sim_threshold: f64,
) -> PairPlan {
    match strategy {
        Strategy::ExternalId => plan_anchor(pivot, target, false),
        Strategy::ExternalIdThenPosition => plan_anchor(pivot, target, true),
        Strategy::Position => plan_position(pivot, target),
        Strategy::Similarity => plan_similarity(pivot, target, sim_threshold),
    }
}

/// First-occurrence map `external_id → unit index`; duplicates warn.
fn anchor_map<'a>(
    units: &'a [LineUnit],
    side: &str,
    warnings: &mut Vec<String>,
) -> HashMap<i64, &'a LineUnit> {
    let mut map: HashMap<i64, &LineUnit> = HashMap::new();
    for unit in units {
        if let Some(ext) = unit.external_id {
            if map.contains_key(&ext) {
                warnings.push(format!(
                    "duplicate external_id {} on {} side, keeping first occurrence",
                    ext, side
                ));
            } else {
                map.insert(ext, unit);
            }
        }
    }
    map
}

fn plan_anchor(pivot: &[LineUnit], target: &[LineUnit], then_position: bool) -> PairPlan {
    let mut warnings = Vec::new();
    let pivot_map = anchor_map(pivot, "pivot", &mut warnings);
    let target_map = anchor_map(target, "target", &mut warnings);

    let mut links = Vec::new();
    let mut linked_pivots: HashSet<i64> = HashSet::new();
    let mut used_targets: HashSet<i64> = HashSet::new();

    for unit in pivot {
        let Some(ext) = unit.external_id else { continue };
        // Only the first occurrence on the pivot side carries the anchor.
        if pivot_map.get(&ext).map(|u| u.id) != Some(unit.id) {
            continue;
        }
        if let Some(target_unit) = target_map.get(&ext) {
            if used_targets.insert(target_unit.id) {
                links.push(PlannedLink {
                    pivot_unit_id: unit.id,
                    target_unit_id: target_unit.id,
                    external_id: Some(ext),
                    source: LinkSource::Anchor,
                    score: None,
                });
                linked_pivots.insert(unit.id);
            }
        }
    }

    if then_position {
        let target_by_n: HashMap<i64, &LineUnit> = target.iter().map(|u| (u.n, u)).collect();
        for unit in pivot {
            if linked_pivots.contains(&unit.id) {
                continue;
            }
            if let Some(target_unit) = target_by_n.get(&unit.n) {
                if used_targets.insert(target_unit.id) {
                    links.push(PlannedLink {
                        pivot_unit_id: unit.id,
                        target_unit_id: target_unit.id,
                        external_id: None,
                        source: LinkSource::Position,
                        score: None,
                    });
                    linked_pivots.insert(unit.id);
                }
            }
        }
    }

    PairPlan {
        skipped: pivot.len() - linked_pivots.len(),
        links,
        warnings,
    }
}

fn plan_position(pivot: &[LineUnit], target: &[LineUnit]) -> PairPlan {
    let mut warnings = Vec::new();
    let target_by_n: HashMap<i64, &LineUnit> = target.iter().map(|u| (u.n, u)).collect();
    let pivot_ns: HashSet<i64> = pivot.iter().map(|u| u.n).collect();

    let mut links = Vec::new();
    let mut missing_in_target = 0usize;
    for unit in pivot {
        match target_by_n.get(&unit.n) {
            Some(target_unit) => links.push(PlannedLink {
                pivot_unit_id: unit.id,
                target_unit_id: target_unit.id,
                external_id: None,
                source: LinkSource::Position,
                score: None,
            }),
            None => missing_in_target += 1,
        }
    }
    if missing_in_target > 0 {
        warnings.push(format!(
            "{} pivot positions have no counterpart in the target",
            missing_in_target
        ));
    }
    let missing_in_pivot = target.iter().filter(|u| !pivot_ns.contains(&u.n)).count();
    if missing_in_pivot > 0 {
        warnings.push(format!(
            "{} target positions have no counterpart in the pivot",
            missing_in_pivot
        ));
    }

    PairPlan {
        skipped: pivot.len() - links.len(),
        links,
        warnings,
    }
}

/// Greedy one-to-one matching by normalized edit-distance similarity.
/// Deterministic: pivots are visited in order of `n`; equal scores break
/// toward the smaller target unit id.
fn plan_similarity(pivot: &[LineUnit], target: &[LineUnit], threshold: f64) -> PairPlan {
    let mut links = Vec::new();
    let mut used_targets: HashSet<i64> = HashSet::new();

    for unit in pivot {
        let mut best: Option<(f64, &LineUnit)> = None;
        for candidate in target {
            if used_targets.contains(&candidate.id) {
                continue;
            }
            let score = strsim::normalized_levenshtein(&unit.text_norm, &candidate.text_norm);
            let better = match best {
                None => score >= threshold,
                Some((best_score, best_unit)) => {
                    score > best_score || (score == best_score && candidate.id < best_unit.id)
                }
            };
            if better && score >= threshold {
                best = Some((score, candidate));
            }
        }
        if let Some((score, target_unit)) = best {
            used_targets.insert(target_unit.id);
            links.push(PlannedLink {
                pivot_unit_id: unit.id,
                target_unit_id: target_unit.id,
                external_id: None,
                source: LinkSource::Similarity,
                score: Some(score),
            });
        }
    }

    PairPlan {
        skipped: pivot.len() - links.len(),
        links,
        warnings: Vec::new(),
    }
}

fn debug_payload(plan: &PairPlan) -> serde_json::Value {
    let mut phases: HashMap<&str, usize> = HashMap::new();
    for link in &plan.links {
        *phases.entry(link.source.as_str()).or_insert(0) += 1;
    }

    let samples: Vec<serde_json::Value> = plan
        .links
        .iter()
        .take(5)
        .map(|l| {
            json!({
                "pivot_unit_id": l.pivot_unit_id,
                "target_unit_id": l.target_unit_id,
                "external_id": l.external_id,
                "source": l.source.as_str(),
            })
        })
        .collect();

    let scores: Vec<f64> = plan.links.iter().filter_map(|l| l.score).collect();
    let similarity = if scores.is_empty() {
        serde_json::Value::Null
    } else {
        let sum: f64 = scores.iter().sum();
        let min = scores.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        json!({
            "mean": sum / scores.len() as f64,
            "min": min,
            "max": max,
        })
    };

    json!({
        "phases": phases,
        "sample_links": samples,
        "similarity": similarity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(id: i64, n: i64, ext: Option<i64>, text: &str) -> LineUnit {
        LineUnit {
            id,
            n,
            external_id: ext,
            text_norm: text.to_string(),
        }
    }

    #[test]
    fn anchor_links_shared_ids_only() {
        let pivot = vec![
            unit(1, 1, Some(1), "a"),
            unit(2, 2, Some(2), "b"),
            unit(3, 3, Some(3), "c"),
        ];
        let target = vec![
            unit(10, 1, Some(2), "B"),
            unit(11, 2, Some(3), "C"),
            unit(12, 3, Some(4), "D"),
        ];
        let plan = plan_anchor(&pivot, &target, false);
        assert_eq!(plan.links.len(), 2);
        assert_eq!(plan.skipped, 1);
        assert_eq!(plan.links[0].external_id, Some(2));
        assert_eq!(plan.links[0].target_unit_id, 10);
        assert_eq!(plan.links[1].external_id, Some(3));
    }

    #[test]
    fn anchor_duplicates_keep_first_and_warn() {
        let pivot = vec![unit(1, 1, Some(5), "x"), unit(2, 2, Some(5), "y")];
        let target = vec![unit(10, 1, Some(5), "z")];
        let plan = plan_anchor(&pivot, &target, false);
        assert_eq!(plan.links.len(), 1);
        assert_eq!(plan.links[0].pivot_unit_id, 1);
        assert!(plan.warnings.iter().any(|w| w.contains("duplicate")));
    }

    #[test]
    fn hybrid_fills_unmatched_by_position() {
        let pivot = vec![
            unit(1, 1, Some(1), "a"),
            unit(2, 2, None, "b"),
            unit(3, 3, Some(3), "c"),
        ];
        let target = vec![
            unit(10, 1, Some(1), "A"),
            unit(11, 2, None, "B"),
            unit(12, 3, Some(9), "C"),
        ];
        let plan = plan_anchor(&pivot, &target, true);
        // 1↔10 by anchor, 2↔11 and 3↔12 by position.
        assert_eq!(plan.links.len(), 3);
        assert_eq!(plan.skipped, 0);
        let by_source: Vec<_> = plan.links.iter().map(|l| l.source).collect();
        assert_eq!(
            by_source,
            vec![LinkSource::Anchor, LinkSource::Position, LinkSource::Position]
        );
        // Position-phase links carry no anchoring external id.
        assert_eq!(plan.links[1].external_id, None);
    }

    #[test]
    fn position_reports_missing_sides() {
        let pivot = vec![unit(1, 1, None, "a"), unit(2, 2, None, "b")];
        let target = vec![unit(10, 1, None, "A")];
        let plan = plan_position(&pivot, &target);
        assert_eq!(plan.links.len(), 1);
        assert_eq!(plan.skipped, 1);
        assert!(plan.warnings.iter().any(|w| w.contains("no counterpart")));
    }

    #[test]
    fn similarity_greedy_threshold_and_tiebreak() {
        let pivot = vec![unit(1, 1, None, "bonjour le monde")];
        let target = vec![
            unit(11, 1, None, "bonjour le monde"),
            unit(10, 2, None, "bonjour le monde"),
            unit(12, 3, None, "completely different"),
        ];
        let plan = plan_similarity(&pivot, &target, 0.8);
        assert_eq!(plan.links.len(), 1);
        // Equal perfect scores: smaller unit id wins.
        assert_eq!(plan.links[0].target_unit_id, 10);
        assert!(plan.links[0].score.unwrap() > 0.99);
    }

    #[test]
    fn similarity_below_threshold_skips() {
        let pivot = vec![unit(1, 1, None, "abcdefgh")];
        let target = vec![unit(10, 1, None, "zzzzzzzz")];
        let plan = plan_similarity(&pivot, &target, 0.8);
        assert!(plan.links.is_empty());
        assert_eq!(plan.skipped, 1);
    }

    #[test]
    fn debug_payload_counts_phases() {
        let pivot = vec![unit(1, 1, Some(1), "a"), unit(2, 2, None, "b")];
        let target = vec![unit(10, 1, Some(1), "A"), unit(11, 2, None, "B")];
        let plan = plan_anchor(&pivot, &target, true);
        let debug = debug_payload(&plan);
        assert_eq!(debug["phases"]["anchor"], 1);
        assert_eq!(debug["phases"]["position"], 1);
        assert_eq!(debug["sample_links"].as_array().unwrap().len(), 2);
        assert!(debug["similarity"].is_null());
    }
}
