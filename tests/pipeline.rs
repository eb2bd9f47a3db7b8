//! End-to-end pipeline scenarios: import → index → query → align → curate,
//! exercised through the library API against scratch databases.

use std::path::PathBuf;

use sqlx::{Row, SqlitePool};
use tempfile::TempDir;

use agrafes::align::{run_align, AlignParams, Strategy};
use agrafes::audit;
use agrafes::config::QueryConfig;
use agrafes::curate::{self, CurationRule};
use agrafes::ingest::{import_document, ImportParams};
use agrafes::models::UnitKind;
use agrafes::progress::NoProgress;
use agrafes::query::{run_query, QueryMode, QueryParams};
use agrafes::runs::RunContext;
use agrafes::{db, index, migrate, segment};

async fn setup() -> (TempDir, SqlitePool) {
    let tmp = TempDir::new().unwrap();
    let pool = db::connect(&tmp.path().join("corpus.sqlite")).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    (tmp, pool)
}

fn write_file(tmp: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = tmp.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

async fn import_numbered(
    pool: &SqlitePool,
    tmp: &TempDir,
    name: &str,
    content: &str,
    language: &str,
) -> i64 {
    let path = write_file(tmp, name, content);
    let mut params = ImportParams::new(&path);
    params.language = Some(language.to_string());
    let report = import_document(pool, &RunContext::disabled(), params, &NoProgress)
        .await
        .unwrap();
    report.doc_id
}

fn base_query(q: &str) -> QueryParams {
    QueryParams {
        q: q.to_string(),
        mode: QueryMode::Segment,
        window: None,
        language: None,
        doc_id: None,
        doc_role: None,
        resource_type: None,
        include_aligned: false,
        aligned_limit: None,
        all_occurrences: false,
        limit: None,
        offset: None,
    }
}

// Numbered-line round trip: import, index, then a segment-mode query.
#[tokio::test]
async fn numbered_round_trip_segment_query() {
    let (tmp, pool) = setup().await;
    let doc_id = import_numbered(
        &pool,
        &tmp,
        "deux.txt",
        "[1] Bonjour le monde.\n[2] Deuxième ligne.\n",
        "fr",
    )
    .await;

    let exts: Vec<i64> =
        sqlx::query_scalar("SELECT external_id FROM units WHERE doc_id = ? ORDER BY n")
            .bind(doc_id)
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(exts, vec![1, 2]);

    index::rebuild(&pool, &RunContext::disabled(), &NoProgress)
        .await
        .unwrap();

    let response = run_query(
        &pool,
        &RunContext::disabled(),
        &QueryConfig::default(),
        &base_query("Bonjour"),
    )
    .await
    .unwrap();

    assert_eq!(response.hits.len(), 1);
    assert_eq!(
        response.hits[0].text.as_deref(),
        Some("<<Bonjour>> le monde.")
    );
    assert!(!response.fts_stale);
    assert!(!response.has_more);
    assert_eq!(response.total, None);
    pool.close().await;
}

// KWIC window and multi-occurrence expansion.
#[tokio::test]
async fn kwic_window_and_all_occurrences() {
    let (tmp, pool) = setup().await;
    import_numbered(
        &pool,
        &tmp,
        "needles.txt",
        "[1] needle haystack needle needle haystack\n",
        "en",
    )
    .await;
    index::rebuild(&pool, &RunContext::disabled(), &NoProgress)
        .await
        .unwrap();

    let mut params = base_query("needle");
    params.mode = QueryMode::Kwic;
    params.window = Some(1);
    params.all_occurrences = true;

    let response = run_query(
        &pool,
        &RunContext::disabled(),
        &QueryConfig::default(),
        &params,
    )
    .await
    .unwrap();

    assert_eq!(response.hits.len(), 3);
    let parts: Vec<(&str, &str, &str)> = response
        .hits
        .iter()
        .map(|h| {
            let k = h.kwic.as_ref().unwrap();
            (k.left.as_str(), k.match_text.as_str(), k.right.as_str())
        })
        .collect();
    assert_eq!(
        parts,
        vec![
            ("", "needle", "haystack"),
            ("haystack", "needle", "needle"),
            ("needle", "needle", "haystack"),
        ]
    );
    pool.close().await;
}

// Anchor alignment plus the quality report.
#[tokio::test]
async fn anchor_alignment_and_quality() {
    let (tmp, pool) = setup().await;
    let pivot = import_numbered(
        &pool,
        &tmp,
        "pivot.txt",
        "[1] un\n[2] deux\n[3] trois\n",
        "fr",
    )
    .await;
    let target = import_numbered(
        &pool,
        &tmp,
        "target.txt",
        "[2] two\n[3] three\n[4] four\n",
        "en",
    )
    .await;

    let report = run_align(
        &pool,
        &RunContext::disabled(),
        &AlignParams {
            pivot_doc_id: pivot,
            target_doc_ids: vec![target],
            strategy: Strategy::ExternalId,
            sim_threshold: None,
            debug_align: false,
        },
        &NoProgress,
    )
    .await
    .unwrap();

    assert_eq!(report.targets.len(), 1);
    assert_eq!(report.targets[0].links_created, 2);
    assert_eq!(report.targets[0].links_skipped, 1);

    let quality = audit::quality(&pool, pivot, target, Some(&report.run_id))
        .await
        .unwrap();
    assert_eq!(quality.pivot_total, 3);
    assert_eq!(quality.target_total, 3);
    assert_eq!(quality.links_total, 2);
    assert!((quality.coverage_pct - 66.66).abs() < 0.1);
    assert_eq!(quality.orphan_pivot_count, 1);
    assert_eq!(quality.orphan_target_count, 1);
    assert_eq!(quality.collision_count, 0);
    assert_eq!(quality.status_counts.unreviewed, 2);
    assert_eq!(quality.sample_orphan_pivot.len(), 1);
    assert_eq!(quality.sample_orphan_pivot[0].external_id, Some(1));
    pool.close().await;
}

// Curation preview leaves the database alone; apply rewrites
// text_norm only.
#[tokio::test]
async fn curation_preview_vs_apply() {
    let (_tmp, pool) = setup().await;

    // A legacy unit whose normalized text still carries an NBSP, as if
    // written before the normalization policy covered it.
    sqlx::query(
        "INSERT INTO documents (id, title, language, role, resource_type, metadata_json, source_path, content_hash, created_at) \
         VALUES (1, 'legacy', 'fr', 'standalone', '', '{}', 'legacy.txt', 'x', 0)",
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO units (doc_id, kind, n, external_id, text_raw, text_norm, metadata_json) \
         VALUES (1, 'line', 1, 1, 'a\u{00A0}b', 'a\u{00A0}b', '{}')",
    )
    .execute(&pool)
    .await
    .unwrap();

    let rules = vec![CurationRule {
        pattern: "\u{00A0}".to_string(),
        replacement: " ".to_string(),
        flags: String::new(),
        description: None,
    }];

    let preview = curate::preview(&pool, 1, &rules, 10).await.unwrap();
    assert_eq!(preview.units_total, 1);
    assert_eq!(preview.units_changed, 1);
    assert_eq!(preview.replacements_total, 1);
    assert!(!preview.fts_stale);
    assert_eq!(preview.examples.len(), 1);
    assert_eq!(preview.examples[0].after, "a b");

    // Preview mutated nothing.
    let norm: String = sqlx::query_scalar("SELECT text_norm FROM units WHERE doc_id = 1")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(norm, "a\u{00A0}b");

    let apply = curate::apply(&pool, &RunContext::disabled(), Some(1), &rules, &NoProgress)
        .await
        .unwrap();
    assert_eq!(apply.units_changed, 1);
    assert_eq!(apply.replacements_total, 1);
    assert!(apply.fts_stale);

    let row = sqlx::query("SELECT text_raw, text_norm FROM units WHERE doc_id = 1")
        .fetch_one(&pool)
        .await
        .unwrap();
    let raw: String = row.get("text_raw");
    let norm: String = row.get("text_norm");
    assert_eq!(raw, "a\u{00A0}b");
    assert_eq!(norm, "a b");
    pool.close().await;
}

// Property: applying an empty rule set is a no-op.
#[tokio::test]
async fn empty_rule_set_is_noop() {
    let (tmp, pool) = setup().await;
    import_numbered(&pool, &tmp, "doc.txt", "[1] texte\n", "fr").await;
    index::rebuild(&pool, &RunContext::disabled(), &NoProgress)
        .await
        .unwrap();

    let apply = curate::apply(&pool, &RunContext::disabled(), None, &[], &NoProgress)
        .await
        .unwrap();
    assert_eq!(apply.units_changed, 0);
    assert!(!apply.fts_stale);
    assert!(!migrate::fts_stale(&pool).await.unwrap());
    pool.close().await;
}

// Property: two successive pages concatenate to the single large page.
#[tokio::test]
async fn pagination_pages_concatenate() {
    let (tmp, pool) = setup().await;
    let content: String = (1..=5)
        .map(|i| format!("[{}] motcle ligne {}\n", i, i))
        .collect();
    import_numbered(&pool, &tmp, "cinq.txt", &content, "fr").await;
    index::rebuild(&pool, &RunContext::disabled(), &NoProgress)
        .await
        .unwrap();

    let mut paged_ids: Vec<i64> = Vec::new();
    let mut offset = 0i64;
    loop {
        let mut params = base_query("motcle");
        params.limit = Some(2);
        params.offset = Some(offset);
        let page = run_query(
            &pool,
            &RunContext::disabled(),
            &QueryConfig::default(),
            &params,
        )
        .await
        .unwrap();
        paged_ids.extend(page.hits.iter().map(|h| h.unit_id));
        match page.next_offset {
            Some(next) => offset = next,
            None => break,
        }
    }

    let mut params = base_query("motcle");
    params.limit = Some(50);
    let all = run_query(
        &pool,
        &RunContext::disabled(),
        &QueryConfig::default(),
        &params,
    )
    .await
    .unwrap();
    let all_ids: Vec<i64> = all.hits.iter().map(|h| h.unit_id).collect();

    assert_eq!(paged_ids, all_ids);
    assert_eq!(all_ids.len(), 5);
    pool.close().await;
}

// Aligned enrichment attaches sibling units to hits.
#[tokio::test]
async fn query_with_aligned_enrichment() {
    let (tmp, pool) = setup().await;
    let fr = import_numbered(&pool, &tmp, "fr.txt", "[1] bonjour monde\n", "fr").await;
    let en = import_numbered(&pool, &tmp, "en.txt", "[1] hello world\n", "en").await;

    run_align(
        &pool,
        &RunContext::disabled(),
        &AlignParams {
            pivot_doc_id: fr,
            target_doc_ids: vec![en],
            strategy: Strategy::ExternalId,
            sim_threshold: None,
            debug_align: false,
        },
        &NoProgress,
    )
    .await
    .unwrap();
    index::rebuild(&pool, &RunContext::disabled(), &NoProgress)
        .await
        .unwrap();

    let mut params = base_query("bonjour");
    params.include_aligned = true;
    let response = run_query(
        &pool,
        &RunContext::disabled(),
        &QueryConfig::default(),
        &params,
    )
    .await
    .unwrap();

    assert_eq!(response.hits.len(), 1);
    let aligned = response.hits[0].aligned.as_ref().unwrap();
    assert_eq!(aligned.len(), 1);
    assert_eq!(aligned[0].doc_id, en);
    assert_eq!(aligned[0].text, "hello world");
    assert_eq!(aligned[0].language, "en");
    pool.close().await;
}

// A malformed FTS expression surfaces as a validation error, not a 500.
#[tokio::test]
async fn malformed_query_is_validation_error() {
    let (tmp, pool) = setup().await;
    import_numbered(&pool, &tmp, "doc.txt", "[1] texte\n", "fr").await;
    index::rebuild(&pool, &RunContext::disabled(), &NoProgress)
        .await
        .unwrap();

    let err = run_query(
        &pool,
        &RunContext::disabled(),
        &QueryConfig::default(),
        &base_query("\"unterminated"),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, agrafes::error::EngineError::Validation(_)));
    pool.close().await;
}

// Segmentation replaces the line-unit set, drops links, and goes stale.
#[tokio::test]
async fn segmentation_resplits_and_drops_links() {
    let (tmp, pool) = setup().await;
    let a = import_numbered(
        &pool,
        &tmp,
        "long.txt",
        "[1] Une phrase. Une autre phrase. La fin\n",
        "fr",
    )
    .await;
    let b = import_numbered(&pool, &tmp, "autre.txt", "[1] peu importe\n", "fr").await;

    run_align(
        &pool,
        &RunContext::disabled(),
        &AlignParams {
            pivot_doc_id: a,
            target_doc_ids: vec![b],
            strategy: Strategy::Position,
            sim_threshold: None,
            debug_align: false,
        },
        &NoProgress,
    )
    .await
    .unwrap();

    let report = segment::resegment(&pool, &RunContext::disabled(), a, None, &NoProgress)
        .await
        .unwrap();
    assert_eq!(report.units_before, 1);
    assert_eq!(report.units_after, 3);
    assert_eq!(report.links_dropped, 1);
    assert!(report.fts_stale);

    // Renumbered 1..N, external ids cleared, kind stays line.
    let rows = sqlx::query("SELECT n, kind, external_id, text_raw FROM units WHERE doc_id = ? ORDER BY n")
        .bind(a)
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(rows.len(), 3);
    for (i, row) in rows.iter().enumerate() {
        let n: i64 = row.get("n");
        let kind: String = row.get("kind");
        let ext: Option<i64> = row.get("external_id");
        assert_eq!(n, (i + 1) as i64);
        assert_eq!(kind, UnitKind::Line.as_str());
        assert_eq!(ext, None);
    }
    let first: String = rows[0].get("text_raw");
    assert_eq!(first, "Une phrase.");

    let links: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM alignment_links")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(links, 0);
    pool.close().await;
}

// Audit listing, review, retarget, delete.
#[tokio::test]
async fn audit_list_review_and_delete() {
    let (tmp, pool) = setup().await;
    let pivot = import_numbered(&pool, &tmp, "p.txt", "[1] un\n[2] deux\n", "fr").await;
    let target = import_numbered(&pool, &tmp, "t.txt", "[1] one\n[2] two\n", "en").await;

    run_align(
        &pool,
        &RunContext::disabled(),
        &AlignParams {
            pivot_doc_id: pivot,
            target_doc_ids: vec![target],
            strategy: Strategy::ExternalId,
            sim_threshold: None,
            debug_align: false,
        },
        &NoProgress,
    )
    .await
    .unwrap();

    let page = audit::list_links(
        &pool,
        &agrafes::audit::AuditParams {
            pivot_doc_id: pivot,
            target_doc_id: target,
            run_id: None,
            external_id: None,
            status: None,
            limit: None,
            offset: None,
        },
    )
    .await
    .unwrap();
    assert_eq!(page.links.len(), 2);
    assert_eq!(page.links[0].pivot_text, "un");
    assert_eq!(page.links[0].target_text, "one");

    let link_id = page.links[0].link_id;
    audit::update_status(&pool, link_id, Some(agrafes::models::LinkStatus::Accepted))
        .await
        .unwrap();
    // Idempotent.
    audit::update_status(&pool, link_id, Some(agrafes::models::LinkStatus::Accepted))
        .await
        .unwrap();

    let accepted = audit::list_links(
        &pool,
        &agrafes::audit::AuditParams {
            pivot_doc_id: pivot,
            target_doc_id: target,
            run_id: None,
            external_id: None,
            status: Some("accepted".to_string()),
            limit: None,
            offset: None,
        },
    )
    .await
    .unwrap();
    assert_eq!(accepted.links.len(), 1);

    audit::delete_link(&pool, link_id).await.unwrap();
    let err = audit::delete_link(&pool, link_id).await.unwrap_err();
    assert!(matches!(err, agrafes::error::EngineError::NotFound(_)));
    pool.close().await;
}

// Hybrid strategy covers anchors first, then positions.
#[tokio::test]
async fn hybrid_alignment_end_to_end() {
    let (tmp, pool) = setup().await;
    let pivot = import_numbered(
        &pool,
        &tmp,
        "p.txt",
        "[10] dix\nsans ancre\n[30] trente\n",
        "fr",
    )
    .await;
    let target = import_numbered(
        &pool,
        &tmp,
        "t.txt",
        "[10] ten\nno anchor\n[31] thirty-one\n",
        "en",
    )
    .await;

    let report = run_align(
        &pool,
        &RunContext::disabled(),
        &AlignParams {
            pivot_doc_id: pivot,
            target_doc_ids: vec![target],
            strategy: Strategy::ExternalIdThenPosition,
            sim_threshold: None,
            debug_align: true,
        },
        &NoProgress,
    )
    .await
    .unwrap();

    // [10] matches by anchor; the two remaining line units match by n.
    assert_eq!(report.targets[0].links_created, 2);
    let debug = report.targets[0].debug.as_ref().unwrap();
    assert_eq!(debug["phases"]["anchor"], 1);
    assert_eq!(debug["phases"]["position"], 1);
    pool.close().await;
}

// Exports land on disk with escaped content.
#[tokio::test]
async fn exports_write_files() {
    let (tmp, pool) = setup().await;
    let doc = import_numbered(&pool, &tmp, "d.txt", "[1] a < b & c\n", "fr").await;

    let out_dir = tmp.path().join("out");
    let tei = agrafes::export::export_tei(
        &pool,
        &RunContext::disabled(),
        &[doc],
        &out_dir,
        false,
    )
    .await
    .unwrap();
    assert_eq!(tei.documents_exported, 1);
    let xml = std::fs::read_to_string(out_dir.join(&tei.files[0])).unwrap();
    assert!(xml.contains("a &lt; b &amp; c"));
    assert!(xml.starts_with("<?xml version=\"1.0\""));

    let report_path = tmp.path().join("runs.jsonl");
    let report = agrafes::export::export_run_report(
        &pool,
        &RunContext::disabled(),
        &report_path,
        agrafes::export::ReportFormat::Jsonl,
        None,
    )
    .await
    .unwrap();
    assert!(report.runs_written >= 1);
    let body = std::fs::read_to_string(&report_path).unwrap();
    assert!(body.lines().count() >= 1);
    pool.close().await;
}

// Alignment CSV dump with TSV delimiter.
#[tokio::test]
async fn align_dump_tsv() {
    let (tmp, pool) = setup().await;
    let pivot = import_numbered(&pool, &tmp, "p.txt", "[1] un\n", "fr").await;
    let target = import_numbered(&pool, &tmp, "t.txt", "[1] one\n", "en").await;
    run_align(
        &pool,
        &RunContext::disabled(),
        &AlignParams {
            pivot_doc_id: pivot,
            target_doc_ids: vec![target],
            strategy: Strategy::ExternalId,
            sim_threshold: None,
            debug_align: false,
        },
        &NoProgress,
    )
    .await
    .unwrap();

    let out = tmp.path().join("links.tsv");
    let report = agrafes::export::export_align_csv(
        &pool,
        &RunContext::disabled(),
        &out,
        '\t',
        Some(pivot),
        None,
        None,
    )
    .await
    .unwrap();
    assert_eq!(report.rows_written, 1);
    let body = std::fs::read_to_string(&out).unwrap();
    let mut lines = body.lines();
    assert_eq!(
        lines.next().unwrap(),
        "pivot_external_id\tpivot_text\ttarget_external_id\ttarget_text\tstatus"
    );
    assert_eq!(lines.next().unwrap(), "1\tun\t1\tone\t");
    pool.close().await;
}
