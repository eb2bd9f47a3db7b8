//! Sidecar lifecycle and HTTP contract tests: real listener, real
//! requests, scratch databases.

use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;

use agrafes::config::Config;
use agrafes::portfile::{self, Portfile};
use agrafes::sidecar::{run_sidecar, SidecarOptions, ENDPOINTS, TOKEN_HEADER};

fn db_path(tmp: &TempDir) -> PathBuf {
    tmp.path().join("corpus.sqlite")
}

async fn start_sidecar(
    tmp: &TempDir,
    token_mode: &str,
) -> (Portfile, tokio::task::JoinHandle<anyhow::Result<()>>) {
    let db = db_path(tmp);
    let opts = SidecarOptions {
        db_path: db.clone(),
        host: "127.0.0.1".to_string(),
        port: 0,
        token_mode: token_mode.to_string(),
        config: Config::default(),
    };
    let handle = tokio::spawn(run_sidecar(opts));

    for _ in 0..200 {
        if let Some(pf) = portfile::read(&db) {
            if portfile::health_ok(&pf.host, pf.port).await {
                return (pf, handle);
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("sidecar did not become healthy");
}

fn url(pf: &Portfile, path: &str) -> String {
    format!("http://{}:{}{}", pf.host, pf.port, path)
}

#[tokio::test]
async fn health_reports_identity() {
    let tmp = TempDir::new().unwrap();
    let (pf, handle) = start_sidecar(&tmp, "off").await;

    let body: serde_json::Value = reqwest::get(url(&pf, "/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["api_version"], "1");
    assert_eq!(body["token_required"], false);
    assert!(body["version"].is_string());
    assert!(body["pid"].is_number());
    assert!(body["started_at"].is_string());

    handle.abort();
}

#[tokio::test]
async fn unknown_route_is_enveloped_404() {
    let tmp = TempDir::new().unwrap();
    let (pf, handle) = start_sidecar(&tmp, "off").await;

    let resp = reqwest::get(url(&pf, "/no/such/route")).await.unwrap();
    assert_eq!(resp.status().as_u16(), 404);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["ok"], false);
    assert_eq!(body["error_code"], "NOT_FOUND");
    assert_eq!(body["status"], "error");

    handle.abort();
}

// Token guard on write endpoints.
#[tokio::test]
async fn token_guard_on_write_endpoints() {
    let tmp = TempDir::new().unwrap();
    let (pf, handle) = start_sidecar(&tmp, "auto").await;
    let token = pf.token.clone().expect("auto mode persists a token");
    let client = reqwest::Client::new();

    // Import one document so the rebuild has something to count.
    let src = tmp.path().join("un.txt");
    std::fs::write(&src, "[1] Bonjour le monde.\n").unwrap();
    let resp = client
        .post(url(&pf, "/import"))
        .header(TOKEN_HEADER, &token)
        .json(&serde_json::json!({ "path": src.display().to_string(), "language": "fr" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    // Write without the header: 401 with the frozen error shape.
    let resp = client.post(url(&pf, "/index")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 401);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["ok"], false);
    assert_eq!(body["error_code"], "UNAUTHORIZED");

    // Same request with the token succeeds and counts the line units.
    let resp = client
        .post(url(&pf, "/index"))
        .header(TOKEN_HEADER, &token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["units_indexed"], 1);

    // Read endpoints never require the token.
    let resp = client.get(url(&pf, "/documents")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    handle.abort();
}

// A stale portfile is reclaimed and a fresh port bound.
#[tokio::test]
async fn stale_portfile_is_reclaimed() {
    let tmp = TempDir::new().unwrap();
    let db = db_path(&tmp);

    portfile::write(
        &db,
        &Portfile {
            host: "127.0.0.1".to_string(),
            port: 1,
            pid: 3_999_999_999,
            started_at: "2024-01-01T00:00:00Z".to_string(),
            db_path: db.display().to_string(),
            token: None,
        },
    )
    .unwrap();

    let (pf, handle) = start_sidecar(&tmp, "off").await;
    assert_ne!(pf.port, 1);
    assert_eq!(pf.pid, std::process::id());

    let body: serde_json::Value = reqwest::get(url(&pf, "/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["ok"], true);

    handle.abort();
}

#[tokio::test]
async fn shutdown_removes_portfile() {
    let tmp = TempDir::new().unwrap();
    let (pf, handle) = start_sidecar(&tmp, "off").await;

    let resp = reqwest::Client::new()
        .post(url(&pf, "/shutdown"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    let result = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("sidecar should stop after /shutdown")
        .unwrap();
    assert!(result.is_ok());
    assert!(portfile::read(&db_path(&tmp)).is_none());
}

#[tokio::test]
async fn missing_content_type_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let (pf, handle) = start_sidecar(&tmp, "off").await;

    let resp = reqwest::Client::new()
        .post(url(&pf, "/query"))
        .body("{\"q\": \"x\"}")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error_code"], "VALIDATION_ERROR");

    handle.abort();
}

#[tokio::test]
async fn query_over_http() {
    let tmp = TempDir::new().unwrap();
    let (pf, handle) = start_sidecar(&tmp, "off").await;
    let client = reqwest::Client::new();

    let src = tmp.path().join("deux.txt");
    std::fs::write(&src, "[1] Bonjour le monde.\n[2] Deuxième ligne.\n").unwrap();
    client
        .post(url(&pf, "/import"))
        .json(&serde_json::json!({ "path": src.display().to_string(), "language": "fr" }))
        .send()
        .await
        .unwrap();
    client.post(url(&pf, "/index")).send().await.unwrap();

    let body: serde_json::Value = client
        .post(url(&pf, "/query"))
        .json(&serde_json::json!({ "q": "Bonjour" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["hits"].as_array().unwrap().len(), 1);
    assert_eq!(body["hits"][0]["text"], "<<Bonjour>> le monde.");
    assert_eq!(body["fts_stale"], false);
    assert_eq!(body["total"], serde_json::Value::Null);

    handle.abort();
}

#[tokio::test]
async fn jobs_enqueue_poll_and_list() {
    let tmp = TempDir::new().unwrap();
    let (pf, handle) = start_sidecar(&tmp, "off").await;
    let client = reqwest::Client::new();

    let body: serde_json::Value = client
        .post(url(&pf, "/jobs/enqueue"))
        .json(&serde_json::json!({ "kind": "validate-meta", "params": {} }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["status"], "accepted");
    let job_id = body["job"]["id"].as_str().unwrap().to_string();

    let mut last = serde_json::Value::Null;
    for _ in 0..100 {
        let body: serde_json::Value = client
            .get(url(&pf, &format!("/jobs/{}", job_id)))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        last = body["job"].clone();
        if last["status"] == "done" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(last["status"], "done");
    assert_eq!(last["progress_pct"], 100);
    assert!(last["result"]["documents"].is_array());

    let body: serde_json::Value = client
        .get(url(&pf, "/jobs?status=done"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["jobs"].as_array().unwrap().len(), 1);

    // Canceling a terminal job is an idempotent success; the status
    // never leaves its terminal state.
    let body: serde_json::Value = client
        .post(url(&pf, &format!("/jobs/{}/cancel", job_id)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["job"]["status"], "done");

    // Unknown job kinds are validation errors.
    let resp = client
        .post(url(&pf, "/jobs/enqueue"))
        .json(&serde_json::json!({ "kind": "reticulate", "params": {} }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    handle.abort();
}

/// The committed endpoint contract. Adding endpoints is allowed; removing
/// any makes this test fail.
#[test]
fn endpoint_contract_snapshot() {
    let expected: &[(&str, &str)] = &[
        ("GET", "/health"),
        ("GET", "/openapi.json"),
        ("GET", "/documents"),
        ("GET", "/doc_relations"),
        ("POST", "/query"),
        ("POST", "/import"),
        ("POST", "/index"),
        ("POST", "/curate"),
        ("POST", "/curate/preview"),
        ("POST", "/segment"),
        ("POST", "/align"),
        ("POST", "/align/audit"),
        ("POST", "/align/quality"),
        ("POST", "/align/link/update_status"),
        ("POST", "/align/link/delete"),
        ("POST", "/align/link/retarget"),
        ("POST", "/documents/update"),
        ("POST", "/documents/bulk_update"),
        ("POST", "/doc_relations/set"),
        ("POST", "/doc_relations/delete"),
        ("POST", "/validate-meta"),
        ("POST", "/export/tei"),
        ("POST", "/export/align_csv"),
        ("POST", "/export/run_report"),
        ("GET", "/jobs"),
        ("GET", "/jobs/{id}"),
        ("POST", "/jobs/enqueue"),
        ("POST", "/jobs/{id}/cancel"),
        ("POST", "/shutdown"),
    ];

    for (method, path) in expected {
        assert!(
            ENDPOINTS
                .iter()
                .any(|(m, p, _)| m == method && p == path),
            "endpoint removed from contract: {} {}",
            method,
            path
        );
    }
}
