//! Job runtime: FIFO queue, single worker, progress, cancellation.
//!
//! One background worker per sidecar process executes jobs serially — the
//! storage layer serializes writers anyway, so parallel workers would only
//! contend on the same lock and complicate cancellation. States move
//! `queued → running → (done | error | canceled)`; terminal states are
//! immutable. Cancellation is cooperative: the worker observes a shared
//! flag at each progress checkpoint.
//!
//! Job parameters arrive as polymorphic JSON and are modeled as a closed
//! tagged union ([`JobRequest`]) validated at enqueue time; unknown kinds
//! are validation errors.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::align::{self, AlignParams};
use crate::config::Config;
use crate::curate::{self, CurationRule};
use crate::documents;
use crate::error::{EngineError, Result};
use crate::export::{self, ReportFormat};
use crate::index;
use crate::ingest::{self, ImportFormat, ImportParams};
use crate::models::{DocRole, Job, JobStatus};
use crate::parse_tei::TeiUnitElement;
use crate::progress::Progress;
use crate::runs::RunContext;
use crate::segment;

// ============ Job parameter shapes ============

/// `import` job parameters (wire shape).
#[derive(Debug, Clone, Deserialize)]
pub struct ImportJobParams {
    pub path: String,
    pub format: Option<String>,
    pub title: Option<String>,
    pub language: Option<String>,
    pub role: Option<String>,
    pub resource_type: Option<String>,
    pub tei_unit: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl ImportJobParams {
    /// Validates the wire shape into engine parameters.
    pub fn into_params(self) -> Result<ImportParams> {
        let mut params = ImportParams::new(PathBuf::from(self.path));
        if let Some(format) = self.format.as_deref() {
            params.format = Some(ImportFormat::parse(format)?);
        }
        params.title = self.title;
        params.language = self.language;
        if let Some(role) = self.role.as_deref() {
            params.role = DocRole::parse(role)?;
        }
        if let Some(resource_type) = self.resource_type {
            params.resource_type = resource_type;
        }
        if let Some(tei_unit) = self.tei_unit.as_deref() {
            params.tei_unit = TeiUnitElement::parse(tei_unit)?;
        }
        if let Some(metadata) = self.metadata {
            params.metadata = metadata;
        }
        Ok(params)
    }
}

/// `index` job parameters: none.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IndexJobParams {}

/// `curate` job parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct CurateJobParams {
    pub doc_id: Option<i64>,
    pub rules: Vec<CurationRule>,
}

/// `validate-meta` job parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ValidateMetaJobParams {
    pub doc_id: Option<i64>,
}

/// `segment` job parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct SegmentJobParams {
    pub doc_id: i64,
    pub pattern: Option<String>,
}

/// `export_tei` job parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct ExportTeiJobParams {
    pub doc_ids: Vec<i64>,
    pub out_dir: String,
    #[serde(default)]
    pub include_structure: bool,
}

/// `export_align_csv` job parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct ExportAlignCsvJobParams {
    pub path: String,
    pub delimiter: Option<String>,
    pub pivot_doc_id: Option<i64>,
    pub target_doc_id: Option<i64>,
    pub external_id: Option<i64>,
}

/// `export_run_report` job parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct ExportRunReportJobParams {
    pub path: String,
    pub format: ReportFormat,
    pub run_id: Option<String>,
}

/// Parses a delimiter parameter (`","`, `";"`, `"\t"`, or `"tab"`).
pub fn parse_delimiter(s: Option<&str>) -> Result<char> {
    match s {
        None | Some(",") => Ok(','),
        Some(";") => Ok(';'),
        Some("\t") | Some("tab") => Ok('\t'),
        Some(other) => Err(EngineError::validation(format!(
            "unknown delimiter: '{}'. Use ',', ';', '\\t', or 'tab'.",
            other
        ))),
    }
}

/// Closed union of every supported job kind with its parameter shape.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", content = "params", rename_all = "snake_case")]
pub enum JobRequest {
    Import(ImportJobParams),
    Index(IndexJobParams),
    Curate(CurateJobParams),
    #[serde(rename = "validate-meta")]
    ValidateMeta(ValidateMetaJobParams),
    Segment(SegmentJobParams),
    Align(AlignParams),
    ExportTei(ExportTeiJobParams),
    ExportAlignCsv(ExportAlignCsvJobParams),
    ExportRunReport(ExportRunReportJobParams),
}

impl JobRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            JobRequest::Import(_) => "import",
            JobRequest::Index(_) => "index",
            JobRequest::Curate(_) => "curate",
            JobRequest::ValidateMeta(_) => "validate-meta",
            JobRequest::Segment(_) => "segment",
            JobRequest::Align(_) => "align",
            JobRequest::ExportTei(_) => "export_tei",
            JobRequest::ExportAlignCsv(_) => "export_align_csv",
            JobRequest::ExportRunReport(_) => "export_run_report",
        }
    }
}

// ============ Runtime ============

/// Everything the worker needs to execute jobs.
#[derive(Clone)]
pub struct JobEnv {
    pub pool: SqlitePool,
    pub run_ctx: RunContext,
    pub config: Config,
}

struct JobEntry {
    job: Job,
    cancel: Arc<AtomicBool>,
    /// Consumed by the worker when the job starts.
    request: Option<JobRequest>,
}

struct JobsInner {
    jobs: HashMap<String, JobEntry>,
    /// Insertion order, for listing and terminal retention.
    order: Vec<String>,
}

/// Shared registry of jobs plus the queue feeding the single worker.
pub struct JobRuntime {
    inner: Mutex<JobsInner>,
    tx: mpsc::UnboundedSender<String>,
    retain_terminal: usize,
}

impl JobRuntime {
    /// Creates the runtime and the receiving end for the worker task.
    pub fn new(retain_terminal: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let runtime = Arc::new(JobRuntime {
            inner: Mutex::new(JobsInner {
                jobs: HashMap::new(),
                order: Vec::new(),
            }),
            tx,
            retain_terminal,
        });
        (runtime, rx)
    }

    /// Validates and enqueues one job, returning its snapshot.
    pub fn enqueue(&self, request: JobRequest, raw_params: serde_json::Value) -> Result<Job> {
        let id = Uuid::new_v4().to_string();
        let job = Job {
            id: id.clone(),
            kind: request.kind().to_string(),
            status: JobStatus::Queued,
            progress_pct: 0,
            progress_message: "queued".to_string(),
            params: raw_params,
            result: None,
            error: None,
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            finished_at: None,
        };

        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.jobs.insert(
                id.clone(),
                JobEntry {
                    job: job.clone(),
                    cancel: Arc::new(AtomicBool::new(false)),
                    request: Some(request),
                },
            );
            inner.order.push(id.clone());
        }

        self.tx
            .send(id)
            .map_err(|_| EngineError::internal("job worker is gone"))?;
        Ok(job)
    }

    /// Fetches one job snapshot.
    pub fn get(&self, id: &str) -> Option<Job> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.jobs.get(id).map(|e| e.job.clone())
    }

    /// Lists jobs, newest first, optionally filtered by status.
    pub fn list(&self, status: Option<JobStatus>, limit: usize, offset: usize) -> Vec<Job> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .order
            .iter()
            .rev()
            .filter_map(|id| inner.jobs.get(id))
            .map(|e| &e.job)
            .filter(|j| status.map(|s| j.status == s).unwrap_or(true))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Cancels a job. Idempotent; terminal jobs are a successful no-op.
    pub fn cancel(&self, id: &str) -> Result<Job> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found(format!("unknown job: {}", id)))?;
        match entry.job.status {
            JobStatus::Queued => {
                entry.job.status = JobStatus::Canceled;
                entry.job.finished_at = Some(chrono::Utc::now().timestamp());
                entry.job.progress_message = "canceled before start".to_string();
                entry.request = None;
            }
            JobStatus::Running => {
                entry.cancel.store(true, Ordering::SeqCst);
            }
            JobStatus::Done | JobStatus::Error | JobStatus::Canceled => {}
        }
        Ok(entry.job.clone())
    }

    fn take_for_run(&self, id: &str) -> Option<(JobRequest, Arc<AtomicBool>)> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = inner.jobs.get_mut(id)?;
        if entry.job.status != JobStatus::Queued {
            return None;
        }
        let request = entry.request.take()?;
        entry.job.status = JobStatus::Running;
        entry.job.started_at = Some(chrono::Utc::now().timestamp());
        entry.job.progress_message = "running".to_string();
        Some((request, entry.cancel.clone()))
    }

    fn report_progress(&self, id: &str, pct: u8, message: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = inner.jobs.get_mut(id) {
            if entry.job.status == JobStatus::Running {
                entry.job.progress_pct = pct.min(100);
                entry.job.progress_message = message.to_string();
            }
        }
    }

    fn finish(&self, id: &str, outcome: std::result::Result<serde_json::Value, EngineError>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = inner.jobs.get_mut(id) {
            entry.job.finished_at = Some(chrono::Utc::now().timestamp());
            let cancel_requested = entry.cancel.load(Ordering::SeqCst);
            match outcome {
                // A cancel requested mid-run wins even when the operation
                // ran to completion: the result is discarded.
                Ok(_) | Err(EngineError::Canceled) if cancel_requested => {
                    entry.job.status = JobStatus::Canceled;
                    entry.job.progress_message = "canceled".to_string();
                }
                Ok(result) => {
                    entry.job.status = JobStatus::Done;
                    entry.job.progress_pct = 100;
                    entry.job.progress_message = "done".to_string();
                    entry.job.result = Some(result);
                }
                Err(EngineError::Canceled) => {
                    entry.job.status = JobStatus::Canceled;
                    entry.job.progress_message = "canceled".to_string();
                }
                Err(e) => {
                    entry.job.status = JobStatus::Error;
                    entry.job.progress_message = "error".to_string();
                    entry.job.error = Some(json!({
                        "type": e.kind(),
                        "message": e.to_string(),
                        "code": e.code(),
                    }));
                }
            }
        }
        self.prune_terminal(&mut inner);
    }

    /// Keeps all non-terminal jobs plus the most recent terminal window.
    fn prune_terminal(&self, inner: &mut JobsInner) {
        let terminal: Vec<String> = inner
            .order
            .iter()
            .filter(|id| {
                inner
                    .jobs
                    .get(*id)
                    .map(|e| e.job.status.is_terminal())
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        if terminal.len() <= self.retain_terminal {
            return;
        }
        let drop_count = terminal.len() - self.retain_terminal;
        for id in terminal.into_iter().take(drop_count) {
            inner.jobs.remove(&id);
            inner.order.retain(|o| o != &id);
        }
    }
}

/// Progress adapter: forwards checkpoints into the registry and reads the
/// cancel flag.
struct JobProgress {
    runtime: Arc<JobRuntime>,
    job_id: String,
    cancel: Arc<AtomicBool>,
}

impl Progress for JobProgress {
    fn checkpoint(&self, pct: u8, message: &str) -> bool {
        if self.cancel.load(Ordering::SeqCst) {
            return false;
        }
        self.runtime.report_progress(&self.job_id, pct, message);
        true
    }
}

/// Spawns the single worker task. Jobs complete in FIFO order.
pub fn spawn_worker(
    env: JobEnv,
    runtime: Arc<JobRuntime>,
    mut rx: mpsc::UnboundedReceiver<String>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(job_id) = rx.recv().await {
            let Some((request, cancel)) = runtime.take_for_run(&job_id) else {
                continue;
            };
            tracing::info!(job_id = %job_id, kind = request.kind(), "job started");
            let progress = JobProgress {
                runtime: runtime.clone(),
                job_id: job_id.clone(),
                cancel,
            };
            let outcome = execute(&env, request, &progress).await;
            if let Err(e) = &outcome {
                if !matches!(e, EngineError::Canceled) {
                    tracing::warn!(job_id = %job_id, error = %e, "job failed");
                }
            }
            runtime.finish(&job_id, outcome);
        }
    })
}

async fn execute(
    env: &JobEnv,
    request: JobRequest,
    progress: &dyn Progress,
) -> Result<serde_json::Value> {
    match request {
        JobRequest::Import(params) => {
            let params = params.into_params()?;
            let report = ingest::import_document(&env.pool, &env.run_ctx, params, progress).await?;
            Ok(serde_json::to_value(report)?)
        }
        JobRequest::Index(_) => {
            let report = index::rebuild(&env.pool, &env.run_ctx, progress).await?;
            Ok(serde_json::to_value(report)?)
        }
        JobRequest::Curate(params) => {
            let report =
                curate::apply(&env.pool, &env.run_ctx, params.doc_id, &params.rules, progress)
                    .await?;
            Ok(serde_json::to_value(report)?)
        }
        JobRequest::ValidateMeta(params) => {
            let validations = documents::validate_meta(&env.pool, params.doc_id).await?;
            Ok(json!({ "documents": validations }))
        }
        JobRequest::Segment(params) => {
            let report = segment::resegment(
                &env.pool,
                &env.run_ctx,
                params.doc_id,
                params.pattern.as_deref(),
                progress,
            )
            .await?;
            Ok(serde_json::to_value(report)?)
        }
        JobRequest::Align(params) => {
            let report = align::run_align(&env.pool, &env.run_ctx, &params, progress).await?;
            Ok(serde_json::to_value(report)?)
        }
        JobRequest::ExportTei(params) => {
            let report = export::export_tei(
                &env.pool,
                &env.run_ctx,
                &params.doc_ids,
                std::path::Path::new(&params.out_dir),
                params.include_structure,
            )
            .await?;
            Ok(serde_json::to_value(report)?)
        }
        JobRequest::ExportAlignCsv(params) => {
            let delimiter = parse_delimiter(params.delimiter.as_deref())?;
            let report = export::export_align_csv(
                &env.pool,
                &env.run_ctx,
                std::path::Path::new(&params.path),
                delimiter,
                params.pivot_doc_id,
                params.target_doc_id,
                params.external_id,
            )
            .await?;
            Ok(serde_json::to_value(report)?)
        }
        JobRequest::ExportRunReport(params) => {
            let report = export::export_run_report(
                &env.pool,
                &env.run_ctx,
                std::path::Path::new(&params.path),
                params.format,
                params.run_id.as_deref(),
            )
            .await?;
            Ok(serde_json::to_value(report)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(kind: &str, params: serde_json::Value) -> serde_json::Value {
        json!({ "kind": kind, "params": params })
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let v = request("reticulate", json!({}));
        assert!(serde_json::from_value::<JobRequest>(v).is_err());
    }

    #[test]
    fn kinds_round_trip() {
        let cases = vec![
            request("index", json!({})),
            request("validate-meta", json!({})),
            request("curate", json!({ "rules": [] })),
            request("segment", json!({ "doc_id": 1 })),
            request(
                "align",
                json!({ "pivot_doc_id": 1, "target_doc_ids": [2] }),
            ),
            request(
                "export_run_report",
                json!({ "path": "/tmp/r.jsonl", "format": "jsonl" }),
            ),
        ];
        for case in cases {
            let kind = case["kind"].as_str().unwrap().to_string();
            let parsed: JobRequest = serde_json::from_value(case).unwrap();
            assert_eq!(parsed.kind(), kind);
        }
    }

    #[test]
    fn queued_job_cancels_immediately() {
        let (runtime, _rx) = JobRuntime::new(100);
        let job = runtime
            .enqueue(
                JobRequest::Index(IndexJobParams::default()),
                json!({}),
            )
            .unwrap();
        assert_eq!(job.status, JobStatus::Queued);

        let canceled = runtime.cancel(&job.id).unwrap();
        assert_eq!(canceled.status, JobStatus::Canceled);

        // Idempotent: canceling a terminal job is a successful no-op.
        let again = runtime.cancel(&job.id).unwrap();
        assert_eq!(again.status, JobStatus::Canceled);

        // The worker skips jobs canceled while queued.
        assert!(runtime.take_for_run(&job.id).is_none());
    }

    #[test]
    fn retention_keeps_recent_terminal_jobs() {
        let (runtime, _rx) = JobRuntime::new(2);
        let mut ids = Vec::new();
        for _ in 0..4 {
            let job = runtime
                .enqueue(JobRequest::Index(IndexJobParams::default()), json!({}))
                .unwrap();
            ids.push(job.id);
        }
        for id in &ids {
            runtime.take_for_run(id);
            runtime.finish(id, Ok(json!({})));
        }
        assert!(runtime.get(&ids[0]).is_none());
        assert!(runtime.get(&ids[1]).is_none());
        assert!(runtime.get(&ids[2]).is_some());
        assert!(runtime.get(&ids[3]).is_some());
    }

    #[test]
    fn list_filters_by_status() {
        let (runtime, _rx) = JobRuntime::new(100);
        let a = runtime
            .enqueue(JobRequest::Index(IndexJobParams::default()), json!({}))
            .unwrap();
        let _b = runtime
            .enqueue(JobRequest::Index(IndexJobParams::default()), json!({}))
            .unwrap();
        runtime.cancel(&a.id).unwrap();

        let queued = runtime.list(Some(JobStatus::Queued), 10, 0);
        assert_eq!(queued.len(), 1);
        let canceled = runtime.list(Some(JobStatus::Canceled), 10, 0);
        assert_eq!(canceled.len(), 1);
        let all = runtime.list(None, 10, 0);
        assert_eq!(all.len(), 2);
    }
}
