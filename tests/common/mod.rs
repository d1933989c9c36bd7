#![allow(dead_code)]

use std::sync::Arc;

use actix_web::test::TestRequest;
use async_trait::async_trait;
use serde_json::json;
use sqlx::sqlite::SqlitePool;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use sandbox_server::audit::AuditLog;
use sandbox_server::config::Config;
use sandbox_server::database::{self as db, AuditQuery, AuditRecord};
use sandbox_server::error::Result;
use sandbox_server::queue::ExecutionQueue;
use sandbox_server::sandbox::{RunOutput, RunSpec, SandboxRunner};
use sandbox_server::storage::SessionStorage;
use sandbox_server::web_server::AppState;
use sandbox_server::worker::spawn_workers;

pub const BOUNDARY: &str = "sandbox-test-boundary";

/// Stand-in for the container runtime that recognises a handful of programs.
pub struct ScriptedRunner;

#[async_trait]
impl SandboxRunner for ScriptedRunner {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn run(&self, spec: &RunSpec) -> Result<RunOutput> {
        let code = tokio::fs::read_to_string(spec.exec_dir.join(spec.script_name())).await?;

        if code.contains("pdfplumber") {
            let has_pdf = std::fs::read_dir(&spec.exec_dir)?
                .filter_map(|e| e.ok())
                .any(|e| e.file_name().to_string_lossy().to_lowercase().ends_with(".pdf"));
            if !has_pdf {
                return Ok(RunOutput {
                    stderr: r#"{"error": "No PDF file found in working directory"}"#.to_string(),
                    exit_code: 1,
                    ..Default::default()
                });
            }
            let text = "--- Page 1 ---\nQuarterly report";
            return Ok(RunOutput {
                stdout: json!({
                    "text": text,
                    "pageCount": 1,
                    "metadata": { "total_pages": 1, "title": "Report" },
                    "charCount": text.len(),
                })
                .to_string(),
                ..Default::default()
            });
        }

        if code.contains("open('chart.pdf'") {
            std::fs::write(spec.exec_dir.join("chart.pdf"), "%PDF-1.4 generated")?;
            return Ok(RunOutput::default());
        }

        if code.contains("open('out.csv'") {
            std::fs::write(spec.exec_dir.join("out.csv"), "a,b\n1,2\n")?;
            return Ok(RunOutput::default());
        }

        if code.contains("sys.exit(3)") {
            return Ok(RunOutput {
                stderr: "exiting with 3\n".to_string(),
                exit_code: 3,
                ..Default::default()
            });
        }

        if code.trim() == "print(1+1)" {
            return Ok(RunOutput {
                stdout: "2\n".to_string(),
                ..Default::default()
            });
        }

        Ok(RunOutput::default())
    }
}

pub struct TestEnv {
    pub state: AppState,
    pub pool: SqlitePool,
    pub storage_root: std::path::PathBuf,
    token: CancellationToken,
    _workers: JoinSet<anyhow::Result<()>>,
    _dir: tempfile::TempDir,
}

impl TestEnv {
    pub async fn new(api_key: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.server.api_key = api_key.to_string();
        config.server.max_upload_bytes = 64 * 1024;
        config.storage.root = dir.path().join("storage");
        config.executor.cleanup_delay_ms = 50;

        let storage = Arc::new(SessionStorage::new(&config.storage.root).unwrap());
        let pool = db::init_db(dir.path().join("audit.sqlite3")).await.unwrap();
        let audit = Arc::new(AuditLog::new(Some(pool.clone())));
        audit.set_db_connected(true);

        let queue = Arc::new(ExecutionQueue::new(2));
        let token = CancellationToken::new();
        let workers = spawn_workers(queue.clone(), token.clone());

        let state = AppState::new(
            &config,
            storage.clone(),
            Arc::new(ScriptedRunner),
            queue,
            audit,
        );

        Self {
            state,
            pool,
            storage_root: storage.root().to_path_buf(),
            token,
            _workers: workers,
            _dir: dir,
        }
    }

    /// Audit records matching `query`, after pending writes land.
    pub async fn audit_records(&self, query: AuditQuery) -> Vec<AuditRecord> {
        self.state.audit.flush().await;
        db::fetch_audit_events(&query, &self.pool).await.unwrap()
    }

    pub async fn audit_by_action(&self, action: &str) -> Vec<AuditRecord> {
        self.audit_records(AuditQuery {
            action: Some(action.to_string()),
            ..Default::default()
        })
        .await
    }
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

pub fn multipart_body(filename: &str, content: &[u8], entity_id: Option<&str>) -> Vec<u8> {
    let mut body = Vec::new();
    if let Some(entity_id) = entity_id {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"entity_id\"\r\n\r\n{entity_id}\r\n"
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub fn upload_request(filename: &str, content: &[u8], entity_id: Option<&str>) -> TestRequest {
    TestRequest::post()
        .uri("/upload")
        .insert_header((
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        ))
        .set_payload(multipart_body(filename, content, entity_id))
}
