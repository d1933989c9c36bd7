use std::time::Instant;

use actix_web::{HttpRequest, HttpResponse, ResponseError, post, web};
use serde::{Deserialize, Serialize};

use super::{bad_request, client_info, resolve_user_id};
use crate::audit::{AuditLog, AuditStatus, ClientInfo, ExecutionInfo, code_preview};
use crate::executor::{ExecuteOptions, Executor, FileRef, GeneratedFile};
use crate::queue::ExecutionQueue;
use crate::storage::{ANONYMOUS_USER, SessionStorage};

/// Longest stderr excerpt kept in an audit record.
const AUDIT_ERROR_CHARS: usize = 1000;

/// `args` arrives either as a list or as a single string.
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum ExecArgs {
    List(Vec<String>),
    Single(String),
}

impl ExecArgs {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::List(args) => args,
            Self::Single(arg) if arg.trim().is_empty() => Vec::new(),
            Self::Single(arg) => vec![arg],
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct ExecRequest {
    pub lang: Option<String>,
    pub code: Option<String>,
    pub args: Option<ExecArgs>,
    #[serde(default)]
    pub files: Vec<FileRef>,
    pub session_id: Option<String>,
}

/// Body of a 500 that still looks like an execution result to the client.
#[derive(Serialize)]
struct FailedExecution {
    session_id: String,
    stdout: &'static str,
    stderr: String,
    #[serde(rename = "exitCode")]
    exit_code: i32,
    files: Vec<GeneratedFile>,
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Audits an exec request refused before a session was chosen.
fn reject(audit: &AuditLog, client: &ClientInfo, preview: String, message: String) {
    audit.record_execution(
        client,
        ANONYMOUS_USER,
        "",
        ExecutionInfo {
            lang: "unknown".to_string(),
            exit_code: -1,
            code_preview: preview,
            ..Default::default()
        },
        AuditStatus::Error,
        Some(message),
    );
}

#[post("/exec")]
pub async fn exec_handler(
    req: HttpRequest,
    body: web::Bytes,
    storage: web::Data<SessionStorage>,
    executor: web::Data<Executor>,
    queue: web::Data<ExecutionQueue>,
    audit: web::Data<AuditLog>,
) -> HttpResponse {
    let client = client_info(&req);
    let ExecRequest {
        lang,
        code,
        args,
        files,
        session_id,
    } = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            let message = format!("Invalid JSON body: {e}");
            log::warn!("Exec request rejected: {message}");
            reject(&audit, &client, String::new(), message.clone());
            return bad_request(message);
        }
    };
    let preview = code.as_deref().map(code_preview).unwrap_or_default();
    let stats = queue.stats();

    log::info!(
        "Exec request: lang {}, {} files, queue {}/{} running, {} queued, code `{preview}`",
        lang.as_deref().unwrap_or("-"),
        files.len(),
        stats.running,
        stats.max_concurrent,
        stats.queued
    );

    let (Some(lang), Some(code)) = (
        lang.filter(|l| !l.trim().is_empty()),
        code.filter(|c| !c.is_empty()),
    ) else {
        reject(
            &audit,
            &client,
            preview,
            "lang and code are required".to_string(),
        );
        return bad_request("lang and code are required");
    };

    let session_id = session_id
        .filter(|s| !s.is_empty())
        .or_else(|| files.first().and_then(|f| f.session_id.clone()))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(crate::generate_id);

    let started = Instant::now();
    let user_id = match resolve_user_id(&req, &storage, Some(&session_id)).await {
        Ok(user_id) => user_id,
        Err(e) => {
            audit.record_execution(
                &client,
                ANONYMOUS_USER,
                &session_id,
                ExecutionInfo {
                    lang,
                    exit_code: -1,
                    code_preview: preview,
                    ..Default::default()
                },
                AuditStatus::Error,
                Some(e.to_string()),
            );
            return e.error_response();
        }
    };

    let options = ExecuteOptions {
        user_id: user_id.clone(),
        session_id: session_id.clone(),
        lang: lang.clone(),
        code,
        args: args.map(ExecArgs::into_vec).unwrap_or_default(),
        files,
        ..Default::default()
    };
    let shared = executor.clone().into_inner();
    let outcome = queue
        .enqueue(async move { shared.execute(options).await })
        .await;

    let duration_ms = started.elapsed().as_millis() as u64;
    let memory_mb = executor.config().memory_mb;

    match outcome {
        Ok(result) => {
            let succeeded = result.exit_code == 0;
            audit.record_execution(
                &client,
                &user_id,
                &session_id,
                ExecutionInfo {
                    lang: lang.clone(),
                    duration_ms,
                    exit_code: result.exit_code,
                    memory_mb,
                    files_generated: result.files.len(),
                    code_preview: preview,
                },
                if succeeded {
                    AuditStatus::Success
                } else {
                    AuditStatus::Error
                },
                (!succeeded).then(|| truncate_chars(&result.stderr, AUDIT_ERROR_CHARS)),
            );
            log::info!(
                "Execution completed: user {user_id}, session {session_id}, lang {lang}, \
                 {duration_ms} ms, exit code {}, {} files generated",
                result.exit_code,
                result.files.len()
            );
            HttpResponse::Ok().json(result)
        }
        Err(e) => {
            log::error!("Exec error in session {session_id}: {e}");
            audit.record_execution(
                &client,
                &user_id,
                &session_id,
                ExecutionInfo {
                    lang,
                    duration_ms,
                    exit_code: -1,
                    memory_mb,
                    files_generated: 0,
                    code_preview: preview,
                },
                AuditStatus::Error,
                Some(e.to_string()),
            );

            if e.is_security() || matches!(e, crate::error::SandboxError::FileNotFound(_)) {
                return e.error_response();
            }
            HttpResponse::InternalServerError().json(FailedExecution {
                session_id,
                stdout: "",
                stderr: format!("Execution error: {}", e.public_message()),
                exit_code: -1,
                files: Vec::new(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_accept_list_or_string() {
        let req: ExecRequest =
            serde_json::from_str(r#"{"lang":"py","code":"x","args":["a","b"]}"#).unwrap();
        assert_eq!(req.args.unwrap().into_vec(), vec!["a", "b"]);

        let req: ExecRequest =
            serde_json::from_str(r#"{"lang":"py","code":"x","args":"--flag"}"#).unwrap();
        assert_eq!(req.args.unwrap().into_vec(), vec!["--flag"]);

        let req: ExecRequest = serde_json::from_str(r#"{"lang":"py","code":"x"}"#).unwrap();
        assert!(req.args.is_none());
        assert!(req.files.is_empty());
    }
}
