use actix_web::{HttpRequest, HttpResponse, ResponseError, get, web};
use serde::{Deserialize, Serialize};

use super::{client_info, resolve_user_id};
use crate::audit::{AuditLog, AuditStatus};
use crate::storage::{ANONYMOUS_USER, FileEntry, SessionStorage};

#[derive(Deserialize, Debug, Default)]
pub struct FilesQuery {
    /// `summary` (default) or `full`
    pub detail: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileSummary<'a> {
    name: &'a str,
    last_modified: &'a str,
}

#[get("/files/{session_id}")]
pub async fn files_handler(
    req: HttpRequest,
    path: web::Path<(String,)>,
    query: web::Query<FilesQuery>,
    storage: web::Data<SessionStorage>,
    audit: web::Data<AuditLog>,
) -> HttpResponse {
    let session_id = path.into_inner().0;
    let client = client_info(&req);
    let full = query.detail.as_deref() == Some("full");

    let listing = match resolve_user_id(&req, &storage, Some(&session_id)).await {
        Ok(user_id) => storage
            .list_session_files(&user_id, &session_id)
            .await
            .map(|files| (user_id, files)),
        Err(e) => Err(e),
    };

    match listing {
        Ok((user_id, files)) => {
            audit.record_files_list(
                &client,
                &user_id,
                &session_id,
                files.len(),
                AuditStatus::Success,
                None,
            );
            log::info!(
                "Listed {} files for user {user_id}, session {session_id}",
                files.len()
            );

            if full {
                return HttpResponse::Ok().json(files);
            }
            let summary: Vec<FileSummary> = files
                .iter()
                .map(|f: &FileEntry| FileSummary {
                    name: &f.name,
                    last_modified: &f.last_modified,
                })
                .collect();
            HttpResponse::Ok().json(summary)
        }
        Err(e) => {
            log::error!("Files list error for session {session_id}: {e}");
            audit.record_files_list(
                &client,
                ANONYMOUS_USER,
                &session_id,
                0,
                AuditStatus::Error,
                Some(e.to_string()),
            );
            e.error_response()
        }
    }
}
