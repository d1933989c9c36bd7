use actix_web::body::SizedStream;
use actix_web::{HttpRequest, HttpResponse, ResponseError, get, web};
use tokio_util::io::ReaderStream;

use super::{client_info, resolve_user_id};
use crate::audit::{AuditLog, AuditStatus};
use crate::error::Result;
use crate::storage::{ANONYMOUS_USER, SessionStorage};

async fn open_stored_file(
    storage: &SessionStorage,
    user_id: &str,
    session_id: &str,
    file_id: &str,
) -> Result<(tokio::fs::File, u64)> {
    let path = storage.get_file_path(user_id, session_id, file_id).await?;
    let file = tokio::fs::File::open(&path).await?;
    let size = file.metadata().await?.len();
    Ok((file, size))
}

#[get("/download/{session_id}/{file_id}")]
pub async fn download_handler(
    req: HttpRequest,
    path: web::Path<(String, String)>,
    storage: web::Data<SessionStorage>,
    audit: web::Data<AuditLog>,
) -> HttpResponse {
    let (session_id, file_id) = path.into_inner();
    let client = client_info(&req);

    let user_id = match resolve_user_id(&req, &storage, Some(&session_id)).await {
        Ok(user_id) => user_id,
        Err(e) => {
            audit.record_download(
                &client,
                ANONYMOUS_USER,
                &session_id,
                &file_id,
                AuditStatus::Error,
                Some(e.to_string()),
            );
            return e.error_response();
        }
    };
    log::info!("Download request: user {user_id}, session {session_id}, file {file_id}");

    match open_stored_file(&storage, &user_id, &session_id, &file_id).await {
        Ok((file, size)) => {
            audit.record_download(
                &client,
                &user_id,
                &session_id,
                &file_id,
                AuditStatus::Success,
                None,
            );
            log::info!("Download successful: file {file_id}, {size} bytes");

            HttpResponse::Ok()
                .content_type("application/octet-stream")
                .body(SizedStream::new(size, ReaderStream::new(file)))
        }
        Err(e) => {
            log::error!("Download error for {file_id} in session {session_id}: {e}");
            audit.record_download(
                &client,
                &user_id,
                &session_id,
                &file_id,
                AuditStatus::Error,
                Some(e.to_string()),
            );
            e.error_response()
        }
    }
}
