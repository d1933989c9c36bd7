use actix_web::{HttpRequest, HttpResponse, ResponseError, post, web};
use serde::{Deserialize, Serialize};

use super::{bad_request, resolve_user_id};
use crate::error::{Result, SandboxError};
use crate::path_guard::validate_component;
use crate::pdf::{PdfExtractor, PdfText, is_pdf};
use crate::queue::ExecutionQueue;
use crate::storage::SessionStorage;

#[derive(Deserialize, Debug)]
pub struct ExtractPdfRequest {
    pub file_id: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueInfo {
    pub was_queued: bool,
    pub queue_position: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExtractPdfResponse {
    success: bool,
    #[serde(flatten)]
    text: PdfText,
    queue_info: QueueInfo,
}

/// Original name of an uploaded PDF; fails unless the file looks like one.
///
/// Only `uploads/` is searched, the same place staging copies inputs from.
async fn locate_pdf(
    storage: &SessionStorage,
    user_id: &str,
    session_id: &str,
    file_id: &str,
) -> Result<String> {
    let paths = storage.session_paths(user_id, session_id)?;
    let path = storage
        .find_upload(&paths, file_id)
        .await?
        .ok_or_else(|| SandboxError::FileNotFound(file_id.to_string()))?;
    let filename = match storage.original_filename(user_id, session_id, file_id).await? {
        Some(name) => name,
        None => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_id.to_string()),
    };

    if !is_pdf(&filename, &path) {
        return Err(SandboxError::NotAPdf);
    }
    Ok(filename)
}

#[post("/extract-pdf")]
pub async fn extract_pdf_handler(
    req: HttpRequest,
    body: web::Json<ExtractPdfRequest>,
    storage: web::Data<SessionStorage>,
    queue: web::Data<ExecutionQueue>,
    extractor: web::Data<PdfExtractor>,
) -> HttpResponse {
    let ExtractPdfRequest {
        file_id,
        session_id,
    } = body.into_inner();
    let Some(file_id) = file_id.filter(|s| !s.is_empty()) else {
        return bad_request("file_id is required");
    };
    let Some(session_id) = session_id.filter(|s| !s.is_empty()) else {
        return bad_request("session_id is required");
    };

    let located = async {
        validate_component(&session_id)?;
        let user_id = resolve_user_id(&req, &storage, Some(&session_id)).await?;
        let filename = locate_pdf(&storage, &user_id, &session_id, &file_id).await?;
        Ok::<_, SandboxError>((user_id, filename))
    }
    .await;
    let (user_id, filename) = match located {
        Ok(found) => found,
        Err(e) => {
            log::warn!("PDF extraction of {file_id} rejected: {e}");
            return e.error_response();
        }
    };

    let stats = queue.stats();
    let was_queued = stats.running >= stats.max_concurrent;
    let queue_info = QueueInfo {
        was_queued,
        queue_position: if was_queued { stats.queued + 1 } else { 0 },
    };
    if was_queued {
        log::info!(
            "PDF extraction of {file_id} queued at position {} ({} running)",
            queue_info.queue_position,
            stats.running
        );
    }

    match extractor
        .extract(&user_id, &session_id, &file_id, &filename)
        .await
    {
        Ok(text) => HttpResponse::Ok().json(ExtractPdfResponse {
            success: true,
            text,
            queue_info,
        }),
        Err(e) => {
            log::error!("PDF extraction of {file_id} in session {session_id} failed: {e}");
            e.error_response()
        }
    }
}
