use actix_multipart::{Field, Multipart};
use actix_web::{HttpRequest, HttpResponse, ResponseError, post, web};
use futures_util::StreamExt;
use serde::Serialize;

use super::{ErrorResponseWithMessage, ServerSettings, bad_request, client_info, resolve_user_id};
use crate::audit::{AuditLog, AuditStatus, FileInfo};
use crate::path_guard::{DEFAULT_FILENAME, validate_component};
use crate::storage::{ANONYMOUS_USER, SessionStorage};

const MAX_TEXT_FIELD_BYTES: usize = 1024;

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    pub file_id: String,
    pub filename: String,
}

#[derive(Serialize, Debug)]
pub struct UploadResponse {
    pub message: &'static str,
    pub session_id: String,
    pub files: Vec<UploadedFile>,
}

struct ReceivedFile {
    filename: String,
    mime_type: Option<String>,
    content: Vec<u8>,
}

enum ReadError {
    TooLarge,
    Malformed(String),
}

async fn read_field(field: &mut Field, limit: usize) -> Result<Vec<u8>, ReadError> {
    let mut content = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk.map_err(|e| ReadError::Malformed(e.to_string()))?;
        if content.len() + chunk.len() > limit {
            return Err(ReadError::TooLarge);
        }
        content.extend_from_slice(&chunk);
    }
    Ok(content)
}

/// Reads the `file` part and the optional `entity_id` text part.
async fn read_form(
    payload: &mut Multipart,
    max_file_bytes: usize,
) -> Result<(Option<ReceivedFile>, Option<String>), ReadError> {
    let mut file = None;
    let mut entity_id = None;

    while let Some(field) = payload.next().await {
        let mut field = field.map_err(|e| ReadError::Malformed(e.to_string()))?;
        let name = field.name().map(str::to_string);

        match name.as_deref() {
            Some("file") if file.is_none() => {
                let filename = field
                    .content_disposition()
                    .and_then(|cd| cd.get_filename())
                    .unwrap_or(DEFAULT_FILENAME)
                    .to_string();
                let mime_type = field.content_type().map(|m| m.to_string());
                let content = read_field(&mut field, max_file_bytes).await?;
                file = Some(ReceivedFile {
                    filename,
                    mime_type,
                    content,
                });
            }
            Some("entity_id") => {
                let raw = read_field(&mut field, MAX_TEXT_FIELD_BYTES).await?;
                let value = String::from_utf8_lossy(&raw).trim().to_string();
                entity_id = Some(value).filter(|v| !v.is_empty());
            }
            _ => {
                read_field(&mut field, max_file_bytes).await?;
            }
        }
    }

    Ok((file, entity_id))
}

#[post("/upload")]
pub async fn upload_handler(
    req: HttpRequest,
    mut payload: Multipart,
    storage: web::Data<SessionStorage>,
    audit: web::Data<AuditLog>,
    settings: web::Data<ServerSettings>,
) -> HttpResponse {
    let client = client_info(&req);

    let (file, entity_id) = match read_form(&mut payload, settings.max_upload_bytes).await {
        Ok(form) => form,
        Err(ReadError::TooLarge) => {
            log::warn!("Upload rejected: exceeds {} bytes", settings.max_upload_bytes);
            audit.record_upload(
                &client,
                ANONYMOUS_USER,
                "",
                FileInfo::default(),
                AuditStatus::Error,
                Some("File too large".to_string()),
            );
            return HttpResponse::PayloadTooLarge().json(ErrorResponseWithMessage {
                reason: "ERR_INVALID_ARGUMENT",
                code: 1,
                message: format!("File exceeds {} bytes", settings.max_upload_bytes),
            });
        }
        Err(ReadError::Malformed(e)) => {
            log::warn!("Malformed upload: {e}");
            audit.record_upload(
                &client,
                ANONYMOUS_USER,
                "",
                FileInfo::default(),
                AuditStatus::Error,
                Some("Malformed multipart body".to_string()),
            );
            return bad_request("Malformed multipart body");
        }
    };

    let Some(file) = file else {
        audit.record_upload(
            &client,
            ANONYMOUS_USER,
            "",
            FileInfo::default(),
            AuditStatus::Error,
            Some("No file provided".to_string()),
        );
        return bad_request("No file provided");
    };

    let session_id = entity_id.unwrap_or_else(crate::generate_id);
    let size = file.content.len() as u64;
    log::info!(
        "Upload request: {} ({size} bytes) from {}",
        file.filename,
        client.ip.as_deref().unwrap_or("unknown")
    );

    // Failures after the user is known are audited under that user.
    let mut audit_user = ANONYMOUS_USER.to_string();
    let outcome = async {
        validate_component(&session_id)?;
        let user_id = resolve_user_id(&req, &storage, Some(&session_id)).await?;
        audit_user.clone_from(&user_id);
        storage
            .save_upload(&user_id, &session_id, &file.content, &file.filename)
            .await
            .map(|stored| (user_id, stored))
    }
    .await;

    match outcome {
        Ok((user_id, stored)) => {
            audit.record_upload(
                &client,
                &user_id,
                &session_id,
                FileInfo {
                    file_id: stored.file_id.clone(),
                    filename: stored.filename.clone(),
                    size,
                    mime_type: file.mime_type,
                },
                AuditStatus::Success,
                None,
            );
            log::info!(
                "Upload successful: user {user_id}, session {session_id}, file {}",
                stored.file_id
            );

            HttpResponse::Ok().json(UploadResponse {
                message: "success",
                session_id,
                files: vec![UploadedFile {
                    file_id: stored.file_id,
                    filename: stored.filename,
                }],
            })
        }
        Err(e) => {
            log::error!("Upload error in session {session_id}: {e}");
            audit.record_upload(
                &client,
                &audit_user,
                &session_id,
                FileInfo {
                    filename: file.filename,
                    size,
                    mime_type: file.mime_type,
                    ..Default::default()
                },
                AuditStatus::Error,
                Some(e.to_string()),
            );
            e.error_response()
        }
    }
}
