mod auth;
mod download;
mod exec;
mod files;
mod pdf;
mod status;
mod upload;

pub use auth::{API_KEY_HEADER, require_api_key};
pub use download::download_handler;
pub use exec::{ExecRequest, exec_handler};
pub use files::{FilesQuery, files_handler};
pub use pdf::{ExtractPdfRequest, extract_pdf_handler};
pub use status::{health_handler, queue_status_handler};
pub use upload::upload_handler;

use actix_web::error::{InternalError, JsonPayloadError, QueryPayloadError};
use actix_web::{HttpRequest, HttpResponse};
use serde::Serialize;

use crate::audit::ClientInfo;
use crate::error::Result;
use crate::path_guard::validate_component;
use crate::storage::{ANONYMOUS_USER, SessionStorage};

/// Header carrying the caller's user id.
pub const USER_ID_HEADER: &str = "user-id";

#[derive(Serialize)]
pub struct ErrorResponse {
    pub reason: &'static str,
    pub code: u32,
}

#[derive(Serialize)]
pub struct ErrorResponseWithMessage {
    pub reason: &'static str,
    pub code: u32,
    pub message: String,
}

/// Listen settings shared with handlers and middleware.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
    /// Empty disables authentication
    pub api_key: String,
    pub max_upload_bytes: usize,
}

pub(crate) fn bad_request(message: impl Into<String>) -> HttpResponse {
    HttpResponse::BadRequest().json(ErrorResponseWithMessage {
        reason: "ERR_INVALID_ARGUMENT",
        code: 1,
        message: message.into(),
    })
}

pub fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = bad_request(format!("Invalid JSON body: {err}"));
    InternalError::from_response(err, response).into()
}

pub fn query_error_handler(err: QueryPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(ErrorResponse {
        reason: "ERR_INVALID_ARGUMENT",
        code: 1,
    });
    InternalError::from_response(err, response).into()
}

/// Peer address first; forwarding headers only when the socket is unknown.
pub fn client_info(req: &HttpRequest) -> ClientInfo {
    let ip = req.peer_addr().map(|addr| addr.ip().to_string()).or_else(|| {
        req.connection_info()
            .realip_remote_addr()
            .map(str::to_string)
    });
    let user_agent = req
        .headers()
        .get(actix_web::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    ClientInfo { ip, user_agent }
}

/// Resolves the acting user: the `user-id` header, else the recorded owner of
/// `session_id`, else the anonymous user.
pub async fn resolve_user_id(
    req: &HttpRequest,
    storage: &SessionStorage,
    session_id: Option<&str>,
) -> Result<String> {
    if let Some(user_id) = req
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return Ok(validate_component(user_id)?.to_string());
    }

    if let Some(session_id) = session_id
        && let Some(owner) = storage.load_session_user_id(session_id).await
    {
        return Ok(owner);
    }

    Ok(ANONYMOUS_USER.to_string())
}
