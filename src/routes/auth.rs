use actix_web::body::MessageBody;
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::middleware::Next;
use actix_web::{HttpResponse, web};

use super::{ErrorResponseWithMessage, ServerSettings, client_info};
use crate::audit::AuditLog;

pub const API_KEY_HEADER: &str = "x-api-key";

const AUTH_FAILURE_MESSAGE: &str = "Invalid or missing API key";

/// Compares without short-circuiting on the first differing byte.
fn keys_match(provided: &[u8], expected: &[u8]) -> bool {
    provided.len() == expected.len()
        && provided
            .iter()
            .zip(expected)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

/// Rejects requests whose `x-api-key` does not match the configured key.
///
/// With no key configured every request passes. Each rejection is audited as
/// an `auth_failure` before the 401 goes out.
pub async fn require_api_key(
    req: ServiceRequest,
    next: Next<impl MessageBody + 'static>,
) -> Result<ServiceResponse<impl MessageBody>, actix_web::Error> {
    let expected = req
        .app_data::<web::Data<ServerSettings>>()
        .map(|settings| settings.api_key.clone())
        .unwrap_or_default();

    let provided = req
        .headers()
        .get(API_KEY_HEADER)
        .map(|v| v.as_bytes().to_vec())
        .unwrap_or_default();

    if expected.is_empty() || keys_match(&provided, expected.as_bytes()) {
        return next.call(req).await.map(ServiceResponse::map_into_left_body);
    }

    let client = client_info(req.request());
    log::warn!(
        "Rejected {} {} from {}: {AUTH_FAILURE_MESSAGE}",
        req.method(),
        req.path(),
        client.ip.as_deref().unwrap_or("unknown")
    );
    if let Some(audit) = req.app_data::<web::Data<AuditLog>>() {
        audit.record_auth_failure(&client, AUTH_FAILURE_MESSAGE);
    }

    let response = HttpResponse::Unauthorized().json(ErrorResponseWithMessage {
        reason: "ERR_UNAUTHORIZED",
        code: 7,
        message: AUTH_FAILURE_MESSAGE.to_string(),
    });
    Ok(req.into_response(response).map_into_right_body())
}
