use actix_web::{HttpRequest, HttpResponse, get, web};
use serde::Serialize;

use super::client_info;
use crate::audit::AuditLog;
use crate::executor::Executor;
use crate::queue::{ExecutionQueue, QueueStats};

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    executor: &'static str,
    runtime: &'static str,
    queue: QueueStats,
}

#[derive(Serialize)]
struct QueueStatusResponse {
    status: &'static str,
    queue: QueueStats,
}

/// Liveness probe. Served without authentication.
#[get("/health")]
pub async fn health_handler(
    req: HttpRequest,
    executor: web::Data<Executor>,
    queue: web::Data<ExecutionQueue>,
    audit: web::Data<AuditLog>,
) -> HttpResponse {
    audit.record_health_check(&client_info(&req));
    HttpResponse::Ok().json(HealthResponse {
        status: "ok",
        executor: "self-hosted",
        runtime: executor.runtime_name(),
        queue: queue.stats(),
    })
}

#[get("/queue-status")]
pub async fn queue_status_handler(queue: web::Data<ExecutionQueue>) -> HttpResponse {
    HttpResponse::Ok().json(QueueStatusResponse {
        status: "ok",
        queue: queue.stats(),
    })
}
