use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, middleware, web};

use crate::audit::AuditLog;
use crate::config::Config;
use crate::executor::Executor;
use crate::pdf::PdfExtractor;
use crate::queue::ExecutionQueue;
use crate::routes::{
    ServerSettings, download_handler, exec_handler, extract_pdf_handler, files_handler,
    health_handler, json_error_handler, query_error_handler, queue_status_handler,
    require_api_key, upload_handler,
};
use crate::sandbox::SandboxRunner;
use crate::storage::SessionStorage;

/// Body limit for JSON and raw-body endpoints; uploads are bounded separately.
const MAX_JSON_BYTES: usize = 1024 * 1024;

/// Services shared by every worker of the HTTP server.
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<SessionStorage>,
    pub executor: Arc<Executor>,
    pub queue: Arc<ExecutionQueue>,
    pub pdf: Arc<PdfExtractor>,
    pub audit: Arc<AuditLog>,
    pub settings: ServerSettings,
}

impl AppState {
    pub fn new(
        config: &Config,
        storage: Arc<SessionStorage>,
        runner: Arc<dyn SandboxRunner>,
        queue: Arc<ExecutionQueue>,
        audit: Arc<AuditLog>,
    ) -> Self {
        let executor = Arc::new(Executor::new(
            storage.clone(),
            runner,
            config.executor.clone(),
        ));
        let pdf = Arc::new(PdfExtractor::new(
            executor.clone(),
            queue.clone(),
            config.pdf.clone(),
        ));
        if config.server.api_key.is_empty() {
            log::warn!("No API key configured, authentication is disabled");
        }

        Self {
            storage,
            executor,
            queue,
            pdf,
            audit,
            settings: ServerSettings {
                api_key: config.server.api_key.clone(),
                max_upload_bytes: config.server.max_upload_bytes,
            },
        }
    }
}

/// Registers shared state and all routes. `/health` stays outside the
/// API-key check.
pub fn configure_app(state: AppState) -> impl Fn(&mut web::ServiceConfig) + Clone + Send + 'static {
    move |cfg: &mut web::ServiceConfig| {
        cfg.app_data(web::Data::from(state.storage.clone()))
            .app_data(web::Data::from(state.executor.clone()))
            .app_data(web::Data::from(state.queue.clone()))
            .app_data(web::Data::from(state.pdf.clone()))
            .app_data(web::Data::from(state.audit.clone()))
            .app_data(web::Data::new(state.settings.clone()))
            .app_data(
                web::JsonConfig::default()
                    .limit(MAX_JSON_BYTES)
                    .error_handler(json_error_handler),
            )
            .app_data(web::PayloadConfig::new(MAX_JSON_BYTES))
            .app_data(web::QueryConfig::default().error_handler(query_error_handler))
            .service(health_handler)
            .service(
                web::scope("")
                    .wrap(middleware::from_fn(require_api_key))
                    .service(upload_handler)
                    .service(exec_handler)
                    .service(extract_pdf_handler)
                    .service(download_handler)
                    .service(files_handler)
                    .service(queue_status_handler),
            );
    }
}

pub fn build_server(config: &Config, state: AppState) -> std::io::Result<Server> {
    let configure = configure_app(state);

    let server = HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .configure(&configure)
    })
    .bind((config.server.bind_address.as_str(), config.server.bind_port))?
    .run();

    log::info!(
        "Listening on {}:{}",
        config.server.bind_address,
        config.server.bind_port
    );
    Ok(server)
}
