use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sqlx::sqlite::SqlitePool;
use tokio_util::sync::CancellationToken;

use sandbox_server::audit::AuditLog;
use sandbox_server::config::{AuditConfig, CliArgs};
use sandbox_server::database as db;
use sandbox_server::queue::ExecutionQueue;
use sandbox_server::sandbox::create_sandbox_runner;
use sandbox_server::storage::SessionStorage;
use sandbox_server::web_server::{AppState, build_server};
use sandbox_server::worker::spawn_workers;

/// Opens the audit database. Any failure leaves auditing in logs-only mode.
async fn open_audit_db(config: &AuditConfig, flush: bool) -> Option<SqlitePool> {
    if !config.enabled {
        return None;
    }

    let db_path = match &config.database_path {
        Some(path) => path.clone(),
        None => match db::get_db_path() {
            Ok(path) => path,
            Err(e) => {
                log::error!("Unable to locate audit database directory: {e}");
                return None;
            }
        },
    };

    if flush {
        db::remove_db(&db_path);
    }

    let pool = match db::init_db(&db_path).await {
        Ok(pool) => pool,
        Err(e) => {
            log::error!("Failed to initialize audit database: {e}");
            return None;
        }
    };

    if let Some(days) = config.ttl_days.filter(|d| *d > 0) {
        match db::prune_audit_events(&db::retention_cutoff(days), &pool).await {
            Ok(n) => log::info!("Pruned {n} audit records older than {days} days"),
            Err(e) => log::warn!("Failed to prune audit records: {e}"),
        }
    }
    Some(pool)
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let config = cli.to_config().context("Failed to load configuration")?;

    // SAFETY: geteuid has no preconditions and cannot fail
    if unsafe { libc::geteuid() } == 0 {
        log::warn!("Running as root; containers and stored files will be root-owned");
    }

    let storage = Arc::new(
        SessionStorage::new(&config.storage.root).with_context(|| {
            format!(
                "Failed to prepare storage root {}",
                config.storage.root.display()
            )
        })?,
    );
    let runner = create_sandbox_runner(&config.executor)?;

    let pool = open_audit_db(&config.audit, cli.flush_data).await;
    let db_connected = pool.is_some();
    let audit = Arc::new(AuditLog::new(pool.clone()));
    audit.set_db_connected(db_connected);

    let queue = Arc::new(ExecutionQueue::new(config.queue.max_concurrent));
    let shutdown_token = CancellationToken::new();

    // ======= PREPARATION END, EXECUTION START =======

    let mut workers = spawn_workers(queue.clone(), shutdown_token.clone());

    let state = AppState::new(&config, storage, runner.into(), queue, audit.clone());
    let server = build_server(&config, state).context("Failed to build server")?;

    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
        Some(res_worker) = workers.join_next() => {
            log::error!("A worker terminated unexpectedly: {:?}", res_worker);
        }
    }

    // 1. Stop accepting requests, let in-flight ones finish
    server_handle.stop(true).await;

    // 2. Stop workers; tasks already started run to completion
    shutdown_token.cancel();
    log::info!("Shutdown signal sent to workers, waiting for them to finish...");

    while let Some(res) = workers.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("Worker finished with error: {e:?}"),
            Err(e) if e.is_panic() => log::error!("Worker handle panicked: {e:?}"),
            Err(e) => log::error!("Worker handle finished with error: {e:?}"),
        }
    }

    // 3. Drain pending audit writes
    audit.flush().await;
    if let Some(pool) = pool {
        pool.close().await;
    }

    log::info!("Shutdown complete");
    Ok(())
}
