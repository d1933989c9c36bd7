use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite};

use crate::audit::AuditEvent;

const DATABASE_NAME: &str = "sandbox-audit.sqlite3";

/// Upper bound on rows returned by a single audit query.
pub const MAX_QUERY_LIMIT: u32 = 1000;

pub fn get_db_path() -> std::io::Result<PathBuf> {
    use directories::ProjectDirs;

    let proj_dirs = ProjectDirs::from("", "", "sandbox-server").ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "Unable to find user directory")
    })?;
    let data_dir = proj_dirs.data_local_dir();

    fs::create_dir_all(data_dir)?;

    Ok(data_dir.join(DATABASE_NAME))
}

pub async fn init_db(db_path: impl AsRef<Path>) -> sqlx::Result<SqlitePool> {
    let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display()); // rwc = read/write/create
    let db_pool = SqlitePoolOptions::new()
        .max_connections(2)
        .min_connections(0)
        .connect(&db_url)
        .await?;

    // PRAGMA statements cannot run inside a transaction
    for pragma_sql in &[
        "PRAGMA busy_timeout = 2000;",
        "PRAGMA journal_mode = WAL;",
        "PRAGMA synchronous = NORMAL;",
    ] {
        sqlx::query(pragma_sql).execute(&db_pool).await?;
    }

    let mut tx = db_pool.begin().await?;

    for sql in &[
        r"
        CREATE TABLE IF NOT EXISTS audit_logs (
            id            INTEGER  PRIMARY KEY AUTOINCREMENT,
            created_at    TEXT     NOT NULL,
            action        TEXT     NOT NULL,
            user_id       TEXT     NOT NULL,
            session_id    TEXT,
            status        TEXT     NOT NULL,
            ip            TEXT,
            user_agent    TEXT,
            error         TEXT,
            details       TEXT     NOT NULL DEFAULT 'null'
        );",
        "CREATE INDEX IF NOT EXISTS idx_audit_user ON audit_logs (user_id, created_at);",
        "CREATE INDEX IF NOT EXISTS idx_audit_session ON audit_logs (session_id, created_at);",
        "CREATE INDEX IF NOT EXISTS idx_audit_action ON audit_logs (action, created_at);",
        "CREATE INDEX IF NOT EXISTS idx_audit_status ON audit_logs (status, created_at);",
    ] {
        sqlx::query(sql).execute(tx.as_mut()).await?;
    }

    tx.commit().await?;

    log::info!("Initialized audit database at {}", db_path.as_ref().display());

    Ok(db_pool)
}

pub fn remove_db(db_path: impl AsRef<Path>) {
    // WAL and SHM files might not exist
    let wal_path = format!("{}-wal", db_path.as_ref().display());
    let shm_path = format!("{}-shm", db_path.as_ref().display());
    let _ = fs::remove_file(wal_path);
    let _ = fs::remove_file(shm_path);

    if let Err(e) = fs::remove_file(&db_path) {
        log::warn!(
            "Unable to remove database at {}: {e}",
            db_path.as_ref().display()
        );
    } else {
        log::info!("Removed database at {}", db_path.as_ref().display());
    }
}

/// Appends one event. Rows are never updated afterwards.
pub async fn insert_audit_event(event: &AuditEvent, pool: &SqlitePool) -> sqlx::Result<i64> {
    let details = event.details_json().to_string();

    let result = sqlx::query(
        r#"
        INSERT INTO audit_logs (created_at, action, user_id, session_id, status, ip, user_agent, error, details)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&event.timestamp)
    .bind(event.action().as_str())
    .bind(&event.user_id)
    .bind(&event.session_id)
    .bind(event.status.as_str())
    .bind(&event.ip)
    .bind(&event.user_agent)
    .bind(&event.error)
    .bind(details)
    .execute(pool)
    .await?;

    Ok(result.last_insert_rowid())
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct AuditQuery {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub action: Option<String>,
    pub status: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: i64,
    pub created_at: String,
    pub action: String,
    pub user_id: String,
    pub session_id: Option<String>,
    pub status: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub error: Option<String>,
    pub details: Value,
}

/// Filtered audit history, newest first.
pub async fn fetch_audit_events(
    query: &AuditQuery,
    pool: &SqlitePool,
) -> sqlx::Result<Vec<AuditRecord>> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT id, created_at, action, user_id, session_id, status, ip, user_agent, error, details \
         FROM audit_logs WHERE 1=1",
    );

    if let Some(ref user_id) = query.user_id {
        qb.push(" AND user_id = ").push_bind(user_id);
    }
    if let Some(ref session_id) = query.session_id {
        qb.push(" AND session_id = ").push_bind(session_id);
    }
    if let Some(ref action) = query.action {
        qb.push(" AND action = ").push_bind(action);
    }
    if let Some(ref status) = query.status {
        qb.push(" AND status = ").push_bind(status);
    }
    if let Some(ref from) = query.from {
        qb.push(" AND created_at >= ").push_bind(from);
    }
    if let Some(ref to) = query.to {
        qb.push(" AND created_at <= ").push_bind(to);
    }
    let limit = query.limit.unwrap_or(MAX_QUERY_LIMIT).min(MAX_QUERY_LIMIT);
    qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
        .push_bind(i64::from(limit));

    #[derive(sqlx::FromRow)]
    struct AuditRow {
        id: i64,
        created_at: String,
        action: String,
        user_id: String,
        session_id: Option<String>,
        status: String,
        ip: Option<String>,
        user_agent: Option<String>,
        error: Option<String>,
        details: String,
    }

    let rows: Vec<AuditRow> = qb.build_query_as().fetch_all(pool).await?;

    Ok(rows
        .into_iter()
        .map(|row| AuditRecord {
            details: serde_json::from_str(&row.details).unwrap_or(Value::String(row.details)),
            id: row.id,
            created_at: row.created_at,
            action: row.action,
            user_id: row.user_id,
            session_id: row.session_id,
            status: row.status,
            ip: row.ip,
            user_agent: row.user_agent,
            error: row.error,
        })
        .collect())
}

/// Deletes events created before `older_than` (RFC 3339). Returns the count.
pub async fn prune_audit_events(older_than: &str, pool: &SqlitePool) -> sqlx::Result<u64> {
    let result = sqlx::query("DELETE FROM audit_logs WHERE created_at < ?")
        .bind(older_than)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Cutoff timestamp for a retention of `ttl_days`.
pub fn retention_cutoff(ttl_days: u32) -> String {
    use chrono::{Duration, SecondsFormat, Utc};
    (Utc::now() - Duration::days(i64::from(ttl_days))).to_rfc3339_opts(SecondsFormat::Millis, true)
}
