use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::sqlite::SqlitePool;
use tokio_util::task::TaskTracker;

/// Log target of the one-line JSON audit records.
pub const AUDIT_LOG_TARGET: &str = "audit";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Upload,
    Exec,
    Download,
    FilesList,
    AuthFailure,
    HealthCheck,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Exec => "exec",
            Self::Download => "download",
            Self::FilesList => "files_list",
            Self::AuthFailure => "auth_failure",
            Self::HealthCheck => "health_check",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Error,
    Denied,
}

impl AuditStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Denied => "denied",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub file_id: String,
    pub filename: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionInfo {
    pub lang: String,
    pub duration_ms: u64,
    pub exit_code: i32,
    pub memory_mb: u64,
    pub files_generated: usize,
    pub code_preview: String,
}

/// Action-specific payload. The variant determines the event's action.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "action", content = "details", rename_all = "snake_case")]
pub enum AuditDetails {
    Upload(FileInfo),
    Exec(ExecutionInfo),
    #[serde(rename_all = "camelCase")]
    Download { file_id: String },
    #[serde(rename_all = "camelCase")]
    FilesList { file_count: usize },
    AuthFailure,
    HealthCheck,
}

impl AuditDetails {
    pub fn action(&self) -> AuditAction {
        match self {
            Self::Upload(_) => AuditAction::Upload,
            Self::Exec(_) => AuditAction::Exec,
            Self::Download { .. } => AuditAction::Download,
            Self::FilesList { .. } => AuditAction::FilesList,
            Self::AuthFailure => AuditAction::AuthFailure,
            Self::HealthCheck => AuditAction::HealthCheck,
        }
    }
}

/// Where a request came from, as far as the transport can tell.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub timestamp: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub status: AuditStatus,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub details: AuditDetails,
    /// Free-form annotations outside the per-action schema
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl AuditEvent {
    pub fn new(
        details: AuditDetails,
        user_id: impl Into<String>,
        session_id: Option<String>,
        status: AuditStatus,
        client: &ClientInfo,
    ) -> Self {
        Self {
            timestamp: crate::create_timestamp(),
            user_id: user_id.into(),
            session_id: session_id.filter(|s| !s.is_empty()),
            status,
            ip: client.ip.clone(),
            user_agent: client.user_agent.clone(),
            error: None,
            details,
            extra: Map::new(),
        }
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }

    pub fn action(&self) -> AuditAction {
        self.details.action()
    }

    /// The `details` column: the action payload plus any extra annotations.
    pub fn details_json(&self) -> Value {
        let mut value = match serde_json::to_value(&self.details) {
            Ok(Value::Object(mut tagged)) => tagged.remove("details").unwrap_or(Value::Null),
            _ => Value::Null,
        };
        if !self.extra.is_empty() {
            if !value.is_object() {
                value = Value::Object(Map::new());
            }
            if let Value::Object(map) = &mut value {
                map.insert("extra".to_string(), Value::Object(self.extra.clone()));
            }
        }
        value
    }
}

/// Append-only audit trail.
///
/// Every event is written synchronously as one JSON log line. When the
/// database is connected the event is also persisted in the background;
/// persistence failures are logged and never reach the caller.
pub struct AuditLog {
    pool: Option<SqlitePool>,
    db_connected: AtomicBool,
    tracker: TaskTracker,
}

impl AuditLog {
    pub fn new(pool: Option<SqlitePool>) -> Self {
        Self {
            pool,
            db_connected: AtomicBool::new(false),
            tracker: TaskTracker::new(),
        }
    }

    /// A log-only audit trail.
    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn set_db_connected(&self, connected: bool) {
        let connected = connected && self.pool.is_some();
        self.db_connected.store(connected, Ordering::Release);
        if connected {
            log::info!("Audit logging to database enabled");
        } else {
            log::info!("Audit logging to database disabled (using logs only)");
        }
    }

    pub fn is_db_connected(&self) -> bool {
        self.db_connected.load(Ordering::Acquire)
    }

    pub fn record(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(line) => log::info!(target: AUDIT_LOG_TARGET, "{line}"),
            Err(e) => log::warn!(
                target: AUDIT_LOG_TARGET,
                "Unserializable audit event {}: {e}",
                event.action().as_str()
            ),
        }

        if !self.is_db_connected() {
            return;
        }
        let Some(pool) = self.pool.clone() else {
            return;
        };
        self.tracker.spawn(async move {
            if let Err(e) = crate::database::insert_audit_event(&event, &pool).await {
                log::error!(
                    "Failed to save audit log to database (action {}, user {}): {e}",
                    event.action().as_str(),
                    event.user_id
                );
            }
        });
    }

    pub fn record_upload(
        &self,
        client: &ClientInfo,
        user_id: &str,
        session_id: &str,
        file: FileInfo,
        status: AuditStatus,
        error: Option<String>,
    ) {
        self.record(
            AuditEvent::new(
                AuditDetails::Upload(file),
                user_id,
                Some(session_id.to_string()),
                status,
                client,
            )
            .with_error(error),
        );
    }

    pub fn record_execution(
        &self,
        client: &ClientInfo,
        user_id: &str,
        session_id: &str,
        execution: ExecutionInfo,
        status: AuditStatus,
        error: Option<String>,
    ) {
        self.record(
            AuditEvent::new(
                AuditDetails::Exec(execution),
                user_id,
                Some(session_id.to_string()),
                status,
                client,
            )
            .with_error(error),
        );
    }

    pub fn record_download(
        &self,
        client: &ClientInfo,
        user_id: &str,
        session_id: &str,
        file_id: &str,
        status: AuditStatus,
        error: Option<String>,
    ) {
        self.record(
            AuditEvent::new(
                AuditDetails::Download {
                    file_id: file_id.to_string(),
                },
                user_id,
                Some(session_id.to_string()),
                status,
                client,
            )
            .with_error(error),
        );
    }

    pub fn record_files_list(
        &self,
        client: &ClientInfo,
        user_id: &str,
        session_id: &str,
        file_count: usize,
        status: AuditStatus,
        error: Option<String>,
    ) {
        self.record(
            AuditEvent::new(
                AuditDetails::FilesList { file_count },
                user_id,
                Some(session_id.to_string()),
                status,
                client,
            )
            .with_error(error),
        );
    }

    pub fn record_auth_failure(&self, client: &ClientInfo, reason: &str) {
        self.record(
            AuditEvent::new(
                AuditDetails::AuthFailure,
                crate::storage::ANONYMOUS_USER,
                None,
                AuditStatus::Denied,
                client,
            )
            .with_error(Some(reason.to_string())),
        );
    }

    pub fn record_health_check(&self, client: &ClientInfo) {
        self.record(AuditEvent::new(
            AuditDetails::HealthCheck,
            crate::storage::ANONYMOUS_USER,
            None,
            AuditStatus::Success,
            client,
        ));
    }

    /// Waits for every pending database write.
    pub async fn flush(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

/// First 80 characters of submitted code on a single line.
pub fn code_preview(code: &str) -> String {
    code.chars()
        .take(80)
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::database::{AuditQuery, fetch_audit_events, init_db};

    fn client() -> ClientInfo {
        ClientInfo {
            ip: Some("10.0.0.1".to_string()),
            user_agent: Some("test-agent".to_string()),
        }
    }

    #[test]
    fn test_event_serializes_action_and_details() {
        let event = AuditEvent::new(
            AuditDetails::FilesList { file_count: 3 },
            "user1",
            Some("sess1".to_string()),
            AuditStatus::Success,
            &client(),
        );
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["action"], "files_list");
        assert_eq!(value["details"], json!({ "fileCount": 3 }));
        assert_eq!(value["userId"], "user1");
        assert_eq!(value["status"], "success");
        assert!(value.get("extra").is_none());
        assert_eq!(event.details_json(), json!({ "fileCount": 3 }));
    }

    #[test]
    fn test_extra_annotations_are_kept_in_details() {
        let mut event = AuditEvent::new(
            AuditDetails::AuthFailure,
            "anonymous",
            None,
            AuditStatus::Denied,
            &client(),
        );
        event.extra.insert("path".to_string(), json!("/exec"));

        assert_eq!(event.details_json(), json!({ "extra": { "path": "/exec" } }));
    }

    #[test]
    fn test_code_preview_is_single_line() {
        assert_eq!(code_preview("import os\nprint(1)"), "import os print(1)");
        assert_eq!(code_preview(&"x".repeat(200)).len(), 80);
    }

    #[tokio::test]
    async fn test_events_are_persisted_when_connected() {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_db(dir.path().join("audit.sqlite3")).await.unwrap();
        let audit = AuditLog::new(Some(pool.clone()));
        audit.set_db_connected(true);

        audit.record_download(&client(), "user1", "sess1", "abc", AuditStatus::Success, None);
        audit.record_auth_failure(&client(), "Invalid or missing API key");
        audit.flush().await;

        let records = fetch_audit_events(&AuditQuery::default(), &pool).await.unwrap();
        assert_eq!(records.len(), 2);
        let denied = records.iter().find(|r| r.action == "auth_failure").unwrap();
        assert_eq!(denied.status, "denied");
        assert_eq!(denied.user_id, "anonymous");
        assert_eq!(denied.error.as_deref(), Some("Invalid or missing API key"));
        assert_eq!(denied.ip.as_deref(), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn test_disconnected_log_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_db(dir.path().join("audit.sqlite3")).await.unwrap();
        let audit = AuditLog::new(Some(pool.clone()));
        audit.set_db_connected(false);

        audit.record_health_check(&client());
        audit.flush().await;

        let records = fetch_audit_events(&AuditQuery::default(), &pool).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_database_failure_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_db(dir.path().join("audit.sqlite3")).await.unwrap();
        let audit = AuditLog::new(Some(pool.clone()));
        audit.set_db_connected(true);
        pool.close().await;

        audit.record_upload(
            &client(),
            "user1",
            "sess1",
            FileInfo::default(),
            AuditStatus::Error,
            Some("No file provided".to_string()),
        );
        audit.flush().await;
        assert!(audit.is_db_connected());
    }

    #[test]
    fn test_disabled_log_cannot_be_connected() {
        let audit = AuditLog::disabled();
        audit.set_db_connected(true);
        assert!(!audit.is_db_connected());
    }
}
