pub mod audit;
pub mod config;
pub mod database;
pub mod error;
pub mod executor;
pub mod path_guard;
pub mod pdf;
pub mod queue;
pub mod routes;
pub mod sandbox;
pub mod storage;
pub mod web_server;
pub mod worker;

pub fn create_timestamp() -> String {
    use chrono::{SecondsFormat, Utc};
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Opaque identifier used for sessions and stored files.
///
/// 21 lowercase hex characters, the id shape the chat client already accepts
/// in download URLs.
pub fn generate_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(21);
    id
}
