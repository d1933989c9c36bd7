use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::write_restricted;
use crate::error::Result;

/// Per-session map of file id to original filename, kept in `uploads/`.
pub const MANIFEST_FILE: &str = ".manifest.json";
/// Root-level map of session id to user id.
pub const SESSION_INDEX_FILE: &str = ".sessions.json";

const LOCK_TABLE_SOFT_LIMIT: usize = 1024;

pub type JsonMap = BTreeMap<String, String>;

/// Small JSON string maps stored on disk, updated with an atomic
/// read-modify-write.
///
/// Writers to the same file are serialized through a per-path async lock and
/// every write goes to a temporary file that is renamed over the original, so
/// concurrent uploads into one session never lose manifest entries and readers
/// never observe a half-written file.
#[derive(Default)]
pub struct JsonIndex {
    locks: Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
}

impl JsonIndex {
    pub fn new() -> Self {
        Self::default()
    }

    async fn lock(&self, path: &Path) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            if locks.len() > LOCK_TABLE_SOFT_LIMIT {
                locks.retain(|_, l| Arc::strong_count(l) > 1);
            }
            locks.entry(path.to_path_buf()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Reads a map; a missing or unreadable file yields an empty map.
    pub async fn load(path: &Path) -> JsonMap {
        match tokio::fs::read_to_string(path).await {
            Ok(data) => serde_json::from_str(&data).unwrap_or_else(|e| {
                log::warn!("Ignoring corrupt index {}: {e}", path.display());
                JsonMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => JsonMap::new(),
            Err(e) => {
                log::warn!("Unable to read index {}: {e}", path.display());
                JsonMap::new()
            }
        }
    }

    /// Applies `f` to the current contents and persists the result.
    pub async fn update<F>(&self, path: &Path, f: F) -> Result<()>
    where
        F: FnOnce(&mut JsonMap),
    {
        let _guard = self.lock(path).await;

        let mut map = Self::load(path).await;
        f(&mut map);

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!("{file_name}.{}.tmp", crate::generate_id()));
        write_restricted(&tmp, serde_json::to_string(&map)?.as_bytes()).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}
