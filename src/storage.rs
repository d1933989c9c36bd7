mod manifest;

pub use manifest::{JsonIndex, JsonMap, MANIFEST_FILE, SESSION_INDEX_FILE};

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::error::{Result, SandboxError};
use crate::path_guard::{
    extension_of, resolve_within, resolve_within_real, sanitize_filename, validate_component,
};

pub const ANONYMOUS_USER: &str = "anonymous";
pub const EXEC_DIR_PREFIX: &str = "exec_";

pub(crate) const DIR_PERMISSIONS: u32 = 0o700;
const FILE_PERMISSIONS: u32 = 0o640;

/// Directories owned by one `(user, session)` pair.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub root: PathBuf,
    pub uploads: PathBuf,
    pub workspace: PathBuf,
}

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub file_id: String,
    pub filename: String,
    pub filepath: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// Location relative to the session, e.g. `uploads/{fileId}.csv`
    pub name: String,
    pub file_id: String,
    pub last_modified: String,
    pub original_filename: String,
}

/// On-disk layout `{root}/{userId}/{sessionId}/{uploads,workspace}`.
///
/// Every path handed to the filesystem is produced by the path guard first;
/// identifiers are validated as single components before they are joined.
pub struct SessionStorage {
    root: PathBuf,
    index: JsonIndex,
}

pub(crate) async fn write_restricted(path: &Path, content: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(FILE_PERMISSIONS)
        .open(path)
        .await?;
    file.write_all(content).await?;
    file.flush().await
}

pub(crate) async fn create_private_dir(path: &Path) -> std::io::Result<()> {
    tokio::fs::DirBuilder::new()
        .recursive(true)
        .mode(DIR_PERMISSIONS)
        .create(path)
        .await
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// `{fileId}` or `{fileId}.{ext}`
fn matches_file_id(name: &str, file_id: &str) -> bool {
    name.strip_prefix(file_id)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
}

fn file_stem(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}

impl SessionStorage {
    /// Creates the storage root if needed and pins it to its canonical path.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        let root = std::fs::canonicalize(root)?;
        log::info!("Session storage rooted at {}", root.display());

        Ok(Self {
            root,
            index: JsonIndex::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_paths(&self, user_id: &str, session_id: &str) -> Result<SessionPaths> {
        let user_id = validate_component(user_id)?;
        let session_id = validate_component(session_id)?;
        let root = resolve_within(&self.root, Path::new(user_id).join(session_id))?;

        Ok(SessionPaths {
            uploads: resolve_within(&self.root, root.join("uploads"))?,
            workspace: resolve_within(&self.root, root.join("workspace"))?,
            root,
        })
    }

    /// Idempotently creates `uploads/` and `workspace/` (mode 0700).
    pub async fn ensure_session_dirs(&self, user_id: &str, session_id: &str) -> Result<SessionPaths> {
        let paths = self.session_paths(user_id, session_id)?;
        create_private_dir(&paths.uploads).await?;
        create_private_dir(&paths.workspace).await?;
        Ok(paths)
    }

    /// Stores an upload as `uploads/{fileId}{ext}` and records its original
    /// name in the session manifest and the owner in the session index.
    pub async fn save_upload(
        &self,
        user_id: &str,
        session_id: &str,
        content: &[u8],
        original_filename: &str,
    ) -> Result<StoredFile> {
        let safe_original = sanitize_filename(original_filename)?;
        let paths = self.ensure_session_dirs(user_id, session_id).await?;

        let file_id = crate::generate_id();
        let disk_name = format!("{file_id}{}", extension_of(&safe_original));
        let filepath = resolve_within(&self.root, paths.uploads.join(&disk_name))?;

        write_restricted(&filepath, content).await?;

        self.record_filename(&paths, &file_id, &safe_original).await?;
        self.index
            .update(&self.root.join(SESSION_INDEX_FILE), |index| {
                index
                    .entry(session_id.to_string())
                    .or_insert_with(|| user_id.to_string());
            })
            .await?;

        log::debug!("Stored upload {file_id} ({} bytes) for session {session_id}", content.len());
        Ok(StoredFile {
            file_id,
            filename: safe_original,
            filepath,
        })
    }

    /// Adds `file_id -> filename` to the session manifest.
    pub async fn record_filename(&self, paths: &SessionPaths, file_id: &str, filename: &str) -> Result<()> {
        let manifest_path = resolve_within(&self.root, paths.uploads.join(MANIFEST_FILE))?;
        create_private_dir(&paths.uploads).await?;
        self.index
            .update(&manifest_path, |manifest| {
                manifest.insert(file_id.to_string(), filename.to_string());
            })
            .await
    }

    pub async fn load_manifest(&self, user_id: &str, session_id: &str) -> Result<JsonMap> {
        let paths = self.session_paths(user_id, session_id)?;
        Ok(JsonIndex::load(&paths.uploads.join(MANIFEST_FILE)).await)
    }

    pub async fn original_filename(
        &self,
        user_id: &str,
        session_id: &str,
        file_id: &str,
    ) -> Result<Option<String>> {
        Ok(self.load_manifest(user_id, session_id).await?.remove(file_id))
    }

    /// Owner recorded for `session_id` by the first upload into it.
    pub async fn load_session_user_id(&self, session_id: &str) -> Option<String> {
        JsonIndex::load(&self.root.join(SESSION_INDEX_FILE))
            .await
            .remove(session_id)
    }

    /// Finds an upload by id in `uploads/` only, as execution staging needs.
    pub async fn find_upload(&self, paths: &SessionPaths, file_id: &str) -> Result<Option<PathBuf>> {
        let file_id = validate_component(file_id)?;
        self.find_in_dir(&paths.uploads, file_id, false).await
    }

    /// Locates a stored file by id, searching `uploads/`, then `workspace/`
    /// and its execution subdirectories.
    pub async fn get_file_path(&self, user_id: &str, session_id: &str, file_id: &str) -> Result<PathBuf> {
        let file_id = validate_component(file_id)?;
        let paths = self.session_paths(user_id, session_id)?;

        if let Some(found) = self.find_in_dir(&paths.uploads, file_id, true).await? {
            return Ok(found);
        }
        if let Some(found) = self.find_in_dir(&paths.workspace, file_id, true).await? {
            return Ok(found);
        }
        Err(SandboxError::FileNotFound(file_id.to_string()))
    }

    async fn find_in_dir(&self, dir: &Path, file_id: &str, descend: bool) -> Result<Option<PathBuf>> {
        let mut pending = vec![dir.to_path_buf()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let mut subdirs = Vec::new();

            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let file_type = entry.file_type().await?;

                if file_type.is_file() && !is_hidden(&name) && matches_file_id(&name, file_id) {
                    let real = resolve_within_real(&self.root, entry.path()).await?;
                    return Ok(Some(real));
                }
                if descend && file_type.is_dir() && name.starts_with(EXEC_DIR_PREFIX) {
                    subdirs.push(entry.path());
                }
            }
            pending.extend(subdirs.into_iter().rev());
        }
        Ok(None)
    }

    /// Lists both session directories, annotating entries with the original
    /// filename from the manifest when one is recorded.
    pub async fn list_session_files(&self, user_id: &str, session_id: &str) -> Result<Vec<FileEntry>> {
        let paths = self.session_paths(user_id, session_id)?;
        let manifest = JsonIndex::load(&paths.uploads.join(MANIFEST_FILE)).await;
        let mut files = Vec::new();

        for (dir, prefix) in [(&paths.uploads, "uploads/"), (&paths.workspace, "workspace/")] {
            let mut pending = vec![(dir.clone(), prefix.to_string())];

            while let Some((dir, prefix)) = pending.pop() {
                let dir = resolve_within(&self.root, &dir)?;
                let mut entries = match tokio::fs::read_dir(&dir).await {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                };

                while let Some(entry) = entries.next_entry().await? {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let file_type = entry.file_type().await?;

                    if file_type.is_dir() && name.starts_with(EXEC_DIR_PREFIX) {
                        pending.push((entry.path(), format!("{prefix}{name}/")));
                    } else if file_type.is_file() && !is_hidden(&name) {
                        let modified: DateTime<Utc> = entry.metadata().await?.modified()?.into();
                        let file_id = file_stem(&name);
                        let original_filename =
                            manifest.get(&file_id).cloned().unwrap_or_else(|| name.clone());
                        files.push(FileEntry {
                            name: format!("{prefix}{name}"),
                            file_id,
                            last_modified: modified.to_rfc3339_opts(SecondsFormat::Millis, true),
                            original_filename,
                        });
                    }
                }
            }
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }
}
