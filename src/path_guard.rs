//! Confinement checks for every path derived from user input.
//!
//! Two layers: a lexical check (`resolve_within`) that needs no filesystem
//! access, and a real-path check (`resolve_within_real`) that follows
//! symlinks. Filenames and identifiers are validated separately and rejected
//! outright when they try to carry directory structure.

use std::path::{Component, Path, PathBuf};

use crate::error::{Result, SandboxError};

/// Fallback name for uploads that arrive without one.
pub const DEFAULT_FILENAME: &str = "file";

/// Collapses `.` and `..` components without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

fn absolute_base(base: &Path) -> Result<PathBuf> {
    Ok(normalize_lexically(&std::path::absolute(base)?))
}

/// Resolves `target` against `base` and fails unless the result is `base`
/// itself or lies underneath it.
pub fn resolve_within(base: &Path, target: impl AsRef<Path>) -> Result<PathBuf> {
    let target = target.as_ref();
    let base = absolute_base(base)?;
    let resolved = normalize_lexically(&base.join(target));

    if resolved != base && !resolved.starts_with(&base) {
        return Err(SandboxError::PathTraversal(target.display().to_string()));
    }
    Ok(resolved)
}

/// Like [`resolve_within`], then follows symlinks and checks the real path
/// again. A target that does not exist yet resolves to its lexical path.
pub async fn resolve_within_real(base: &Path, target: impl AsRef<Path>) -> Result<PathBuf> {
    let target = target.as_ref();
    let resolved = resolve_within(base, target)?;

    let real = match tokio::fs::canonicalize(&resolved).await {
        Ok(real) => real,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(resolved),
        Err(e) => return Err(e.into()),
    };
    let real_base = tokio::fs::canonicalize(base).await?;

    if real != real_base && !real.starts_with(&real_base) {
        return Err(SandboxError::SymlinkEscape(target.display().to_string()));
    }
    Ok(real)
}

fn carries_structure(name: &str) -> bool {
    name.contains("..")
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
        || Path::new(name).is_absolute()
}

/// Validates a user-supplied filename destined for disk.
///
/// Anything that could smuggle directory structure is rejected rather than
/// stripped. An empty name becomes [`DEFAULT_FILENAME`].
pub fn sanitize_filename(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Ok(DEFAULT_FILENAME.to_string());
    }
    if carries_structure(name) || name == "." {
        return Err(SandboxError::InvalidFilename(name.to_string()));
    }
    Ok(name.to_string())
}

/// Validates an identifier (user, session, file) that becomes one path
/// component. Hidden names are refused so ids never alias index files.
pub fn validate_component(value: &str) -> Result<&str> {
    if value.is_empty() || value.starts_with('.') || carries_structure(value) {
        return Err(SandboxError::PathTraversal(value.to_string()));
    }
    Ok(value)
}

/// Extension of `name` including the leading dot, or an empty string.
pub fn extension_of(name: &str) -> String {
    Path::new(name)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default()
}
