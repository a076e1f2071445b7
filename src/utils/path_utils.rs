use crate::error::AppError;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Expands tilde (~) in a path string to the user's home directory.
pub fn expand_tilde_path_buf(path_str: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path_str).as_ref())
}

/// Resolves a working directory requested by the UI.
///
/// Relative paths are taken against `base`. The result must be an existing
/// directory; it is canonicalised with `dunce` so Windows paths stay free of
/// the `\\?\` prefix that breaks `cmd.exe`.
pub fn resolve_directory(requested: &str, base: &Path) -> Result<PathBuf, AppError> {
    let trimmed = requested.trim();
    if trimmed.is_empty() {
        return Err(AppError::InvalidPath("empty directory".to_string()));
    }
    let expanded = expand_tilde_path_buf(trimmed);
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    };

    let canonical = dunce::canonicalize(&absolute)
        .map_err(|e| AppError::InvalidPath(format!("{}: {}", absolute.display(), e)))?;
    if !canonical.is_dir() {
        return Err(AppError::InvalidPath(format!("Not a directory: {}", canonical.display())));
    }
    debug!(requested = %requested, resolved = %canonical.display(), "Resolved directory");
    Ok(canonical)
}

/// Like [`resolve_directory`] but falls back to `default` when nothing was requested.
pub fn resolve_optional_directory(requested: Option<&str>, default: &Path) -> Result<PathBuf, AppError> {
    match requested.map(str::trim).filter(|s| !s.is_empty()) {
        Some(dir) => resolve_directory(dir, default),
        None => Ok(default.to_path_buf()),
    }
}
