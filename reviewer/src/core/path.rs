//! Lexical resolution of model-supplied paths against the source root.
//!
//! Paths are normalized without touching the filesystem. Anything that would
//! leave the root, or that names version-control or tool metadata, is
//! rejected rather than clamped.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("empty path")]
    Empty,
    #[error("path '{0}' escapes the source root")]
    Escapes(String),
    #[error("path '{0}' is inside protected directory '{1}'")]
    Forbidden(String, String),
}

/// Directories at the top of the root that directives may never touch.
pub const PROTECTED_DIRS: [&str; 2] = [".git", ".reviewer"];

/// Resolve `arg` to a root-relative path using `/` separators.
///
/// Absolute arguments are accepted only when they lie under `root`.
/// The empty relative path (`""`) denotes the root itself.
pub fn resolve_relative(root: &Path, arg: &str) -> Result<String, PathError> {
    let trimmed = arg.trim();
    if trimmed.is_empty() {
        return Err(PathError::Empty);
    }
    let candidate = Path::new(trimmed);
    let relative: &Path = if candidate.is_absolute() {
        candidate
            .strip_prefix(root)
            .map_err(|_| PathError::Escapes(trimmed.to_string()))?
    } else {
        candidate
    };

    let mut parts: Vec<String> = Vec::new();
    for component in relative.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(PathError::Escapes(trimmed.to_string()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(PathError::Escapes(trimmed.to_string()));
            }
        }
    }

    if let Some(first) = parts.first()
        && let Some(protected) = PROTECTED_DIRS.iter().find(|p| **p == first.as_str())
    {
        return Err(PathError::Forbidden(
            trimmed.to_string(),
            (*protected).to_string(),
        ));
    }
    Ok(parts.join("/"))
}

/// Resolve `arg` to an absolute path under `root`.
pub fn resolve(root: &Path, arg: &str) -> Result<(String, PathBuf), PathError> {
    let relative = resolve_relative(root, arg)?;
    let absolute = if relative.is_empty() {
        root.to_path_buf()
    } else {
        root.join(&relative)
    };
    Ok((relative, absolute))
}
