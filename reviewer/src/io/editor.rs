//! Exact-match file edits with a diff for every change.
//!
//! An edit names an anchor: text that must occur exactly once in the file.
//! Zero or several matches leave the file untouched. Every successful write
//! returns a unified diff so the caller can show the model what it changed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use similar::TextDiff;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum EditError {
    #[error("anchor text not found in {path}")]
    NotFound { path: String },
    #[error("anchor text occurs {count} times in {path}; it must be unique")]
    Ambiguous { path: String, count: usize },
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Applies edits relative to a root and renders diffs with root-relative labels.
#[derive(Debug, Clone)]
pub struct FileEditor {
    root: PathBuf,
}

impl FileEditor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Replace the single occurrence of `old_text` with `new_text`.
    #[instrument(skip(self, old_text, new_text))]
    pub fn edit_file(&self, path: &str, old_text: &str, new_text: &str) -> Result<String, EditError> {
        let absolute = self.root.join(path);
        let original = fs::read_to_string(&absolute).map_err(|source| io_error(path, source))?;
        let count = count_occurrences(&original, old_text);
        match count {
            0 => {
                return Err(EditError::NotFound {
                    path: path.to_string(),
                });
            }
            1 => {}
            _ => {
                return Err(EditError::Ambiguous {
                    path: path.to_string(),
                    count,
                });
            }
        }
        let updated = original.replacen(old_text, new_text, 1);
        fs::write(&absolute, &updated).map_err(|source| io_error(path, source))?;
        debug!(bytes_before = original.len(), bytes_after = updated.len(), "edit applied");
        Ok(unified_diff(path, Some(&original), &updated))
    }

    /// Create or overwrite `path` with `content`, creating parent directories.
    #[instrument(skip(self, content))]
    pub fn write_file(&self, path: &str, content: &str) -> Result<String, EditError> {
        let absolute = self.root.join(path);
        let previous = match fs::read_to_string(&absolute) {
            Ok(text) => Some(text),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(source) => return Err(io_error(path, source)),
        };
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent).map_err(|source| io_error(path, source))?;
        }
        fs::write(&absolute, content).map_err(|source| io_error(path, source))?;
        debug!(created = previous.is_none(), bytes = content.len(), "file written");
        Ok(unified_diff(path, previous.as_deref(), content))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn io_error(path: &str, source: io::Error) -> EditError {
    EditError::Io {
        path: path.to_string(),
        source,
    }
}

/// Non-overlapping occurrence count, matching `str::replacen` semantics.
fn count_occurrences(haystack: &str, needle: &str) -> usize {
    if needle.is_empty() {
        return 0;
    }
    haystack.matches(needle).count()
}

/// Unified diff between `before` and `after`. A missing `before` renders as a new file.
pub fn unified_diff(path: &str, before: Option<&str>, after: &str) -> String {
    let old_label = match before {
        Some(_) => format!("a/{path}"),
        None => "/dev/null".to_string(),
    };
    let new_label = format!("b/{path}");
    let before = before.unwrap_or("");
    let diff = TextDiff::from_lines(before, after);
    let body = diff
        .unified_diff()
        .context_radius(3)
        .header(&old_label, &new_label)
        .to_string();
    if body.is_empty() {
        return format!("(no textual change to {path})\n");
    }
    body
}
