//! In-memory state of one review session.

use chrono::{DateTime, Utc};

/// Mutable state for one loop run.
///
/// `pending_changes` is true whenever `changed_files` is non-empty and no
/// successful build has committed them; both are cleared together by
/// [`ReviewSession::mark_committed`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewSession {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    pub current_directory: Option<String>,
    pub current_file: Option<String>,
    pub chunk_total: usize,
    pub chunk_index: usize,
    pub files_in_current_directory: Vec<String>,
    /// Insertion ordered, deduplicated by path.
    pub changed_files: Vec<String>,
    pub pending_changes: bool,
    pub last_build_failed: bool,
    pub directories_completed: u32,
    /// Directories committed this session, in completion order.
    pub completed_directories: Vec<String>,
    pub build_failures: u32,
    /// Build failures since the last successful build.
    pub failures_since_success: u32,
    pub last_diff: Option<String>,
}

impl ReviewSession {
    pub fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            session_id: format!("review-{}", start_time.format("%Y%m%d-%H%M%S")),
            start_time,
            current_directory: None,
            current_file: None,
            chunk_total: 0,
            chunk_index: 0,
            files_in_current_directory: Vec::new(),
            changed_files: Vec::new(),
            pending_changes: false,
            last_build_failed: false,
            directories_completed: 0,
            completed_directories: Vec::new(),
            build_failures: 0,
            failures_since_success: 0,
            last_diff: None,
        }
    }

    /// Record a successful edit of `path`.
    pub fn record_change(&mut self, path: &str, diff: String) {
        if !self.changed_files.iter().any(|p| p == path) {
            self.changed_files.push(path.to_string());
        }
        self.pending_changes = true;
        self.last_diff = Some(diff);
    }

    /// Switch scope to `directory`, forgetting per-directory state.
    pub fn enter_scope(&mut self, directory: &str, files: Vec<String>) {
        self.current_directory = Some(directory.to_string());
        self.files_in_current_directory = files;
        self.clear_file();
    }

    pub fn clear_file(&mut self) {
        self.current_file = None;
        self.chunk_total = 0;
        self.chunk_index = 0;
    }

    pub fn record_build_failure(&mut self) {
        self.build_failures += 1;
        self.failures_since_success += 1;
        self.last_build_failed = true;
    }

    /// Clear dirty state after a successful build and commit.
    pub fn mark_committed(&mut self) {
        self.changed_files.clear();
        self.pending_changes = false;
        self.last_build_failed = false;
        self.failures_since_success = 0;
        self.last_diff = None;
    }

    /// Count `directory` as completed and leave the scope.
    pub fn complete_directory(&mut self, directory: &str) {
        self.directories_completed += 1;
        self.completed_directories.push(directory.to_string());
        self.current_directory = None;
        self.files_in_current_directory.clear();
        self.clear_file();
    }
}
