//! Shared deterministic types for the review core.
//!
//! These types are the contracts between the loop and its collaborators
//! (build executor, chunker). They carry no behavior that touches the
//! filesystem or a subprocess.

use serde::{Deserialize, Serialize};

/// Severity of a compiler diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// A single diagnostic extracted from build output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredError {
    pub file_path: String,
    pub line_number: u32,
    pub column: Option<u32>,
    pub severity: Severity,
    pub message: String,
}

impl StructuredError {
    /// Render as `file:line[:col]: severity: message`.
    pub fn render(&self) -> String {
        let severity = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        match self.column {
            Some(col) => format!(
                "{}:{}:{}: {}: {}",
                self.file_path, self.line_number, col, severity, self.message
            ),
            None => format!(
                "{}:{}: {}: {}",
                self.file_path, self.line_number, severity, self.message
            ),
        }
    }
}

/// Outcome of one run of the external build.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildResult {
    pub success: bool,
    pub return_code: i32,
    pub duration_seconds: f64,
    pub errors: Vec<StructuredError>,
    pub warnings: Vec<StructuredError>,
    /// Tail of the combined build output, bounded by the executor.
    pub raw_output: String,
}

impl BuildResult {
    /// Human-readable report listing at most `max_errors` errors.
    pub fn report(&self, max_errors: usize) -> String {
        let mut buf = String::new();
        if self.success {
            buf.push_str(&format!(
                "Build succeeded in {:.1}s ({} warnings).\n",
                self.duration_seconds,
                self.warnings.len()
            ));
            return buf;
        }
        buf.push_str(&format!(
            "Build FAILED (exit code {}) after {:.1}s: {} errors, {} warnings.\n",
            self.return_code,
            self.duration_seconds,
            self.errors.len(),
            self.warnings.len()
        ));
        for err in self.errors.iter().take(max_errors) {
            buf.push_str("  ");
            buf.push_str(&err.render());
            buf.push('\n');
        }
        if self.errors.len() > max_errors {
            buf.push_str(&format!(
                "  ... {} more errors not shown\n",
                self.errors.len() - max_errors
            ));
        }
        if self.errors.is_empty() {
            buf.push_str("No structured errors were recognised; tail of build output:\n");
            buf.push_str(&tail_lines(&self.raw_output, 40));
            buf.push('\n');
        }
        buf
    }

    /// Distinct files named by errors, in first-seen order.
    pub fn error_files(&self) -> Vec<String> {
        let mut files: Vec<String> = Vec::new();
        for err in &self.errors {
            if !files.contains(&err.file_path) {
                files.push(err.file_path.clone());
            }
        }
        files
    }
}

fn tail_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}

/// How a chunk boundary was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    /// One or more whole top-level definitions.
    Function,
    /// A plain window of lines (no structural boundary found).
    Lines,
}

/// A contiguous line range of a large file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 1-indexed, inclusive.
    pub start_line: usize,
    /// 1-indexed, inclusive.
    pub end_line: usize,
    pub content: String,
    pub kind: ChunkKind,
    pub name: Option<String>,
}
