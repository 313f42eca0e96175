//! Append-only markdown logs kept in the source tree: review progress and
//! lessons learned from failed builds.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;

use crate::core::lesson::Lesson;

/// One completed directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEntry {
    pub date: NaiveDate,
    pub directory: String,
    pub subject: String,
    pub files: Vec<String>,
    pub failed_builds: u32,
}

impl ProgressEntry {
    pub fn render(&self) -> String {
        let mut buf = format!(
            "\n## {} {}\n\n- commit: {}\n",
            self.date.format("%Y-%m-%d"),
            self.directory,
            self.subject
        );
        if self.files.is_empty() {
            buf.push_str("- files: (none)\n");
        } else {
            buf.push_str(&format!("- files: {}\n", self.files.join(", ")));
        }
        if self.failed_builds > 0 {
            buf.push_str(&format!(
                "- failed builds before success: {}\n",
                self.failed_builds
            ));
        }
        buf
    }
}

#[derive(Debug, Clone)]
pub struct ProgressLog {
    path: PathBuf,
}

impl ProgressLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &ProgressEntry) -> Result<()> {
        append_with_header(&self.path, "# Review Progress\n", &entry.render())
    }

    /// Current contents, `None` when the log does not exist yet.
    pub fn snapshot(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        fs::read_to_string(&self.path)
            .map(Some)
            .with_context(|| format!("read progress {}", self.path.display()))
    }

    /// Put the log back to a state taken by [`ProgressLog::snapshot`].
    pub fn restore(&self, snapshot: Option<&str>) -> Result<()> {
        match snapshot {
            Some(text) => fs::write(&self.path, text)
                .with_context(|| format!("restore progress {}", self.path.display())),
            None if self.path.exists() => fs::remove_file(&self.path)
                .with_context(|| format!("remove progress {}", self.path.display())),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LessonLog {
    path: PathBuf,
}

impl LessonLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn append(&self, lesson: &Lesson) -> Result<()> {
        append_with_header(&self.path, "# Lessons\n\n", &format!("{}\n", lesson.render()))
    }

    /// The last `count` lesson bullets, oldest first. A missing log is empty.
    pub fn recent(&self, count: usize) -> Result<Vec<String>> {
        if count == 0 || !self.path.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("read lessons {}", self.path.display()))?;
        let bullets: Vec<String> = text
            .lines()
            .filter(|l| l.starts_with("- "))
            .map(str::to_string)
            .collect();
        let start = bullets.len().saturating_sub(count);
        Ok(bullets[start..].to_vec())
    }
}

fn append_with_header(path: &Path, header: &str, text: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create dir {}", parent.display()))?;
    }
    let fresh = !path.exists();
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    if fresh {
        file.write_all(header.as_bytes())
            .with_context(|| format!("write {}", path.display()))?;
    }
    file.write_all(text.as_bytes())
        .with_context(|| format!("append {}", path.display()))?;
    Ok(())
}
