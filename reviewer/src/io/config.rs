//! Reviewer configuration stored under `.reviewer/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::policy::PolicyParams;

/// Reviewer configuration (TOML).
///
/// Edited by humans; every field has a default so a partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ReviewerConfig {
    pub session: SessionConfig,
    pub chat: ChatConfig,
    pub build: BuildConfig,
    pub chunking: ChunkingConfig,
    pub git: GitConfig,
    pub index: IndexConfig,
    pub logs: LogsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Model turns before the session gives up.
    pub max_iterations: u32,
    /// History length that triggers pruning.
    pub max_history_messages: usize,
    /// Most recent messages kept when pruning (the two anchors are always kept).
    pub keep_recent_messages: usize,
    /// HALT is refused below this many completed directories while work remains.
    pub min_directories_before_halt: u32,
    /// Leading path segments used to derive a scope from an unscoped edit.
    pub auto_scope_depth: usize,
    /// Larger non-chunked reads are truncated to this many bytes.
    pub max_read_bytes: usize,
    /// Cap on FIND_FILE / GREP / LIST_DIR result lines.
    pub max_search_results: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            max_history_messages: 60,
            keep_recent_messages: 40,
            min_directories_before_halt: 3,
            auto_scope_depth: 2,
            max_read_bytes: 200_000,
            max_search_results: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChatConfig {
    /// Program (and arguments) that answers one chat request on stdin/stdout.
    pub command: Vec<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            command: vec!["reviewer-chat".to_string()],
            model: "default".to_string(),
            timeout_secs: 10 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BuildConfig {
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
    /// Errors listed in the report sent back to the model.
    pub max_reported_errors: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "make".to_string(),
                "-j8".to_string(),
                "buildworld".to_string(),
            ],
            timeout_secs: 4 * 60 * 60,
            output_limit_bytes: 4_000_000,
            max_reported_errors: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Files with more lines than this are read in chunks.
    pub threshold_lines: usize,
    /// Target lines per chunk.
    pub chunk_lines: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            threshold_lines: 800,
            chunk_lines: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitConfig {
    pub push: bool,
    pub remote: String,
    /// Branch to push; the current branch when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Ask the model to summarise the staged diff for the commit subject.
    pub model_commit_messages: bool,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            push: true,
            remote: "origin".to_string(),
            branch: None,
            model_commit_messages: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IndexConfig {
    /// Index document, relative to the source root.
    pub path: String,
    pub top_level_dirs: Vec<String>,
    /// Directory names never descended into.
    pub ignore_dirs: Vec<String>,
    /// Suffixes (without the dot) that make a directory reviewable.
    pub source_suffixes: Vec<String>,
    /// File names that make a directory reviewable regardless of suffix.
    pub special_files: Vec<String>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            path: ".reviewer/REVIEW-INDEX.md".to_string(),
            top_level_dirs: strings(&[
                "bin", "sbin", "usr.bin", "usr.sbin", "lib", "libexec", "sys", "stand", "cddl",
                "krb5", "secure", "share", "include", "tools",
            ]),
            ignore_dirs: strings(&[".git", ".reviewer", "obj", "contrib", "crypto", "tests"]),
            source_suffixes: strings(&[
                "c", "h", "S", "s", "cc", "cpp", "y", "l", "sh", "awk", "m4", "mk", "1", "2", "3",
                "4", "5", "6", "7", "8", "9",
            ]),
            special_files: strings(&["Makefile", "Makefile.inc", "README"]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogsConfig {
    pub progress_path: String,
    pub lessons_path: String,
    /// Most recent lessons included in the opening prompt.
    pub lessons_in_prompt: usize,
    /// Write per-turn transcripts under `.reviewer/sessions/`.
    pub transcripts: bool,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            progress_path: ".reviewer/PROGRESS.md".to_string(),
            lessons_path: ".reviewer/LESSONS.md".to_string(),
            lessons_in_prompt: 5,
            transcripts: true,
        }
    }
}

impl ReviewerConfig {
    pub fn validate(&self) -> Result<()> {
        let s = &self.session;
        if s.max_iterations == 0 {
            return Err(anyhow!("session.max_iterations must be > 0"));
        }
        if s.keep_recent_messages == 0 || s.keep_recent_messages + 2 > s.max_history_messages {
            return Err(anyhow!(
                "session.keep_recent_messages must be > 0 and leave room for the two anchor messages within max_history_messages"
            ));
        }
        if s.max_read_bytes == 0 || s.max_search_results == 0 {
            return Err(anyhow!(
                "session.max_read_bytes and session.max_search_results must be > 0"
            ));
        }
        if self.chat.timeout_secs == 0 || self.build.timeout_secs == 0 {
            return Err(anyhow!("chat.timeout_secs and build.timeout_secs must be > 0"));
        }
        if self.chat.output_limit_bytes == 0 || self.build.output_limit_bytes == 0 {
            return Err(anyhow!("output limits must be > 0"));
        }
        if self.chat.command.is_empty() || self.chat.command[0].trim().is_empty() {
            return Err(anyhow!("chat.command must be a non-empty array"));
        }
        if self.build.command.is_empty() || self.build.command[0].trim().is_empty() {
            return Err(anyhow!("build.command must be a non-empty array"));
        }
        if self.chunking.threshold_lines == 0 || self.chunking.chunk_lines == 0 {
            return Err(anyhow!(
                "chunking.threshold_lines and chunking.chunk_lines must be > 0"
            ));
        }
        if self.index.path.trim().is_empty() {
            return Err(anyhow!("index.path must not be empty"));
        }
        Ok(())
    }

    pub fn policy(&self) -> PolicyParams {
        PolicyParams {
            min_directories_before_halt: self.session.min_directories_before_halt,
            auto_scope_depth: self.session.auto_scope_depth,
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ReviewerConfig::default()`.
pub fn load_config(path: &Path) -> Result<ReviewerConfig> {
    if !path.exists() {
        let cfg = ReviewerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ReviewerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ReviewerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write `contents` beside `path` and rename it into place.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, ReviewerConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = ReviewerConfig::default();
        cfg.git.branch = Some("review".to_string());
        cfg.session.min_directories_before_halt = 5;
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[build]\ncommand = [\"make\", \"buildkernel\"]\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.build.command, vec!["make", "buildkernel"]);
        assert_eq!(cfg.session, SessionConfig::default());
    }

    #[test]
    fn rejects_keep_recent_that_crowds_out_anchors() {
        let mut cfg = ReviewerConfig::default();
        cfg.session.max_history_messages = 10;
        cfg.session.keep_recent_messages = 9;
        assert!(cfg.validate().is_err());
    }
}
