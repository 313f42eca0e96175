//! Canonical paths under `.reviewer/` and scaffolding for `reviewer init`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use super::config::{ReviewerConfig, write_config};

/// Tool directory at the top of the source root.
pub const TOOL_DIR: &str = ".reviewer";

const REVIEWER_GITIGNORE: &str = "sessions/\nbuild.log\n*.tmp\n";

/// All canonical reviewer paths for a source root.
#[derive(Debug, Clone)]
pub struct ReviewerPaths {
    pub root: PathBuf,
    pub tool_dir: PathBuf,
    pub config_path: PathBuf,
    pub gitignore_path: PathBuf,
    pub sessions_dir: PathBuf,
    pub build_log_path: PathBuf,
}

impl ReviewerPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let tool_dir = root.join(TOOL_DIR);
        Self {
            root: root.clone(),
            tool_dir: tool_dir.clone(),
            config_path: tool_dir.join("config.toml"),
            gitignore_path: tool_dir.join(".gitignore"),
            sessions_dir: tool_dir.join("sessions"),
            build_log_path: tool_dir.join("build.log"),
        }
    }

    /// Resolve a root-relative path from config.
    pub fn under_root(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }
}

/// Options for `init_reviewer`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite an existing config.
    pub force: bool,
}

/// Create `.reviewer/` with a default config and its `.gitignore`.
///
/// Fails if a config already exists unless `options.force` is set.
pub fn init_reviewer(root: &Path, options: &InitOptions) -> Result<ReviewerPaths> {
    let paths = ReviewerPaths::new(root);
    if paths.tool_dir.exists() && !paths.tool_dir.is_dir() {
        return Err(anyhow!("reviewer init: {TOOL_DIR} exists but is not a directory"));
    }
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "reviewer init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }
    fs::create_dir_all(&paths.tool_dir)
        .with_context(|| format!("create directory {}", paths.tool_dir.display()))?;
    write_config(&paths.config_path, &ReviewerConfig::default())?;
    ensure_gitignore(&paths.gitignore_path)?;
    debug!(root = %root.display(), "reviewer initialized");
    Ok(paths)
}

/// Make sure session transcripts and build logs stay out of commits.
pub fn ensure_gitignore(path: &Path) -> Result<()> {
    let existing = if path.exists() {
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?
    } else {
        String::new()
    };
    let mut lines: Vec<String> = existing
        .lines()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    let mut changed = false;
    for required in REVIEWER_GITIGNORE.lines() {
        if !lines.iter().any(|l| l == required) {
            lines.push(required.to_string());
            changed = true;
        }
    }
    if !changed && path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut buf = lines.join("\n");
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}
