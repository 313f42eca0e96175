//! Version-control gateway.
//!
//! The loop commits verified work directory by directory, so it needs a small
//! set of atomic git operations. Each one is a single `git` subprocess call in
//! the source root; nothing here retries except [`Git::push_with_retry`].

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Result of a git command whose failure is reported rather than raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitOutcome {
    pub ok: bool,
    pub output: String,
}

/// How a push attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    /// The first push was rejected; a pull-rebase made the second one succeed.
    PushedAfterRebase,
    /// Both attempts failed. The commit stays local.
    Failed { output: String },
}

/// Wrapper for executing git commands in the source root.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to push)"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// True if the worktree has any staged, unstaged or untracked change.
    pub fn has_changes(&self) -> Result<bool> {
        Ok(!self.status_porcelain()?.is_empty())
    }

    /// Paths with uncommitted changes, in `git status` order.
    pub fn changed_files(&self) -> Result<Vec<String>> {
        Ok(self
            .status_porcelain()?
            .into_iter()
            .map(|entry| entry.path)
            .collect())
    }

    /// Short human-readable status.
    pub fn status(&self) -> Result<String> {
        self.run_capture(&["status", "--short", "--branch"])
    }

    /// Unstaged diff, optionally limited to one path.
    pub fn diff(&self, path: Option<&str>) -> Result<String> {
        match path {
            Some(path) => self.run_capture(&["diff", "--", path]),
            None => self.run_capture(&["diff"]),
        }
    }

    /// Diff of the worktree (tracked files, staged or not) against HEAD,
    /// limited to `paths` when any are given.
    pub fn diff_against_head(&self, paths: &[String]) -> Result<String> {
        let mut args = vec!["diff", "HEAD", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run_capture(&args)
    }

    /// Diff of the index against HEAD (what the next commit will contain).
    pub fn staged_diff(&self) -> Result<String> {
        self.run_capture(&["diff", "--cached"])
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes. A rejected commit is reported, not raised.
    #[instrument(skip_all)]
    pub fn commit(&self, message: &str) -> Result<GitOutcome> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(GitOutcome {
                ok: false,
                output: "nothing staged to commit".to_string(),
            });
        }
        let outcome = self.run_outcome(&["commit", "-m", message])?;
        if outcome.ok {
            info!("committed staged changes");
        } else {
            warn!(output = %outcome.output, "commit failed");
        }
        Ok(outcome)
    }

    #[instrument(skip_all, fields(remote, branch))]
    pub fn pull_rebase(&self, remote: &str, branch: &str) -> Result<GitOutcome> {
        self.run_outcome(&["pull", "--rebase", remote, branch])
    }

    #[instrument(skip_all, fields(remote, branch))]
    pub fn push(&self, remote: &str, branch: &str) -> Result<GitOutcome> {
        let refspec = format!("HEAD:{branch}");
        self.run_outcome(&["push", remote, &refspec])
    }

    /// Push, and on rejection retry exactly once after a pull-rebase.
    pub fn push_with_retry(&self, remote: &str, branch: &str) -> Result<PushOutcome> {
        let first = self.push(remote, branch)?;
        if first.ok {
            return Ok(PushOutcome::Pushed);
        }
        warn!(output = %first.output, "push rejected, pulling with rebase");
        let pulled = self.pull_rebase(remote, branch)?;
        if !pulled.ok {
            warn!(output = %pulled.output, "pull --rebase failed");
            // Leave the tree usable if the rebase stopped on a conflict.
            let _ = self.run(&["rebase", "--abort"]);
            return Ok(PushOutcome::Failed {
                output: format!("{}\n{}", first.output, pulled.output),
            });
        }
        let second = self.push(remote, branch)?;
        if second.ok {
            info!("push succeeded after rebase");
            return Ok(PushOutcome::PushedAfterRebase);
        }
        warn!(output = %second.output, "push failed twice");
        Ok(PushOutcome::Failed {
            output: second.output,
        })
    }

    fn run_outcome(&self, args: &[&str]) -> Result<GitOutcome> {
        let output = self.run(args)?;
        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&stderr);
        }
        Ok(GitOutcome {
            ok: output.status.success(),
            output: text.trim_end().to_string(),
        })
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: unquote(path.trim()),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry {
        code,
        path: unquote(&path),
    })
}

fn unquote(path: &str) -> String {
    path.strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
        .unwrap_or(path)
        .to_string()
}
