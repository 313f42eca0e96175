//! Test doubles and a scratch source tree for exercising the review loop.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::history::Message;
use crate::core::types::{BuildResult, Severity, StructuredError};
use crate::io::build::BuildExecutor;
use crate::io::chat::{ChatClient, ChatError};
use crate::io::config::{ReviewerConfig, load_config, write_config};
use crate::io::git::Git;
use crate::io::index::ScopeIndex;
use crate::io::layout::{InitOptions, ReviewerPaths, init_reviewer};

/// Chat client that replays queued replies and records every request.
///
/// When the chat queue runs dry it reports the backend as unreachable, which
/// ends a loop the same way a dead transport would.
#[derive(Default)]
pub struct ScriptedChat {
    replies: RefCell<VecDeque<Result<String, ChatError>>>,
    generated: RefCell<VecDeque<String>>,
    requests: RefCell<Vec<Vec<Message>>>,
}

impl ScriptedChat {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: RefCell::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
            ..Self::default()
        }
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        self.replies.borrow_mut().push_back(Ok(reply.into()));
    }

    pub fn push_error(&self, err: ChatError) {
        self.replies.borrow_mut().push_back(Err(err));
    }

    /// Queue a reply for [`ChatClient::generate`] (commit messages).
    pub fn push_generated(&self, reply: impl Into<String>) {
        self.generated.borrow_mut().push_back(reply.into());
    }

    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.borrow().clone()
    }

    pub fn remaining(&self) -> usize {
        self.replies.borrow().len()
    }
}

impl ChatClient for ScriptedChat {
    fn chat(&self, messages: &[Message]) -> Result<String, ChatError> {
        self.requests.borrow_mut().push(messages.to_vec());
        self.replies
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(ChatError::Unreachable("script exhausted".to_string())))
    }

    fn generate(&self, _prompt: &str) -> Result<String, ChatError> {
        self.generated
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| ChatError::Failed("no scripted commit message".to_string()))
    }

    fn list_models(&self) -> Result<Vec<String>, ChatError> {
        Ok(vec!["scripted".to_string()])
    }
}

/// Build executor that replays queued results; passes once the queue is empty.
#[derive(Default)]
pub struct ScriptedBuild {
    results: RefCell<VecDeque<BuildResult>>,
    calls: Cell<u32>,
}

impl ScriptedBuild {
    pub fn new(results: Vec<BuildResult>) -> Self {
        Self {
            results: RefCell::new(results.into()),
            calls: Cell::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.get()
    }
}

impl BuildExecutor for ScriptedBuild {
    fn run_build(&self) -> Result<BuildResult> {
        self.calls.set(self.calls.get() + 1);
        Ok(self
            .results
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(build_ok))
    }
}

pub fn build_ok() -> BuildResult {
    BuildResult {
        success: true,
        return_code: 0,
        duration_seconds: 0.1,
        errors: Vec::new(),
        warnings: Vec::new(),
        raw_output: String::new(),
    }
}

pub fn build_failed(file: &str, line: u32, message: &str) -> BuildResult {
    BuildResult {
        success: false,
        return_code: 2,
        duration_seconds: 0.1,
        errors: vec![StructuredError {
            file_path: file.to_string(),
            line_number: line,
            column: Some(1),
            severity: Severity::Error,
            message: message.to_string(),
        }],
        warnings: Vec::new(),
        raw_output: format!("{file}:{line}:1: error: {message}\n*** Error code 1\n"),
    }
}

pub const CAT_C: &str = "#include <stdio.h>\n\nint\nmain(void)\n{\n\n\tprintf(\"cat\\n\");\n\treturn (1);\n}\n";
pub const ECHO_C: &str = "#include <stdio.h>\n\nint\nmain(void)\n{\n\n\tputs(\"echo\");\n\treturn (0);\n}\n";
pub const UTIL_C: &str = "int\nutil_add(int a, int b)\n{\n\n\treturn (a + b);\n}\n";

/// A large C file with `functions` small functions.
pub fn big_c_source(functions: usize) -> String {
    let mut text = String::from("#include <stdlib.h>\n\n");
    for n in 0..functions {
        text.push_str(&format!(
            "static int\nhelper{n}(int x)\n{{\n\n\tx += {n};\n\tx *= 2;\n\treturn (x);\n}}\n\n"
        ));
    }
    text
}

/// Temporary git repository holding a small C tree and an initialised
/// `.reviewer/` with a test-friendly config.
pub struct TestRepo {
    dir: TempDir,
    root: PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create tempdir")?;
        let root = dir.path().join("src");
        fs::create_dir_all(&root).with_context(|| format!("mkdir {}", root.display()))?;
        let repo = Self { dir, root };
        repo.git(&["init", "-q"])?;
        repo.git(&["checkout", "-q", "-B", "main"])?;
        repo.git(&["config", "user.email", "reviewer@example.com"])?;
        repo.git(&["config", "user.name", "Reviewer Test"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;

        repo.write("bin/cat/cat.c", CAT_C)?;
        repo.write("bin/cat/Makefile", "PROG=\tcat\n\n.include <bsd.prog.mk>\n")?;
        repo.write("bin/echo/echo.c", ECHO_C)?;
        repo.write("bin/echo/Makefile", "PROG=\techo\n\n.include <bsd.prog.mk>\n")?;
        repo.write("lib/libutil/util.c", UTIL_C)?;
        repo.write("lib/libutil/Makefile", "LIB=\tutil\n\n.include <bsd.lib.mk>\n")?;
        repo.write("usr.bin/big/big.c", &big_c_source(12))?;
        repo.write("usr.bin/big/Makefile", "PROG=\tbig\n\n.include <bsd.prog.mk>\n")?;
        repo.write("Makefile", "SUBDIR=\tbin lib usr.bin\n")?;

        init_reviewer(repo.path(), &InitOptions { force: false })?;
        repo.write_config(&Self::test_config())?;
        let cfg = repo.config()?;
        ScopeIndex::open(repo.path(), &cfg.index)?;

        repo.git(&["add", "-A"])?;
        repo.git(&["commit", "-q", "-m", "initial tree"])?;
        Ok(repo)
    }

    /// Defaults with pushes, model commit messages and transcripts off, and
    /// chunk sizes small enough for the fixture tree.
    pub fn test_config() -> ReviewerConfig {
        let mut cfg = ReviewerConfig::default();
        cfg.git.push = false;
        cfg.git.model_commit_messages = false;
        cfg.logs.transcripts = false;
        cfg.chunking.threshold_lines = 40;
        cfg.chunking.chunk_lines = 20;
        cfg.session.max_iterations = 50;
        cfg
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn paths(&self) -> ReviewerPaths {
        ReviewerPaths::new(self.path())
    }

    pub fn config(&self) -> Result<ReviewerConfig> {
        load_config(&self.paths().config_path)
    }

    pub fn write_config(&self, cfg: &ReviewerConfig) -> Result<()> {
        write_config(&self.paths().config_path, cfg)
    }

    pub fn index(&self) -> Result<ScopeIndex> {
        let cfg = self.config()?;
        ScopeIndex::load(self.paths().under_root(&cfg.index.path))
    }

    pub fn gateway(&self) -> Git {
        Git::new(self.path())
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("mkdir {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        let path = self.path().join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    pub fn commit_count(&self) -> Result<usize> {
        let out = self.git(&["rev-list", "--count", "HEAD"])?;
        out.trim().parse().context("parse commit count")
    }

    pub fn head_subject(&self) -> Result<String> {
        Ok(self.git(&["log", "-1", "--format=%s"])?.trim().to_string())
    }

    /// Paths touched by the HEAD commit.
    pub fn head_files(&self) -> Result<Vec<String>> {
        let out = self.git(&["show", "--name-only", "--format=", "HEAD"])?;
        Ok(out
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Create a bare repository beside the tree, add it as `origin` and push `main`.
    pub fn add_bare_remote(&self) -> Result<PathBuf> {
        let remote = self.dir.path().join("remote.git");
        run_git(self.dir.path(), &["init", "-q", "--bare", path_str(&remote)?])?;
        self.git(&["remote", "add", "origin", path_str(&remote)?])?;
        self.git(&["push", "-q", "origin", "main"])?;
        Ok(remote)
    }

    pub fn git_dir(&self) -> PathBuf {
        self.root.join(".git")
    }

    pub fn git(&self, args: &[&str]) -> Result<String> {
        run_git(self.path(), args)
    }
}

/// Write an executable hook script into `<git_dir>/hooks/<name>`.
#[cfg(unix)]
pub fn install_hook(git_dir: &Path, name: &str, script: &str) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let hooks = git_dir.join("hooks");
    fs::create_dir_all(&hooks).with_context(|| format!("mkdir {}", hooks.display()))?;
    let path = hooks.join(name);
    fs::write(&path, script).with_context(|| format!("write {}", path.display()))?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("chmod {}", path.display()))
}

/// Run git in `dir` and return stdout, failing on a non-zero exit.
pub fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !output.status.success() {
        return Err(anyhow!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("non-utf8 path {}", path.display()))
}
