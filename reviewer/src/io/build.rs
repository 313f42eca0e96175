//! External build execution and compiler diagnostic extraction.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Result, anyhow};
use regex::Regex;
use tracing::{info, instrument, warn};

use super::config::BuildConfig;
use super::process::{RunOptions, run_command};
use crate::core::types::{BuildResult, Severity, StructuredError};

/// Build capability consumed by the executor.
pub trait BuildExecutor {
    fn run_build(&self) -> Result<BuildResult>;
}

/// Lines of combined output kept in [`BuildResult::raw_output`].
const RAW_OUTPUT_TAIL_LINES: usize = 200;

static DIAGNOSTIC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<file>[^:\s][^:]*):(?P<line>\d+):(?:(?P<col>\d+):)?\s*(?P<sev>fatal error|error|warning):\s*(?P<msg>.+)$",
    )
    .expect("diagnostic regex")
});

/// Runs the configured build command in the source root.
#[derive(Debug, Clone)]
pub struct CommandBuildExecutor {
    root: PathBuf,
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
    log_path: Option<PathBuf>,
}

impl CommandBuildExecutor {
    pub fn new(root: impl Into<PathBuf>, cfg: &BuildConfig) -> Self {
        Self {
            root: root.into(),
            command: cfg.command.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs),
            output_limit_bytes: cfg.output_limit_bytes,
            log_path: None,
        }
    }

    /// Mirror the full build output into `path`.
    pub fn with_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }
}

impl BuildExecutor for CommandBuildExecutor {
    #[instrument(skip(self), fields(command = %self.command.join(" ")))]
    fn run_build(&self) -> Result<BuildResult> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("build command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.root);

        let mut options = RunOptions::new(self.timeout, self.output_limit_bytes).keep_tail();
        if let Some(log) = &self.log_path {
            options = options.with_tee(log);
        }
        let output = run_command(cmd, &options)?;

        let mut text = output.combined_text();
        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "build timed out");
            text.push_str(&format!(
                "\n[build killed after {}s timeout]\n",
                self.timeout.as_secs()
            ));
        }
        let (errors, warnings) = parse_diagnostics(&text, &self.root);
        let success = output.status.success() && !output.timed_out;
        info!(
            success,
            errors = errors.len(),
            warnings = warnings.len(),
            duration_secs = output.elapsed.as_secs_f64(),
            "build finished"
        );
        Ok(BuildResult {
            success,
            return_code: output.exit_code(),
            duration_seconds: output.elapsed.as_secs_f64(),
            errors,
            warnings,
            raw_output: tail(&text, RAW_OUTPUT_TAIL_LINES),
        })
    }
}

/// Extract `file:line[:col]: severity: message` diagnostics. Duplicates from
/// parallel make jobs are collapsed; absolute paths under `root` become relative.
pub fn parse_diagnostics(output: &str, root: &Path) -> (Vec<StructuredError>, Vec<StructuredError>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut seen = HashSet::new();
    for line in output.lines() {
        let Some(caps) = DIAGNOSTIC_RE.captures(line.trim_end()) else {
            continue;
        };
        let Ok(line_number) = caps["line"].parse::<u32>() else {
            continue;
        };
        let column = caps.name("col").and_then(|m| m.as_str().parse().ok());
        let severity = if &caps["sev"] == "warning" {
            Severity::Warning
        } else {
            Severity::Error
        };
        let diagnostic = StructuredError {
            file_path: relativize(&caps["file"], root),
            line_number,
            column,
            severity,
            message: caps["msg"].trim().to_string(),
        };
        if !seen.insert(diagnostic.render()) {
            continue;
        }
        match severity {
            Severity::Error => errors.push(diagnostic),
            Severity::Warning => warnings.push(diagnostic),
        }
    }
    (errors, warnings)
}

fn relativize(file: &str, root: &Path) -> String {
    Path::new(file)
        .strip_prefix(root)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| file.to_string())
}

fn tail(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(count)..].join("\n")
}
