//! Child process runner shared by the build and chat transports.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

type Tee = Arc<Option<Mutex<BufWriter<File>>>>;

/// Which end of an over-long stream stays in memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Retain {
    #[default]
    Head,
    /// Keep the last bytes; builds report their failures at the end.
    Tail,
}

/// How to run a child process.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
    /// Bytes of stdout (and separately stderr) kept in memory. The rest is drained.
    pub output_limit_bytes: usize,
    pub retain: Retain,
    /// Mirror stdout and stderr, line by line, into this file.
    pub tee_path: Option<PathBuf>,
}

impl RunOptions {
    pub fn new(timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            stdin: None,
            timeout,
            output_limit_bytes,
            retain: Retain::Head,
            tee_path: None,
        }
    }

    pub fn keep_tail(mut self) -> Self {
        self.retain = Retain::Tail;
        self
    }

    pub fn with_stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn with_tee(mut self, path: impl Into<PathBuf>) -> Self {
        self.tee_path = Some(path.into());
        self
    }
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub truncated_bytes: usize,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stdout followed by stderr, with a note when output was dropped.
    pub fn combined_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&String::from_utf8_lossy(&self.stderr));
        }
        if self.truncated_bytes > 0 {
            text.push_str(&format!("\n[output truncated {} bytes]\n", self.truncated_bytes));
        }
        text
    }

    pub fn exit_code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }
}

/// Run `cmd` to completion or until the timeout, reading both pipes concurrently
/// so a chatty child cannot deadlock on a full pipe.
#[instrument(skip_all, fields(timeout_secs = options.timeout.as_secs(), tee = options.tee_path.is_some()))]
pub fn run_command(mut cmd: Command, options: &RunOptions) -> Result<CommandOutput> {
    if options.stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let tee: Tee = Arc::new(match &options.tee_path {
        Some(path) => Some(Mutex::new(BufWriter::new(open_tee(path)?))),
        None => None,
    });

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let limit = options.output_limit_bytes;
    let retain = options.retain;
    let stdout_tee = Arc::clone(&tee);
    let stdout_handle =
        thread::spawn(move || read_lines_limited(stdout, limit, retain, &stdout_tee));
    let stderr_tee = Arc::clone(&tee);
    let stderr_handle =
        thread::spawn(move || read_lines_limited(stderr, limit, retain, &stderr_tee));

    if let Some(input) = &options.stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        if let Err(e) = child_stdin.write_all(input) {
            // A child that exits without reading stdin closes the pipe early.
            warn!(err = %e, "failed to write child stdin");
        }
        drop(child_stdin);
    }

    let mut timed_out = false;
    let status = match child
        .wait_timeout(options.timeout)
        .context("wait for command")?
    {
        Some(status) => status,
        None => {
            warn!(timeout_secs = options.timeout.as_secs(), "command timed out, killing");
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;
    let truncated_bytes = stdout_truncated + stderr_truncated;
    if truncated_bytes > 0 {
        warn!(truncated_bytes, "output truncated");
    }

    let elapsed = started.elapsed();
    debug!(exit_code = ?status.code(), timed_out, elapsed_ms = elapsed.as_millis() as u64, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        truncated_bytes,
        timed_out,
        elapsed,
    })
}

fn open_tee(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create tee dir {}", parent.display()))?;
    }
    File::create(path).with_context(|| format!("create tee file {}", path.display()))
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_lines_limited<R: Read>(
    reader: R,
    limit: usize,
    retain: Retain,
    tee: &Tee,
) -> Result<(Vec<u8>, usize)> {
    let mut reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut window: VecDeque<Vec<u8>> = VecDeque::new();
    let mut window_bytes = 0usize;
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line).context("read line")?;
        if n == 0 {
            break;
        }

        if let Some(mutex) = tee.as_ref()
            && let Ok(mut writer) = mutex.lock()
        {
            if let Err(e) = writer.write_all(&line) {
                warn!(err = %e, "failed to write tee file");
            } else if let Err(e) = writer.flush() {
                warn!(err = %e, "failed to flush tee file");
            }
        }

        match retain {
            Retain::Head => {
                let remaining = limit.saturating_sub(collected.len());
                let keep = n.min(remaining);
                collected.extend_from_slice(&line[..keep]);
                truncated += n - keep;
            }
            Retain::Tail => {
                if n > limit {
                    truncated += n - limit;
                    line.drain(..n - limit);
                }
                window_bytes += line.len();
                window.push_back(line);
                while window_bytes > limit {
                    let Some(dropped) = window.pop_front() else {
                        break;
                    };
                    window_bytes -= dropped.len();
                    truncated += dropped.len();
                }
            }
        }
    }

    if retain == Retain::Tail {
        collected = window.into_iter().flatten().collect();
    }
    Ok((collected, truncated))
}
