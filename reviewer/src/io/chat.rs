//! Chat transport boundary.
//!
//! The loop sees only [`ChatClient`]. The bundled [`CommandChatClient`] hands
//! each request to an external program as JSON on stdin and takes its stdout as
//! the reply, so any backend can sit behind a small adapter script.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::config::ChatConfig;
use super::process::{RunOptions, run_command};
use crate::core::history::Message;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat request timed out after {secs}s")]
    Timeout { secs: u64 },
    #[error("chat backend unreachable: {0}")]
    Unreachable(String),
    #[error("chat request failed: {0}")]
    Failed(String),
    #[error("chat backend returned an empty reply")]
    Empty,
}

impl ChatError {
    /// Timeouts and unreachable backends end the session; the rest are per-turn.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, ChatError::Timeout { .. } | ChatError::Unreachable(_))
    }
}

/// Narrow chat capability the review loop depends on.
pub trait ChatClient {
    fn chat(&self, messages: &[Message]) -> Result<String, ChatError>;

    /// One-shot completion outside the main conversation.
    fn generate(&self, prompt: &str) -> Result<String, ChatError> {
        self.chat(&[Message::user(prompt)])
    }

    fn list_models(&self) -> Result<Vec<String>, ChatError>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
}

/// Chat client backed by an external program.
#[derive(Debug, Clone)]
pub struct CommandChatClient {
    command: Vec<String>,
    model: String,
    timeout: Duration,
    output_limit_bytes: usize,
    workdir: Option<PathBuf>,
}

impl CommandChatClient {
    pub fn new(cfg: &ChatConfig) -> Self {
        Self {
            command: cfg.command.clone(),
            model: cfg.model.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs),
            output_limit_bytes: cfg.output_limit_bytes,
            workdir: None,
        }
    }

    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    fn command(&self, extra: &[&str]) -> Result<Command, ChatError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| ChatError::Unreachable("chat command is empty".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(args).args(extra);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        Ok(cmd)
    }

    fn invoke(&self, extra: &[&str], stdin: Option<Vec<u8>>) -> Result<String, ChatError> {
        let cmd = self.command(extra)?;
        let mut options = RunOptions::new(self.timeout, self.output_limit_bytes);
        options.stdin = stdin;
        let output =
            run_command(cmd, &options).map_err(|e| ChatError::Unreachable(format!("{e:#}")))?;
        if output.timed_out {
            return Err(ChatError::Timeout {
                secs: self.timeout.as_secs(),
            });
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(exit_code = ?output.status.code(), "chat command failed");
            return Err(ChatError::Failed(format!(
                "exit code {}: {}",
                output.exit_code(),
                stderr.trim()
            )));
        }
        Ok(output.stdout_text())
    }
}

impl ChatClient for CommandChatClient {
    #[instrument(skip_all, fields(model = %self.model, messages = messages.len()))]
    fn chat(&self, messages: &[Message]) -> Result<String, ChatError> {
        let request = ChatRequest {
            model: &self.model,
            messages,
        };
        let body = serde_json::to_vec(&request)
            .map_err(|e| ChatError::Failed(format!("encode request: {e}")))?;
        let reply = self.invoke(&[], Some(body))?;
        if reply.trim().is_empty() {
            return Err(ChatError::Empty);
        }
        debug!(reply_bytes = reply.len(), "chat reply received");
        Ok(reply)
    }

    fn list_models(&self) -> Result<Vec<String>, ChatError> {
        let out = self.invoke(&["--list-models"], None)?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(script: &str, timeout_secs: u64) -> CommandChatClient {
        CommandChatClient::new(&ChatConfig {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            timeout_secs,
            ..ChatConfig::default()
        })
    }

    #[test]
    fn sends_json_request_and_returns_stdout() {
        let chat = client("cat >/dev/null; echo 'ACTION: BUILD'", 10);
        let reply = chat.chat(&[Message::user("hi")]).unwrap();
        assert_eq!(reply.trim(), "ACTION: BUILD");
    }

    #[test]
    fn request_carries_model_and_roles() {
        let chat = client("cat", 10);
        let reply = chat.chat(&[Message::system("s"), Message::user("u")]).unwrap();
        let value: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["model"], "default");
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][1]["content"], "u");
    }

    #[test]
    fn timeout_is_a_transport_failure() {
        let chat = client("sleep 5", 0);
        let err = chat.chat(&[Message::user("hi")]).unwrap_err();
        assert!(matches!(err, ChatError::Timeout { .. }));
        assert!(err.is_transport_failure());
    }

    #[test]
    fn missing_program_is_unreachable() {
        let chat = CommandChatClient::new(&ChatConfig {
            command: vec!["/nonexistent/chat-backend".to_string()],
            ..ChatConfig::default()
        });
        let err = chat.generate("hi").unwrap_err();
        assert!(matches!(err, ChatError::Unreachable(_)));
    }

    #[test]
    fn nonzero_exit_and_empty_reply_are_not_transport_failures() {
        let failed = client("cat >/dev/null; echo boom >&2; exit 1", 10)
            .chat(&[Message::user("hi")])
            .unwrap_err();
        assert!(matches!(failed, ChatError::Failed(_)));
        assert!(!failed.is_transport_failure());

        let empty = client("cat >/dev/null", 10)
            .chat(&[Message::user("hi")])
            .unwrap_err();
        assert!(matches!(empty, ChatError::Empty));
    }

    #[test]
    fn list_models_passes_flag_and_skips_blank_lines() {
        // `sh -c` binds the first extra argument to $0.
        let chat = client(
            "if [ \"$0\" = --list-models ]; then printf 'llama3\\n\\n  qwen2.5-coder \\n'; else exit 3; fi",
            10,
        );
        assert_eq!(
            chat.list_models().unwrap(),
            vec!["llama3".to_string(), "qwen2.5-coder".to_string()]
        );

        let err = client("exit 4", 10).list_models().unwrap_err();
        assert!(matches!(err, ChatError::Failed(_)));
    }
}
