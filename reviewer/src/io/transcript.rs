//! Per-turn session transcripts under `.reviewer/sessions/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

/// Everything worth keeping about one model turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnRecord {
    pub session_id: String,
    pub turn: u32,
    pub action: Option<String>,
    pub target: Option<String>,
    pub verdict: String,
    pub current_directory: Option<String>,
    pub pending_changes: bool,
    pub started_at: String,
    pub duration_ms: u64,
    #[serde(skip)]
    pub response: String,
    #[serde(skip)]
    pub result: String,
}

/// Receives each completed turn. Failures are reported, never fatal.
pub trait TurnObserver {
    fn record(&self, turn: &TurnRecord) -> Result<()>;
}

/// Discards every turn.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl TurnObserver for NullObserver {
    fn record(&self, _turn: &TurnRecord) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TurnPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub response_path: PathBuf,
    pub result_path: PathBuf,
}

impl TurnPaths {
    pub fn new(sessions_dir: &Path, session_id: &str, turn: u32) -> Self {
        let dir = sessions_dir.join(session_id).join(turn.to_string());
        Self {
            meta_path: dir.join("meta.json"),
            response_path: dir.join("response.md"),
            result_path: dir.join("result.md"),
            dir,
        }
    }
}

/// Writes `meta.json`, `response.md` and `result.md` for every turn.
#[derive(Debug, Clone)]
pub struct TranscriptWriter {
    sessions_dir: PathBuf,
}

impl TranscriptWriter {
    pub fn new(sessions_dir: impl Into<PathBuf>) -> Self {
        Self {
            sessions_dir: sessions_dir.into(),
        }
    }
}

impl TurnObserver for TranscriptWriter {
    fn record(&self, turn: &TurnRecord) -> Result<()> {
        let paths = TurnPaths::new(&self.sessions_dir, &turn.session_id, turn.turn);
        fs::create_dir_all(&paths.dir)
            .with_context(|| format!("create turn dir {}", paths.dir.display()))?;
        let mut meta = serde_json::to_string_pretty(turn).context("serialize turn meta")?;
        meta.push('\n');
        write_text(&paths.meta_path, &meta)?;
        write_text(&paths.response_path, &turn.response)?;
        write_text(&paths.result_path, &turn.result)?;
        Ok(())
    }
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}
