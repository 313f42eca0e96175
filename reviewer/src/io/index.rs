//! Directory index: filesystem scan plus persistence of the index document.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{Local, NaiveDate};
use tracing::{debug, info, instrument};
use walkdir::WalkDir;

use super::config::{IndexConfig, write_atomic};
use crate::core::scope::{self, IndexState, ScopeEntry, ScopeStatus};

/// Index of reviewable directories backed by a markdown document.
#[derive(Debug, Clone)]
pub struct ScopeIndex {
    path: PathBuf,
    state: IndexState,
}

impl ScopeIndex {
    /// Empty index that will persist to `path`.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: IndexState::default(),
        }
    }

    /// Load the document at `path`. A missing file yields an empty index.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            debug!(path = %path.display(), "index document missing; starting empty");
            return Ok(Self::empty(path));
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("read index {}", path.display()))?;
        let (state, _) = scope::parse(&text)
            .map_err(|e| anyhow!("parse index {}: {e}", path.display()))?;
        Ok(Self { path, state })
    }

    /// Load the configured index, scanning the tree when it has no entries yet.
    pub fn open(root: &Path, cfg: &IndexConfig) -> Result<Self> {
        let mut index = Self::load(root.join(&cfg.path))?;
        if index.state.entries.is_empty() {
            index.generate_from_scan(root, cfg)?;
            index.save()?;
        }
        Ok(index)
    }

    /// Re-scan the tree, keeping status, date and notes of surviving paths.
    #[instrument(skip(self, cfg), fields(root = %root.display()))]
    pub fn generate_from_scan(&mut self, root: &Path, cfg: &IndexConfig) -> Result<usize> {
        let scanned = scan_tree(root, cfg)?;
        let count = scanned.len();
        self.state.merge_scan(scanned);
        info!(directories = count, "index scan complete");
        Ok(count)
    }

    /// Write the document unless only the timestamp would change. Returns
    /// whether the file was written.
    pub fn save(&self) -> Result<bool> {
        let generated = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let rendered = scope::render(&self.state, &generated);
        if let Ok(existing) = fs::read_to_string(&self.path)
            && scope::normalize(&existing) == scope::normalize(&rendered)
        {
            debug!("index unchanged; skipping write");
            return Ok(false);
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create index dir {}", parent.display()))?;
        }
        write_atomic(&self.path, &rendered)?;
        debug!(path = %self.path.display(), "index written");
        Ok(true)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &IndexState {
        &self.state
    }

    pub fn entry(&self, path: &str) -> Option<&ScopeEntry> {
        self.state.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.state.entries.contains_key(path)
    }

    pub fn get_next_pending(&self) -> Option<String> {
        self.state.next_pending().map(str::to_string)
    }

    pub fn get_current(&self) -> Option<String> {
        self.state.current().map(str::to_string)
    }

    pub fn has_pending(&self) -> bool {
        self.state.has_pending()
    }

    pub fn count(&self, status: ScopeStatus) -> usize {
        self.state.count(status)
    }

    /// Make `path` the single current entry and persist. Unknown paths are a no-op.
    pub fn set_current(&mut self, path: &str) -> Result<bool> {
        if !self.state.set_current(path) {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    /// Mark `path` done today and persist.
    pub fn mark_done(&mut self, path: &str, notes: &str) -> Result<bool> {
        self.mark_done_on(path, notes, Local::now().date_naive())
    }

    pub fn mark_done_on(&mut self, path: &str, notes: &str, date: NaiveDate) -> Result<bool> {
        if !self.state.mark_done(path, notes, date) {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    /// Replace the in-memory state, e.g. with an earlier [`ScopeIndex::state`]
    /// clone, and persist it.
    pub fn restore(&mut self, state: IndexState) -> Result<bool> {
        self.state = state;
        self.save()
    }

    pub fn mark_skipped(&mut self, path: &str, notes: &str) -> Result<bool> {
        if !self.state.mark_skipped(path, notes) {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }
}

/// Walk the configured top-level directories and collect reviewable ones.
///
/// A directory is reviewable when it directly holds a recognised file. The
/// walk descends into every non-ignored subdirectory either way.
pub fn scan_tree(root: &Path, cfg: &IndexConfig) -> Result<Vec<ScopeEntry>> {
    let mut found: BTreeMap<String, (BTreeMap<String, u32>, u64)> = BTreeMap::new();
    for top in &cfg.top_level_dirs {
        let base = root.join(top);
        if !base.is_dir() {
            continue;
        }
        let walker = WalkDir::new(&base)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !(e.file_type().is_dir() && is_ignored(e.file_name(), cfg)));
        for entry in walker {
            let entry = entry.with_context(|| format!("walk {}", base.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            let Some(kind) = classify_file(name, cfg) else {
                continue;
            };
            let Some(parent) = entry.path().parent() else {
                continue;
            };
            let Some(rel) = relative_dir(root, parent) else {
                continue;
            };
            let lines = count_lines(entry.path());
            let slot = found.entry(rel).or_default();
            *slot.0.entry(kind).or_default() += 1;
            slot.1 += lines;
        }
    }
    Ok(found
        .into_iter()
        .map(|(path, (counts, lines))| ScopeEntry::pending(&path, counts, lines))
        .collect())
}

fn is_ignored(name: &std::ffi::OsStr, cfg: &IndexConfig) -> bool {
    let name = name.to_string_lossy();
    cfg.ignore_dirs.iter().any(|d| d == name.as_ref())
}

/// Count key for a recognised file: the special file name or the suffix.
fn classify_file(name: &str, cfg: &IndexConfig) -> Option<String> {
    if cfg.special_files.iter().any(|s| s == name) {
        return Some(name.to_string());
    }
    let (_, suffix) = name.rsplit_once('.')?;
    cfg.source_suffixes
        .iter()
        .any(|s| s == suffix)
        .then(|| suffix.to_string())
}

fn relative_dir(root: &Path, dir: &Path) -> Option<String> {
    let rel = dir.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

fn count_lines(path: &Path) -> u64 {
    match fs::read(path) {
        Ok(bytes) => bytes.iter().filter(|b| **b == b'\n').count() as u64,
        Err(err) => {
            debug!(path = %path.display(), err = %err, "unreadable file skipped in line count");
            0
        }
    }
}
