//! Directive execution: the review state machine.
//!
//! [`ActionExecutor`] owns the session and the index and applies one
//! [`Directive`] at a time. Every outcome, including protocol violations and
//! I/O failures, comes back as text for the next model turn. Only the loop
//! decides when a session ends.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Local, Utc};
use glob::{MatchOptions, Pattern};
use regex::Regex;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::core::action::Directive;
use crate::core::lesson::derive_lesson;
use crate::core::path::{PROTECTED_DIRS, PathError, resolve};
use crate::core::policy::{
    HaltDecision, PolicyParams, ScopeChange, derive_scope, evaluate_halt, evaluate_scope_change,
};
use crate::core::session::ReviewSession;
use crate::core::types::{BuildResult, Chunk};
use crate::io::build::BuildExecutor;
use crate::io::chat::ChatClient;
use crate::io::chunker::Chunker;
use crate::io::config::ReviewerConfig;
use crate::io::editor::{EditError, FileEditor};
use crate::io::git::{Git, PushOutcome};
use crate::io::index::ScopeIndex;
use crate::io::journal::{LessonLog, ProgressEntry, ProgressLog};
use crate::io::layout::TOOL_DIR;
use crate::io::prompt::Prompts;

/// Files larger than this are never searched by GREP.
const GREP_MAX_FILE_BYTES: u64 = 2_000_000;

/// How a directive ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Applied,
    /// Refused by a guardrail; nothing changed.
    Rejected,
    /// Attempted and failed (build failure, I/O error).
    Failed,
    /// HALT accepted; the session is over.
    Halt,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Applied => "applied",
            Verdict::Rejected => "rejected",
            Verdict::Failed => "failed",
            Verdict::Halt => "halt",
        }
    }
}

/// Verdict plus the text shown to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub verdict: Verdict,
    pub message: String,
}

impl ActionOutcome {
    pub fn applied(message: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Applied,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Rejected,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Failed,
            message: message.into(),
        }
    }
}

/// Position in a large file being read chunk by chunk.
#[derive(Debug, Clone)]
pub struct ChunkCursor {
    pub path: String,
    pub chunks: Vec<Chunk>,
    /// Index of the chunk last shown.
    pub index: usize,
}

/// Collaborators the executor borrows for the length of a session.
pub struct Collaborators<'a, C: ?Sized, B: ?Sized, K: ?Sized> {
    pub chat: &'a C,
    pub build: &'a B,
    pub chunker: &'a K,
}

pub struct ActionExecutor<'a, C: ?Sized, B: ?Sized, K: ?Sized> {
    root: PathBuf,
    canonical_root: PathBuf,
    cfg: &'a ReviewerConfig,
    policy: PolicyParams,
    deps: Collaborators<'a, C, B, K>,
    git: Git,
    editor: FileEditor,
    prompts: Prompts,
    progress: ProgressLog,
    lessons: LessonLog,
    index: ScopeIndex,
    session: ReviewSession,
    cursor: Option<ChunkCursor>,
}

impl<'a, C, B, K> ActionExecutor<'a, C, B, K>
where
    C: ChatClient + ?Sized,
    B: BuildExecutor + ?Sized,
    K: Chunker + ?Sized,
{
    pub fn new(
        root: &Path,
        cfg: &'a ReviewerConfig,
        deps: Collaborators<'a, C, B, K>,
        index: ScopeIndex,
    ) -> Result<Self> {
        let canonical_root = fs::canonicalize(root)
            .with_context(|| format!("canonicalize source root {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
            canonical_root,
            cfg,
            policy: cfg.policy(),
            deps,
            git: Git::new(root),
            editor: FileEditor::new(root),
            prompts: Prompts::new(),
            progress: ProgressLog::new(root.join(&cfg.logs.progress_path)),
            lessons: LessonLog::new(root.join(&cfg.logs.lessons_path)),
            index,
            session: ReviewSession::new(Utc::now()),
            cursor: None,
        })
    }

    pub fn session(&self) -> &ReviewSession {
        &self.session
    }

    pub fn index(&self) -> &ScopeIndex {
        &self.index
    }

    pub fn cursor(&self) -> Option<&ChunkCursor> {
        self.cursor.as_ref()
    }

    pub fn git(&self) -> &Git {
        &self.git
    }

    pub fn into_index(self) -> ScopeIndex {
        self.index
    }

    /// Start in Scoped-dirty with work left over from an interrupted session.
    pub fn resume(&mut self, directory: &str, changed: &[String]) {
        let files = self.list_scope_files(directory).unwrap_or_default();
        self.session.enter_scope(directory, files);
        for path in changed {
            self.session.record_change(path, String::new());
        }
        self.session.last_diff = None;
        info!(directory, files = changed.len(), "resumed session with pending changes");
    }

    /// One-line summary of session state appended to every result.
    pub fn status_line(&self) -> String {
        let scope = self.session.current_directory.as_deref().unwrap_or("(none)");
        let mut line = format!(
            "[scope: {scope} | pending files: {} | completed this session: {}",
            self.session.changed_files.len(),
            self.session.directories_completed
        );
        if self.session.last_build_failed {
            line.push_str(" | last build FAILED");
        }
        if let Some(cursor) = &self.cursor {
            line.push_str(&format!(
                " | reading {} chunk {}/{}",
                cursor.path,
                cursor.index + 1,
                cursor.chunks.len()
            ));
        }
        line.push(']');
        line
    }

    /// Apply one directive. Never fails: errors become [`Verdict::Failed`].
    #[instrument(skip_all, fields(action = directive.name(), target = directive.target().unwrap_or("")))]
    pub fn execute(&mut self, directive: Directive) -> ActionOutcome {
        let name = directive.name();
        let result = match directive {
            Directive::SetScope { directory } => self.set_scope(&directory),
            Directive::ReadFile { path } => self.read_file(&path),
            Directive::ListDir { path } => self.list_dir(path.as_deref()),
            Directive::FindFile { pattern } => self.find_file(&pattern),
            Directive::Grep { pattern } => self.grep(&pattern),
            Directive::EditFile {
                path,
                old_text,
                new_text,
            } => self.edit_file(&path, &old_text, &new_text),
            Directive::WriteFile { path, content } => self.write_file(&path, &content),
            Directive::NextChunk => Ok(self.next_chunk()),
            Directive::SkipFile => Ok(self.skip_file()),
            Directive::Build => self.build(),
            Directive::Halt { reason } => Ok(self.halt(reason.as_deref())),
        };
        match result {
            Ok(outcome) => {
                debug!(verdict = outcome.verdict.as_str(), "directive executed");
                outcome
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "directive failed");
                ActionOutcome::failed(format!("{name} failed: {err:#}"))
            }
        }
    }

    fn set_scope(&mut self, directory: &str) -> Result<ActionOutcome> {
        let (rel, abs) = match resolve(&self.root, directory) {
            Ok(resolved) => resolved,
            Err(err) => return Ok(path_rejection(&err)),
        };
        if rel.is_empty() {
            return Ok(ActionOutcome::rejected(
                "SET_SCOPE needs a directory below the source root, not the root itself.",
            ));
        }
        if !abs.is_dir() {
            return Ok(ActionOutcome::rejected(format!(
                "{rel} is not a directory. Use LIST_DIR or FIND_FILE to locate it."
            )));
        }
        if let Some(rejection) = self.escape_check(&rel, &abs) {
            return Ok(rejection);
        }

        match evaluate_scope_change(&self.session, &rel) {
            ScopeChange::Unchanged => Ok(ActionOutcome::applied(format!(
                "Scope is already {rel}.\n\n{}",
                self.render_file_list()
            ))),
            ScopeChange::Blocked { current } => {
                info!(current = %current, requested = %rel, "scope change blocked by pending changes");
                Ok(ActionOutcome::rejected(format!(
                    "Cannot change scope to {rel}: {current} has unbuilt changes in {}.\n\
                     Run BUILD to verify and commit them first. If the build fails, fix the \
                     errors; scope changes stay blocked until a build passes.",
                    self.session.changed_files.join(", ")
                )))
            }
            ScopeChange::Allowed => {
                let files = self.list_scope_files(&rel)?;
                self.session.enter_scope(&rel, files);
                self.cursor = None;
                let mut notes = String::new();
                if self.index.contains(&rel) {
                    if let Err(err) = self.index.set_current(&rel) {
                        warn!(err = %format!("{err:#}"), "failed to persist index");
                    }
                } else {
                    notes.push_str(&format!(
                        "Note: {rel} is not tracked in the review index; completing it will not advance the index.\n"
                    ));
                }
                info!(directory = %rel, "scope set");
                Ok(ActionOutcome::applied(format!(
                    "Scope set to {rel}.\n{notes}\n{}\n\nNext: READ_FILE each file and fix what you find.",
                    self.render_file_list()
                )))
            }
        }
    }

    fn read_file(&mut self, path: &str) -> Result<ActionOutcome> {
        let (rel, abs) = match resolve(&self.root, path) {
            Ok(resolved) => resolved,
            Err(err) => return Ok(path_rejection(&err)),
        };
        if !abs.is_file() {
            return Ok(ActionOutcome::rejected(format!(
                "File not found: {rel}. Use LIST_DIR or FIND_FILE to locate it."
            )));
        }
        if let Some(rejection) = self.escape_check(&rel, &abs) {
            return Ok(rejection);
        }

        self.cursor = None;
        self.session.clear_file();

        // A broken build needs the whole file in view, so chunking is skipped.
        let chunked = !self.session.last_build_failed && self.deps.chunker.should_chunk(&abs)?;
        if chunked {
            let chunks = self.deps.chunker.chunk_file(&abs)?;
            if chunks.len() > 1 {
                let total = chunks.len();
                self.session.current_file = Some(rel.clone());
                self.session.chunk_total = total;
                self.session.chunk_index = 1;
                let cursor = ChunkCursor {
                    path: rel,
                    chunks,
                    index: 0,
                };
                let message = render_chunk(&cursor);
                self.cursor = Some(cursor);
                return Ok(ActionOutcome::applied(message));
            }
        }

        let bytes = fs::read(&abs).with_context(|| format!("read {rel}"))?;
        let limit = self.cfg.session.max_read_bytes;
        let truncated = bytes.len() > limit;
        let shown = &bytes[..bytes.len().min(limit)];
        let text = String::from_utf8_lossy(shown);
        self.session.current_file = Some(rel.clone());
        let mut message = format!(
            "File {rel} ({} lines):\n```\n{}",
            text.lines().count(),
            text
        );
        if !message.ends_with('\n') {
            message.push('\n');
        }
        message.push_str("```\n");
        if truncated {
            message.push_str(&format!(
                "[truncated: showing {limit} of {} bytes]\n",
                bytes.len()
            ));
        }
        Ok(ActionOutcome::applied(message))
    }

    fn next_chunk(&mut self) -> ActionOutcome {
        let Some(cursor) = self.cursor.as_mut() else {
            return ActionOutcome::rejected(
                "No chunked file is being read. Use READ_FILE to open a file first.",
            );
        };
        cursor.index += 1;
        if cursor.index >= cursor.chunks.len() {
            let path = cursor.path.clone();
            let total = cursor.chunks.len();
            self.cursor = None;
            self.session.clear_file();
            return ActionOutcome::applied(format!(
                "Finished reading {path} ({total} chunks).\n\
                 Next: EDIT_FILE to fix what you found, READ_FILE another file in the scope, \
                 or BUILD when your changes are complete."
            ));
        }
        self.session.chunk_index = cursor.index + 1;
        ActionOutcome::applied(render_chunk(cursor))
    }

    fn skip_file(&mut self) -> ActionOutcome {
        let skipped = match self.cursor.take() {
            Some(cursor) => Some(cursor.path),
            None => self.session.current_file.clone(),
        };
        self.session.clear_file();
        match skipped {
            Some(path) => ActionOutcome::applied(format!(
                "Skipped the rest of {path}. Continue with another file or BUILD."
            )),
            None => ActionOutcome::rejected("No file is being read; nothing to skip."),
        }
    }

    fn list_dir(&mut self, path: Option<&str>) -> Result<ActionOutcome> {
        let target = path
            .map(str::to_string)
            .or_else(|| self.session.current_directory.clone());
        let (rel, abs) = match target.as_deref() {
            None | Some("") | Some(".") => (String::new(), self.root.clone()),
            Some(arg) => match resolve(&self.root, arg) {
                Ok(resolved) => resolved,
                Err(err) => return Ok(path_rejection(&err)),
            },
        };
        if !abs.is_dir() {
            return Ok(ActionOutcome::rejected(format!("{rel} is not a directory.")));
        }
        if let Some(rejection) = self.escape_check(&rel, &abs) {
            return Ok(rejection);
        }
        let mut entries: Vec<String> = Vec::new();
        for entry in fs::read_dir(&abs).with_context(|| format!("list {}", abs.display()))? {
            let entry = entry.with_context(|| format!("list {}", abs.display()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if rel.is_empty() && PROTECTED_DIRS.contains(&name.as_str()) {
                continue;
            }
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            entries.push(if is_dir { format!("{name}/") } else { name });
        }
        entries.sort();
        let shown = entries.len().min(self.cfg.session.max_search_results);
        let label = if rel.is_empty() { "." } else { rel.as_str() };
        let mut message = format!("{label}/ ({} entries):\n", entries.len());
        for entry in &entries[..shown] {
            message.push_str(&format!("  {entry}\n"));
        }
        if shown < entries.len() {
            message.push_str(&format!("  ... {} more\n", entries.len() - shown));
        }
        Ok(ActionOutcome::applied(message))
    }

    fn find_file(&mut self, pattern: &str) -> Result<ActionOutcome> {
        let Some(matcher) = file_pattern(pattern) else {
            return Ok(ActionOutcome::rejected(format!(
                "Invalid file pattern: {pattern}"
            )));
        };
        let match_path = pattern.contains('/');
        let (base_rel, base) = self.search_base();
        let limit = self.cfg.session.max_search_results;
        let mut hits = Vec::new();
        let mut more = false;
        for rel in self.walk_files(&base) {
            let candidate = if match_path {
                rel.as_str()
            } else {
                rel.rsplit('/').next().unwrap_or(&rel)
            };
            if matcher.matches_with(candidate, PATH_MATCH) {
                if hits.len() == limit {
                    more = true;
                    break;
                }
                hits.push(rel);
            }
        }
        let where_ = if base_rel.is_empty() { "." } else { base_rel.as_str() };
        if hits.is_empty() {
            return Ok(ActionOutcome::applied(format!(
                "No files matching {pattern} under {where_}."
            )));
        }
        let mut message = format!("Files matching {pattern} under {where_}:\n");
        for hit in &hits {
            message.push_str(&format!("  {hit}\n"));
        }
        if more {
            message.push_str(&format!("  (stopped after {limit} matches)\n"));
        }
        Ok(ActionOutcome::applied(message))
    }

    fn grep(&mut self, pattern: &str) -> Result<ActionOutcome> {
        let regex = match Regex::new(pattern) {
            Ok(re) => re,
            Err(_) => Regex::new(&regex::escape(pattern)).context("compile literal pattern")?,
        };
        let (base_rel, base) = self.search_base();
        let limit = self.cfg.session.max_search_results;
        let mut hits = Vec::new();
        let mut more = false;
        'files: for rel in self.walk_files(&base) {
            let abs = self.root.join(&rel);
            let too_big = fs::metadata(&abs).map(|m| m.len() > GREP_MAX_FILE_BYTES).unwrap_or(true);
            if too_big {
                continue;
            }
            let Ok(bytes) = fs::read(&abs) else {
                continue;
            };
            if bytes.iter().take(8192).any(|b| *b == 0) {
                continue;
            }
            let text = String::from_utf8_lossy(&bytes);
            for (lineno, line) in text.lines().enumerate() {
                if regex.is_match(line) {
                    if hits.len() == limit {
                        more = true;
                        break 'files;
                    }
                    hits.push(format!("{rel}:{}: {}", lineno + 1, line.trim_end()));
                }
            }
        }
        let where_ = if base_rel.is_empty() { "." } else { base_rel.as_str() };
        if hits.is_empty() {
            return Ok(ActionOutcome::applied(format!(
                "No matches for {pattern} under {where_}."
            )));
        }
        let mut message = format!("Matches for {pattern} under {where_}:\n");
        for hit in &hits {
            message.push_str(hit);
            message.push('\n');
        }
        if more {
            message.push_str(&format!("(stopped after {limit} matches)\n"));
        }
        Ok(ActionOutcome::applied(message))
    }

    fn edit_file(&mut self, path: &str, old_text: &str, new_text: &str) -> Result<ActionOutcome> {
        let (rel, abs) = match resolve(&self.root, path) {
            Ok(resolved) => resolved,
            Err(err) => return Ok(path_rejection(&err)),
        };
        if !abs.is_file() {
            return Ok(ActionOutcome::rejected(format!(
                "File not found: {rel}. Use WRITE_FILE to create new files."
            )));
        }
        if let Some(rejection) = self.escape_check(&rel, &abs) {
            return Ok(rejection);
        }
        match self.editor.edit_file(&rel, old_text, new_text) {
            Ok(diff) => Ok(self.record_edit(&rel, diff, "Edit applied")),
            Err(EditError::NotFound { .. }) => Ok(ActionOutcome::rejected(format!(
                "OLD text not found in {rel}; the file is unchanged.\n\
                 READ_FILE {rel} again and copy the exact text, including tabs and trailing spaces."
            ))),
            Err(EditError::Ambiguous { count, .. }) => Ok(ActionOutcome::rejected(format!(
                "OLD text occurs {count} times in {rel}; the file is unchanged.\n\
                 Include more surrounding lines so the OLD block matches exactly one place."
            ))),
            Err(err @ EditError::Io { .. }) => Err(err.into()),
        }
    }

    fn write_file(&mut self, path: &str, content: &str) -> Result<ActionOutcome> {
        let (rel, abs) = match resolve(&self.root, path) {
            Ok(resolved) => resolved,
            Err(err) => return Ok(path_rejection(&err)),
        };
        if rel.is_empty() || abs.is_dir() {
            return Ok(ActionOutcome::rejected(format!(
                "WRITE_FILE needs a file path; {path} is a directory."
            )));
        }
        if let Some(rejection) = self.escape_check(&rel, &abs) {
            return Ok(rejection);
        }
        let mut body = content.to_string();
        if !body.is_empty() && !body.ends_with('\n') {
            body.push('\n');
        }
        let diff = self.editor.write_file(&rel, &body)?;
        Ok(self.record_edit(&rel, diff, "File written"))
    }

    fn record_edit(&mut self, rel: &str, diff: String, verb: &str) -> ActionOutcome {
        let mut notes = String::new();
        if self.session.current_directory.is_none()
            && !self.session.pending_changes
            && let Some(scope) = derive_scope(rel, self.policy.auto_scope_depth)
        {
            let files = self.list_scope_files(&scope).unwrap_or_default();
            self.session.enter_scope(&scope, files);
            if self.index.contains(&scope)
                && let Err(err) = self.index.set_current(&scope)
            {
                warn!(err = %format!("{err:#}"), "failed to persist index");
            }
            info!(scope = %scope, "scope derived from first edit");
            notes.push_str(&format!("Scope automatically set to {scope}.\n"));
        }
        if let Some(scope) = self.session.current_directory.as_deref()
            && !is_within(rel, scope)
        {
            notes.push_str(&format!(
                "Note: {rel} is outside the scope {scope}; it will be committed with it.\n"
            ));
        }
        self.session.record_change(rel, diff.clone());
        info!(file = rel, pending = self.session.changed_files.len(), "change recorded");
        ActionOutcome::applied(format!(
            "{verb}: {rel}\n{notes}```diff\n{diff}```\n\
             Check the diff. Continue editing, or BUILD to verify and commit."
        ))
    }

    fn build(&mut self) -> Result<ActionOutcome> {
        let mut preface = String::new();
        if !self.session.pending_changes {
            warn!("BUILD requested with no pending changes");
            preface.push_str("Note: there were no pending changes to build.\n");
        }
        let result = self.deps.build.run_build()?;
        if result.success {
            self.build_succeeded(&result, preface)
        } else {
            self.build_failed(&result, preface)
        }
    }

    fn build_failed(&mut self, result: &BuildResult, preface: String) -> Result<ActionOutcome> {
        self.session.record_build_failure();
        let directory = self
            .session
            .current_directory
            .clone()
            .unwrap_or_else(|| ".".to_string());
        info!(
            directory = %directory,
            errors = result.errors.len(),
            failures = self.session.failures_since_success,
            "build failed"
        );
        if let Some(lesson) = derive_lesson(&directory, result, Local::now().date_naive())
            && let Err(err) = self.lessons.append(&lesson)
        {
            warn!(err = %format!("{err:#}"), "failed to record lesson");
        }
        let report = result.report(self.cfg.build.max_reported_errors);
        let recovery = self.prompts.recovery(
            &directory,
            &report,
            &result.error_files(),
            self.session.failures_since_success,
        )?;
        Ok(ActionOutcome::failed(format!("{preface}{recovery}")))
    }

    fn build_succeeded(&mut self, result: &BuildResult, preface: String) -> Result<ActionOutcome> {
        let report = result.report(self.cfg.build.max_reported_errors);
        let Some(directory) = self.session.current_directory.clone() else {
            if !self.session.pending_changes {
                self.session.last_build_failed = false;
                self.session.failures_since_success = 0;
                return Ok(ActionOutcome::applied(format!(
                    "{preface}{report}No scope is set, so nothing was committed. Use SET_SCOPE to pick a directory."
                )));
            }
            return self.commit_scope(".", &report, preface);
        };
        self.commit_scope(&directory, &report, preface)
    }

    /// Commit the verified work of `directory`, mark it done, and push.
    fn commit_scope(&mut self, directory: &str, report: &str, preface: String) -> Result<ActionOutcome> {
        let files = self.session.changed_files.clone();
        self.git.add_all()?;
        let diff = self.git.staged_diff()?;
        let (subject, message) = self.commit_message(directory, &diff, files.len());

        // Bookkeeping is written before the commit so it lands in it; keep
        // what was there to roll back to if the commit fails.
        let index_before = self.index.state().clone();
        let progress_before = self.progress.snapshot()?;
        let tracked = self.index.contains(directory);
        if tracked
            && let Err(err) = self.index.mark_done(directory, &subject)
        {
            warn!(err = %format!("{err:#}"), "failed to persist index");
        }
        let entry = ProgressEntry {
            date: Local::now().date_naive(),
            directory: directory.to_string(),
            subject: subject.clone(),
            files: files.clone(),
            failed_builds: self.session.failures_since_success,
        };
        if let Err(err) = self.progress.append(&entry) {
            warn!(err = %format!("{err:#}"), "failed to append progress entry");
        }
        self.git.add_all()?;

        let outcome = self.git.commit(&message)?;
        let nothing_to_commit = !outcome.ok && files.is_empty() && !self.git.has_staged_changes()?;
        if !outcome.ok && !nothing_to_commit {
            if let Err(err) = self.index.restore(index_before) {
                warn!(err = %format!("{err:#}"), "failed to restore index");
            }
            if let Err(err) = self.progress.restore(progress_before.as_deref()) {
                warn!(err = %format!("{err:#}"), "failed to restore progress log");
            }
            self.session.last_build_failed = false;
            return Ok(ActionOutcome::failed(format!(
                "{preface}{report}The build passed but the commit failed; your changes are still pending.\n{}",
                outcome.output
            )));
        }

        let push_note = if outcome.ok && self.cfg.git.push {
            self.push()
        } else {
            String::new()
        };

        self.session.mark_committed();
        if directory == "." {
            self.session.clear_file();
        } else {
            self.session.complete_directory(directory);
        }
        self.cursor = None;
        info!(
            directory,
            files = files.len(),
            completed = self.session.directories_completed,
            "directory completed"
        );

        let mut text = format!("{preface}{report}");
        if outcome.ok {
            text.push_str(&format!("Committed: {}\n", first_line(&message)));
        } else {
            text.push_str("No changes needed committing.\n");
        }
        text.push_str(&push_note);
        if directory != "." {
            text.push_str(&format!(
                "{directory} is complete ({} directories completed this session).\n",
                self.session.directories_completed
            ));
        }
        match self.index.get_next_pending() {
            Some(next) => text.push_str(&format!(
                "Next pending directory: {next}\nContinue with: ACTION: SET_SCOPE {next}\n"
            )),
            None => text.push_str("No directories are pending review. You may HALT.\n"),
        }
        Ok(ActionOutcome::applied(text))
    }

    fn push(&self) -> String {
        let branch = match &self.cfg.git.branch {
            Some(branch) => branch.clone(),
            None => match self.git.current_branch() {
                Ok(branch) => branch,
                Err(err) => {
                    warn!(err = %format!("{err:#}"), "cannot determine branch to push");
                    return format!("Push skipped: {err:#}\n");
                }
            },
        };
        match self.git.push_with_retry(&self.cfg.git.remote, &branch) {
            Ok(PushOutcome::Pushed) => format!("Pushed to {}/{branch}.\n", self.cfg.git.remote),
            Ok(PushOutcome::PushedAfterRebase) => format!(
                "Pushed to {}/{branch} after rebasing onto the remote.\n",
                self.cfg.git.remote
            ),
            Ok(PushOutcome::Failed { output }) => {
                warn!(output = %output, "push failed after retry");
                "Push failed twice; the commit is kept locally and will go out with the next push.\n"
                    .to_string()
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "push errored");
                format!("Push failed: {err:#}. The commit is kept locally.\n")
            }
        }
    }

    /// Build the commit message. Returns the bare subject and the full message.
    fn commit_message(&self, directory: &str, diff: &str, file_count: usize) -> (String, String) {
        let fallback = format!("review fixes ({file_count} files)");
        let generated = if self.cfg.git.model_commit_messages && !diff.trim().is_empty() {
            self.generate_commit_text(directory, diff)
        } else {
            None
        };
        let (subject, body) = match generated {
            Some((subject, body)) => (subject, body),
            None => (fallback, None),
        };
        let mut message = format!("{directory}: {subject}");
        if let Some(body) = body {
            message.push_str("\n\n");
            message.push_str(&body);
        }
        (subject, message)
    }

    fn generate_commit_text(&self, directory: &str, diff: &str) -> Option<(String, Option<String>)> {
        let prompt = match self.prompts.commit_message(directory, diff) {
            Ok(prompt) => prompt,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "failed to render commit prompt");
                return None;
            }
        };
        let reply = match self.deps.chat.generate(&prompt) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(err = %err, "commit message generation failed; using fallback");
                return None;
            }
        };
        let mut lines = reply.lines().map(str::trim_end);
        let subject = lines.by_ref().map(str::trim).find(|l| !l.is_empty())?;
        let subject = subject.trim_matches(|c| c == '"' || c == '`' || c == '\'').trim();
        let subject = subject
            .strip_prefix(&format!("{directory}:"))
            .unwrap_or(subject)
            .trim();
        if subject.is_empty() {
            return None;
        }
        let body: Vec<&str> = lines.collect();
        let body = body.join("\n").trim().to_string();
        Some((subject.to_string(), (!body.is_empty()).then_some(body)))
    }

    fn halt(&mut self, reason: Option<&str>) -> ActionOutcome {
        let pending_dirs = self.index.has_pending();
        match evaluate_halt(&self.session, pending_dirs, &self.policy) {
            HaltDecision::Accept => {
                info!(reason = reason.unwrap_or(""), "halt accepted");
                ActionOutcome {
                    verdict: Verdict::Halt,
                    message: format!(
                        "Session halted after completing {} directories.",
                        self.session.directories_completed
                    ),
                }
            }
            HaltDecision::RejectUncommitted => ActionOutcome::rejected(format!(
                "HALT refused: unbuilt changes in {}. Run BUILD so they are verified and committed.",
                self.session.changed_files.join(", ")
            )),
            HaltDecision::RejectBuildFailed => ActionOutcome::rejected(
                "HALT refused: the last build failed. Fix the errors and BUILD until it passes.",
            ),
            HaltDecision::RejectNothingCompleted => ActionOutcome::rejected(format!(
                "HALT refused: no directory has been completed this session. Start with: ACTION: SET_SCOPE {}",
                self.index.get_next_pending().unwrap_or_default()
            )),
            HaltDecision::RejectBelowMinimum { completed, minimum } => {
                ActionOutcome::rejected(format!(
                    "HALT refused: only {completed} of at least {minimum} directories completed and more are pending. \
                     Continue with: ACTION: SET_SCOPE {}",
                    self.index.get_next_pending().unwrap_or_default()
                ))
            }
        }
    }

    /// Reject paths whose real location (after symlinks) leaves the root.
    fn escape_check(&self, rel: &str, abs: &Path) -> Option<ActionOutcome> {
        let mut existing = abs.to_path_buf();
        while !existing.exists() {
            if !existing.pop() {
                return None;
            }
        }
        match fs::canonicalize(&existing) {
            Ok(real) if real.starts_with(&self.canonical_root) => None,
            Ok(_) => Some(path_rejection(&PathError::Escapes(rel.to_string()))),
            Err(err) => Some(ActionOutcome::rejected(format!("Cannot resolve {rel}: {err}"))),
        }
    }

    /// Files directly inside `directory`, sorted, root-relative.
    fn list_scope_files(&self, directory: &str) -> Result<Vec<String>> {
        let abs = self.root.join(directory);
        let mut files = Vec::new();
        for entry in fs::read_dir(&abs).with_context(|| format!("list {}", abs.display()))? {
            let entry = entry.with_context(|| format!("list {}", abs.display()))?;
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                files.push(format!("{directory}/{}", entry.file_name().to_string_lossy()));
            }
        }
        files.sort();
        Ok(files)
    }

    fn render_file_list(&self) -> String {
        let files = &self.session.files_in_current_directory;
        if files.is_empty() {
            return "The directory has no files of its own; use LIST_DIR to explore it.".to_string();
        }
        let mut text = format!("Files ({}):\n", files.len());
        for file in files {
            text.push_str(&format!("  {file}\n"));
        }
        text
    }

    fn search_base(&self) -> (String, PathBuf) {
        match &self.session.current_directory {
            Some(dir) => (dir.clone(), self.root.join(dir)),
            None => (String::new(), self.root.clone()),
        }
    }

    /// Root-relative files under `base`, sorted, skipping tool and VCS metadata.
    fn walk_files(&self, base: &Path) -> Vec<String> {
        let root = &self.root;
        WalkDir::new(base)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                !(e.file_type().is_dir()
                    && e.file_name()
                        .to_str()
                        .is_some_and(|n| n == ".git" || n == TOOL_DIR))
            })
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                e.path()
                    .strip_prefix(root)
                    .ok()
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
            })
            .collect()
    }
}

fn path_rejection(err: &PathError) -> ActionOutcome {
    ActionOutcome::rejected(format!(
        "Invalid path: {err}. Paths must be relative to the source root and stay inside it."
    ))
}

fn render_chunk(cursor: &ChunkCursor) -> String {
    let chunk = &cursor.chunks[cursor.index];
    let total = cursor.chunks.len();
    let name = chunk
        .name
        .as_deref()
        .map(|n| format!(", {n}()"))
        .unwrap_or_default();
    let mut text = format!(
        "File {}, chunk {} of {} (lines {}-{}{name}):\n```\n{}```\n",
        cursor.path,
        cursor.index + 1,
        total,
        chunk.start_line,
        chunk.end_line,
        chunk.content
    );
    if cursor.index + 1 < total {
        text.push_str("ACTION: NEXT_CHUNK shows the next chunk; SKIP_FILE stops reading this file.\n");
    } else {
        text.push_str("This is the last chunk. ACTION: NEXT_CHUNK finishes the file.\n");
    }
    text
}

fn is_within(path: &str, directory: &str) -> bool {
    directory == "." || path.strip_prefix(directory).is_some_and(|rest| rest.starts_with('/'))
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

/// `*` and `?` stay inside one path segment; `**` crosses segments.
const PATH_MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Compile a FIND_FILE pattern. Blank or malformed patterns yield `None`.
fn file_pattern(pattern: &str) -> Option<Pattern> {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return None;
    }
    Pattern::new(pattern).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_pattern_matches_names_and_paths() {
        let matches = |pattern: &str, candidate: &str| {
            file_pattern(pattern)
                .unwrap()
                .matches_with(candidate, PATH_MATCH)
        };
        assert!(matches("*.c", "cat.c"));
        assert!(!matches("*.c", "cat.h"));
        assert!(!matches("*.c", "cat.cc"));
        assert!(matches("ca?.?", "cat.c"));
        assert!(matches("*.[ch]", "cat.h"));
        assert!(matches("bin/*/cat.c", "bin/cat/cat.c"));
        assert!(!matches("bin/*.c", "bin/cat/cat.c"));
        assert!(matches("bin/**/*.c", "bin/cat/cat.c"));
    }

    #[test]
    fn malformed_file_patterns_are_refused() {
        assert!(file_pattern("").is_none());
        assert!(file_pattern("   ").is_none());
        assert!(file_pattern("[unclosed").is_none());
        assert!(file_pattern("a***b").is_none());
    }

    #[test]
    fn within_requires_segment_boundary() {
        assert!(is_within("bin/cat/cat.c", "bin/cat"));
        assert!(!is_within("bin/catalog/x.c", "bin/cat"));
        assert!(is_within("anything", "."));
    }
}
