//! The review loop: model query, parse, execute, feed back, repeat.

use std::path::Path;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::action::{Directive, ParseOutcome, parse_response};
use crate::core::history::{Conversation, Message};
use crate::core::scope::ScopeStatus;
use crate::executor::{ActionExecutor, ActionOutcome, Collaborators, Verdict};
use crate::io::build::BuildExecutor;
use crate::io::chat::ChatClient;
use crate::io::chunker::Chunker;
use crate::io::config::ReviewerConfig;
use crate::io::index::ScopeIndex;
use crate::io::journal::LessonLog;
use crate::io::layout::TOOL_DIR;
use crate::io::prompt::{OpeningContext, Prompts, ResumeContext, truncate_at_boundary};
use crate::io::transcript::{TurnObserver, TurnRecord};

/// Consecutive non-transport chat errors tolerated before giving up.
const MAX_CONSECUTIVE_CHAT_ERRORS: u32 = 3;

/// Bytes of pending diff shown when a session resumes unbuilt work.
const RESUME_DIFF_LIMIT: usize = 8_000;

/// Reason why [`ReviewLoop::run`] stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// The model issued a HALT that passed every guardrail.
    Halted { reason: Option<String> },
    /// The iteration budget ran out before an accepted HALT.
    IterationBudgetExhausted { iterations: u32 },
    /// The chat backend timed out, was unreachable, or kept failing.
    TransportFailure { error: String },
}

/// What an operator needs to pick up where the session left off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub session_id: String,
    pub iterations: u32,
    pub current_directory: Option<String>,
    pub completed_directories: Vec<String>,
    /// Files edited this session and not yet committed.
    pub changed_files: Vec<String>,
    /// Uncommitted paths according to `git status`.
    pub uncommitted_files: Vec<String>,
    pub build_failures: u32,
}

impl SessionReport {
    pub fn render(&self) -> String {
        let mut buf = format!(
            "session: {}\niterations: {}\nscope: {}\nbuild failures: {}\n",
            self.session_id,
            self.iterations,
            self.current_directory.as_deref().unwrap_or("(none)"),
            self.build_failures
        );
        push_list(&mut buf, "completed directories", &self.completed_directories);
        push_list(&mut buf, "unbuilt changes", &self.changed_files);
        push_list(&mut buf, "uncommitted files", &self.uncommitted_files);
        buf
    }
}

fn push_list(buf: &mut String, label: &str, items: &[String]) {
    if items.is_empty() {
        buf.push_str(&format!("{label}: (none)\n"));
        return;
    }
    buf.push_str(&format!("{label}:\n"));
    for item in items {
        buf.push_str(&format!("  - {item}\n"));
    }
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub stop: LoopStop,
    pub report: SessionReport,
}

/// Collaborators for a [`ReviewLoop`].
pub struct LoopDeps<'a, C: ?Sized, B: ?Sized, K: ?Sized, O: ?Sized> {
    pub chat: &'a C,
    pub build: &'a B,
    pub chunker: &'a K,
    pub observer: &'a O,
}

pub struct ReviewLoop<'a, C: ?Sized, B: ?Sized, K: ?Sized, O: ?Sized> {
    cfg: &'a ReviewerConfig,
    chat: &'a C,
    observer: &'a O,
    executor: ActionExecutor<'a, C, B, K>,
    prompts: Prompts,
    lessons: LessonLog,
}

impl<'a, C, B, K, O> ReviewLoop<'a, C, B, K, O>
where
    C: ChatClient + ?Sized,
    B: BuildExecutor + ?Sized,
    K: Chunker + ?Sized,
    O: TurnObserver + ?Sized,
{
    pub fn new(
        root: &Path,
        cfg: &'a ReviewerConfig,
        deps: LoopDeps<'a, C, B, K, O>,
        index: ScopeIndex,
    ) -> Result<Self> {
        let executor = ActionExecutor::new(
            root,
            cfg,
            Collaborators {
                chat: deps.chat,
                build: deps.build,
                chunker: deps.chunker,
            },
            index,
        )?;
        Ok(Self {
            cfg,
            chat: deps.chat,
            observer: deps.observer,
            executor,
            prompts: Prompts::new(),
            lessons: LessonLog::new(root.join(&cfg.logs.lessons_path)),
        })
    }

    pub fn executor(&self) -> &ActionExecutor<'a, C, B, K> {
        &self.executor
    }

    /// Drive the session until HALT, budget exhaustion or transport failure.
    ///
    /// Errors are returned only when the session cannot start at all.
    #[instrument(skip_all, fields(max_iterations = max_iterations))]
    pub fn run(&mut self, max_iterations: u32) -> Result<LoopOutcome> {
        let resume = self.detect_resume()?;
        if let Some(resume) = &resume {
            self.executor.resume(&resume.directory, &resume.files);
        }
        let opening = self.opening_context(resume)?;
        let system = self.prompts.system(self.cfg.session.min_directories_before_halt)?;
        let mut conversation = Conversation::new(system, self.prompts.opening(&opening)?);
        info!(
            session = %self.executor.session().session_id,
            next = opening.next_pending.as_deref().unwrap_or(""),
            "review session started"
        );

        let mut iterations = 0u32;
        let mut chat_errors = 0u32;
        while iterations < max_iterations {
            iterations += 1;
            let pruned = conversation.prune(
                self.cfg.session.max_history_messages,
                self.cfg.session.keep_recent_messages,
            );
            if pruned > 0 {
                debug!(pruned, "pruned conversation history");
            }

            let started_at = Utc::now();
            let started = Instant::now();
            let reply = match self.chat.chat(conversation.messages()) {
                Ok(reply) => {
                    chat_errors = 0;
                    reply
                }
                Err(err) if err.is_transport_failure() => {
                    warn!(err = %err, "chat transport failed; ending session");
                    return Ok(self.finish(LoopStop::TransportFailure {
                        error: err.to_string(),
                    }, iterations));
                }
                Err(err) => {
                    chat_errors += 1;
                    warn!(err = %err, chat_errors, "chat request failed");
                    if chat_errors >= MAX_CONSECUTIVE_CHAT_ERRORS {
                        return Ok(self.finish(
                            LoopStop::TransportFailure {
                                error: format!("{chat_errors} consecutive chat failures, last: {err}"),
                            },
                            iterations,
                        ));
                    }
                    continue;
                }
            };
            conversation.push(Message::assistant(reply.clone()));

            let mut halt_reason = None;
            let (action, target, outcome) = match parse_response(&reply) {
                ParseOutcome::Directive(directive) => {
                    let action = directive.name().to_string();
                    let target = directive.target().map(str::to_string);
                    if let Directive::Halt { reason } = &directive {
                        halt_reason = reason.clone();
                    }
                    (Some(action), target, self.executor.execute(directive))
                }
                ParseOutcome::NoDirective => (None, None, no_directive()),
                ParseOutcome::Malformed { action, reason } => {
                    let outcome = ActionOutcome::rejected(format!(
                        "Your ACTION line could not be used: {reason}\n{}",
                        protocol_reminder()
                    ));
                    (Some(action), None, outcome)
                }
            };
            debug!(
                iteration = iterations,
                action = action.as_deref().unwrap_or("-"),
                verdict = outcome.verdict.as_str(),
                "turn complete"
            );

            let session = self.executor.session();
            let record = TurnRecord {
                session_id: session.session_id.clone(),
                turn: iterations,
                action: action.clone(),
                target,
                verdict: outcome.verdict.as_str().to_string(),
                current_directory: session.current_directory.clone(),
                pending_changes: session.pending_changes,
                started_at: started_at.to_rfc3339(),
                duration_ms: started.elapsed().as_millis() as u64,
                response: reply,
                result: outcome.message.clone(),
            };
            if let Err(err) = self.observer.record(&record) {
                warn!(err = %format!("{err:#}"), "failed to record turn");
            }

            if outcome.verdict == Verdict::Halt {
                info!(iterations, "session halted");
                return Ok(self.finish(
                    LoopStop::Halted {
                        reason: halt_reason,
                    },
                    iterations,
                ));
            }

            let label = action.as_deref().unwrap_or("no action");
            conversation.push(Message::user(format!(
                "RESULT of {label} ({}):\n{}\n\n{}",
                outcome.verdict.as_str(),
                outcome.message.trim_end(),
                self.executor.status_line()
            )));
        }

        warn!(iterations, "iteration budget exhausted");
        Ok(self.finish(
            LoopStop::IterationBudgetExhausted { iterations },
            iterations,
        ))
    }

    /// Unbuilt edits from an earlier session, if the index still marks a
    /// directory current and the tree has changes outside the tool directory.
    fn detect_resume(&self) -> Result<Option<ResumeContext>> {
        let Some(directory) = self.executor.index().get_current() else {
            return Ok(None);
        };
        let git = self.executor.git();
        if !git.has_changes()? {
            return Ok(None);
        }
        let tool_prefix = format!("{TOOL_DIR}/");
        let files: Vec<String> = git
            .changed_files()?
            .into_iter()
            .filter(|p| !p.starts_with(&tool_prefix))
            .collect();
        if files.is_empty() {
            return Ok(None);
        }
        let diff = truncate_at_boundary(&git.diff_against_head(&files)?, RESUME_DIFF_LIMIT);
        Ok(Some(ResumeContext {
            directory,
            files,
            diff,
        }))
    }

    fn opening_context(&self, resume: Option<ResumeContext>) -> Result<OpeningContext> {
        let index = self.executor.index();
        let lessons = match self.lessons.recent(self.cfg.logs.lessons_in_prompt) {
            Ok(lessons) => lessons,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "failed to read lessons");
                Vec::new()
            }
        };
        Ok(OpeningContext {
            done: index.count(ScopeStatus::Done),
            pending: index.count(ScopeStatus::Pending),
            skipped: index.count(ScopeStatus::Skipped),
            current: index.get_current(),
            next_pending: index.get_next_pending(),
            lessons,
            resume,
        })
    }

    fn finish(&self, stop: LoopStop, iterations: u32) -> LoopOutcome {
        LoopOutcome {
            report: self.report(iterations),
            stop,
        }
    }

    fn report(&self, iterations: u32) -> SessionReport {
        let session = self.executor.session();
        let uncommitted_files = match self.executor.git().changed_files() {
            Ok(files) => files,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "failed to read git status for report");
                Vec::new()
            }
        };
        SessionReport {
            session_id: session.session_id.clone(),
            iterations,
            current_directory: session.current_directory.clone(),
            completed_directories: session.completed_directories.clone(),
            changed_files: session.changed_files.clone(),
            uncommitted_files,
            build_failures: session.build_failures,
        }
    }
}

fn no_directive() -> ActionOutcome {
    ActionOutcome::rejected(format!(
        "No ACTION line found in your reply.\n{}",
        protocol_reminder()
    ))
}

fn protocol_reminder() -> &'static str {
    "End every reply with exactly one line of the form `ACTION: <NAME> <argument>`, \
     for example `ACTION: READ_FILE bin/cat/cat.c`. Valid names: SET_SCOPE, READ_FILE, \
     LIST_DIR, FIND_FILE, GREP, EDIT_FILE, WRITE_FILE, NEXT_CHUNK, SKIP_FILE, BUILD, HALT. \
     EDIT_FILE needs OLD: and NEW: blocks and WRITE_FILE a CONTENT: block, each fenced by \
     lines containing only <<< and >>>."
}

