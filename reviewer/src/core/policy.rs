//! Guardrails the loop enforces on the model's directives.
//!
//! All decisions here are pure functions of session state so they can be
//! checked exhaustively in tests.

use crate::core::session::ReviewSession;

/// Tunable thresholds for halt and auto-scope decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyParams {
    /// HALT is refused while fewer directories were completed and work remains.
    pub min_directories_before_halt: u32,
    /// Number of leading path segments used to derive a scope from an edit.
    pub auto_scope_depth: usize,
}

impl Default for PolicyParams {
    fn default() -> Self {
        Self {
            min_directories_before_halt: 3,
            auto_scope_depth: 2,
        }
    }
}

/// Outcome of evaluating a HALT directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltDecision {
    Accept,
    RejectUncommitted,
    RejectBuildFailed,
    RejectNothingCompleted,
    RejectBelowMinimum { completed: u32, minimum: u32 },
}

/// Decide whether HALT may end the session.
///
/// `pending_directories` is true when the index still has reviewable
/// directories with status `pending`.
pub fn evaluate_halt(
    session: &ReviewSession,
    pending_directories: bool,
    params: &PolicyParams,
) -> HaltDecision {
    if session.pending_changes {
        return HaltDecision::RejectUncommitted;
    }
    if session.last_build_failed {
        return HaltDecision::RejectBuildFailed;
    }
    if session.directories_completed == 0 && pending_directories {
        return HaltDecision::RejectNothingCompleted;
    }
    if session.directories_completed < params.min_directories_before_halt && pending_directories {
        return HaltDecision::RejectBelowMinimum {
            completed: session.directories_completed,
            minimum: params.min_directories_before_halt,
        };
    }
    HaltDecision::Accept
}

/// Outcome of evaluating a SET_SCOPE directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeChange {
    /// Target is already the current scope.
    Unchanged,
    Allowed,
    /// Uncommitted edits in `current` must be built first.
    Blocked { current: String },
}

pub fn evaluate_scope_change(session: &ReviewSession, target: &str) -> ScopeChange {
    match session.current_directory.as_deref() {
        Some(current) if current == target => ScopeChange::Unchanged,
        Some(current) if session.pending_changes => ScopeChange::Blocked {
            current: current.to_string(),
        },
        None if session.pending_changes => ScopeChange::Blocked {
            current: "(unscoped edits)".to_string(),
        },
        _ => ScopeChange::Allowed,
    }
}

/// Derive a scope directory from an edited file path.
///
/// Takes the first `depth` segments of the file's directory. A file shallower
/// than that yields its parent directory; a top-level file yields `None`.
pub fn derive_scope(file_path: &str, depth: usize) -> Option<String> {
    let segments: Vec<&str> = file_path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < 2 || depth == 0 {
        return None;
    }
    let dir_segments = &segments[..segments.len() - 1];
    let take = depth.min(dir_segments.len());
    Some(dir_segments[..take].join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn session(pending: bool, failed: bool, completed: u32) -> ReviewSession {
        let mut s = ReviewSession::new(Utc::now());
        s.pending_changes = pending;
        s.last_build_failed = failed;
        s.directories_completed = completed;
        s
    }

    #[test]
    fn halt_matches_gating_formula_exhaustively() {
        let params = PolicyParams::default();
        for pending in [false, true] {
            for failed in [false, true] {
                for completed in 0..5u32 {
                    for pending_dirs in [false, true] {
                        let s = session(pending, failed, completed);
                        let expected = !pending
                            && !failed
                            && (completed > 0 || !pending_dirs)
                            && !(completed < 3 && pending_dirs);
                        let accepted =
                            evaluate_halt(&s, pending_dirs, &params) == HaltDecision::Accept;
                        assert_eq!(
                            accepted, expected,
                            "pending={pending} failed={failed} completed={completed} pending_dirs={pending_dirs}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn halt_rejections_are_specific() {
        let params = PolicyParams::default();
        assert_eq!(
            evaluate_halt(&session(true, true, 0), true, &params),
            HaltDecision::RejectUncommitted
        );
        assert_eq!(
            evaluate_halt(&session(false, true, 5), false, &params),
            HaltDecision::RejectBuildFailed
        );
        assert_eq!(
            evaluate_halt(&session(false, false, 0), true, &params),
            HaltDecision::RejectNothingCompleted
        );
        assert_eq!(
            evaluate_halt(&session(false, false, 2), true, &params),
            HaltDecision::RejectBelowMinimum {
                completed: 2,
                minimum: 3
            }
        );
    }

    #[test]
    fn scope_change_blocked_while_dirty() {
        let mut s = session(true, false, 0);
        s.current_directory = Some("bin/cat".to_string());
        assert_eq!(evaluate_scope_change(&s, "bin/cat"), ScopeChange::Unchanged);
        assert_eq!(
            evaluate_scope_change(&s, "bin/ls"),
            ScopeChange::Blocked {
                current: "bin/cat".to_string()
            }
        );
        s.pending_changes = false;
        assert_eq!(evaluate_scope_change(&s, "bin/ls"), ScopeChange::Allowed);
    }

    #[test]
    fn derive_scope_uses_leading_segments() {
        assert_eq!(
            derive_scope("sys/kern/kern_exit.c", 2),
            Some("sys/kern".to_string())
        );
        assert_eq!(
            derive_scope("lib/libc/gen/err.c", 2),
            Some("lib/libc".to_string())
        );
        assert_eq!(derive_scope("bin/cat.c", 2), Some("bin".to_string()));
        assert_eq!(derive_scope("Makefile", 2), None);
    }
}
