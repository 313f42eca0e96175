//! Directive parsing for the `ACTION:` wire protocol.
//!
//! The model answers in free text. Somewhere in that text it must emit one line
//! of the form `ACTION: <NAME> <argument>`, optionally followed by fenced
//! blocks:
//!
//! ```text
//! ACTION: EDIT_FILE sys/kern/kern_exit.c
//! OLD:
//! <<<
//! 	error = 0;
//! >>>
//! NEW:
//! <<<
//! 	error = EINVAL;
//! >>>
//! ```
//!
//! Only the *last* `ACTION:` line counts. Block contents are taken verbatim
//! between the fence lines, tabs included.

use std::sync::LazyLock;

use regex::Regex;

static ACTION_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*ACTION:[ \t]*(\S+)[ \t]*(.*?)[ \t]*\r?$").expect("action regex")
});

/// One structured action extracted from a model response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    SetScope { directory: String },
    ReadFile { path: String },
    ListDir { path: Option<String> },
    FindFile { pattern: String },
    Grep { pattern: String },
    EditFile {
        path: String,
        old_text: String,
        new_text: String,
    },
    WriteFile { path: String, content: String },
    NextChunk,
    SkipFile,
    Build,
    Halt { reason: Option<String> },
}

impl Directive {
    /// Wire name of the action.
    pub fn name(&self) -> &'static str {
        match self {
            Directive::SetScope { .. } => "SET_SCOPE",
            Directive::ReadFile { .. } => "READ_FILE",
            Directive::ListDir { .. } => "LIST_DIR",
            Directive::FindFile { .. } => "FIND_FILE",
            Directive::Grep { .. } => "GREP",
            Directive::EditFile { .. } => "EDIT_FILE",
            Directive::WriteFile { .. } => "WRITE_FILE",
            Directive::NextChunk => "NEXT_CHUNK",
            Directive::SkipFile => "SKIP_FILE",
            Directive::Build => "BUILD",
            Directive::Halt { .. } => "HALT",
        }
    }

    /// Short argument summary for logs and transcripts.
    pub fn target(&self) -> Option<&str> {
        match self {
            Directive::SetScope { directory } => Some(directory),
            Directive::ReadFile { path }
            | Directive::EditFile { path, .. }
            | Directive::WriteFile { path, .. } => Some(path),
            Directive::ListDir { path } => path.as_deref(),
            Directive::FindFile { pattern } | Directive::Grep { pattern } => Some(pattern),
            Directive::Halt { reason } => reason.as_deref(),
            Directive::NextChunk | Directive::SkipFile | Directive::Build => None,
        }
    }
}

/// Result of scanning one model response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    Directive(Directive),
    /// No `ACTION:` line at all. Recoverable by re-prompting.
    NoDirective,
    /// An `ACTION:` line was found but its shape is wrong.
    Malformed { action: String, reason: String },
}

/// Extract the directive from raw model output.
pub fn parse_response(text: &str) -> ParseOutcome {
    let Some(caps) = ACTION_LINE_RE.captures_iter(text).last() else {
        return ParseOutcome::NoDirective;
    };
    let whole = caps.get(0).map_or(0..0, |m| m.range());
    let name = caps.get(1).map_or("", |m| m.as_str());
    let argument = caps.get(2).map_or("", |m| m.as_str());
    let body = &text[whole.end..];
    decode(name, argument, body)
}

fn decode(name: &str, argument: &str, body: &str) -> ParseOutcome {
    let malformed = |reason: &str| ParseOutcome::Malformed {
        action: name.to_string(),
        reason: reason.to_string(),
    };
    let path_arg = normalize_path_arg(argument);

    let directive = match name {
        "SET_SCOPE" => match path_arg {
            Some(directory) => Directive::SetScope { directory },
            None => return malformed("SET_SCOPE needs a directory argument"),
        },
        "READ_FILE" => match path_arg {
            Some(path) => Directive::ReadFile { path },
            None => return malformed("READ_FILE needs a file path argument"),
        },
        "LIST_DIR" => Directive::ListDir { path: path_arg },
        "FIND_FILE" => match non_empty(argument) {
            Some(pattern) => Directive::FindFile { pattern },
            None => return malformed("FIND_FILE needs a file name pattern"),
        },
        "GREP" => match non_empty(argument) {
            Some(pattern) => Directive::Grep { pattern },
            None => return malformed("GREP needs a search pattern"),
        },
        "EDIT_FILE" => {
            let Some(path) = path_arg else {
                return malformed("EDIT_FILE needs a file path argument");
            };
            let Some((old_text, after_old)) = fenced_block(body, "OLD:") else {
                return malformed("EDIT_FILE needs an OLD: block fenced by <<< and >>> lines");
            };
            let Some((new_text, _)) = fenced_block(&body[after_old..], "NEW:") else {
                return malformed(
                    "EDIT_FILE needs a NEW: block fenced by <<< and >>> lines after the OLD: block",
                );
            };
            if old_text.is_empty() {
                return malformed("EDIT_FILE OLD: block is empty; copy the exact text to replace");
            }
            Directive::EditFile {
                path,
                old_text,
                new_text,
            }
        }
        "WRITE_FILE" => {
            let Some(path) = path_arg else {
                return malformed("WRITE_FILE needs a file path argument");
            };
            let Some((content, _)) = fenced_block(body, "CONTENT:") else {
                return malformed("WRITE_FILE needs a CONTENT: block fenced by <<< and >>> lines");
            };
            Directive::WriteFile { path, content }
        }
        "NEXT_CHUNK" => Directive::NextChunk,
        "SKIP_FILE" => Directive::SkipFile,
        "BUILD" => Directive::Build,
        "HALT" => Directive::Halt {
            reason: non_empty(argument),
        },
        _ => return malformed("unknown action name (names are uppercase, e.g. READ_FILE)"),
    };
    ParseOutcome::Directive(directive)
}

fn non_empty(argument: &str) -> Option<String> {
    let trimmed = argument.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Trim whitespace and a leading `./` from a path argument.
fn normalize_path_arg(argument: &str) -> Option<String> {
    let mut trimmed = argument.trim();
    while let Some(rest) = trimmed.strip_prefix("./") {
        trimmed = rest;
    }
    non_empty(trimmed)
}

/// Find `label` followed by a `<<<` ... `>>>` fenced block.
///
/// Returns the verbatim block content (without the final newline before
/// `>>>`) and the byte offset just past the closing fence.
fn fenced_block(body: &str, label: &str) -> Option<(String, usize)> {
    let label_at = find_line_start(body, label)?;
    let mut pos = label_at + label.len();

    // `<<<` may follow the label on the same line or on a later line.
    let rest = &body[pos..];
    let skipped = rest.len() - rest.trim_start().len();
    pos += skipped;
    if !body[pos..].starts_with("<<<") {
        return None;
    }
    pos += 3;
    let line_end = body[pos..].find('\n')?;
    if !body[pos..pos + line_end].trim().is_empty() {
        return None;
    }
    let content_start = pos + line_end + 1;

    let mut line_start = content_start;
    loop {
        let line_len = body[line_start..].find('\n');
        let line = match line_len {
            Some(len) => &body[line_start..line_start + len],
            None => &body[line_start..],
        };
        if line.trim_end() == ">>>" {
            let content_end = if line_start == content_start {
                content_start
            } else {
                line_start - 1
            };
            let content = &body[content_start..content_end];
            let content = content.strip_suffix('\r').unwrap_or(content);
            let after = line_start + line.len();
            return Some((content.to_string(), after));
        }
        match line_len {
            Some(len) => line_start += len + 1,
            None => return None,
        }
    }
}

/// Byte offset of the first line that starts (after indentation) with `label`.
fn find_line_start(body: &str, label: &str) -> Option<usize> {
    let mut offset = 0;
    for line in body.split_inclusive('\n') {
        let indent = line.len() - line.trim_start_matches([' ', '\t']).len();
        if line[indent..].starts_with(label) {
            return Some(offset + indent);
        }
        offset += line.len();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directive(text: &str) -> Directive {
        match parse_response(text) {
            ParseOutcome::Directive(d) => d,
            other => panic!("expected directive, got {other:?}"),
        }
    }

    #[test]
    fn missing_action_line_is_no_directive() {
        assert_eq!(
            parse_response("I think we should look at bin/ls first."),
            ParseOutcome::NoDirective
        );
    }

    #[test]
    fn last_action_line_wins() {
        let text = "Maybe ACTION: BUILD? No.\nACTION: READ_FILE bin/ls/ls.c\nthinking...\nACTION: SET_SCOPE ./bin/ls\n";
        assert_eq!(
            directive(text),
            Directive::SetScope {
                directory: "bin/ls".to_string()
            }
        );
    }

    #[test]
    fn argument_is_trimmed_and_dot_slash_stripped() {
        assert_eq!(
            directive("ACTION: READ_FILE    ./sys/kern/kern_exit.c   "),
            Directive::ReadFile {
                path: "sys/kern/kern_exit.c".to_string()
            }
        );
    }

    #[test]
    fn lowercase_action_names_are_rejected() {
        let outcome = parse_response("ACTION: read_file foo.c");
        assert!(matches!(
            outcome,
            ParseOutcome::Malformed { ref action, .. } if action == "read_file"
        ));
    }

    #[test]
    fn edit_blocks_keep_tabs_and_inner_whitespace() {
        let text = "Fixing the check.\nACTION: EDIT_FILE bin/cat/cat.c\nOLD:\n<<<\n\tif (fd < 0)\n\t\treturn;\n>>>\nNEW:\n<<<\n\tif (fd < 0) {\n\t\twarn(\"open\");\n\t\treturn;\n\t}\n>>>\n";
        assert_eq!(
            directive(text),
            Directive::EditFile {
                path: "bin/cat/cat.c".to_string(),
                old_text: "\tif (fd < 0)\n\t\treturn;".to_string(),
                new_text: "\tif (fd < 0) {\n\t\twarn(\"open\");\n\t\treturn;\n\t}".to_string(),
            }
        );
    }

    #[test]
    fn empty_new_block_means_deletion() {
        let text = "ACTION: EDIT_FILE a.c\nOLD:\n<<<\nunused();\n>>>\nNEW:\n<<<\n>>>\n";
        assert_eq!(
            directive(text),
            Directive::EditFile {
                path: "a.c".to_string(),
                old_text: "unused();".to_string(),
                new_text: String::new(),
            }
        );
    }

    #[test]
    fn fence_may_follow_label_on_same_line() {
        let text = "ACTION: WRITE_FILE lib/x/README\nCONTENT: <<<\nhello\n>>>";
        assert_eq!(
            directive(text),
            Directive::WriteFile {
                path: "lib/x/README".to_string(),
                content: "hello".to_string(),
            }
        );
    }

    #[test]
    fn edit_without_fences_is_malformed() {
        let text = "ACTION: EDIT_FILE a.c\nOLD: foo\nNEW: bar\n";
        let outcome = parse_response(text);
        assert!(matches!(
            outcome,
            ParseOutcome::Malformed { ref reason, .. } if reason.contains("OLD:")
        ));
    }

    #[test]
    fn unterminated_block_is_malformed() {
        let text = "ACTION: EDIT_FILE a.c\nOLD:\n<<<\nfoo\nNEW:\n<<<\nbar\n";
        assert!(matches!(parse_response(text), ParseOutcome::Malformed { .. }));
    }

    #[test]
    fn halt_reason_is_optional() {
        assert_eq!(directive("ACTION: HALT"), Directive::Halt { reason: None });
        assert_eq!(
            directive("ACTION: HALT all done"),
            Directive::Halt {
                reason: Some("all done".to_string())
            }
        );
    }

    #[test]
    fn scope_without_argument_is_malformed() {
        assert!(matches!(
            parse_response("ACTION: SET_SCOPE   "),
            ParseOutcome::Malformed { .. }
        ));
    }
}
