//! Post-mortems derived from failed builds.
//!
//! A lesson is a one-line note kept across sessions so later runs are less
//! likely to repeat the same breakage.

use chrono::NaiveDate;

use crate::core::types::BuildResult;

/// Broad class of a build failure, recognised from the first error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    UndeclaredIdentifier,
    ImplicitDeclaration,
    TypeMismatch,
    Syntax,
    UnusedOrShadowed,
    MissingHeader,
    Other,
}

impl FailureCategory {
    pub fn classify(message: &str) -> Self {
        let msg = message.to_ascii_lowercase();
        if msg.contains("undeclared") || msg.contains("not declared") {
            FailureCategory::UndeclaredIdentifier
        } else if msg.contains("implicit declaration") {
            FailureCategory::ImplicitDeclaration
        } else if msg.contains("incompatible")
            || msg.contains("conflicting types")
            || msg.contains("invalid conversion")
        {
            FailureCategory::TypeMismatch
        } else if msg.contains("expected") || msg.contains("syntax") {
            FailureCategory::Syntax
        } else if msg.contains("unused") || msg.contains("shadows") {
            FailureCategory::UnusedOrShadowed
        } else if msg.contains("file not found") || msg.contains("no such file") {
            FailureCategory::MissingHeader
        } else {
            FailureCategory::Other
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureCategory::UndeclaredIdentifier => "undeclared-identifier",
            FailureCategory::ImplicitDeclaration => "implicit-declaration",
            FailureCategory::TypeMismatch => "type-mismatch",
            FailureCategory::Syntax => "syntax",
            FailureCategory::UnusedOrShadowed => "unused-or-shadowed",
            FailureCategory::MissingHeader => "missing-header",
            FailureCategory::Other => "other",
        }
    }

    fn hint(self) -> &'static str {
        match self {
            FailureCategory::UndeclaredIdentifier => {
                "check that every identifier an edit introduces is declared or its header included"
            }
            FailureCategory::ImplicitDeclaration => {
                "add the prototype's header before calling a new function"
            }
            FailureCategory::TypeMismatch => {
                "read the callee's prototype before changing argument or return types"
            }
            FailureCategory::Syntax => "re-read the edited region; a brace or semicolon was lost",
            FailureCategory::UnusedOrShadowed => {
                "remove variables an edit leaves unused; warnings are errors in this tree"
            }
            FailureCategory::MissingHeader => "only include headers that exist in the tree",
            FailureCategory::Other => "read the full error context before editing again",
        }
    }
}

/// Structured note about one failed build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lesson {
    pub date: NaiveDate,
    pub directory: String,
    pub file: Option<String>,
    pub category: FailureCategory,
    pub message: String,
    pub hint: String,
}

impl Lesson {
    /// Render as one markdown bullet.
    pub fn render(&self) -> String {
        let location = match &self.file {
            Some(file) => format!("{} ({})", self.directory, file),
            None => self.directory.clone(),
        };
        format!(
            "- {} [{}] {}: {} -- {}",
            self.date.format("%Y-%m-%d"),
            self.category.as_str(),
            location,
            one_line(&self.message, 160),
            self.hint
        )
    }
}

/// Derive a lesson from a failed build, or `None` if the build passed.
pub fn derive_lesson(directory: &str, result: &BuildResult, date: NaiveDate) -> Option<Lesson> {
    if result.success {
        return None;
    }
    let first = result.errors.first();
    let message = match first {
        Some(err) => err.message.clone(),
        None => result
            .raw_output
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("build failed without output")
            .trim()
            .to_string(),
    };
    let category = FailureCategory::classify(&message);
    Some(Lesson {
        date,
        directory: directory.to_string(),
        file: first.map(|e| e.file_path.clone()),
        category,
        message,
        hint: category.hint().to_string(),
    })
}

fn one_line(text: &str, max_chars: usize) -> String {
    let flat: String = text
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let mut cut: String = flat.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Severity, StructuredError};

    fn failed(message: &str) -> BuildResult {
        BuildResult {
            success: false,
            return_code: 1,
            duration_seconds: 3.0,
            errors: vec![StructuredError {
                file_path: "bin/cat/cat.c".to_string(),
                line_number: 12,
                column: None,
                severity: Severity::Error,
                message: message.to_string(),
            }],
            warnings: Vec::new(),
            raw_output: String::new(),
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 5, 4).unwrap()
    }

    #[test]
    fn passing_build_yields_no_lesson() {
        let mut result = failed("x");
        result.success = true;
        assert!(derive_lesson("bin/cat", &result, day()).is_none());
    }

    #[test]
    fn lesson_classifies_first_error() {
        let lesson = derive_lesson(
            "bin/cat",
            &failed("use of undeclared identifier 'fdx'"),
            day(),
        )
        .expect("lesson");
        assert_eq!(lesson.category, FailureCategory::UndeclaredIdentifier);
        assert_eq!(lesson.file.as_deref(), Some("bin/cat/cat.c"));
        let line = lesson.render();
        assert!(line.starts_with("- 2026-05-04 [undeclared-identifier] bin/cat (bin/cat/cat.c):"));
    }

    #[test]
    fn lesson_without_structured_errors_uses_last_output_line() {
        let result = BuildResult {
            success: false,
            return_code: 2,
            duration_seconds: 0.1,
            errors: Vec::new(),
            warnings: Vec::new(),
            raw_output: "cc -c foo.c\n*** Error code 1\n\n".to_string(),
        };
        let lesson = derive_lesson("bin/ls", &result, day()).expect("lesson");
        assert_eq!(lesson.message, "*** Error code 1");
        assert_eq!(lesson.category, FailureCategory::Other);
    }
}
