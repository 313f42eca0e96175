//! Prompt rendering for the review conversation.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const OPENING_TEMPLATE: &str = include_str!("prompts/opening.md");
const RECOVERY_TEMPLATE: &str = include_str!("prompts/recovery.md");
const COMMIT_TEMPLATE: &str = include_str!("prompts/commit.md");

/// Diff bytes included in a commit-message request.
const COMMIT_DIFF_LIMIT: usize = 20_000;

/// Unbuilt work carried over from an interrupted session.
#[derive(Debug, Clone, Serialize)]
pub struct ResumeContext {
    pub directory: String,
    pub files: Vec<String>,
    /// Diff of `files` against HEAD, already bounded.
    pub diff: String,
}

/// Inputs for the first user message of a session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OpeningContext {
    pub done: usize,
    pub pending: usize,
    pub skipped: usize,
    pub current: Option<String>,
    pub next_pending: Option<String>,
    pub lessons: Vec<String>,
    pub resume: Option<ResumeContext>,
}

/// Template engine wrapper around minijinja.
pub struct Prompts {
    env: Environment<'static>,
}

impl Prompts {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("system", SYSTEM_TEMPLATE)
            .expect("system template should be valid");
        env.add_template("opening", OPENING_TEMPLATE)
            .expect("opening template should be valid");
        env.add_template("recovery", RECOVERY_TEMPLATE)
            .expect("recovery template should be valid");
        env.add_template("commit", COMMIT_TEMPLATE)
            .expect("commit template should be valid");
        Self { env }
    }

    pub fn system(&self, min_directories: u32) -> Result<String> {
        let template = self.env.get_template("system")?;
        Ok(template.render(context! { min_directories })?)
    }

    pub fn opening(&self, ctx: &OpeningContext) -> Result<String> {
        let template = self.env.get_template("opening")?;
        Ok(template.render(ctx)?.trim().to_string())
    }

    /// Directive follow-up for a failed build.
    pub fn recovery(
        &self,
        directory: &str,
        report: &str,
        error_files: &[String],
        failures: u32,
    ) -> Result<String> {
        let template = self.env.get_template("recovery")?;
        Ok(template
            .render(context! {
                directory,
                report => report.trim(),
                error_files,
                failures,
            })?
            .trim()
            .to_string())
    }

    pub fn commit_message(&self, directory: &str, diff: &str) -> Result<String> {
        let template = self.env.get_template("commit")?;
        Ok(template.render(context! {
            directory,
            diff => truncate_at_boundary(diff, COMMIT_DIFF_LIMIT),
        })?)
    }
}

impl Default for Prompts {
    fn default() -> Self {
        Self::new()
    }
}

pub fn truncate_at_boundary(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[diff truncated]\n", &text[..end])
}
