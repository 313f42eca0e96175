//! Loop-level tests: scripted model replies driven through `ReviewLoop::run`.

use std::fs;

use reviewer::core::history::Role;
use reviewer::io::chat::ChatError;
use reviewer::io::chunker::FunctionChunker;
use reviewer::io::config::ReviewerConfig;
use reviewer::io::transcript::{NullObserver, TranscriptWriter, TurnPaths};
use reviewer::looping::{LoopDeps, LoopOutcome, LoopStop, ReviewLoop};
use reviewer::test_support::{ScriptedBuild, ScriptedChat, TestRepo, build_failed};

const FIX_CAT: &str = "The exit status is inverted.\n\
ACTION: EDIT_FILE bin/cat/cat.c\n\
OLD:\n<<<\n\treturn (1);\n>>>\n\
NEW:\n<<<\n\treturn (0);\n>>>\n";

fn run_loop(
    repo: &TestRepo,
    cfg: &ReviewerConfig,
    chat: &ScriptedChat,
    build: &ScriptedBuild,
    max_iterations: u32,
) -> LoopOutcome {
    let chunker = FunctionChunker::new(cfg.chunking.threshold_lines, cfg.chunking.chunk_lines);
    let deps = LoopDeps {
        chat,
        build,
        chunker: &chunker,
        observer: &NullObserver,
    };
    let mut review =
        ReviewLoop::new(repo.path(), cfg, deps, repo.index().expect("index")).expect("loop");
    review.run(max_iterations).expect("run")
}

/// Last user message of the `n`th request.
fn feedback(chat: &ScriptedChat, n: usize) -> String {
    let requests = chat.requests();
    let last = requests[n].last().expect("message");
    assert_eq!(last.role, Role::User);
    last.content.clone()
}

#[test]
fn session_reviews_directory_and_halts() {
    let repo = TestRepo::new().expect("repo");
    let mut cfg = repo.config().expect("config");
    cfg.session.min_directories_before_halt = 1;
    let chat = ScriptedChat::new([
        "ACTION: HALT nothing to do",
        "ACTION: SET_SCOPE bin/cat",
        "ACTION: READ_FILE bin/cat/cat.c",
        FIX_CAT,
        "ACTION: BUILD",
        "ACTION: HALT reviewed bin/cat",
    ]);
    let build = ScriptedBuild::default();

    let outcome = run_loop(&repo, &cfg, &chat, &build, 20);

    assert_eq!(
        outcome.stop,
        LoopStop::Halted {
            reason: Some("reviewed bin/cat".to_string())
        }
    );
    assert_eq!(outcome.report.iterations, 6);
    assert_eq!(outcome.report.completed_directories, vec!["bin/cat".to_string()]);
    assert!(outcome.report.changed_files.is_empty());
    assert!(outcome.report.uncommitted_files.is_empty());
    assert_eq!(chat.remaining(), 0);

    let first = chat.requests()[0].clone();
    assert_eq!(first[0].role, Role::System);
    assert!(first[1].content.contains("ACTION: SET_SCOPE bin/cat"));

    let refused = feedback(&chat, 1);
    assert!(refused.starts_with("RESULT of HALT (rejected)"), "{refused}");
    let read = feedback(&chat, 3);
    assert!(read.contains("\treturn (1);"));
    assert!(read.contains("[scope: bin/cat | pending files: 0"));
    let edited = feedback(&chat, 4);
    assert!(edited.contains("[scope: bin/cat | pending files: 1"));
    let built = feedback(&chat, 5);
    assert!(built.starts_with("RESULT of BUILD (applied)"), "{built}");
    assert!(built.contains("Committed: bin/cat: review fixes (1 files)"));

    assert_eq!(
        repo.head_subject().expect("subject"),
        "bin/cat: review fixes (1 files)"
    );
}

#[test]
fn replies_without_action_are_answered_with_protocol_reminder() {
    let repo = TestRepo::new().expect("repo");
    let cfg = repo.config().expect("config");
    let chat = ScriptedChat::new([
        "Let me think about where to start.",
        "ACTION: read_file bin/cat/cat.c",
        "ACTION: LIST_DIR",
    ]);
    let build = ScriptedBuild::default();

    let outcome = run_loop(&repo, &cfg, &chat, &build, 10);

    let reminder = feedback(&chat, 1);
    assert!(reminder.starts_with("RESULT of no action (rejected)"), "{reminder}");
    assert!(reminder.contains("No ACTION line found"));
    let malformed = feedback(&chat, 2);
    assert!(malformed.contains("Your ACTION line could not be used"), "{malformed}");
    let listed = feedback(&chat, 3);
    assert!(listed.starts_with("RESULT of LIST_DIR (applied)"));

    // The fourth request finds the script empty.
    assert!(matches!(outcome.stop, LoopStop::TransportFailure { .. }));
    assert_eq!(outcome.report.iterations, 4);
}

#[test]
fn iteration_budget_ends_session() {
    let repo = TestRepo::new().expect("repo");
    let cfg = repo.config().expect("config");
    let chat = ScriptedChat::new(["ACTION: LIST_DIR bin"; 5]);
    let build = ScriptedBuild::default();

    let outcome = run_loop(&repo, &cfg, &chat, &build, 3);

    assert_eq!(
        outcome.stop,
        LoopStop::IterationBudgetExhausted { iterations: 3 }
    );
    assert_eq!(outcome.report.iterations, 3);
    assert_eq!(chat.remaining(), 2);
}

#[test]
fn transport_failure_reports_unbuilt_work() {
    let repo = TestRepo::new().expect("repo");
    let cfg = repo.config().expect("config");
    let chat = ScriptedChat::new(["ACTION: SET_SCOPE bin/cat", FIX_CAT]);
    chat.push_error(ChatError::Timeout { secs: 600 });
    let build = ScriptedBuild::default();

    let outcome = run_loop(&repo, &cfg, &chat, &build, 10);

    match &outcome.stop {
        LoopStop::TransportFailure { error } => assert!(error.contains("600"), "{error}"),
        other => panic!("unexpected stop: {other:?}"),
    }
    let report = &outcome.report;
    assert_eq!(report.current_directory.as_deref(), Some("bin/cat"));
    assert_eq!(report.changed_files, vec!["bin/cat/cat.c".to_string()]);
    assert!(report.uncommitted_files.contains(&"bin/cat/cat.c".to_string()));
    let rendered = report.render();
    assert!(rendered.contains("scope: bin/cat"));
    assert!(rendered.contains("unbuilt changes:\n  - bin/cat/cat.c"));
}

#[test]
fn repeated_chat_failures_end_session() {
    let repo = TestRepo::new().expect("repo");
    let cfg = repo.config().expect("config");
    let chat = ScriptedChat::new(Vec::<String>::new());
    chat.push_error(ChatError::Failed("bad gateway".to_string()));
    chat.push_error(ChatError::Empty);
    chat.push_error(ChatError::Failed("bad gateway".to_string()));
    let build = ScriptedBuild::default();

    let outcome = run_loop(&repo, &cfg, &chat, &build, 10);

    match &outcome.stop {
        LoopStop::TransportFailure { error } => {
            assert!(error.starts_with("3 consecutive chat failures"), "{error}");
        }
        other => panic!("unexpected stop: {other:?}"),
    }
    assert_eq!(outcome.report.iterations, 3);
}

#[test]
fn one_chat_failure_is_retried() {
    let repo = TestRepo::new().expect("repo");
    let cfg = repo.config().expect("config");
    let chat = ScriptedChat::new(Vec::<String>::new());
    chat.push_error(ChatError::Empty);
    chat.push_reply("ACTION: LIST_DIR");
    let build = ScriptedBuild::default();

    let outcome = run_loop(&repo, &cfg, &chat, &build, 2);

    assert_eq!(
        outcome.stop,
        LoopStop::IterationBudgetExhausted { iterations: 2 }
    );
    assert_eq!(chat.requests().len(), 2);
}

#[test]
fn failed_build_feedback_reaches_model_and_lessons_reach_next_session() {
    let repo = TestRepo::new().expect("repo");
    let cfg = repo.config().expect("config");
    let chat = ScriptedChat::new(["ACTION: SET_SCOPE bin/cat", FIX_CAT, "ACTION: BUILD"]);
    let build = ScriptedBuild::new(vec![build_failed(
        "bin/cat/cat.c",
        8,
        "implicit declaration of function 'exit'",
    )]);

    let outcome = run_loop(&repo, &cfg, &chat, &build, 3);
    assert_eq!(
        outcome.stop,
        LoopStop::IterationBudgetExhausted { iterations: 3 }
    );
    assert_eq!(outcome.report.build_failures, 1);

    // The next session resumes the unbuilt edit and sees the lesson.
    let chat = ScriptedChat::new(["ACTION: BUILD"]);
    let build = ScriptedBuild::default();
    let outcome = run_loop(&repo, &cfg, &chat, &build, 5);

    let opening = &chat.requests()[0][1].content;
    assert!(opening.contains("unbuilt changes in bin/cat"), "{opening}");
    assert!(opening.contains("- bin/cat/cat.c"), "{opening}");
    assert!(opening.contains("+\treturn (0);"), "{opening}");
    assert!(opening.contains("Lessons from earlier build failures"), "{opening}");
    assert!(opening.contains("implicit declaration"), "{opening}");

    let built = feedback(&chat, 1);
    assert!(built.starts_with("RESULT of BUILD (applied)"), "{built}");
    assert!(matches!(outcome.stop, LoopStop::TransportFailure { .. }));
    assert_eq!(outcome.report.completed_directories, vec!["bin/cat".to_string()]);
    assert!(
        repo.head_files()
            .expect("files")
            .contains(&"bin/cat/cat.c".to_string())
    );
}

#[test]
fn transcripts_record_every_turn() {
    let repo = TestRepo::new().expect("repo");
    let cfg = repo.config().expect("config");
    let chat = ScriptedChat::new(["ACTION: SET_SCOPE bin/echo", "ACTION: READ_FILE bin/echo/echo.c"]);
    let build = ScriptedBuild::default();
    let chunker = FunctionChunker::new(cfg.chunking.threshold_lines, cfg.chunking.chunk_lines);
    let sessions_dir = repo.paths().sessions_dir;
    let writer = TranscriptWriter::new(&sessions_dir);
    let deps = LoopDeps {
        chat: &chat,
        build: &build,
        chunker: &chunker,
        observer: &writer,
    };
    let mut review =
        ReviewLoop::new(repo.path(), &cfg, deps, repo.index().expect("index")).expect("loop");
    let outcome = review.run(2).expect("run");

    let session_id = &outcome.report.session_id;
    let first = TurnPaths::new(&sessions_dir, session_id, 1);
    assert_eq!(
        fs::read_to_string(&first.response_path).expect("response"),
        "ACTION: SET_SCOPE bin/echo"
    );
    let meta: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&first.meta_path).expect("meta")).expect("json");
    assert_eq!(meta["action"], "SET_SCOPE");
    assert_eq!(meta["target"], "bin/echo");
    assert_eq!(meta["verdict"], "applied");
    assert_eq!(meta["current_directory"], "bin/echo");

    let second = TurnPaths::new(&sessions_dir, session_id, 2);
    let result = fs::read_to_string(&second.result_path).expect("result");
    assert!(result.starts_with("File bin/echo/echo.c"), "{result}");

    // Transcripts stay out of the tree's history.
    let dirty = repo.gateway().changed_files().expect("status");
    assert!(!dirty.iter().any(|p| p.starts_with(".reviewer/sessions")), "{dirty:?}");
}
