//! `reviewer` command-line entry point.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use reviewer::core::scope::ScopeStatus;
use reviewer::exit_codes;
use reviewer::io::build::CommandBuildExecutor;
use reviewer::io::chat::{ChatClient, CommandChatClient};
use reviewer::io::chunker::FunctionChunker;
use reviewer::io::config::{ReviewerConfig, load_config};
use reviewer::io::index::ScopeIndex;
use reviewer::io::layout::{InitOptions, ReviewerPaths, init_reviewer};
use reviewer::io::transcript::{NullObserver, TranscriptWriter, TurnObserver};
use reviewer::logging;
use reviewer::looping::{LoopDeps, LoopStop, ReviewLoop};

#[derive(Parser)]
#[command(
    name = "reviewer",
    version,
    about = "LLM-driven review, edit, build and fix loop for a source tree"
)]
struct Cli {
    /// Source root (defaults to the current directory).
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.reviewer/` and generate the review index.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Re-scan the tree, keeping existing statuses.
    Scan,
    /// Print index counts, the current entry and the next pending directory.
    Status,
    /// Print the next pending directory.
    Next,
    /// List the models the chat backend offers.
    Models,
    /// Run a review session.
    Run {
        /// Override `session.max_iterations`.
        #[arg(long)]
        max_iterations: Option<u32>,
    },
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let root = cli.root.as_path();
    match cli.command {
        Command::Init { force } => cmd_init(root, force),
        Command::Scan => cmd_scan(root),
        Command::Status => cmd_status(root),
        Command::Next => cmd_next(root),
        Command::Models => cmd_models(root),
        Command::Run { max_iterations } => cmd_run(root, max_iterations),
    }
}

fn load(root: &Path) -> Result<(ReviewerPaths, ReviewerConfig)> {
    let paths = ReviewerPaths::new(root);
    let cfg = load_config(&paths.config_path)?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", paths.config_path.display()))?;
    Ok((paths, cfg))
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    init_reviewer(root, &InitOptions { force })?;
    let (paths, cfg) = load(root)?;
    let mut index = ScopeIndex::load(paths.under_root(&cfg.index.path))?;
    let found = index.generate_from_scan(root, &cfg.index)?;
    index.save()?;
    println!("initialized {} ({found} reviewable directories)", index.path().display());
    Ok(exit_codes::OK)
}

fn cmd_scan(root: &Path) -> Result<i32> {
    let (paths, cfg) = load(root)?;
    let mut index = ScopeIndex::load(paths.under_root(&cfg.index.path))?;
    let found = index.generate_from_scan(root, &cfg.index)?;
    let written = index.save()?;
    println!(
        "{found} reviewable directories ({})",
        if written { "index updated" } else { "index unchanged" }
    );
    Ok(exit_codes::OK)
}

fn cmd_status(root: &Path) -> Result<i32> {
    let (paths, cfg) = load(root)?;
    let index = ScopeIndex::load(paths.under_root(&cfg.index.path))?;
    for status in [
        ScopeStatus::Pending,
        ScopeStatus::Current,
        ScopeStatus::Done,
        ScopeStatus::Skipped,
    ] {
        println!("{:<8} {}", status.as_str(), index.count(status));
    }
    println!(
        "current  {}",
        index.get_current().unwrap_or_else(|| "-".to_string())
    );
    println!(
        "next     {}",
        index.get_next_pending().unwrap_or_else(|| "-".to_string())
    );
    Ok(exit_codes::OK)
}

fn cmd_next(root: &Path) -> Result<i32> {
    let (paths, cfg) = load(root)?;
    let index = ScopeIndex::load(paths.under_root(&cfg.index.path))?;
    match index.get_next_pending() {
        Some(next) => {
            println!("{next}");
            Ok(exit_codes::OK)
        }
        None => {
            eprintln!("no directories pending review");
            Ok(exit_codes::EXHAUSTED)
        }
    }
}

fn cmd_models(root: &Path) -> Result<i32> {
    let (_, cfg) = load(root)?;
    let chat = CommandChatClient::new(&cfg.chat).with_workdir(root);
    match chat.list_models() {
        Ok(models) => {
            for model in models {
                let marker = if model == cfg.chat.model { "*" } else { " " };
                println!("{marker} {model}");
            }
            Ok(exit_codes::OK)
        }
        Err(err) => {
            eprintln!("cannot list models: {err}");
            Ok(if err.is_transport_failure() {
                exit_codes::TRANSPORT
            } else {
                exit_codes::INVALID
            })
        }
    }
}

fn cmd_run(root: &Path, max_iterations: Option<u32>) -> Result<i32> {
    let (paths, cfg) = load(root)?;
    let index = ScopeIndex::open(root, &cfg.index)?;
    let chat = CommandChatClient::new(&cfg.chat).with_workdir(root);
    let build = CommandBuildExecutor::new(root, &cfg.build).with_log(&paths.build_log_path);
    let chunker = FunctionChunker::new(cfg.chunking.threshold_lines, cfg.chunking.chunk_lines);
    let transcripts = TranscriptWriter::new(&paths.sessions_dir);
    let observer: &dyn TurnObserver = if cfg.logs.transcripts {
        &transcripts
    } else {
        &NullObserver
    };

    let mut review = ReviewLoop::new(
        root,
        &cfg,
        LoopDeps {
            chat: &chat,
            build: &build,
            chunker: &chunker,
            observer,
        },
        index,
    )?;
    let outcome = review.run(max_iterations.unwrap_or(cfg.session.max_iterations))?;

    let code = match &outcome.stop {
        LoopStop::Halted { reason } => {
            println!("halted: {}", reason.as_deref().unwrap_or("(no reason given)"));
            exit_codes::OK
        }
        LoopStop::IterationBudgetExhausted { iterations } => {
            println!("stopped: iteration budget exhausted after {iterations} turns");
            exit_codes::EXHAUSTED
        }
        LoopStop::TransportFailure { error } => {
            println!("stopped: chat transport failure: {error}");
            exit_codes::TRANSPORT
        }
    };
    print!("{}", outcome.report.render());
    Ok(code)
}
