//! Development-time tracing for debugging the reviewer.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted, not part of the review record.
//!
//! - **Turn transcripts (`io/transcript`)**: Product artifacts in
//!   `.reviewer/sessions/`. Written per turn, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing subscriber for development logging.
///
/// Reads `RUST_LOG`. Defaults to `reviewer=info,warn` so session progress is
/// visible while dependencies stay quiet.
///
/// # Example
/// ```bash
/// RUST_LOG=reviewer=debug reviewer run
/// ```
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("reviewer=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
