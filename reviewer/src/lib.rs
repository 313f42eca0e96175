//! Autonomous review, edit, build and fix loop over a large C source tree.
//!
//! A language model proposes one directive per turn; this crate decides
//! whether that directive is allowed, applies it, and commits verified work
//! one directory at a time. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (directive parsing, session state,
//!   halt and scope policy, index grammar). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (git, file edits, index scan, build,
//!   chat transport, logs). Isolated behind traits where tests substitute them.
//!
//! Orchestration lives in [`executor`] (one directive) and [`looping`] (a
//! whole session).

pub mod core;
pub mod executor;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
