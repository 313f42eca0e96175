//! Stable exit codes for reviewer CLI commands.

/// Command succeeded, or the session ended with an accepted HALT.
pub const OK: i32 = 0;
/// Invalid layout/config/index or any other error.
pub const INVALID: i32 = 1;
/// Nothing pending review, or the session ran out of iterations.
pub const EXHAUSTED: i32 = 2;
/// The chat backend timed out or could not be reached.
pub const TRANSPORT: i32 = 3;
