//! Stable exit codes for swarm CLI commands.

/// Run completed (reviewer passed) or command succeeded.
pub const OK: i32 = 0;
/// Invalid configuration, unusable workspace or other errors before the loop.
pub const INVALID: i32 = 1;
/// All rounds ran without a passing review.
pub const LIMIT_REACHED: i32 = 2;
/// A stage failed and the run stopped early.
pub const FATAL: i32 = 3;
/// The run was interrupted (Ctrl-C).
pub const CANCELLED: i32 = 130;
