//! Stable exit codes for orchestrator CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid config, registry or snapshot, or any other error.
pub const INVALID: i32 = 1;
/// `run-experiment` finished but no run produced a results file.
pub const NO_RESULTS: i32 = 2;
/// The named project or project directory does not exist.
pub const NOT_FOUND: i32 = 3;
