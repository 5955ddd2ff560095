//! Research-project lifecycle orchestrator.
//!
//! Each project moves through a fixed pipeline
//! (`IDEA → PLAN → RUN → ANALYZE → WRITE → PUBLISH → DONE`, or `ABORT` once
//! its retries are spent). A project's state lives in its own `meta.json`
//! and is mirrored into a SQLite registry that also provides per-project
//! locks. The crate is split the usual way:
//!
//! - **[`core`]**: Pure logic (stage table, retry policy, poll schedule).
//!   No I/O.
//! - **[`io`]**: Side effects (workspace files, gates, registry, processes,
//!   batch scheduler, observers, config).
//!
//! Orchestration modules ([`tick`], [`daemon`], [`experiment`]) combine the
//! two to implement the CLI commands.

pub mod core;
pub mod daemon;
pub mod exit_codes;
pub mod experiment;
pub mod io;
pub mod logging;
pub mod shutdown;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tick;
