//! Side-effecting operations: filesystem, SQLite, child processes, scheduler CLI.

pub mod batch;
pub mod compute;
pub mod config;
pub mod gates;
pub mod observers;
pub mod process;
pub mod registry;
pub mod stages;
pub mod workspace;
