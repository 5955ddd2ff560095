//! Daemon loop: create a project, drive it to a terminal state, repeat.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::core::types::ProjectState;
use crate::io::observers::{OutcomeObserver, ProjectOutcome};
use crate::io::registry::Registry;
use crate::io::workspace::{ProjectFactory, load_project_meta};
use crate::shutdown::ShutdownToken;
use crate::tick::{Pipeline, tick};

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The project ran to `DONE` or `ABORT`.
    Finished {
        project_id: String,
        state: ProjectState,
    },
    /// Another owner holds the lock; the project is left for later.
    LockContended { project_id: String },
}

/// Collaborators for the daemon loop.
pub struct Daemon<'a> {
    pub pipeline: Pipeline<'a>,
    pub registry: &'a Registry,
    pub factory: &'a dyn ProjectFactory,
    pub observers: Vec<Box<dyn OutcomeObserver + 'a>>,
    pub project_root: PathBuf,
    /// Lock owner tag written to the registry.
    pub owner: String,
}

/// Releases the registry lock when dropped.
struct ProjectLock<'a> {
    registry: &'a Registry,
    project_id: &'a str,
}

impl Drop for ProjectLock<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.registry.unlock(self.project_id) {
            warn!(
                project_id = self.project_id,
                err = %format!("{err:#}"),
                "failed to release project lock"
            );
        }
    }
}

impl Daemon<'_> {
    /// Create one project and run it to a terminal state.
    pub fn run_cycle(&self) -> Result<CycleOutcome> {
        let created = self.factory.create_project(&self.project_root)?;
        self.registry
            .register(&created.meta, &created.project_dir)?;
        if !self.registry.try_lock(&created.project_id, &self.owner)? {
            warn!(project_id = %created.project_id, "project locked by another owner");
            return Ok(CycleOutcome::LockContended {
                project_id: created.project_id,
            });
        }

        let state = {
            let _lock = ProjectLock {
                registry: self.registry,
                project_id: &created.project_id,
            };
            self.drive(&created.project_dir)?
        };
        info!(project_id = %created.project_id, state = %state, "project finished");

        match load_project_meta(&created.project_dir) {
            Ok(meta) => self.notify(&ProjectOutcome {
                project_id: created.project_id.clone(),
                project_dir: created.project_dir.clone(),
                meta,
            }),
            Err(err) => warn!(
                project_id = %created.project_id,
                err = %format!("{err:#}"),
                "cannot load final snapshot, skipping observers"
            ),
        }
        Ok(CycleOutcome::Finished {
            project_id: created.project_id,
            state,
        })
    }

    /// Tick until terminal. Every tick either advances or spends a retry, so
    /// this ends.
    fn drive(&self, project_dir: &Path) -> Result<ProjectState> {
        loop {
            let state = tick(project_dir, &self.pipeline, self.registry)?;
            if state.is_terminal() {
                return Ok(state);
            }
        }
    }

    fn notify(&self, outcome: &ProjectOutcome) {
        for observer in &self.observers {
            if let Err(err) = observer.observe(outcome) {
                warn!(
                    observer = observer.name(),
                    project_id = %outcome.project_id,
                    err = %format!("{err:#}"),
                    "observer failed"
                );
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    /// Stop after this many cycles; `None` or `Some(0)` runs until shutdown.
    pub max_projects: Option<u32>,
    pub loop_interval: Duration,
}

/// Result of one cycle as reported to the `on_cycle` callback.
#[derive(Debug)]
pub enum CycleReport {
    Completed(CycleOutcome),
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonSummary {
    pub cycles: u32,
    pub done: u32,
    pub aborted: u32,
    pub contended: u32,
    pub failed: u32,
}

/// Run cycles until `max_projects` is reached or `shutdown` is cancelled.
///
/// A cycle that errors or panics is logged and counted; the loop continues.
pub fn run_daemon<F: FnMut(u32, &CycleReport)>(
    daemon: &Daemon<'_>,
    options: &DaemonOptions,
    shutdown: &ShutdownToken,
    mut on_cycle: F,
) -> DaemonSummary {
    let limit = options.max_projects.filter(|max| *max > 0);
    let mut summary = DaemonSummary::default();
    loop {
        if shutdown.is_cancelled() {
            info!("shutdown requested, exiting daemon");
            break;
        }
        if let Some(max) = limit
            && summary.cycles >= max
        {
            info!(max_projects = max, "reached max projects, exiting daemon");
            break;
        }

        summary.cycles += 1;
        let cycle = summary.cycles;
        info!(cycle, max_projects = ?limit, "daemon cycle starting");

        let report = match catch_unwind(AssertUnwindSafe(|| daemon.run_cycle())) {
            Ok(Ok(outcome)) => CycleReport::Completed(outcome),
            Ok(Err(err)) => CycleReport::Failed(format!("{err:#}")),
            Err(panic) => CycleReport::Failed(panic_message(panic.as_ref())),
        };
        match &report {
            CycleReport::Completed(CycleOutcome::Finished { state, .. }) => {
                if *state == ProjectState::Done {
                    summary.done += 1;
                } else {
                    summary.aborted += 1;
                }
            }
            CycleReport::Completed(CycleOutcome::LockContended { .. }) => summary.contended += 1,
            CycleReport::Failed(reason) => {
                summary.failed += 1;
                error!(cycle, reason = %reason, "cycle crashed, continuing after interval");
            }
        }
        on_cycle(cycle, &report);

        let last = limit.is_some_and(|max| summary.cycles >= max);
        if last || shutdown.is_cancelled() {
            continue;
        }
        info!(secs = options.loop_interval.as_secs(), "sleeping before next cycle");
        shutdown.sleep(options.loop_interval);
    }
    summary
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("cycle panicked: {detail}")
}
