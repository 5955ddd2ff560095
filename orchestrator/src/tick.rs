//! One state-machine step for a single project.
//!
//! `tick` runs the current stage, applies its gate, and persists the result.
//! Stage and gate failures are recorded on the project and consume its retry
//! budget; only failures to read or write the snapshot and registry escape as
//! errors.

use std::cell::Cell;
use std::path::Path;

use anyhow::{Result, bail};
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::core::pipeline::{Execution, Gate, Stage, is_allowed_edge, stage_for};
use crate::core::retry::{FailureDecision, FailureKind, RetryPolicy, record_advance};
use crate::core::types::{ActionCatalog, GateVerdict, JobState, ProjectMeta, ProjectState};
use crate::io::compute::{ComputeBackend, ComputeRequest, JobRecorder};
use crate::io::gates::{experiment_gate, idea_gate, paper_gate};
use crate::io::registry::Registry;
use crate::io::stages::{StageContext, StageHandlers};
use crate::io::workspace::{ProjectPaths, load_meta, write_meta};

/// Everything `tick` needs besides the project and the registry.
pub struct Pipeline<'a> {
    pub handlers: &'a StageHandlers,
    pub compute: &'a dyn ComputeBackend,
    pub catalog: &'a ActionCatalog,
    pub retry: RetryPolicy,
}

#[derive(Debug)]
enum StageResult {
    Passed,
    Failed { kind: FailureKind, reason: String },
}

impl StageResult {
    fn failed(kind: FailureKind, reason: impl Into<String>) -> Self {
        StageResult::Failed {
            kind,
            reason: reason.into(),
        }
    }
}

/// Advance the project in `project_dir` by at most one stage.
///
/// Returns the state after the step. Terminal projects are returned as-is
/// without touching disk or the registry.
#[instrument(skip_all, fields(project_dir = %project_dir.display()))]
pub fn tick(project_dir: &Path, pipeline: &Pipeline<'_>, registry: &Registry) -> Result<ProjectState> {
    let paths = ProjectPaths::new(project_dir);
    let mut meta = load_meta(&paths.meta_path)?;
    let from = meta.state;
    if from.is_terminal() {
        debug!(project_id = %meta.project_id, state = %from, "project already finished");
        return Ok(from);
    }
    let Some(stage) = stage_for(from) else {
        bail!("no stage defined for state {from}");
    };
    info!(project_id = %meta.project_id, state = %from, "tick");

    let result = run_stage(&paths, stage, &mut meta, pipeline, registry);
    keep_handler_fields(&paths, &mut meta);

    let now = Utc::now();
    match result {
        StageResult::Passed => {
            record_advance(&mut meta, stage.next, now);
            info!(project_id = %meta.project_id, from = %from, to = %stage.next, "stage passed");
        }
        StageResult::Failed { kind, reason } => {
            match pipeline.retry.record_failure(&mut meta, &reason, now) {
                FailureDecision::Retry { retry_count } => warn!(
                    project_id = %meta.project_id,
                    state = %from,
                    kind = %kind,
                    retry_count,
                    reason = %reason,
                    "stage failed, will retry"
                ),
                FailureDecision::Abort { retry_count } => error!(
                    project_id = %meta.project_id,
                    state = %from,
                    kind = %kind,
                    retry_count,
                    reason = %reason,
                    "retries exhausted, aborting project"
                ),
            }
        }
    }
    debug_assert!(meta.state == from || is_allowed_edge(from, meta.state));

    write_meta(&paths.meta_path, &meta)?;
    registry.update_state(&meta.project_id, &meta)?;
    Ok(meta.state)
}

fn run_stage(
    paths: &ProjectPaths,
    stage: &Stage,
    meta: &mut ProjectMeta,
    pipeline: &Pipeline<'_>,
    registry: &Registry,
) -> StageResult {
    let project_dir = paths.root.as_path();
    let state = stage.state;
    match stage.execution {
        Execution::Handler => {
            let Some(handler) = pipeline.handlers.get(state) else {
                return StageResult::failed(
                    FailureKind::Stage,
                    format!("no handler registered for {state}"),
                );
            };
            let ctx = StageContext {
                project_id: &meta.project_id,
                state,
                meta,
            };
            if let Err(err) = handler.run(project_dir, &ctx) {
                return StageResult::failed(
                    FailureKind::Stage,
                    format!("{state} handler failed: {err:#}"),
                );
            }
        }
        Execution::Compute => {
            let jobs = SnapshotJobs {
                meta_path: &paths.meta_path,
                registry,
                snapshot: meta.clone(),
                recorded: Cell::new(None),
            };
            let request = ComputeRequest {
                project_id: &meta.project_id,
                project_dir,
                jobs: &jobs,
            };
            let result = pipeline.compute.run(&request);
            if let Some(job_id) = jobs.recorded.get() {
                meta.job_id = Some(job_id);
            }
            match result {
                Ok(outcome) => {
                    if outcome.job_id.is_some() {
                        meta.job_id = outcome.job_id;
                    }
                    if outcome.state != JobState::Completed {
                        let kind = if outcome.state == JobState::Timeout {
                            FailureKind::Timeout
                        } else {
                            FailureKind::Infrastructure
                        };
                        let reason = match outcome.job_id {
                            Some(id) => format!("batch job {id}: {}", outcome.state),
                            None => format!("local run: {}", outcome.state),
                        };
                        return StageResult::failed(kind, reason);
                    }
                }
                Err(err) => {
                    return StageResult::failed(
                        FailureKind::Infrastructure,
                        format!("{state} compute failed: {err:#}"),
                    );
                }
            }
        }
    }

    let Some(gate) = stage.gate else {
        return StageResult::Passed;
    };
    let verdict = check_gate(gate, project_dir, pipeline.catalog);
    if verdict.passed {
        debug!(gate = gate.label(), "gate passed");
        StageResult::Passed
    } else {
        StageResult::failed(
            FailureKind::Stage,
            format!("{}: {}", gate.label(), verdict.reason),
        )
    }
}

/// Writes a freshly submitted job id to `meta.json` and the registry while
/// the project is still in `RUN`, before the job is polled.
struct SnapshotJobs<'a> {
    meta_path: &'a Path,
    registry: &'a Registry,
    snapshot: ProjectMeta,
    recorded: Cell<Option<u64>>,
}

impl JobRecorder for SnapshotJobs<'_> {
    fn job_submitted(&self, job_id: u64) -> Result<()> {
        let mut meta = self.snapshot.clone();
        meta.job_id = Some(job_id);
        meta.updated_at = Utc::now();
        write_meta(self.meta_path, &meta)?;
        self.registry.update_state(&meta.project_id, &meta)?;
        self.recorded.set(Some(job_id));
        info!(project_id = %meta.project_id, job_id, "job id recorded");
        Ok(())
    }
}

fn check_gate(gate: Gate, project_dir: &Path, catalog: &ActionCatalog) -> GateVerdict {
    match gate {
        Gate::Idea => idea_gate(project_dir, catalog),
        Gate::Experiment => experiment_gate(project_dir),
        Gate::Paper => paper_gate(project_dir),
    }
}

/// Stage handlers may update `budget` and `best` in `meta.json`; keep those
/// and let the orchestrator own everything else.
fn keep_handler_fields(paths: &ProjectPaths, meta: &mut ProjectMeta) {
    match load_meta(&paths.meta_path) {
        Ok(on_disk) if on_disk.project_id == meta.project_id => {
            meta.budget = on_disk.budget;
            meta.best = on_disk.best;
        }
        Ok(_) => warn!(project_id = %meta.project_id, "meta.json project id changed, ignoring"),
        Err(err) => warn!(
            project_id = %meta.project_id,
            err = %format!("{err:#}"),
            "meta.json unreadable after stage, rewriting"
        ),
    }
}
