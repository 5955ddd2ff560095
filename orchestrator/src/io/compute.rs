//! Compute backends for the `RUN` stage.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::backoff::PollSchedule;
use crate::core::types::JobState;
use crate::io::batch::{Clock, JobSpec, Scheduler, poll_job, submit_job, write_job_script};
use crate::io::config::BatchConfig;
use crate::io::process::run_command;
use crate::io::workspace::ProjectPaths;

/// Persists a scheduler job id as soon as the job is queued, so a job that
/// outlives the daemon can still be found and cancelled.
pub trait JobRecorder {
    fn job_submitted(&self, job_id: u64) -> Result<()>;
}

/// One `RUN` stage execution request.
#[derive(Clone, Copy)]
pub struct ComputeRequest<'a> {
    pub project_id: &'a str,
    pub project_dir: &'a Path,
    pub jobs: &'a dyn JobRecorder,
}

/// How the experiment ended. `job_id` is set for scheduler-backed runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeOutcome {
    pub job_id: Option<u64>,
    pub state: JobState,
}

/// Runs a project's experiment to completion.
pub trait ComputeBackend {
    /// `Err` for infrastructure failures (script, submission); a job that ran
    /// but did not complete is an `Ok` outcome with a non-`COMPLETED` state.
    fn run(&self, request: &ComputeRequest<'_>) -> Result<ComputeOutcome>;
}

/// Script, submit, poll.
pub struct BatchBackend<S, C> {
    pub scheduler: S,
    pub clock: C,
    pub settings: BatchConfig,
    pub entry_command: Vec<String>,
    pub log_root: PathBuf,
}

impl<S: Scheduler, C: Clock> ComputeBackend for BatchBackend<S, C> {
    #[instrument(skip_all, fields(project_id = request.project_id))]
    fn run(&self, request: &ComputeRequest<'_>) -> Result<ComputeOutcome> {
        let script = write_job_script(&JobSpec {
            project_id: request.project_id,
            project_dir: request.project_dir,
            entry_command: &self.entry_command,
            log_root: &self.log_root,
            settings: &self.settings,
        })?;
        let job_id = submit_job(&self.scheduler, &script, &self.settings.fallback_partitions)?;
        if let Err(err) = request.jobs.job_submitted(job_id) {
            warn!(job_id, "could not record job id, cancelling job");
            if let Err(cancel_err) = self.scheduler.cancel(job_id) {
                warn!(job_id, err = %format!("{cancel_err:#}"), "cancel failed");
            }
            return Err(err).with_context(|| format!("record batch job {job_id}"));
        }
        let schedule: PollSchedule = self.settings.poll_schedule();
        let state = poll_job(
            &self.scheduler,
            &self.clock,
            job_id,
            self.settings.job_timeout(),
            &schedule,
        )?;
        Ok(ComputeOutcome {
            job_id: Some(job_id),
            state,
        })
    }
}

/// Runs the experiment entry command as a local child process.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    pub entry_command: Vec<String>,
    pub timeout: Duration,
}

impl ComputeBackend for LocalBackend {
    #[instrument(skip_all, fields(project_id = request.project_id))]
    fn run(&self, request: &ComputeRequest<'_>) -> Result<ComputeOutcome> {
        let project_dir = std::path::absolute(request.project_dir)?;
        let paths = ProjectPaths::new(&project_dir);
        let mut argv = self.entry_command.clone();
        argv.push(project_dir.display().to_string());

        let run = run_command(
            &argv,
            &project_dir,
            &paths.exp_dir.join("local_run.log"),
            self.timeout,
        )?;
        let state = if run.timed_out {
            JobState::Timeout
        } else if run.exit_code == 0 {
            JobState::Completed
        } else {
            warn!(exit_code = run.exit_code, "local experiment failed");
            JobState::Failed
        };
        info!(state = %state, "local experiment finished");
        Ok(ComputeOutcome {
            job_id: None,
            state,
        })
    }
}
