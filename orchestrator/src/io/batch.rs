//! Slurm batch jobs: script generation, submission with partition fallback,
//! and deadline-bounded polling.
//!
//! The scheduler CLI sits behind [`Scheduler`] and time behind [`Clock`], so
//! the submission and polling logic runs against fakes in tests.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use minijinja::{Environment, context};
use regex::Regex;
use tracing::{debug, error, info, instrument, warn};

use crate::core::backoff::PollSchedule;
use crate::core::types::JobState;
use crate::io::config::BatchConfig;
use crate::io::process::run_command_with_timeout;
use crate::io::workspace::ProjectPaths;

const JOB_TEMPLATE: &str = include_str!("templates/job.sbatch.j2");
const SCHEDULER_OUTPUT_LIMIT_BYTES: usize = 64 * 1024;

static JOB_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d+)\b").expect("job id regex is valid"));

/// Inputs for one job script.
#[derive(Debug, Clone)]
pub struct JobSpec<'a> {
    pub project_id: &'a str,
    pub project_dir: &'a Path,
    /// Command re-invoking the orchestrator's `run-experiment`; the project
    /// directory is appended.
    pub entry_command: &'a [String],
    /// Job logs go to `<log_root>/<project_id>/%j.{out,err}`.
    pub log_root: &'a Path,
    pub settings: &'a BatchConfig,
}

/// Render the job script into `02_exp/run.sbatch` and make it executable.
pub fn write_job_script(spec: &JobSpec<'_>) -> Result<PathBuf> {
    let project_dir = std::path::absolute(spec.project_dir)
        .with_context(|| format!("resolve project dir {}", spec.project_dir.display()))?;
    let paths = ProjectPaths::new(&project_dir);
    let log_dir = spec.log_root.join(spec.project_id);
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("create job log dir {}", log_dir.display()))?;

    let mut argv: Vec<String> = spec.entry_command.to_vec();
    argv.push(project_dir.display().to_string());
    let command = argv
        .iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ");

    let settings = spec.settings;
    let mut env = Environment::new();
    env.add_template("job", JOB_TEMPLATE)
        .context("load job script template")?;
    let mut script = env
        .get_template("job")?
        .render(context! {
            job_name => format!("lab_{}", spec.project_id),
            project_id => spec.project_id,
            partition => settings.partition,
            gres => settings.gres,
            time_limit => settings.time_limit,
            mem => settings.mem,
            cpus => settings.cpus_per_task,
            log_dir => log_dir.display().to_string(),
            setup => settings.setup,
            command => command,
        })
        .context("render job script")?;
    if !script.ends_with('\n') {
        script.push('\n');
    }

    fs::create_dir_all(&paths.exp_dir)
        .with_context(|| format!("create {}", paths.exp_dir.display()))?;
    fs::write(&paths.script_path, script)
        .with_context(|| format!("write job script {}", paths.script_path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&paths.script_path, fs::Permissions::from_mode(0o755))
            .with_context(|| format!("chmod {}", paths.script_path.display()))?;
    }
    debug!(script = %paths.script_path.display(), "job script written");
    Ok(paths.script_path)
}

/// Quote `arg` for a POSIX shell when it contains anything unusual.
fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=,@%+".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Raw result of a scheduler CLI call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// The batch scheduler's command-line protocol.
pub trait Scheduler {
    /// Submit `script`, optionally overriding the partition.
    fn submit(&self, script: &Path, partition: Option<&str>) -> Result<CommandReply>;
    /// State from the live queue; `None` when the job is no longer queued.
    fn queue_state(&self, job_id: u64) -> Result<Option<String>>;
    /// State from accounting; `None` when there is no record.
    fn accounting_state(&self, job_id: u64) -> Result<Option<String>>;
    fn cancel(&self, job_id: u64) -> Result<()>;
}

/// [`Scheduler`] that shells out to `sbatch`/`squeue`/`sacct`/`scancel`.
#[derive(Debug, Clone)]
pub struct SlurmScheduler {
    pub sbatch: String,
    pub squeue: String,
    pub sacct: String,
    pub scancel: String,
    pub command_timeout: Duration,
}

impl SlurmScheduler {
    pub fn from_config(cfg: &BatchConfig) -> Self {
        Self {
            sbatch: cfg.sbatch.clone(),
            squeue: cfg.squeue.clone(),
            sacct: cfg.sacct.clone(),
            scancel: cfg.scancel.clone(),
            command_timeout: Duration::from_secs(cfg.command_timeout_secs),
        }
    }

    fn call(&self, program: &str, args: &[&str]) -> Result<CommandReply> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        let output = run_command_with_timeout(
            cmd,
            None,
            self.command_timeout,
            SCHEDULER_OUTPUT_LIMIT_BYTES,
        )
        .with_context(|| format!("run {program}"))?;
        if output.timed_out {
            bail!(
                "{program} timed out after {}s",
                self.command_timeout.as_secs()
            );
        }
        Ok(CommandReply {
            success: output.status.success(),
            stdout: output.stdout_text(),
            stderr: output.stderr_text(),
        })
    }
}

fn first_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

impl Scheduler for SlurmScheduler {
    fn submit(&self, script: &Path, partition: Option<&str>) -> Result<CommandReply> {
        let script = script.display().to_string();
        let mut args = vec!["--parsable"];
        if let Some(partition) = partition {
            args.extend(["-p", partition]);
        }
        args.push(&script);
        self.call(&self.sbatch, &args)
    }

    fn queue_state(&self, job_id: u64) -> Result<Option<String>> {
        let id = job_id.to_string();
        let reply = self.call(&self.squeue, &["-j", &id, "-h", "-o", "%T"])?;
        if !reply.success {
            // squeue rejects ids that have left the queue.
            debug!(job_id, stderr = %reply.stderr.trim(), "squeue reported no job");
            return Ok(None);
        }
        Ok(first_line(&reply.stdout))
    }

    fn accounting_state(&self, job_id: u64) -> Result<Option<String>> {
        let id = job_id.to_string();
        let reply = self.call(&self.sacct, &["-j", &id, "--format=State", "-n", "-P"])?;
        if !reply.success {
            bail!("sacct failed: {}", reply.stderr.trim());
        }
        Ok(first_line(&reply.stdout))
    }

    fn cancel(&self, job_id: u64) -> Result<()> {
        let reply = self.call(&self.scancel, &[&job_id.to_string()])?;
        if !reply.success {
            bail!("scancel {job_id} failed: {}", reply.stderr.trim());
        }
        Ok(())
    }
}

/// Time source for polling.
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// First integer in scheduler output (`--parsable` prints `<id>[;cluster]`).
pub fn parse_job_id(stdout: &str) -> Option<u64> {
    JOB_ID_RE
        .captures(stdout)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Submit `script`, falling back through `fallback_partitions` in order.
#[instrument(skip_all, fields(script = %script.display()))]
pub fn submit_job(
    scheduler: &dyn Scheduler,
    script: &Path,
    fallback_partitions: &[String],
) -> Result<u64> {
    let attempts = std::iter::once(None).chain(fallback_partitions.iter().map(|p| Some(p.as_str())));
    let mut last_stderr = String::new();
    for partition in attempts {
        let reply = scheduler.submit(script, partition)?;
        if reply.success {
            let job_id = parse_job_id(&reply.stdout).ok_or_else(|| {
                anyhow!(
                    "submission succeeded but no job id in output: {:?}",
                    reply.stdout.trim()
                )
            })?;
            info!(job_id, partition = partition.unwrap_or("default"), "job submitted");
            return Ok(job_id);
        }
        warn!(
            partition = partition.unwrap_or("default"),
            stderr = %reply.stderr.trim(),
            "submission rejected"
        );
        last_stderr = reply.stderr.trim().to_string();
    }
    Err(anyhow!("submission failed on all partitions: {last_stderr}"))
}

/// Current state from the queue, falling back to accounting.
fn query_state(scheduler: &dyn Scheduler, job_id: u64) -> Result<JobState> {
    if let Some(raw) = scheduler.queue_state(job_id)? {
        return Ok(JobState::parse(&raw));
    }
    if let Some(raw) = scheduler.accounting_state(job_id)? {
        return Ok(JobState::parse(&raw));
    }
    warn!(
        job_id,
        "job missing from queue and accounting, assuming COMPLETED"
    );
    Ok(JobState::Completed)
}

/// Poll `job_id` until it reaches a terminal state or `timeout` elapses.
///
/// On deadline the job is cancelled and [`JobState::Timeout`] returned. A
/// failing status query is logged and retried at the next interval.
#[instrument(skip_all, fields(job_id = job_id, timeout_secs = timeout.as_secs()))]
pub fn poll_job(
    scheduler: &dyn Scheduler,
    clock: &dyn Clock,
    job_id: u64,
    timeout: Duration,
    schedule: &PollSchedule,
) -> Result<JobState> {
    let deadline = clock.now() + timeout;
    let mut interval = schedule.initial;

    loop {
        let state = match query_state(scheduler, job_id) {
            Ok(state) => Some(state),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "job status query failed");
                None
            }
        };
        if let Some(state) = &state
            && state.is_terminal()
        {
            info!(state = %state, "job finished");
            return Ok(state.clone());
        }

        let now = clock.now();
        if now >= deadline {
            error!("job exceeded deadline, cancelling");
            if let Err(err) = scheduler.cancel(job_id) {
                warn!(err = %format!("{err:#}"), "cancel failed");
            }
            return Ok(JobState::Timeout);
        }

        let nap = if state == Some(JobState::Completing) {
            schedule.completing
        } else {
            let current = interval;
            interval = schedule.grow(interval);
            current
        };
        let nap = nap.min(deadline - now);
        debug!(state = ?state, sleep_secs = nap.as_secs_f64(), "job not finished");
        clock.sleep(nap);
    }
}
