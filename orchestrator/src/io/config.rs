//! Orchestrator configuration (`orchestrator.toml`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};

use crate::core::backoff::PollSchedule;
use crate::core::retry::{DEFAULT_MAX_RETRIES, RetryPolicy};
use crate::core::types::{ActionCatalog, ProjectState};

/// Orchestrator configuration (TOML).
///
/// Every section is optional; missing fields take the defaults below.
/// Relative paths are resolved against the directory holding the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub paths: PathsConfig,
    pub pipeline: PipelineConfig,
    pub daemon: DaemonConfig,
    pub stages: StagesConfig,
    pub catalog: CatalogConfig,
    pub compute: ComputeConfig,
    pub experiment: ExperimentConfig,
    pub hooks: HooksConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory that receives one subdirectory per project.
    pub projects_root: PathBuf,
    /// SQLite registry shared by every daemon.
    pub registry: PathBuf,
    /// JSONL history of finished projects.
    pub history: PathBuf,
    /// Batch job logs land in `<batch_logs>/<project_id>/`.
    pub batch_logs: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            projects_root: PathBuf::from("projects"),
            registry: PathBuf::from("state/registry.db"),
            history: PathBuf::from("state/history.jsonl"),
            batch_logs: PathBuf::from("logs/batch"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Failures tolerated per project before it is aborted.
    pub max_retries: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl PipelineConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonConfig {
    pub loop_interval_secs: u64,
    /// Lock owner tag; defaults to `<hostname>:<pid>`.
    pub owner: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            loop_interval_secs: 60,
            owner: None,
        }
    }
}

/// External commands for the handler stages. Each receives the project
/// directory as its final argument.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StagesConfig {
    pub timeout_secs: u64,
    pub idea: Vec<String>,
    pub plan: Vec<String>,
    pub analyze: Vec<String>,
    pub write: Vec<String>,
    pub publish: Vec<String>,
}

fn stage_script(name: &str) -> Vec<String> {
    vec![format!("./stages/{name}.sh")]
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60 * 60,
            idea: stage_script("idea"),
            plan: stage_script("plan"),
            analyze: stage_script("analyze"),
            write: stage_script("write"),
            publish: stage_script("publish"),
        }
    }
}

impl StagesConfig {
    pub fn commands(&self) -> [(ProjectState, &[String]); 5] {
        [
            (ProjectState::Idea, self.idea.as_slice()),
            (ProjectState::Plan, self.plan.as_slice()),
            (ProjectState::Analyze, self.analyze.as_slice()),
            (ProjectState::Write, self.write.as_slice()),
            (ProjectState::Publish, self.publish.as_slice()),
        ]
    }

    fn commands_mut(&mut self) -> [&mut Vec<String>; 5] {
        [
            &mut self.idea,
            &mut self.plan,
            &mut self.analyze,
            &mut self.write,
            &mut self.publish,
        ]
    }
}

/// Actions an idea may pick. Inline ids, a taskspace file, or both.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CatalogConfig {
    pub actions: Vec<String>,
    /// JSON file of the form `{"actions": [{"id": "..."}, ...]}`.
    pub taskspace: Option<PathBuf>,
}

#[derive(Deserialize)]
struct Taskspace {
    actions: Vec<TaskspaceAction>,
}

#[derive(Deserialize)]
struct TaskspaceAction {
    id: String,
}

impl CatalogConfig {
    pub fn load(&self) -> Result<ActionCatalog> {
        let mut ids = self.actions.clone();
        if let Some(path) = &self.taskspace {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("read taskspace {}", path.display()))?;
            let taskspace: Taskspace = serde_json::from_str(&raw)
                .with_context(|| format!("parse taskspace {}", path.display()))?;
            ids.extend(taskspace.actions.into_iter().map(|action| action.id));
        }
        let catalog = ActionCatalog::new(ids);
        if catalog.is_empty() {
            bail!("action catalog is empty");
        }
        Ok(catalog)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Batch,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ComputeConfig {
    pub backend: BackendKind,
    /// Wall-clock limit for the `local` backend.
    pub local_timeout_secs: u64,
    pub batch: BatchConfig,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Batch,
            local_timeout_secs: 180 * 60,
            batch: BatchConfig::default(),
        }
    }
}

/// Slurm job parameters and polling behavior.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BatchConfig {
    pub partition: String,
    pub gres: String,
    pub time_limit: String,
    pub mem: String,
    pub cpus_per_task: u32,
    /// Tried in order with `-p` when submission to `partition` fails.
    pub fallback_partitions: Vec<String>,
    /// Shell lines emitted before the experiment command (module loads, venv activation).
    pub setup: Vec<String>,
    pub job_timeout_mins: u64,
    pub poll_initial_secs: u64,
    pub poll_multiplier: f64,
    pub poll_max_secs: u64,
    pub poll_completing_secs: u64,
    /// Limit for each scheduler CLI invocation.
    pub command_timeout_secs: u64,
    pub sbatch: String,
    pub squeue: String,
    pub sacct: String,
    pub scancel: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        let schedule = PollSchedule::default();
        Self {
            partition: "gpu".to_string(),
            gres: "gpu:rtx_5000_ada:4".to_string(),
            time_limit: "02:00:00".to_string(),
            mem: "120G".to_string(),
            cpus_per_task: 16,
            fallback_partitions: vec!["scavenge_gpu".to_string()],
            setup: Vec::new(),
            job_timeout_mins: 180,
            poll_initial_secs: schedule.initial.as_secs(),
            poll_multiplier: schedule.multiplier,
            poll_max_secs: schedule.max.as_secs(),
            poll_completing_secs: schedule.completing.as_secs(),
            command_timeout_secs: 60,
            sbatch: "sbatch".to_string(),
            squeue: "squeue".to_string(),
            sacct: "sacct".to_string(),
            scancel: "scancel".to_string(),
        }
    }
}

impl BatchConfig {
    pub fn poll_schedule(&self) -> PollSchedule {
        PollSchedule {
            initial: Duration::from_secs(self.poll_initial_secs),
            multiplier: self.poll_multiplier,
            max: Duration::from_secs(self.poll_max_secs),
            completing: Duration::from_secs(self.poll_completing_secs),
        }
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_mins * 60)
    }
}

/// What `run-experiment` executes inside a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Invoked as `<command> --config <cfg> --seed <n> --output-dir <run_dir>`.
    pub command: Vec<String>,
    pub seeds: Vec<u64>,
    /// Experiment config, relative to the project directory.
    pub config_file: PathBuf,
    pub run_timeout_secs: u64,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            command: vec!["./experiments/train.sh".to_string()],
            seeds: vec![0, 1, 2],
            config_file: PathBuf::from("01_plan/config.yaml"),
            run_timeout_secs: 60 * 60,
        }
    }
}

/// Commands run after a project finishes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HooksConfig {
    /// Run after a project reaches `DONE`, with `<project_id> <project_dir>` appended.
    pub on_done: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            on_done: Vec::new(),
            timeout_secs: 10 * 60,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.daemon.loop_interval_secs == 0 {
            return Err(anyhow!("daemon.loop_interval_secs must be > 0"));
        }
        if self.stages.timeout_secs == 0 {
            return Err(anyhow!("stages.timeout_secs must be > 0"));
        }
        for (state, command) in self.stages.commands() {
            if command.is_empty() || command[0].trim().is_empty() {
                return Err(anyhow!(
                    "stages.{} must be a non-empty array",
                    state.as_str().to_lowercase()
                ));
            }
        }
        if self.catalog.actions.is_empty() && self.catalog.taskspace.is_none() {
            return Err(anyhow!("catalog needs actions or a taskspace file"));
        }
        if self.experiment.command.is_empty() || self.experiment.command[0].trim().is_empty() {
            return Err(anyhow!("experiment.command must be a non-empty array"));
        }
        if self.experiment.seeds.is_empty() {
            return Err(anyhow!("experiment.seeds must not be empty"));
        }
        if self.experiment.run_timeout_secs == 0 {
            return Err(anyhow!("experiment.run_timeout_secs must be > 0"));
        }
        if self.compute.local_timeout_secs == 0 {
            return Err(anyhow!("compute.local_timeout_secs must be > 0"));
        }
        let batch = &self.compute.batch;
        if batch.job_timeout_mins == 0 || batch.command_timeout_secs == 0 {
            return Err(anyhow!("compute.batch timeouts must be > 0"));
        }
        if batch.poll_initial_secs == 0 || batch.poll_max_secs < batch.poll_initial_secs {
            return Err(anyhow!(
                "compute.batch poll interval must satisfy 0 < poll_initial_secs <= poll_max_secs"
            ));
        }
        if !batch.poll_multiplier.is_finite() || batch.poll_multiplier < 1.0 {
            return Err(anyhow!(
                "compute.batch.poll_multiplier must be a finite number >= 1.0"
            ));
        }
        if batch.poll_completing_secs == 0 {
            return Err(anyhow!("compute.batch.poll_completing_secs must be > 0"));
        }
        if self.hooks.timeout_secs == 0 {
            return Err(anyhow!("hooks.timeout_secs must be > 0"));
        }
        Ok(())
    }

    fn resolve_relative(&mut self, base: &Path) {
        for path in [
            &mut self.paths.projects_root,
            &mut self.paths.registry,
            &mut self.paths.history,
            &mut self.paths.batch_logs,
        ] {
            *path = resolve_path(base, path);
        }
        if let Some(taskspace) = &mut self.catalog.taskspace {
            *taskspace = resolve_path(base, taskspace);
        }
        for command in self.stages.commands_mut() {
            resolve_program(base, command);
        }
        resolve_program(base, &mut self.experiment.command);
        resolve_program(base, &mut self.hooks.on_done);
    }
}

fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Only explicitly relative programs (`./x`, `../x`) are anchored; bare names use `PATH`.
fn resolve_program(base: &Path, command: &mut [String]) {
    if let Some(program) = command.first_mut()
        && (program.starts_with("./") || program.starts_with("../"))
    {
        *program = base.join(program.as_str()).display().to_string();
    }
}

/// Load and validate config from a TOML file. A missing file is an error.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        bail!("config file not found: {}", path.display());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    let absolute = std::path::absolute(path)
        .with_context(|| format!("resolve config path {}", path.display()))?;
    let base = absolute.parent().unwrap_or_else(|| Path::new("/"));
    cfg.resolve_relative(base);
    Ok(cfg)
}
