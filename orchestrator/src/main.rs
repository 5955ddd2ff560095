//! Research-project orchestrator CLI.
//!
//! `daemon` creates projects and drives each through the pipeline;
//! `run-experiment` is the entry point batch jobs call back into;
//! `status` and `show` read the shared registry.

use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use orchestrator::core::types::ProjectState;
use orchestrator::daemon::{CycleOutcome, CycleReport, Daemon, DaemonOptions, run_daemon};
use orchestrator::exit_codes;
use orchestrator::experiment::run_experiment;
use orchestrator::io::batch::{SlurmScheduler, SystemClock};
use orchestrator::io::compute::{BatchBackend, ComputeBackend, LocalBackend};
use orchestrator::io::config::{BackendKind, OrchestratorConfig, load_config};
use orchestrator::io::observers::{CommandHook, HistoryRecorder, OutcomeObserver};
use orchestrator::io::registry::Registry;
use orchestrator::io::stages::StageHandlers;
use orchestrator::io::workspace::Workspace;
use orchestrator::logging;
use orchestrator::shutdown::{ShutdownToken, install_signal_handler};
use orchestrator::tick::Pipeline;

#[derive(Parser)]
#[command(
    name = "orchestrator",
    version,
    about = "Drive research projects from idea to publication"
)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = "orchestrator.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create projects and run each to DONE or ABORT.
    Daemon {
        /// Run a single project, then exit.
        #[arg(long)]
        once: bool,
        /// Stop after this many projects; 0 means no limit.
        #[arg(long, conflicts_with = "once")]
        max_projects: Option<u32>,
    },
    /// Run the configured experiment once per seed (called from batch jobs).
    RunExperiment {
        /// Project directory.
        project_dir: PathBuf,
    },
    /// List active projects, or unlocked projects in one state.
    Status {
        /// Filter by state (e.g. RUN).
        #[arg(long)]
        state: Option<String>,
    },
    /// Print one project's registry row as JSON.
    Show { project_id: String },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;
    match cli.command {
        Command::Daemon { once, max_projects } => {
            let max_projects = if once { Some(1) } else { max_projects };
            cmd_daemon(&cli.config, &cfg, max_projects)
        }
        Command::RunExperiment { project_dir } => cmd_run_experiment(&project_dir, &cfg),
        Command::Status { state } => cmd_status(&cfg, state.as_deref()),
        Command::Show { project_id } => cmd_show(&cfg, &project_id),
    }
}

fn cmd_daemon(config_path: &Path, cfg: &OrchestratorConfig, max_projects: Option<u32>) -> Result<i32> {
    let registry = Registry::open(&cfg.paths.registry)?;
    let catalog = cfg.catalog.load()?;
    let handlers = StageHandlers::from_config(&cfg.stages);
    let entry_command = entry_command(config_path)?;
    let compute: Box<dyn ComputeBackend> = match cfg.compute.backend {
        BackendKind::Batch => Box::new(BatchBackend {
            scheduler: SlurmScheduler::from_config(&cfg.compute.batch),
            clock: SystemClock,
            settings: cfg.compute.batch.clone(),
            entry_command,
            log_root: cfg.paths.batch_logs.clone(),
        }),
        BackendKind::Local => Box::new(LocalBackend {
            entry_command,
            timeout: Duration::from_secs(cfg.compute.local_timeout_secs),
        }),
    };

    let mut observers: Vec<Box<dyn OutcomeObserver>> = vec![Box::new(HistoryRecorder {
        path: cfg.paths.history.clone(),
    })];
    if !cfg.hooks.on_done.is_empty() {
        observers.push(Box::new(CommandHook {
            command: cfg.hooks.on_done.clone(),
            timeout: Duration::from_secs(cfg.hooks.timeout_secs),
        }));
    }

    let workspace = Workspace;
    let daemon = Daemon {
        pipeline: Pipeline {
            handlers: &handlers,
            compute: compute.as_ref(),
            catalog: &catalog,
            retry: cfg.pipeline.retry_policy(),
        },
        registry: &registry,
        factory: &workspace,
        observers,
        project_root: cfg.paths.projects_root.clone(),
        owner: cfg.daemon.owner.clone().unwrap_or_else(default_owner),
    };
    let options = DaemonOptions {
        max_projects,
        loop_interval: Duration::from_secs(cfg.daemon.loop_interval_secs),
    };

    let shutdown = ShutdownToken::new();
    install_signal_handler(&shutdown)?;
    info!(
        owner = %daemon.owner,
        backend = ?cfg.compute.backend,
        projects_root = %cfg.paths.projects_root.display(),
        "daemon starting"
    );
    let summary = run_daemon(&daemon, &options, &shutdown, |cycle, report| match report {
        CycleReport::Completed(CycleOutcome::Finished { project_id, state }) => {
            println!("{cycle}\t{project_id}\t{state}");
        }
        CycleReport::Completed(CycleOutcome::LockContended { project_id }) => {
            println!("{cycle}\t{project_id}\tLOCKED");
        }
        CycleReport::Failed(reason) => println!("{cycle}\t-\tERROR\t{reason}"),
    });
    info!(
        cycles = summary.cycles,
        done = summary.done,
        aborted = summary.aborted,
        contended = summary.contended,
        failed = summary.failed,
        "daemon stopped"
    );
    Ok(exit_codes::OK)
}

/// Command line a batch job uses to call back into `run-experiment`.
fn entry_command(config_path: &Path) -> Result<Vec<String>> {
    let exe = std::env::current_exe().context("locate orchestrator executable")?;
    let config = std::path::absolute(config_path)
        .with_context(|| format!("resolve config path {}", config_path.display()))?;
    Ok(vec![
        exe.display().to_string(),
        "--config".to_string(),
        config.display().to_string(),
        "run-experiment".to_string(),
    ])
}

fn default_owner() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{host}:{}", process::id())
}

fn cmd_run_experiment(project_dir: &Path, cfg: &OrchestratorConfig) -> Result<i32> {
    if !project_dir.is_dir() {
        eprintln!("project dir not found: {}", project_dir.display());
        return Ok(exit_codes::NOT_FOUND);
    }
    let summary = run_experiment(project_dir, &cfg.experiment)?;
    for run in &summary.runs {
        let status = run
            .metrics
            .as_ref()
            .map_or("NO_RESULTS".to_string(), |m| format!("{:?}", m.status).to_uppercase());
        println!("{}\tseed={}\t{status}", run.run_id, run.seed);
    }
    if summary.with_results() == 0 {
        warn!(project_dir = %project_dir.display(), "no run produced results");
        return Ok(exit_codes::NO_RESULTS);
    }
    Ok(exit_codes::OK)
}

fn cmd_status(cfg: &OrchestratorConfig, state: Option<&str>) -> Result<i32> {
    let registry = Registry::open(&cfg.paths.registry)?;
    let records = match state {
        Some(raw) => registry.list_by_state(raw.parse::<ProjectState>()?)?,
        None => registry.list_active()?,
    };
    for record in records {
        println!(
            "{}\t{}\tretries={}\t{}\t{}",
            record.project_id,
            record.state,
            record.retry_count,
            record.locked_by.as_deref().unwrap_or("-"),
            record.project_dir.display()
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_show(cfg: &OrchestratorConfig, project_id: &str) -> Result<i32> {
    let registry = Registry::open(&cfg.paths.registry)?;
    let Some(record) = registry.get_project(project_id)? else {
        eprintln!("project not found: {project_id}");
        return Ok(exit_codes::NOT_FOUND);
    };
    let payload = serde_json::to_string_pretty(&record).context("serialize project record")?;
    println!("{payload}");
    Ok(exit_codes::OK)
}
