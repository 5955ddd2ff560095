//! `run-experiment`: the command a batch job (or the local backend) executes.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::core::types::{RunMetrics, RunStatus};
use crate::io::config::ExperimentConfig;
use crate::io::process::run_experiment_script;
use crate::io::workspace::ProjectPaths;

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub seed: u64,
    /// `None` when the script left no readable `metrics.json`.
    pub metrics: Option<RunMetrics>,
}

#[derive(Debug, Clone, Default)]
pub struct ExperimentSummary {
    pub runs: Vec<RunSummary>,
}

impl ExperimentSummary {
    /// Runs that produced a readable result file.
    pub fn with_results(&self) -> usize {
        self.runs.iter().filter(|run| run.metrics.is_some()).count()
    }

    pub fn succeeded(&self) -> usize {
        self.runs
            .iter()
            .filter(|run| {
                run.metrics
                    .as_ref()
                    .is_some_and(|m| m.status == RunStatus::Success)
            })
            .count()
    }
}

/// Run the experiment script once per configured seed.
///
/// Each seed gets `02_exp/runs/run_NNNN` (1-based, in seed order). Run
/// directories left by an earlier attempt are removed first so the
/// experiment gate only sees this attempt's results.
pub fn run_experiment(project_dir: &Path, cfg: &ExperimentConfig) -> Result<ExperimentSummary> {
    if !project_dir.is_dir() {
        bail!("project dir not found: {}", project_dir.display());
    }
    let project_dir = std::path::absolute(project_dir)
        .with_context(|| format!("resolve project dir {}", project_dir.display()))?;
    let paths = ProjectPaths::new(&project_dir);
    if paths.runs_dir.exists() {
        warn!(runs_dir = %paths.runs_dir.display(), "removing runs from a previous attempt");
        fs::remove_dir_all(&paths.runs_dir)
            .with_context(|| format!("clear {}", paths.runs_dir.display()))?;
    }
    fs::create_dir_all(&paths.runs_dir)
        .with_context(|| format!("create {}", paths.runs_dir.display()))?;

    let config_path = project_dir.join(&cfg.config_file);
    let timeout = Duration::from_secs(cfg.run_timeout_secs);
    let mut summary = ExperimentSummary::default();
    for (index, seed) in cfg.seeds.iter().copied().enumerate() {
        let run_dir = paths.run_dir(index + 1);
        let run_id = format!("run_{:04}", index + 1);
        info!(run_id, seed, "starting run");
        let metrics = run_experiment_script(&cfg.command, &config_path, &run_dir, seed, timeout)?;
        match &metrics {
            Some(m) => info!(run_id, status = ?m.status, "run finished"),
            None => warn!(run_id, "run produced no results"),
        }
        summary.runs.push(RunSummary {
            run_id,
            seed,
            metrics,
        });
    }
    info!(
        runs = summary.runs.len(),
        with_results = summary.with_results(),
        succeeded = summary.succeeded(),
        "experiment finished"
    );
    Ok(summary)
}
