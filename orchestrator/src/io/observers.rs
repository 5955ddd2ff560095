//! Post-project observers: experiment history and the on-done hook.
//!
//! Observers run after a project reaches a terminal state and its lock is
//! released. Their errors are logged by the daemon and never change the
//! project's outcome.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::core::types::{ProjectMeta, ProjectState, RunMetrics, RunStatus};
use crate::io::process::run_command;
use crate::io::workspace::ProjectPaths;

/// A finished project as seen by observers.
#[derive(Debug, Clone)]
pub struct ProjectOutcome {
    pub project_id: String,
    pub project_dir: PathBuf,
    pub meta: ProjectMeta,
}

impl ProjectOutcome {
    pub fn state(&self) -> ProjectState {
        self.meta.state
    }
}

pub trait OutcomeObserver {
    fn name(&self) -> &str;
    fn observe(&self, outcome: &ProjectOutcome) -> Result<()>;
}

/// Best successful run by primary metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BestMetric {
    pub run_id: String,
    pub name: String,
    pub value: f64,
    pub higher_is_better: bool,
}

#[derive(Debug, Serialize)]
struct HistoryEntry<'a> {
    project_id: &'a str,
    state: ProjectState,
    recorded_at: DateTime<Utc>,
    retry_count: u32,
    failure_reason: Option<&'a str>,
    hypothesis: Option<String>,
    actions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_id: Option<u64>,
    best: Option<BestMetric>,
}

/// Appends one JSON line per finished project.
#[derive(Debug, Clone)]
pub struct HistoryRecorder {
    pub path: PathBuf,
}

impl OutcomeObserver for HistoryRecorder {
    fn name(&self) -> &str {
        "history"
    }

    fn observe(&self, outcome: &ProjectOutcome) -> Result<()> {
        let paths = ProjectPaths::new(&outcome.project_dir);
        let idea = read_idea(&paths.idea_file());
        let entry = HistoryEntry {
            project_id: &outcome.project_id,
            state: outcome.state(),
            recorded_at: Utc::now(),
            retry_count: outcome.meta.retry_count,
            failure_reason: outcome.meta.failure_reason.as_deref(),
            hypothesis: idea
                .as_ref()
                .and_then(|v| v.get("hypothesis"))
                .and_then(Value::as_str)
                .map(str::to_string),
            actions: idea
                .as_ref()
                .and_then(|v| v.get("actions"))
                .and_then(Value::as_array)
                .map(|actions| {
                    actions
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            job_id: outcome.meta.job_id,
            best: best_metric(&paths.runs_dir),
        };

        let mut line = serde_json::to_string(&entry).context("serialize history entry")?;
        line.push('\n');
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create history dir {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open history {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append history {}", self.path.display()))?;
        info!(project_id = %outcome.project_id, state = %outcome.state(), "history recorded");
        Ok(())
    }
}

fn read_idea(path: &Path) -> Option<Value> {
    let raw = fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Best `SUCCESS` run under `runs_dir`, honoring each metric's direction.
pub fn best_metric(runs_dir: &Path) -> Option<BestMetric> {
    let mut entries: Vec<PathBuf> = fs::read_dir(runs_dir)
        .ok()?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    entries.sort();

    let mut best: Option<BestMetric> = None;
    for run_dir in entries {
        let Ok(raw) = fs::read_to_string(run_dir.join("metrics.json")) else {
            continue;
        };
        let Ok(metrics) = serde_json::from_str::<RunMetrics>(&raw) else {
            debug!(run_dir = %run_dir.display(), "skipping unreadable metrics");
            continue;
        };
        if metrics.status != RunStatus::Success {
            continue;
        }
        let Some(primary) = metrics.primary_metric else {
            continue;
        };
        let run_id = metrics.run_id.unwrap_or_else(|| {
            run_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        });
        let better = match &best {
            None => true,
            Some(current) if primary.higher_is_better => primary.value > current.value,
            Some(current) => primary.value < current.value,
        };
        if better {
            best = Some(BestMetric {
                run_id,
                name: primary.name,
                value: primary.value,
                higher_is_better: primary.higher_is_better,
            });
        }
    }
    best
}

/// Runs a command after a project reaches `DONE` (e.g. a git sync script).
#[derive(Debug, Clone)]
pub struct CommandHook {
    pub command: Vec<String>,
    pub timeout: Duration,
}

impl OutcomeObserver for CommandHook {
    fn name(&self) -> &str {
        "on_done hook"
    }

    fn observe(&self, outcome: &ProjectOutcome) -> Result<()> {
        if outcome.state() != ProjectState::Done {
            debug!(project_id = %outcome.project_id, "skipping on_done hook");
            return Ok(());
        }
        let project_dir = std::path::absolute(&outcome.project_dir)?;
        let mut argv = self.command.clone();
        argv.push(outcome.project_id.clone());
        argv.push(project_dir.display().to_string());

        let log_path = project_dir.join("on_done.log");
        let run = run_command(&argv, &project_dir, &log_path, self.timeout)?;
        if !run.success() {
            bail!(
                "on_done hook exited with code {} (log: {})",
                run.exit_code,
                log_path.display()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{write_idea, write_run_metrics, write_run_metrics_with};

    fn outcome(dir: &Path, state: ProjectState) -> ProjectOutcome {
        let mut meta = ProjectMeta::new("P7", Utc::now());
        meta.state = state;
        ProjectOutcome {
            project_id: "P7".to_string(),
            project_dir: dir.to_path_buf(),
            meta,
        }
    }

    #[test]
    fn best_metric_respects_direction() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_run_metrics(temp.path(), "run_0001", "SUCCESS", Some(0.7));
        write_run_metrics(temp.path(), "run_0002", "SUCCESS", Some(0.9));
        write_run_metrics(temp.path(), "run_0003", "FAIL", None);
        let runs = ProjectPaths::new(temp.path()).runs_dir;
        let best = best_metric(&runs).expect("best");
        assert_eq!(best.run_id, "run_0002");
        assert_eq!(best.value, 0.9);

        let lower = tempfile::tempdir().expect("tempdir");
        write_run_metrics_with(lower.path(), "run_0001", 2.5, false);
        write_run_metrics_with(lower.path(), "run_0002", 1.5, false);
        let best = best_metric(&ProjectPaths::new(lower.path()).runs_dir).expect("best");
        assert_eq!(best.run_id, "run_0002");
    }

    #[test]
    fn history_appends_one_line_per_project() {
        let temp = tempfile::tempdir().expect("tempdir");
        let project = temp.path().join("P7");
        write_idea(&project, &["sweep_lr"]);
        write_run_metrics(&project, "run_0001", "SUCCESS", Some(0.4));
        let recorder = HistoryRecorder {
            path: temp.path().join("state/history.jsonl"),
        };

        recorder
            .observe(&outcome(&project, ProjectState::Done))
            .expect("observe");
        recorder
            .observe(&outcome(&project, ProjectState::Abort))
            .expect("observe");

        let contents = fs::read_to_string(&recorder.path).expect("read");
        let lines: Vec<Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["state"], "DONE");
        assert_eq!(lines[0]["actions"], serde_json::json!(["sweep_lr"]));
        assert_eq!(lines[0]["hypothesis"], "sweep_lr helps");
        assert_eq!(lines[0]["best"]["value"], 0.4);
        assert_eq!(lines[1]["state"], "ABORT");
    }

    #[test]
    fn hook_runs_only_for_done_projects() {
        let temp = tempfile::tempdir().expect("tempdir");
        let marker = temp.path().join("synced");
        let hook = CommandHook {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                format!(r#"echo "$1" >> {}"#, marker.display()),
                "hook".to_string(),
            ],
            timeout: Duration::from_secs(10),
        };

        hook.observe(&outcome(temp.path(), ProjectState::Abort))
            .expect("skip");
        assert!(!marker.exists());

        hook.observe(&outcome(temp.path(), ProjectState::Done))
            .expect("run");
        assert_eq!(fs::read_to_string(&marker).expect("read").trim(), "P7");
    }
}
