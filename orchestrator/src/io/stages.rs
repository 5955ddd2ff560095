//! Stage handler abstraction.
//!
//! The [`StageHandler`] trait decouples the state machine from the code that
//! produces each stage's artifacts. The orchestrator never looks inside a
//! handler: it runs, then the gate inspects what it left on disk. Tests use
//! scripted handlers that write fixtures without spawning processes.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{info, instrument};

use crate::core::pipeline::stage_for;
use crate::core::types::{ProjectMeta, ProjectState};
use crate::io::config::StagesConfig;
use crate::io::process::run_command_with_env;

/// What a handler is told about the project it runs on.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    pub project_id: &'a str,
    pub state: ProjectState,
    pub meta: &'a ProjectMeta,
}

/// Produces the artifacts of one stage inside `project_dir`.
pub trait StageHandler {
    /// `Err` marks the stage as failed; the message becomes the failure reason.
    fn run(&self, project_dir: &Path, ctx: &StageContext<'_>) -> Result<()>;
}

/// Handler that runs an external command with the project directory appended.
#[derive(Debug, Clone)]
pub struct CommandStage {
    pub command: Vec<String>,
    pub timeout: Duration,
}

impl StageHandler for CommandStage {
    #[instrument(skip_all, fields(project_id = ctx.project_id, state = %ctx.state))]
    fn run(&self, project_dir: &Path, ctx: &StageContext<'_>) -> Result<()> {
        let project_dir = std::path::absolute(project_dir)
            .with_context(|| format!("resolve project dir {}", project_dir.display()))?;
        let stage_dir = stage_for(ctx.state).map_or("", |stage| stage.dir);
        let log_path = project_dir
            .join(stage_dir)
            .join(format!("{}.log", ctx.state.as_str().to_lowercase()));

        let mut argv = self.command.clone();
        argv.push(project_dir.display().to_string());
        let run = run_command_with_env(
            &argv,
            &project_dir,
            &[
                ("PROJECT_ID", ctx.project_id),
                ("PROJECT_STAGE", ctx.state.as_str()),
            ],
            &log_path,
            self.timeout,
        )?;

        if run.timed_out {
            bail!(
                "{} stage timed out after {}s (log: {})",
                ctx.state,
                self.timeout.as_secs(),
                log_path.display()
            );
        }
        if run.exit_code != 0 {
            bail!(
                "{} stage exited with code {} (log: {})",
                ctx.state,
                run.exit_code,
                log_path.display()
            );
        }
        info!(log = %log_path.display(), "stage command succeeded");
        Ok(())
    }
}

/// Registered handlers, keyed by the state they serve.
#[derive(Default)]
pub struct StageHandlers {
    handlers: BTreeMap<ProjectState, Box<dyn StageHandler>>,
}

impl StageHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, state: ProjectState, handler: impl StageHandler + 'static) -> Self {
        self.handlers.insert(state, Box::new(handler));
        self
    }

    pub fn get(&self, state: ProjectState) -> Option<&dyn StageHandler> {
        self.handlers.get(&state).map(|handler| &**handler)
    }

    /// One [`CommandStage`] per configured stage command.
    pub fn from_config(cfg: &StagesConfig) -> Self {
        let timeout = Duration::from_secs(cfg.timeout_secs);
        let mut handlers = Self::new();
        for (state, command) in cfg.commands() {
            handlers = handlers.with(
                state,
                CommandStage {
                    command: command.to_vec(),
                    timeout,
                },
            );
        }
        handlers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs;

    fn sh(script: &str) -> Vec<String> {
        vec![
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
            "stage".to_string(),
        ]
    }

    #[test]
    fn command_stage_gets_project_dir_and_env() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("00_idea")).expect("mkdir");
        let meta = ProjectMeta::new("P42", Utc::now());
        let stage = CommandStage {
            command: sh(r#"echo "$PROJECT_ID $PROJECT_STAGE" > "$1/00_idea/seen.txt""#),
            timeout: Duration::from_secs(10),
        };

        stage
            .run(
                temp.path(),
                &StageContext {
                    project_id: "P42",
                    state: ProjectState::Idea,
                    meta: &meta,
                },
            )
            .expect("run");

        let seen = fs::read_to_string(temp.path().join("00_idea/seen.txt")).expect("read");
        assert_eq!(seen.trim(), "P42 IDEA");
        assert!(temp.path().join("00_idea/idea.log").exists());
    }

    #[test]
    fn command_stage_fails_on_nonzero_exit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let meta = ProjectMeta::new("P1", Utc::now());
        let stage = CommandStage {
            command: sh("echo nope; exit 4"),
            timeout: Duration::from_secs(10),
        };
        let err = stage
            .run(
                temp.path(),
                &StageContext {
                    project_id: "P1",
                    state: ProjectState::Analyze,
                    meta: &meta,
                },
            )
            .expect_err("exit 4");
        assert!(err.to_string().contains("exited with code 4"));
        let log = fs::read_to_string(temp.path().join("03_results/analyze.log")).expect("log");
        assert!(log.contains("nope"));
    }

    #[test]
    fn command_stage_fails_on_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let meta = ProjectMeta::new("P1", Utc::now());
        let stage = CommandStage {
            command: sh("exec sleep 30"),
            timeout: Duration::from_secs(1),
        };
        let err = stage
            .run(
                temp.path(),
                &StageContext {
                    project_id: "P1",
                    state: ProjectState::Plan,
                    meta: &meta,
                },
            )
            .expect_err("timeout");
        assert!(err.to_string().contains("timed out after 1s"));
    }

    #[test]
    fn handlers_from_config_cover_every_handler_stage() {
        let handlers = StageHandlers::from_config(&StagesConfig::default());
        for state in [
            ProjectState::Idea,
            ProjectState::Plan,
            ProjectState::Analyze,
            ProjectState::Write,
            ProjectState::Publish,
        ] {
            assert!(handlers.get(state).is_some(), "{state}");
        }
        assert!(handlers.get(ProjectState::Run).is_none());
    }
}
