//! Lifecycle tests driving `tick` from a fresh project to a terminal state.
//!
//! Stage handlers and the compute backend are scripted; gates, snapshot
//! persistence and the registry are real.

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use orchestrator::core::retry::RetryPolicy;
use orchestrator::core::types::{ActionCatalog, JobState, ProjectState};
use orchestrator::io::batch::{CommandReply, Scheduler};
use orchestrator::io::compute::{BatchBackend, ComputeBackend, ComputeOutcome, ComputeRequest};
use orchestrator::io::config::BatchConfig;
use orchestrator::io::registry::Registry;
use orchestrator::io::stages::StageHandlers;
use orchestrator::io::workspace::{ProjectFactory, ProjectPaths, Workspace, load_project_meta};
use orchestrator::test_support::{
    FakeScheduler, ManualClock, ScriptedCompute, ScriptedStage, write_idea, write_paper,
    write_run_metrics,
};
use orchestrator::tick::{Pipeline, tick};

struct Lab {
    temp: tempfile::TempDir,
    registry: Registry,
    project_id: String,
    project_dir: PathBuf,
}

impl Lab {
    fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = Registry::open(&temp.path().join("state/registry.db")).expect("registry");
        let created = Workspace
            .create_project(&temp.path().join("projects"))
            .expect("create project");
        registry
            .register(&created.meta, &created.project_dir)
            .expect("register");
        Self {
            temp,
            registry,
            project_id: created.project_id,
            project_dir: created.project_dir,
        }
    }

    /// Tick until terminal, returning every state `tick` reported.
    fn run_to_end(&self, pipeline: &Pipeline<'_>) -> Vec<ProjectState> {
        let mut seen = Vec::new();
        for _ in 0..32 {
            let state = tick(&self.project_dir, pipeline, &self.registry).expect("tick");
            seen.push(state);
            if state.is_terminal() {
                return seen;
            }
        }
        panic!("project did not finish: {seen:?}");
    }
}

fn happy_handlers() -> StageHandlers {
    StageHandlers::new()
        .with(
            ProjectState::Idea,
            ScriptedStage::new(|dir| {
                write_idea(dir, &["sweep_lr"]);
                Ok(())
            }),
        )
        .with(
            ProjectState::Plan,
            ScriptedStage::new(|dir| {
                fs::write(ProjectPaths::new(dir).plan_config(), "lr: 0.01\n")?;
                Ok(())
            }),
        )
        .with(ProjectState::Analyze, ScriptedStage::new(|_| Ok(())))
        .with(
            ProjectState::Write,
            ScriptedStage::new(|dir| {
                write_paper(dir, true);
                Ok(())
            }),
        )
        .with(ProjectState::Publish, ScriptedStage::new(|_| Ok(())))
}

/// Stands in for the batch job's side effect: results appear once the job
/// is reported finished.
struct WritesRuns<B> {
    inner: B,
}

impl<B: ComputeBackend> ComputeBackend for WritesRuns<B> {
    fn run(&self, request: &ComputeRequest<'_>) -> Result<ComputeOutcome> {
        let outcome = self.inner.run(request)?;
        write_run_metrics(request.project_dir, "run_0001", "SUCCESS", Some(0.81));
        write_run_metrics(request.project_dir, "run_0002", "FAIL", None);
        Ok(outcome)
    }
}

/// Full pipeline through the batch backend: script, submit, poll, gates.
#[test]
fn project_reaches_done_through_batch_backend() {
    let lab = Lab::new();
    let handlers = happy_handlers();
    let compute = WritesRuns {
        inner: BatchBackend {
            scheduler: FakeScheduler::new()
                .with_submit(false, "", "sbatch: error: Batch job submission failed")
                .with_submit(true, "101;cluster\n", "")
                .with_queue(Some("PENDING"))
                .with_queue(Some("RUNNING"))
                .with_queue(None)
                .with_accounting(Some("COMPLETED")),
            clock: ManualClock::new(),
            settings: BatchConfig::default(),
            entry_command: vec!["orchestrator".to_string(), "run-experiment".to_string()],
            log_root: lab.temp.path().join("logs/batch"),
        },
    };
    let catalog = ActionCatalog::new(["train_baseline", "sweep_lr"]);
    let pipeline = Pipeline {
        handlers: &handlers,
        compute: &compute,
        catalog: &catalog,
        retry: RetryPolicy::default(),
    };

    let seen = lab.run_to_end(&pipeline);

    assert_eq!(
        seen,
        vec![
            ProjectState::Plan,
            ProjectState::Run,
            ProjectState::Analyze,
            ProjectState::Write,
            ProjectState::Publish,
            ProjectState::Done,
        ]
    );
    let meta = load_project_meta(&lab.project_dir).expect("meta");
    assert_eq!(meta.state, ProjectState::Done);
    assert_eq!(meta.retry_count, 0);
    assert_eq!(meta.failure_reason, None);
    assert_eq!(meta.job_id, Some(101));

    let submissions = compute.inner.scheduler.submissions();
    assert_eq!(submissions.len(), 2);
    assert_eq!(submissions[1].1.as_deref(), Some("scavenge_gpu"));
    assert!(lab.project_dir.join("02_exp/run.sbatch").is_file());

    let record = lab
        .registry
        .get_project(&lab.project_id)
        .expect("get")
        .expect("registered");
    assert_eq!(record.state, ProjectState::Done);
    assert_eq!(record.retry_count, 0);
    assert_eq!(record.meta, meta);
}

/// Records what `meta.json` and the registry say every time the queue is polled.
struct WatchesSnapshot {
    inner: FakeScheduler,
    project_dir: PathBuf,
    registry_path: PathBuf,
    seen: RefCell<Vec<(Option<u64>, Option<u64>, ProjectState)>>,
}

impl Scheduler for WatchesSnapshot {
    fn submit(&self, script: &Path, partition: Option<&str>) -> Result<CommandReply> {
        self.inner.submit(script, partition)
    }

    fn queue_state(&self, job_id: u64) -> Result<Option<String>> {
        let meta = load_project_meta(&self.project_dir)?;
        let record = Registry::open(&self.registry_path)?
            .get_project(&meta.project_id)?
            .expect("registered");
        self.seen
            .borrow_mut()
            .push((meta.job_id, record.meta.job_id, record.state));
        self.inner.queue_state(job_id)
    }

    fn accounting_state(&self, job_id: u64) -> Result<Option<String>> {
        self.inner.accounting_state(job_id)
    }

    fn cancel(&self, job_id: u64) -> Result<()> {
        self.inner.cancel(job_id)
    }
}

/// The job id is on disk and in the registry while the job is still polled.
#[test]
fn job_id_is_persisted_before_polling() {
    let lab = Lab::new();
    let handlers = happy_handlers();
    let compute = WritesRuns {
        inner: BatchBackend {
            scheduler: WatchesSnapshot {
                inner: FakeScheduler::new()
                    .with_submit(true, "77\n", "")
                    .with_queue(Some("RUNNING"))
                    .with_queue(None)
                    .with_accounting(Some("COMPLETED")),
                project_dir: lab.project_dir.clone(),
                registry_path: lab.temp.path().join("state/registry.db"),
                seen: RefCell::new(Vec::new()),
            },
            clock: ManualClock::new(),
            settings: BatchConfig::default(),
            entry_command: vec!["orchestrator".to_string(), "run-experiment".to_string()],
            log_root: lab.temp.path().join("logs/batch"),
        },
    };
    let catalog = ActionCatalog::new(["sweep_lr"]);
    let pipeline = Pipeline {
        handlers: &handlers,
        compute: &compute,
        catalog: &catalog,
        retry: RetryPolicy::default(),
    };

    assert_eq!(lab.run_to_end(&pipeline).last(), Some(&ProjectState::Done));

    let seen = compute.inner.scheduler.seen.borrow();
    assert_eq!(seen.len(), 2);
    assert!(
        seen.iter()
            .all(|polled| *polled == (Some(77), Some(77), ProjectState::Run)),
        "{seen:?}"
    );
    let meta = load_project_meta(&lab.project_dir).expect("meta");
    assert_eq!(meta.job_id, Some(77));
}

/// Experiment gate keeps finding a run without results: two retries, then ABORT.
#[test]
fn missing_run_results_abort_after_retries() {
    let lab = Lab::new();
    let handlers = happy_handlers();
    let compute = ScriptedCompute::completed();
    let runs_dir = ProjectPaths::new(&lab.project_dir).runs_dir;
    fs::create_dir_all(runs_dir.join("run_0001")).expect("mkdir");
    write_run_metrics(&lab.project_dir, "run_0002", "SUCCESS", Some(0.5));
    let catalog = ActionCatalog::new(["sweep_lr"]);
    let pipeline = Pipeline {
        handlers: &handlers,
        compute: &compute,
        catalog: &catalog,
        retry: RetryPolicy { max_retries: 2 },
    };

    let seen = lab.run_to_end(&pipeline);

    assert_eq!(
        seen,
        vec![
            ProjectState::Plan,
            ProjectState::Run,
            ProjectState::Run,
            ProjectState::Run,
            ProjectState::Abort,
        ]
    );
    assert_eq!(compute.calls(), 3);
    let meta = load_project_meta(&lab.project_dir).expect("meta");
    assert_eq!(meta.retry_count, 3);
    let reason = meta.failure_reason.expect("failure reason");
    assert!(reason.contains("run_0001"), "reason: {reason}");

    let record = lab
        .registry
        .get_project(&lab.project_id)
        .expect("get")
        .expect("registered");
    assert_eq!(record.state, ProjectState::Abort);
    assert_eq!(record.retry_count, 3);
}

/// A handler that never succeeds stops at `max_retries + 1` attempts.
#[test]
fn always_failing_handler_is_bounded() {
    let lab = Lab::new();
    let failing = ScriptedStage::failing("model server unreachable");
    let handlers = StageHandlers::new().with(ProjectState::Idea, failing);
    let compute = ScriptedCompute::completed();
    let catalog = ActionCatalog::new(["sweep_lr"]);
    let pipeline = Pipeline {
        handlers: &handlers,
        compute: &compute,
        catalog: &catalog,
        retry: RetryPolicy::default(),
    };

    let seen = lab.run_to_end(&pipeline);

    assert_eq!(seen.len(), 3);
    assert_eq!(seen.last(), Some(&ProjectState::Abort));
    let meta = load_project_meta(&lab.project_dir).expect("meta");
    assert_eq!(meta.retry_count, 3);
    assert_eq!(
        meta.failure_reason.as_deref(),
        Some("IDEA handler failed: model server unreachable")
    );
    assert_eq!(compute.calls(), 0);
}

/// An idea naming an action outside the catalog never reaches PLAN.
#[test]
fn unknown_action_never_leaves_idea() {
    let lab = Lab::new();
    let handlers = StageHandlers::new().with(
        ProjectState::Idea,
        ScriptedStage::new(|dir| {
            write_idea(dir, &["sweep_lr", "summon_gpu"]);
            Ok(())
        }),
    );
    let compute = ScriptedCompute::completed();
    let catalog = ActionCatalog::new(["sweep_lr"]);
    let pipeline = Pipeline {
        handlers: &handlers,
        compute: &compute,
        catalog: &catalog,
        retry: RetryPolicy::default(),
    };

    let seen = lab.run_to_end(&pipeline);

    assert!(!seen.contains(&ProjectState::Plan));
    let meta = load_project_meta(&lab.project_dir).expect("meta");
    assert_eq!(meta.state, ProjectState::Abort);
    assert_eq!(
        meta.failure_reason.as_deref(),
        Some("idea gate: invalid action: summon_gpu")
    );
}

/// A non-COMPLETED job consumes a retry; the next attempt can still succeed.
#[test]
fn failed_job_is_retried_then_completes() {
    let lab = Lab::new();
    let handlers = happy_handlers();
    let compute = ScriptedCompute::new(vec![Ok((Some(9), JobState::NodeFail))]);
    write_run_metrics(&lab.project_dir, "run_0001", "SUCCESS", Some(0.6));
    let catalog = ActionCatalog::new(["sweep_lr"]);
    let pipeline = Pipeline {
        handlers: &handlers,
        compute: &compute,
        catalog: &catalog,
        retry: RetryPolicy::default(),
    };

    let seen = lab.run_to_end(&pipeline);

    assert_eq!(seen.last(), Some(&ProjectState::Done));
    let meta = load_project_meta(&lab.project_dir).expect("meta");
    assert_eq!(meta.retry_count, 1);
    assert_eq!(meta.failure_reason, None);
    assert_eq!(meta.job_id, Some(9));
}

/// Ticking a finished project changes nothing on disk or in the registry.
#[test]
fn terminal_project_tick_is_a_no_op() {
    let lab = Lab::new();
    let handlers = StageHandlers::new();
    let compute = ScriptedCompute::completed();
    let catalog = ActionCatalog::new(["sweep_lr"]);
    let pipeline = Pipeline {
        handlers: &handlers,
        compute: &compute,
        catalog: &catalog,
        retry: RetryPolicy { max_retries: 0 },
    };
    assert_eq!(lab.run_to_end(&pipeline), vec![ProjectState::Abort]);

    let meta_path = ProjectPaths::new(&lab.project_dir).meta_path;
    let before = fs::read_to_string(&meta_path).expect("read");
    let record_before = lab.registry.get_project(&lab.project_id).expect("get");

    let state = tick(&lab.project_dir, &pipeline, &lab.registry).expect("tick");

    assert_eq!(state, ProjectState::Abort);
    assert_eq!(fs::read_to_string(&meta_path).expect("read"), before);
    assert_eq!(
        lab.registry.get_project(&lab.project_id).expect("get"),
        record_before
    );
}

