//! Test-only fakes for the stage, compute, scheduler and clock seams, plus
//! writers for the artifacts the gates inspect.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde_json::json;

use crate::core::types::JobState;
use crate::io::batch::{Clock, CommandReply, Scheduler};
use crate::io::compute::{ComputeBackend, ComputeOutcome, ComputeRequest, JobRecorder};
use crate::io::gates::REQUIRED_PAPER_SECTIONS;
use crate::io::stages::{StageContext, StageHandler};
use crate::io::workspace::ProjectPaths;

type StageFn = dyn Fn(&Path) -> Result<()>;

/// Stage handler backed by a closure over the project directory.
pub struct ScriptedStage {
    action: Box<StageFn>,
    calls: Cell<u32>,
}

impl ScriptedStage {
    pub fn new(action: impl Fn(&Path) -> Result<()> + 'static) -> Self {
        Self {
            action: Box::new(action),
            calls: Cell::new(0),
        }
    }

    /// Handler that always fails with `message`.
    pub fn failing(message: &str) -> Self {
        let message = message.to_string();
        Self::new(move |_| Err(anyhow!("{message}")))
    }

    pub fn calls(&self) -> u32 {
        self.calls.get()
    }
}

impl StageHandler for ScriptedStage {
    fn run(&self, project_dir: &Path, _ctx: &StageContext<'_>) -> Result<()> {
        self.calls.set(self.calls.get() + 1);
        (self.action)(project_dir)
    }
}

/// Compute backend that replays queued outcomes, then reports `COMPLETED`.
pub struct ScriptedCompute {
    outcomes: RefCell<VecDeque<Result<(Option<u64>, JobState)>>>,
    calls: Cell<u32>,
}

impl ScriptedCompute {
    pub fn new(outcomes: Vec<Result<(Option<u64>, JobState)>>) -> Self {
        Self {
            outcomes: RefCell::new(outcomes.into()),
            calls: Cell::new(0),
        }
    }

    pub fn completed() -> Self {
        Self::new(Vec::new())
    }

    pub fn calls(&self) -> u32 {
        self.calls.get()
    }
}

impl ComputeBackend for ScriptedCompute {
    fn run(&self, request: &ComputeRequest<'_>) -> Result<ComputeOutcome> {
        self.calls.set(self.calls.get() + 1);
        let (job_id, state) = self
            .outcomes
            .borrow_mut()
            .pop_front()
            .unwrap_or(Ok((None, JobState::Completed)))?;
        if let Some(id) = job_id {
            request.jobs.job_submitted(id)?;
        }
        Ok(ComputeOutcome { job_id, state })
    }
}

/// Job recorder that keeps ids in memory, or always fails.
#[derive(Default)]
pub struct RecordedJobs {
    ids: RefCell<Vec<u64>>,
    fail: bool,
}

impl RecordedJobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn ids(&self) -> Vec<u64> {
        self.ids.borrow().clone()
    }
}

impl JobRecorder for RecordedJobs {
    fn job_submitted(&self, job_id: u64) -> Result<()> {
        if self.fail {
            return Err(anyhow!("snapshot write failed"));
        }
        self.ids.borrow_mut().push(job_id);
        Ok(())
    }
}

/// In-memory scheduler. Queued replies are consumed in order; an exhausted
/// submit queue rejects, an exhausted status queue reports nothing (or the
/// configured fallback for `squeue`).
#[derive(Default)]
pub struct FakeScheduler {
    submit_replies: RefCell<VecDeque<CommandReply>>,
    queue_replies: RefCell<VecDeque<Option<String>>>,
    queue_fallback: Option<String>,
    accounting_replies: RefCell<VecDeque<Option<String>>>,
    submissions: RefCell<Vec<(PathBuf, Option<String>)>>,
    cancelled: RefCell<Vec<u64>>,
}

impl FakeScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_submit(self, success: bool, stdout: &str, stderr: &str) -> Self {
        self.submit_replies.borrow_mut().push_back(CommandReply {
            success,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        });
        self
    }

    pub fn with_queue(self, state: Option<&str>) -> Self {
        self.queue_replies
            .borrow_mut()
            .push_back(state.map(str::to_string));
        self
    }

    pub fn with_queue_fallback(mut self, state: &str) -> Self {
        self.queue_fallback = Some(state.to_string());
        self
    }

    pub fn with_accounting(self, state: Option<&str>) -> Self {
        self.accounting_replies
            .borrow_mut()
            .push_back(state.map(str::to_string));
        self
    }

    pub fn submissions(&self) -> Vec<(PathBuf, Option<String>)> {
        self.submissions.borrow().clone()
    }

    pub fn cancelled(&self) -> Vec<u64> {
        self.cancelled.borrow().clone()
    }
}

impl Scheduler for FakeScheduler {
    fn submit(&self, script: &Path, partition: Option<&str>) -> Result<CommandReply> {
        self.submissions
            .borrow_mut()
            .push((script.to_path_buf(), partition.map(str::to_string)));
        Ok(self
            .submit_replies
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| CommandReply {
                success: false,
                stdout: String::new(),
                stderr: "no scripted submit reply".to_string(),
            }))
    }

    fn queue_state(&self, _job_id: u64) -> Result<Option<String>> {
        Ok(self
            .queue_replies
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| self.queue_fallback.clone()))
    }

    fn accounting_state(&self, _job_id: u64) -> Result<Option<String>> {
        Ok(self.accounting_replies.borrow_mut().pop_front().flatten())
    }

    fn cancel(&self, job_id: u64) -> Result<()> {
        self.cancelled.borrow_mut().push(job_id);
        Ok(())
    }
}

/// Clock whose `sleep` advances `now` instantly and records the duration.
pub struct ManualClock {
    start: Instant,
    elapsed: Cell<Duration>,
    sleeps: RefCell<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            elapsed: Cell::new(Duration::ZERO),
            sleeps: RefCell::new(Vec::new()),
        }
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.borrow().clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + self.elapsed.get()
    }

    fn sleep(&self, duration: Duration) {
        self.elapsed.set(self.elapsed.get() + duration);
        self.sleeps.borrow_mut().push(duration);
    }
}

/// Write `00_idea/idea.json` proposing `actions`.
pub fn write_idea(project_dir: &Path, actions: &[&str]) {
    let paths = ProjectPaths::new(project_dir);
    fs::create_dir_all(&paths.idea_dir).expect("create idea dir");
    let idea = json!({
        "hypothesis": format!("{} helps", actions.join(" and ")),
        "actions": actions,
    });
    fs::write(
        paths.idea_file(),
        serde_json::to_string_pretty(&idea).expect("serialize idea"),
    )
    .expect("write idea.json");
}

/// Write `02_exp/runs/<run>/metrics.json` with a higher-is-better metric
/// when `value` is given.
pub fn write_run_metrics(project_dir: &Path, run: &str, status: &str, value: Option<f64>) {
    let mut metrics = json!({ "run_id": run, "status": status });
    if let Some(value) = value {
        metrics["primary_metric"] = json!({
            "name": "accuracy",
            "value": value,
            "higher_is_better": true,
        });
    }
    write_metrics_file(project_dir, run, &metrics);
}

/// Write a successful run whose metric has the given direction.
pub fn write_run_metrics_with(project_dir: &Path, run: &str, value: f64, higher_is_better: bool) {
    let metrics = json!({
        "run_id": run,
        "status": "SUCCESS",
        "primary_metric": {
            "name": "loss",
            "value": value,
            "higher_is_better": higher_is_better,
        },
    });
    write_metrics_file(project_dir, run, &metrics);
}

fn write_metrics_file(project_dir: &Path, run: &str, metrics: &serde_json::Value) {
    let run_dir = ProjectPaths::new(project_dir).runs_dir.join(run);
    fs::create_dir_all(&run_dir).expect("create run dir");
    fs::write(
        run_dir.join("metrics.json"),
        serde_json::to_string_pretty(metrics).expect("serialize metrics"),
    )
    .expect("write metrics.json");
}

/// Write `04_paper/paper.md` with every required section, and optionally
/// `reproducibility.md`.
pub fn write_paper(project_dir: &Path, with_reproducibility: bool) {
    let paths = ProjectPaths::new(project_dir);
    fs::create_dir_all(&paths.paper_dir).expect("create paper dir");
    let mut paper = String::from("# Findings\n");
    for section in REQUIRED_PAPER_SECTIONS {
        paper.push_str(&format!("\n{section}\n\nText.\n"));
    }
    fs::write(paths.paper_file(), paper).expect("write paper.md");
    if with_reproducibility {
        fs::write(paths.reproducibility_file(), "seeds: 0 1 2\n")
            .expect("write reproducibility.md");
    }
}
