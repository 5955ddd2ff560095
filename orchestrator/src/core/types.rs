//! Shared deterministic types for the orchestrator core.
//!
//! These types define stable contracts between the state machine, the
//! registry, gates and compute backends. They perform no I/O.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pipeline state of a project.
///
/// Declaration order is pipeline order; `Abort` sorts last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProjectState {
    Idea,
    Plan,
    Run,
    Analyze,
    Write,
    Publish,
    Done,
    Abort,
}

impl ProjectState {
    pub const ALL: [ProjectState; 8] = [
        ProjectState::Idea,
        ProjectState::Plan,
        ProjectState::Run,
        ProjectState::Analyze,
        ProjectState::Write,
        ProjectState::Publish,
        ProjectState::Done,
        ProjectState::Abort,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProjectState::Idea => "IDEA",
            ProjectState::Plan => "PLAN",
            ProjectState::Run => "RUN",
            ProjectState::Analyze => "ANALYZE",
            ProjectState::Write => "WRITE",
            ProjectState::Publish => "PUBLISH",
            ProjectState::Done => "DONE",
            ProjectState::Abort => "ABORT",
        }
    }

    /// `DONE` and `ABORT` are absorbing.
    pub fn is_terminal(self) -> bool {
        matches!(self, ProjectState::Done | ProjectState::Abort)
    }
}

impl fmt::Display for ProjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        ProjectState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| anyhow!("unknown project state '{s}'"))
    }
}

/// Resource allowances carried with a project. Stage handlers may consult
/// them; the orchestrator never enforces them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    pub tokens: u64,
    pub gpu_hours: f64,
    pub wall_minutes: u64,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            tokens: 200_000,
            gpu_hours: 0.0,
            wall_minutes: 90,
        }
    }
}

/// Best run recorded by stage handlers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BestRun {
    pub run_id: Option<String>,
    pub score: Option<f64>,
}

/// Snapshot of a project, persisted as `meta.json` and in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectMeta {
    pub project_id: String,
    pub state: ProjectState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Incremented on every stage failure; never reset.
    pub retry_count: u32,
    #[serde(default)]
    pub budget: Budget,
    #[serde(default)]
    pub best: BestRun,
    /// Last failure; cleared by a successful transition.
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// Scheduler job id of the latest `RUN` submission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<u64>,
}

impl ProjectMeta {
    pub fn new(project_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            project_id: project_id.into(),
            state: ProjectState::Idea,
            created_at: now,
            updated_at: now,
            retry_count: 0,
            budget: Budget::default(),
            best: BestRun::default(),
            failure_reason: None,
            job_id: None,
        }
    }
}

/// Scheduler-reported state of a batch job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Completed,
    Failed,
    Cancelled,
    Timeout,
    NodeFail,
    Preempted,
    OutOfMemory,
    Completing,
    Pending,
    Running,
    /// Anything else the scheduler reports, kept verbatim.
    Other(String),
}

impl JobState {
    /// Parse a scheduler reply. Only the first whitespace-separated token
    /// counts, so `"CANCELLED by 1000"` maps to [`JobState::Cancelled`].
    pub fn parse(raw: &str) -> Self {
        let token = raw.split_whitespace().next().unwrap_or("");
        match token {
            "COMPLETED" => JobState::Completed,
            "FAILED" => JobState::Failed,
            "CANCELLED" => JobState::Cancelled,
            "TIMEOUT" => JobState::Timeout,
            "NODE_FAIL" => JobState::NodeFail,
            "PREEMPTED" => JobState::Preempted,
            "OUT_OF_MEMORY" => JobState::OutOfMemory,
            "COMPLETING" => JobState::Completing,
            "PENDING" => JobState::Pending,
            "RUNNING" => JobState::Running,
            "" => JobState::Other("UNKNOWN".to_string()),
            other => JobState::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
            JobState::Timeout => "TIMEOUT",
            JobState::NodeFail => "NODE_FAIL",
            JobState::Preempted => "PREEMPTED",
            JobState::OutOfMemory => "OUT_OF_MEMORY",
            JobState::Completing => "COMPLETING",
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Other(raw) => raw,
        }
    }

    /// Terminal states end polling immediately.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed
                | JobState::Failed
                | JobState::Cancelled
                | JobState::Timeout
                | JobState::NodeFail
                | JobState::Preempted
                | JobState::OutOfMemory
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a gate check. Never persisted on its own; a failed verdict's
/// reason becomes the project's `failure_reason`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateVerdict {
    pub passed: bool,
    pub reason: String,
}

impl GateVerdict {
    pub fn pass() -> Self {
        Self {
            passed: true,
            reason: "ok".to_string(),
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: reason.into(),
        }
    }
}

/// Status of a single experiment run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Success,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimaryMetric {
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub higher_is_better: bool,
}

/// Contents of a run's `metrics.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    pub status: RunStatus,
    #[serde(default)]
    pub primary_metric: Option<PrimaryMetric>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub config_hash: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Action ids an idea may reference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionCatalog {
    ids: BTreeSet<String>,
}

impl ActionCatalog {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
