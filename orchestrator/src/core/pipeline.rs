//! Stage table: which handler, gate and successor belong to each state.
//!
//! Adding a stage is an edit to [`STAGES`], not to the control flow in `tick`.

use crate::core::types::ProjectState;

/// Post-stage validator applied before advancing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Idea,
    Experiment,
    Paper,
}

impl Gate {
    pub fn label(self) -> &'static str {
        match self {
            Gate::Idea => "idea gate",
            Gate::Experiment => "experiment gate",
            Gate::Paper => "paper gate",
        }
    }
}

/// How a stage does its work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    /// Call the registered stage handler.
    Handler,
    /// Drive the compute backend (script, submit, poll).
    Compute,
}

/// One row of the stage table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub state: ProjectState,
    pub next: ProjectState,
    pub execution: Execution,
    pub gate: Option<Gate>,
    /// Artifact directory inside the project, also home of the stage log.
    pub dir: &'static str,
}

pub static STAGES: [Stage; 6] = [
    Stage {
        state: ProjectState::Idea,
        next: ProjectState::Plan,
        execution: Execution::Handler,
        gate: Some(Gate::Idea),
        dir: "00_idea",
    },
    Stage {
        state: ProjectState::Plan,
        next: ProjectState::Run,
        execution: Execution::Handler,
        gate: None,
        dir: "01_plan",
    },
    Stage {
        state: ProjectState::Run,
        next: ProjectState::Analyze,
        execution: Execution::Compute,
        gate: Some(Gate::Experiment),
        dir: "02_exp",
    },
    Stage {
        state: ProjectState::Analyze,
        next: ProjectState::Write,
        execution: Execution::Handler,
        gate: None,
        dir: "03_results",
    },
    Stage {
        state: ProjectState::Write,
        next: ProjectState::Publish,
        execution: Execution::Handler,
        gate: Some(Gate::Paper),
        dir: "04_paper",
    },
    Stage {
        state: ProjectState::Publish,
        next: ProjectState::Done,
        execution: Execution::Handler,
        gate: None,
        dir: "04_paper",
    },
];

/// Subdirectories every project directory starts with.
pub const PROJECT_SUBDIRS: [&str; 5] = ["00_idea", "01_plan", "02_exp", "03_results", "04_paper"];

/// Look up the stage row for a non-terminal state.
pub fn stage_for(state: ProjectState) -> Option<&'static Stage> {
    STAGES.iter().find(|stage| stage.state == state)
}

/// Whether `from -> to` is an edge of the pipeline graph.
///
/// Allowed: each stage to its successor, and any non-terminal state to `ABORT`.
pub fn is_allowed_edge(from: ProjectState, to: ProjectState) -> bool {
    if from.is_terminal() {
        return false;
    }
    if to == ProjectState::Abort {
        return true;
    }
    stage_for(from).is_some_and(|stage| stage.next == to)
}
