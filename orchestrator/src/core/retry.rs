//! Orchestrator-owned transitions of a project snapshot.
//!
//! `tick` decides *what* happened in a stage; these functions decide what that
//! means for `state`, `retry_count` and `failure_reason`.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::core::types::{ProjectMeta, ProjectState};

pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Coarse classification of a stage failure. Used for logging; every kind
/// consumes the same retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Handler error or gate rejection.
    Stage,
    /// Scheduler submission failure or a non-`COMPLETED` job.
    Infrastructure,
    /// A local command or batch job ran past its deadline.
    Timeout,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Stage => write!(f, "stage"),
            FailureKind::Infrastructure => write!(f, "infrastructure"),
            FailureKind::Timeout => write!(f, "timeout"),
        }
    }
}

/// Retry/escalation policy for failed stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// What a failure did to the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDecision {
    /// State unchanged; the next `tick` re-attempts the same stage.
    Retry { retry_count: u32 },
    /// Retries exhausted; the project is now `ABORT`.
    Abort { retry_count: u32 },
}

impl RetryPolicy {
    /// Record a failure on `meta`.
    ///
    /// Increments `retry_count` and stores `reason`. Once the count exceeds
    /// `max_retries` the state becomes `ABORT`.
    pub fn record_failure(
        &self,
        meta: &mut ProjectMeta,
        reason: &str,
        now: DateTime<Utc>,
    ) -> FailureDecision {
        debug_assert!(!meta.state.is_terminal());
        meta.retry_count = meta.retry_count.saturating_add(1);
        meta.failure_reason = Some(reason.to_string());
        meta.updated_at = now;
        if meta.retry_count > self.max_retries {
            meta.state = ProjectState::Abort;
            return FailureDecision::Abort {
                retry_count: meta.retry_count,
            };
        }
        FailureDecision::Retry {
            retry_count: meta.retry_count,
        }
    }
}

/// Move `meta` to `next` after a successful stage. Clears the failure reason;
/// `retry_count` is left as is.
pub fn record_advance(meta: &mut ProjectMeta, next: ProjectState, now: DateTime<Utc>) {
    meta.state = next;
    meta.failure_reason = None;
    meta.updated_at = now;
}
