//! Run and step lifecycle bookkeeping.

use crate::step::StepName;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Lifecycle of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Canceled,
}

impl RunState {
    /// Returns `true` once the run ended.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Canceled
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Canceled => "canceled",
        };
        f.write_str(state)
    }
}

/// Lifecycle of one step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            StepState::Pending => "pending",
            StepState::Running => "running",
            StepState::Completed => "completed",
            StepState::Failed => "failed",
            StepState::Skipped => "skipped",
        };
        f.write_str(state)
    }
}

/// Status of one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepStatus {
    pub state: StepState,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub retries: u32,
}

/// Status of a workflow run.
///
/// Errors are kept in their string form so that status copies can be
/// handed out freely.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkflowStatus {
    pub state: RunState,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub current_step: Option<StepName>,
    pub error: Option<String>,
    pub steps: HashMap<StepName, StepStatus>,
}

impl WorkflowStatus {
    /// Returns the status of a step, if it was registered for this run.
    pub fn step(&self, name: &str) -> Option<&StepStatus> {
        self.steps.get(name)
    }

    /// Returns the state of a step, `None` if it is unknown to this run.
    pub fn step_state(&self, name: &str) -> Option<StepState> {
        self.step(name).map(|status| status.state)
    }
}
