//! Stage status, run outcome and the run state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The execution status of a single stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Stage has not started.
    Pending,
    /// Stage is currently running.
    Running,
    /// Every step of the stage succeeded.
    Succeeded,
    /// A gate or step of the stage failed.
    Failed,
    /// The stage was interrupted or never ran because an earlier stage failed.
    Aborted,
}

impl Default for StageStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

impl StageStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }

    /// Returns true if the status indicates success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// The terminal outcome of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Every stage succeeded.
    Succeeded,
    /// A stage failed; later stages were aborted.
    Failed,
    /// The invoker cancelled the run.
    Aborted,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

impl Outcome {
    /// Returns true for [`Outcome::Succeeded`].
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// State machine for a run: `Pending -> Running(i) -> {Running(i+1) | Failed | Aborted}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No stage has started.
    Pending,
    /// The stage at this index is running.
    Running(usize),
    /// All stages succeeded.
    Succeeded,
    /// A stage failed.
    Failed,
    /// The run was cancelled.
    Aborted,
}

/// An illegal state machine transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    /// The state the machine was in.
    pub from: RunState,
    /// The requested state.
    pub to: RunState,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid run state transition {:?} -> {:?}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

impl RunState {
    /// Returns true if the run has reached a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }

    /// Returns the outcome for a terminal state.
    #[must_use]
    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            Self::Succeeded => Some(Outcome::Succeeded),
            Self::Failed => Some(Outcome::Failed),
            Self::Aborted => Some(Outcome::Aborted),
            Self::Pending | Self::Running(_) => None,
        }
    }

    /// Moves to `next`, rejecting transitions the machine does not allow.
    ///
    /// Stages advance one index at a time; `Succeeded` is only reachable
    /// from `Pending` (empty plan) or a running stage.
    pub fn transition(self, next: Self) -> Result<Self, InvalidTransition> {
        let allowed = match (self, next) {
            (Self::Pending, Self::Running(0)) => true,
            (Self::Running(i), Self::Running(j)) => j == i + 1,
            (Self::Pending | Self::Running(_), Self::Succeeded | Self::Failed | Self::Aborted) => true,
            _ => false,
        };
        if allowed {
            Ok(next)
        } else {
            Err(InvalidTransition { from: self, to: next })
        }
    }
}
