//! Hold primitives and commit-boundary consistency checks

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{Hold, HoldReason, Task, TaskStatus};

/// Attach a hold to a goal-bound task's binding in memory.
/// Re-applying the same reason refreshes the review time only.
pub fn apply_hold(task: &mut Task, reason: HoldReason, next_review_at: Option<DateTime<Utc>>) {
    let Some(binding) = task.metadata.goal_binding.as_mut() else {
        return;
    };
    match binding.hold.as_mut() {
        Some(existing) if existing.reason == reason => {
            existing.next_review_at = next_review_at.or(existing.next_review_at);
        }
        _ => {
            binding.hold = Some(Hold {
                reason,
                held_at: Utc::now(),
                resume_hints: Vec::new(),
                next_review_at,
            });
        }
    }
    task.metadata.touch();
}

/// Remove the hold from a goal-bound task in memory
pub fn clear_hold(task: &mut Task) -> Option<Hold> {
    let binding = task.metadata.goal_binding.as_mut()?;
    let cleared = binding.hold.take();
    if cleared.is_some() {
        task.metadata.touch();
    }
    cleared
}

/// Violations detectable on a committed task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IllegalState {
    /// `blocked_reason` and `blocked_at` must be set together
    BlockedPairMismatch,
    /// Paused goal-bound tasks must carry a hold
    PausedWithoutHold,
    /// All steps done but the task is not terminal; tolerated before the
    /// goal verifier confirms completion
    DoneButNotCompleted,
}

impl IllegalState {
    /// The pre-verifier relaxation is reported but not treated as a defect
    pub fn is_relaxed(&self) -> bool {
        matches!(self, IllegalState::DoneButNotCompleted)
    }
}

/// Observer-snapshot check run against a task at a commit boundary
pub fn detect_illegal_states(task: &Task) -> Vec<IllegalState> {
    let mut violations = Vec::new();

    if task.metadata.blocked_reason.is_some() != task.metadata.blocked_at.is_some() {
        violations.push(IllegalState::BlockedPairMismatch);
    }

    if task.status == TaskStatus::Paused {
        if let Some(binding) = &task.metadata.goal_binding {
            if binding.hold.is_none() {
                violations.push(IllegalState::PausedWithoutHold);
            }
        }
    }

    if !task.steps.is_empty()
        && task.steps.iter().all(|step| step.done)
        && !task.status.is_terminal()
    {
        violations.push(IllegalState::DoneButNotCompleted);
    }

    violations
}
