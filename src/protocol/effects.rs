//! Synchronization effects produced by the protocol reducers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{HoldReason, TaskId, TaskStatus};

/// Ordered synchronization effect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum SyncEffect {
    /// Place a hold on a goal-bound task
    ApplyHold {
        task_id: TaskId,
        reason: HoldReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        next_review_at: Option<DateTime<Utc>>,
    },
    /// Clear the hold on a goal-bound task
    ClearHold { task_id: TaskId },
    /// Move a task to a new status; must be routed through the integration
    /// mutator with protocol origin, never written to the store directly
    UpdateTaskStatus {
        task_id: TaskId,
        status: TaskStatus,
        reason: String,
    },
    /// Update the owning goal's status
    UpdateGoalStatus {
        goal_id: String,
        status: String,
        reason: String,
    },
    /// Deliberate no-op, kept for audit of why nothing happened
    Noop { reason: String },
}

impl SyncEffect {
    /// Task targeted by this effect, when it targets one
    pub fn target_task(&self) -> Option<&str> {
        match self {
            SyncEffect::ApplyHold { task_id, .. }
            | SyncEffect::ClearHold { task_id }
            | SyncEffect::UpdateTaskStatus { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}

/// Goal-level status notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalStatusUpdate {
    pub goal_id: String,
    pub status: String,
    pub reason: String,
}

/// Output of a protocol reducer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReducerOutput {
    pub sync_effects: Vec<SyncEffect>,
    pub goal_status_updates: Vec<GoalStatusUpdate>,
}

impl ReducerOutput {
    pub fn is_empty(&self) -> bool {
        self.sync_effects.is_empty() && self.goal_status_updates.is_empty()
    }
}

/// Split hold effects that target the given task from everything else.
///
/// Self hold-effects must be applied to the in-memory task before its
/// `set_task` commit so the commit sees status and hold together; the
/// remainder is applied after the commit.
pub fn partition_self_hold_effects(
    task_id: &str,
    effects: Vec<SyncEffect>,
) -> (Vec<SyncEffect>, Vec<SyncEffect>) {
    effects.into_iter().partition(|effect| {
        matches!(
            effect,
            SyncEffect::ApplyHold { task_id: target, .. } | SyncEffect::ClearHold { task_id: target }
                if target == task_id
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_effects() -> Vec<SyncEffect> {
        vec![
            SyncEffect::ApplyHold {
                task_id: "t1".to_string(),
                reason: HoldReason::Preempted,
                next_review_at: None,
            },
            SyncEffect::ClearHold {
                task_id: "t2".to_string(),
            },
            SyncEffect::UpdateTaskStatus {
                task_id: "t1".to_string(),
                status: TaskStatus::Paused,
                reason: "preempted".to_string(),
            },
            SyncEffect::Noop {
                reason: "nothing to do".to_string(),
            },
        ]
    }

    #[test]
    fn partition_keeps_only_matching_hold_effects() {
        let effects = sample_effects();
        let total = effects.len();
        let (self_effects, remaining) = partition_self_hold_effects("t1", effects);

        assert_eq!(self_effects.len(), 1);
        assert!(matches!(
            &self_effects[0],
            SyncEffect::ApplyHold { task_id, .. } if task_id == "t1"
        ));
        // UpdateTaskStatus for t1 is not a hold effect and stays in the remainder
        assert_eq!(self_effects.len() + remaining.len(), total);
    }

    #[test]
    fn partition_of_unrelated_task_moves_nothing() {
        let effects = sample_effects();
        let (self_effects, remaining) = partition_self_hold_effects("elsewhere", effects);
        assert!(self_effects.is_empty());
        assert_eq!(remaining.len(), 4);
    }
}
