//! Pure protocol reducers
//!
//! Task-state changes and goal-level events reduce to ordered
//! synchronization effects. Reducers never touch the store; the applier
//! commits their output under the integration's ordering discipline.

use serde::{Deserialize, Serialize};

use crate::protocol::effects::{GoalStatusUpdate, ReducerOutput, SyncEffect};
use crate::task::{HoldReason, Task, TaskStatus};

/// What caused a status change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusChangeCause {
    /// Normal runtime mutation (executor, integration)
    Runtime,
    /// Explicit user management action
    UserManagement,
    /// Protocol-origin cascade; hooks are suppressed upstream
    Protocol,
}

/// Goal-level lifecycle action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalAction {
    Paused,
    Resumed,
    Cancelled,
}

/// Goal event routed through the protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalEvent {
    pub goal_id: String,
    pub action: GoalAction,
}

fn binding_goal_id(task: &Task) -> Option<String> {
    task.metadata
        .goal_binding
        .as_ref()
        .map(|binding| binding.goal_id.clone().unwrap_or_else(|| binding.goal_instance_id.clone()))
}

/// Reduce a task status transition into protocol effects.
/// Tasks without a goal binding produce no effects.
pub fn on_task_status_changed(
    task: &Task,
    previous: TaskStatus,
    next: TaskStatus,
    cause: StatusChangeCause,
) -> ReducerOutput {
    let mut output = ReducerOutput::default();
    let Some(binding) = &task.metadata.goal_binding else {
        return output;
    };
    if previous == next {
        return output;
    }
    let goal_id = binding
        .goal_id
        .clone()
        .unwrap_or_else(|| binding.goal_instance_id.clone());

    match next {
        TaskStatus::Paused => {
            if binding.hold.is_none() {
                let reason = match cause {
                    StatusChangeCause::UserManagement => HoldReason::ManualPause,
                    _ => HoldReason::Preempted,
                };
                output.sync_effects.push(SyncEffect::ApplyHold {
                    task_id: task.id.clone(),
                    reason,
                    next_review_at: None,
                });
            }
        }
        TaskStatus::Active | TaskStatus::InProgress | TaskStatus::Pending
            if previous == TaskStatus::Paused =>
        {
            match binding.hold.as_ref().map(|hold| hold.reason) {
                Some(HoldReason::ManualPause) if cause != StatusChangeCause::UserManagement => {
                    // Hard wall: only an explicit user action clears a manual pause
                    output.sync_effects.push(SyncEffect::Noop {
                        reason: "manual_pause hold is a hard wall".to_string(),
                    });
                    output.sync_effects.push(SyncEffect::UpdateTaskStatus {
                        task_id: task.id.clone(),
                        status: TaskStatus::Paused,
                        reason: "manual_pause hold reasserted".to_string(),
                    });
                }
                Some(_) => {
                    output.sync_effects.push(SyncEffect::ClearHold {
                        task_id: task.id.clone(),
                    });
                }
                None => {}
            }
        }
        TaskStatus::Completed | TaskStatus::Failed => {
            if binding.hold.is_some() {
                output.sync_effects.push(SyncEffect::ClearHold {
                    task_id: task.id.clone(),
                });
            }
            output.goal_status_updates.push(GoalStatusUpdate {
                goal_id,
                status: if next == TaskStatus::Completed {
                    "task_completed".to_string()
                } else {
                    "task_failed".to_string()
                },
                reason: format!("task {} reached {}", task.id, next),
            });
        }
        _ => {}
    }

    output
}

/// Reduce a progress update; full progress notifies the owning goal
pub fn on_task_progress_updated(task: &Task, progress: f64) -> ReducerOutput {
    let mut output = ReducerOutput::default();
    if progress >= 1.0 && !task.status.is_terminal() {
        if let Some(goal_id) = binding_goal_id(task) {
            output.goal_status_updates.push(GoalStatusUpdate {
                goal_id,
                status: "task_progress_complete".to_string(),
                reason: format!("task {} progress reached 1.0", task.id),
            });
        }
    }
    output
}

/// Reduce a goal action over its bound tasks.
///
/// Effects fan out per task: pauses hold-and-suspend, resumes clear holds
/// and re-queue (except across the `manual_pause` hard wall), cancellation
/// terminates every non-terminal task.
pub fn on_goal_action(event: &GoalEvent, bound_tasks: &[Task]) -> ReducerOutput {
    let mut output = ReducerOutput::default();

    for task in bound_tasks {
        if task.status.is_terminal() {
            output.sync_effects.push(SyncEffect::Noop {
                reason: format!("task {} is terminal", task.id),
            });
            continue;
        }
        let hold_reason = task
            .metadata
            .goal_binding
            .as_ref()
            .and_then(|binding| binding.hold.as_ref())
            .map(|hold| hold.reason);

        match event.action {
            GoalAction::Paused => {
                if hold_reason == Some(HoldReason::ManualPause) {
                    output.sync_effects.push(SyncEffect::Noop {
                        reason: format!("task {} already under manual_pause", task.id),
                    });
                    continue;
                }
                output.sync_effects.push(SyncEffect::ApplyHold {
                    task_id: task.id.clone(),
                    reason: HoldReason::GoalPaused,
                    next_review_at: None,
                });
                if task.status != TaskStatus::Paused {
                    output.sync_effects.push(SyncEffect::UpdateTaskStatus {
                        task_id: task.id.clone(),
                        status: TaskStatus::Paused,
                        reason: format!("goal {} paused", event.goal_id),
                    });
                }
            }
            GoalAction::Resumed => match hold_reason {
                Some(HoldReason::ManualPause) => {
                    // Hard wall: goal resume never crosses a manual pause
                    output.sync_effects.push(SyncEffect::Noop {
                        reason: format!(
                            "task {} held by manual_pause; goal resume does not clear it",
                            task.id
                        ),
                    });
                }
                Some(_) => {
                    // Status first: the intermediate commit must never show
                    // a paused task without its hold
                    output.sync_effects.push(SyncEffect::UpdateTaskStatus {
                        task_id: task.id.clone(),
                        status: TaskStatus::Pending,
                        reason: format!("goal {} resumed", event.goal_id),
                    });
                    output.sync_effects.push(SyncEffect::ClearHold {
                        task_id: task.id.clone(),
                    });
                }
                None => {
                    if task.status == TaskStatus::Paused {
                        output.sync_effects.push(SyncEffect::UpdateTaskStatus {
                            task_id: task.id.clone(),
                            status: TaskStatus::Pending,
                            reason: format!("goal {} resumed", event.goal_id),
                        });
                    }
                }
            },
            GoalAction::Cancelled => {
                output.sync_effects.push(SyncEffect::UpdateTaskStatus {
                    task_id: task.id.clone(),
                    status: TaskStatus::Failed,
                    reason: format!("goal {} cancelled", event.goal_id),
                });
                if hold_reason.is_some() {
                    output.sync_effects.push(SyncEffect::ClearHold {
                        task_id: task.id.clone(),
                    });
                }
            }
        }
    }

    if event.action == GoalAction::Cancelled {
        output.sync_effects.push(SyncEffect::UpdateGoalStatus {
            goal_id: event.goal_id.clone(),
            status: "cancelled".to_string(),
            reason: "goal cancelled".to_string(),
        });
    }

    output
}
