//! Effect application and management-action preconditioning
//!
//! The applier consumes reducer output through an injected dependency
//! surface. Hold effects that target the task whose change produced them
//! must already have been partitioned off and applied in memory before the
//! commit; what reaches the applier here is the cross-task remainder.

use tracing::{debug, warn};

use crate::error::{SpineError, SpineResult};
use crate::protocol::effects::SyncEffect;
use crate::protocol::hold::{apply_hold, clear_hold};
use crate::task::{Hold, HoldReason, Task, TaskStatus};

/// Origin tag carried by every status mutator; protocol-origin mutations
/// suppress re-entrant hook firing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOrigin {
    Runtime,
    Protocol,
}

/// Dependency surface injected into the applier
pub trait EffectContext {
    fn get_task(&self, id: &str) -> Option<Task>;
    /// Commit a mutated task through the store
    fn commit_task(&self, task: Task);
    /// Route a status change through the integration mutator with
    /// protocol origin; never writes to the store directly
    fn route_task_status(&self, id: &str, status: TaskStatus, reason: &str);
    fn update_goal_status(&self, goal_id: &str, status: &str, reason: &str);
}

/// Apply cross-task synchronization effects in order
pub fn apply_sync_effects(ctx: &dyn EffectContext, effects: &[SyncEffect]) {
    for effect in effects {
        match effect {
            SyncEffect::ApplyHold {
                task_id,
                reason,
                next_review_at,
            } => match ctx.get_task(task_id) {
                Some(mut task) => {
                    apply_hold(&mut task, *reason, *next_review_at);
                    ctx.commit_task(task);
                }
                None => warn!(task_id = %task_id, "apply_hold target missing"),
            },
            SyncEffect::ClearHold { task_id } => match ctx.get_task(task_id) {
                Some(mut task) => {
                    clear_hold(&mut task);
                    ctx.commit_task(task);
                }
                None => warn!(task_id = %task_id, "clear_hold target missing"),
            },
            SyncEffect::UpdateTaskStatus {
                task_id,
                status,
                reason,
            } => {
                ctx.route_task_status(task_id, *status, reason);
            }
            SyncEffect::UpdateGoalStatus {
                goal_id,
                status,
                reason,
            } => {
                ctx.update_goal_status(goal_id, status, reason);
            }
            SyncEffect::Noop { reason } => {
                debug!(reason = %reason, "protocol noop effect");
            }
        }
    }
}

/// Management action requested by a user
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ManagementAction {
    Pause,
    Resume,
    Cancel,
    Prioritize(f64),
}

impl ManagementAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagementAction::Pause => "pause",
            ManagementAction::Resume => "resume",
            ManagementAction::Cancel => "cancel",
            ManagementAction::Prioritize(_) => "prioritize",
        }
    }
}

/// Hold change pre-computed before the management handler runs
#[derive(Debug, Clone, PartialEq)]
pub enum HoldChange {
    None,
    Set(HoldReason),
    Clear,
}

/// Pre-computed plan for a management action, carrying enough state to
/// roll the hold back if the handler rejects the transition
#[derive(Debug, Clone)]
pub struct ManagementPlan {
    pub action: ManagementAction,
    pub next_status: Option<TaskStatus>,
    pub hold_change: HoldChange,
    /// Deep clone of the pre-existing hold, for rollback
    pub previous_hold: Option<Hold>,
}

/// Precondition a management action against the current task state.
///
/// Immutable tasks reject every management action. The hold change is
/// computed here so the handler commits status and hold together.
pub fn plan_management_action(
    task: &Task,
    action: ManagementAction,
) -> SpineResult<ManagementPlan> {
    if task.status.is_immutable() {
        return Err(SpineError::InvalidTransition {
            from: task.status.to_string(),
            to: action.as_str().to_string(),
        });
    }

    let previous_hold = task
        .metadata
        .goal_binding
        .as_ref()
        .and_then(|binding| binding.hold.clone());

    let plan = match action {
        ManagementAction::Pause => {
            if task.status == TaskStatus::Paused {
                return Err(SpineError::InvalidTransition {
                    from: task.status.to_string(),
                    to: "paused".to_string(),
                });
            }
            ManagementPlan {
                action,
                next_status: Some(TaskStatus::Paused),
                hold_change: if task.metadata.goal_binding.is_some() {
                    HoldChange::Set(HoldReason::ManualPause)
                } else {
                    HoldChange::None
                },
                previous_hold,
            }
        }
        ManagementAction::Resume => {
            if task.status != TaskStatus::Paused {
                return Err(SpineError::InvalidTransition {
                    from: task.status.to_string(),
                    to: "pending".to_string(),
                });
            }
            ManagementPlan {
                action,
                next_status: Some(TaskStatus::Pending),
                hold_change: if previous_hold.is_some() {
                    HoldChange::Clear
                } else {
                    HoldChange::None
                },
                previous_hold,
            }
        }
        ManagementAction::Cancel => ManagementPlan {
            action,
            next_status: Some(TaskStatus::Failed),
            hold_change: if previous_hold.is_some() {
                HoldChange::Clear
            } else {
                HoldChange::None
            },
            previous_hold,
        },
        ManagementAction::Prioritize(_) => ManagementPlan {
            action,
            next_status: None,
            hold_change: HoldChange::None,
            previous_hold,
        },
    };

    Ok(plan)
}

/// Apply the pre-computed hold change to an in-memory task
pub fn apply_hold_change(task: &mut Task, plan: &ManagementPlan) {
    match &plan.hold_change {
        HoldChange::None => {}
        HoldChange::Set(reason) => apply_hold(task, *reason, None),
        HoldChange::Clear => {
            clear_hold(task);
        }
    }
}

/// Roll the hold back to its pre-plan state after a rejected transition
pub fn rollback_hold_change(task: &mut Task, plan: &ManagementPlan) {
    if plan.hold_change == HoldChange::None {
        return;
    }
    if let Some(binding) = task.metadata.goal_binding.as_mut() {
        binding.hold = plan.previous_hold.clone();
        task.metadata.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{new_task_id, GoalBinding, TaskMetadata, TaskSource, TaskType};
    use chrono::Utc;
    use serde_json::Value;

    fn task_with(status: TaskStatus, bound: bool) -> Task {
        Task {
            id: new_task_id(),
            title: "t".to_string(),
            task_type: TaskType::Mining,
            status,
            source: TaskSource::Goal,
            priority: 0.5,
            urgency: 0.5,
            progress: 0.0,
            steps: Vec::new(),
            parameters: Value::Null,
            metadata: TaskMetadata {
                goal_binding: bound.then(|| GoalBinding {
                    goal_instance_id: "goal-1".to_string(),
                    goal_type: "acquire_item".to_string(),
                    provisional_key: None,
                    verifier: None,
                    goal_id: None,
                    hold: None,
                }),
                ..Default::default()
            },
            created_at: Utc::now(),
            error: None,
            failure_code: None,
        }
    }

    #[test]
    fn immutable_tasks_reject_management() {
        for status in [TaskStatus::Completed, TaskStatus::Failed] {
            let task = task_with(status, true);
            for action in [
                ManagementAction::Pause,
                ManagementAction::Resume,
                ManagementAction::Cancel,
                ManagementAction::Prioritize(0.9),
            ] {
                let result = plan_management_action(&task, action);
                assert!(
                    matches!(result, Err(SpineError::InvalidTransition { .. })),
                    "{:?} on {:?} should be rejected",
                    action,
                    status
                );
            }
        }
    }

    #[test]
    fn pause_on_bound_task_plans_manual_pause() {
        let task = task_with(TaskStatus::Active, true);
        let plan = plan_management_action(&task, ManagementAction::Pause).unwrap();
        assert_eq!(plan.next_status, Some(TaskStatus::Paused));
        assert_eq!(plan.hold_change, HoldChange::Set(HoldReason::ManualPause));
    }

    #[test]
    fn rollback_restores_previous_hold() {
        let mut task = task_with(TaskStatus::Active, true);
        apply_hold(&mut task, HoldReason::WaitingOnPrereq, None);

        let plan = plan_management_action(&task, ManagementAction::Pause).unwrap();
        apply_hold_change(&mut task, &plan);
        assert_eq!(
            task.metadata.goal_binding.as_ref().unwrap().hold.as_ref().unwrap().reason,
            HoldReason::ManualPause
        );

        rollback_hold_change(&mut task, &plan);
        assert_eq!(
            task.metadata.goal_binding.as_ref().unwrap().hold.as_ref().unwrap().reason,
            HoldReason::WaitingOnPrereq
        );
    }

    #[test]
    fn resume_requires_paused() {
        let task = task_with(TaskStatus::Active, true);
        assert!(plan_management_action(&task, ManagementAction::Resume).is_err());
    }
}
