//! Finalization helpers: metadata propagation and origin stamping

use chrono::Utc;
use tracing::warn;

use crate::task::{Origin, OriginKind, Task, TaskMetadata, TaskSource, TaskType};

/// Rebuild incoming metadata, keeping only the vetted allowlist.
///
/// Everything outside the allowlist is dropped, including extensions; an
/// empty-string goal key is dropped rather than propagated.
pub fn propagate_metadata(input: &TaskMetadata) -> TaskMetadata {
    TaskMetadata {
        origin: input.origin.clone(),
        goal_key: input
            .goal_key
            .clone()
            .filter(|key| !key.trim().is_empty()),
        subtask_key: input.subtask_key.clone(),
        goal_binding: input.goal_binding.clone(),
        solver: input.solver.clone(),
        sterling: input.sterling.clone(),
        task_provenance: input.task_provenance.clone(),
        reflex_instance_id: input.reflex_instance_id.clone(),
        blocked_reason: input.blocked_reason.clone(),
        blocked_at: input.blocked_at,
        no_steps_reason: None,
        parent_task_id: input.parent_task_id.clone(),
        tags: input.tags.clone(),
        category: input.category.clone(),
        requirement: input.requirement.clone(),
        next_eligible_at: input.next_eligible_at,
        retry_count: 0,
        updated_at: input.updated_at,
        extensions: Default::default(),
    }
}

/// Tags that mark a task as born from the cognitive stream
fn has_cognitive_tags(metadata: &TaskMetadata) -> bool {
    metadata.reflex_instance_id.is_some()
        || metadata
            .tags
            .iter()
            .any(|tag| tag == "cognition" || tag == "thought" || tag == "reflection")
}

/// Infer the origin kind for a task being finalized
pub fn infer_origin_kind(task: &Task) -> OriginKind {
    if task.metadata.goal_binding.is_some() {
        OriginKind::GoalResolver
    } else if task.source == TaskSource::Goal {
        OriginKind::GoalSource
    } else if task.source == TaskSource::Autonomous && has_cognitive_tags(&task.metadata) {
        OriginKind::Cognition
    } else if task.metadata.parent_task_id.is_some() {
        OriginKind::Executor
    } else {
        OriginKind::Api
    }
}

/// Stamp the origin exactly once; a pre-existing origin is never replaced
pub fn stamp_origin(task: &mut Task) {
    if task.metadata.origin.is_some() {
        return;
    }
    let kind = infer_origin_kind(task);
    task.metadata.origin = Some(Origin {
        kind,
        name: None,
        created_at: Utc::now(),
        parent_task_id: task.metadata.parent_task_id.clone(),
        parent_goal_key: task.metadata.goal_key.clone(),
    });
}

/// Task types the goal resolver gates; goal-sourced tasks of other types
/// drift without a binding by construction
const GOAL_GATED_TYPES: &[TaskType] = &[
    TaskType::Crafting,
    TaskType::Mining,
    TaskType::Gathering,
    TaskType::Building,
];

/// Classify why a goal-sourced task arrived without a goal binding
pub fn drift_reason(task: &Task) -> Option<String> {
    if task.source != TaskSource::Goal || task.metadata.goal_binding.is_some() {
        return None;
    }
    if GOAL_GATED_TYPES.contains(&task.task_type) {
        Some("goal_resolver_disabled".to_string())
    } else {
        Some(format!("type_not_gated:{}", task.task_type))
    }
}

/// Warn-and-drop handling for origin keys arriving in a metadata patch
pub fn reject_origin_patch(task_id: &str) {
    warn!(
        task_id,
        "metadata patch attempted to overwrite origin; key ignored"
    );
}
