// taskspine/tests/task_finalization.rs
//! Integration tests for the task finalization pipeline:
//! origin stamping, metadata allowlist propagation, blocked-pair
//! invariants, advisory handling, and the Rig-E sentinel.

use std::sync::Arc;

use serde_json::json;
use taskspine::events::{EventBus, LifecycleEventKind, SpineEvent};
use taskspine::integration::{MetadataPatch, NewTask, TaskIntegration};
use taskspine::task::{
    GoalBinding, Origin, OriginKind, TaskMetadata, TaskSource, TaskStatus, TaskStore, TaskType,
};
use taskspine::ExecutorConfig;

fn harness() -> (
    Arc<TaskIntegration>,
    Arc<TaskStore>,
    tokio::sync::mpsc::UnboundedReceiver<SpineEvent>,
) {
    let config = ExecutorConfig::default();
    let store = Arc::new(TaskStore::new(64, false));
    let (events, rx) = EventBus::new();
    let integration = Arc::new(TaskIntegration::new(Arc::clone(&store), config, events));
    (integration, store, rx)
}

fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<SpineEvent>) -> Vec<SpineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn binding() -> GoalBinding {
    GoalBinding {
        goal_instance_id: "goal-7".to_string(),
        goal_type: "acquire_item".to_string(),
        provisional_key: None,
        verifier: Some("inventory_check".to_string()),
        goal_id: Some("goal-7".to_string()),
        hold: None,
    }
}

#[tokio::test]
async fn origin_is_stamped_exactly_once() {
    // Arrange
    let (integration, _store, _rx) = harness();
    let mut partial = NewTask::new("Craft a wooden pickaxe", TaskType::Crafting, TaskSource::Manual);
    partial.parameters = json!({"item": "wooden_pickaxe", "quantity": 1});

    // Act
    let task = integration.add_task(partial).await.unwrap();

    // Assert
    let origin = task.metadata.origin.clone().expect("origin stamped");
    assert_eq!(origin.kind, OriginKind::Api);
    assert!(origin.created_at.timestamp() > 0);

    // A metadata patch cannot overwrite it
    let patched = integration
        .update_task_metadata(
            &task.id,
            MetadataPatch {
                origin: Some(Origin {
                    kind: OriginKind::Executor,
                    name: Some("intruder".to_string()),
                    created_at: origin.created_at,
                    parent_task_id: None,
                    parent_goal_key: None,
                }),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(patched.metadata.origin.unwrap().kind, OriginKind::Api);
}

#[tokio::test]
async fn origin_inference_covers_every_source() {
    let (integration, _store, _rx) = harness();

    // Goal binding present -> goal_resolver
    let mut bound = NewTask::new("Gather oak logs", TaskType::Gathering, TaskSource::Goal);
    bound.metadata.goal_binding = Some(binding());
    bound.parameters = json!({"resource": "oak_log"});
    let task = integration.add_task(bound).await.unwrap();
    assert_eq!(task.metadata.origin.unwrap().kind, OriginKind::GoalResolver);

    // Goal source without binding -> goal_source
    let mut unbound = NewTask::new("Mine iron ore", TaskType::Mining, TaskSource::Goal);
    unbound.parameters = json!({"block": "iron_ore"});
    let task = integration.add_task(unbound).await.unwrap();
    assert_eq!(task.metadata.origin.unwrap().kind, OriginKind::GoalSource);

    // Autonomous with cognitive tags -> cognition
    let mut cognitive = NewTask::new("Collect sand", TaskType::Gathering, TaskSource::Autonomous);
    cognitive.metadata.tags = vec!["thought".to_string()];
    cognitive.parameters = json!({"resource": "sand"});
    let task = integration.add_task(cognitive).await.unwrap();
    assert_eq!(task.metadata.origin.unwrap().kind, OriginKind::Cognition);

    // Parent task id -> executor
    let mut child = NewTask::new("Craft sticks", TaskType::Crafting, TaskSource::Planner);
    child.metadata.parent_task_id = Some("parent-1".to_string());
    child.parameters = json!({"item": "stick"});
    let task = integration.add_task(child).await.unwrap();
    assert_eq!(task.metadata.origin.unwrap().kind, OriginKind::Executor);
}

#[tokio::test]
async fn metadata_allowlist_drops_everything_else() {
    // Arrange: incoming metadata with allowlisted and stray content
    let (integration, _store, _rx) = harness();
    let mut partial = NewTask::new("Craft a furnace", TaskType::Crafting, TaskSource::Manual);
    partial.parameters = json!({"item": "furnace"});
    partial.metadata = TaskMetadata {
        goal_key: Some("".to_string()), // empty string is dropped
        category: Some("infrastructure".to_string()),
        tags: vec!["base".to_string()],
        ..Default::default()
    };
    partial
        .metadata
        .extensions
        .insert("smuggled".to_string(), json!({"payload": true}));

    // Act
    let task = integration.add_task(partial).await.unwrap();

    // Assert
    assert!(task.metadata.extensions.is_empty());
    assert_eq!(task.metadata.goal_key, None);
    assert_eq!(task.metadata.category.as_deref(), Some("infrastructure"));
    assert_eq!(task.metadata.tags, vec!["base".to_string()]);
}

#[tokio::test]
async fn blocked_pair_backfill_uses_updated_at_not_now() {
    // Arrange: a partial arriving blocked without an anchor
    let (integration, _store, _rx) = harness();
    let stale = chrono::Utc::now() - chrono::Duration::minutes(10);
    let mut partial = NewTask::new("Wait on smelting", TaskType::General, TaskSource::Manual);
    partial.steps = vec![taskspine::task::TaskStep::leaf(
        0,
        "wait",
        "minecraft.wait",
        json!({}),
    )];
    partial.metadata.blocked_reason = Some("waiting_on_prereq".to_string());
    partial.metadata.updated_at = stale;

    // Act
    let task = integration.add_task(partial).await.unwrap();

    // Assert: the anchor is the stale updated_at, so TTLs are not extended
    assert_eq!(task.metadata.blocked_at, Some(stale));
}

#[tokio::test]
async fn ttl_anchor_semantics_across_patches() {
    let (integration, _store, _rx) = harness();
    let mut partial = NewTask::new("Craft a chest", TaskType::Crafting, TaskSource::Manual);
    partial.parameters = json!({"item": "chest"});
    let task = integration.add_task(partial).await.unwrap();

    // First block sets the anchor
    let blocked = integration
        .update_task_metadata(
            &task.id,
            MetadataPatch {
                blocked_reason: Some(Some("waiting_on_prereq".to_string())),
                ..Default::default()
            },
        )
        .unwrap();
    let anchor = blocked.metadata.blocked_at.expect("anchor set");

    // Re-applying the same reason preserves the anchor
    let reblocked = integration
        .update_task_metadata(
            &task.id,
            MetadataPatch {
                blocked_reason: Some(Some("waiting_on_prereq".to_string())),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(reblocked.metadata.blocked_at, Some(anchor));

    // A reason change resets it
    let switched = integration
        .update_task_metadata(
            &task.id,
            MetadataPatch {
                blocked_reason: Some(Some("infra_error_tripped".to_string())),
                ..Default::default()
            },
        )
        .unwrap();
    assert!(switched.metadata.blocked_at.unwrap() > anchor);

    // An explicit caller-provided anchor wins
    let explicit = chrono::Utc::now() - chrono::Duration::minutes(30);
    let pinned = integration
        .update_task_metadata(
            &task.id,
            MetadataPatch {
                blocked_reason: Some(Some("infra_error_tripped".to_string())),
                blocked_at: Some(explicit),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(pinned.metadata.blocked_at, Some(explicit));

    // Clearing removes the pair together
    let cleared = integration
        .update_task_metadata(
            &task.id,
            MetadataPatch {
                blocked_reason: Some(None),
                ..Default::default()
            },
        )
        .unwrap();
    assert!(cleared.metadata.blocked_reason.is_none());
    assert!(cleared.metadata.blocked_at.is_none());
}

#[tokio::test]
async fn advisory_actions_skip_step_generation() {
    let (integration, _store, _rx) = harness();
    let partial = NewTask::new(
        "Consider moving the base",
        TaskType::AdvisoryAction,
        TaskSource::Autonomous,
    );

    let task = integration.add_task(partial).await.unwrap();

    assert!(task.steps.is_empty());
    assert_eq!(task.metadata.blocked_reason.as_deref(), Some("advisory_action"));
    assert_eq!(task.metadata.no_steps_reason.as_deref(), Some("advisory-skip"));
    assert!(task.metadata.blocked_at.is_some());
}

#[tokio::test]
async fn rig_e_sentinel_blocks_without_planner() {
    let (integration, _store, mut rx) = harness();
    let partial = NewTask::new("Navigate to the village", TaskType::Navigation, TaskSource::Goal);

    let task = integration.add_task(partial).await.unwrap();

    assert_eq!(task.status, TaskStatus::PendingPlanning);
    assert_eq!(
        task.metadata.blocked_reason.as_deref(),
        Some("rig_e_solver_unimplemented")
    );

    let events = drain(&mut rx);
    assert!(events.iter().any(|event| matches!(
        event,
        SpineEvent::TaskLifecycleEvent { kind: LifecycleEventKind::SolverUnavailable, .. }
    )));
}

#[tokio::test]
async fn goal_sourced_task_without_binding_emits_drift() {
    let (integration, _store, mut rx) = harness();
    let mut partial = NewTask::new("Mine some coal", TaskType::Mining, TaskSource::Goal);
    partial.parameters = json!({"block": "coal_ore"});

    integration.add_task(partial).await.unwrap();

    let events = drain(&mut rx);
    let drift = events.iter().find_map(|event| match event {
        SpineEvent::TaskLifecycleEvent {
            kind: LifecycleEventKind::GoalBindingDrift,
            detail,
            ..
        } => Some(detail.clone()),
        _ => None,
    });
    let detail = drift.expect("drift event");
    assert_eq!(detail["reason"], "goal_resolver_disabled");
    assert_eq!(detail["source"], "goal");
}

#[tokio::test]
async fn high_priority_tasks_emit_lifecycle_event() {
    let (integration, _store, mut rx) = harness();
    let mut partial = NewTask::new("Craft an iron sword", TaskType::Crafting, TaskSource::Manual);
    partial.parameters = json!({"item": "iron_sword"});
    partial.priority = 0.9;

    integration.add_task(partial).await.unwrap();

    let events = drain(&mut rx);
    assert!(events.iter().any(|event| matches!(
        event,
        SpineEvent::TaskLifecycleEvent { kind: LifecycleEventKind::HighPriorityAdded, .. }
    )));
    assert!(events
        .iter()
        .any(|event| matches!(event, SpineEvent::TaskAdded { .. })));
}

#[tokio::test]
async fn duplicate_titles_dedupe_to_the_existing_task() {
    let (integration, store, _rx) = harness();
    let mut first = NewTask::new("Gather oak logs", TaskType::Gathering, TaskSource::Manual);
    first.parameters = json!({"resource": "oak_log"});
    let original = integration.add_task(first).await.unwrap();

    let mut second = NewTask::new("Gather oak logs", TaskType::Gathering, TaskSource::Manual);
    second.parameters = json!({"resource": "oak_log"});
    let deduped = integration.add_task(second).await.unwrap();

    assert_eq!(original.id, deduped.id);
    assert_eq!(store.get_all().len(), 1);
}

#[tokio::test]
async fn goal_key_is_computed_from_binding_and_parameters() {
    let (integration, _store, _rx) = harness();
    let mut partial = NewTask::new("Gather birch logs", TaskType::Gathering, TaskSource::Goal);
    partial.metadata.goal_binding = Some(binding());
    partial.parameters = json!({"resource": "birch_log", "count": 8});

    let task = integration.add_task(partial).await.unwrap();

    let goal_key = task.metadata.goal_key.expect("goal key");
    assert!(goal_key.starts_with("acquire_item::"));
    assert!(goal_key.contains("birch_log"));
}
