// taskspine/tests/sterling_ingest.rs
//! Integration tests for the Sterling IR ingest pathway: digest expansion
//! with bounded retry, intent-leaf resolution, the splice algorithm, and
//! the fail-closed blocked outcomes.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use taskspine::error::SpineResult;
use taskspine::events::EventBus;
use taskspine::integration::collaborators::{
    ExpandByDigest, IntentReplacement, IntentResolutionContext, MinecraftData, SterlingExecutor,
};
use taskspine::integration::{NewTask, TaskIntegration};
use taskspine::task::{SterlingMeta, TaskSource, TaskStatus, TaskStep, TaskStore, TaskType};
use taskspine::ExecutorConfig;

/// Scripted Sterling executor: refuses the digest a fixed number of times,
/// then expands to the scripted steps
struct ScriptedSterling {
    refusals: u32,
    refusal_reason: String,
    calls: AtomicU32,
    steps: Vec<TaskStep>,
    replacements: Vec<IntentReplacement>,
}

impl ScriptedSterling {
    fn expanding(steps: Vec<TaskStep>, replacements: Vec<IntentReplacement>) -> Self {
        Self {
            refusals: 0,
            refusal_reason: "blocked_digest_unknown".to_string(),
            calls: AtomicU32::new(0),
            steps,
            replacements,
        }
    }

    fn refusing(times: u32, reason: &str, steps: Vec<TaskStep>) -> Self {
        Self {
            refusals: times,
            refusal_reason: reason.to_string(),
            calls: AtomicU32::new(0),
            steps,
            replacements: Vec::new(),
        }
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SterlingExecutor for ScriptedSterling {
    async fn expand_by_digest(&self, _digest: &str) -> SpineResult<ExpandByDigest> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.refusals {
            Ok(ExpandByDigest::Blocked {
                reason: self.refusal_reason.clone(),
            })
        } else {
            Ok(ExpandByDigest::Ok {
                steps: self.steps.clone(),
            })
        }
    }

    async fn resolve_intent_steps(
        &self,
        _context: IntentResolutionContext,
    ) -> SpineResult<Vec<IntentReplacement>> {
        Ok(self.replacements.clone())
    }
}

/// Allowlist-backed Minecraft data stub
struct KnownLeaves(HashSet<String>);

impl KnownLeaves {
    fn of(leaves: &[&str]) -> Self {
        Self(leaves.iter().map(|leaf| leaf.to_string()).collect())
    }
}

impl MinecraftData for KnownLeaves {
    fn known_leaf(&self, leaf: &str) -> bool {
        self.0.contains(leaf)
    }

    fn validate_leaf_args(&self, _leaf: &str, args: &Value) -> bool {
        !args.is_null()
    }
}

fn leaf_step(order: u32, leaf: &str) -> TaskStep {
    TaskStep::leaf(order, leaf, leaf, json!({"arg": true}))
}

fn intent_step(order: u32, name: &str) -> TaskStep {
    let mut step = TaskStep::leaf(order, name, format!("task_type_{}", name), json!({}));
    step.meta.executable = false;
    step
}

fn sterling_task(digest: &str) -> NewTask {
    let mut partial = NewTask::new("Sterling plan", TaskType::SterlingIr, TaskSource::Planner);
    partial.metadata.sterling = Some(SterlingMeta {
        committed_ir_digest: digest.to_string(),
        schema_version: Some("3".to_string()),
        envelope_id: None,
        dedupe_namespace: Some("test".to_string()),
        exec: None,
    });
    partial
}

fn harness(
    sterling: Arc<ScriptedSterling>,
    leaves: &[&str],
    intent_resolve: bool,
) -> Arc<TaskIntegration> {
    let config = ExecutorConfig {
        sterling_intent_resolve: intent_resolve,
        ..Default::default()
    };
    let store = Arc::new(TaskStore::new(64, false));
    let (events, _rx) = EventBus::new();
    Arc::new(
        TaskIntegration::new(store, config, events)
            .with_sterling(sterling)
            .with_minecraft_data(Arc::new(KnownLeaves::of(leaves))),
    )
}

#[tokio::test(start_paused = true)]
async fn clean_expansion_materializes_steps() {
    // Arrange
    let sterling = Arc::new(ScriptedSterling::expanding(
        vec![leaf_step(0, "gather_nearby"), leaf_step(1, "place_block")],
        Vec::new(),
    ));
    let integration = harness(Arc::clone(&sterling), &["gather_nearby", "place_block"], true);

    // Act
    let task = integration.add_task(sterling_task("digest-1")).await.unwrap();

    // Assert
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.steps.len(), 2);
    let exec = task.metadata.sterling.unwrap().exec.expect("exec provenance");
    assert_eq!(exec.expansion_mode, "ingest");
    assert_eq!(exec.ingest_retry_count, 0);
    assert_eq!(exec.all_intents_resolved, Some(true));
    assert!(exec.executor_plan_digest.is_some());
    assert_eq!(exec.expansion_digest, exec.executor_plan_digest);
}

#[tokio::test(start_paused = true)]
async fn unknown_digest_is_retried_with_backoff_then_succeeds() {
    let sterling = Arc::new(ScriptedSterling::refusing(
        2,
        "blocked_digest_unknown",
        vec![leaf_step(0, "gather_nearby")],
    ));
    let integration = harness(Arc::clone(&sterling), &["gather_nearby"], true);

    let task = integration.add_task(sterling_task("digest-2")).await.unwrap();

    assert_eq!(sterling.call_count(), 3);
    assert_eq!(task.status, TaskStatus::Pending);
    let exec = task.metadata.sterling.unwrap().exec.unwrap();
    assert_eq!(exec.ingest_retry_count, 2);
    assert!(exec.scheduled_delay_ms >= 150); // 50ms + 100ms
}

#[tokio::test(start_paused = true)]
async fn unknown_digest_exhaustion_blocks_with_provenance() {
    let sterling = Arc::new(ScriptedSterling::refusing(
        10,
        "blocked_digest_unknown",
        Vec::new(),
    ));
    let integration = harness(Arc::clone(&sterling), &[], true);

    let task = integration.add_task(sterling_task("digest-3")).await.unwrap();

    // Initial attempt plus two retries, never more
    assert_eq!(sterling.call_count(), 3);
    assert_eq!(task.status, TaskStatus::PendingPlanning);
    assert_eq!(
        task.metadata.blocked_reason.as_deref(),
        Some("blocked_digest_unknown")
    );
    assert!(task.metadata.blocked_at.is_some());
    let exec = task.metadata.sterling.unwrap().exec.unwrap();
    assert_eq!(exec.ingest_retry_count, 2);
}

#[tokio::test(start_paused = true)]
async fn non_digest_block_is_immediate() {
    let sterling = Arc::new(ScriptedSterling::refusing(10, "blocked_schema_mismatch", Vec::new()));
    let integration = harness(Arc::clone(&sterling), &[], true);

    let task = integration.add_task(sterling_task("digest-4")).await.unwrap();

    assert_eq!(sterling.call_count(), 1);
    assert_eq!(task.status, TaskStatus::PendingPlanning);
    assert_eq!(
        task.metadata.blocked_reason.as_deref(),
        Some("blocked_schema_mismatch")
    );
}

#[tokio::test(start_paused = true)]
async fn missing_digest_is_rejected() {
    let sterling = Arc::new(ScriptedSterling::expanding(Vec::new(), Vec::new()));
    let integration = harness(sterling, &[], true);

    let partial = NewTask::new("Sterling plan", TaskType::SterlingIr, TaskSource::Planner);
    let result = integration.add_task(partial).await;

    assert!(result.is_err());
}

#[tokio::test(start_paused = true)]
async fn partial_intent_resolution_splices_and_blocks() {
    // Arrange: expansion with two intents; only the first resolves
    let expansion = vec![
        leaf_step(0, "gather_nearby"),
        intent_step(1, "craft"),
        leaf_step(2, "navigate_to"),
        intent_step(3, "mine"),
        leaf_step(4, "place_block"),
    ];
    let replacements = vec![
        IntentReplacement {
            intent_step_index: 0,
            resolved: Some(vec![
                TaskStep::leaf(0, "craft planks", "craft_recipe", json!({"recipe": "oak_planks", "count": 4})),
                TaskStep::leaf(1, "craft sticks", "craft_recipe", json!({"recipe": "sticks", "count": 4})),
            ]),
        },
        IntentReplacement {
            intent_step_index: 1,
            resolved: None,
        },
    ];
    let sterling = Arc::new(ScriptedSterling::expanding(expansion, replacements));
    let integration = harness(
        Arc::clone(&sterling),
        &["gather_nearby", "navigate_to", "place_block", "craft_recipe"],
        true,
    );

    // Act
    let task = integration.add_task(sterling_task("digest-6")).await.unwrap();

    // Assert: splice shape
    let leaves: Vec<&str> = task
        .steps
        .iter()
        .filter_map(|step| step.meta.leaf.as_deref())
        .collect();
    assert_eq!(
        leaves,
        vec![
            "gather_nearby",
            "craft_recipe",
            "craft_recipe",
            "navigate_to",
            "task_type_mine",
            "place_block"
        ]
    );

    // Unresolved intents fail closed
    assert_eq!(task.status, TaskStatus::PendingPlanning);
    assert_eq!(
        task.metadata.blocked_reason.as_deref(),
        Some("blocked_unresolved_intents")
    );

    let exec = task.metadata.sterling.unwrap().exec.unwrap();
    assert_eq!(exec.all_intents_resolved, Some(false));
    // The final digest differs from the expansion digest once spliced
    assert_ne!(exec.executor_plan_digest, exec.expansion_digest);
}

#[tokio::test(start_paused = true)]
async fn undispatchable_replacements_block_with_offenders() {
    let expansion = vec![intent_step(0, "craft")];
    let replacements = vec![IntentReplacement {
        intent_step_index: 0,
        resolved: Some(vec![TaskStep::leaf(
            0,
            "use warp drive",
            "warp_drive",
            json!({"target": "moon"}),
        )]),
    }];
    let sterling = Arc::new(ScriptedSterling::expanding(expansion, replacements));
    // warp_drive is not a known leaf
    let integration = harness(Arc::clone(&sterling), &["craft_recipe"], true);

    let task = integration.add_task(sterling_task("digest-7")).await.unwrap();

    assert_eq!(task.status, TaskStatus::PendingPlanning);
    assert_eq!(
        task.metadata.blocked_reason.as_deref(),
        Some("blocked_undispatchable_steps")
    );
    let exec = task.metadata.sterling.unwrap().exec.unwrap();
    assert_eq!(exec.undispatchable_leaves, vec!["warp_drive".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn intent_resolution_kill_switch_fails_closed() {
    let expansion = vec![intent_step(0, "craft")];
    let sterling = Arc::new(ScriptedSterling::expanding(expansion, Vec::new()));
    let integration = harness(Arc::clone(&sterling), &["craft_recipe"], false);

    let task = integration.add_task(sterling_task("digest-8")).await.unwrap();

    assert_eq!(task.status, TaskStatus::PendingPlanning);
    assert_eq!(
        task.metadata.blocked_reason.as_deref(),
        Some("blocked_intent_resolution_disabled")
    );
}

#[tokio::test(start_paused = true)]
async fn digest_dedupe_returns_existing_task() {
    let sterling = Arc::new(ScriptedSterling::expanding(
        vec![leaf_step(0, "gather_nearby")],
        Vec::new(),
    ));
    let integration = harness(Arc::clone(&sterling), &["gather_nearby"], true);

    let first = integration.add_task(sterling_task("digest-9")).await.unwrap();
    let second = integration.add_task(sterling_task("digest-9")).await.unwrap();

    assert_eq!(first.id, second.id);
    // The second call never re-expanded
    assert_eq!(sterling.call_count(), 1);
}
