//! Task metadata envelope
//!
//! The envelope is a record of typed sub-namespaces rather than a free-form
//! bag. An `extensions` map carries bounded forward compatibility; the
//! finalization allowlist decides what survives into a persisted task.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::task::model::TaskId;

/// Who stamped the task at finalization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginKind {
    Api,
    Cognition,
    GoalSource,
    GoalResolver,
    Executor,
}

impl OriginKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OriginKind::Api => "api",
            OriginKind::Cognition => "cognition",
            OriginKind::GoalSource => "goal_source",
            OriginKind::GoalResolver => "goal_resolver",
            OriginKind::Executor => "executor",
        }
    }
}

/// Verifiable task origin, stamped exactly once by finalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Origin {
    pub kind: OriginKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<TaskId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_goal_key: Option<String>,
}

/// Why a goal-bound task is suspended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldReason {
    /// Explicit user pause; clearable only by explicit user resume/cancel
    ManualPause,
    /// Displaced by a higher-priority goal
    Preempted,
    /// Waiting on a prerequisite task or resource
    WaitingOnPrereq,
    /// The owning goal was paused
    GoalPaused,
}

impl HoldReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            HoldReason::ManualPause => "manual_pause",
            HoldReason::Preempted => "preempted",
            HoldReason::WaitingOnPrereq => "waiting_on_prereq",
            HoldReason::GoalPaused => "goal_paused",
        }
    }

    /// `manual_pause` is a hard wall for goal-level resume
    pub fn is_hard_wall(&self) -> bool {
        matches!(self, HoldReason::ManualPause)
    }
}

/// Enforced suspension on a goal-bound task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hold {
    pub reason: HoldReason,
    pub held_at: DateTime<Utc>,
    #[serde(default)]
    pub resume_hints: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_review_at: Option<DateTime<Utc>>,
}

/// Association between a task and a higher-level goal instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalBinding {
    pub goal_instance_id: String,
    pub goal_type: String,
    /// Pre-resolution approximation of the goal key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provisional_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hold: Option<Hold>,
}

/// Episode-linkage join keys tying an execution back to its plan bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinKeys {
    pub plan_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_bundle_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub solver_id: Option<String>,
}

/// Feasibility signals attached by the planner
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RigGSignals {
    pub feasibility_passed: bool,
    #[serde(default)]
    pub rejection_kinds: Vec<String>,
}

/// Rig-G feasibility metadata for a plan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RigGMeta {
    pub signals: RigGSignals,
    #[serde(default)]
    pub dag_node_count: u32,
    #[serde(default)]
    pub dag_edge_count: u32,
    #[serde(default)]
    pub commuting_pairs: u32,
}

/// Replan bookkeeping for the debounced Rig-G replan loop
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RigGReplanState {
    pub attempts: u32,
    pub in_flight: bool,
}

/// Raw solver result retained until episode reporting consumes it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolveResultSubstrate {
    pub plan_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_hash: Option<String>,
    /// Richer outcome classification, e.g. `SEARCH_EXHAUSTED`
    pub outcome: String,
}

/// Solver-facing metadata: plan ids, join keys, Rig-G state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolverMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crafting_plan_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub building_plan_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mining_plan_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub navigation_plan_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_keys: Option<JoinKeys>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rig_g: Option<RigGMeta>,
    #[serde(default)]
    pub rig_g_checked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rig_g_replan: Option<RigGReplanState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_parallelism: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub solve_result_substrate: Option<SolveResultSubstrate>,
    #[serde(default)]
    pub replan_count: u32,
}

impl SolverMeta {
    /// The per-domain plan id that is set, with its domain label
    pub fn domain_plan_id(&self) -> Option<(&'static str, &str)> {
        if let Some(id) = &self.crafting_plan_id {
            return Some(("crafting", id));
        }
        if let Some(id) = &self.building_plan_id {
            return Some(("building", id));
        }
        if let Some(id) = &self.mining_plan_id {
            return Some(("mining", id));
        }
        if let Some(id) = &self.navigation_plan_id {
            return Some(("navigation", id));
        }
        None
    }
}

/// Sterling IR execution provenance recorded by ingest
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SterlingExecProvenance {
    /// `ingest` for the digest-expansion pathway
    pub expansion_mode: String,
    #[serde(default)]
    pub ingest_retry_count: u32,
    #[serde(default)]
    pub scheduled_delay_ms: u64,
    #[serde(default)]
    pub elapsed_delay_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expansion_digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor_plan_digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all_intents_resolved: Option<bool>,
    /// Replacement leaves that failed validation, listed for diagnosis
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub undispatchable_leaves: Vec<String>,
}

/// Sterling IR identity for a pre-expanded plan envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SterlingMeta {
    pub committed_ir_digest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub envelope_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedupe_namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exec: Option<SterlingExecProvenance>,
}

impl SterlingMeta {
    /// Digest-keyed dedupe identity, scoped by namespace
    pub fn dedupe_key(&self) -> String {
        match &self.dedupe_namespace {
            Some(namespace) => format!("{}:{}", namespace, self.committed_ir_digest),
            None => self.committed_ir_digest.clone(),
        }
    }
}

/// Who constructed the task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProvenance {
    pub builder: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,
}

/// Metadata envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtask_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal_binding: Option<GoalBinding>,
    #[serde(default)]
    pub solver: SolverMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sterling: Option<SterlingMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_provenance: Option<TaskProvenance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reflex_instance_id: Option<String>,
    /// When set, `blocked_at` must be set too; `blocked_at` anchors TTLs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_steps_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requirement: Option<Value>,
    /// Backoff floor consulted by the eligibility filter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_eligible_at: Option<DateTime<Utc>>,
    /// Consecutive retryable-failure count, drives the backoff exponent
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Bounded forward compatibility; dropped by the propagation allowlist
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, Value>,
}

impl Default for TaskMetadata {
    fn default() -> Self {
        Self {
            origin: None,
            goal_key: None,
            subtask_key: None,
            goal_binding: None,
            solver: SolverMeta::default(),
            sterling: None,
            task_provenance: None,
            reflex_instance_id: None,
            blocked_reason: None,
            blocked_at: None,
            no_steps_reason: None,
            parent_task_id: None,
            tags: Vec::new(),
            category: None,
            requirement: None,
            next_eligible_at: None,
            retry_count: 0,
            updated_at: Utc::now(),
            extensions: BTreeMap::new(),
        }
    }
}

impl TaskMetadata {
    /// Mark the envelope as touched now
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Set a blocked reason with TTL-anchor semantics: a fresh block or a
    /// reason change resets the anchor, re-applying the same reason keeps it
    pub fn set_blocked(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        let reason = reason.into();
        match &self.blocked_reason {
            Some(existing) if *existing == reason => {
                // same-reason re-block preserves the anchor
            }
            _ => {
                self.blocked_at = Some(now);
            }
        }
        self.blocked_reason = Some(reason);
    }

    /// Clear the blocked pair together
    pub fn clear_blocked(&mut self) {
        self.blocked_reason = None;
        self.blocked_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn blocked_anchor_survives_same_reason_reblock() {
        let mut metadata = TaskMetadata::default();
        let t1 = Utc::now();
        let t2 = t1 + Duration::seconds(30);
        let t3 = t2 + Duration::seconds(30);

        metadata.set_blocked("waiting_on_prereq", t1);
        assert_eq!(metadata.blocked_at, Some(t1));

        metadata.set_blocked("waiting_on_prereq", t2);
        assert_eq!(metadata.blocked_at, Some(t1));

        metadata.set_blocked("shadow_mode", t3);
        assert_eq!(metadata.blocked_at, Some(t3));
    }

    #[test]
    fn sterling_dedupe_key_is_namespace_scoped() {
        let meta = SterlingMeta {
            committed_ir_digest: "abc123".to_string(),
            schema_version: None,
            envelope_id: None,
            dedupe_namespace: Some("craft".to_string()),
            exec: None,
        };
        assert_eq!(meta.dedupe_key(), "craft:abc123");
    }

    #[test]
    fn domain_plan_id_prefers_first_set_domain() {
        let meta = SolverMeta {
            building_plan_id: Some("plan-7".to_string()),
            ..Default::default()
        };
        assert_eq!(meta.domain_plan_id(), Some(("building", "plan-7")));
        assert_eq!(SolverMeta::default().domain_plan_id(), None);
    }
}
