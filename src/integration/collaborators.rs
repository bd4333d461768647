//! Collaborator seams consumed by the integration
//!
//! Each external system is specified only by the shape the spine needs:
//! the Sterling executor, the hierarchical macro planner, the Minecraft
//! data provider, the bot context, domain solvers, and the goal status
//! sink. All are injected as optional trait objects.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SpineResult;
use crate::task::{Task, TaskStep};

/// Result of expanding a committed IR digest
#[derive(Debug, Clone)]
pub enum ExpandByDigest {
    /// Expansion succeeded; steps are ready for intent resolution
    Ok { steps: Vec<TaskStep> },
    /// Expansion refused; `blocked_digest_unknown` is retried with backoff,
    /// any other reason blocks immediately
    Blocked { reason: String },
}

/// Context handed to the intent resolver
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentResolutionContext {
    pub task_id: String,
    pub steps: Vec<TaskStep>,
    /// Positions of intent steps, numbered among intents in walk order
    pub intent_leaves: Vec<String>,
}

/// One intent replacement, keyed by intent ordinal
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentReplacement {
    pub intent_step_index: usize,
    /// `None` marks an unresolved intent, kept in place by the splice
    pub resolved: Option<Vec<TaskStep>>,
}

/// Sterling reasoning service surface
#[async_trait]
pub trait SterlingExecutor: Send + Sync {
    async fn expand_by_digest(&self, digest: &str) -> SpineResult<ExpandByDigest>;
    async fn resolve_intent_steps(
        &self,
        context: IntentResolutionContext,
    ) -> SpineResult<Vec<IntentReplacement>>;
}

/// Macro planner outcome for Rig-E tasks
#[derive(Debug, Clone)]
pub enum MacroPlan {
    Steps(Vec<TaskStep>),
    NoPlanFound,
    OntologyGap,
}

/// Hierarchical/HTN macro planner surface
#[async_trait]
pub trait MacroPlanner: Send + Sync {
    fn context_from_requirement(&self, requirement: &Value) -> Value;
    async fn plan_macro_path(&self, context: &Value) -> SpineResult<MacroPlan>;
}

/// Requirement attached by the HTN/GOAP resolver along with driven steps
#[derive(Debug, Clone)]
pub struct ResolvedRequirement {
    pub requirement: Value,
    pub steps: Vec<TaskStep>,
}

/// Local requirement resolver driving default step generation
pub trait RequirementResolver: Send + Sync {
    fn resolve(&self, task: &Task) -> Option<ResolvedRequirement>;
}

/// Episode linkage report sent to a domain solver on terminal transitions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeReport {
    pub task_id: String,
    pub domain: String,
    pub plan_id: String,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_bundle_hash: Option<String>,
}

/// Domain solver surface (crafting, building, mining, navigation)
#[async_trait]
pub trait DomainSolver: Send + Sync {
    async fn report_episode_result(&self, report: EpisodeReport) -> SpineResult<()>;
}

/// Bot position as last observed
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BotPosition {
    pub x: f64,
    /// Y may be unknown on some observation paths
    pub y: Option<f64>,
    pub z: f64,
}

/// Live bot context (connection + position)
pub trait BotContextProvider: Send + Sync {
    fn is_connected(&self) -> bool;
    fn position(&self) -> Option<BotPosition>;
}

/// Minecraft data provider used for leaf validation
pub trait MinecraftData: Send + Sync {
    /// Whether the leaf name is a known dispatchable leaf
    fn known_leaf(&self, leaf: &str) -> bool;
    /// Validate leaf arguments against the leaf's contract
    fn validate_leaf_args(&self, leaf: &str, args: &Value) -> bool;
}

/// Sink for goal status updates produced by the protocol
pub trait GoalStatusSink: Send + Sync {
    fn update_goal_status(&self, goal_id: &str, status: &str, reason: &str);
}

/// Default sink that only logs
pub struct LoggingGoalStatusSink;

impl GoalStatusSink for LoggingGoalStatusSink {
    fn update_goal_status(&self, goal_id: &str, status: &str, reason: &str) {
        tracing::info!(goal_id, status, reason, "goal status update");
    }
}
