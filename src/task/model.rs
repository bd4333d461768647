//! Task record, statuses, and steps

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::task::metadata::TaskMetadata;

/// Opaque task identifier
pub type TaskId = String;

/// Generate a fresh task id
pub fn new_task_id() -> TaskId {
    Uuid::new_v4().to_string()
}

/// Domain tag for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Crafting,
    Mining,
    Gathering,
    Exploration,
    Navigation,
    Building,
    AdvisoryAction,
    SterlingIr,
    General,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Crafting => "crafting",
            TaskType::Mining => "mining",
            TaskType::Gathering => "gathering",
            TaskType::Exploration => "exploration",
            TaskType::Navigation => "navigation",
            TaskType::Building => "building",
            TaskType::AdvisoryAction => "advisory_action",
            TaskType::SterlingIr => "sterling_ir",
            TaskType::General => "general",
        }
    }

    /// Navigation-class tasks gated by the hierarchical macro planner
    pub fn is_rig_e(&self) -> bool {
        matches!(self, TaskType::Navigation | TaskType::Exploration)
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, waiting for the executor to pick it up
    Pending,
    /// Created but blocked on planning (ingest/solver gaps)
    PendingPlanning,
    /// Selected for execution
    Active,
    /// Currently executing steps
    InProgress,
    /// Suspended under a hold
    Paused,
    /// Finished successfully (immutable)
    Completed,
    /// Finished unsuccessfully (immutable)
    Failed,
    /// Feasibility gate rejected the plan (terminal)
    Unplannable,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::PendingPlanning => "pending_planning",
            TaskStatus::Active => "active",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Unplannable => "unplannable",
        }
    }

    /// Terminal statuses never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Unplannable
        )
    }

    /// Completed and failed are immutable even to management actions
    pub fn is_immutable(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who created the task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    Goal,
    Autonomous,
    Manual,
    Planner,
}

impl TaskSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskSource::Goal => "goal",
            TaskSource::Autonomous => "autonomous",
            TaskSource::Manual => "manual",
            TaskSource::Planner => "planner",
        }
    }
}

/// Leaf-name prefix marking an intent placeholder step
pub const INTENT_LEAF_PREFIX: &str = "task_type_";

/// Per-step metadata bag
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepMeta {
    /// Executable leaf name, e.g. `minecraft.craft_recipe`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leaf: Option<String>,
    /// Leaf arguments
    #[serde(default)]
    pub args: Value,
    /// Whether the step can be dispatched as-is
    #[serde(default)]
    pub executable: bool,
}

impl StepMeta {
    /// Intent leaves are placeholders resolved before dispatch
    pub fn is_intent(&self) -> bool {
        self.leaf
            .as_deref()
            .is_some_and(|leaf| leaf.starts_with(INTENT_LEAF_PREFIX))
    }
}

/// One ordered step of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStep {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub done: bool,
    pub order: u32,
    #[serde(default)]
    pub meta: StepMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl TaskStep {
    /// Construct a leaf-backed step
    pub fn leaf(order: u32, label: impl Into<String>, leaf: impl Into<String>, args: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            label: label.into(),
            done: false,
            order,
            meta: StepMeta {
                leaf: Some(leaf.into()),
                args,
                executable: true,
            },
            started_at: None,
        }
    }
}

/// A task record; mutated in memory and committed through the store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub source: TaskSource,
    pub priority: f64,
    pub urgency: f64,
    pub progress: f64,
    #[serde(default)]
    pub steps: Vec<TaskStep>,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub metadata: TaskMetadata,
    pub created_at: DateTime<Utc>,
    /// Normalized error surfaced on terminal failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Normalized failure code surfaced on terminal failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_code: Option<String>,
}

impl Task {
    /// First step that has not completed yet
    pub fn current_step(&self) -> Option<&TaskStep> {
        self.steps.iter().find(|step| !step.done)
    }

    pub fn current_step_mut(&mut self) -> Option<&mut TaskStep> {
        self.steps.iter_mut().find(|step| !step.done)
    }

    /// Fraction of completed steps, or the explicit progress field when
    /// the task carries no steps
    pub fn step_progress(&self) -> f64 {
        if self.steps.is_empty() {
            return self.progress;
        }
        let done = self.steps.iter().filter(|step| step.done).count();
        done as f64 / self.steps.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Unplannable.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
        assert!(TaskStatus::Completed.is_immutable());
        assert!(!TaskStatus::Unplannable.is_immutable());
    }

    #[test]
    fn intent_leaf_detection() {
        let meta = StepMeta {
            leaf: Some("task_type_craft".to_string()),
            args: Value::Null,
            executable: false,
        };
        assert!(meta.is_intent());

        let meta = StepMeta {
            leaf: Some("minecraft.craft_recipe".to_string()),
            args: Value::Null,
            executable: true,
        };
        assert!(!meta.is_intent());
    }

    #[test]
    fn step_progress_counts_done_steps() {
        let mut task = Task {
            id: new_task_id(),
            title: "Craft sticks".to_string(),
            task_type: TaskType::Crafting,
            status: TaskStatus::Active,
            source: TaskSource::Manual,
            priority: 0.5,
            urgency: 0.5,
            progress: 0.0,
            steps: vec![
                TaskStep::leaf(0, "craft planks", "minecraft.craft_recipe", Value::Null),
                TaskStep::leaf(1, "craft sticks", "minecraft.craft_recipe", Value::Null),
            ],
            parameters: Value::Null,
            metadata: TaskMetadata::default(),
            created_at: Utc::now(),
            error: None,
            failure_code: None,
        };
        assert_eq!(task.step_progress(), 0.0);
        task.steps[0].done = true;
        assert_eq!(task.step_progress(), 0.5);
    }
}
