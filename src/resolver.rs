//! Task-action resolution
//!
//! Maps a task to a gateway-ready action through fixed-precedence sources:
//! legacy parameter fields, the resolved requirement candidate, the first
//! step's meta args, and finally title inference. Exploration and
//! straight-line moves are permissive; every other domain fails closed with
//! a deterministic mapping failure.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::task::{Task, TaskType};

/// Which precedence source produced the action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedFrom {
    Legacy,
    RequirementCandidate,
    StepMetaArgs,
    Inferred,
}

/// Gateway-ready action extracted from a task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedAction {
    #[serde(rename = "type")]
    pub action_type: String,
    pub parameters: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub resolved_from: ResolvedFrom,
    /// Every source that was checked, in order
    pub evidence: Vec<String>,
}

/// Deterministic mapping defect category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingCategory {
    MappingMissing,
    MappingInvalid,
    MappingAmbiguous,
}

/// Deterministic resolution failure; never retryable
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingFailure {
    pub category: MappingCategory,
    pub reason: String,
    pub failure_code: String,
    pub retryable: bool,
    pub evidence: Vec<String>,
}

impl MappingFailure {
    fn missing(domain: &str, field: &str, evidence: Vec<String>) -> Self {
        Self {
            category: MappingCategory::MappingMissing,
            reason: format!("no usable {} source for {} task", field, domain),
            failure_code: format!("mapping_missing:{}:{}", domain, field),
            retryable: false,
            evidence,
        }
    }

    fn invalid(code_tail: &str, reason: String, evidence: Vec<String>) -> Self {
        Self {
            category: MappingCategory::MappingInvalid,
            reason,
            failure_code: format!("mapping_invalid:{}", code_tail),
            retryable: false,
            evidence,
        }
    }
}

/// Resolve a task into an executable action or a deterministic failure
pub fn resolve_task_action(task: &Task) -> Result<ResolvedAction, MappingFailure> {
    let mut evidence = Vec::new();
    let timeout_ms = task
        .parameters
        .get("timeoutMs")
        .and_then(Value::as_u64)
        .or_else(|| task.parameters.get("timeout").and_then(Value::as_u64));

    match task.task_type {
        TaskType::Crafting => resolve_item_domain(
            task,
            "craft",
            "item",
            "craft_item",
            &["item", "recipe"],
            &CRAFT_TITLE,
            timeout_ms,
            &mut evidence,
        ),
        TaskType::Mining => resolve_item_domain(
            task,
            "mine",
            "block",
            "mine_block",
            &["block", "blockType"],
            &MINE_TITLE,
            timeout_ms,
            &mut evidence,
        ),
        TaskType::Gathering => resolve_item_domain(
            task,
            "gather",
            "resource",
            "gather_resource",
            &["resource", "item", "target"],
            &GATHER_TITLE,
            timeout_ms,
            &mut evidence,
        ),
        TaskType::Building => resolve_item_domain(
            task,
            "build",
            "structure",
            "build_structure",
            &["structure", "blueprint"],
            &BUILD_TITLE,
            timeout_ms,
            &mut evidence,
        ),
        TaskType::Navigation => resolve_navigation(task, timeout_ms, &mut evidence),
        TaskType::Exploration => Ok(resolve_exploration(task, timeout_ms, &mut evidence)),
        TaskType::SterlingIr => resolve_step_leaf(task, timeout_ms, &mut evidence),
        TaskType::AdvisoryAction | TaskType::General => {
            evidence.push(format!("task type {} has no action mapping", task.task_type));
            Err(MappingFailure::invalid(
                &format!("unknown_type:{}", task.task_type),
                format!("task type {} cannot be resolved to an action", task.task_type),
                evidence.clone(),
            ))
        }
    }
}

/// Item-shaped domains (craft/mine/gather/build) share the precedence walk
#[allow(clippy::too_many_arguments)]
fn resolve_item_domain(
    task: &Task,
    domain: &str,
    field: &str,
    action_type: &str,
    legacy_keys: &[&str],
    title_pattern: &Regex,
    timeout_ms: Option<u64>,
    evidence: &mut Vec<String>,
) -> Result<ResolvedAction, MappingFailure> {
    let quantity = task
        .parameters
        .get("quantity")
        .and_then(Value::as_u64)
        .unwrap_or(1);

    // 1. Legacy fields on task.parameters
    for key in legacy_keys {
        match task.parameters.get(*key).and_then(Value::as_str) {
            Some(raw) if is_placeholder(raw) => {
                evidence.push(format!("parameters.{}: placeholder '{}' rejected", key, raw));
            }
            Some(raw) => {
                evidence.push(format!("parameters.{}={}", key, raw));
                return Ok(action(
                    action_type,
                    json!({field: raw.trim(), "quantity": quantity}),
                    timeout_ms,
                    ResolvedFrom::Legacy,
                    evidence,
                ));
            }
            None => evidence.push(format!("parameters.{}: absent", key)),
        }
    }

    // 2. Resolved requirement candidate
    let candidate = task
        .parameters
        .get("requirementCandidate")
        .and_then(|candidate| candidate.get("outputPattern"))
        .and_then(Value::as_str);
    match candidate {
        Some(raw) if !is_placeholder(raw) => {
            evidence.push(format!("requirementCandidate.outputPattern={}", raw));
            let quantity = task
                .parameters
                .get("requirementCandidate")
                .and_then(|candidate| candidate.get("quantity"))
                .and_then(Value::as_u64)
                .unwrap_or(quantity);
            return Ok(action(
                action_type,
                json!({field: raw.trim(), "quantity": quantity}),
                timeout_ms,
                ResolvedFrom::RequirementCandidate,
                evidence,
            ));
        }
        Some(raw) => evidence.push(format!(
            "requirementCandidate.outputPattern: placeholder '{}' rejected",
            raw
        )),
        None => evidence.push("requirementCandidate.outputPattern: absent".to_string()),
    }

    // 3. First-step meta args
    if let Some(step) = task.steps.first() {
        for key in legacy_keys {
            if let Some(raw) = step.meta.args.get(*key).and_then(Value::as_str) {
                if !is_placeholder(raw) {
                    evidence.push(format!("steps[0].meta.args.{}={}", key, raw));
                    return Ok(action(
                        action_type,
                        json!({field: raw.trim(), "quantity": quantity}),
                        timeout_ms,
                        ResolvedFrom::StepMetaArgs,
                        evidence,
                    ));
                }
            }
        }
        evidence.push("steps[0].meta.args: no usable keys".to_string());
    } else {
        evidence.push("steps: empty".to_string());
    }

    // 4. Title inference
    if let Some(captures) = title_pattern.captures(&task.title) {
        if let Some(matched) = captures.get(1) {
            let name = normalize_name(matched.as_str());
            if !name.is_empty() && !is_placeholder(&name) {
                evidence.push(format!("title inference: '{}'", name));
                return Ok(action(
                    action_type,
                    json!({field: name, "quantity": quantity}),
                    timeout_ms,
                    ResolvedFrom::Inferred,
                    evidence,
                ));
            }
        }
    }
    evidence.push("title inference: no match".to_string());

    Err(MappingFailure::missing(domain, field, evidence.clone()))
}

/// Navigation fails closed on a missing target; a straight-line move
/// (direction present) is permissive with a default distance
fn resolve_navigation(
    task: &Task,
    timeout_ms: Option<u64>,
    evidence: &mut Vec<String>,
) -> Result<ResolvedAction, MappingFailure> {
    for key in ["target", "position", "destination"] {
        match task.parameters.get(key) {
            Some(value) if !value.is_null() => {
                evidence.push(format!("parameters.{} present", key));
                return Ok(action(
                    "navigate",
                    json!({"target": value}),
                    timeout_ms,
                    ResolvedFrom::Legacy,
                    evidence,
                ));
            }
            _ => evidence.push(format!("parameters.{}: absent", key)),
        }
    }

    if let Some(step) = task.steps.first() {
        if let Some(target) = step.meta.args.get("target").filter(|value| !value.is_null()) {
            evidence.push("steps[0].meta.args.target present".to_string());
            return Ok(action(
                "navigate",
                json!({"target": target}),
                timeout_ms,
                ResolvedFrom::StepMetaArgs,
                evidence,
            ));
        }
    }

    if let Some(direction) = task.parameters.get("direction").and_then(Value::as_str) {
        let distance = task
            .parameters
            .get("distance")
            .and_then(Value::as_u64)
            .unwrap_or(1);
        evidence.push(format!("parameters.direction={}", direction));
        return Ok(action(
            "move_forward",
            json!({"direction": direction, "distance": distance}),
            timeout_ms,
            ResolvedFrom::Legacy,
            evidence,
        ));
    }

    if let Some(captures) = NAVIGATE_TITLE.captures(&task.title) {
        if let Some(matched) = captures.get(1) {
            let target = matched.as_str().trim();
            if !target.is_empty() {
                evidence.push(format!("title inference: '{}'", target));
                return Ok(action(
                    "navigate",
                    json!({"target": target}),
                    timeout_ms,
                    ResolvedFrom::Inferred,
                    evidence,
                ));
            }
        }
    }
    evidence.push("title inference: no match".to_string());

    Err(MappingFailure::missing("navigate", "target", evidence.clone()))
}

/// Exploration never fails: defaults fill whatever is missing
fn resolve_exploration(
    task: &Task,
    timeout_ms: Option<u64>,
    evidence: &mut Vec<String>,
) -> ResolvedAction {
    let target = task
        .parameters
        .get("target")
        .and_then(Value::as_str)
        .unwrap_or("random");
    let radius = task
        .parameters
        .get("radius")
        .and_then(Value::as_u64)
        .unwrap_or(32);
    evidence.push(format!("exploration defaults: target={}, radius={}", target, radius));
    action(
        "explore",
        json!({"target": target, "radius": radius}),
        timeout_ms,
        if task.parameters.get("target").is_some() {
            ResolvedFrom::Legacy
        } else {
            ResolvedFrom::Inferred
        },
        evidence,
    )
}

/// Sterling-IR tasks dispatch the current step's leaf directly
fn resolve_step_leaf(
    task: &Task,
    timeout_ms: Option<u64>,
    evidence: &mut Vec<String>,
) -> Result<ResolvedAction, MappingFailure> {
    match task.current_step() {
        Some(step) => match &step.meta.leaf {
            Some(leaf) if !step.meta.is_intent() => {
                evidence.push(format!("current step leaf={}", leaf));
                Ok(action(
                    leaf,
                    step.meta.args.clone(),
                    timeout_ms,
                    ResolvedFrom::StepMetaArgs,
                    evidence,
                ))
            }
            Some(leaf) => {
                evidence.push(format!("current step leaf {} is an unresolved intent", leaf));
                Err(MappingFailure::invalid(
                    "unresolved_intent",
                    format!("step leaf {} is an unresolved intent placeholder", leaf),
                    evidence.clone(),
                ))
            }
            None => {
                evidence.push("current step has no leaf".to_string());
                Err(MappingFailure::missing("sterling_ir", "leaf", evidence.clone()))
            }
        },
        None => {
            evidence.push("steps: none remaining".to_string());
            Err(MappingFailure::missing("sterling_ir", "steps", evidence.clone()))
        }
    }
}

fn action(
    action_type: &str,
    parameters: Value,
    timeout_ms: Option<u64>,
    resolved_from: ResolvedFrom,
    evidence: &mut Vec<String>,
) -> ResolvedAction {
    ResolvedAction {
        action_type: action_type.to_string(),
        parameters,
        timeout_ms,
        resolved_from,
        evidence: std::mem::take(evidence),
    }
}

/// The literal value `item` is a template placeholder, never a real name
fn is_placeholder(raw: &str) -> bool {
    raw.trim().eq_ignore_ascii_case("item")
}

/// Title-inference normalization: lowercase, spaces to underscores,
/// trailing plural `s` stripped
fn normalize_name(raw: &str) -> String {
    let mut name = raw.trim().to_lowercase().replace(' ', "_");
    if name.len() > 3 && name.ends_with('s') && !name.ends_with("ss") {
        name.pop();
    }
    name
}

#[allow(clippy::expect_used)]
fn compiled(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static title pattern")
}

static CRAFT_TITLE: std::sync::LazyLock<Regex> =
    std::sync::LazyLock::new(|| compiled(r"(?i)\bcraft(?:ing)?\s+(?:a\s+|an\s+|the\s+)?([a-z][a-z _-]+)"));
static MINE_TITLE: std::sync::LazyLock<Regex> =
    std::sync::LazyLock::new(|| compiled(r"(?i)\bmin(?:e|ing)\s+(?:a\s+|an\s+|the\s+|some\s+)?([a-z][a-z _-]+)"));
static GATHER_TITLE: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
    compiled(r"(?i)\b(?:gather(?:ing)?|collect(?:ing)?)\s+(?:a\s+|an\s+|the\s+|some\s+)?([a-z][a-z _-]+)")
});
static BUILD_TITLE: std::sync::LazyLock<Regex> =
    std::sync::LazyLock::new(|| compiled(r"(?i)\bbuild(?:ing)?\s+(?:a\s+|an\s+|the\s+)?([a-z][a-z _-]+)"));
static NAVIGATE_TITLE: std::sync::LazyLock<Regex> =
    std::sync::LazyLock::new(|| compiled(r"(?i)\b(?:navigate|go|walk|travel)\s+to\s+(.+)$"));

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{new_task_id, TaskMetadata, TaskSource, TaskStatus, TaskStep};
    use chrono::Utc;

    fn task_of(task_type: TaskType, title: &str, parameters: Value) -> Task {
        Task {
            id: new_task_id(),
            title: title.to_string(),
            task_type,
            status: TaskStatus::Active,
            source: TaskSource::Manual,
            priority: 0.5,
            urgency: 0.5,
            progress: 0.0,
            steps: Vec::new(),
            parameters,
            metadata: TaskMetadata::default(),
            created_at: Utc::now(),
            error: None,
            failure_code: None,
        }
    }

    #[test]
    fn legacy_beats_requirement_candidate() {
        let task = task_of(
            TaskType::Crafting,
            "Craft a tool",
            json!({
                "item": "wooden_pickaxe",
                "quantity": 1,
                "requirementCandidate": {"outputPattern": "other"}
            }),
        );
        let resolved = resolve_task_action(&task).expect("resolves");
        assert_eq!(resolved.action_type, "craft_item");
        assert_eq!(resolved.parameters["item"], "wooden_pickaxe");
        assert_eq!(resolved.parameters["quantity"], 1);
        assert_eq!(resolved.resolved_from, ResolvedFrom::Legacy);
    }

    #[test]
    fn placeholder_item_falls_through_to_candidate() {
        let task = task_of(
            TaskType::Crafting,
            "Craft something",
            json!({
                "item": "item",
                "requirementCandidate": {"outputPattern": "oak_planks", "quantity": 4}
            }),
        );
        let resolved = resolve_task_action(&task).expect("resolves");
        assert_eq!(resolved.resolved_from, ResolvedFrom::RequirementCandidate);
        assert_eq!(resolved.parameters["item"], "oak_planks");
        assert_eq!(resolved.parameters["quantity"], 4);
        assert!(resolved
            .evidence
            .iter()
            .any(|line| line.contains("placeholder 'item' rejected")));
    }

    #[test]
    fn title_inference_normalizes() {
        let task = task_of(TaskType::Mining, "Mine Iron Ores", json!({}));
        let resolved = resolve_task_action(&task).expect("resolves");
        assert_eq!(resolved.action_type, "mine_block");
        assert_eq!(resolved.parameters["block"], "iron_ore");
        assert_eq!(resolved.resolved_from, ResolvedFrom::Inferred);
    }

    #[test]
    fn step_meta_args_beat_title() {
        let mut task = task_of(TaskType::Gathering, "Gather oak logs", json!({}));
        task.steps.push(TaskStep::leaf(
            0,
            "gather",
            "minecraft.gather",
            json!({"resource": "oak_log"}),
        ));
        let resolved = resolve_task_action(&task).expect("resolves");
        assert_eq!(resolved.resolved_from, ResolvedFrom::StepMetaArgs);
        assert_eq!(resolved.parameters["resource"], "oak_log");
    }

    #[test]
    fn exploration_is_permissive() {
        let task = task_of(TaskType::Exploration, "wander", json!({}));
        let resolved = resolve_task_action(&task).expect("resolves");
        assert_eq!(resolved.action_type, "explore");
        assert_eq!(resolved.parameters["target"], "random");
        assert_eq!(resolved.parameters["radius"], 32);
    }

    #[test]
    fn crafting_fails_closed_with_code_and_evidence() {
        let task = task_of(TaskType::Crafting, "do something useful", json!({}));
        let failure = resolve_task_action(&task).expect_err("fails");
        assert_eq!(failure.failure_code, "mapping_missing:craft:item");
        assert_eq!(failure.category, MappingCategory::MappingMissing);
        assert!(!failure.retryable);
        assert!(failure.evidence.len() >= 4);
    }

    #[test]
    fn unknown_type_path() {
        let task = task_of(TaskType::General, "anything", json!({}));
        let failure = resolve_task_action(&task).expect_err("fails");
        assert_eq!(failure.failure_code, "mapping_invalid:unknown_type:general");
    }

    #[test]
    fn sterling_dispatches_current_step_leaf() {
        let mut task = task_of(TaskType::SterlingIr, "IR plan", json!({}));
        task.steps.push(TaskStep::leaf(
            0,
            "craft planks",
            "minecraft.craft_recipe",
            json!({"recipe": "oak_planks"}),
        ));
        task.steps[0].done = true;
        task.steps.push(TaskStep::leaf(
            1,
            "craft sticks",
            "minecraft.craft_recipe",
            json!({"recipe": "stick"}),
        ));
        let resolved = resolve_task_action(&task).expect("resolves");
        assert_eq!(resolved.action_type, "minecraft.craft_recipe");
        assert_eq!(resolved.parameters["recipe"], "stick");
    }
}
