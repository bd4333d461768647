//! Task integration
//!
//! The coordinator that finalizes new tasks, propagates the vetted metadata
//! allowlist, stamps origin, runs the Rig-G feasibility gate, routes
//! Sterling IR expansion and intent resolution, applies protocol effects
//! under the write-ordering discipline, and emits lifecycle events.

pub mod collaborators;
pub mod episode;
pub mod finalize;
pub mod rig_g;
pub mod sterling;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::config::ExecutorConfig;
use crate::error::{SpineError, SpineResult};
use crate::events::{EventBus, LifecycleEventKind, SpineEvent};
use crate::protocol::{
    apply_hold, apply_hold_change, apply_sync_effects, clear_hold, detect_illegal_states,
    on_goal_action, on_task_progress_updated, on_task_status_changed, partition_self_hold_effects,
    plan_management_action, rollback_hold_change, steps_digest, EffectContext, GoalEvent,
    ManagementAction, MutationOrigin, ReducerOutput, StatusChangeCause, SyncEffect,
};
use crate::resolver::resolve_task_action;
use crate::task::{
    new_task_id, GoalBinding, Origin, RigGReplanState, SetTaskOptions, SolverMeta,
    SterlingExecProvenance, SterlingMeta, Task, TaskId, TaskMetadata, TaskSource, TaskStatus,
    TaskStep, TaskStore, TaskType,
};

use collaborators::{
    DomainSolver, ExpandByDigest, GoalStatusSink, IntentResolutionContext, LoggingGoalStatusSink,
    MacroPlan, MacroPlanner, MinecraftData, RequirementResolver, SterlingExecutor,
};
use episode::{drift_summary, prepare_episode_report};
use finalize::{drift_reason, propagate_metadata, reject_origin_patch, stamp_origin};
use rig_g::{evaluate_rig_g, replan_delay, ReplanScheduler, RigGAdvice, MAX_REPLAN_ATTEMPTS};
use sterling::{blocked, remaining_intent_leaves, splice_intent_replacements};

/// Base delay for sterling ingest retries; millisecond-scale and
/// independent of the cooperative loop
const INGEST_RETRY_BASE: StdDuration = StdDuration::from_millis(50);

/// Partial task submitted for finalization
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: Option<TaskId>,
    pub title: String,
    pub task_type: TaskType,
    pub source: TaskSource,
    pub priority: f64,
    pub urgency: f64,
    pub parameters: Value,
    pub steps: Vec<TaskStep>,
    pub metadata: TaskMetadata,
}

impl NewTask {
    pub fn new(title: impl Into<String>, task_type: TaskType, source: TaskSource) -> Self {
        Self {
            id: None,
            title: title.into(),
            task_type,
            source,
            priority: 0.5,
            urgency: 0.5,
            parameters: Value::Null,
            steps: Vec::new(),
            metadata: TaskMetadata::default(),
        }
    }
}

/// Typed metadata patch; `Some(None)` clears an optional field
#[derive(Debug, Clone, Default)]
pub struct MetadataPatch {
    /// Always rejected with a warning; origin is stamped exactly once
    pub origin: Option<Origin>,
    pub blocked_reason: Option<Option<String>>,
    /// Caller-provided explicit anchor; wins over the TTL-anchor rules
    pub blocked_at: Option<DateTime<Utc>>,
    pub next_eligible_at: Option<Option<DateTime<Utc>>>,
    pub goal_binding: Option<Option<GoalBinding>>,
    pub solver: Option<SolverMeta>,
    pub sterling: Option<SterlingMeta>,
    pub tags: Option<Vec<String>>,
    pub category: Option<Option<String>>,
    pub requirement: Option<Option<Value>>,
    pub extensions: BTreeMap<String, Value>,
}

/// Outcome of `start_task_step`
#[derive(Debug, Clone)]
pub enum StepStartOutcome {
    /// Guards may proceed to dispatch
    Proceed { suggested_parallelism: u32 },
    /// Feasibility gate rejected the plan; task is now unplannable
    Infeasible { blocked_reason: String },
    /// Dry-run evaluation; nothing was mutated
    DryRun(RigGAdvice),
}

/// The integration coordinator
pub struct TaskIntegration {
    store: Arc<TaskStore>,
    config: ExecutorConfig,
    events: EventBus,
    sterling: Option<Arc<dyn SterlingExecutor>>,
    planner: Option<Arc<dyn MacroPlanner>>,
    requirement_resolver: Option<Arc<dyn RequirementResolver>>,
    minecraft_data: Option<Arc<dyn MinecraftData>>,
    solvers: BTreeMap<String, Arc<dyn DomainSolver>>,
    goal_sink: Arc<dyn GoalStatusSink>,
    replans: ReplanScheduler,
}

impl TaskIntegration {
    pub fn new(store: Arc<TaskStore>, config: ExecutorConfig, events: EventBus) -> Self {
        Self {
            store,
            config,
            events,
            sterling: None,
            planner: None,
            requirement_resolver: None,
            minecraft_data: None,
            solvers: BTreeMap::new(),
            goal_sink: Arc::new(LoggingGoalStatusSink),
            replans: ReplanScheduler::new(),
        }
    }

    pub fn with_sterling(mut self, executor: Arc<dyn SterlingExecutor>) -> Self {
        self.sterling = Some(executor);
        self
    }

    pub fn with_planner(mut self, planner: Arc<dyn MacroPlanner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn with_requirement_resolver(mut self, resolver: Arc<dyn RequirementResolver>) -> Self {
        self.requirement_resolver = Some(resolver);
        self
    }

    pub fn with_minecraft_data(mut self, data: Arc<dyn MinecraftData>) -> Self {
        self.minecraft_data = Some(data);
        self
    }

    pub fn with_solver(mut self, domain: impl Into<String>, solver: Arc<dyn DomainSolver>) -> Self {
        self.solvers.insert(domain.into(), solver);
        self
    }

    pub fn with_goal_sink(mut self, sink: Arc<dyn GoalStatusSink>) -> Self {
        self.goal_sink = sink;
        self
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn replan_scheduler(&self) -> &ReplanScheduler {
        &self.replans
    }

    /// Finalization pipeline: ingest, plan, dedup, allowlist, origin, commit
    #[instrument(skip(self, partial), fields(title = %partial.title, task_type = %partial.task_type))]
    pub async fn add_task(self: &Arc<Self>, partial: NewTask) -> SpineResult<Task> {
        let now = Utc::now();
        let mut task = Task {
            id: partial.id.unwrap_or_else(new_task_id),
            title: partial.title,
            task_type: partial.task_type,
            status: TaskStatus::Pending,
            source: partial.source,
            priority: partial.priority.clamp(0.0, 1.0),
            urgency: partial.urgency.clamp(0.0, 1.0),
            progress: 0.0,
            steps: partial.steps,
            parameters: partial.parameters,
            metadata: propagate_metadata(&partial.metadata),
            created_at: now,
            error: None,
            failure_code: None,
        };

        // Sterling IR pathway bypasses requirement resolution entirely
        let mut reserved_key = None;
        if task.task_type == TaskType::SterlingIr {
            let digest_ok = task
                .metadata
                .sterling
                .as_ref()
                .map(|sterling| !sterling.committed_ir_digest.trim().is_empty())
                .unwrap_or(false);
            if !digest_ok {
                return Err(SpineError::IngestBlocked(
                    "sterling_ir task requires sterling.committedIrDigest".to_string(),
                ));
            }
            let key = task
                .metadata
                .sterling
                .as_ref()
                .map(|sterling| sterling.dedupe_key())
                .unwrap_or_default();
            if let Some(existing) = self.store.find_by_dedupe_key(&key) {
                if !existing.status.is_terminal() {
                    info!(task_id = %existing.id, "sterling digest already ingested");
                    return Ok(existing);
                }
            }
            if !self.store.reserve_dedupe_key(&key) {
                if let Some(existing) = self.store.find_by_dedupe_key(&key) {
                    return Ok(existing);
                }
                return Err(SpineError::IngestBlocked(format!(
                    "concurrent ingest in flight for dedupe key {}",
                    key
                )));
            }
            reserved_key = Some(key);
            self.ingest_sterling(&mut task).await;
        }

        // Rig-E sentinel: navigation/exploration is gated by the macro planner
        if task.task_type.is_rig_e() && task.metadata.blocked_reason.is_none() {
            self.plan_rig_e(&mut task).await;
        }

        // Advisory actions carry no steps by design
        if task.task_type == TaskType::AdvisoryAction {
            task.steps.clear();
            task.metadata.set_blocked("advisory_action", now);
            task.metadata.no_steps_reason = Some("advisory-skip".to_string());
        }

        // Default requirement-resolution path
        if !matches!(task.task_type, TaskType::SterlingIr | TaskType::AdvisoryAction)
            && task.steps.is_empty()
            && task.metadata.blocked_reason.is_none()
        {
            if let Some(resolver) = &self.requirement_resolver {
                if let Some(resolved) = resolver.resolve(&task) {
                    task.metadata.requirement = Some(resolved.requirement);
                    task.steps = resolved.steps;
                }
            }
        }

        // Generic no-executable-plan heuristic; never overwrites an
        // existing blocked reason (the Rig-E sentinel in particular)
        if task.steps.is_empty()
            && task.metadata.blocked_reason.is_none()
            && !matches!(task.task_type, TaskType::SterlingIr | TaskType::AdvisoryAction)
        {
            match resolve_task_action(&task) {
                Ok(action) => {
                    task.steps.push(TaskStep::leaf(
                        0,
                        task.title.clone(),
                        action.action_type,
                        action.parameters,
                    ));
                }
                Err(failure) => {
                    debug!(failure_code = %failure.failure_code, "no executable plan for task");
                    task.status = TaskStatus::PendingPlanning;
                    task.metadata.set_blocked("no_executable_plan", now);
                }
            }
        }

        // Dedup before insert (sterling used the digest index above)
        if task.task_type != TaskType::SterlingIr {
            if let Some(existing) = self.store.find_similar(&task) {
                info!(task_id = %existing.id, "similar task already present; not inserting");
                return Ok(existing);
            }
        }

        // Goal key from the binding's intent parameters
        if task.metadata.goal_key.is_none() {
            if let Some(binding) = &task.metadata.goal_binding {
                let canonical = crate::protocol::canonicalize_intent_params(&task.parameters);
                if canonical.is_none() && !task.parameters.is_null() {
                    self.events.emit_lifecycle(
                        LifecycleEventKind::IntentParamsUnserializable,
                        Some(&task.id),
                        json!({"goalType": binding.goal_type}),
                    );
                }
                task.metadata.goal_key = Some(format!(
                    "{}::{}",
                    binding.goal_type,
                    canonical.unwrap_or_else(|| "null".to_string())
                ));
            }
        }

        // Origin is stamped exactly once
        stamp_origin(&mut task);
        if self.config.strict_finalize && task.metadata.origin.is_none() {
            self.events.emit_lifecycle(
                LifecycleEventKind::TaskFinalizeInvariantViolation,
                Some(&task.id),
                json!({"reason": "missing_origin"}),
            );
            if let Some(key) = &reserved_key {
                self.store.release_dedupe_key(key);
            }
            return Err(SpineError::FinalizeInvariant(format!(
                "task {} reached the commit boundary without an origin",
                task.id
            )));
        }

        if let Some(reason) = drift_reason(&task) {
            self.events.emit_lifecycle(
                LifecycleEventKind::GoalBindingDrift,
                Some(&task.id),
                drift_summary(&task, &reason),
            );
        }

        // Blocked-pair backfill anchors at updated_at so the safety net
        // cannot extend a TTL
        if task.metadata.blocked_reason.is_some() && task.metadata.blocked_at.is_none() {
            task.metadata.blocked_at = Some(task.metadata.updated_at);
        }

        task.metadata.touch();
        self.store.set_task(task.clone(), SetTaskOptions::default());
        self.assert_commit_invariants(&task);
        if let Some(key) = reserved_key {
            self.store.release_dedupe_key(&key);
        }

        self.events.emit(SpineEvent::TaskAdded {
            task_id: task.id.clone(),
            title: task.title.clone(),
            task_type: task.task_type,
        });
        if task.priority >= 0.8 {
            self.events.emit_lifecycle(
                LifecycleEventKind::HighPriorityAdded,
                Some(&task.id),
                json!({"priority": task.priority}),
            );
        }

        Ok(task)
    }

    /// Expand a committed IR digest with bounded backoff, then resolve
    /// intent leaves; records full exec provenance either way
    async fn ingest_sterling(&self, task: &mut Task) {
        let digest = task
            .metadata
            .sterling
            .as_ref()
            .map(|sterling| sterling.committed_ir_digest.clone())
            .unwrap_or_default();

        let mut exec = SterlingExecProvenance {
            expansion_mode: "ingest".to_string(),
            ..Default::default()
        };

        let outcome = match &self.sterling {
            Some(executor) => {
                let started = std::time::Instant::now();
                let mut attempt = 0u32;
                let mut scheduled_delay_ms = 0u64;
                let outcome = loop {
                    match executor.expand_by_digest(&digest).await {
                        Ok(ExpandByDigest::Ok { steps }) => break Ok(steps),
                        Ok(ExpandByDigest::Blocked { reason })
                            if reason == blocked::DIGEST_UNKNOWN && attempt < 2 =>
                        {
                            let delay = INGEST_RETRY_BASE * 2u32.saturating_pow(attempt);
                            scheduled_delay_ms += delay.as_millis() as u64;
                            attempt += 1;
                            tokio::time::sleep(delay).await;
                        }
                        Ok(ExpandByDigest::Blocked { reason }) => break Err(reason),
                        Err(err) => {
                            warn!(error = %err, digest = %digest, "sterling expansion failed");
                            break Err(blocked::EXECUTOR_ERROR.to_string());
                        }
                    }
                };
                exec.ingest_retry_count = attempt;
                exec.scheduled_delay_ms = scheduled_delay_ms;
                exec.elapsed_delay_ms = started.elapsed().as_millis() as u64;
                outcome
            }
            None => Err(blocked::EXECUTOR_ERROR.to_string()),
        };

        match outcome {
            Ok(steps) => {
                exec.expansion_digest = Some(steps_digest(&steps));
                task.steps = steps;
                self.resolve_intents(task, &mut exec).await;
            }
            Err(reason) => {
                task.status = TaskStatus::PendingPlanning;
                task.metadata.set_blocked(&reason, Utc::now());
            }
        }

        if let Some(sterling) = task.metadata.sterling.as_mut() {
            sterling.exec = Some(exec);
        }
    }

    /// Post-expansion intent resolution; every outcome fails closed
    async fn resolve_intents(&self, task: &mut Task, exec: &mut SterlingExecProvenance) {
        let now = Utc::now();
        let intent_leaves = remaining_intent_leaves(&task.steps);
        if intent_leaves.is_empty() {
            exec.executor_plan_digest = Some(steps_digest(&task.steps));
            exec.all_intents_resolved = Some(true);
            return;
        }

        if !self.config.sterling_intent_resolve {
            task.status = TaskStatus::PendingPlanning;
            task.metadata
                .set_blocked(blocked::INTENT_RESOLUTION_DISABLED, now);
            exec.executor_plan_digest = Some(steps_digest(&task.steps));
            exec.all_intents_resolved = Some(false);
            return;
        }

        let (executor, mc_data) = match (&self.sterling, &self.minecraft_data) {
            (Some(executor), Some(mc_data)) => (executor, mc_data),
            _ => {
                task.status = TaskStatus::PendingPlanning;
                task.metadata
                    .set_blocked(blocked::INTENT_RESOLUTION_UNAVAILABLE, now);
                task.metadata.next_eligible_at = Some(
                    now + Duration::milliseconds(self.config.failure_cooldown_ms as i64),
                );
                exec.executor_plan_digest = Some(steps_digest(&task.steps));
                exec.all_intents_resolved = Some(false);
                return;
            }
        };

        let context = IntentResolutionContext {
            task_id: task.id.clone(),
            steps: task.steps.clone(),
            intent_leaves,
        };
        let replacements = match executor.resolve_intent_steps(context).await {
            Ok(replacements) => replacements,
            Err(err) => {
                warn!(error = %err, task_id = %task.id, "intent resolution unavailable");
                task.status = TaskStatus::PendingPlanning;
                task.metadata
                    .set_blocked(blocked::INTENT_RESOLUTION_UNAVAILABLE, now);
                task.metadata.next_eligible_at = Some(
                    now + Duration::milliseconds(self.config.failure_cooldown_ms as i64),
                );
                exec.executor_plan_digest = Some(steps_digest(&task.steps));
                exec.all_intents_resolved = Some(false);
                return;
            }
        };

        // Replacement leaves must be known and pass arg validation
        let mut offenders = Vec::new();
        for replacement in &replacements {
            let Some(steps) = &replacement.resolved else {
                continue;
            };
            for step in steps {
                match &step.meta.leaf {
                    Some(leaf)
                        if mc_data.known_leaf(leaf)
                            && mc_data.validate_leaf_args(leaf, &step.meta.args) => {}
                    Some(leaf) => offenders.push(leaf.clone()),
                    None => offenders.push(format!("step:{}", step.id)),
                }
            }
        }
        if !offenders.is_empty() {
            task.status = TaskStatus::PendingPlanning;
            task.metadata.set_blocked(blocked::UNDISPATCHABLE_STEPS, now);
            exec.undispatchable_leaves = offenders;
            exec.executor_plan_digest = Some(steps_digest(&task.steps));
            exec.all_intents_resolved = Some(false);
            return;
        }

        let outcome = splice_intent_replacements(&task.steps, &replacements);
        task.steps = outcome.steps;
        exec.executor_plan_digest = Some(outcome.executor_plan_digest);
        exec.all_intents_resolved = Some(outcome.all_intents_resolved);
        if !outcome.all_intents_resolved {
            task.status = TaskStatus::PendingPlanning;
            task.metadata.set_blocked(blocked::UNRESOLVED_INTENTS, now);
        }
    }

    /// Rig-E planning through the macro planner, or the blocking sentinel
    async fn plan_rig_e(&self, task: &mut Task) {
        let now = Utc::now();
        let Some(planner) = &self.planner else {
            task.status = TaskStatus::PendingPlanning;
            task.metadata.set_blocked("rig_e_solver_unimplemented", now);
            self.events.emit_lifecycle(
                LifecycleEventKind::SolverUnavailable,
                Some(&task.id),
                json!({"reason": "rig_e_solver_unimplemented", "type": task.task_type.as_str()}),
            );
            return;
        };
        if !task.steps.is_empty() {
            return;
        }
        let requirement = task.metadata.requirement.clone().unwrap_or(Value::Null);
        let context = planner.context_from_requirement(&requirement);
        match planner.plan_macro_path(&context).await {
            Ok(MacroPlan::Steps(steps)) => task.steps = steps,
            Ok(MacroPlan::NoPlanFound) => {
                task.status = TaskStatus::PendingPlanning;
                task.metadata.set_blocked("rig_e_no_plan_found", now);
            }
            Ok(MacroPlan::OntologyGap) => {
                task.status = TaskStatus::PendingPlanning;
                task.metadata.set_blocked("rig_e_ontology_gap", now);
            }
            Err(err) => {
                warn!(error = %err, task_id = %task.id, "macro planner failed");
                task.status = TaskStatus::PendingPlanning;
                task.metadata.set_blocked("rig_e_planner_error", now);
            }
        }
    }

    /// Status mutator; the single entry point for every status change
    pub fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        origin: MutationOrigin,
    ) -> SpineResult<Task> {
        let task = self
            .store
            .get(id)
            .ok_or_else(|| SpineError::TaskNotFound(id.to_string()))?;
        let cause = match origin {
            MutationOrigin::Runtime => StatusChangeCause::Runtime,
            MutationOrigin::Protocol => StatusChangeCause::Protocol,
        };
        self.run_status_transition(task, status, cause, origin)
    }

    fn run_status_transition(
        &self,
        mut task: Task,
        next: TaskStatus,
        cause: StatusChangeCause,
        origin: MutationOrigin,
    ) -> SpineResult<Task> {
        let previous = task.status;
        if previous == next {
            return Ok(task);
        }
        if previous.is_immutable() {
            return Err(SpineError::InvalidTransition {
                from: previous.to_string(),
                to: next.to_string(),
            });
        }

        task.status = next;
        if previous == TaskStatus::Unplannable {
            if let Some(replan) = task.metadata.solver.rig_g_replan.as_mut() {
                replan.in_flight = false;
            }
        }
        task.metadata.touch();

        match origin {
            MutationOrigin::Protocol => {
                // Protocol-origin cascades skip hook evaluation entirely;
                // this is what bounds reducer recursion
                self.store.set_task(task.clone(), SetTaskOptions::default());
                self.assert_commit_invariants(&task);
            }
            MutationOrigin::Runtime => {
                let output = if task.metadata.goal_binding.is_some() {
                    on_task_status_changed(&task, previous, next, cause)
                } else {
                    ReducerOutput::default()
                };
                let (self_effects, remaining) =
                    partition_self_hold_effects(&task.id, output.sync_effects);
                for effect in &self_effects {
                    match effect {
                        SyncEffect::ApplyHold {
                            reason,
                            next_review_at,
                            ..
                        } => apply_hold(&mut task, *reason, *next_review_at),
                        SyncEffect::ClearHold { .. } => {
                            clear_hold(&mut task);
                        }
                        _ => {}
                    }
                }
                // The commit sees status and hold changes together
                self.store.set_task(task.clone(), SetTaskOptions::default());
                self.assert_commit_invariants(&task);
                apply_sync_effects(self, &remaining);
                for update in output.goal_status_updates {
                    self.goal_sink
                        .update_goal_status(&update.goal_id, &update.status, &update.reason);
                }
            }
        }

        if previous == TaskStatus::Unplannable {
            self.replans.cancel(&task.id);
        }
        if next.is_terminal() {
            self.on_terminal_transition(&task, next);
        }

        Ok(self.store.get(&task.id).unwrap_or(task))
    }

    fn on_terminal_transition(&self, task: &Task, next: TaskStatus) {
        if next == TaskStatus::Unplannable {
            return;
        }
        let kind = if next == TaskStatus::Completed {
            LifecycleEventKind::Completed
        } else {
            LifecycleEventKind::Failed
        };
        self.events.emit_lifecycle(
            kind,
            Some(&task.id),
            json!({"status": next.as_str(), "failureCode": task.failure_code}),
        );
        let Some(prepared) =
            prepare_episode_report(task, next == TaskStatus::Completed, self.config.join_keys_deprecated_compat)
        else {
            return;
        };

        // Substrate is consumed exactly once: re-read the latest task and
        // merge the cleared field rather than overwriting the whole record
        if prepared.consumed_substrate {
            if let Some(mut latest) = self.store.get(&task.id) {
                latest.metadata.solver.solve_result_substrate = None;
                latest.metadata.touch();
                self.store.set_task(latest, SetTaskOptions::default());
            }
        }

        if let Some(solver) = self.solvers.get(&prepared.report.domain) {
            let solver = Arc::clone(solver);
            let report = prepared.report;
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(err) = solver.report_episode_result(report).await {
                            warn!(error = %err, "episode report failed");
                        }
                    });
                }
                Err(_) => warn!(
                    task_id = %task.id,
                    "no runtime available for episode report; dropping"
                ),
            }
        }
    }

    /// Progress mutator; full progress notifies the owning goal
    pub fn update_task_progress(&self, id: &str, progress: f64) -> SpineResult<Task> {
        let mut task = self
            .store
            .get(id)
            .ok_or_else(|| SpineError::TaskNotFound(id.to_string()))?;
        task.progress = progress.clamp(0.0, 1.0);
        task.metadata.touch();
        self.store.set_task(task.clone(), SetTaskOptions::default());

        let output = on_task_progress_updated(&task, task.progress);
        apply_sync_effects(self, &output.sync_effects);
        for update in output.goal_status_updates {
            self.goal_sink
                .update_goal_status(&update.goal_id, &update.status, &update.reason);
        }
        Ok(task)
    }

    /// Metadata mutator with TTL-anchor semantics
    pub fn update_task_metadata(&self, id: &str, patch: MetadataPatch) -> SpineResult<Task> {
        let mut task = self
            .store
            .get(id)
            .ok_or_else(|| SpineError::TaskNotFound(id.to_string()))?;
        let now = Utc::now();

        if patch.origin.is_some() {
            reject_origin_patch(id);
        }
        if let Some(reason_change) = patch.blocked_reason {
            match reason_change {
                Some(reason) => task.metadata.set_blocked(reason, now),
                None => task.metadata.clear_blocked(),
            }
        }
        if let Some(explicit) = patch.blocked_at {
            task.metadata.blocked_at = Some(explicit);
        }
        if let Some(next_eligible) = patch.next_eligible_at {
            task.metadata.next_eligible_at = next_eligible;
        }
        if let Some(binding) = patch.goal_binding {
            task.metadata.goal_binding = binding;
        }
        if let Some(solver) = patch.solver {
            task.metadata.solver = solver;
        }
        if let Some(sterling) = patch.sterling {
            task.metadata.sterling = Some(sterling);
        }
        if let Some(tags) = patch.tags {
            task.metadata.tags = tags;
        }
        if let Some(category) = patch.category {
            task.metadata.category = category;
        }
        if let Some(requirement) = patch.requirement {
            task.metadata.requirement = requirement;
        }
        for (key, value) in patch.extensions {
            task.metadata.extensions.insert(key, value);
        }

        task.metadata.touch();
        self.store.set_task(task.clone(), SetTaskOptions::default());
        self.assert_commit_invariants(&task);
        Ok(task)
    }

    /// Rig-G feasibility gate; runs at most once per task
    pub fn start_task_step(
        self: &Arc<Self>,
        id: &str,
        step_id: &str,
        dry_run: bool,
    ) -> SpineResult<StepStartOutcome> {
        let mut task = self
            .store
            .get(id)
            .ok_or_else(|| SpineError::TaskNotFound(id.to_string()))?;
        if !task.steps.iter().any(|step| step.id == step_id) {
            return Err(SpineError::StepNotFound {
                task_id: id.to_string(),
                step_id: step_id.to_string(),
            });
        }

        if !task.metadata.solver.rig_g_checked {
            if let Some(rig_g) = task.metadata.solver.rig_g.clone() {
                let advice = evaluate_rig_g(&rig_g);
                if dry_run {
                    self.events.emit_lifecycle(
                        LifecycleEventKind::ShadowRigGEvaluation,
                        Some(id),
                        json!({"advice": {
                            "shouldProceed": advice.should_proceed,
                            "suggestedParallelism": advice.suggested_parallelism,
                        }}),
                    );
                    return Ok(StepStartOutcome::DryRun(advice));
                }
                if !advice.should_proceed {
                    let rejection = advice
                        .top_rejection
                        .clone()
                        .unwrap_or_else(|| "unknown".to_string());
                    let reason = format!("Feasibility failed: {}", rejection);
                    task.status = TaskStatus::Unplannable;
                    task.metadata.set_blocked(&reason, Utc::now());
                    task.metadata.touch();
                    self.store.set_task(task.clone(), SetTaskOptions::default());
                    self.assert_commit_invariants(&task);
                    self.schedule_replan(id);
                    return Ok(StepStartOutcome::Infeasible {
                        blocked_reason: reason,
                    });
                }
                task.metadata.solver.suggested_parallelism = Some(advice.suggested_parallelism);
                task.metadata.solver.rig_g_checked = true;
            }
        }

        if dry_run {
            return Ok(StepStartOutcome::DryRun(RigGAdvice {
                should_proceed: true,
                suggested_parallelism: task.metadata.solver.suggested_parallelism.unwrap_or(1),
                top_rejection: None,
            }));
        }

        let now = Utc::now();
        if let Some(step) = task.steps.iter_mut().find(|step| step.id == step_id) {
            if step.started_at.is_none() {
                step.started_at = Some(now);
            }
        }
        task.metadata.touch();
        self.store.set_task(task.clone(), SetTaskOptions::default());
        Ok(StepStartOutcome::Proceed {
            suggested_parallelism: task.metadata.solver.suggested_parallelism.unwrap_or(1),
        })
    }

    /// Debounced replan scheduling; re-entry while a timer exists is a no-op
    fn schedule_replan(self: &Arc<Self>, task_id: &str) {
        let Some(mut task) = self.store.get(task_id) else {
            return;
        };
        let attempts = task
            .metadata
            .solver
            .rig_g_replan
            .as_ref()
            .map(|replan| replan.attempts)
            .unwrap_or(0);
        if attempts >= MAX_REPLAN_ATTEMPTS {
            self.events.emit_lifecycle(
                LifecycleEventKind::RigGReplanExhausted,
                Some(task_id),
                json!({"attempts": attempts}),
            );
            return;
        }
        if self.replans.is_scheduled(task_id) {
            debug!(task_id, "replan already scheduled");
            return;
        }

        let delay = replan_delay(attempts);
        task.metadata.solver.rig_g_replan = Some(RigGReplanState {
            attempts: attempts + 1,
            in_flight: true,
        });
        task.metadata.touch();
        self.store.set_task(task.clone(), SetTaskOptions::default());
        self.events.emit_lifecycle(
            LifecycleEventKind::RigGReplanNeeded,
            Some(task_id),
            json!({"attempt": attempts + 1, "delayMs": delay.as_millis() as u64}),
        );

        let integration = Arc::clone(self);
        let id = task_id.to_string();
        self.replans.schedule(task_id, attempts, delay, async move {
            integration.on_replan_timer(&id);
        });
    }

    /// Timer fired: clear the in-flight flag, and keep attempting while the
    /// task remains unplannable
    fn on_replan_timer(self: &Arc<Self>, task_id: &str) {
        let Some(mut task) = self.store.get(task_id) else {
            return;
        };
        if let Some(replan) = task.metadata.solver.rig_g_replan.as_mut() {
            replan.in_flight = false;
        }
        task.metadata.touch();
        self.store.set_task(task.clone(), SetTaskOptions::default());

        if task.status == TaskStatus::Unplannable {
            self.schedule_replan(task_id);
        }
    }

    /// User management action with hold preconditioning and rollback
    pub fn management_action(&self, id: &str, action: ManagementAction) -> SpineResult<Task> {
        let mut task = self
            .store
            .get(id)
            .ok_or_else(|| SpineError::TaskNotFound(id.to_string()))?;
        let plan = plan_management_action(&task, action)?;

        if let ManagementAction::Prioritize(priority) = action {
            task.priority = priority.clamp(0.0, 1.0);
            task.metadata.touch();
            self.store.set_task(task.clone(), SetTaskOptions::default());
            return Ok(task);
        }

        // Pre-compute the hold change so the commit carries status and
        // hold together
        apply_hold_change(&mut task, &plan);
        if action == ManagementAction::Cancel {
            task.error = Some("cancelled by user".to_string());
            task.failure_code = Some("cancelled".to_string());
        }

        let Some(next) = plan.next_status else {
            self.store.set_task(task.clone(), SetTaskOptions::default());
            return Ok(task);
        };

        match self.run_status_transition(
            task.clone(),
            next,
            StatusChangeCause::UserManagement,
            MutationOrigin::Runtime,
        ) {
            Ok(updated) => Ok(updated),
            Err(err) => {
                // Nothing was committed; restore the in-memory hold so the
                // caller's snapshot matches the store
                rollback_hold_change(&mut task, &plan);
                Err(err)
            }
        }
    }

    /// Fan a goal-level event out across its bound tasks
    pub fn dispatch_goal_event(&self, event: &GoalEvent) {
        let bound: Vec<Task> = self
            .store
            .get_all()
            .into_iter()
            .filter(|task| {
                task.metadata.goal_binding.as_ref().is_some_and(|binding| {
                    binding.goal_id.as_deref() == Some(event.goal_id.as_str())
                        || binding.goal_instance_id == event.goal_id
                })
            })
            .collect();
        let output = on_goal_action(event, &bound);
        apply_sync_effects(self, &output.sync_effects);
        for update in output.goal_status_updates {
            self.goal_sink
                .update_goal_status(&update.goal_id, &update.status, &update.reason);
        }
    }

    /// Mark the current step done; completes the task when all steps are
    pub fn record_step_success(&self, id: &str) -> SpineResult<Task> {
        let mut task = self
            .store
            .get(id)
            .ok_or_else(|| SpineError::TaskNotFound(id.to_string()))?;
        if let Some(step) = task.current_step_mut() {
            step.done = true;
        }
        task.progress = task.step_progress();
        task.metadata.retry_count = 0;
        task.metadata.next_eligible_at = None;
        task.metadata.touch();

        let all_done = !task.steps.is_empty() && task.steps.iter().all(|step| step.done);
        if all_done {
            task.progress = 1.0;
            self.run_status_transition(
                task,
                TaskStatus::Completed,
                StatusChangeCause::Runtime,
                MutationOrigin::Runtime,
            )
        } else {
            self.store.set_task(task.clone(), SetTaskOptions::default());
            Ok(task)
        }
    }

    /// Record a failed dispatch. Deterministic failures terminate the task
    /// immediately without touching backoff fields; retryable failures set
    /// an exponential `next_eligible_at` floor.
    pub fn record_step_failure(
        &self,
        id: &str,
        error: &str,
        failure_code: Option<&str>,
        deterministic: bool,
    ) -> SpineResult<Task> {
        let mut task = self
            .store
            .get(id)
            .ok_or_else(|| SpineError::TaskNotFound(id.to_string()))?;
        task.error = Some(error.to_string());
        task.failure_code = failure_code.map(str::to_string);

        if deterministic {
            self.run_status_transition(
                task,
                TaskStatus::Failed,
                StatusChangeCause::Runtime,
                MutationOrigin::Runtime,
            )
        } else {
            task.metadata.retry_count += 1;
            let exponent = task.metadata.retry_count.saturating_sub(1).min(6);
            let backoff = (self.config.failure_cooldown_ms * 2u64.pow(exponent))
                .min(self.config.max_backoff_ms);
            task.metadata.next_eligible_at =
                Some(Utc::now() + Duration::milliseconds(backoff as i64));
            task.metadata.touch();
            self.store.set_task(task.clone(), SetTaskOptions::default());
            Ok(task)
        }
    }

    /// Observer-snapshot tripwire at the commit boundary
    fn assert_commit_invariants(&self, task: &Task) {
        for violation in detect_illegal_states(task) {
            if !violation.is_relaxed() {
                warn!(task_id = %task.id, violation = ?violation, "illegal state at commit boundary");
            }
        }
    }
}

impl EffectContext for TaskIntegration {
    fn get_task(&self, id: &str) -> Option<Task> {
        self.store.get(id)
    }

    fn commit_task(&self, task: Task) {
        self.store.set_task(task.clone(), SetTaskOptions::default());
        self.assert_commit_invariants(&task);
    }

    fn route_task_status(&self, id: &str, status: TaskStatus, reason: &str) {
        if let Err(err) = self.update_task_status(id, status, MutationOrigin::Protocol) {
            warn!(task_id = id, error = %err, reason, "protocol status cascade rejected");
        }
    }

    fn update_goal_status(&self, goal_id: &str, status: &str, reason: &str) {
        self.goal_sink.update_goal_status(goal_id, status, reason);
    }
}
