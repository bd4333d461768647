//! Autonomous executor
//!
//! A cooperative loop on a fixed interval: every tick selects at most one
//! eligible task, runs the guard pipeline, optionally dispatches through
//! the gateway, and applies circuit-breaker and exponential-backoff policy.
//! State is supervisor-scoped; emergency stop is a method, not a free
//! function.

pub mod breaker;
pub mod eligibility;
pub mod guards;
pub mod rate_limiter;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::ExecutorConfig;
use crate::error::SpineResult;
use crate::gateway::{
    ActionRequest, CancelHandle, ExecutionGateway, GatewayAction, GatewayResponse, RequestOrigin,
    RequestPriority,
};
use crate::integration::collaborators::BotContextProvider;
use crate::integration::{MetadataPatch, StepStartOutcome, TaskIntegration};
use crate::protocol::MutationOrigin;
use crate::resolver::resolve_task_action;
use crate::response::is_deterministic_failure;
use crate::task::{Task, TaskStatus};

pub use breaker::{BreakerState, CircuitBreaker};
pub use eligibility::{blocked_disposition, is_eligible, ttl_policy_for, BlockedDisposition, TtlPolicy};
pub use guards::{evaluate_guards, GuardDecision};
pub use rate_limiter::{RateLimiter, RATE_WINDOW};

/// What a single tick did
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Kill switch is off
    Disabled,
    /// Circuit breaker holds the loop closed
    BreakerOpen,
    /// Nothing eligible this tick
    NoEligibleTask,
    /// A guard blocked the candidate
    Guarded(GuardDecision),
    /// Shadow mode observed without dispatching
    ShadowObserved,
    /// Feasibility gate moved the task to unplannable
    RigGBlocked,
    /// Action resolution failed deterministically
    ResolutionFailed,
    /// Transport-class failure; the breaker was tripped, the task unblamed
    Infrastructure,
    /// Step bookkeeping advanced without a dispatch
    Reconciled,
    /// An action was dispatched
    Dispatched { ok: bool },
}

/// Observable supervisor state
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorState {
    pub running: bool,
    pub failures: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub breaker: BreakerState,
}

/// Lifecycle-scoped supervisor for the cooperative execution loop
pub struct ExecutorSupervisor {
    config: ExecutorConfig,
    integration: Arc<TaskIntegration>,
    gateway: Arc<ExecutionGateway>,
    bot_context: Option<Arc<dyn BotContextProvider>>,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    /// Kill switch polled at every tick
    enabled: AtomicBool,
    running: AtomicBool,
    failures: AtomicU32,
    last_attempt: Mutex<Option<DateTime<Utc>>>,
    cancel: CancelHandle,
    tick_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutorSupervisor {
    pub fn new(
        config: ExecutorConfig,
        integration: Arc<TaskIntegration>,
        gateway: Arc<ExecutionGateway>,
    ) -> Self {
        let (cancel, _) = crate::gateway::cancel_pair();
        let limiter = RateLimiter::new(config.max_steps_per_minute);
        let enabled = config.enabled;
        Self {
            config,
            integration,
            gateway,
            bot_context: None,
            limiter,
            breaker: CircuitBreaker::new(),
            enabled: AtomicBool::new(enabled),
            running: AtomicBool::new(false),
            failures: AtomicU32::new(0),
            last_attempt: Mutex::new(None),
            cancel,
            tick_handle: Mutex::new(None),
        }
    }

    pub fn with_bot_context(mut self, context: Arc<dyn BotContextProvider>) -> Self {
        self.bot_context = Some(context);
        self
    }

    pub fn state(&self) -> ExecutorState {
        ExecutorState {
            running: self.running.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
            last_attempt: *self.last_attempt.lock(),
            breaker: self.breaker.state(),
        }
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Toggle the tick gate
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Spawn the interval loop
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let supervisor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            supervisor.run().await;
        });
        *self.tick_handle.lock() = Some(handle);
    }

    async fn run(self: Arc<Self>) {
        info!(
            poll_ms = self.config.poll_ms,
            mode = self.config.mode.as_str(),
            "executor loop started"
        );
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.poll_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            match self.run_cycle().await {
                Ok(outcome) => {
                    self.failures.store(0, Ordering::SeqCst);
                    debug!(outcome = ?outcome, "tick complete");
                }
                Err(err) => {
                    let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                    let backoff = (250u64 * 2u64.saturating_pow(failures.min(16)))
                        .min(self.config.max_backoff_ms);
                    warn!(
                        failures,
                        backoff_ms = backoff,
                        error = %err,
                        "cycle failed; backing off"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
            }
        }
        info!("executor loop stopped");
    }

    /// Stop issuing new actions: abort in-flight egress and halt the loop.
    /// Bot-side effects already dispatched are not undone.
    pub fn emergency_stop(&self) {
        warn!("emergency stop engaged");
        self.cancel.abort();
        self.enabled.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.tick_handle.lock().take() {
            handle.abort();
        }
    }

    /// One cooperative tick
    #[instrument(skip(self))]
    pub async fn run_cycle(self: &Arc<Self>) -> SpineResult<TickOutcome> {
        if !self.enabled.load(Ordering::SeqCst) {
            return Ok(TickOutcome::Disabled);
        }
        let tick_instant = Instant::now();
        if self.breaker.is_open_at(tick_instant) {
            return Ok(TickOutcome::BreakerOpen);
        }

        let now = Utc::now();
        *self.last_attempt.lock() = Some(now);

        self.preprocess_blocked(now)?;

        let Some(task) = self.select_task(now) else {
            return Ok(TickOutcome::NoEligibleTask);
        };

        let action = match resolve_task_action(&task) {
            Ok(action) => action,
            Err(failure) => {
                // Deterministic mapping defect: surface immediately, no backoff
                self.integration.record_step_failure(
                    &task.id,
                    &failure.reason,
                    Some(&failure.failure_code),
                    true,
                )?;
                return Ok(TickOutcome::ResolutionFailed);
            }
        };

        let leaf = task
            .current_step()
            .and_then(|step| step.meta.leaf.clone())
            .unwrap_or_else(|| action.action_type.clone());
        let position = self.bot_context.as_ref().and_then(|ctx| ctx.position());

        let decision = evaluate_guards(&self.config, position, &leaf, &self.limiter, tick_instant);
        match decision {
            GuardDecision::BlockUnknownPosition | GuardDecision::BlockOutsideGeofence => {
                debug!(task_id = %task.id, decision = ?decision, "geofence blocked dispatch");
                Ok(TickOutcome::Guarded(decision))
            }
            GuardDecision::BlockUnknownLeaf => {
                self.integration.update_task_metadata(
                    &task.id,
                    MetadataPatch {
                        blocked_reason: Some(Some(format!("unknown_leaf:{}", leaf))),
                        ..Default::default()
                    },
                )?;
                Ok(TickOutcome::Guarded(decision))
            }
            GuardDecision::ShadowObserve => {
                self.shadow_observe(&task, action.action_type, action.parameters)
                    .await?;
                Ok(TickOutcome::ShadowObserved)
            }
            GuardDecision::RateLimited => Ok(TickOutcome::Guarded(decision)),
            GuardDecision::AwaitRigG => {
                self.commit_and_dispatch(task, action.action_type, action.parameters, tick_instant)
                    .await
            }
        }
    }

    /// Shadow mode: dry-run the feasibility gate, audit through the
    /// gateway, then park the task for live mode
    async fn shadow_observe(
        &self,
        task: &Task,
        action_type: String,
        parameters: serde_json::Value,
    ) -> SpineResult<()> {
        if let Some(step) = task.current_step() {
            let step_id = step.id.clone();
            // Dry run: evaluates and emits advice without mutating
            if let Err(err) = self
                .integration
                .start_task_step(&task.id, &step_id, true)
                .map(|_| ())
            {
                debug!(task_id = %task.id, error = %err, "shadow feasibility evaluation failed");
            }
        }

        let request = ActionRequest {
            origin: RequestOrigin::Executor,
            priority: RequestPriority::Normal,
            action: GatewayAction {
                action_type,
                parameters,
                timeout_ms: None,
            },
            context: Some(json!({"taskId": task.id})),
        };
        let _ = self.gateway.execute(request, None).await;

        self.integration.update_task_metadata(
            &task.id,
            MetadataPatch {
                blocked_reason: Some(Some("shadow_mode".to_string())),
                ..Default::default()
            },
        )?;
        Ok(())
    }

    /// Commit step: feasibility gate, rate-limiter record, dispatch
    async fn commit_and_dispatch(
        self: &Arc<Self>,
        task: Task,
        action_type: String,
        parameters: serde_json::Value,
        tick_instant: Instant,
    ) -> SpineResult<TickOutcome> {
        let Some(step) = task.current_step().cloned() else {
            // Every step is already done; close the task out
            self.integration.record_step_success(&task.id)?;
            return Ok(TickOutcome::Reconciled);
        };

        match self.integration.start_task_step(&task.id, &step.id, false)? {
            StepStartOutcome::Proceed { .. } => {}
            _ => return Ok(TickOutcome::RigGBlocked),
        }

        // Execution is committed: this is the only place record is called
        self.limiter.record_at(tick_instant);
        if task.status == TaskStatus::Active {
            self.integration
                .update_task_status(&task.id, TaskStatus::InProgress, MutationOrigin::Runtime)?;
        }

        let request = ActionRequest {
            origin: RequestOrigin::Executor,
            priority: if task.priority >= 0.8 {
                RequestPriority::High
            } else {
                RequestPriority::Normal
            },
            action: GatewayAction {
                action_type,
                parameters,
                timeout_ms: None,
            },
            context: Some(json!({"taskId": task.id, "stepId": step.id})),
        };
        let response = self.gateway.execute(request, Some(self.cancel.signal())).await;
        self.interpret_response(&task, response)
    }

    /// Map the normalized gateway outcome onto the task
    fn interpret_response(
        &self,
        task: &Task,
        response: GatewayResponse,
    ) -> SpineResult<TickOutcome> {
        if response.ok {
            self.breaker.record_success();
            self.integration.record_step_success(&task.id)?;
            return Ok(TickOutcome::Dispatched { ok: true });
        }
        if response.shadow_blocked {
            return Ok(TickOutcome::ShadowObserved);
        }

        let error = response.error.as_deref().unwrap_or("Action failed");
        match response.failure_code.as_deref() {
            Some(code) => {
                let deterministic = is_deterministic_failure(code);
                self.integration
                    .record_step_failure(&task.id, error, Some(code), deterministic)?;
                Ok(TickOutcome::Dispatched { ok: false })
            }
            // A failure with no code and no leaf payload is transport-class:
            // trip the breaker, leave the task unblamed
            None if response.data.is_null() => {
                self.breaker.trip_at(Instant::now(), error);
                Ok(TickOutcome::Infrastructure)
            }
            None => {
                self.integration
                    .record_step_failure(&task.id, error, None, false)?;
                Ok(TickOutcome::Dispatched { ok: false })
            }
        }
    }

    /// Auto-unblock and TTL auto-fail pass over blocked tasks
    fn preprocess_blocked(&self, now: DateTime<Utc>) -> SpineResult<()> {
        for task in self.integration.store().get_all() {
            if task.status.is_terminal() {
                continue;
            }
            match blocked_disposition(&task, self.config.mode, now) {
                Some(BlockedDisposition::Unblock) => {
                    debug!(task_id = %task.id, "auto-unblocking shadow-mode task");
                    self.integration.update_task_metadata(
                        &task.id,
                        MetadataPatch {
                            blocked_reason: Some(None),
                            ..Default::default()
                        },
                    )?;
                }
                Some(BlockedDisposition::Fail(reason)) => {
                    info!(task_id = %task.id, reason = %reason, "auto-failing blocked task");
                    self.integration
                        .record_step_failure(&task.id, &reason, Some(&reason), true)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Pick one eligible task; when nothing is active, promote the best
    /// pending task first
    fn select_task(&self, now: DateTime<Utc>) -> Option<Task> {
        let store = self.integration.store();
        let mut eligible: Vec<Task> = store
            .get_all()
            .into_iter()
            .filter(|task| is_eligible(task, now))
            .collect();

        if eligible.is_empty() {
            let mut pending: Vec<Task> = store
                .get_all()
                .into_iter()
                .filter(|task| {
                    task.status == TaskStatus::Pending
                        && task.metadata.blocked_reason.is_none()
                        && task
                            .metadata
                            .next_eligible_at
                            .map(|at| at <= now)
                            .unwrap_or(true)
                })
                .collect();
            pending.sort_by(|a, b| b.priority.total_cmp(&a.priority));
            let candidate = pending.into_iter().next()?;
            return self
                .integration
                .update_task_status(&candidate.id, TaskStatus::Active, MutationOrigin::Runtime)
                .ok();
        }

        eligible.sort_by(|a, b| {
            b.priority
                .total_cmp(&a.priority)
                .then(b.urgency.total_cmp(&a.urgency))
        });
        eligible.into_iter().next()
    }
}
