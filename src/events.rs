//! Lifecycle event sidecar
//!
//! Emits task lifecycle events over an unbounded channel so that event
//! publication never blocks a tick. Consumers (dashboard notifier, thought
//! stream) drain the receiver on their own schedule.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;

use crate::task::TaskType;

/// Lifecycle event discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventKind {
    HighPriorityAdded,
    Completed,
    Failed,
    SolverUnavailable,
    RigGReplanNeeded,
    RigGReplanExhausted,
    ShadowRigGEvaluation,
    GoalBindingDrift,
    IntentParamsUnserializable,
    TaskFinalizeInvariantViolation,
}

/// Event published by the spine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SpineEvent {
    /// A task was finalized and persisted
    TaskAdded {
        task_id: String,
        title: String,
        task_type: TaskType,
    },
    /// A task lifecycle event with a structured detail payload
    TaskLifecycleEvent {
        kind: LifecycleEventKind,
        task_id: Option<String>,
        detail: Value,
    },
}

/// Cloneable sender half of the event sidecar
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<SpineEvent>,
}

impl EventBus {
    /// Create a bus and its receiver
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SpineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Create a bus with no consumer (emissions are dropped)
    pub fn detached() -> Self {
        let (bus, _rx) = Self::new();
        bus
    }

    /// Emit an event; a closed channel is not an error
    pub fn emit(&self, event: SpineEvent) {
        if self.tx.send(event).is_err() {
            trace!("Event receiver dropped, discarding event");
        }
    }

    /// Emit a lifecycle event
    pub fn emit_lifecycle(&self, kind: LifecycleEventKind, task_id: Option<&str>, detail: Value) {
        self.emit(SpineEvent::TaskLifecycleEvent {
            kind,
            task_id: task_id.map(str::to_string),
            detail,
        });
    }
}
