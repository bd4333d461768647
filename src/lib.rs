//! Task execution spine for an autonomous Minecraft agent
//!
//! This crate is the planning core that turns intent into action:
//! - Converts thoughts, goals, and Sterling IR envelopes into finalized
//!   tasks with verifiable origin and resolved action parameters
//! - Reconciles task state with a goal-binding/hold protocol whose effects
//!   fan out across tasks atomically
//! - Schedules one step per tick through a layered guard pipeline
//!   (geofence -> allowlist -> shadow -> rate -> feasibility)
//! - Interprets remote action responses into normalized outcomes with
//!   deterministic-vs-retryable classification

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod gateway;
pub mod integration;
pub mod protocol;
pub mod resolver;
pub mod response;
pub mod task;

pub use config::{ExecutorConfig, ExecutorMode, GeofenceConfig};
pub use error::{SpineError, SpineResult};
pub use events::{EventBus, LifecycleEventKind, SpineEvent};
pub use executor::{
    BreakerState, CircuitBreaker, ExecutorState, ExecutorSupervisor, GuardDecision, RateLimiter,
    TickOutcome,
};
pub use gateway::{
    cancel_pair, ActionRequest, AuditEntry, CancelHandle, CancelSignal, ExecutionGateway,
    GatewayAction, GatewayResponse, RequestOrigin, RequestPriority,
};
pub use integration::{MetadataPatch, NewTask, StepStartOutcome, TaskIntegration};
pub use resolver::{resolve_task_action, MappingCategory, MappingFailure, ResolvedAction};
pub use response::{is_deterministic_failure, normalize_action_response, NormalizedResponse};
pub use task::{Task, TaskId, TaskSource, TaskStatus, TaskStep, TaskStore, TaskType};
