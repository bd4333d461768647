//! Task data model and store

pub mod metadata;
pub mod model;
pub mod store;

pub use metadata::{
    GoalBinding, Hold, HoldReason, JoinKeys, Origin, OriginKind, RigGMeta, RigGReplanState,
    RigGSignals, SolveResultSubstrate, SolverMeta, SterlingExecProvenance, SterlingMeta,
    TaskMetadata, TaskProvenance,
};
pub use model::{
    new_task_id, StepMeta, Task, TaskId, TaskSource, TaskStatus, TaskStep, TaskType,
    INTENT_LEAF_PREFIX,
};
pub use store::{SetTaskOptions, StoreStats, TaskFilter, TaskHistoryEntry, TaskStore};
