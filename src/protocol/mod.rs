//! Goal-binding protocol engine
//!
//! Pure reducers turn task-state changes and goal-level events into ordered
//! synchronization effects; the applier commits them under the spine's
//! write-ordering discipline. Hold state is owned here.

pub mod applier;
pub mod canonical;
pub mod effects;
pub mod hold;
pub mod reducer;

pub use applier::{
    apply_hold_change, apply_sync_effects, plan_management_action, rollback_hold_change,
    EffectContext, HoldChange, ManagementAction, ManagementPlan, MutationOrigin,
};
pub use canonical::{
    canonicalize_intent_params, canonicalize_value, goal_key, sha256_hex, steps_digest,
};
pub use effects::{partition_self_hold_effects, GoalStatusUpdate, ReducerOutput, SyncEffect};
pub use hold::{apply_hold, clear_hold, detect_illegal_states, IllegalState};
pub use reducer::{
    on_goal_action, on_task_progress_updated, on_task_status_changed, GoalAction, GoalEvent,
    StatusChangeCause,
};
