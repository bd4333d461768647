//! Layered guard pipeline
//!
//! A pure decision function with a strict ordering contract:
//! geofence -> leaf allowlist -> shadow -> rate -> feasibility handoff.
//! Evaluation consults the rate limiter's budget but never records.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::{ExecutorConfig, ExecutorMode, GeofenceConfig};
use crate::executor::rate_limiter::RateLimiter;
use crate::integration::collaborators::BotPosition;

/// Outcome of one guard evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardDecision {
    /// Geofence enabled but the bot position is unknown (fail-closed)
    BlockUnknownPosition,
    /// Bot is outside the geofence (or its Y is unknown while a Y band
    /// is configured)
    BlockOutsideGeofence,
    /// Leaf is not on the allowlist; blocks even in shadow mode
    BlockUnknownLeaf,
    /// Shadow mode: observe without dispatching; never throttled
    ShadowObserve,
    /// Live budget exhausted for this window
    RateLimited,
    /// All static guards passed; caller runs the feasibility gate and
    /// commits execution
    AwaitRigG,
}

fn outside_geofence(fence: &GeofenceConfig, position: &BotPosition) -> bool {
    let chebyshev = (position.x - fence.center_x)
        .abs()
        .max((position.z - fence.center_z).abs());
    if chebyshev > fence.radius {
        return true;
    }
    if let Some((min_y, max_y)) = fence.y_range {
        // Fail-closed: a configured Y band with an unknown Y blocks
        match position.y {
            Some(y) => y < min_y || y > max_y,
            None => true,
        }
    } else {
        false
    }
}

/// Evaluate the guard pipeline for one candidate dispatch
pub fn evaluate_guards(
    config: &ExecutorConfig,
    position: Option<BotPosition>,
    leaf: &str,
    limiter: &RateLimiter,
    now: Instant,
) -> GuardDecision {
    if let Some(fence) = &config.geofence {
        match &position {
            None => return GuardDecision::BlockUnknownPosition,
            Some(position) if outside_geofence(fence, position) => {
                return GuardDecision::BlockOutsideGeofence;
            }
            Some(_) => {}
        }
    }

    if !config.allowed_leaves.contains(leaf) {
        return GuardDecision::BlockUnknownLeaf;
    }

    if config.mode == ExecutorMode::Shadow {
        return GuardDecision::ShadowObserve;
    }

    if !limiter.can_execute_at(now) {
        return GuardDecision::RateLimited;
    }

    GuardDecision::AwaitRigG
}
