// taskspine/src/config.rs
//! Environment-driven executor configuration
//!
//! All knobs come from process environment variables, applied over defaults.
//! Live mode requires an explicit confirmation value; anything else falls
//! back to shadow with a warning.

use std::collections::HashSet;
use std::env;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Dispatch mode for the execution gateway and guard pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorMode {
    /// Guards evaluate and audits emit, but nothing is dispatched
    Shadow,
    /// Actions are dispatched to the remote endpoint
    Live,
}

impl ExecutorMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorMode::Shadow => "shadow",
            ExecutorMode::Live => "live",
        }
    }
}

/// Geofence boundary, Chebyshev distance on X/Z with an optional Y band
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeofenceConfig {
    pub center_x: f64,
    pub center_z: f64,
    pub center_y: Option<f64>,
    pub radius: f64,
    /// Inclusive (min, max) Y band; fail-closed when configured but the
    /// bot's Y coordinate is unknown
    pub y_range: Option<(f64, f64)>,
}

/// Full executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Tick gate; when false every tick returns early
    pub enabled: bool,
    /// Dispatch mode
    pub mode: ExecutorMode,
    /// Sliding-window rate limit (executions per minute)
    pub max_steps_per_minute: usize,
    /// Cooldown applied to a task after a retryable failure
    pub failure_cooldown_ms: u64,
    /// Cooperative loop interval
    pub poll_ms: u64,
    /// Cap for the cycle-error exponential backoff
    pub max_backoff_ms: u64,
    /// Transport breaker hold-off after a connection failure
    pub breaker_open_ms: u64,
    /// Optional geofence; absent means the geofence guard is disabled
    pub geofence: Option<GeofenceConfig>,
    /// Kill switch for Sterling intent resolution
    pub sterling_intent_resolve: bool,
    /// Strict-finalize tripwire on the store commit boundary
    pub strict_finalize: bool,
    /// Allow the deprecated per-domain join-key fallback
    pub join_keys_deprecated_compat: bool,
    /// Base URL of the remote action endpoint
    pub bot_endpoint_url: String,
    /// Per-request timeout for `/action` dispatch
    pub action_timeout_ms: u64,
    /// History ring bound
    pub history_limit: usize,
    /// Gateway audit ring bound
    pub audit_limit: usize,
    /// Leaf allowlist for the guard pipeline
    pub allowed_leaves: HashSet<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: ExecutorMode::Shadow,
            max_steps_per_minute: 6,
            failure_cooldown_ms: 10_000,
            poll_ms: 10_000,
            max_backoff_ms: 60_000,
            breaker_open_ms: 15_000,
            geofence: None,
            sterling_intent_resolve: true,
            strict_finalize: false,
            join_keys_deprecated_compat: false,
            bot_endpoint_url: "http://localhost:3005".to_string(),
            action_timeout_ms: 15_000,
            history_limit: 256,
            audit_limit: 512,
            allowed_leaves: HashSet::new(),
        }
    }
}

impl ExecutorConfig {
    /// Load configuration from environment variables over defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(value) = env::var("ENABLE_PLANNING_EXECUTOR") {
            config.enabled = value.trim() == "1";
        }

        let requested_mode = env::var("EXECUTOR_MODE").unwrap_or_default();
        if requested_mode.trim() == "live" {
            let confirm = env::var("EXECUTOR_LIVE_CONFIRM").unwrap_or_default();
            if confirm == "YES" {
                config.mode = ExecutorMode::Live;
            } else {
                warn!(
                    "EXECUTOR_MODE=live requested without EXECUTOR_LIVE_CONFIRM=YES, \
                     falling back to shadow"
                );
                config.mode = ExecutorMode::Shadow;
            }
        }

        if let Some(value) = parse_env::<usize>("EXECUTOR_MAX_STEPS_PER_MINUTE") {
            config.max_steps_per_minute = value;
        }
        if let Some(value) = parse_env::<u64>("EXECUTOR_FAILURE_COOLDOWN_MS") {
            config.failure_cooldown_ms = value;
        }
        if let Some(value) = parse_env::<u64>("EXECUTOR_POLL_MS") {
            config.poll_ms = value;
        }
        if let Some(value) = parse_env::<u64>("EXECUTOR_MAX_BACKOFF_MS") {
            config.max_backoff_ms = value;
        }
        if let Some(value) = parse_env::<u64>("BOT_BREAKER_OPEN_MS") {
            config.breaker_open_ms = value;
        }
        if let Some(value) = parse_env::<u64>("EXECUTOR_ACTION_TIMEOUT_MS") {
            config.action_timeout_ms = value;
        }
        if let Some(value) = parse_env::<usize>("EXECUTOR_HISTORY_LIMIT") {
            config.history_limit = value;
        }
        if let Some(value) = parse_env::<usize>("EXECUTOR_AUDIT_LIMIT") {
            config.audit_limit = value;
        }
        if let Ok(value) = env::var("STERLING_INTENT_RESOLVE") {
            config.sterling_intent_resolve = value.trim() == "1";
        }
        if let Ok(value) = env::var("PLANNING_STRICT_FINALIZE") {
            config.strict_finalize = value.trim() == "1";
        }
        if let Ok(value) = env::var("JOIN_KEYS_DEPRECATED_COMPAT") {
            config.join_keys_deprecated_compat = value.trim() == "1";
        }
        if let Ok(value) = env::var("BOT_ENDPOINT_URL") {
            if !value.trim().is_empty() {
                config.bot_endpoint_url = value.trim().to_string();
            }
        }
        if let Ok(value) = env::var("EXECUTOR_ALLOWED_LEAVES") {
            config.allowed_leaves = value
                .split(',')
                .map(|leaf| leaf.trim().to_string())
                .filter(|leaf| !leaf.is_empty())
                .collect();
        }

        config.geofence = parse_geofence();

        config
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    match env::var(key) {
        Ok(value) => match value.trim().parse() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                warn!(key, value = %value, "Ignoring unparseable environment value");
                None
            }
        },
        Err(_) => None,
    }
}

/// Parse `EXECUTOR_GEOFENCE_CENTER` ("x,z" or "x,y,z"),
/// `EXECUTOR_GEOFENCE_RADIUS`, and `EXECUTOR_GEOFENCE_Y_RANGE` ("min,max")
fn parse_geofence() -> Option<GeofenceConfig> {
    let center = env::var("EXECUTOR_GEOFENCE_CENTER").ok()?;
    let parts: Vec<f64> = center
        .split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect();

    let (center_x, center_y, center_z) = match parts.as_slice() {
        [x, z] => (*x, None, *z),
        [x, y, z] => (*x, Some(*y), *z),
        _ => {
            warn!(center = %center, "Ignoring malformed EXECUTOR_GEOFENCE_CENTER");
            return None;
        }
    };

    let radius = parse_env::<f64>("EXECUTOR_GEOFENCE_RADIUS").unwrap_or(100.0);

    let y_range = env::var("EXECUTOR_GEOFENCE_Y_RANGE").ok().and_then(|raw| {
        let bounds: Vec<f64> = raw
            .split(',')
            .filter_map(|part| part.trim().parse().ok())
            .collect();
        match bounds.as_slice() {
            [min, max] if min <= max => Some((*min, *max)),
            _ => {
                warn!(raw = %raw, "Ignoring malformed EXECUTOR_GEOFENCE_Y_RANGE");
                None
            }
        }
    });

    Some(GeofenceConfig {
        center_x,
        center_z,
        center_y,
        radius,
        y_range,
    })
}
