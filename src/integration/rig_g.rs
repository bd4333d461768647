//! Rig-G feasibility evaluation and the debounced replan scheduler

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::task::RigGMeta;

/// Maximum replan attempts before giving up
pub const MAX_REPLAN_ATTEMPTS: u32 = 3;

/// Base delay for the replan backoff
pub const REPLAN_BASE_DELAY: Duration = Duration::from_secs(5);

/// Advice computed from Rig-G metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RigGAdvice {
    pub should_proceed: bool,
    pub suggested_parallelism: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_rejection: Option<String>,
}

/// Evaluate feasibility metadata into execution advice.
///
/// A passing plan suggests `max(1, nodes - edges)` parallel tracks; a
/// failing plan surfaces its top rejection kind.
pub fn evaluate_rig_g(meta: &RigGMeta) -> RigGAdvice {
    if meta.signals.feasibility_passed {
        let parallelism = meta
            .dag_node_count
            .saturating_sub(meta.dag_edge_count)
            .max(1);
        RigGAdvice {
            should_proceed: true,
            suggested_parallelism: parallelism,
            top_rejection: None,
        }
    } else {
        RigGAdvice {
            should_proceed: false,
            suggested_parallelism: 1,
            top_rejection: meta.signals.rejection_kinds.first().cloned(),
        }
    }
}

/// Backoff delay for the given replan attempt (0-based)
pub fn replan_delay(attempt: u32) -> Duration {
    REPLAN_BASE_DELAY * 2u32.saturating_pow(attempt)
}

struct ReplanEntry {
    attempt: u32,
    handle: Option<JoinHandle<()>>,
}

/// Idempotent key-to-timer registry for debounced replans.
///
/// Re-entry while a timer exists for the same task is a no-op; the spawned
/// timer removes its own entry before running the callback so the callback
/// may reschedule.
#[derive(Clone, Default)]
pub struct ReplanScheduler {
    timers: Arc<DashMap<String, ReplanEntry>>,
}

impl ReplanScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_scheduled(&self, task_id: &str) -> bool {
        self.timers.contains_key(task_id)
    }

    pub fn pending_count(&self) -> usize {
        self.timers.len()
    }

    /// Schedule a replan timer. Returns false (and logs) when a timer for
    /// the task already exists.
    pub fn schedule<F>(&self, task_id: &str, attempt: u32, delay: Duration, on_fire: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        use dashmap::mapref::entry::Entry;
        match self.timers.entry(task_id.to_string()) {
            Entry::Occupied(_) => {
                debug!(task_id, "replan already scheduled");
                false
            }
            Entry::Vacant(vacant) => {
                vacant.insert(ReplanEntry {
                    attempt,
                    handle: None,
                });
                let timers = self.timers.clone();
                let id = task_id.to_string();
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    timers.remove(&id);
                    on_fire.await;
                });
                if let Some(mut entry) = self.timers.get_mut(task_id) {
                    entry.handle = Some(handle);
                }
                true
            }
        }
    }

    /// Cancel a pending timer, if any
    pub fn cancel(&self, task_id: &str) {
        if let Some((_, entry)) = self.timers.remove(task_id) {
            if let Some(handle) = entry.handle {
                handle.abort();
            }
        }
    }

    pub fn attempt_of(&self, task_id: &str) -> Option<u32> {
        self.timers.get(task_id).map(|entry| entry.attempt)
    }
}
