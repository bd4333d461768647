//! Task eligibility and the blocked-task TTL policy
//!
//! Blocked tasks get a disposition pass before the eligibility filter:
//! shadow-mode blocks auto-unblock once the executor goes live, and other
//! blocks auto-fail when their reason's TTL elapses since `blocked_at`.

use chrono::{DateTime, Duration, Utc};

use crate::config::ExecutorMode;
use crate::task::{Task, TaskStatus};

/// Per-reason TTL policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TtlPolicy {
    /// Never auto-failed
    Exempt,
    /// Concrete bound for this reason
    Bounded(Duration),
    /// Default two-minute bound
    Default,
}

/// Blocked reasons that wait on something the TTL must not preempt
const EXEMPT_REASONS: &[&str] = &[
    "waiting_on_prereq",
    "infra_error_tripped",
    "max_retries_exceeded",
    "advisory_action",
];

/// TTL policy for a blocked reason
pub fn ttl_policy_for(reason: &str) -> TtlPolicy {
    if EXEMPT_REASONS.contains(&reason) {
        return TtlPolicy::Exempt;
    }
    match reason {
        "blocked_intent_resolution_unavailable" => TtlPolicy::Bounded(Duration::minutes(5)),
        "rig_e_solver_unimplemented" => TtlPolicy::Bounded(Duration::minutes(10)),
        _ => TtlPolicy::Default,
    }
}

fn ttl_bound(policy: &TtlPolicy) -> Option<Duration> {
    match policy {
        TtlPolicy::Exempt => None,
        TtlPolicy::Bounded(bound) => Some(*bound),
        TtlPolicy::Default => Some(Duration::minutes(2)),
    }
}

/// What to do with a blocked task before eligibility filtering
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockedDisposition {
    /// Clear the block (shadow-mode block in live mode)
    Unblock,
    /// TTL elapsed; fail with `blocked-ttl-exceeded:<reason>`
    Fail(String),
    /// Leave the block in place
    Keep,
}

/// Disposition for a blocked task; `None` when the task is not blocked
pub fn blocked_disposition(
    task: &Task,
    mode: ExecutorMode,
    now: DateTime<Utc>,
) -> Option<BlockedDisposition> {
    let reason = task.metadata.blocked_reason.as_deref()?;

    if reason == "shadow_mode" && mode == ExecutorMode::Live {
        return Some(BlockedDisposition::Unblock);
    }

    let Some(bound) = ttl_bound(&ttl_policy_for(reason)) else {
        return Some(BlockedDisposition::Keep);
    };
    let Some(blocked_at) = task.metadata.blocked_at else {
        // Anchor missing; the finalize backfill should prevent this
        return Some(BlockedDisposition::Keep);
    };

    if now - blocked_at > bound {
        Some(BlockedDisposition::Fail(format!(
            "blocked-ttl-exceeded:{}",
            reason
        )))
    } else {
        Some(BlockedDisposition::Keep)
    }
}

/// Eligibility filter: an active/in-progress task with no block and no
/// backoff floor in the future
pub fn is_eligible(task: &Task, now: DateTime<Utc>) -> bool {
    matches!(task.status, TaskStatus::Active | TaskStatus::InProgress)
        && task.metadata.blocked_reason.is_none()
        && task
            .metadata
            .next_eligible_at
            .map(|at| at <= now)
            .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{new_task_id, TaskMetadata, TaskSource, TaskType};
    use serde_json::Value;

    fn task_with_block(reason: Option<&str>, blocked_at: Option<DateTime<Utc>>) -> Task {
        Task {
            id: new_task_id(),
            title: "t".to_string(),
            task_type: TaskType::Mining,
            status: TaskStatus::Active,
            source: TaskSource::Manual,
            priority: 0.5,
            urgency: 0.5,
            progress: 0.0,
            steps: Vec::new(),
            parameters: Value::Null,
            metadata: TaskMetadata {
                blocked_reason: reason.map(str::to_string),
                blocked_at,
                ..Default::default()
            },
            created_at: Utc::now(),
            error: None,
            failure_code: None,
        }
    }

    #[test]
    fn shadow_block_unblocks_in_live_mode() {
        let now = Utc::now();
        let task = task_with_block(Some("shadow_mode"), Some(now));
        assert_eq!(
            blocked_disposition(&task, ExecutorMode::Live, now),
            Some(BlockedDisposition::Unblock)
        );
        assert_eq!(
            blocked_disposition(&task, ExecutorMode::Shadow, now),
            Some(BlockedDisposition::Keep)
        );
    }

    #[test]
    fn default_ttl_fails_after_two_minutes() {
        let now = Utc::now();
        let task = task_with_block(Some("no_executable_plan"), Some(now - Duration::minutes(3)));
        assert_eq!(
            blocked_disposition(&task, ExecutorMode::Shadow, now),
            Some(BlockedDisposition::Fail(
                "blocked-ttl-exceeded:no_executable_plan".to_string()
            ))
        );

        let fresh = task_with_block(Some("no_executable_plan"), Some(now - Duration::seconds(30)));
        assert_eq!(
            blocked_disposition(&fresh, ExecutorMode::Shadow, now),
            Some(BlockedDisposition::Keep)
        );
    }

    #[test]
    fn exempt_reasons_never_auto_fail() {
        let now = Utc::now();
        let task = task_with_block(Some("waiting_on_prereq"), Some(now - Duration::hours(6)));
        assert_eq!(
            blocked_disposition(&task, ExecutorMode::Live, now),
            Some(BlockedDisposition::Keep)
        );
    }

    #[test]
    fn unblocked_task_has_no_disposition() {
        let now = Utc::now();
        let task = task_with_block(None, None);
        assert_eq!(blocked_disposition(&task, ExecutorMode::Live, now), None);
    }

    #[test]
    fn eligibility_requires_active_unblocked_and_past_floor() {
        let now = Utc::now();
        let mut task = task_with_block(None, None);
        assert!(is_eligible(&task, now));

        task.status = TaskStatus::Pending;
        assert!(!is_eligible(&task, now));

        task.status = TaskStatus::InProgress;
        task.metadata.next_eligible_at = Some(now + Duration::seconds(30));
        assert!(!is_eligible(&task, now));

        task.metadata.next_eligible_at = Some(now - Duration::seconds(30));
        assert!(is_eligible(&task, now));

        task.metadata.blocked_reason = Some("shadow_mode".to_string());
        assert!(!is_eligible(&task, now));
    }
}
