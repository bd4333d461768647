//! Episode reporting and join-key hygiene
//!
//! On a terminal transition, the per-domain solver receives a linkage
//! report. Bundle hashes travel only when the join-key record coheres with
//! the current plan; stale or cross-domain keys are classified, logged, and
//! the hashes omitted while the outcome class still reports.

use serde_json::Value;
use tracing::{info, warn};

use crate::integration::collaborators::EpisodeReport;
use crate::task::Task;

/// Outcome class reported to the solver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeClass {
    ExecutionSuccess,
    ExecutionFailure,
    /// Richer classification taken from a coherent solve-result substrate
    Substrate(String),
}

impl OutcomeClass {
    pub fn as_str(&self) -> &str {
        match self {
            OutcomeClass::ExecutionSuccess => "EXECUTION_SUCCESS",
            OutcomeClass::ExecutionFailure => "EXECUTION_FAILURE",
            OutcomeClass::Substrate(outcome) => outcome,
        }
    }
}

/// Prepared episode report plus whether the substrate was consumed
#[derive(Debug, Clone)]
pub struct PreparedEpisode {
    pub report: EpisodeReport,
    pub consumed_substrate: bool,
}

/// Build the linkage report for a terminal task, applying join-key hygiene.
///
/// Returns `None` when the task carries no per-domain plan id. With
/// `deprecated_compat`, a task lacking join keys entirely falls back to the
/// bare plan id (no hashes) and emits a migration-fallback log.
pub fn prepare_episode_report(
    task: &Task,
    success: bool,
    deprecated_compat: bool,
) -> Option<PreparedEpisode> {
    let solver = &task.metadata.solver;
    let (domain, plan_id) = solver.domain_plan_id()?;

    let mut bundle_hash = None;
    let mut trace_bundle_hash = None;
    let mut consumed_substrate = false;

    let mut outcome = if success {
        OutcomeClass::ExecutionSuccess
    } else {
        OutcomeClass::ExecutionFailure
    };

    match &solver.join_keys {
        Some(join_keys) => {
            let plan_matches = join_keys.plan_id == plan_id;
            let solver_matches = join_keys
                .solver_id
                .as_deref()
                .map(|solver_id| solver_id.starts_with(domain))
                .unwrap_or(true);

            if plan_matches && solver_matches {
                bundle_hash = join_keys.bundle_hash.clone();
                trace_bundle_hash = join_keys.trace_bundle_hash.clone();
            } else if !plan_matches {
                // Stale keys are expected while replans churn the plan id
                warn!(
                    task_id = %task.id,
                    domain,
                    joined_plan = %join_keys.plan_id,
                    current_plan = %plan_id,
                    "stale join keys (expected under replans); omitting bundle hashes"
                );
            } else {
                warn!(
                    task_id = %task.id,
                    domain,
                    solver_id = join_keys.solver_id.as_deref().unwrap_or(""),
                    "cross-domain join keys (unexpected); omitting bundle hashes"
                );
            }

            // Richer outcome only when the substrate coheres with join keys
            if let Some(substrate) = &solver.solve_result_substrate {
                consumed_substrate = true;
                let coherent = substrate.plan_id == plan_id
                    && substrate.bundle_hash == join_keys.bundle_hash;
                if coherent {
                    outcome = OutcomeClass::Substrate(substrate.outcome.clone());
                } else {
                    warn!(
                        task_id = %task.id,
                        substrate_plan = %substrate.plan_id,
                        "solve-result substrate does not cohere with join keys; \
                         falling back to execution outcome"
                    );
                }
            }
        }
        None if deprecated_compat => {
            info!(
                task_id = %task.id,
                domain,
                plan_id,
                "deprecated join-key fallback: reporting bare plan id (migration path)"
            );
        }
        None => {
            warn!(
                task_id = %task.id,
                domain,
                "no join keys on terminal task; omitting bundle hashes"
            );
        }
    }

    Some(PreparedEpisode {
        report: EpisodeReport {
            task_id: task.id.clone(),
            domain: domain.to_string(),
            plan_id: plan_id.to_string(),
            outcome: outcome.as_str().to_string(),
            bundle_hash,
            trace_bundle_hash,
        },
        consumed_substrate,
    })
}

/// Thin summary emitted with the goal-binding drift event
pub fn drift_summary(task: &Task, reason: &str) -> Value {
    serde_json::json!({
        "id": task.id,
        "type": task.task_type.as_str(),
        "source": task.source.as_str(),
        "originKind": task
            .metadata
            .origin
            .as_ref()
            .map(|origin| origin.kind.as_str()),
        "reason": reason,
    })
}
