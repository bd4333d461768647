//! Sterling IR step handling: intent splice and plan digests

use crate::integration::collaborators::IntentReplacement;
use crate::protocol::steps_digest;
use crate::task::TaskStep;

/// Blocked reasons produced by the ingest pathway
pub mod blocked {
    pub const DIGEST_UNKNOWN: &str = "blocked_digest_unknown";
    pub const EXECUTOR_ERROR: &str = "blocked_executor_error";
    pub const INTENT_RESOLUTION_DISABLED: &str = "blocked_intent_resolution_disabled";
    pub const INTENT_RESOLUTION_UNAVAILABLE: &str = "blocked_intent_resolution_unavailable";
    pub const UNDISPATCHABLE_STEPS: &str = "blocked_undispatchable_steps";
    pub const UNRESOLVED_INTENTS: &str = "blocked_unresolved_intents";
}

/// Outcome of splicing intent replacements into an expansion
#[derive(Debug, Clone)]
pub struct SpliceOutcome {
    pub steps: Vec<TaskStep>,
    pub all_intents_resolved: bool,
    /// Digest of the final step list; computed unconditionally so "absent"
    /// can never be misread as "same as the expansion digest"
    pub executor_plan_digest: String,
}

/// Splice resolved intent steps into the original expansion.
///
/// Walks the original in order; each intent step is substituted by its
/// replacement's step list, keyed by the intent's ordinal among intents.
/// The first replacement wins on a duplicated ordinal, unresolved intents
/// stay in place, and non-intent steps are always preserved.
pub fn splice_intent_replacements(
    original: &[TaskStep],
    replacements: &[IntentReplacement],
) -> SpliceOutcome {
    let mut steps: Vec<TaskStep> = Vec::with_capacity(original.len());
    let mut all_intents_resolved = true;
    let mut intent_ordinal = 0usize;

    for step in original {
        if !step.meta.is_intent() {
            steps.push(step.clone());
            continue;
        }

        let replacement = replacements
            .iter()
            .find(|candidate| candidate.intent_step_index == intent_ordinal);
        intent_ordinal += 1;

        match replacement.and_then(|candidate| candidate.resolved.as_ref()) {
            Some(resolved) => {
                steps.extend(resolved.iter().cloned());
            }
            None => {
                all_intents_resolved = false;
                steps.push(step.clone());
            }
        }
    }

    for (index, step) in steps.iter_mut().enumerate() {
        step.order = index as u32;
    }

    let executor_plan_digest = steps_digest(&steps);
    SpliceOutcome {
        steps,
        all_intents_resolved,
        executor_plan_digest,
    }
}

/// Leaf names of unresolved intents remaining in a step list
pub fn remaining_intent_leaves(steps: &[TaskStep]) -> Vec<String> {
    steps
        .iter()
        .filter(|step| step.meta.is_intent())
        .filter_map(|step| step.meta.leaf.clone())
        .collect()
}
