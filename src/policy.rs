use std::collections::BTreeMap;

use crate::crd::{
    BatchProcessingState, Budget, DEFAULT_COMPARTMENT, DeploymentPolicyOptions,
    DeploymentPolicySpec, DeploymentStrategy,
};

/* ============================= SELECTORS ============================= */

/// matchLabels semantics: every selector pair must be present in the labels.
/// An empty selector matches nothing (the default compartment catches those).
pub fn selector_matches(
    selector: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
) -> bool {
    !selector.is_empty() && selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

/* ============================= CEILINGS ============================= */

/// Concurrency ceiling for a budget over `matched` nodes.
///
/// `percent`: zero nodes → 0, otherwise at least 1. `count` clamps to the
/// matched population.
pub fn budget_ceiling(budget: &Budget, matched: u32) -> u32 {
    if matched == 0 {
        return 0;
    }
    if let Some(percent) = budget.percent {
        return ((matched * percent) / 100).max(1);
    }
    if let Some(count) = budget.count {
        return count.min(matched);
    }
    0
}

/* ============================= ASSIGNMENT ============================= */

/// How many of the given nodes each compartment selector matches.
/// The default compartment's count is the number of nodes no compartment claims.
pub fn matched_counts(
    policy: &DeploymentPolicySpec,
    node_labels: &[&BTreeMap<String, String>],
) -> BTreeMap<String, u32> {
    let mut counts: BTreeMap<String, u32> = BTreeMap::new();
    for c in &policy.compartments {
        counts.insert(c.name.clone(), 0);
    }
    counts.insert(DEFAULT_COMPARTMENT.to_string(), 0);

    for labels in node_labels {
        let mut claimed = false;
        for c in &policy.compartments {
            if selector_matches(&c.selector, labels) {
                *counts.get_mut(&c.name).expect("compartment counted") += 1;
                claimed = true;
            }
        }
        if !claimed {
            *counts
                .get_mut(DEFAULT_COMPARTMENT)
                .expect("default counted") += 1;
        }
    }
    counts
}

/// Strategy in force for a compartment (its own, or the policy default).
pub fn effective_strategy<'a>(
    policy: &'a DeploymentPolicySpec,
    compartment: &str,
) -> &'a DeploymentStrategy {
    policy
        .compartments
        .iter()
        .find(|c| c.name == compartment)
        .and_then(|c| c.strategy.as_ref())
        .unwrap_or(&policy.default.strategy)
}

pub fn effective_budget<'a>(policy: &'a DeploymentPolicySpec, compartment: &str) -> &'a Budget {
    policy
        .compartments
        .iter()
        .find(|c| c.name == compartment)
        .map(|c| &c.budget)
        .unwrap_or(&policy.default.budget)
}

/// Pick the compartment for one node. When several selectors match, the
/// safest wins: fixed > linear > exponential, then the smaller ceiling
/// (over that compartment's own matched population), then the name.
pub fn assign_compartment<'a>(
    policy: &'a DeploymentPolicySpec,
    labels: &BTreeMap<String, String>,
    counts: &BTreeMap<String, u32>,
) -> &'a str {
    let mut best: Option<(&str, u8, u32)> = None;

    for c in &policy.compartments {
        if !selector_matches(&c.selector, labels) {
            continue;
        }
        let rank = effective_strategy(policy, &c.name).safety_rank();
        let matched = counts.get(&c.name).copied().unwrap_or(0);
        let ceiling = budget_ceiling(&c.budget, matched);

        let better = match best {
            None => true,
            Some((bname, brank, bceiling)) => {
                (rank, ceiling, c.name.as_str()) < (brank, bceiling, bname)
            }
        };
        if better {
            best = Some((c.name.as_str(), rank, ceiling));
        }
    }

    best.map(|(name, _, _)| name).unwrap_or(DEFAULT_COMPARTMENT)
}

/* ============================= BATCH MACHINE ============================= */

/// Counts for one settled batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchResult {
    pub size: u32,
    pub successes: u32,
    pub failures: u32,
}

impl BatchResult {
    fn success_percent(&self) -> u32 {
        if self.size == 0 {
            return 100;
        }
        self.successes * 100 / self.size
    }
}

/// Fold one settled batch into the compartment state.
///
/// Success (success% ≥ batchThreshold) grows the batch per strategy and
/// clears the failure streak. Failure below safetyLimit progress shrinks
/// the batch and counts toward the optional failureThreshold. Failure at
/// or above safetyLimit neither shrinks nor counts.
pub fn advance_batch(
    state: &mut BatchProcessingState,
    strategy: &DeploymentStrategy,
    result: &BatchResult,
) {
    state.completed_nodes += result.successes;
    state.failed_nodes += result.failures;
    state.last_batch_size = result.size;

    let progress = result.success_percent();

    if progress >= strategy.batch_threshold() {
        state.last_batch_failed = false;
        state.consecutive_failures = 0;
        state.current_batch = match strategy {
            DeploymentStrategy::Fixed { .. } => state.current_batch,
            DeploymentStrategy::Linear { delta, .. } => state.current_batch + delta,
            DeploymentStrategy::Exponential { growth_factor, .. } => {
                state.current_batch.saturating_mul(*growth_factor)
            }
        };
        return;
    }

    state.last_batch_failed = true;

    if progress >= strategy.safety_limit() {
        // Partial progress: hold the line without counting a strike.
        return;
    }

    state.current_batch = match strategy {
        DeploymentStrategy::Fixed { .. } => state.current_batch,
        DeploymentStrategy::Linear { delta, .. } => {
            state.current_batch.saturating_sub(*delta).max(1)
        }
        DeploymentStrategy::Exponential { growth_factor, .. } => {
            (state.current_batch / (*growth_factor).max(1)).max(1)
        }
    };
    state.consecutive_failures += 1;

    if let Some(threshold) = strategy.failure_threshold() {
        if state.consecutive_failures >= threshold {
            state.should_stop = true;
        }
    }
}

/// Nodes to dispatch this wave: the strategy's current batch, capped by the
/// compartment ceiling and by what is left to do.
pub fn next_batch_size(state: &BatchProcessingState, ceiling: u32, remaining: u32) -> u32 {
    if state.should_stop {
        return 0;
    }
    state.current_batch.min(ceiling).min(remaining)
}

/* ============================= RESET ============================= */

/// Precedence: per-Skyhook override > policy field > default true.
pub fn effective_reset_on_completion(
    options: Option<&DeploymentPolicyOptions>,
    policy: &DeploymentPolicySpec,
) -> bool {
    options
        .and_then(|o| o.reset_batch_state_on_completion)
        .or(policy.reset_batch_state_on_completion)
        .unwrap_or(true)
}

/// Zero all counters and return to the strategy's initial batch.
pub fn reset_batch(state: &mut BatchProcessingState, strategy: &DeploymentStrategy) {
    *state = BatchProcessingState::new(strategy.initial_batch());
}

/* ============================= TESTS ============================= */
