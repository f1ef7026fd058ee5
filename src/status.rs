use std::collections::BTreeMap;

use crate::crd::{Package, PackageState, SkyhookSpec, Status, unique_key};
use crate::lifecycle;
use crate::node_state::NodeState;

/* ============================= NODE STATUS ============================= */

/// One spec package is settled on a node when its record is terminal
/// success for the version the spec wants and no config key changed since.
pub fn is_package_settled(
    name: &str,
    package: &Package,
    state: &NodeState,
    config_updates: &[String],
) -> bool {
    if !config_updates.is_empty() {
        return false;
    }
    let key = unique_key(name, &package.version);
    let Some(record) = state.get(&key) else {
        return false;
    };
    let has_interrupt = lifecycle::has_interrupt(package, config_updates);
    lifecycle::is_terminal_complete(record, has_interrupt)
}

/// A node is complete for a Skyhook when every spec package is settled and
/// nothing stale (a removed or replaced package) is still being torn down.
pub fn is_node_complete(
    spec: &SkyhookSpec,
    state: &NodeState,
    config_updates: &BTreeMap<String, Vec<String>>,
) -> bool {
    static EMPTY: Vec<String> = Vec::new();

    let all_settled = spec.packages.iter().all(|(name, pkg)| {
        let updates = config_updates.get(name).unwrap_or(&EMPTY);
        is_package_settled(name, pkg, state, updates)
    });
    if !all_settled {
        return false;
    }

    // Any record outside the spec is an uninstall still in flight.
    state.keys().all(|key| {
        spec.packages
            .iter()
            .any(|(name, pkg)| unique_key(name, &pkg.version) == *key)
    })
}

/// Precedence: erroring > blocked > complete > waiting > in_progress > unknown.
pub fn derive_node_status(
    spec: &SkyhookSpec,
    state: &NodeState,
    config_updates: &BTreeMap<String, Vec<String>>,
    blocked: bool,
    waiting: bool,
) -> Status {
    if state.values().any(|s| s.state == PackageState::Erroring) {
        return Status::Erroring;
    }
    if blocked {
        return Status::Blocked;
    }
    if is_node_complete(spec, state, config_updates) {
        return Status::Complete;
    }
    if waiting {
        return Status::Waiting;
    }
    if !state.is_empty() {
        return Status::InProgress;
    }
    Status::Unknown
}

/* ============================= SKYHOOK STATUS ============================= */

/// Rollup over node statuses, with flow-control annotations overriding.
pub fn aggregate_status(node_statuses: &[Status], paused: bool, disabled: bool) -> Status {
    if disabled {
        return Status::Disabled;
    }
    if paused {
        return Status::Paused;
    }
    if node_statuses.is_empty() {
        return Status::Unknown;
    }
    if node_statuses.iter().any(|s| *s == Status::Erroring) {
        return Status::Erroring;
    }
    if node_statuses.iter().any(|s| *s == Status::Blocked) {
        return Status::Blocked;
    }
    if node_statuses.iter().all(|s| *s == Status::Complete) {
        return Status::Complete;
    }
    if node_statuses.iter().any(|s| *s == Status::InProgress) {
        return Status::InProgress;
    }
    if node_statuses.iter().any(|s| *s == Status::Waiting) {
        return Status::Waiting;
    }
    Status::Unknown
}

/* ============================= COUNTS ============================= */

pub fn complete_nodes_label(complete: u32, total: u32) -> String {
    format!("{complete}/{total}")
}

pub fn count_by_status(node_statuses: &[Status]) -> BTreeMap<String, u32> {
    let mut counts = BTreeMap::new();
    for status in node_statuses {
        *counts.entry(status.as_str().to_string()).or_insert(0) += 1;
    }
    counts
}

/// Sorted `name|version` keys of the current spec, for the status mirror.
pub fn package_list(spec: &SkyhookSpec) -> Vec<String> {
    let mut list: Vec<String> = spec
        .packages
        .iter()
        .map(|(name, pkg)| unique_key(name, &pkg.version))
        .collect();
    list.sort();
    list
}

/* ============================= TESTS ============================= */
