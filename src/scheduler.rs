use std::collections::BTreeMap;

use kube::ResourceExt;

use crate::crd::Skyhook;
use crate::node_state::{is_disabled, is_paused};

/* ============================= SELECTION ============================= */

/// Whether a Skyhook targets a node. An empty selector targets every node.
pub fn selects_node(skyhook: &Skyhook, node_labels: &BTreeMap<String, String>) -> bool {
    skyhook
        .spec
        .node_selector
        .iter()
        .all(|(k, v)| node_labels.get(k) == Some(v))
}

/* ============================= ORDERING ============================= */

/// Skyhooks in `(priority asc, name asc)` order.
pub fn order_skyhooks(skyhooks: &[Skyhook]) -> Vec<&Skyhook> {
    let mut ordered: Vec<&Skyhook> = skyhooks.iter().collect();
    ordered.sort_by(|a, b| {
        (a.spec.priority, a.name_any()).cmp(&(b.spec.priority, b.name_any()))
    });
    ordered
}

/* ============================= GATING ============================= */

/// Verdict for one (Skyhook, node) pair after walking the priority chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    /// All predecessors settled; the Skyhook may advance on this node.
    Proceed,
    /// A lower-priority-number Skyhook is still working on this node.
    Waiting { on: String },
    /// This Skyhook, or a predecessor, is paused; nothing at or after the
    /// paused priority runs on this node.
    Paused { by: String },
    /// This Skyhook is disabled; successors treat it as absent.
    Disabled,
}

/// Walk the ordered chain of Skyhooks targeting one node and decide whether
/// `target` may advance there. `node_complete` answers whether a given
/// Skyhook has finished on this node.
pub fn gate_for_node<'a>(
    ordered_targeting_node: &[&'a Skyhook],
    target: &str,
    mut node_complete: impl FnMut(&'a Skyhook) -> bool,
) -> Gate {
    for skyhook in ordered_targeting_node {
        let name = skyhook.name_any();

        if name == target {
            if is_disabled(skyhook) {
                return Gate::Disabled;
            }
            if is_paused(skyhook) {
                return Gate::Paused { by: name };
            }
            return Gate::Proceed;
        }

        // Predecessor in priority order.
        if is_disabled(skyhook) {
            continue;
        }
        if is_paused(skyhook) {
            return Gate::Paused { by: name };
        }
        if !node_complete(skyhook) {
            return Gate::Waiting { on: name };
        }
    }

    // Target does not select this node; nothing to do there.
    Gate::Disabled
}

/* ============================= TESTS ============================= */
