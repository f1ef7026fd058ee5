use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, EvictParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::info;

use crate::node_state::{
    self, cordon_key, has_cordon_marker, is_ready, is_unschedulable, read_captured_boot_id,
};
use crate::planner;

/* ============================= DECISIONS ============================= */

/// What the coordinator should do next for a node that needs an interrupt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterruptAction {
    /// Mark unschedulable and record the cordon annotation.
    Cordon,
    /// Non-interruptible workloads are still running; hold.
    WaitForWorkloads { blocking: Vec<String> },
    /// Evict the named remaining workload pods.
    Drain { evict: Vec<String> },
    /// Node is quiet; the interrupt runner may dispatch.
    Ready,
}

/// Snapshot of one node used to decide the next interrupt step.
pub struct InterruptView<'a> {
    pub node: &'a Node,
    pub skyhook_name: &'a str,
    pub non_interrupt_labels: &'a BTreeMap<String, String>,
    /// Pods currently bound to this node.
    pub pods_on_node: &'a [Pod],
}

fn pod_is_active(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Running") | Some("Pending")
    )
}

fn pod_is_daemon(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .is_some_and(|owners| owners.iter().any(|o| o.kind == "DaemonSet"))
}

fn pod_matches_labels(pod: &Pod, selector: &BTreeMap<String, String>) -> bool {
    if selector.is_empty() {
        return false;
    }
    let Some(labels) = &pod.metadata.labels else {
        return false;
    };
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

fn pod_is_runner(pod: &Pod) -> bool {
    planner::runner_skyhook(pod).is_some()
}

/// Cordon → wait for non-interruptible workloads → drain the rest → ready.
/// Every step is re-derived from observed state, so the sequence is
/// idempotent across reconcile passes.
pub fn next_interrupt_action(view: &InterruptView<'_>) -> InterruptAction {
    if !has_cordon_marker(view.node, view.skyhook_name) || !is_unschedulable(view.node) {
        return InterruptAction::Cordon;
    }

    let blocking: Vec<String> = view
        .pods_on_node
        .iter()
        .filter(|p| pod_is_active(p) && pod_matches_labels(p, view.non_interrupt_labels))
        .map(|p| p.name_any())
        .collect();
    if !blocking.is_empty() {
        return InterruptAction::WaitForWorkloads { blocking };
    }

    let evict: Vec<String> = view
        .pods_on_node
        .iter()
        .filter(|p| pod_is_active(p) && !pod_is_daemon(p) && !pod_is_runner(p))
        .map(|p| p.name_any())
        .collect();
    if !evict.is_empty() {
        return InterruptAction::Drain { evict };
    }

    InterruptAction::Ready
}

/* ============================= REBOOT DETECTION ============================= */

/// A reboot interrupt can collapse to `skipped` when the boot id already
/// rotated since capture (the node rebooted out-of-band).
pub fn reboot_already_happened(node: &Node, skyhook: &str) -> bool {
    match (read_captured_boot_id(node, skyhook), node_state::boot_id(node)) {
        (Some(captured), Some(live)) => captured != live,
        _ => false,
    }
}

/// Post-interrupt evidence for a reboot: the boot id changed from the
/// captured value and the node reports Ready again.
pub fn reboot_verified(node: &Node, skyhook: &str) -> bool {
    reboot_already_happened(node, skyhook) && is_ready(node)
}

/* ============================= CLUSTER ACTIONS ============================= */

const FIELD_MANAGER: &str = "skyhook-operator";

/// Mark the node unschedulable and record that this Skyhook holds cordon.
/// Safe to repeat.
pub async fn cordon_node(
    client: &Client,
    node_name: &str,
    skyhook: &str,
) -> Result<(), kube::Error> {
    let nodes: Api<Node> = Api::all(client.clone());
    let patch = serde_json::json!({
        "metadata": {
            "annotations": { cordon_key(skyhook): "true" }
        },
        "spec": { "unschedulable": true }
    });
    nodes
        .patch(node_name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    info!(node = %node_name, skyhook = %skyhook, "node_cordoned");
    Ok(())
}

/// Release cordon held by this Skyhook. The node stays unschedulable if
/// another Skyhook still holds its own cordon annotation.
pub async fn uncordon_node(
    client: &Client,
    node: &Node,
    skyhook: &str,
) -> Result<(), kube::Error> {
    let node_name = node.name_any();
    let others_hold = node.metadata.annotations.as_ref().is_some_and(|a| {
        a.iter()
            .any(|(k, v)| k != &cordon_key(skyhook) && k.starts_with("skyhook.nvidia.com/cordon_") && v == "true")
    });

    let nodes: Api<Node> = Api::all(client.clone());
    let patch = serde_json::json!({
        "metadata": {
            "annotations": { cordon_key(skyhook): serde_json::Value::Null }
        },
        "spec": { "unschedulable": if others_hold { serde_json::Value::Bool(true) } else { serde_json::Value::Bool(false) } }
    });
    nodes
        .patch(&node_name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    info!(node = %node_name, skyhook = %skyhook, "node_uncordoned");
    Ok(())
}

/// Evict one workload pod through the eviction subresource so pod
/// disruption budgets and grace periods are honored.
pub async fn evict_pod(client: &Client, namespace: &str, name: &str) -> Result<(), kube::Error> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    pods.evict(name, &EvictParams::default()).await?;
    info!(pod = %name, namespace = %namespace, "workload_evicted");
    Ok(())
}

/* ============================= TESTS ============================= */
