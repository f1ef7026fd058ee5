use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Node;
use thiserror::Error;

use crate::crd::{PackageStatus, Skyhook, Status};

/* ============================= KEYS ============================= */

pub const METADATA_PREFIX: &str = "skyhook.nvidia.com";

/// Annotations on the Skyhook object itself.
pub const PAUSE_ANNOTATION: &str = "skyhook.nvidia.com/pause";
pub const DISABLE_ANNOTATION: &str = "skyhook.nvidia.com/disable";

/// Label excluding a node from all processing.
pub const NODE_IGNORE_LABEL: &str = "skyhook.nvidia.com/nodeIgnore";

pub fn node_state_key(skyhook: &str) -> String {
    format!("{METADATA_PREFIX}/nodeState_{skyhook}")
}

pub fn status_key(skyhook: &str) -> String {
    format!("{METADATA_PREFIX}/status_{skyhook}")
}

pub fn cordon_key(skyhook: &str) -> String {
    format!("{METADATA_PREFIX}/cordon_{skyhook}")
}

pub fn version_key(skyhook: &str) -> String {
    format!("{METADATA_PREFIX}/version_{skyhook}")
}

pub fn boot_id_key(skyhook: &str) -> String {
    format!("{METADATA_PREFIX}/bootId_{skyhook}")
}

pub fn config_versions_key(skyhook: &str) -> String {
    format!("{METADATA_PREFIX}/configVersions_{skyhook}")
}

pub fn config_updates_key(skyhook: &str) -> String {
    format!("{METADATA_PREFIX}/configUpdates_{skyhook}")
}

/// True for every metadata key this Skyhook owns on a node; used by the
/// finalizer and by `node reset` to strip state without touching keys
/// belonging to other Skyhooks.
pub fn is_owned_key(key: &str, skyhook: &str) -> bool {
    let Some(rest) = key.strip_prefix(METADATA_PREFIX) else {
        return false;
    };
    let Some(rest) = rest.strip_prefix('/') else {
        return false;
    };
    rest.ends_with(&format!("_{skyhook}"))
}

/* ============================= ERRORS ============================= */

#[derive(Debug, Error)]
pub enum NodeStateError {
    #[error("invalid node state payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/* ============================= NODE STATE ============================= */

/// unique-key (`name|version`) → PackageStatus.
pub type NodeState = BTreeMap<String, PackageStatus>;

/// package name → config key → sha256 digest recorded at last config success.
pub type ConfigVersions = BTreeMap<String, BTreeMap<String, String>>;

/// package name → config keys whose change still owes an interrupt.
pub type ConfigUpdates = BTreeMap<String, Vec<String>>;

/// Serialize node state for the annotation. BTreeMap keys make the bytes
/// deterministic for a given map.
pub fn encode_node_state(state: &NodeState) -> String {
    serde_json::to_string(state).expect("node state serializes")
}

pub fn decode_node_state(raw: &str) -> Result<NodeState, NodeStateError> {
    Ok(serde_json::from_str(raw)?)
}

pub fn encode_config_versions(versions: &ConfigVersions) -> String {
    serde_json::to_string(versions).expect("config versions serialize")
}

pub fn decode_config_versions(raw: &str) -> Result<ConfigVersions, NodeStateError> {
    Ok(serde_json::from_str(raw)?)
}

pub fn encode_config_updates(updates: &ConfigUpdates) -> String {
    serde_json::to_string(updates).expect("config updates serialize")
}

pub fn decode_config_updates(raw: &str) -> Result<ConfigUpdates, NodeStateError> {
    Ok(serde_json::from_str(raw)?)
}

/* ============================= NODE ACCESSORS ============================= */

fn annotation<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

pub fn node_labels(node: &Node) -> BTreeMap<String, String> {
    node.metadata.labels.clone().unwrap_or_default()
}

pub fn is_ignored(node: &Node) -> bool {
    node.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(NODE_IGNORE_LABEL))
        .map(String::as_str)
        == Some("true")
}

/// Recorded per-package state; a missing or empty annotation is an empty map.
pub fn read_node_state(node: &Node, skyhook: &str) -> Result<NodeState, NodeStateError> {
    match annotation(node, &node_state_key(skyhook)) {
        Some(raw) if !raw.is_empty() => decode_node_state(raw),
        _ => Ok(NodeState::new()),
    }
}

pub fn read_config_versions(
    node: &Node,
    skyhook: &str,
) -> Result<ConfigVersions, NodeStateError> {
    match annotation(node, &config_versions_key(skyhook)) {
        Some(raw) if !raw.is_empty() => decode_config_versions(raw),
        _ => Ok(ConfigVersions::new()),
    }
}

pub fn read_config_updates(node: &Node, skyhook: &str) -> Result<ConfigUpdates, NodeStateError> {
    match annotation(node, &config_updates_key(skyhook)) {
        Some(raw) if !raw.is_empty() => decode_config_updates(raw),
        _ => Ok(ConfigUpdates::new()),
    }
}

pub fn read_status(node: &Node, skyhook: &str) -> Option<Status> {
    annotation(node, &status_key(skyhook)).and_then(Status::parse)
}

/// Last Skyhook spec generation this node was reconciled against.
pub fn read_version(node: &Node, skyhook: &str) -> Option<i64> {
    annotation(node, &version_key(skyhook)).and_then(|v| v.parse().ok())
}

pub fn has_cordon_marker(node: &Node, skyhook: &str) -> bool {
    annotation(node, &cordon_key(skyhook)) == Some("true")
}

/// Boot id captured before a reboot interrupt was dispatched.
pub fn read_captured_boot_id<'a>(node: &'a Node, skyhook: &str) -> Option<&'a str> {
    annotation(node, &boot_id_key(skyhook))
}

/// Live boot id from node status.
pub fn boot_id(node: &Node) -> Option<&str> {
    node.status
        .as_ref()
        .and_then(|s| s.node_info.as_ref())
        .map(|i| i.boot_id.as_str())
}

pub fn is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

pub fn is_unschedulable(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false)
}

/// Every annotation and label key on the node that belongs to this Skyhook.
pub fn owned_keys(node: &Node, skyhook: &str) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some(annotations) = &node.metadata.annotations {
        keys.extend(
            annotations
                .keys()
                .filter(|k| is_owned_key(k, skyhook))
                .cloned(),
        );
    }
    if let Some(labels) = &node.metadata.labels {
        keys.extend(labels.keys().filter(|k| is_owned_key(k, skyhook)).cloned());
    }
    keys.sort();
    keys
}

/* ============================= SKYHOOK ACCESSORS ============================= */

fn skyhook_annotation_is_true(skyhook: &Skyhook, key: &str) -> bool {
    skyhook
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
        == Some("true")
}

pub fn is_paused(skyhook: &Skyhook) -> bool {
    skyhook_annotation_is_true(skyhook, PAUSE_ANNOTATION)
}

pub fn is_disabled(skyhook: &Skyhook) -> bool {
    skyhook_annotation_is_true(skyhook, DISABLE_ANNOTATION)
}

/* ============================= TESTS ============================= */
