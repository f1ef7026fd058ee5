use k8s_openapi::api::core::v1::{Node, Taint};
use thiserror::Error;

use crate::crd::PackageToleration;

/// Taint pre-applied to nodes that must not take general workloads until
/// every runtime-required Skyhook has completed there.
pub const DEFAULT_RUNTIME_REQUIRED_TAINT: &str = "skyhook.nvidia.com=uninitialized:NoSchedule";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaintError {
    #[error("invalid taint '{0}': expected key[=value]:Effect")]
    Malformed(String),
}

/* ============================= PARSING ============================= */

/// The runtime-required taint, parsed from the `runtimeRequiredTaint`
/// environment value (`key=value:Effect` or `key:Effect`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeTaint {
    pub key: String,
    pub value: Option<String>,
    pub effect: String,
}

impl RuntimeTaint {
    pub fn parse(raw: &str) -> Result<Self, TaintError> {
        let (key_part, effect) = raw
            .rsplit_once(':')
            .ok_or_else(|| TaintError::Malformed(raw.to_string()))?;
        if key_part.is_empty() || effect.is_empty() {
            return Err(TaintError::Malformed(raw.to_string()));
        }
        let (key, value) = match key_part.split_once('=') {
            Some((k, v)) => (k, Some(v.to_string())),
            None => (key_part, None),
        };
        if key.is_empty() {
            return Err(TaintError::Malformed(raw.to_string()));
        }
        Ok(Self {
            key: key.to_string(),
            value,
            effect: effect.to_string(),
        })
    }

    /// Toleration every runner pod carries so it can land on tainted nodes.
    pub fn toleration(&self) -> PackageToleration {
        PackageToleration {
            key: Some(self.key.clone()),
            operator: Some(if self.value.is_some() { "Equal" } else { "Exists" }.to_string()),
            value: self.value.clone(),
            effect: Some(self.effect.clone()),
            toleration_seconds: None,
        }
    }

    pub fn matches(&self, taint: &Taint) -> bool {
        taint.key == self.key
            && taint.effect == self.effect
            && match &self.value {
                Some(v) => taint.value.as_deref() == Some(v),
                None => true,
            }
    }
}

/* ============================= NODE DECISIONS ============================= */

pub fn node_has_taint(node: &Node, taint: &RuntimeTaint) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.taints.as_ref())
        .is_some_and(|taints| taints.iter().any(|t| taint.matches(t)))
}

/// Removal is strictly per-node: the taint comes off a node once every
/// runtime-required Skyhook targeting it reports complete there, no matter
/// what other nodes are doing. No runtime-required Skyhooks → nothing holds
/// the taint, but nothing asked for it either, so leave it alone.
pub fn should_remove_taint(node: &Node, taint: &RuntimeTaint, completions: &[bool]) -> bool {
    node_has_taint(node, taint) && !completions.is_empty() && completions.iter().all(|c| *c)
}

/// Taint list with the runtime-required taint filtered out, or `None` when
/// it was not present (no patch needed).
pub fn taints_without(node: &Node, taint: &RuntimeTaint) -> Option<Vec<Taint>> {
    let taints = node.spec.as_ref()?.taints.as_ref()?;
    if !taints.iter().any(|t| taint.matches(t)) {
        return None;
    }
    Some(
        taints
            .iter()
            .filter(|t| !taint.matches(t))
            .cloned()
            .collect(),
    )
}

/* ============================= TESTS ============================= */
