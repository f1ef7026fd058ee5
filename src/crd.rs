use std::collections::BTreeMap;

use base64::Engine;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/* ============================= INTERRUPT TYPES ============================= */

/// Kind of node-level disruption a package may require.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum InterruptKind {
    Reboot,
    Service,
    Noop,
    RestartAllServices,
}

impl InterruptKind {
    /// Wire name handed to the package runner.
    pub fn normalized(&self) -> &'static str {
        match self {
            InterruptKind::Reboot => "node_restart",
            InterruptKind::Service => "service_restart",
            InterruptKind::Noop => "no_op",
            InterruptKind::RestartAllServices => "restart_all_services",
        }
    }
}

/// A disruptive action tied to a package or a config key.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Interrupt {
    #[serde(rename = "type")]
    pub kind: InterruptKind,

    /// Services to restart for `service`; ignored for other kinds.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,
}

/// Payload decoded from runner args; see [`Interrupt::to_args`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InterruptArgs {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub services: Vec<String>,
}

impl Interrupt {
    /// Encode the runner argument: base64 of `{"type": <normalized>, "services": [...]}`.
    pub fn to_args(&self) -> String {
        let payload = InterruptArgs {
            kind: self.kind.normalized().to_string(),
            services: self.services.clone(),
        };
        let json = serde_json::to_vec(&payload).expect("interrupt payload serializes");
        base64::engine::general_purpose::STANDARD.encode(json)
    }

    /// Decode runner args back into the normalized payload.
    pub fn parse_args(args: &str) -> Result<InterruptArgs, serde_json::Error> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(args)
            .map_err(|e| <serde_json::Error as serde::de::Error>::custom(format!("invalid base64: {e}")))?;
        serde_json::from_slice(&bytes)
    }
}

/* ============================= PACKAGE ============================= */

/// Environment variable passed through to runner containers.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PackageEnv {
    pub name: String,
    pub value: String,
}

/// Per-package resource overrides. All four fields are required together;
/// a package either overrides everything or inherits namespace defaults.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PackageResources {
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
}

/// Toleration attached to runner pods.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PackageToleration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toleration_seconds: Option<i64>,
}

/// A unit of lifecycle work: image, stage scripts, optional interrupt,
/// dependencies on sibling packages within the same Skyhook.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    /// Semver version; doubles as the image tag.
    pub version: String,

    /// Image reference without tag. The effective image is `image:version`.
    pub image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt: Option<Interrupt>,

    /// Files projected into the runner; key → content.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config_map: BTreeMap<String, String>,

    /// Key-or-glob → interrupt fired when that config key changes.
    /// `*` is the only meta character in patterns.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config_interrupts: BTreeMap<String, Interrupt>,

    /// package-name → required version; both must exist in the same Skyhook.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub depends_on: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<PackageEnv>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<PackageResources>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_image_override: Option<String>,

    /// Grace period for runner pod termination, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graceful_shutdown_seconds: Option<i64>,
}

impl Package {
    /// Effective runner image for this package: `image:version`.
    pub fn effective_image(&self) -> String {
        format!("{}:{}", self.image, self.version)
    }
}

/// Unique key identifying one (package, version) pair inside node state.
pub fn unique_key(name: &str, version: &str) -> String {
    format!("{name}|{version}")
}

/* ============================= BUDGETS ============================= */

/// Ceiling on concurrently in-progress nodes. Exactly one of the two
/// fields is set; admission rejects both-or-neither, consumers re-check.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    /// 1–100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<u32>,

    /// ≥ 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
}

/* ============================= SKYHOOK SPEC ============================= */

/// Knobs that override referenced DeploymentPolicy behavior per Skyhook.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentPolicyOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_batch_state_on_completion: Option<bool>,
}

fn default_priority() -> u32 {
    200
}

/// Skyhook describes an ordered, per-node set of package lifecycle
/// operations applied to the nodes its selector matches.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "skyhook.nvidia.com",
    version = "v1alpha1",
    kind = "Skyhook",
    plural = "skyhooks",
    shortname = "sh",
    status = "SkyhookStatus",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Complete","type":"string","jsonPath":".status.completeNodes"}"#,
    printcolumn = r#"{"name":"Priority","type":"integer","jsonPath":".spec.priority"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SkyhookSpec {
    /// Per-node ordering across Skyhooks; lower runs first. Minimum 1.
    #[serde(default = "default_priority")]
    pub priority: u32,

    /// At most one runner pod in flight per node when set.
    #[serde(default)]
    pub serial: bool,

    /// Completion gates removal of the runtime-required taint.
    #[serde(default)]
    pub runtime_required: bool,

    /// Label match selecting target nodes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Workloads matching these labels block interrupts while running.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_non_interrupt_labels: BTreeMap<String, String>,

    /// name → Package. Names are unique by construction of the map.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub packages: BTreeMap<String, Package>,

    /// Mutually exclusive with `deploymentPolicy`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interruption_budget: Option<Budget>,

    /// Name of a DeploymentPolicy. Mutually exclusive with `interruptionBudget`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_policy: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_tolerations: Vec<PackageToleration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_policy_options: Option<DeploymentPolicyOptions>,
}

/* ============================= LIFECYCLE ENUMS ============================= */

/// Phase within a package's lifecycle.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum Stage {
    #[serde(rename = "uninstall")]
    Uninstall,
    #[serde(rename = "upgrade")]
    Upgrade,
    #[serde(rename = "apply")]
    Apply,
    #[serde(rename = "config")]
    Config,
    #[serde(rename = "interrupt")]
    Interrupt,
    #[serde(rename = "post-interrupt")]
    PostInterrupt,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Uninstall => "uninstall",
            Stage::Upgrade => "upgrade",
            Stage::Apply => "apply",
            Stage::Config => "config",
            Stage::Interrupt => "interrupt",
            Stage::PostInterrupt => "post-interrupt",
        }
    }

    /// Every stage except `interrupt` carries an implicit check phase.
    pub fn has_check(&self) -> bool {
        !matches!(self, Stage::Interrupt)
    }

    pub fn all() -> &'static [Stage] {
        &[
            Stage::Uninstall,
            Stage::Upgrade,
            Stage::Apply,
            Stage::Config,
            Stage::Interrupt,
            Stage::PostInterrupt,
        ]
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution outcome at the current stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default)]
pub enum PackageState {
    #[serde(rename = "complete")]
    Complete,
    #[serde(rename = "in_progress")]
    InProgress,
    #[serde(rename = "skipped")]
    Skipped,
    #[serde(rename = "erroring")]
    Erroring,
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
}

impl PackageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageState::Complete => "complete",
            PackageState::InProgress => "in_progress",
            PackageState::Skipped => "skipped",
            PackageState::Erroring => "erroring",
            PackageState::Unknown => "unknown",
        }
    }

    pub fn all() -> &'static [PackageState] {
        &[
            PackageState::Complete,
            PackageState::InProgress,
            PackageState::Skipped,
            PackageState::Erroring,
            PackageState::Unknown,
        ]
    }
}

impl std::fmt::Display for PackageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/* ============================= PACKAGE STATUS ============================= */

/// Per-(node, package) progress record, persisted in the node's
/// `nodeState_<skyhook>` annotation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PackageStatus {
    pub name: String,
    pub version: String,
    pub image: String,
    pub stage: Stage,
    pub state: PackageState,

    #[serde(default)]
    pub restarts: i32,
}

impl PackageStatus {
    pub fn unique_key(&self) -> String {
        unique_key(&self.name, &self.version)
    }
}

// Restarts are bookkeeping, not identity.
impl PartialEq for PackageStatus {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.version == other.version
            && self.stage == other.stage
            && self.state == other.state
    }
}

impl Eq for PackageStatus {}

/* ============================= OVERALL STATUS ============================= */

/// Node-level and Skyhook-level rollup status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum Status {
    #[serde(rename = "complete")]
    Complete,
    #[serde(rename = "in_progress")]
    InProgress,
    #[serde(rename = "erroring")]
    Erroring,
    #[serde(rename = "blocked")]
    Blocked,
    #[serde(rename = "waiting")]
    Waiting,
    #[serde(rename = "paused")]
    Paused,
    #[serde(rename = "disabled")]
    Disabled,
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Complete => "complete",
            Status::InProgress => "in_progress",
            Status::Erroring => "erroring",
            Status::Blocked => "blocked",
            Status::Waiting => "waiting",
            Status::Paused => "paused",
            Status::Disabled => "disabled",
            Status::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> Option<Status> {
        Status::all().iter().copied().find(|s| s.as_str() == raw)
    }

    /// Every value a status series can take; used to zero metric gauges.
    pub fn all() -> &'static [Status] {
        &[
            Status::Complete,
            Status::InProgress,
            Status::Erroring,
            Status::Blocked,
            Status::Waiting,
            Status::Paused,
            Status::Disabled,
            Status::Unknown,
        ]
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/* ============================= BATCH STATE ============================= */

/// Per-compartment rollout bookkeeping, stored in the Skyhook status
/// subresource and advanced once per settled batch.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BatchProcessingState {
    pub current_batch: u32,

    #[serde(default)]
    pub consecutive_failures: u32,

    #[serde(default)]
    pub completed_nodes: u32,

    #[serde(default)]
    pub failed_nodes: u32,

    #[serde(default)]
    pub should_stop: bool,

    #[serde(default)]
    pub last_batch_size: u32,

    #[serde(default)]
    pub last_batch_failed: bool,
}

impl BatchProcessingState {
    pub fn new(initial_batch: u32) -> Self {
        Self {
            current_batch: initial_batch.max(1),
            consecutive_failures: 0,
            completed_nodes: 0,
            failed_nodes: 0,
            should_stop: false,
            last_batch_size: 0,
            last_batch_failed: false,
        }
    }
}

/* ============================= SKYHOOK STATUS ============================= */

/// Aggregated view written by the operator; node annotations remain the
/// source of truth and this mirror is recomputed from them.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct SkyhookStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,

    /// node → unique-key → PackageStatus.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_state: BTreeMap<String, BTreeMap<String, PackageStatus>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_status: BTreeMap<String, Status>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes_in_progress: Option<u32>,

    /// Printer-column friendly "X/Y".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete_nodes: Option<String>,

    /// Sorted `name|version` keys of the current spec.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub package_list: Vec<String>,

    /// compartment name → batch bookkeeping.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub batch_state: BTreeMap<String, BatchProcessingState>,
}

/* ============================= DEPLOYMENT POLICY ============================= */

fn default_batch_threshold() -> u32 {
    100
}

fn default_safety_limit() -> u32 {
    50
}

/// Rollout pacing; exactly one variant, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DeploymentStrategy {
    #[serde(rename_all = "camelCase")]
    Fixed {
        initial_batch: u32,
        #[serde(default = "default_batch_threshold")]
        batch_threshold: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure_threshold: Option<u32>,
        #[serde(default = "default_safety_limit")]
        safety_limit: u32,
    },

    #[serde(rename_all = "camelCase")]
    Linear {
        initial_batch: u32,
        delta: u32,
        #[serde(default = "default_batch_threshold")]
        batch_threshold: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure_threshold: Option<u32>,
        #[serde(default = "default_safety_limit")]
        safety_limit: u32,
    },

    #[serde(rename_all = "camelCase")]
    Exponential {
        initial_batch: u32,
        growth_factor: u32,
        #[serde(default = "default_batch_threshold")]
        batch_threshold: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure_threshold: Option<u32>,
        #[serde(default = "default_safety_limit")]
        safety_limit: u32,
    },
}

impl DeploymentStrategy {
    pub fn initial_batch(&self) -> u32 {
        match self {
            DeploymentStrategy::Fixed { initial_batch, .. }
            | DeploymentStrategy::Linear { initial_batch, .. }
            | DeploymentStrategy::Exponential { initial_batch, .. } => *initial_batch,
        }
    }

    pub fn batch_threshold(&self) -> u32 {
        match self {
            DeploymentStrategy::Fixed { batch_threshold, .. }
            | DeploymentStrategy::Linear { batch_threshold, .. }
            | DeploymentStrategy::Exponential { batch_threshold, .. } => *batch_threshold,
        }
    }

    pub fn failure_threshold(&self) -> Option<u32> {
        match self {
            DeploymentStrategy::Fixed { failure_threshold, .. }
            | DeploymentStrategy::Linear { failure_threshold, .. }
            | DeploymentStrategy::Exponential { failure_threshold, .. } => *failure_threshold,
        }
    }

    pub fn safety_limit(&self) -> u32 {
        match self {
            DeploymentStrategy::Fixed { safety_limit, .. }
            | DeploymentStrategy::Linear { safety_limit, .. }
            | DeploymentStrategy::Exponential { safety_limit, .. } => *safety_limit,
        }
    }

    /// Lower is safer; compartment tie-breaking prefers safer strategies.
    pub fn safety_rank(&self) -> u8 {
        match self {
            DeploymentStrategy::Fixed { .. } => 0,
            DeploymentStrategy::Linear { .. } => 1,
            DeploymentStrategy::Exponential { .. } => 2,
        }
    }
}

/// Reserved name of the catch-all compartment.
pub const DEFAULT_COMPARTMENT: &str = "__default__";

/// A named subset of nodes with its own budget and pacing.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Compartment {
    pub name: String,

    /// Label match; a node may match several compartments, the safest wins.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selector: BTreeMap<String, String>,

    pub budget: Budget,

    /// Falls back to the policy default strategy when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<DeploymentStrategy>,
}

/// Budget + strategy applied to nodes no compartment claims.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DefaultCompartment {
    pub budget: Budget,
    pub strategy: DeploymentStrategy,
}

/// DeploymentPolicy bounds how fast Skyhooks roll across node compartments.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "skyhook.nvidia.com",
    version = "v1alpha1",
    kind = "DeploymentPolicy",
    plural = "deploymentpolicies",
    shortname = "dp",
    status = "DeploymentPolicyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentPolicySpec {
    pub default: DefaultCompartment,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compartments: Vec<Compartment>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_batch_state_on_completion: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentPolicyStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Names of Skyhooks currently referencing this policy; deletion is
    /// rejected while non-empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub referenced_by: Vec<String>,
}

/* ============================= TESTS ============================= */
