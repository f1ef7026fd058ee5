use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod, Taint};
use kube::ResourceExt;

use crate::crd::{
    DeploymentPolicy, InterruptKind, Package, PackageState, Skyhook, SkyhookSpec, SkyhookStatus,
    Stage, Status, unique_key,
};
use crate::graph::PackageGraph;
use crate::interrupts::{
    self, InterruptAction, InterruptView, reboot_already_happened, reboot_verified,
};
use crate::lifecycle::{
    self, RunnerOutcome, apply_outcome, config_digests, config_updates, effective_interrupt,
    has_interrupt, is_terminal_complete, next_stage, start_stage,
};
use crate::node_state::{
    self, ConfigUpdates, ConfigVersions, NodeState, boot_id_key, config_updates_key,
    config_versions_key, cordon_key, node_state_key, status_key, version_key,
};
use crate::planner::{self, RunnerPodParams, runner_outcome};
use crate::policy::{
    self, BatchResult, advance_batch, assign_compartment, budget_ceiling, effective_budget,
    effective_reset_on_completion, effective_strategy, matched_counts,
};
use crate::scheduler::{Gate, gate_for_node, order_skyhooks, selects_node};
use crate::status::{
    aggregate_status, complete_nodes_label, derive_node_status, is_node_complete, package_list,
};
use crate::taints::RuntimeTaint;

/// Pod redispatch budget before a package is declared failed for the batch.
pub const RETRY_BUDGET: i32 = 3;

/// Sticky admission marker for the current interruption window.
pub fn node_priority_key(skyhook: &str) -> String {
    format!("{}/nodePriority_{skyhook}", node_state::METADATA_PREFIX)
}

/* ============================= SNAPSHOT ============================= */

/// Everything one reconcile pass reads. The planner never touches the
/// cluster; it folds this snapshot into a [`Plan`].
pub struct Snapshot<'a> {
    pub skyhook: &'a Skyhook,
    /// Every Skyhook in the cluster, for per-node priority gating.
    pub all_skyhooks: &'a [Skyhook],
    /// Resolved DeploymentPolicy when the spec references one.
    pub policy: Option<&'a DeploymentPolicy>,
    /// All cluster nodes; the planner applies selector and ignore label.
    pub nodes: &'a [Node],
    /// All pods the operator watches: runner pods plus node workloads.
    pub pods: &'a [Pod],
    pub agent_image: &'a str,
    pub runner_namespace: &'a str,
    pub runtime_taint: &'a RuntimeTaint,
    pub now: DateTime<Utc>,
}

/* ============================= PLAN ============================= */

/// One cluster write. Mutations are ordered; appliers run them in sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Set (`Some`) or remove (`None`) a node annotation.
    AnnotateNode {
        node: String,
        key: String,
        value: Option<String>,
    },
    LabelNode {
        node: String,
        key: String,
        value: Option<String>,
    },
    Cordon {
        node: String,
    },
    Uncordon {
        node: String,
    },
    SetNodeTaints {
        node: String,
        taints: Vec<Taint>,
    },
    CreatePod {
        pod: Box<Pod>,
    },
    DeletePod {
        namespace: String,
        name: String,
    },
    EvictPod {
        namespace: String,
        name: String,
    },
}

/// Output of one pure reconcile pass.
#[derive(Debug, Clone)]
pub struct Plan {
    pub mutations: Vec<Mutation>,
    pub status: SkyhookStatus,
    /// True when the pass left work behind (short requeue).
    pub work_pending: bool,
}

/* ============================= NODE CLASSIFICATION ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeClass {
    /// Every spec package settled, nothing stale.
    Complete,
    /// Some package exhausted its retry budget.
    Failed,
    /// Dispatched work is still moving.
    InFlight,
    /// Needs work but nothing is dispatched yet; awaits batch admission.
    Pending,
}

fn classify_node(
    skyhook: &Skyhook,
    state: &NodeState,
    updates: &BTreeMap<String, Vec<String>>,
) -> NodeClass {
    if state
        .values()
        .any(|r| r.state == PackageState::Erroring && r.restarts >= RETRY_BUDGET)
    {
        return NodeClass::Failed;
    }
    if is_node_complete(&skyhook.spec, state, updates) {
        return NodeClass::Complete;
    }
    if state.values().any(|r| {
        matches!(
            r.state,
            PackageState::InProgress | PackageState::Erroring | PackageState::Skipped
        )
    }) {
        return NodeClass::InFlight;
    }
    NodeClass::Pending
}

/* ============================= NODE ADVANCEMENT ============================= */

struct NodeContext<'a> {
    snapshot: &'a Snapshot<'a>,
    graph: &'a PackageGraph,
    node: &'a Node,
    node_name: String,
    skyhook_name: String,
    /// Runner pods for this (skyhook, node).
    runner_pods: Vec<&'a Pod>,
    /// All pods bound to this node (workloads included).
    pods_on_node: Vec<&'a Pod>,
}

struct NodeOutcome {
    state: NodeState,
    config_versions: ConfigVersions,
    config_updates: ConfigUpdates,
    mutations: Vec<Mutation>,
    /// Pods were created or deleted; the node is actively moving.
    dispatched: bool,
    /// Pod names created this pass, so re-scans never double-dispatch.
    dispatched_names: std::collections::BTreeSet<String>,
    blocked: bool,
}

impl NodeContext<'_> {
    fn find_runner(&self, package: &str, stage: Stage) -> Option<&Pod> {
        self.runner_pods
            .iter()
            .find(|p| {
                planner::is_runner_for(p, &self.skyhook_name, package, &self.node_name)
                    && planner::runner_stage(p) == Some(stage.as_str())
            })
            .copied()
    }

    fn dispatch(
        &self,
        out: &mut NodeOutcome,
        package_name: &str,
        package: &Package,
        stage: Stage,
        interrupt: Option<&crate::crd::Interrupt>,
    ) {
        let name = planner::pod_name(&self.skyhook_name, package_name, stage, &self.node_name);
        if !out.dispatched_names.insert(name) {
            return;
        }
        // Replace any leftover pod for the same (package, stage).
        if let Some(existing) = self.find_runner(package_name, stage) {
            out.mutations.push(Mutation::DeletePod {
                namespace: existing.namespace().unwrap_or_default(),
                name: existing.name_any(),
            });
        }
        let pod = planner::build_runner_pod(&RunnerPodParams {
            skyhook_name: &self.skyhook_name,
            package_name,
            package,
            stage,
            node_name: &self.node_name,
            namespace: self.snapshot.runner_namespace,
            agent_image: self.snapshot.agent_image,
            additional_tolerations: &self.snapshot.skyhook.spec.additional_tolerations,
            runtime_taint: self.snapshot.runtime_taint,
            interrupt,
        });
        out.mutations.push(Mutation::CreatePod { pod: Box::new(pod) });
        out.dispatched = true;
    }
}

/// Drive one node's packages as far as observed evidence allows, emitting
/// pod and node mutations along the way. Re-scans from the topological
/// roots until a fixed point so late completions unlock dependents within
/// the same pass.
fn advance_node(
    ctx: &NodeContext<'_>,
    state: NodeState,
    config_versions: ConfigVersions,
    pending_updates: ConfigUpdates,
) -> NodeOutcome {
    let mut out = NodeOutcome {
        state,
        config_versions,
        config_updates: pending_updates,
        mutations: Vec::new(),
        dispatched: false,
        dispatched_names: std::collections::BTreeSet::new(),
        blocked: false,
    };
    let spec = &ctx.snapshot.skyhook.spec;
    let serial = spec.serial;

    out.blocked = ctx
        .runner_pods
        .iter()
        .any(|p| planner::is_unschedulable(p));

    // Serial: one runner pod in flight per node. While one is executing,
    // nothing else can change on the node.
    if serial
        && ctx
            .runner_pods
            .iter()
            .any(|p| matches!(runner_outcome(p), RunnerOutcome::Running { .. }))
    {
        out.dispatched = true;
        return out;
    }

    // Tear down records for packages removed from the spec entirely.
    // A record whose name survives with a different version is an upgrade,
    // handled in the per-package scan below.
    let spec_keys: Vec<String> = spec
        .packages
        .iter()
        .map(|(n, p)| unique_key(n, &p.version))
        .collect();
    let stale_keys: Vec<String> = out
        .state
        .iter()
        .filter(|(k, r)| !spec_keys.contains(k) && !spec.packages.contains_key(&r.name))
        .map(|(k, _)| k.clone())
        .collect();
    for key in stale_keys {
        advance_stale_record(ctx, &mut out, &key);
        if serial && out.dispatched {
            return out;
        }
    }

    // Bounded re-scan: one extra round per package covers any chain of
    // same-pass completions.
    for _ in 0..=spec.packages.len() {
        let mut changed = false;
        for name in ctx.graph.topo_order() {
            let Some(package) = spec.packages.get(name) else {
                continue;
            };
            if advance_package(ctx, &mut out, name, package) {
                changed = true;
            }
            if serial && out.dispatched {
                return out;
            }
        }
        if !changed {
            break;
        }
    }

    out
}

/// A record for a package (or version) the spec no longer carries moves
/// through uninstall and is then dropped.
fn advance_stale_record(ctx: &NodeContext<'_>, out: &mut NodeOutcome, key: &str) {
    let Some(record) = out.state.get(key).cloned() else {
        return;
    };

    // Synthetic package for the uninstall runner, derived from the record.
    let (image, _) = crate::admission::split_image_tag(&record.image);
    let package = Package {
        version: record.version.clone(),
        image: image.to_string(),
        ..Default::default()
    };

    if record.stage != Stage::Uninstall {
        out.state
            .insert(key.to_string(), start_stage(&record.name, &package, Stage::Uninstall));
        ctx.dispatch(out, &record.name, &package, Stage::Uninstall, None);
        return;
    }

    match record.state {
        PackageState::InProgress => {
            match ctx.find_runner(&record.name, Stage::Uninstall) {
                Some(pod) => {
                    let mut updated = record.clone();
                    apply_outcome(&mut updated, runner_outcome(pod));
                    if updated.state == PackageState::Complete {
                        // Uninstall done: drop the record and its pod.
                        out.state.remove(key);
                        out.config_versions.remove(&record.name);
                        out.config_updates.remove(&record.name);
                        out.mutations.push(Mutation::DeletePod {
                            namespace: pod.namespace().unwrap_or_default(),
                            name: pod.name_any(),
                        });
                        out.dispatched = true;
                    } else {
                        out.state.insert(key.to_string(), updated);
                    }
                }
                None => ctx.dispatch(out, &record.name, &package, Stage::Uninstall, None),
            }
        }
        PackageState::Erroring if record.restarts < RETRY_BUDGET => {
            let mut updated = record.clone();
            updated.state = PackageState::InProgress;
            updated.restarts += 1;
            out.state.insert(key.to_string(), updated);
            ctx.dispatch(out, &record.name, &package, Stage::Uninstall, None);
        }
        _ => {}
    }
}

/// Keys needing attention for one package: fresh diffs against the applied
/// digests merged with keys whose interrupt is still owed.
fn pending_keys(out: &NodeOutcome, name: &str, package: &Package) -> Vec<String> {
    let fresh = config_updates(package, out.config_versions.get(name));
    let mut pending: Vec<String> = out.config_updates.get(name).cloned().unwrap_or_default();
    for k in &fresh {
        if !pending.contains(k) {
            pending.push(k.clone());
        }
    }
    pending.sort();
    pending
}

/// Advance one spec package on one node. Returns true when the record
/// changed, which triggers another topological re-scan.
fn advance_package(
    ctx: &NodeContext<'_>,
    out: &mut NodeOutcome,
    name: &str,
    package: &Package,
) -> bool {
    let fresh = config_updates(package, out.config_versions.get(name));
    let mut pending = pending_keys(out, name, package);

    let with_interrupt = has_interrupt(package, &pending);
    if !with_interrupt && fresh.is_empty() && !pending.is_empty() {
        // The spec no longer attaches an interrupt to these keys.
        out.config_updates.remove(name);
        pending.clear();
    }
    let needs_config_rerun = !fresh.is_empty();
    let key = unique_key(name, &package.version);

    let Some(record) = out.state.get(&key).cloned() else {
        // Edge terminality depends on whether the dependency itself still
        // owes an interrupt: complete config is not enough then.
        let spec_packages = &ctx.snapshot.skyhook.spec.packages;
        let dep_terminal = |dep: &str, dep_record: &crate::crd::PackageStatus| {
            spec_packages.get(dep).is_some_and(|dep_pkg| {
                let dep_pending = pending_keys(out, dep, dep_pkg);
                is_terminal_complete(dep_record, has_interrupt(dep_pkg, &dep_pending))
            })
        };
        if !ctx.graph.can_advance(name, &out.state, dep_terminal) {
            return false;
        }

        // A record under the same name with another version means a prior
        // install is being replaced: upgrade instead of a fresh apply.
        let prior = out
            .state
            .iter()
            .find(|(_, r)| r.name == name && r.version != package.version)
            .map(|(k, r)| (k.clone(), r.clone()));
        let stage = lifecycle::initial_stage(
            true,
            prior.as_ref().map(|(_, r)| r),
            &package.version,
        );
        if let Some((old_key, _)) = prior {
            out.state.remove(&old_key);
        }

        out.state.insert(key, start_stage(name, package, stage));
        ctx.dispatch(out, name, package, stage, None);
        return true;
    };

    match record.state {
        PackageState::InProgress => advance_in_progress(ctx, out, name, package, record, &pending),
        PackageState::Complete => advance_complete(
            ctx,
            out,
            name,
            package,
            record,
            with_interrupt,
            needs_config_rerun,
            &pending,
        ),
        PackageState::Erroring => {
            if record.restarts >= RETRY_BUDGET {
                return false;
            }
            let mut updated = record;
            updated.state = PackageState::InProgress;
            updated.restarts += 1;
            let stage = updated.stage;
            out.state.insert(key, updated);
            let interrupt = effective_interrupt(package, &pending);
            ctx.dispatch(
                out,
                name,
                package,
                stage,
                (stage == Stage::Interrupt).then_some(interrupt).flatten(),
            );
            true
        }
        PackageState::Skipped => {
            // Collapsed reboot: promote once the boot id rotation is seen.
            if record.stage == Stage::Interrupt
                && reboot_already_happened(ctx.node, &ctx.skyhook_name)
            {
                let mut updated = record;
                lifecycle::promote_skipped(&mut updated);
                out.state.insert(key, updated);
                return true;
            }
            false
        }
        PackageState::Unknown => {
            let mut updated = record;
            updated.state = PackageState::InProgress;
            let stage = updated.stage;
            out.state.insert(key, updated);
            let interrupt = effective_interrupt(package, &pending);
            ctx.dispatch(
                out,
                name,
                package,
                stage,
                (stage == Stage::Interrupt).then_some(interrupt).flatten(),
            );
            true
        }
    }
}

fn advance_in_progress(
    ctx: &NodeContext<'_>,
    out: &mut NodeOutcome,
    name: &str,
    package: &Package,
    record: crate::crd::PackageStatus,
    updates: &[String],
) -> bool {
    let key = record.unique_key();
    let stage = record.stage;
    let Some(pod) = ctx.find_runner(name, stage) else {
        let interrupt = effective_interrupt(package, updates);
        ctx.dispatch(
            out,
            name,
            package,
            stage,
            (stage == Stage::Interrupt).then_some(interrupt).flatten(),
        );
        return false;
    };

    let mut updated = record.clone();
    apply_outcome(&mut updated, runner_outcome(pod));

    match updated.state {
        PackageState::Complete => {
            // A reboot interrupt only counts once the boot id rotated.
            let is_reboot = stage == Stage::Interrupt
                && effective_interrupt(package, updates)
                    .is_some_and(|i| i.kind == InterruptKind::Reboot);
            if is_reboot && !reboot_already_happened(ctx.node, &ctx.skyhook_name) {
                if record.restarts >= RETRY_BUDGET {
                    updated.state = PackageState::Erroring;
                    updated.restarts = record.restarts;
                    out.state.insert(key, updated);
                } else {
                    // Hold at interrupt; burn one retry per settled look.
                    updated.state = PackageState::InProgress;
                    updated.restarts = record.restarts + 1;
                    out.state.insert(key, updated);
                }
                return false;
            }

            if stage == Stage::Config {
                // Remember what was applied so later edits show up as diffs.
                // Keys that still owe an interrupt stay on the books until
                // post-interrupt completes.
                out.config_versions
                    .insert(name.to_string(), config_digests(package));
                if has_interrupt(package, updates) {
                    out.config_updates
                        .insert(name.to_string(), updates.to_vec());
                } else {
                    out.config_updates.remove(name);
                }
            }
            if stage == Stage::PostInterrupt {
                out.config_updates.remove(name);
            }
            out.state.insert(key, updated);
            out.mutations.push(Mutation::DeletePod {
                namespace: pod.namespace().unwrap_or_default(),
                name: pod.name_any(),
            });
            out.dispatched = true;
            true
        }
        PackageState::Erroring => {
            if updated.restarts < RETRY_BUDGET {
                updated.state = PackageState::InProgress;
                updated.restarts += 1;
                out.state.insert(key, updated);
                let interrupt = effective_interrupt(package, updates);
                ctx.dispatch(
                    out,
                    name,
                    package,
                    stage,
                    (stage == Stage::Interrupt).then_some(interrupt).flatten(),
                );
            } else {
                out.state.insert(key, updated);
            }
            false
        }
        _ => {
            let changed = updated != record || updated.restarts != record.restarts;
            out.state.insert(key, updated);
            changed
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn advance_complete(
    ctx: &NodeContext<'_>,
    out: &mut NodeOutcome,
    name: &str,
    package: &Package,
    record: crate::crd::PackageStatus,
    with_interrupt: bool,
    needs_config_rerun: bool,
    updates: &[String],
) -> bool {
    let key = record.unique_key();

    // Changed config content re-runs the config stage before anything else;
    // an owed interrupt fires after the new content lands.
    if needs_config_rerun && matches!(record.stage, Stage::Config | Stage::PostInterrupt) {
        out.state.insert(key, start_stage(name, package, Stage::Config));
        ctx.dispatch(out, name, package, Stage::Config, None);
        return true;
    }

    let Some(next) = next_stage(record.stage, with_interrupt, true) else {
        return false;
    };

    match next {
        Stage::Interrupt => {
            let interrupt =
                effective_interrupt(package, updates).cloned().unwrap_or(crate::crd::Interrupt {
                    kind: InterruptKind::Noop,
                    services: vec![],
                });

            match interrupt.kind {
                InterruptKind::Noop => {
                    let mut skipped = start_stage(name, package, Stage::Interrupt);
                    skipped.state = PackageState::Complete;
                    out.state.insert(key, skipped);
                    true
                }
                InterruptKind::Reboot
                    if reboot_already_happened(ctx.node, &ctx.skyhook_name) =>
                {
                    // The node already rebooted out-of-band; collapse.
                    let mut skipped = start_stage(name, package, Stage::Interrupt);
                    skipped.state = PackageState::Skipped;
                    out.state.insert(key, skipped);
                    true
                }
                _ => {
                    let pods_owned: Vec<Pod> =
                        ctx.pods_on_node.iter().map(|p| (*p).clone()).collect();
                    let view = InterruptView {
                        node: ctx.node,
                        skyhook_name: &ctx.skyhook_name,
                        non_interrupt_labels: &ctx.snapshot.skyhook.spec.pod_non_interrupt_labels,
                        pods_on_node: &pods_owned,
                    };
                    match interrupts::next_interrupt_action(&view) {
                        InterruptAction::Cordon => {
                            out.mutations.push(Mutation::Cordon {
                                node: ctx.node_name.clone(),
                            });
                            out.mutations.push(Mutation::AnnotateNode {
                                node: ctx.node_name.clone(),
                                key: cordon_key(&ctx.skyhook_name),
                                value: Some("true".to_string()),
                            });
                            out.dispatched = true;
                            false
                        }
                        InterruptAction::WaitForWorkloads { .. } => {
                            out.dispatched = true;
                            false
                        }
                        InterruptAction::Drain { evict } => {
                            for pod_name in evict {
                                if let Some(pod) = ctx
                                    .pods_on_node
                                    .iter()
                                    .find(|p| p.name_any() == pod_name)
                                {
                                    out.mutations.push(Mutation::EvictPod {
                                        namespace: pod.namespace().unwrap_or_default(),
                                        name: pod_name,
                                    });
                                }
                            }
                            out.dispatched = true;
                            false
                        }
                        InterruptAction::Ready => {
                            if interrupt.kind == InterruptKind::Reboot {
                                if let Some(live) = node_state::boot_id(ctx.node) {
                                    if node_state::read_captured_boot_id(
                                        ctx.node,
                                        &ctx.skyhook_name,
                                    ) != Some(live)
                                    {
                                        out.mutations.push(Mutation::AnnotateNode {
                                            node: ctx.node_name.clone(),
                                            key: boot_id_key(&ctx.skyhook_name),
                                            value: Some(live.to_string()),
                                        });
                                    }
                                }
                            }
                            out.state
                                .insert(key, start_stage(name, package, Stage::Interrupt));
                            ctx.dispatch(
                                out,
                                name,
                                package,
                                Stage::Interrupt,
                                Some(&interrupt),
                            );
                            true
                        }
                    }
                }
            }
        }
        Stage::PostInterrupt => {
            let is_reboot = effective_interrupt(package, updates)
                .is_some_and(|i| i.kind == InterruptKind::Reboot);
            if is_reboot && !reboot_verified(ctx.node, &ctx.skyhook_name) {
                // Boot id rotated (interrupt completed) but the node is not
                // Ready yet; hold before verification.
                out.dispatched = true;
                return false;
            }
            out.state
                .insert(key, start_stage(name, package, Stage::PostInterrupt));
            ctx.dispatch(out, name, package, Stage::PostInterrupt, None);
            true
        }
        other => {
            out.state.insert(key, start_stage(name, package, other));
            ctx.dispatch(out, name, package, other, None);
            true
        }
    }
}

/* ============================= PLAN BUILDING ============================= */

/// Per-package keys needing attention: live diffs against the applied
/// digests plus keys still owing an interrupt from an earlier pass.
fn merged_updates(
    spec: &SkyhookSpec,
    config_versions: &ConfigVersions,
    pending: &ConfigUpdates,
) -> BTreeMap<String, Vec<String>> {
    spec.packages
        .iter()
        .map(|(name, pkg)| {
            let mut keys = config_updates(pkg, config_versions.get(name));
            if let Some(stored) = pending.get(name) {
                for k in stored {
                    if !keys.contains(k) {
                        keys.push(k.clone());
                    }
                }
            }
            keys.sort();
            (name.clone(), keys)
        })
        .collect()
}

fn annotate_if_changed(
    mutations: &mut Vec<Mutation>,
    node: &Node,
    key: String,
    value: Option<String>,
) {
    let current = node
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(&key))
        .cloned();
    if current != value {
        mutations.push(Mutation::AnnotateNode {
            node: node.name_any(),
            key,
            value,
        });
    }
}

/// Build the full mutation plan and new status for one Skyhook.
///
/// Running the resulting plan and immediately re-planning against the
/// updated snapshot yields an empty mutation list: every write is guarded
/// by an observed-state comparison.
pub fn build_plan(snapshot: &Snapshot<'_>) -> Plan {
    let skyhook = snapshot.skyhook;
    let skyhook_name = skyhook.name_any();
    let generation = skyhook.metadata.generation;
    let paused = node_state::is_paused(skyhook);
    let disabled = node_state::is_disabled(skyhook);

    let mut plan = Plan {
        mutations: Vec::new(),
        status: SkyhookStatus::default(),
        work_pending: false,
    };

    let graph = match PackageGraph::build(&skyhook.spec.packages) {
        Ok(g) => g,
        Err(_) => {
            // Admission rejects this; if it slips through, report and stop
            // without writing anything.
            plan.status.observed_generation = generation;
            plan.status.status = Some(Status::Erroring);
            return plan;
        }
    };

    let ordered = order_skyhooks(snapshot.all_skyhooks);

    // Targeted nodes, name-sorted for deterministic batch admission.
    let mut targeted: Vec<&Node> = snapshot
        .nodes
        .iter()
        .filter(|n| !node_state::is_ignored(n))
        .filter(|n| selects_node(skyhook, &node_state::node_labels(n)))
        .collect();

    // Sticky admission: previously admitted nodes sort ahead of fresh ones;
    // names keep the order reproducible.
    targeted.sort_by_key(|n| {
        let admitted = n
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(&node_priority_key(&skyhook_name)))
            .cloned();
        (admitted.is_none(), admitted, n.name_any())
    });

    let mut node_statuses: Vec<Status> = Vec::new();
    let mut node_status_map: BTreeMap<String, Status> = BTreeMap::new();
    let mut new_node_state: BTreeMap<String, NodeState> = BTreeMap::new();
    let mut complete_count: u32 = 0;
    let mut in_progress_count: u32 = 0;

    // Compartment bookkeeping (policy path only).
    let policy_spec = snapshot.policy.map(|p| &p.spec);
    let label_maps: Vec<BTreeMap<String, String>> = targeted
        .iter()
        .map(|n| node_state::node_labels(n))
        .collect();
    let label_refs: Vec<&BTreeMap<String, String>> = label_maps.iter().collect();
    let compartment_counts = policy_spec.map(|p| matched_counts(p, &label_refs));
    let mut batch_state = skyhook
        .status
        .as_ref()
        .map(|s| s.batch_state.clone())
        .unwrap_or_default();

    // Per-compartment tallies for this pass.
    #[derive(Default)]
    struct CompartmentTally {
        complete: u32,
        failed: u32,
        in_flight: u32,
        pending_nodes: Vec<String>,
    }
    let mut tallies: BTreeMap<String, CompartmentTally> = BTreeMap::new();

    struct NodeEval<'a> {
        node: &'a Node,
        gate: Gate,
        state: NodeState,
        config_versions: ConfigVersions,
        pending_updates: ConfigUpdates,
        updates: BTreeMap<String, Vec<String>>,
        class: NodeClass,
        compartment: String,
    }

    let mut evals: Vec<NodeEval<'_>> = Vec::new();

    for (node, labels) in targeted.iter().zip(label_maps.iter()) {
        let chain: Vec<&Skyhook> = ordered
            .iter()
            .filter(|s| selects_node(s, labels))
            .copied()
            .collect();
        let gate = gate_for_node(&chain, &skyhook_name, |predecessor| {
            node_state::read_status(node, &predecessor.name_any()) == Some(Status::Complete)
        });

        let state = node_state::read_node_state(node, &skyhook_name).unwrap_or_default();
        let config_versions =
            node_state::read_config_versions(node, &skyhook_name).unwrap_or_default();
        let pending_updates =
            node_state::read_config_updates(node, &skyhook_name).unwrap_or_default();

        let updates = merged_updates(&skyhook.spec, &config_versions, &pending_updates);

        let class = classify_node(skyhook, &state, &updates);

        let compartment = match (policy_spec, &compartment_counts) {
            (Some(p), Some(counts)) => assign_compartment(p, labels, counts).to_string(),
            _ => crate::crd::DEFAULT_COMPARTMENT.to_string(),
        };

        // Gated nodes neither count against the budget nor take batch slots.
        if gate == Gate::Proceed {
            let tally = tallies.entry(compartment.clone()).or_default();
            match class {
                NodeClass::Complete => tally.complete += 1,
                NodeClass::Failed => tally.failed += 1,
                NodeClass::InFlight => tally.in_flight += 1,
                NodeClass::Pending => tally.pending_nodes.push(node.name_any()),
            }
        }

        evals.push(NodeEval {
            node,
            gate,
            state,
            config_versions,
            pending_updates,
            updates,
            class,
            compartment,
        });
    }

    // Settle batches and compute admissions per compartment.
    let mut admissions: BTreeMap<String, Vec<String>> = BTreeMap::new();
    if !paused && !disabled {
        for (compartment, tally) in &tallies {
            let allowance = match policy_spec {
                Some(p) => {
                    let strategy = effective_strategy(p, compartment);
                    let matched = compartment_counts
                        .as_ref()
                        .and_then(|c| c.get(compartment).copied())
                        .unwrap_or(0);
                    let ceiling = budget_ceiling(effective_budget(p, compartment), matched);

                    let state = batch_state
                        .entry(compartment.clone())
                        .or_insert_with(|| {
                            crate::crd::BatchProcessingState::new(strategy.initial_batch())
                        });

                    // A dispatched wave settles once nothing is in flight.
                    if tally.in_flight == 0 && state.last_batch_size > 0 {
                        let successes =
                            tally.complete.saturating_sub(state.completed_nodes);
                        let failures = tally.failed.saturating_sub(state.failed_nodes);
                        if successes + failures > 0 {
                            advance_batch(
                                state,
                                strategy,
                                &BatchResult {
                                    size: state.last_batch_size,
                                    successes,
                                    failures,
                                },
                            );
                        }
                    }

                    // Waves are discrete: the next batch starts only after
                    // the previous one fully settles.
                    if tally.in_flight > 0 {
                        0
                    } else {
                        policy::next_batch_size(
                            state,
                            ceiling,
                            tally.pending_nodes.len() as u32,
                        )
                    }
                }
                None => {
                    let matched = (tally.complete
                        + tally.failed
                        + tally.in_flight
                        + tally.pending_nodes.len() as u32)
                        .max(1);
                    let ceiling = skyhook
                        .spec
                        .interruption_budget
                        .as_ref()
                        .map(|b| budget_ceiling(b, matched))
                        .unwrap_or(matched);
                    ceiling
                        .saturating_sub(tally.in_flight)
                        .min(tally.pending_nodes.len() as u32)
                }
            };

            let admitted: Vec<String> = tally
                .pending_nodes
                .iter()
                .take(allowance as usize)
                .cloned()
                .collect();
            if !admitted.is_empty() {
                if let Some(state) = batch_state.get_mut(compartment) {
                    state.last_batch_size = admitted.len() as u32;
                }
            }
            admissions.insert(compartment.clone(), admitted);
        }
    }

    // Runtime-required completion per node across all Skyhooks, for taint
    // removal decisions.
    let runtime_required: Vec<&Skyhook> = snapshot
        .all_skyhooks
        .iter()
        .filter(|s| s.spec.runtime_required)
        .collect();

    for eval in &mut evals {
        let node = eval.node;
        let node_name = node.name_any();

        match &eval.gate {
            Gate::Disabled => {
                // Either this Skyhook is disabled or it does not target the
                // node; recorded state stays as-is.
                let status = node_state::read_status(node, &skyhook_name).unwrap_or_default();
                node_statuses.push(status);
                node_status_map.insert(node_name.clone(), status);
                new_node_state.insert(node_name, eval.state.clone());
                continue;
            }
            Gate::Paused { .. } => {
                node_statuses.push(Status::Paused);
                node_status_map.insert(node_name.clone(), Status::Paused);
                new_node_state.insert(node_name, eval.state.clone());
                continue;
            }
            Gate::Waiting { .. } => {
                let status = derive_node_status(
                    &skyhook.spec,
                    &eval.state,
                    &eval.updates,
                    false,
                    true,
                );
                annotate_if_changed(
                    &mut plan.mutations,
                    node,
                    status_key(&skyhook_name),
                    Some(status.as_str().to_string()),
                );
                node_statuses.push(status);
                node_status_map.insert(node_name.clone(), status);
                new_node_state.insert(node_name, eval.state.clone());
                plan.work_pending = true;
                continue;
            }
            Gate::Proceed => {}
        }

        let admitted = admissions
            .get(&eval.compartment)
            .is_some_and(|nodes| nodes.contains(&node_name));

        let may_work = match eval.class {
            NodeClass::InFlight => true,
            NodeClass::Pending => admitted,
            NodeClass::Complete | NodeClass::Failed => false,
        };

        let (state, config_versions, pending_updates, blocked) = if may_work {
            let runner_pods: Vec<&Pod> = snapshot
                .pods
                .iter()
                .filter(|p| {
                    planner::runner_skyhook(p) == Some(skyhook_name.as_str())
                        && planner::runner_node(p) == Some(node_name.as_str())
                })
                .collect();
            let pods_on_node: Vec<&Pod> = snapshot
                .pods
                .iter()
                .filter(|p| {
                    p.spec.as_ref().and_then(|s| s.node_name.as_deref())
                        == Some(node_name.as_str())
                })
                .collect();

            let ctx = NodeContext {
                snapshot,
                graph: &graph,
                node,
                node_name: node_name.clone(),
                skyhook_name: skyhook_name.clone(),
                runner_pods,
                pods_on_node,
            };
            let outcome = advance_node(
                &ctx,
                eval.state.clone(),
                eval.config_versions.clone(),
                eval.pending_updates.clone(),
            );
            plan.mutations.extend(outcome.mutations);
            if outcome.dispatched {
                plan.work_pending = true;
            }

            // Fresh admission gets the sticky marker.
            if eval.class == NodeClass::Pending && admitted {
                annotate_if_changed(
                    &mut plan.mutations,
                    node,
                    node_priority_key(&skyhook_name),
                    Some(snapshot.now.to_rfc3339()),
                );
            }

            (
                outcome.state,
                outcome.config_versions,
                outcome.config_updates,
                outcome.blocked,
            )
        } else {
            (
                eval.state.clone(),
                eval.config_versions.clone(),
                eval.pending_updates.clone(),
                false,
            )
        };

        // Recompute updates and status against the advanced state.
        let updates = merged_updates(&skyhook.spec, &config_versions, &pending_updates);
        let node_status = derive_node_status(&skyhook.spec, &state, &updates, blocked, false);

        if node_status == Status::Complete {
            complete_count += 1;
            // Release everything the window held.
            if node_state::has_cordon_marker(node, &skyhook_name) {
                plan.mutations.push(Mutation::Uncordon {
                    node: node_name.clone(),
                });
                annotate_if_changed(
                    &mut plan.mutations,
                    node,
                    cordon_key(&skyhook_name),
                    None,
                );
            }
            annotate_if_changed(&mut plan.mutations, node, boot_id_key(&skyhook_name), None);
            annotate_if_changed(
                &mut plan.mutations,
                node,
                node_priority_key(&skyhook_name),
                None,
            );

            // Runtime-required taint comes off once every runtime-required
            // Skyhook targeting this node is done there.
            if skyhook.spec.runtime_required {
                let completions: Vec<bool> = runtime_required
                    .iter()
                    .filter(|s| selects_node(s, &node_state::node_labels(node)))
                    .map(|s| {
                        if s.name_any() == skyhook_name {
                            true
                        } else {
                            node_state::read_status(node, &s.name_any())
                                == Some(Status::Complete)
                        }
                    })
                    .collect();
                if crate::taints::should_remove_taint(node, snapshot.runtime_taint, &completions)
                {
                    if let Some(taints) =
                        crate::taints::taints_without(node, snapshot.runtime_taint)
                    {
                        plan.mutations.push(Mutation::SetNodeTaints {
                            node: node_name.clone(),
                            taints,
                        });
                    }
                }
            }
        } else if node_status == Status::InProgress {
            in_progress_count += 1;
            plan.work_pending = true;
        }

        // Persist the advanced per-node records.
        annotate_if_changed(
            &mut plan.mutations,
            node,
            node_state_key(&skyhook_name),
            if state.is_empty() {
                None
            } else {
                Some(node_state::encode_node_state(&state))
            },
        );
        annotate_if_changed(
            &mut plan.mutations,
            node,
            config_versions_key(&skyhook_name),
            if config_versions.is_empty() {
                None
            } else {
                Some(node_state::encode_config_versions(&config_versions))
            },
        );
        annotate_if_changed(
            &mut plan.mutations,
            node,
            config_updates_key(&skyhook_name),
            if pending_updates.is_empty() {
                None
            } else {
                Some(node_state::encode_config_updates(&pending_updates))
            },
        );
        annotate_if_changed(
            &mut plan.mutations,
            node,
            status_key(&skyhook_name),
            Some(node_status.as_str().to_string()),
        );
        if let Some(generation) = generation {
            annotate_if_changed(
                &mut plan.mutations,
                node,
                version_key(&skyhook_name),
                Some(generation.to_string()),
            );
        }

        node_statuses.push(node_status);
        node_status_map.insert(node_name.clone(), node_status);
        new_node_state.insert(node_name, state);
    }

    /* ── Status assembly ── */

    let overall = aggregate_status(&node_statuses, paused, disabled);

    let previous_status = skyhook.status.as_ref().and_then(|s| s.status);
    let previous_packages = skyhook
        .status
        .as_ref()
        .map(|s| s.package_list.clone())
        .unwrap_or_default();
    let packages_now = package_list(&skyhook.spec);

    // Batch state resets when the rollout completes or the package set
    // changes, unless opted out.
    if let Some(policy_spec) = policy_spec {
        let reset_enabled = effective_reset_on_completion(
            skyhook.spec.deployment_policy_options.as_ref(),
            policy_spec,
        );
        let completed_now =
            overall == Status::Complete && previous_status != Some(Status::Complete);
        let packages_changed =
            !previous_packages.is_empty() && previous_packages != packages_now;
        if reset_enabled && (completed_now || packages_changed) {
            for (compartment, state) in batch_state.iter_mut() {
                let strategy = effective_strategy(policy_spec, compartment);
                policy::reset_batch(state, strategy);
            }
        }
    }

    plan.status = SkyhookStatus {
        observed_generation: generation,
        status: Some(overall),
        node_state: new_node_state,
        node_status: node_status_map,
        nodes_in_progress: Some(in_progress_count),
        complete_nodes: Some(complete_nodes_label(
            complete_count,
            node_statuses.len() as u32,
        )),
        package_list: packages_now,
        batch_state,
    };

    plan
}

/* ============================= CLEANUP ============================= */

/// Finalizer plan: release cordon, strip every owned key, delete runner
/// pods. The runtime-required taint stays unless no other runtime-required
/// Skyhook still targets the node.
pub fn build_cleanup_plan(snapshot: &Snapshot<'_>) -> Vec<Mutation> {
    let skyhook = snapshot.skyhook;
    let skyhook_name = skyhook.name_any();
    let mut mutations = Vec::new();

    for node in snapshot.nodes {
        let node_name = node.name_any();

        if node_state::has_cordon_marker(node, &skyhook_name) {
            mutations.push(Mutation::Uncordon {
                node: node_name.clone(),
            });
        }

        for key in node_state::owned_keys(node, &skyhook_name) {
            let is_label = node
                .metadata
                .labels
                .as_ref()
                .is_some_and(|l| l.contains_key(&key));
            if is_label {
                mutations.push(Mutation::LabelNode {
                    node: node_name.clone(),
                    key,
                    value: None,
                });
            } else {
                mutations.push(Mutation::AnnotateNode {
                    node: node_name.clone(),
                    key,
                    value: None,
                });
            }
        }
    }

    for pod in snapshot.pods {
        if planner::runner_skyhook(pod) == Some(skyhook_name.as_str()) {
            mutations.push(Mutation::DeletePod {
                namespace: pod.namespace().unwrap_or_default(),
                name: pod.name_any(),
            });
        }
    }

    mutations
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Budget, Interrupt, SkyhookSpec};
    use crate::taints::DEFAULT_RUNTIME_REQUIRED_TAINT;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStatus, NodeStatus, NodeSystemInfo,
        PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn runtime_taint() -> RuntimeTaint {
        RuntimeTaint::parse(DEFAULT_RUNTIME_REQUIRED_TAINT).unwrap()
    }

    fn package(version: &str) -> Package {
        Package {
            version: version.to_string(),
            image: "ghcr.io/acme/img".to_string(),
            ..Default::default()
        }
    }

    fn skyhook(name: &str, priority: u32, packages: &[(&str, Package)]) -> Skyhook {
        let mut s = Skyhook::new(
            name,
            SkyhookSpec {
                priority,
                packages: packages
                    .iter()
                    .map(|(n, p)| (n.to_string(), p.clone()))
                    .collect(),
                interruption_budget: Some(Budget {
                    percent: Some(100),
                    count: None,
                }),
                ..Default::default()
            },
        );
        s.metadata.generation = Some(1);
        s
    }

    fn node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                node_info: Some(NodeSystemInfo {
                    boot_id: "boot-1".to_string(),
                    ..Default::default()
                }),
                conditions: Some(vec![k8s_openapi::api::core::v1::NodeCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn node_with_annotations(name: &str, pairs: &[(String, String)]) -> Node {
        let mut n = node(name);
        n.metadata.annotations = Some(pairs.iter().cloned().collect());
        n
    }

    fn succeeded_runner(skyhook: &str, package: &str, version: &str, stage: Stage, node: &str) -> Pod {
        let mut pod = Pod {
            metadata: ObjectMeta {
                name: Some(planner::pod_name(skyhook, package, stage, node)),
                namespace: Some("skyhook".to_string()),
                labels: Some(planner::runner_labels(skyhook, package, version, stage, node)),
                ..Default::default()
            },
            ..Default::default()
        };
        pod.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            init_container_statuses: Some(vec![ContainerStatus {
                name: stage.as_str().to_string(),
                state: Some(ContainerState {
                    terminated: Some(ContainerStateTerminated {
                        exit_code: 0,
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });
        pod
    }

    fn snapshot<'a>(
        skyhook: &'a Skyhook,
        all: &'a [Skyhook],
        nodes: &'a [Node],
        pods: &'a [Pod],
        taint: &'a RuntimeTaint,
    ) -> Snapshot<'a> {
        Snapshot {
            skyhook,
            all_skyhooks: all,
            policy: None,
            nodes,
            pods,
            agent_image: "ghcr.io/acme/agent:1.0.0",
            runner_namespace: "skyhook",
            runtime_taint: taint,
            now: DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    fn created_pods(plan: &Plan) -> Vec<&Pod> {
        plan.mutations
            .iter()
            .filter_map(|m| match m {
                Mutation::CreatePod { pod } => Some(pod.as_ref()),
                _ => None,
            })
            .collect()
    }

    // ── Fresh dispatch ──

    #[test]
    fn test_fresh_node_dispatches_apply_for_roots() {
        let sky = skyhook("alpha", 1, &[("tuning", package("1.0.0"))]);
        let all = vec![sky.clone()];
        let nodes = vec![node("node-1")];
        let taint = runtime_taint();
        let snap = snapshot(&sky, &all, &nodes, &[], &taint);

        let plan = build_plan(&snap);
        let pods = created_pods(&plan);
        assert_eq!(pods.len(), 1);
        assert_eq!(planner::runner_stage(pods[0]), Some("apply"));
        assert!(plan.work_pending);
        assert_eq!(plan.status.status, Some(Status::InProgress));
    }

    #[test]
    fn test_dependency_gating_holds_back_dependent() {
        let mut dependent = package("1.0.0");
        dependent
            .depends_on
            .insert("base".to_string(), "1.0.0".to_string());
        let sky = skyhook(
            "alpha",
            1,
            &[("base", package("1.0.0")), ("child", dependent)],
        );
        let all = vec![sky.clone()];
        let nodes = vec![node("node-1")];
        let taint = runtime_taint();
        let snap = snapshot(&sky, &all, &nodes, &[], &taint);

        let plan = build_plan(&snap);
        let pods = created_pods(&plan);
        // Only the root dispatches; child waits on base.
        assert_eq!(pods.len(), 1);
        assert!(pods[0].metadata.name.as_ref().unwrap().contains("base"));
    }

    #[test]
    fn test_same_pass_advancement_after_config_completion() {
        // base completed config; the dependent dispatches in the same pass.
        let mut dependent = package("1.0.0");
        dependent
            .depends_on
            .insert("base".to_string(), "1.0.0".to_string());
        let sky = skyhook(
            "alpha",
            1,
            &[("base", package("1.0.0")), ("child", dependent)],
        );
        let all = vec![sky.clone()];

        let mut state = NodeState::new();
        state.insert("base|1.0.0".to_string(), {
            let mut r = start_stage("base", &package("1.0.0"), Stage::Config);
            r.state = PackageState::Complete;
            r
        });
        let nodes = vec![node_with_annotations(
            "node-1",
            &[(
                node_state_key("alpha"),
                node_state::encode_node_state(&state),
            )],
        )];
        let taint = runtime_taint();
        let snap = snapshot(&sky, &all, &nodes, &[], &taint);

        let plan = build_plan(&snap);
        let pods = created_pods(&plan);
        assert_eq!(pods.len(), 1);
        assert!(pods[0].metadata.name.as_ref().unwrap().contains("child"));
    }

    #[test]
    fn test_dependent_waits_out_dependency_interrupt_window() {
        // base finished config but still owes a reboot; child must not
        // start while the interrupt window (cordon/wait/drain) is open.
        let mut base = package("1.0.0");
        base.interrupt = Some(Interrupt {
            kind: InterruptKind::Reboot,
            services: vec![],
        });
        let mut child = package("1.0.0");
        child
            .depends_on
            .insert("base".to_string(), "1.0.0".to_string());
        let sky = skyhook("alpha", 1, &[("base", base), ("child", child)]);
        let all = vec![sky.clone()];

        let mut state = NodeState::new();
        state.insert("base|1.0.0".to_string(), {
            let mut r = start_stage("base", &package("1.0.0"), Stage::Config);
            r.state = PackageState::Complete;
            r
        });
        let nodes = vec![node_with_annotations(
            "node-1",
            &[(
                node_state_key("alpha"),
                node_state::encode_node_state(&state),
            )],
        )];
        let taint = runtime_taint();
        let snap = snapshot(&sky, &all, &nodes, &[], &taint);

        let plan = build_plan(&snap);
        // The window opens (cordon) and the child stays unscheduled.
        assert!(plan.mutations.iter().any(|m| matches!(m, Mutation::Cordon { .. })));
        assert!(created_pods(&plan).is_empty());
        assert!(!plan.status.node_state["node-1"].contains_key("child|1.0.0"));
    }

    // ── Outcome folding ──

    #[test]
    fn test_succeeded_apply_advances_to_config() {
        let sky = skyhook("alpha", 1, &[("tuning", package("1.0.0"))]);
        let all = vec![sky.clone()];

        let mut state = NodeState::new();
        state.insert(
            "tuning|1.0.0".to_string(),
            start_stage("tuning", &package("1.0.0"), Stage::Apply),
        );
        let nodes = vec![node_with_annotations(
            "node-1",
            &[(
                node_state_key("alpha"),
                node_state::encode_node_state(&state),
            )],
        )];
        let pods = vec![succeeded_runner("alpha", "tuning", "1.0.0", Stage::Apply, "node-1")];
        let taint = runtime_taint();
        let snap = snapshot(&sky, &all, &nodes, &pods, &taint);

        let plan = build_plan(&snap);
        let created = created_pods(&plan);
        assert_eq!(created.len(), 1);
        assert_eq!(planner::runner_stage(created[0]), Some("config"));

        // Old apply pod gets deleted.
        assert!(plan.mutations.iter().any(|m| matches!(
            m,
            Mutation::DeletePod { name, .. } if name.contains("apply")
        )));
    }

    #[test]
    fn test_config_completion_finishes_node_without_interrupt() {
        let sky = skyhook("alpha", 1, &[("tuning", package("1.0.0"))]);
        let all = vec![sky.clone()];

        let mut state = NodeState::new();
        state.insert(
            "tuning|1.0.0".to_string(),
            start_stage("tuning", &package("1.0.0"), Stage::Config),
        );
        let nodes = vec![node_with_annotations(
            "node-1",
            &[(
                node_state_key("alpha"),
                node_state::encode_node_state(&state),
            )],
        )];
        let pods = vec![succeeded_runner("alpha", "tuning", "1.0.0", Stage::Config, "node-1")];
        let taint = runtime_taint();
        let snap = snapshot(&sky, &all, &nodes, &pods, &taint);

        let plan = build_plan(&snap);
        assert_eq!(plan.status.status, Some(Status::Complete));
        assert_eq!(plan.status.complete_nodes.as_deref(), Some("1/1"));
        assert!(created_pods(&plan).is_empty());
    }

    // ── Priority gating across skyhooks ──

    #[test]
    fn test_lower_priority_waits_per_node() {
        let a = skyhook("a", 1, &[("base", package("1.0.0"))]);
        let b = skyhook("b", 2, &[("extra", package("1.0.0"))]);
        let all = vec![a.clone(), b.clone()];

        // Node has no record of a completing.
        let nodes = vec![node("node-1")];
        let taint = runtime_taint();
        let snap = snapshot(&b, &all, &nodes, &[], &taint);

        let plan = build_plan(&snap);
        assert!(created_pods(&plan).is_empty());
        assert_eq!(plan.status.node_status["node-1"], Status::Waiting);
    }

    #[test]
    fn test_per_node_priority_independence() {
        let a = skyhook("a", 1, &[("base", package("1.0.0"))]);
        let b = skyhook("b", 2, &[("extra", package("1.0.0"))]);
        let all = vec![a.clone(), b.clone()];

        // node-1 finished a; node-2 has a erroring.
        let n1 = node_with_annotations(
            "node-1",
            &[(status_key("a"), "complete".to_string())],
        );
        let n2 = node_with_annotations(
            "node-2",
            &[(status_key("a"), "erroring".to_string())],
        );
        let nodes = vec![n1, n2];
        let taint = runtime_taint();
        let snap = snapshot(&b, &all, &nodes, &[], &taint);

        let plan = build_plan(&snap);
        let created = created_pods(&plan);
        // b starts on node-1 only.
        assert_eq!(created.len(), 1);
        assert_eq!(planner::runner_node(created[0]), Some("node-1"));
        assert_eq!(plan.status.node_status["node-2"], Status::Waiting);
    }

    // ── Budget ceiling ──

    #[test]
    fn test_interruption_budget_caps_admissions() {
        let mut sky = skyhook("alpha", 1, &[("tuning", package("1.0.0"))]);
        sky.spec.interruption_budget = Some(Budget {
            percent: None,
            count: Some(1),
        });
        let all = vec![sky.clone()];
        let nodes = vec![node("node-1"), node("node-2"), node("node-3")];
        let taint = runtime_taint();
        let snap = snapshot(&sky, &all, &nodes, &[], &taint);

        let plan = build_plan(&snap);
        assert_eq!(created_pods(&plan).len(), 1);
    }

    // ── Reboot interrupt ──

    fn reboot_package() -> Package {
        let mut p = package("1.0.0");
        p.interrupt = Some(Interrupt {
            kind: InterruptKind::Reboot,
            services: vec![],
        });
        p
    }

    #[test]
    fn test_config_complete_with_interrupt_cordons_first() {
        let sky = skyhook("alpha", 1, &[("kernel", reboot_package())]);
        let all = vec![sky.clone()];

        let mut state = NodeState::new();
        state.insert("kernel|1.0.0".to_string(), {
            let mut r = start_stage("kernel", &reboot_package(), Stage::Config);
            r.state = PackageState::Complete;
            r
        });
        let nodes = vec![node_with_annotations(
            "node-1",
            &[(
                node_state_key("alpha"),
                node_state::encode_node_state(&state),
            )],
        )];
        let taint = runtime_taint();
        let snap = snapshot(&sky, &all, &nodes, &[], &taint);

        let plan = build_plan(&snap);
        assert!(plan.mutations.iter().any(|m| matches!(m, Mutation::Cordon { .. })));
        assert!(created_pods(&plan).is_empty());
    }

    #[test]
    fn test_cordoned_quiet_node_dispatches_interrupt_with_boot_capture() {
        let sky = skyhook("alpha", 1, &[("kernel", reboot_package())]);
        let all = vec![sky.clone()];

        let mut state = NodeState::new();
        state.insert("kernel|1.0.0".to_string(), {
            let mut r = start_stage("kernel", &reboot_package(), Stage::Config);
            r.state = PackageState::Complete;
            r
        });
        let mut n = node_with_annotations(
            "node-1",
            &[
                (
                    node_state_key("alpha"),
                    node_state::encode_node_state(&state),
                ),
                (cordon_key("alpha"), "true".to_string()),
            ],
        );
        n.spec = Some(k8s_openapi::api::core::v1::NodeSpec {
            unschedulable: Some(true),
            ..Default::default()
        });
        let nodes = vec![n];
        let taint = runtime_taint();
        let snap = snapshot(&sky, &all, &nodes, &[], &taint);

        let plan = build_plan(&snap);
        // Boot id captured before dispatch.
        assert!(plan.mutations.iter().any(|m| matches!(
            m,
            Mutation::AnnotateNode { key, value: Some(v), .. }
                if key == &boot_id_key("alpha") && v == "boot-1"
        )));
        let created = created_pods(&plan);
        assert_eq!(created.len(), 1);
        assert_eq!(planner::runner_stage(created[0]), Some("interrupt"));
    }

    #[test]
    fn test_reboot_interrupt_completes_only_after_boot_id_change() {
        let sky = skyhook("alpha", 1, &[("kernel", reboot_package())]);
        let all = vec![sky.clone()];

        let mut state = NodeState::new();
        state.insert(
            "kernel|1.0.0".to_string(),
            start_stage("kernel", &reboot_package(), Stage::Interrupt),
        );

        // Interrupt pod succeeded but boot id is unchanged.
        let mut n = node_with_annotations(
            "node-1",
            &[
                (
                    node_state_key("alpha"),
                    node_state::encode_node_state(&state),
                ),
                (cordon_key("alpha"), "true".to_string()),
                (boot_id_key("alpha"), "boot-1".to_string()),
            ],
        );
        n.spec = Some(k8s_openapi::api::core::v1::NodeSpec {
            unschedulable: Some(true),
            ..Default::default()
        });
        let pods = vec![succeeded_runner(
            "alpha",
            "kernel",
            "1.0.0",
            Stage::Interrupt,
            "node-1",
        )];
        let nodes = vec![n];
        let taint = runtime_taint();
        let snap = snapshot(&sky, &all, &nodes, &pods, &taint);

        let plan = build_plan(&snap);
        let record = &plan.status.node_state["node-1"]["kernel|1.0.0"];
        assert_eq!(record.stage, Stage::Interrupt);
        assert_ne!(record.state, PackageState::Complete);
    }

    #[test]
    fn test_reboot_interrupt_advances_after_boot_id_change() {
        let sky = skyhook("alpha", 1, &[("kernel", reboot_package())]);
        let all = vec![sky.clone()];

        let mut state = NodeState::new();
        state.insert(
            "kernel|1.0.0".to_string(),
            start_stage("kernel", &reboot_package(), Stage::Interrupt),
        );

        let mut n = node_with_annotations(
            "node-1",
            &[
                (
                    node_state_key("alpha"),
                    node_state::encode_node_state(&state),
                ),
                (cordon_key("alpha"), "true".to_string()),
                (boot_id_key("alpha"), "boot-0".to_string()),
            ],
        );
        n.spec = Some(k8s_openapi::api::core::v1::NodeSpec {
            unschedulable: Some(true),
            ..Default::default()
        });
        let pods = vec![succeeded_runner(
            "alpha",
            "kernel",
            "1.0.0",
            Stage::Interrupt,
            "node-1",
        )];
        let nodes = vec![n];
        let taint = runtime_taint();
        let snap = snapshot(&sky, &all, &nodes, &pods, &taint);

        let plan = build_plan(&snap);
        // Interrupt completes and post-interrupt dispatches (node is Ready
        // with a rotated boot id).
        let created = created_pods(&plan);
        assert_eq!(created.len(), 1);
        assert_eq!(planner::runner_stage(created[0]), Some("post-interrupt"));
    }

    // ── Erroring and retries ──

    fn failed_runner(skyhook: &str, package: &str, version: &str, stage: Stage, node: &str) -> Pod {
        let mut pod = succeeded_runner(skyhook, package, version, stage, node);
        pod.status = Some(PodStatus {
            phase: Some("Failed".to_string()),
            init_container_statuses: Some(vec![ContainerStatus {
                name: stage.as_str().to_string(),
                restart_count: 0,
                state: Some(ContainerState {
                    terminated: Some(ContainerStateTerminated {
                        exit_code: 1,
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });
        pod
    }

    #[test]
    fn test_failed_pod_redispatches_within_budget() {
        let sky = skyhook("alpha", 1, &[("tuning", package("1.0.0"))]);
        let all = vec![sky.clone()];

        let mut state = NodeState::new();
        state.insert(
            "tuning|1.0.0".to_string(),
            start_stage("tuning", &package("1.0.0"), Stage::Apply),
        );
        let nodes = vec![node_with_annotations(
            "node-1",
            &[(
                node_state_key("alpha"),
                node_state::encode_node_state(&state),
            )],
        )];
        let pods = vec![failed_runner("alpha", "tuning", "1.0.0", Stage::Apply, "node-1")];
        let taint = runtime_taint();
        let snap = snapshot(&sky, &all, &nodes, &pods, &taint);

        let plan = build_plan(&snap);
        let record = &plan.status.node_state["node-1"]["tuning|1.0.0"];
        assert_eq!(record.state, PackageState::InProgress);
        assert_eq!(record.restarts, 1);
        assert_eq!(created_pods(&plan).len(), 1);
    }

    #[test]
    fn test_exhausted_retries_stay_erroring() {
        let sky = skyhook("alpha", 1, &[("tuning", package("1.0.0"))]);
        let all = vec![sky.clone()];

        let mut record = start_stage("tuning", &package("1.0.0"), Stage::Apply);
        record.restarts = RETRY_BUDGET;
        let mut state = NodeState::new();
        state.insert("tuning|1.0.0".to_string(), record);

        let nodes = vec![node_with_annotations(
            "node-1",
            &[(
                node_state_key("alpha"),
                node_state::encode_node_state(&state),
            )],
        )];
        let pods = vec![failed_runner("alpha", "tuning", "1.0.0", Stage::Apply, "node-1")];
        let taint = runtime_taint();
        let snap = snapshot(&sky, &all, &nodes, &pods, &taint);

        let plan = build_plan(&snap);
        let record = &plan.status.node_state["node-1"]["tuning|1.0.0"];
        assert_eq!(record.state, PackageState::Erroring);
        assert!(created_pods(&plan).is_empty());
        assert_eq!(plan.status.status, Some(Status::Erroring));
    }

    // ── Serial flag ──

    #[test]
    fn test_serial_dispatches_one_pod_at_a_time() {
        let mut sky = skyhook(
            "alpha",
            1,
            &[("aa", package("1.0.0")), ("bb", package("1.0.0"))],
        );
        sky.spec.serial = true;
        let all = vec![sky.clone()];
        let nodes = vec![node("node-1")];
        let taint = runtime_taint();
        let snap = snapshot(&sky, &all, &nodes, &[], &taint);

        let plan = build_plan(&snap);
        // Both packages are roots, but serial holds the second back.
        assert_eq!(created_pods(&plan).len(), 1);
        assert!(plan.work_pending);
    }

    #[test]
    fn test_serial_holds_while_pod_running() {
        let mut sky = skyhook(
            "alpha",
            1,
            &[("aa", package("1.0.0")), ("bb", package("1.0.0"))],
        );
        sky.spec.serial = true;
        let all = vec![sky.clone()];

        let mut state = NodeState::new();
        state.insert(
            "aa|1.0.0".to_string(),
            start_stage("aa", &package("1.0.0"), Stage::Apply),
        );
        let nodes = vec![node_with_annotations(
            "node-1",
            &[(
                node_state_key("alpha"),
                node_state::encode_node_state(&state),
            )],
        )];
        // aa's pod is still executing (no terminal init status).
        let mut running = succeeded_runner("alpha", "aa", "1.0.0", Stage::Apply, "node-1");
        running.status = Some(PodStatus {
            phase: Some("Pending".to_string()),
            ..Default::default()
        });
        let pods = vec![running];
        let taint = runtime_taint();
        let snap = snapshot(&sky, &all, &nodes, &pods, &taint);

        let plan = build_plan(&snap);
        assert!(created_pods(&plan).is_empty());
        assert!(plan.work_pending);
    }

    // ── Pause / disable ──

    #[test]
    fn test_paused_skyhook_does_nothing() {
        let mut sky = skyhook("alpha", 1, &[("tuning", package("1.0.0"))]);
        sky.metadata.annotations = Some(
            [(node_state::PAUSE_ANNOTATION.to_string(), "true".to_string())]
                .into_iter()
                .collect(),
        );
        let all = vec![sky.clone()];
        let nodes = vec![node("node-1")];
        let taint = runtime_taint();
        let snap = snapshot(&sky, &all, &nodes, &[], &taint);

        let plan = build_plan(&snap);
        assert!(created_pods(&plan).is_empty());
        assert_eq!(plan.status.status, Some(Status::Paused));
    }

    #[test]
    fn test_disabled_skyhook_reports_disabled() {
        let mut sky = skyhook("alpha", 1, &[("tuning", package("1.0.0"))]);
        sky.metadata.annotations = Some(
            [(node_state::DISABLE_ANNOTATION.to_string(), "true".to_string())]
                .into_iter()
                .collect(),
        );
        let all = vec![sky.clone()];
        let nodes = vec![node("node-1")];
        let taint = runtime_taint();
        let snap = snapshot(&sky, &all, &nodes, &[], &taint);

        let plan = build_plan(&snap);
        assert!(created_pods(&plan).is_empty());
        assert_eq!(plan.status.status, Some(Status::Disabled));
    }

    // ── Idempotence ──

    #[test]
    fn test_plan_is_idempotent_when_nothing_changed() {
        // A fully complete node: planning twice produces no mutations.
        let sky = skyhook("alpha", 1, &[("tuning", package("1.0.0"))]);
        let all = vec![sky.clone()];

        let mut record = start_stage("tuning", &package("1.0.0"), Stage::Config);
        record.state = PackageState::Complete;
        let mut state = NodeState::new();
        state.insert("tuning|1.0.0".to_string(), record);

        let nodes = vec![node_with_annotations(
            "node-1",
            &[
                (
                    node_state_key("alpha"),
                    node_state::encode_node_state(&state),
                ),
                (status_key("alpha"), "complete".to_string()),
                (version_key("alpha"), "1".to_string()),
            ],
        )];
        let taint = runtime_taint();
        let snap = snapshot(&sky, &all, &nodes, &[], &taint);

        let plan = build_plan(&snap);
        assert!(
            plan.mutations.is_empty(),
            "expected no mutations, got {:?}",
            plan.mutations
        );
        assert!(!plan.work_pending);
    }

    // ── Ignored nodes ──

    #[test]
    fn test_ignored_node_excluded() {
        let sky = skyhook("alpha", 1, &[("tuning", package("1.0.0"))]);
        let all = vec![sky.clone()];
        let mut n = node("node-1");
        n.metadata.labels = Some(
            [(node_state::NODE_IGNORE_LABEL.to_string(), "true".to_string())]
                .into_iter()
                .collect(),
        );
        let nodes = vec![n];
        let taint = runtime_taint();
        let snap = snapshot(&sky, &all, &nodes, &[], &taint);

        let plan = build_plan(&snap);
        assert!(created_pods(&plan).is_empty());
        assert_eq!(plan.status.complete_nodes.as_deref(), Some("0/0"));
    }

    // ── Cleanup ──

    #[test]
    fn test_cleanup_plan_strips_everything() {
        let sky = skyhook("alpha", 1, &[("tuning", package("1.0.0"))]);
        let nodes = vec![node_with_annotations(
            "node-1",
            &[
                (node_state_key("alpha"), "{}".to_string()),
                (cordon_key("alpha"), "true".to_string()),
                (status_key("alpha"), "in_progress".to_string()),
            ],
        )];
        let pods = vec![succeeded_runner("alpha", "tuning", "1.0.0", Stage::Apply, "node-1")];
        let all = vec![sky.clone()];
        let taint = runtime_taint();
        let snap = snapshot(&sky, &all, &nodes, &pods, &taint);

        let mutations = build_cleanup_plan(&snap);
        assert!(mutations.iter().any(|m| matches!(m, Mutation::Uncordon { .. })));
        assert!(mutations.iter().any(|m| matches!(
            m,
            Mutation::AnnotateNode { key, value: None, .. } if key == &node_state_key("alpha")
        )));
        assert!(mutations.iter().any(|m| matches!(m, Mutation::DeletePod { .. })));
    }

    // ── Runtime-required taint ──

    #[test]
    fn test_taint_removed_when_all_runtime_required_complete() {
        let mut sky = skyhook("alpha", 1, &[("tuning", package("1.0.0"))]);
        sky.spec.runtime_required = true;
        let mut other = skyhook("beta", 2, &[("extra", package("1.0.0"))]);
        other.spec.runtime_required = true;

        let mut record = start_stage("tuning", &package("1.0.0"), Stage::Config);
        record.state = PackageState::Complete;
        let mut state = NodeState::new();
        state.insert("tuning|1.0.0".to_string(), record);

        let mut n = node_with_annotations(
            "node-1",
            &[
                (
                    node_state_key("alpha"),
                    node_state::encode_node_state(&state),
                ),
                (status_key("beta"), "complete".to_string()),
            ],
        );
        n.spec = Some(k8s_openapi::api::core::v1::NodeSpec {
            taints: Some(vec![Taint {
                key: "skyhook.nvidia.com".to_string(),
                value: Some("uninitialized".to_string()),
                effect: "NoSchedule".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });

        let all = vec![sky.clone(), other];
        let nodes = vec![n];
        let taint = runtime_taint();
        let snap = snapshot(&sky, &all, &nodes, &[], &taint);

        let plan = build_plan(&snap);
        assert!(plan.mutations.iter().any(|m| matches!(
            m,
            Mutation::SetNodeTaints { taints, .. } if taints.is_empty()
        )));
    }

    #[test]
    fn test_taint_stays_while_other_runtime_required_incomplete() {
        let mut sky = skyhook("alpha", 1, &[("tuning", package("1.0.0"))]);
        sky.spec.runtime_required = true;
        let mut other = skyhook("beta", 2, &[("extra", package("1.0.0"))]);
        other.spec.runtime_required = true;

        let mut record = start_stage("tuning", &package("1.0.0"), Stage::Config);
        record.state = PackageState::Complete;
        let mut state = NodeState::new();
        state.insert("tuning|1.0.0".to_string(), record);

        let mut n = node_with_annotations(
            "node-1",
            &[
                (
                    node_state_key("alpha"),
                    node_state::encode_node_state(&state),
                ),
                (status_key("beta"), "in_progress".to_string()),
            ],
        );
        n.spec = Some(k8s_openapi::api::core::v1::NodeSpec {
            taints: Some(vec![Taint {
                key: "skyhook.nvidia.com".to_string(),
                value: Some("uninitialized".to_string()),
                effect: "NoSchedule".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });

        let all = vec![sky.clone(), other];
        let nodes = vec![n];
        let taint = runtime_taint();
        let snap = snapshot(&sky, &all, &nodes, &[], &taint);

        let plan = build_plan(&snap);
        assert!(
            !plan
                .mutations
                .iter()
                .any(|m| matches!(m, Mutation::SetNodeTaints { .. }))
        );
    }
}
