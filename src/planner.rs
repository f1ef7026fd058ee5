use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, EnvVar, Pod, PodSpec, ResourceRequirements, Toleration,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::crd::{Interrupt, Package, PackageToleration, Stage};
use crate::lifecycle::{RunnerOutcome, config_digest};
use crate::taints::RuntimeTaint;

/* ============================= LABELS ============================= */

pub const LABEL_SKYHOOK: &str = "skyhook.nvidia.com/skyhook";
pub const LABEL_PACKAGE: &str = "skyhook.nvidia.com/package";
pub const LABEL_VERSION: &str = "skyhook.nvidia.com/version";
pub const LABEL_STAGE: &str = "skyhook.nvidia.com/stage";
pub const LABEL_NODE: &str = "skyhook.nvidia.com/node";

pub const DEFAULT_RUNNER_NAMESPACE: &str = "skyhook";

/* ============================= NAMING ============================= */

/// Deterministic runner pod name. The node portion is hashed so long node
/// names cannot push the pod name over the DNS limit.
pub fn pod_name(skyhook: &str, package: &str, stage: Stage, node: &str) -> String {
    let node_hash = &config_digest(node)[..8];
    format!("skyhook-{skyhook}-{package}-{stage}-{node_hash}")
}

pub fn runner_labels(
    skyhook: &str,
    package: &str,
    version: &str,
    stage: Stage,
    node: &str,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_SKYHOOK.to_string(), skyhook.to_string()),
        (LABEL_PACKAGE.to_string(), package.to_string()),
        (LABEL_VERSION.to_string(), version.to_string()),
        (LABEL_STAGE.to_string(), stage.as_str().to_string()),
        (LABEL_NODE.to_string(), node.to_string()),
    ])
}

fn pod_label<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
}

/// Whether a pod is the runner for a (skyhook, package, node) triple,
/// any stage.
pub fn is_runner_for(pod: &Pod, skyhook: &str, package: &str, node: &str) -> bool {
    pod_label(pod, LABEL_SKYHOOK) == Some(skyhook)
        && pod_label(pod, LABEL_PACKAGE) == Some(package)
        && pod_label(pod, LABEL_NODE) == Some(node)
}

pub fn runner_stage(pod: &Pod) -> Option<&str> {
    pod_label(pod, LABEL_STAGE)
}

pub fn runner_skyhook(pod: &Pod) -> Option<&str> {
    pod_label(pod, LABEL_SKYHOOK)
}

pub fn runner_node(pod: &Pod) -> Option<&str> {
    pod_label(pod, LABEL_NODE)
}

/* ============================= POD BUILDING ============================= */

/// Everything the planner needs to materialize one runner pod.
pub struct RunnerPodParams<'a> {
    pub skyhook_name: &'a str,
    pub package_name: &'a str,
    pub package: &'a Package,
    pub stage: Stage,
    pub node_name: &'a str,
    pub namespace: &'a str,
    /// Operator-wide agent image; `agentImageOverride` wins when set.
    pub agent_image: &'a str,
    pub additional_tolerations: &'a [PackageToleration],
    pub runtime_taint: &'a RuntimeTaint,
    /// Set for the `interrupt` stage; encoded into the runner args.
    pub interrupt: Option<&'a Interrupt>,
}

fn to_k8s_toleration(t: &PackageToleration) -> Toleration {
    Toleration {
        key: t.key.clone(),
        operator: t.operator.clone(),
        value: t.value.clone(),
        effect: t.effect.clone(),
        toleration_seconds: t.toleration_seconds,
    }
}

// Runner pods must survive the conditions an interrupt creates.
fn cluster_managed_tolerations() -> Vec<Toleration> {
    ["node.kubernetes.io/not-ready", "node.kubernetes.io/unreachable"]
        .iter()
        .map(|key| Toleration {
            key: Some(key.to_string()),
            operator: Some("Exists".to_string()),
            effect: Some("NoExecute".to_string()),
            ..Default::default()
        })
        .collect()
}

fn to_k8s_resources(resources: &crate::crd::PackageResources) -> ResourceRequirements {
    let requests = BTreeMap::from([
        ("cpu".to_string(), Quantity(resources.cpu_request.clone())),
        (
            "memory".to_string(),
            Quantity(resources.memory_request.clone()),
        ),
    ]);
    let limits = BTreeMap::from([
        ("cpu".to_string(), Quantity(resources.cpu_limit.clone())),
        ("memory".to_string(), Quantity(resources.memory_limit.clone())),
    ]);
    ResourceRequirements {
        requests: Some(requests),
        limits: Some(limits),
        ..Default::default()
    }
}

fn stage_args(params: &RunnerPodParams<'_>) -> Vec<String> {
    match (params.stage, params.interrupt) {
        (Stage::Interrupt, Some(interrupt)) => vec![
            "interrupt".to_string(),
            params.package_name.to_string(),
            params.package.version.clone(),
            interrupt.to_args(),
        ],
        _ => vec![
            params.stage.as_str().to_string(),
            params.package_name.to_string(),
            params.package.version.clone(),
        ],
    }
}

/// Materialize the runner pod for one (package, stage, node) dispatch.
///
/// Init containers run the stage work and its check; the main container is
/// a long-lived pause so the pod's phase reflects init outcomes. Uninstall
/// pods never inherit per-package resource overrides.
pub fn build_runner_pod(params: &RunnerPodParams<'_>) -> Pod {
    let agent_image = params
        .package
        .agent_image_override
        .as_deref()
        .unwrap_or(params.agent_image);

    let env: Option<Vec<EnvVar>> = if params.package.env.is_empty() {
        None
    } else {
        Some(
            params
                .package
                .env
                .iter()
                .map(|e| EnvVar {
                    name: e.name.clone(),
                    value: Some(e.value.clone()),
                    ..Default::default()
                })
                .collect(),
        )
    };

    let resources = match params.stage {
        Stage::Uninstall => None,
        _ => params.package.resources.as_ref().map(to_k8s_resources),
    };

    let mut init_containers = vec![Container {
        name: params.stage.as_str().to_string(),
        image: Some(agent_image.to_string()),
        args: Some(stage_args(params)),
        env: env.clone(),
        resources: resources.clone(),
        ..Default::default()
    }];

    if params.stage.has_check() {
        init_containers.push(Container {
            name: format!("{}-check", params.stage),
            image: Some(agent_image.to_string()),
            args: Some(vec![
                params.stage.as_str().to_string(),
                "check".to_string(),
                params.package_name.to_string(),
                params.package.version.clone(),
            ]),
            env,
            resources: resources.clone(),
            ..Default::default()
        });
    }

    let mut tolerations = cluster_managed_tolerations();
    tolerations.extend(params.additional_tolerations.iter().map(to_k8s_toleration));
    tolerations.push(to_k8s_toleration(&params.runtime_taint.toleration()));

    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name(
                params.skyhook_name,
                params.package_name,
                params.stage,
                params.node_name,
            )),
            namespace: Some(params.namespace.to_string()),
            labels: Some(runner_labels(
                params.skyhook_name,
                params.package_name,
                &params.package.version,
                params.stage,
                params.node_name,
            )),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(params.node_name.to_string()),
            restart_policy: Some("Never".to_string()),
            init_containers: Some(init_containers),
            containers: vec![Container {
                name: "pause".to_string(),
                image: Some(agent_image.to_string()),
                args: Some(vec!["pause".to_string()]),
                ..Default::default()
            }],
            tolerations: Some(tolerations),
            termination_grace_period_seconds: params.package.graceful_shutdown_seconds,
            ..Default::default()
        }),
        status: None,
    }
}

/* ============================= OUTCOME READING ============================= */

fn max_restarts(pod: &Pod) -> i32 {
    let Some(status) = &pod.status else { return 0 };
    let init = status.init_container_statuses.iter().flatten();
    let main = status.container_statuses.iter().flatten();
    init.chain(main).map(|cs| cs.restart_count).max().unwrap_or(0)
}

/// Whether the pod cannot schedule because of taints (counts as `blocked`
/// in node status).
pub fn is_unschedulable(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions.iter().any(|c| {
                c.type_ == "PodScheduled"
                    && c.status == "False"
                    && c.reason.as_deref() == Some("Unschedulable")
            })
        })
}

/// Fold pod phase + container statuses into a runner outcome.
///
/// Init containers gate the pause container, so a failed stage or check
/// surfaces as pod phase `Failed` (restartPolicy Never) or as a failed
/// init container status while the pod is still `Pending`.
pub fn runner_outcome(pod: &Pod) -> RunnerOutcome {
    let restarts = max_restarts(pod);
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("");

    match phase {
        "Failed" => RunnerOutcome::Failed { restarts },
        // Init containers done and pause is up: the work succeeded.
        "Running" | "Succeeded" => {
            if init_containers_succeeded(pod) {
                RunnerOutcome::Succeeded
            } else {
                RunnerOutcome::Running { restarts }
            }
        }
        _ => {
            if init_container_failed(pod) {
                RunnerOutcome::Failed { restarts }
            } else {
                RunnerOutcome::Running { restarts }
            }
        }
    }
}

fn init_containers_succeeded(pod: &Pod) -> bool {
    let Some(statuses) = pod
        .status
        .as_ref()
        .and_then(|s| s.init_container_statuses.as_ref())
    else {
        // No init statuses reported: trust the phase.
        return true;
    };
    statuses.iter().all(|cs| {
        cs.state
            .as_ref()
            .and_then(|s| s.terminated.as_ref())
            .is_some_and(|t| t.exit_code == 0)
    })
}

fn init_container_failed(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.init_container_statuses.as_ref())
        .is_some_and(|statuses| {
            statuses.iter().any(|cs| {
                cs.state
                    .as_ref()
                    .and_then(|s| s.terminated.as_ref())
                    .is_some_and(|t| t.exit_code != 0)
            })
        })
}

/* ============================= TESTS ============================= */
