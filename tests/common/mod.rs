#![allow(dead_code)]

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateTerminated, ContainerStatus, Node, NodeCondition, NodeSpec,
    NodeStatus, NodeSystemInfo, Pod, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use skyhook_operator::crd::{Budget, Package, Skyhook, SkyhookSpec};
use skyhook_operator::engine::{Mutation, Plan, Snapshot};
use skyhook_operator::planner;
use skyhook_operator::taints::{DEFAULT_RUNTIME_REQUIRED_TAINT, RuntimeTaint};

pub fn make_package(version: &str) -> Package {
    Package {
        version: version.to_string(),
        image: "ghcr.io/acme/pkg".to_string(),
        ..Default::default()
    }
}

pub fn make_skyhook(name: &str, priority: u32, packages: &[(&str, Package)]) -> Skyhook {
    let mut skyhook = Skyhook::new(
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
    skyhook.metadata.generation = Some(1);
    skyhook
}

pub fn make_node(name: &str, labels: &[(&str, &str)]) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            annotations: Some(BTreeMap::new()),
            ..Default::default()
        },
        spec: Some(NodeSpec::default()),
        status: Some(NodeStatus {
            node_info: Some(NodeSystemInfo {
                boot_id: "boot-1".to_string(),
                ..Default::default()
            }),
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn runtime_taint() -> RuntimeTaint {
    RuntimeTaint::parse(DEFAULT_RUNTIME_REQUIRED_TAINT).unwrap()
}

pub fn fixed_now() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

/// In-memory cluster: nodes + pods, with a plan applier mirroring what the
/// operator does against the API server. Lets tests run the pure engine
/// through multiple passes.
pub struct FakeCluster {
    pub nodes: Vec<Node>,
    pub pods: Vec<Pod>,
}

impl FakeCluster {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            nodes,
            pods: Vec::new(),
        }
    }

    fn node_mut(&mut self, name: &str) -> &mut Node {
        self.nodes
            .iter_mut()
            .find(|n| n.metadata.name.as_deref() == Some(name))
            .expect("node exists")
    }

    pub fn node(&self, name: &str) -> &Node {
        self.nodes
            .iter()
            .find(|n| n.metadata.name.as_deref() == Some(name))
            .expect("node exists")
    }

    pub fn apply(&mut self, plan: &Plan) {
        let mutations = plan.mutations.clone();
        self.apply_mutations(&mutations);
    }

    pub fn apply_mutations(&mut self, mutations: &[Mutation]) {
        for mutation in mutations {
            match mutation {
                Mutation::AnnotateNode { node, key, value } => {
                    let annotations = self
                        .node_mut(node)
                        .metadata
                        .annotations
                        .get_or_insert_with(BTreeMap::new);
                    match value {
                        Some(v) => {
                            annotations.insert(key.clone(), v.clone());
                        }
                        None => {
                            annotations.remove(key);
                        }
                    }
                }
                Mutation::LabelNode { node, key, value } => {
                    let labels = self
                        .node_mut(node)
                        .metadata
                        .labels
                        .get_or_insert_with(BTreeMap::new);
                    match value {
                        Some(v) => {
                            labels.insert(key.clone(), v.clone());
                        }
                        None => {
                            labels.remove(key);
                        }
                    }
                }
                Mutation::Cordon { node } => {
                    self.node_mut(node)
                        .spec
                        .get_or_insert_with(NodeSpec::default)
                        .unschedulable = Some(true);
                }
                Mutation::Uncordon { node } => {
                    self.node_mut(node)
                        .spec
                        .get_or_insert_with(NodeSpec::default)
                        .unschedulable = Some(false);
                }
                Mutation::SetNodeTaints { node, taints } => {
                    self.node_mut(node)
                        .spec
                        .get_or_insert_with(NodeSpec::default)
                        .taints = Some(taints.clone());
                }
                Mutation::CreatePod { pod } => {
                    self.pods.push(pod.as_ref().clone());
                }
                Mutation::DeletePod { name, .. } | Mutation::EvictPod { name, .. } => {
                    self.pods
                        .retain(|p| p.metadata.name.as_deref() != Some(name));
                }
            }
        }
    }

    /// Flip every runner pod of a skyhook to a terminal outcome.
    pub fn finish_runner_pods(&mut self, skyhook: &str, exit_code: i32) {
        for pod in &mut self.pods {
            if planner::runner_skyhook(pod) != Some(skyhook) {
                continue;
            }
            let stage = planner::runner_stage(pod).unwrap_or("apply").to_string();
            pod.status = Some(PodStatus {
                phase: Some(if exit_code == 0 { "Running" } else { "Failed" }.to_string()),
                init_container_statuses: Some(vec![ContainerStatus {
                    name: stage,
                    restart_count: 0,
                    state: Some(ContainerState {
                        terminated: Some(ContainerStateTerminated {
                            exit_code,
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            });
        }
    }

    pub fn set_boot_id(&mut self, node: &str, boot_id: &str) {
        self.node_mut(node)
            .status
            .get_or_insert_with(NodeStatus::default)
            .node_info
            .get_or_insert_with(NodeSystemInfo::default)
            .boot_id = boot_id.to_string();
    }

    pub fn runner_pods(&self, skyhook: &str) -> Vec<&Pod> {
        self.pods
            .iter()
            .filter(|p| planner::runner_skyhook(p) == Some(skyhook))
            .collect()
    }
}

/// One engine pass over the fake cluster, folding the resulting status back
/// into the Skyhook the way the status subresource patch would.
pub fn run_pass(
    skyhook: &mut Skyhook,
    all_others: &[Skyhook],
    policy: Option<&skyhook_operator::crd::DeploymentPolicy>,
    cluster: &mut FakeCluster,
) -> Plan {
    let taint = runtime_taint();
    let mut all: Vec<Skyhook> = vec![skyhook.clone()];
    all.extend(all_others.iter().cloned());

    let plan = {
        let snapshot = Snapshot {
            skyhook,
            all_skyhooks: &all,
            policy,
            nodes: &cluster.nodes,
            pods: &cluster.pods,
            agent_image: "ghcr.io/acme/agent:1.0.0",
            runner_namespace: "skyhook",
            runtime_taint: &taint,
            now: fixed_now(),
        };
        skyhook_operator::engine::build_plan(&snapshot)
    };

    cluster.apply(&plan);
    skyhook.status = Some(plan.status.clone());
    plan
}
