use anyhow::{Context, Result};
use futures::{AsyncBufReadExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, ListParams, LogParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde::Serialize;
use tracing::info;

use crate::cli::{OutputFormat, PackageAction};
use crate::commands::node::{compile_patterns, matches_any};
use skyhook_operator::crd::{PackageState, Stage, unique_key};
use skyhook_operator::node_state::{encode_node_state, node_state_key, read_node_state};
use skyhook_operator::planner::{
    DEFAULT_RUNNER_NAMESPACE, LABEL_NODE, LABEL_PACKAGE, LABEL_SKYHOOK, LABEL_STAGE,
};

pub async fn run(action: PackageAction) -> Result<()> {
    match action {
        PackageAction::Status {
            package,
            skyhook,
            nodes,
            output,
        } => status(&package, &skyhook, &nodes, output).await,
        PackageAction::Rerun {
            package,
            skyhook,
            nodes,
            stage,
            confirm,
            dry_run,
        } => rerun(&package, &skyhook, &nodes, stage.as_deref(), confirm, dry_run).await,
        PackageAction::Logs {
            package,
            skyhook,
            node,
            stage,
            follow,
            tail,
        } => logs(&package, &skyhook, node.as_deref(), stage.as_deref(), follow, tail).await,
    }
}

fn parse_stage(raw: &str) -> Result<Stage> {
    Stage::all()
        .iter()
        .copied()
        .find(|s| s.as_str() == raw)
        .with_context(|| {
            format!(
                "invalid stage '{raw}' (expected one of: uninstall, upgrade, apply, config, \
                 interrupt, post-interrupt)"
            )
        })
}

/* ============================= STATUS ============================= */

#[derive(Serialize)]
struct PackageStatusRow {
    node: String,
    version: String,
    stage: String,
    state: String,
    restarts: i32,
}

async fn status(
    package: &str,
    skyhook: &str,
    node_patterns: &[String],
    output: OutputFormat,
) -> Result<()> {
    let regexes = compile_patterns(node_patterns)?;
    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;

    let nodes: Api<Node> = Api::all(client.clone());
    let mut rows: Vec<PackageStatusRow> = Vec::new();
    for node in nodes.list(&ListParams::default()).await?.items {
        if !matches_any(&regexes, &node.name_any()) {
            continue;
        }
        let state = read_node_state(&node, skyhook).unwrap_or_default();
        for record in state.values().filter(|r| r.name == package) {
            rows.push(PackageStatusRow {
                node: node.name_any(),
                version: record.version.clone(),
                stage: record.stage.to_string(),
                state: record.state.to_string(),
                restarts: record.restarts,
            });
        }
    }
    rows.sort_by(|a, b| a.node.cmp(&b.node));

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(&rows)?),
        OutputFormat::Table | OutputFormat::Wide => {
            println!(
                "{:<40} {:<12} {:<14} {:<12} {:<8}",
                "NODE", "VERSION", "STAGE", "STATE", "RESTARTS"
            );
            for row in &rows {
                println!(
                    "{:<40} {:<12} {:<14} {:<12} {:<8}",
                    row.node, row.version, row.stage, row.state, row.restarts
                );
            }
        }
    }
    Ok(())
}

/* ============================= RERUN ============================= */

/// Rewind a package on matched nodes so the engine re-dispatches. Without
/// --stage the whole record is dropped (full re-apply); with --stage the
/// record rewinds to that stage.
async fn rerun(
    package: &str,
    skyhook: &str,
    node_patterns: &[String],
    stage: Option<&str>,
    confirm: bool,
    dry_run: bool,
) -> Result<()> {
    let regexes = compile_patterns(node_patterns)?;
    let stage = stage.map(parse_stage).transpose()?;

    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;
    let nodes: Api<Node> = Api::all(client.clone());

    let matched: Vec<Node> = nodes
        .list(&ListParams::default())
        .await?
        .items
        .into_iter()
        .filter(|n| matches_any(&regexes, &n.name_any()))
        .filter(|n| {
            read_node_state(n, skyhook)
                .unwrap_or_default()
                .values()
                .any(|r| r.name == package)
        })
        .collect();

    if matched.is_empty() {
        println!("No matched node records package '{package}' for skyhook '{skyhook}'.");
        return Ok(());
    }

    if dry_run {
        for node in &matched {
            println!("[dry-run] Would rerun '{package}' on {}", node.name_any());
        }
        return Ok(());
    }
    if !confirm {
        anyhow::bail!(
            "Refusing to rerun '{package}' on {} node(s) without --confirm (or use --dry-run)",
            matched.len()
        );
    }

    for node in &matched {
        let name = node.name_any();
        let mut state = read_node_state(node, skyhook).unwrap_or_default();

        let keys: Vec<String> = state
            .values()
            .filter(|r| r.name == package)
            .map(|r| unique_key(&r.name, &r.version))
            .collect();
        for key in keys {
            match stage {
                None => {
                    state.remove(&key);
                }
                Some(stage) => {
                    if let Some(record) = state.get_mut(&key) {
                        record.stage = stage;
                        record.state = PackageState::Unknown;
                        record.restarts = 0;
                    }
                }
            }
        }

        let patch = serde_json::json!({
            "metadata": {
                "annotations": { node_state_key(skyhook): encode_node_state(&state) }
            }
        });
        nodes
            .patch(
                &name,
                &PatchParams::apply("skyhook-operator-cli"),
                &Patch::Merge(&patch),
            )
            .await
            .with_context(|| format!("Failed to rewind node {name}"))?;
        info!(node = %name, package = %package, skyhook = %skyhook, "package_rerun");
        println!("Rewound '{package}' on {name}");
    }
    Ok(())
}

/* ============================= LOGS ============================= */

async fn logs(
    package: &str,
    skyhook: &str,
    node: Option<&str>,
    stage: Option<&str>,
    follow: bool,
    tail: Option<i64>,
) -> Result<()> {
    let stage_filter = stage.map(parse_stage).transpose()?;

    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;
    let pods: Api<Pod> = Api::namespaced(client, DEFAULT_RUNNER_NAMESPACE);

    let mut selector = format!("{LABEL_SKYHOOK}={skyhook},{LABEL_PACKAGE}={package}");
    if let Some(node) = node {
        selector.push_str(&format!(",{LABEL_NODE}={node}"));
    }
    if let Some(stage) = stage_filter {
        selector.push_str(&format!(",{LABEL_STAGE}={stage}"));
    }

    let list = pods
        .list(&ListParams::default().labels(&selector))
        .await
        .context("Failed to list runner pods")?;

    if list.items.is_empty() {
        println!("No runner pods found for '{package}' ({selector}).");
        return Ok(());
    }
    if follow && list.items.len() > 1 {
        anyhow::bail!(
            "--follow needs a single pod; narrow with --node/--stage ({} matched)",
            list.items.len()
        );
    }

    for pod in &list.items {
        let name = pod.name_any();
        // Stage containers are init containers; read the stage container.
        let container = skyhook_operator::planner::runner_stage(pod).map(String::from);
        let params = LogParams {
            follow,
            tail_lines: tail,
            container,
            ..Default::default()
        };

        println!("==> {name}");
        if follow {
            let stream = pods.log_stream(&name, &params).await?;
            let mut lines = stream.lines();
            while let Some(line) = lines.try_next().await? {
                println!("{line}");
            }
        } else {
            let text = pods.logs(&name, &params).await?;
            print!("{text}");
        }
    }
    Ok(())
}
