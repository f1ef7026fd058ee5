use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use regex::Regex;
use serde::Serialize;
use tracing::info;

use crate::cli::{NodeAction, OutputFormat};
use skyhook_operator::crd::Skyhook;
use skyhook_operator::node_state::{
    self, NODE_IGNORE_LABEL, owned_keys, read_node_state, read_status,
};
use skyhook_operator::scheduler::selects_node;

pub async fn run(action: NodeAction) -> Result<()> {
    match action {
        NodeAction::List { skyhook, output } => list(&skyhook, output).await,
        NodeAction::Status {
            patterns,
            skyhook,
            output,
        } => status(&patterns, skyhook.as_deref(), output).await,
        NodeAction::Reset {
            patterns,
            skyhook,
            confirm,
            dry_run,
        } => reset(&patterns, &skyhook, confirm, dry_run).await,
        NodeAction::Ignore { patterns, dry_run } => set_ignore(&patterns, true, dry_run).await,
        NodeAction::Unignore { patterns, dry_run } => set_ignore(&patterns, false, dry_run).await,
    }
}

/* ============================= PATTERNS ============================= */

pub fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).with_context(|| format!("invalid pattern '{p}'")))
        .collect()
}

/// Union match; no patterns matches everything.
pub fn matches_any(patterns: &[Regex], name: &str) -> bool {
    patterns.is_empty() || patterns.iter().any(|p| p.is_match(name))
}

/* ============================= OUTPUT ============================= */

#[derive(Serialize)]
struct NodeRow {
    node: String,
    status: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    packages: Vec<PackageRow>,
}

#[derive(Serialize)]
struct PackageRow {
    package: String,
    version: String,
    stage: String,
    state: String,
    restarts: i32,
}

fn print_rows(rows: &[NodeRow], output: OutputFormat) -> Result<()> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(rows)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(rows)?),
        OutputFormat::Table => {
            println!("{:<40} {:<12}", "NODE", "STATUS");
            for row in rows {
                println!("{:<40} {:<12}", row.node, row.status);
            }
        }
        OutputFormat::Wide => {
            println!(
                "{:<40} {:<12} {:<24} {:<14} {:<12} {:<8}",
                "NODE", "STATUS", "PACKAGE", "STAGE", "STATE", "RESTARTS"
            );
            for row in rows {
                if row.packages.is_empty() {
                    println!("{:<40} {:<12}", row.node, row.status);
                }
                for pkg in &row.packages {
                    println!(
                        "{:<40} {:<12} {:<24} {:<14} {:<12} {:<8}",
                        row.node,
                        row.status,
                        format!("{}|{}", pkg.package, pkg.version),
                        pkg.stage,
                        pkg.state,
                        pkg.restarts
                    );
                }
            }
        }
    }
    Ok(())
}

fn node_row(node: &Node, skyhook: &str) -> NodeRow {
    let status = read_status(node, skyhook)
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let packages = read_node_state(node, skyhook)
        .unwrap_or_default()
        .into_values()
        .map(|r| PackageRow {
            package: r.name,
            version: r.version,
            stage: r.stage.to_string(),
            state: r.state.to_string(),
            restarts: r.restarts,
        })
        .collect();
    NodeRow {
        node: node.name_any(),
        status,
        packages,
    }
}

/* ============================= COMMANDS ============================= */

async fn targeted_nodes(client: &Client, skyhook: &str) -> Result<Vec<Node>> {
    let skyhooks: Api<Skyhook> = Api::all(client.clone());
    let skyhook_obj = skyhooks
        .get(skyhook)
        .await
        .with_context(|| format!("Skyhook '{skyhook}' not found"))?;

    let nodes: Api<Node> = Api::all(client.clone());
    let list = nodes.list(&ListParams::default()).await?;
    Ok(list
        .items
        .into_iter()
        .filter(|n| !node_state::is_ignored(n))
        .filter(|n| selects_node(&skyhook_obj, &node_state::node_labels(n)))
        .collect())
}

async fn list(skyhook: &str, output: OutputFormat) -> Result<()> {
    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;
    let mut rows: Vec<NodeRow> = targeted_nodes(&client, skyhook)
        .await?
        .iter()
        .map(|n| NodeRow {
            node: n.name_any(),
            status: read_status(n, skyhook)
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            packages: Vec::new(),
        })
        .collect();
    rows.sort_by(|a, b| a.node.cmp(&b.node));
    print_rows(&rows, output)
}

async fn status(patterns: &[String], skyhook: Option<&str>, output: OutputFormat) -> Result<()> {
    let regexes = compile_patterns(patterns)?;
    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;

    let skyhook_names: Vec<String> = match skyhook {
        Some(name) => vec![name.to_string()],
        None => {
            let skyhooks: Api<Skyhook> = Api::all(client.clone());
            skyhooks
                .list(&ListParams::default())
                .await?
                .items
                .iter()
                .map(|s| s.name_any())
                .collect()
        }
    };

    let nodes: Api<Node> = Api::all(client.clone());
    let node_list = nodes.list(&ListParams::default()).await?;

    for skyhook in &skyhook_names {
        println!("Skyhook: {skyhook}");
        let mut rows: Vec<NodeRow> = node_list
            .items
            .iter()
            .filter(|n| matches_any(&regexes, &n.name_any()))
            .map(|n| node_row(n, skyhook))
            .collect();
        rows.sort_by(|a, b| a.node.cmp(&b.node));
        // Status output always carries the package detail.
        let output = match output {
            OutputFormat::Table => OutputFormat::Wide,
            other => other,
        };
        print_rows(&rows, output)?;
        println!();
    }
    Ok(())
}

async fn reset(patterns: &[String], skyhook: &str, confirm: bool, dry_run: bool) -> Result<()> {
    let regexes = compile_patterns(patterns)?;
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
        .collect();

    if matched.is_empty() {
        println!("No nodes match.");
        return Ok(());
    }

    if dry_run {
        for node in &matched {
            let keys = owned_keys(node, skyhook);
            println!(
                "[dry-run] Would reset {} ({} key(s))",
                node.name_any(),
                keys.len()
            );
        }
        return Ok(());
    }
    if !confirm {
        anyhow::bail!(
            "Refusing to reset {} node(s) without --confirm (or use --dry-run)",
            matched.len()
        );
    }

    for node in &matched {
        let name = node.name_any();
        let keys = owned_keys(node, skyhook);
        if keys.is_empty() {
            continue;
        }

        let mut annotations = serde_json::Map::new();
        let mut labels = serde_json::Map::new();
        for key in &keys {
            let is_label = node
                .metadata
                .labels
                .as_ref()
                .is_some_and(|l| l.contains_key(key));
            if is_label {
                labels.insert(key.clone(), serde_json::Value::Null);
            } else {
                annotations.insert(key.clone(), serde_json::Value::Null);
            }
        }
        let patch = serde_json::json!({
            "metadata": { "annotations": annotations, "labels": labels }
        });
        nodes
            .patch(
                &name,
                &PatchParams::apply("skyhook-operator-cli"),
                &Patch::Merge(&patch),
            )
            .await
            .with_context(|| format!("Failed to reset node {name}"))?;
        info!(node = %name, skyhook = %skyhook, keys = keys.len(), "node_reset");
        println!("Reset {name} ({} key(s))", keys.len());
    }
    Ok(())
}

async fn set_ignore(patterns: &[String], ignore: bool, dry_run: bool) -> Result<()> {
    let regexes = compile_patterns(patterns)?;
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
        .collect();

    let verb = if ignore { "ignore" } else { "unignore" };
    if matched.is_empty() {
        println!("No nodes match.");
        return Ok(());
    }

    for node in &matched {
        let name = node.name_any();
        if dry_run {
            println!("[dry-run] Would {verb} {name}");
            continue;
        }
        let value = if ignore {
            serde_json::Value::String("true".to_string())
        } else {
            serde_json::Value::Null
        };
        let patch = serde_json::json!({
            "metadata": { "labels": { NODE_IGNORE_LABEL: value } }
        });
        nodes
            .patch(
                &name,
                &PatchParams::apply("skyhook-operator-cli"),
                &Patch::Merge(&patch),
            )
            .await
            .with_context(|| format!("Failed to {verb} node {name}"))?;
        info!(node = %name, action = %verb, "node_ignore_updated");
        println!("{verb}d {name}");
    }
    Ok(())
}

/* ============================= TESTS ============================= */
